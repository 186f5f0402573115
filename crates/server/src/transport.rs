//! Connection I/O: framing, pipeline stages, and dispatch
//!
//! Each accepted socket is split into a read task and a write task.
//!
//! The read task owns two buffers: `raw` holds bytes exactly as received and
//! `plain` holds the decrypted stream frames are cut from. Draining `raw`
//! into `plain` runs the inbound cipher once it is installed; bytes that were
//! already drained when the cipher arrives are ciphertext by definition (they
//! followed the frame that carried the shared secret) and are decrypted
//! retroactively. Handlers run inline on the read task, one frame at a time.
//!
//! The write task consumes [`Outgoing`] commands in order. Stage installs are
//! commands like any other, so a cipher or threshold queued after frame N
//! applies exactly from frame N+1.

use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, trace, warn};

use perun_protocol::codec::{self, MAX_FRAME_LEN};
use perun_protocol::compression::CompressionStage;
use perun_protocol::encryption::{self, CipherDec, CipherEnc};
use perun_protocol::error::{ProtocolError, Result};
use perun_protocol::messages::ServerMessage;
use perun_protocol::registry::WireMessage;

use crate::login;
use crate::session::{
    ModHandshakeProgress, Outgoing, Session, SessionEvent, SessionShared, OUTGOING_QUEUE,
};
use crate::ServerShared;

const EVENT_QUEUE: usize = 16;

/// Runs one connection to completion. Spawned per accepted socket.
pub(crate) async fn run_session(stream: TcpStream, server: Arc<ServerShared>) {
    let peer = match stream.peer_addr() {
        Ok(peer) => peer,
        Err(_) => return,
    };
    let id = server.allocate_session_id();
    let shared = Arc::new(SessionShared::new(id, peer));
    server.register_session(Arc::clone(&shared));

    let (outgoing_tx, outgoing_rx) = mpsc::channel(OUTGOING_QUEUE);
    let (events_tx, mut events_rx) = mpsc::channel(EVENT_QUEUE);
    let force_close = Arc::new(Notify::new());

    let (read_half, write_half) = stream.into_split();
    let writer = tokio::spawn(run_writer(
        write_half,
        outgoing_rx,
        Arc::clone(&force_close),
        Arc::clone(&shared),
        Arc::clone(&server),
    ));

    let mut session = Session {
        shared: Arc::clone(&shared),
        server: Arc::clone(&server),
        outgoing: outgoing_tx,
        events: events_tx,
        force_close,
        server_id: encryption::new_server_id(),
        verify_token: None,
        pending_username: None,
        pending_decrypt: None,
        mod_support: false,
        mod_progress: ModHandshakeProgress::default(),
        keepalive_task: None,
    };

    if let Err(error) = read_loop(&mut session, read_half, &mut events_rx).await {
        warn!(session = id, %peer, %error, "session failed");
        session.disconnect(&error.disconnect_reason()).await;
    }

    if let Some(task) = session.keepalive_task.take() {
        task.cancel();
    }
    shared.set_disconnected();
    // wake the writer in case the reader exited on a quiet EOF
    let _ = session.outgoing.send(Outgoing::Close).await;
    let _ = writer.await;
    server.unregister_session(id);
    info!(session = id, %peer, "session ended");
}

/// Inbound half of the pipeline: ciphertext in, frames out.
#[derive(Default)]
struct ReadPipeline {
    raw: BytesMut,
    plain: BytesMut,
    decryptor: Option<CipherDec>,
}

impl ReadPipeline {
    fn raw_mut(&mut self) -> &mut BytesMut {
        &mut self.raw
    }

    /// Moves everything received so far through the cipher into the frame
    /// buffer.
    fn drain(&mut self) {
        if self.raw.is_empty() {
            return;
        }
        let mut chunk = self.raw.split();
        if let Some(cipher) = &mut self.decryptor {
            cipher.decrypt(&mut chunk[..]);
        }
        self.plain.unsplit(chunk);
    }

    /// Installs the inbound cipher. Bytes drained past the frame that carried
    /// the secret are ciphertext already sitting in `plain`; they go through
    /// the fresh cipher first so the stream stays aligned.
    fn install_cipher(&mut self, secret: &[u8]) -> Result<()> {
        let mut cipher = CipherDec::new(secret)?;
        if !self.plain.is_empty() {
            cipher.decrypt(&mut self.plain[..]);
        }
        self.decryptor = Some(cipher);
        Ok(())
    }

    /// Cuts the next complete length-prefixed frame out of the buffer, or
    /// reports that more bytes are needed.
    fn next_frame(&mut self) -> Result<Option<Bytes>> {
        let Some((declared, prefix)) = codec::try_peek_var_int(&self.plain)? else {
            return Ok(None);
        };
        if declared <= 0 || declared as usize > MAX_FRAME_LEN {
            return Err(ProtocolError::MalformedFrame("frame length out of range"));
        }
        let length = declared as usize;
        if self.plain.len() < prefix + length {
            return Ok(None);
        }
        self.plain.advance(prefix);
        Ok(Some(self.plain.split_to(length).freeze()))
    }
}

async fn read_loop(
    session: &mut Session,
    mut socket: OwnedReadHalf,
    events: &mut mpsc::Receiver<SessionEvent>,
) -> Result<()> {
    let mut pipeline = ReadPipeline::default();
    loop {
        // process every complete frame already buffered
        loop {
            if session.shared.is_disconnected() {
                return Ok(());
            }
            let Some(frame) = pipeline.next_frame()? else {
                break;
            };
            let threshold = session.shared.compression_threshold();
            let body = if threshold >= 0 {
                CompressionStage::new(threshold).decode(frame)?
            } else {
                frame
            };
            dispatch(session, body).await?;
            if let Some(secret) = session.pending_decrypt.take() {
                pipeline.install_cipher(&secret)?;
            }
        }
        if session.shared.is_disconnected() {
            return Ok(());
        }

        let force_close = Arc::clone(&session.force_close);
        tokio::select! {
            read = socket.read_buf(pipeline.raw_mut()) => {
                let count = read.map_err(|_| ProtocolError::ConnectionClosed)?;
                if count == 0 {
                    return Ok(());
                }
                pipeline.drain();
            }
            Some(event) = events.recv() => {
                handle_event(session, event).await?;
            }
            _ = force_close.notified() => {
                return Ok(());
            }
        }
    }
}

/// Decodes one frame body through the current phase's inbound registry and
/// runs its handler.
async fn dispatch(session: &mut Session, mut body: Bytes) -> Result<()> {
    let raw_opcode = codec::read_var_int(&mut body)?;
    let opcode = u8::try_from(raw_opcode)
        .map_err(|_| ProtocolError::MalformedFrame("opcode out of range"))?;

    let state = session.state();
    let server = Arc::clone(&session.server);
    let registry = &server.table.phase(state).inbound;
    let message = registry.decode(opcode, body)?;
    let kind = message.kind();
    trace!(session = session.id(), %state, %kind, "inbound frame");

    match registry.handler(kind) {
        Some(handler) => handler.handle(session, message).await,
        None => {
            debug!(session = session.id(), %state, %kind, "no handler, frame discarded");
            Ok(())
        }
    }
}

async fn handle_event(session: &mut Session, event: SessionEvent) -> Result<()> {
    match event {
        SessionEvent::AuthResult { profile } => match profile {
            Ok(profile) => login::complete_login(session, profile).await,
            Err(error) => {
                warn!(session = session.id(), %error, "authentication failed");
                session.disconnect(&error.disconnect_reason()).await;
                Ok(())
            }
        },
    }
}

async fn run_writer(
    mut socket: OwnedWriteHalf,
    mut commands: mpsc::Receiver<Outgoing>,
    force_close: Arc<Notify>,
    shared: Arc<SessionShared>,
    server: Arc<ServerShared>,
) {
    let mut encryptor: Option<CipherEnc> = None;
    let mut compression: Option<CompressionStage> = None;
    loop {
        let command = tokio::select! {
            biased;
            _ = force_close.notified() => break,
            command = commands.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };
        match command {
            Outgoing::Message { message, done } => {
                let written = write_message(
                    &mut socket,
                    &server,
                    &shared,
                    encryptor.as_mut(),
                    compression.as_ref(),
                    message,
                )
                .await;
                match written {
                    Ok(()) => {
                        if let Some(done) = done {
                            let _ = done.send(());
                        }
                    }
                    Err(error) => {
                        warn!(session = shared.id, %error, "write failed, dropping connection");
                        break;
                    }
                }
            }
            Outgoing::EnableEncryption { secret } => match CipherEnc::new(&secret) {
                Ok(cipher) => encryptor = Some(cipher),
                Err(error) => {
                    warn!(session = shared.id, %error, "outbound cipher rejected");
                    break;
                }
            },
            Outgoing::SetCompression { threshold } => {
                compression = (threshold >= 0).then(|| CompressionStage::new(threshold));
            }
            Outgoing::Close => {
                let _ = socket.shutdown().await;
                break;
            }
        }
    }
    shared.set_disconnected();
    // wake the read task out of its socket wait
    force_close.notify_waiters();
}

/// Runs one logical message through processor, codec, compression envelope,
/// length prefix, and cipher, then writes the frames out.
async fn write_message(
    socket: &mut OwnedWriteHalf,
    server: &ServerShared,
    shared: &SessionShared,
    mut encryptor: Option<&mut CipherEnc>,
    compression: Option<&CompressionStage>,
    message: ServerMessage,
) -> Result<()> {
    let registry = &server.table.phase(shared.state()).outbound;
    for wire in registry.process(message)? {
        let mut body = BytesMut::new();
        registry.encode(&wire, &mut body)?;
        let envelope = match compression {
            Some(stage) => stage.encode(&body)?,
            None => body.freeze(),
        };
        if envelope.len() > MAX_FRAME_LEN {
            return Err(ProtocolError::MalformedFrame("outbound frame too large"));
        }
        let mut frame = BytesMut::with_capacity(envelope.len() + 5);
        codec::write_var_int(&mut frame, envelope.len() as i32);
        frame.extend_from_slice(&envelope);
        if let Some(cipher) = encryptor.as_mut() {
            cipher.encrypt(&mut frame[..]);
        }
        socket
            .write_all(&frame)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;
    }
    socket
        .flush()
        .await
        .map_err(|_| ProtocolError::ConnectionClosed)?;
    Ok(())
}
