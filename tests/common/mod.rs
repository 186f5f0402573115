//! Shared harness for integration tests: a loopback server bootstrapper and
//! a minimal wire-level client that speaks framing, compression, and
//! encryption just like a real peer.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};

use perun::protocol::auth::Authenticator;
use perun::protocol::codec;
use perun::protocol::compression::CompressionStage;
use perun::protocol::encryption::{CipherDec, CipherEnc};
use perun::protocol::messages::{INTENT_LOGIN, INTENT_STATUS, PROTOCOL_VERSION};
use perun::server::{Server, ServerConfig};

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Binds a server on an ephemeral loopback port and runs it in the
/// background.
pub async fn start_server(
    mut config: ServerConfig,
    authenticator: Option<Arc<dyn Authenticator>>,
) -> (SocketAddr, Arc<perun::server::ServerShared>) {
    config.bind_addr = "127.0.0.1:0".parse().unwrap();
    let server = match authenticator {
        Some(auth) => Server::bind_with(config, auth).await.unwrap(),
        None => Server::bind(config).await.unwrap(),
    };
    let addr = server.local_addr().unwrap();
    let shared = server.shared();
    tokio::spawn(async move {
        let _ = server.run().await;
    });
    (addr, shared)
}

/// A config for offline logins without compression, the simplest happy path.
pub fn offline_config() -> ServerConfig {
    ServerConfig {
        online_mode: false,
        compression_threshold: -1,
        ..ServerConfig::default()
    }
}

/// Wire-level test client. Pipeline stages are installed explicitly so tests
/// control exactly when each kicks in.
pub struct TestClient {
    stream: TcpStream,
    incoming: BytesMut,
    encryptor: Option<CipherEnc>,
    decryptor: Option<CipherDec>,
    compression: Option<CompressionStage>,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        stream.set_nodelay(true).unwrap();
        Self {
            stream,
            incoming: BytesMut::new(),
            encryptor: None,
            decryptor: None,
            compression: None,
        }
    }

    pub fn enable_encryption(&mut self, secret: &[u8]) {
        self.encryptor = Some(CipherEnc::new(secret).unwrap());
        self.decryptor = Some(CipherDec::new(secret).unwrap());
    }

    pub fn set_compression(&mut self, threshold: i32) {
        self.compression = (threshold >= 0).then(|| CompressionStage::new(threshold));
    }

    /// Frames and sends one `opcode + payload` message through whatever
    /// stages are installed.
    pub async fn send_frame(&mut self, opcode: u8, payload: &[u8]) {
        let mut body = BytesMut::new();
        codec::write_var_int(&mut body, i32::from(opcode));
        body.extend_from_slice(payload);
        let envelope = match &self.compression {
            Some(stage) => stage.encode(&body).unwrap(),
            None => body.freeze(),
        };
        let mut frame = BytesMut::new();
        codec::write_var_int(&mut frame, envelope.len() as i32);
        frame.extend_from_slice(&envelope);
        if let Some(cipher) = &mut self.encryptor {
            cipher.encrypt(&mut frame[..]);
        }
        self.stream.write_all(&frame).await.unwrap();
    }

    /// Receives the next frame, returning its opcode and payload.
    pub async fn recv_frame(&mut self) -> (u8, Bytes) {
        loop {
            if let Some((declared, prefix)) = codec::try_peek_var_int(&self.incoming).unwrap() {
                let length = declared as usize;
                if self.incoming.len() >= prefix + length {
                    self.incoming.advance(prefix);
                    let frame = self.incoming.split_to(length).freeze();
                    let mut body = match &self.compression {
                        Some(stage) => stage.decode(frame).unwrap(),
                        None => frame,
                    };
                    let opcode = codec::read_var_int(&mut body).unwrap() as u8;
                    return (opcode, body);
                }
            }
            let mut buf = [0u8; 4096];
            let count = timeout(RECV_TIMEOUT, self.stream.read(&mut buf))
                .await
                .expect("timed out waiting for a frame")
                .unwrap();
            assert!(count > 0, "server closed the connection early");
            let mut chunk = buf[..count].to_vec();
            if let Some(cipher) = &mut self.decryptor {
                cipher.decrypt(&mut chunk);
            }
            self.incoming.extend_from_slice(&chunk);
        }
    }

    /// Asserts the server closes the connection (ignoring any frames still
    /// in flight).
    pub async fn expect_closed(&mut self) {
        loop {
            let mut buf = [0u8; 4096];
            match timeout(RECV_TIMEOUT, self.stream.read(&mut buf))
                .await
                .expect("timed out waiting for the connection to close")
            {
                Ok(0) | Err(_) => return,
                Ok(_) => continue,
            }
        }
    }

    // ---- message helpers ------------------------------------------------

    pub async fn send_handshake(&mut self, protocol_version: i32, address: &str, intent: i32) {
        let mut payload = BytesMut::new();
        codec::write_var_int(&mut payload, protocol_version);
        codec::write_string(&mut payload, address);
        payload.extend_from_slice(&25565u16.to_be_bytes());
        codec::write_var_int(&mut payload, intent);
        self.send_frame(0x00, &payload).await;
    }

    pub async fn handshake_login(&mut self, address: &str) {
        self.send_handshake(PROTOCOL_VERSION, address, INTENT_LOGIN)
            .await;
    }

    pub async fn handshake_status(&mut self) {
        self.send_handshake(PROTOCOL_VERSION, "localhost", INTENT_STATUS)
            .await;
    }

    pub async fn send_login_start(&mut self, username: &str) {
        let mut payload = BytesMut::new();
        codec::write_string(&mut payload, username);
        self.send_frame(0x00, &payload).await;
    }

    pub async fn send_encryption_response(&mut self, shared_secret: &[u8], verify_token: &[u8]) {
        let mut payload = BytesMut::new();
        codec::write_blob(&mut payload, shared_secret);
        codec::write_blob(&mut payload, verify_token);
        self.send_frame(0x01, &payload).await;
    }

    pub async fn send_keep_alive_reply(&mut self, id: i64) {
        let mut payload = BytesMut::new();
        payload.extend_from_slice(&id.to_be_bytes());
        self.send_frame(0x00, &payload).await;
    }

    pub async fn send_custom_payload(&mut self, channel: &str, data: &[u8]) {
        let mut payload = BytesMut::new();
        codec::write_string(&mut payload, channel);
        payload.extend_from_slice(data);
        self.send_frame(0x17, &payload).await;
    }

    /// Sends one mod-handshake sub-message on the handshake channel.
    pub async fn send_mod_message(&mut self, type_byte: u8, body: &[u8]) {
        let mut data = Vec::with_capacity(body.len() + 1);
        data.push(type_byte);
        data.extend_from_slice(body);
        self.send_custom_payload(perun::protocol::messages::MOD_CHANNEL, &data)
            .await;
    }
}

/// Decodes a clientbound string field (used for disconnect reasons, status
/// JSON, and similar single-string payloads).
pub fn read_string(payload: &mut Bytes) -> String {
    codec::read_string(payload, codec::DEFAULT_STRING_CAP).unwrap()
}
