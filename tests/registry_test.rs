//! Integration tests for the registry table
//!
//! Audits the sealed vanilla table as a whole: opcode/kind bijections per
//! phase and direction, dispatch failure modes, and the outbound processor
//! fan-out.

use bytes::{Bytes, BytesMut};

use perun::protocol::codec;
use perun::protocol::error::ProtocolError;
use perun::protocol::messages::{
    self, mod_opcode, ModRegistry, RegistryEntry, ServerKind, ServerMessage, MOD_CHANNEL,
};
use perun::protocol::registry::{MessageRegistry, WireMessage};
use perun::protocol::state::{ProtocolState, ProtocolTable};

#[test]
fn every_phase_maps_opcodes_and_kinds_bijectively() {
    let table = ProtocolTable::<()>::vanilla().unwrap();
    for state in ProtocolState::ALL {
        let phase = table.phase(state);
        for opcode in phase.inbound.opcodes().collect::<Vec<_>>() {
            let kind = phase.inbound.kind_of(opcode).unwrap();
            assert_eq!(phase.inbound.opcode_of(kind), Some(opcode));
        }
        for opcode in phase.outbound.opcodes().collect::<Vec<_>>() {
            let kind = phase.outbound.kind_of(opcode).unwrap();
            assert_eq!(phase.outbound.opcode_of(kind), Some(opcode));
        }
    }
    for opcode in table.mod_inbound.opcodes().collect::<Vec<_>>() {
        let kind = table.mod_inbound.kind_of(opcode).unwrap();
        assert_eq!(table.mod_inbound.opcode_of(kind), Some(opcode));
    }
    for opcode in table.mod_outbound.opcodes().collect::<Vec<_>>() {
        let kind = table.mod_outbound.kind_of(opcode).unwrap();
        assert_eq!(table.mod_outbound.opcode_of(kind), Some(opcode));
    }
}

#[test]
fn duplicate_registrations_are_rejected() {
    let mut registry: MessageRegistry<(), ServerMessage> = MessageRegistry::new("test/out");
    registry
        .register(
            0x00,
            ServerKind::KeepAlive,
            messages::decode_keep_alive,
            messages::encode_keep_alive,
        )
        .unwrap();

    let same_opcode = registry.register(
        0x00,
        ServerKind::Disconnect,
        messages::decode_disconnect,
        messages::encode_disconnect,
    );
    assert!(matches!(
        same_opcode,
        Err(ProtocolError::DuplicateOpcode { opcode: 0x00, .. })
    ));

    let same_kind = registry.register(
        0x01,
        ServerKind::KeepAlive,
        messages::decode_keep_alive,
        messages::encode_keep_alive,
    );
    assert!(matches!(
        same_kind,
        Err(ProtocolError::DuplicateKind { kind: "KeepAlive", .. })
    ));
}

#[test]
fn unknown_opcode_and_trailing_bytes_fail_decode() {
    let table = ProtocolTable::<()>::vanilla().unwrap();
    let login_in = &table.phase(ProtocolState::Login).inbound;

    assert!(matches!(
        login_in.decode(0x7b, Bytes::new()),
        Err(ProtocolError::UnknownOpcode { opcode: 0x7b, .. })
    ));

    // a valid login start payload with junk appended
    let mut payload = BytesMut::new();
    codec::write_string(&mut payload, "Alice");
    payload.extend_from_slice(b"junk");
    assert!(matches!(
        login_in.decode(0x00, payload.freeze()),
        Err(ProtocolError::MalformedFrame(_))
    ));
}

#[test]
fn encoding_a_kind_foreign_to_the_phase_fails() {
    let table = ProtocolTable::<()>::vanilla().unwrap();
    let login_out = &table.phase(ProtocolState::Login).outbound;
    let mut buf = BytesMut::new();
    let err = login_out
        .encode(
            &ServerMessage::StatusResponse {
                json: "{}".to_owned(),
            },
            &mut buf,
        )
        .unwrap_err();
    assert!(matches!(
        err,
        ProtocolError::UnregisteredKind {
            kind: "StatusResponse",
            ..
        }
    ));
}

#[test]
fn registry_sync_fans_out_one_payload_per_registry() {
    let table = ProtocolTable::<()>::vanilla().unwrap();
    let play_out = &table.phase(ProtocolState::Play).outbound;

    let sync = ServerMessage::ModRegistrySync {
        registries: vec![
            ModRegistry {
                name: "blocks".to_owned(),
                entries: vec![RegistryEntry {
                    name: "stone".to_owned(),
                    id: 1,
                }],
            },
            ModRegistry {
                name: "items".to_owned(),
                entries: Vec::new(),
            },
        ],
    };
    let frames = play_out.process(sync).unwrap();
    assert_eq!(frames.len(), 2);

    let mut seen = Vec::new();
    for (index, frame) in frames.iter().enumerate() {
        let ServerMessage::CustomPayload { channel, data } = frame else {
            panic!("expected a custom payload, got {frame:?}");
        };
        assert_eq!(channel, MOD_CHANNEL);
        assert_eq!(data[0], mod_opcode::REGISTRY_DATA);
        let mut body = data.slice(1..);
        let has_more = codec::read_bool(&mut body).unwrap();
        assert_eq!(has_more, index + 1 < frames.len());
        seen.push(codec::read_string(&mut body, 64).unwrap());
    }
    assert_eq!(seen, ["blocks", "items"]);
}

#[test]
fn messages_without_processors_pass_through_untouched() {
    let table = ProtocolTable::<()>::vanilla().unwrap();
    let play_out = &table.phase(ProtocolState::Play).outbound;
    let frames = play_out
        .process(ServerMessage::KeepAlive { id: 42 })
        .unwrap();
    assert_eq!(frames, vec![ServerMessage::KeepAlive { id: 42 }]);
    assert_eq!(frames[0].kind(), ServerKind::KeepAlive);
}
