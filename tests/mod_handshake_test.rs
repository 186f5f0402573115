//! Integration tests for the mod-handshake sub-protocol
//!
//! The sub-protocol rides inside custom payload frames on its own channel,
//! keyed by a leading type byte. A client that appends the mod marker to its
//! handshake address is routed through it between login and play.

mod common;

use bytes::{Bytes, BytesMut};

use perun::protocol::codec;
use perun::protocol::messages::{
    mod_opcode, mod_phase, ModEntry, ModRegistry, RegistryEntry, MOD_CHANNEL,
    MOD_PROTOCOL_VERSION, REGISTER_CHANNEL,
};
use perun::server::ServerConfig;

use common::{read_string, start_server, TestClient};

fn modded_config() -> ServerConfig {
    ServerConfig {
        online_mode: false,
        compression_threshold: -1,
        mod_dimension: -1,
        server_mods: vec![ModEntry {
            name: "perun-core".to_owned(),
            version: "1.0".to_owned(),
        }],
        registries: vec![
            ModRegistry {
                name: "blocks".to_owned(),
                entries: vec![
                    RegistryEntry {
                        name: "stone".to_owned(),
                        id: 1,
                    },
                    RegistryEntry {
                        name: "dirt".to_owned(),
                        id: 3,
                    },
                ],
            },
            ModRegistry {
                name: "items".to_owned(),
                entries: vec![RegistryEntry {
                    name: "stick".to_owned(),
                    id: 280,
                }],
            },
        ],
        ..ServerConfig::default()
    }
}

/// Receives one frame and unwraps it as a mod-channel sub-message.
async fn recv_mod(client: &mut TestClient) -> (u8, Bytes) {
    let (opcode, mut payload) = client.recv_frame().await;
    assert_eq!(opcode, 0x3f, "expected a custom payload frame");
    assert_eq!(codec::read_string(&mut payload, 20).unwrap(), MOD_CHANNEL);
    let type_byte = payload[0];
    (type_byte, payload.slice(1..))
}

fn encode_client_mod_list(mods: &[(&str, &str)]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    codec::write_var_int(&mut buf, mods.len() as i32);
    for (name, version) in mods {
        codec::write_string(&mut buf, name);
        codec::write_string(&mut buf, version);
    }
    buf.to_vec()
}

/// Logs in with the mod marker and consumes frames up to the server hello.
async fn login_modded(client: &mut TestClient) {
    client.handshake_login("localhost\0PRN\0").await;
    client.send_login_start("Alice").await;

    let (opcode, _) = client.recv_frame().await;
    assert_eq!(opcode, 0x02, "expected login success");

    let (type_byte, mut body) = recv_mod(client).await;
    assert_eq!(type_byte, mod_opcode::SERVER_HELLO);
    assert_eq!(body[0], MOD_PROTOCOL_VERSION);
    assert_eq!(i32::from_be_bytes(body.split_off(1)[..4].try_into().unwrap()), -1);
}

#[tokio::test]
async fn full_mod_handshake_reaches_play() {
    let (addr, shared) = start_server(modded_config(), None).await;
    let mut client = TestClient::connect(addr).await;
    login_modded(&mut client).await;

    client
        .send_mod_message(mod_opcode::CLIENT_HELLO, &[MOD_PROTOCOL_VERSION])
        .await;
    client
        .send_mod_message(
            mod_opcode::MOD_LIST,
            &encode_client_mod_list(&[("perun-core", "1.0")]),
        )
        .await;

    // server mod list
    let (type_byte, mut body) = recv_mod(&mut client).await;
    assert_eq!(type_byte, mod_opcode::MOD_LIST);
    assert_eq!(codec::read_var_int(&mut body).unwrap(), 1);
    assert_eq!(codec::read_string(&mut body, 64).unwrap(), "perun-core");

    // one registry-data batch per registry, more-flag set on all but the last
    let (type_byte, mut body) = recv_mod(&mut client).await;
    assert_eq!(type_byte, mod_opcode::REGISTRY_DATA);
    assert_eq!(codec::read_bool(&mut body).unwrap(), true);
    assert_eq!(codec::read_string(&mut body, 64).unwrap(), "blocks");
    assert_eq!(codec::read_var_int(&mut body).unwrap(), 2);

    let (type_byte, mut body) = recv_mod(&mut client).await;
    assert_eq!(type_byte, mod_opcode::REGISTRY_DATA);
    assert_eq!(codec::read_bool(&mut body).unwrap(), false);
    assert_eq!(codec::read_string(&mut body, 64).unwrap(), "items");
    assert_eq!(codec::read_var_int(&mut body).unwrap(), 1);
    assert_eq!(codec::read_string(&mut body, 64).unwrap(), "stick");
    assert_eq!(codec::read_var_int(&mut body).unwrap(), 280);

    let (type_byte, body) = recv_mod(&mut client).await;
    assert_eq!(type_byte, mod_opcode::ACK);
    assert_eq!(body[0], mod_phase::WAITING_ACK);

    client
        .send_mod_message(mod_opcode::ACK, &[mod_phase::WAITING_ACK])
        .await;

    let (type_byte, body) = recv_mod(&mut client).await;
    assert_eq!(type_byte, mod_opcode::ACK);
    assert_eq!(body[0], mod_phase::COMPLETE);

    // play begins: the channel announcement follows
    let (opcode, mut payload) = client.recv_frame().await;
    assert_eq!(opcode, 0x3f);
    assert_eq!(codec::read_string(&mut payload, 20).unwrap(), REGISTER_CHANNEL);
    assert_eq!(shared.online_count(), 1);
}

#[tokio::test]
async fn out_of_order_sub_message_resets_and_kicks() {
    let (addr, _shared) = start_server(modded_config(), None).await;
    let mut client = TestClient::connect(addr).await;
    login_modded(&mut client).await;

    // acknowledge without ever saying hello
    client
        .send_mod_message(mod_opcode::ACK, &[mod_phase::WAITING_ACK])
        .await;

    let (type_byte, _) = recv_mod(&mut client).await;
    assert_eq!(type_byte, mod_opcode::RESET);

    let (opcode, mut payload) = client.recv_frame().await;
    assert_eq!(opcode, 0x40);
    assert_eq!(read_string(&mut payload), "Mod handshake failed");
    client.expect_closed().await;
}

#[tokio::test]
async fn wrong_sub_protocol_version_resets_and_kicks() {
    let (addr, _shared) = start_server(modded_config(), None).await;
    let mut client = TestClient::connect(addr).await;
    login_modded(&mut client).await;

    client
        .send_mod_message(mod_opcode::CLIENT_HELLO, &[MOD_PROTOCOL_VERSION + 1])
        .await;

    let (type_byte, _) = recv_mod(&mut client).await;
    assert_eq!(type_byte, mod_opcode::RESET);
    client.expect_closed().await;
}

#[tokio::test]
async fn unmarked_client_skips_the_mod_handshake() {
    let (addr, _shared) = start_server(modded_config(), None).await;
    let mut client = TestClient::connect(addr).await;

    client.handshake_login("localhost").await;
    client.send_login_start("Alice").await;

    let (opcode, _) = client.recv_frame().await;
    assert_eq!(opcode, 0x02);
    // straight to the play-phase channel announcement
    let (opcode, mut payload) = client.recv_frame().await;
    assert_eq!(opcode, 0x3f);
    assert_eq!(codec::read_string(&mut payload, 20).unwrap(), REGISTER_CHANNEL);
}
