//! Integration tests for the tick-driven keep-alive probe

mod common;

use std::time::Duration;

use perun::server::ServerConfig;

use common::{read_string, start_server, TestClient};

fn fast_keepalive_config(grace: u64) -> ServerConfig {
    ServerConfig {
        online_mode: false,
        compression_threshold: -1,
        tick_period: Duration::from_millis(5),
        keepalive_interval_ticks: 2,
        keepalive_grace: grace,
        ..ServerConfig::default()
    }
}

async fn login(client: &mut TestClient) {
    client.handshake_login("localhost").await;
    client.send_login_start("Alice").await;
    let (opcode, _) = client.recv_frame().await;
    assert_eq!(opcode, 0x02);
    let (opcode, _) = client.recv_frame().await;
    assert_eq!(opcode, 0x3f);
}

#[tokio::test]
async fn answered_probes_keep_the_session_alive() {
    let (addr, shared) = start_server(fast_keepalive_config(2), None).await;
    let mut client = TestClient::connect(addr).await;
    login(&mut client).await;

    // answer a handful of probes; the session must survive all of them
    for _ in 0..5 {
        let (opcode, payload) = client.recv_frame().await;
        assert_eq!(opcode, 0x00);
        let id = i64::from_be_bytes(payload[..8].try_into().unwrap());
        client.send_keep_alive_reply(id).await;
    }
    assert_eq!(shared.online_count(), 1);
}

#[tokio::test]
async fn silent_session_is_kicked_after_the_grace_runs_out() {
    let (addr, _shared) = start_server(fast_keepalive_config(1), None).await;
    let mut client = TestClient::connect(addr).await;
    login(&mut client).await;

    // swallow probes without answering until the kick arrives
    loop {
        let (opcode, mut payload) = client.recv_frame().await;
        if opcode == 0x40 {
            assert_eq!(read_string(&mut payload), "Timed out");
            break;
        }
        assert_eq!(opcode, 0x00);
    }
    client.expect_closed().await;
}
