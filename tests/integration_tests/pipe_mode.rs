use tokio::{io::AsyncWriteExt, net::TcpStream};

use crate::integration_tests::common::{
    base_config, expect_close, read_n, spawn_echo_server, start_relay, wait_until,
};

/// Pipe mode performs no SOCKS5 processing at all: bytes go straight to
/// the next hop, and the session disappears once the client leaves.
#[tokio::test]
async fn test_pipe_mode_smoke() {
    let echo = spawn_echo_server().await;
    let mut cfg = base_config();
    cfg.pipe = true;
    cfg.next_hop = Some(echo.to_string().parse().expect("next-hop parse"));
    let (sl, addr) = start_relay(cfg).await;

    let mut client = TcpStream::connect(addr).await.expect("client connect");
    client.write_all(b"hello").await.expect("client write");
    assert_eq!(read_n(&mut client, 5).await, b"hello");

    wait_until("session to register", || sl.session_count() == 1).await;

    drop(client);
    wait_until("session count to return to 0", || sl.session_count() == 0).await;
    sl.begin_exit();
}

/// In pipe mode a dead next-hop means the client just gets closed.
#[tokio::test]
async fn test_pipe_mode_upstream_refused() {
    let mut cfg = base_config();
    cfg.pipe = true;
    // tcpmux; nothing listens there.
    cfg.next_hop = Some("127.0.0.1:1".parse().expect("next-hop parse"));
    let (sl, addr) = start_relay(cfg).await;

    let mut client = TcpStream::connect(addr).await.expect("client connect");
    expect_close(&mut client).await;
    wait_until("session count to return to 0", || sl.session_count() == 0).await;
    sl.begin_exit();
}
