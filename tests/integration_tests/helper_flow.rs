use std::fs;

use nix::{
    sys::signal::{Signal, kill},
    unistd::Pid,
};
use serial_test::serial;
use tokio::{io::AsyncWriteExt, net::TcpStream};

use crate::integration_tests::common::{
    base_config, expect_close, read_n, spawn_socks5_upstream, start_relay, tmp_path,
    wait_until, write_helper_script,
};
use sockslink::cfg::enums::AuthMethod;

/// Helper grants the connection and routes it to a NONE-method SOCKS5
/// upstream; its stdin must have seen the source address and method.
#[tokio::test]
#[serial]
async fn test_helper_ok_path() {
    let upstream = spawn_socks5_upstream(0x00, false).await;
    let reqlog = tmp_path("helper-ok.log");
    let _ = fs::remove_file(&reqlog);
    let script = write_helper_script(
        "helper-ok.sh",
        &format!(
            "while read line; do\n  echo \"$line\" >> {}\n  echo \"OK 127.0.0.1 {} none\"\ndone",
            reqlog.display(),
            upstream.port()
        ),
    );

    let mut cfg = base_config();
    cfg.helper_command = Some(script);
    cfg.helpers_max = 1;
    let (sl, addr) = start_relay(cfg).await;
    let pool = sl.pool.as_ref().expect("pool configured");
    wait_until("helper to start", || pool.available()).await;

    let mut client = TcpStream::connect(addr).await.expect("client connect");
    client.write_all(&[0x05, 0x01, 0x00]).await.expect("method select");
    assert_eq!(read_n(&mut client, 2).await, vec![0x05, 0x00]);

    client.write_all(b"ping").await.expect("payload write");
    assert_eq!(read_n(&mut client, 4).await, b"ping");

    wait_until("helper request log", || {
        fs::read_to_string(&reqlog)
            .map(|s| s.contains("127.0.0.1 none"))
            .unwrap_or(false)
    })
    .await;
    sl.begin_exit();
}

/// Helper refuses: a USERNAME client gets 01 FF and then the connection is
/// closed.
#[tokio::test]
#[serial]
async fn test_helper_err_path() {
    let script = write_helper_script(
        "helper-err.sh",
        "while read line; do\n  echo \"ERR bad\"\ndone",
    );

    let mut cfg = base_config();
    cfg.methods = vec![AuthMethod::Username];
    cfg.helper_command = Some(script);
    cfg.helpers_max = 1;
    let (sl, addr) = start_relay(cfg).await;
    let pool = sl.pool.as_ref().expect("pool configured");
    wait_until("helper to start", || pool.available()).await;

    let mut client = TcpStream::connect(addr).await.expect("client connect");
    client.write_all(&[0x05, 0x01, 0x02]).await.expect("method select");
    assert_eq!(read_n(&mut client, 2).await, vec![0x05, 0x02]);

    let mut record = vec![0x01, 0x04];
    record.extend_from_slice(b"user");
    record.push(0x04);
    record.extend_from_slice(b"pass");
    client.write_all(&record).await.expect("sub-negotiation");

    assert_eq!(read_n(&mut client, 2).await, vec![0x01, 0xFF]);
    expect_close(&mut client).await;
    sl.begin_exit();
}

/// SIGKILL the helper mid-flight: the pool notices, spawns a replacement
/// within the refill window, and the replacement takes traffic.
#[tokio::test]
#[serial]
async fn test_helper_death_and_refill() {
    let upstream = spawn_socks5_upstream(0x00, false).await;
    let script = write_helper_script(
        "helper-refill.sh",
        &format!(
            "while read line; do\n  echo \"OK 127.0.0.1 {} none\"\ndone",
            upstream.port()
        ),
    );

    let mut cfg = base_config();
    cfg.helper_command = Some(script);
    cfg.helpers_max = 1;
    let (sl, addr) = start_relay(cfg).await;
    let pool = sl.pool.as_ref().expect("pool configured");
    wait_until("helper to start", || pool.available()).await;

    let old_pid = pool.helper_pids()[0];
    kill(Pid::from_raw(old_pid as i32), Signal::SIGKILL).expect("kill helper");

    wait_until("replacement helper", || {
        pool.helper_pids()
            .first()
            .map(|pid| *pid != old_pid)
            .unwrap_or(false)
    })
    .await;
    wait_until("pool to recover", || pool.available()).await;

    let mut client = TcpStream::connect(addr).await.expect("client connect");
    client.write_all(&[0x05, 0x01, 0x00]).await.expect("method select");
    assert_eq!(read_n(&mut client, 2).await, vec![0x05, 0x00]);
    client.write_all(b"ping").await.expect("payload write");
    assert_eq!(read_n(&mut client, 4).await, b"ping");
    sl.begin_exit();
}

/// Queued sessions are disconnected when their helper dies before
/// answering.
#[tokio::test]
#[serial]
async fn test_helper_death_disconnects_queued_sessions() {
    // A helper that never answers keeps the session queued.
    let script = write_helper_script("helper-mute.sh", "while read line; do\n  :\ndone");

    let mut cfg = base_config();
    cfg.helper_command = Some(script);
    cfg.helpers_max = 1;
    let (sl, addr) = start_relay(cfg).await;
    let pool = sl.pool.as_ref().expect("pool configured");
    wait_until("helper to start", || pool.available()).await;

    let mut client = TcpStream::connect(addr).await.expect("client connect");
    client.write_all(&[0x05, 0x01, 0x00]).await.expect("method select");
    assert_eq!(read_n(&mut client, 2).await, vec![0x05, 0x00]);

    let pid = pool.helper_pids()[0];
    kill(Pid::from_raw(pid as i32), Signal::SIGKILL).expect("kill helper");

    expect_close(&mut client).await;
    wait_until("session count to return to 0", || sl.session_count() == 0).await;
    sl.begin_exit();
}
