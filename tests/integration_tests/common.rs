use std::{
    fs,
    net::SocketAddr,
    os::unix::fs::PermissionsExt,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use sockslink::{
    cfg::{config::Config, enums::AuthMethod},
    server::sockslink::SocksLink,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    time::{sleep, timeout},
};

/// Foreground config listening on an ephemeral localhost port; tests fill
/// in next-hop, methods and helper as needed.
pub fn base_config() -> Config {
    Config {
        addresses: vec!["127.0.0.1".to_string()],
        port: 0,
        interface: None,
        next_hop: None,
        helper_command: None,
        helpers_max: 0,
        methods: vec![AuthMethod::None],
        pipe: false,
        max_fds: None,
        foreground: true,
        pidfile: None,
        user: None,
        group: None,
        verbosity: 0,
        log_file: std::env::temp_dir().join("sockslinkd-test.log"),
    }
}

/// Binds and serves the relay in the background; returns the handle and
/// the bound address.
pub async fn start_relay(cfg: Config) -> (Arc<SocksLink>, SocketAddr) {
    let sl = SocksLink::new(cfg);
    sl.bind().expect("relay bind failed");
    let addr = *sl
        .local_addrs()
        .first()
        .expect("relay bound no addresses");
    tokio::spawn(sl.clone().run());
    (sl, addr)
}

/// Plain TCP echo server.
pub async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("echo bind");
    let addr = listener.local_addr().expect("echo addr");
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        },
                    }
                }
            });
        }
    });
    addr
}

/// Minimal next-hop SOCKS5 server: answers method-select with
/// `reply_method`, optionally consumes one username sub-negotiation
/// (accepting it), then echoes every byte.
pub async fn spawn_socks5_upstream(reply_method: u8, expect_userauth: bool) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("upstream bind");
    let addr = listener.local_addr().expect("upstream addr");
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut head = [0u8; 2];
                if stream.read_exact(&mut head).await.is_err() {
                    return;
                }
                let mut methods = vec![0u8; head[1] as usize];
                if stream.read_exact(&mut methods).await.is_err() {
                    return;
                }
                if stream.write_all(&[0x05, reply_method]).await.is_err() {
                    return;
                }

                if expect_userauth {
                    let mut hdr = [0u8; 2];
                    if stream.read_exact(&mut hdr).await.is_err() {
                        return;
                    }
                    let mut uname = vec![0u8; hdr[1] as usize];
                    if stream.read_exact(&mut uname).await.is_err() {
                        return;
                    }
                    let mut plen = [0u8; 1];
                    if stream.read_exact(&mut plen).await.is_err() {
                        return;
                    }
                    let mut passwd = vec![0u8; plen[0] as usize];
                    if stream.read_exact(&mut passwd).await.is_err() {
                        return;
                    }
                    if stream.write_all(&[0x01, 0x00]).await.is_err() {
                        return;
                    }
                }

                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        },
                    }
                }
            });
        }
    });
    addr
}

/// Drops an executable shell script into a per-process temp dir.
pub fn write_helper_script(name: &str, body: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("sockslink-it-{}", std::process::id()));
    fs::create_dir_all(&dir).expect("can't create script dir");
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("can't write helper script");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
        .expect("can't chmod helper script");
    path
}

pub fn tmp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("sockslink-it-{}-{name}", std::process::id()))
}

pub async fn read_n(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    timeout(Duration::from_secs(10), stream.read_exact(&mut buf))
        .await
        .expect("timed out reading from relay")
        .expect("read failed");
    buf
}

/// The peer closed (clean FIN or reset), without sending anything else.
pub async fn expect_close(stream: &mut TcpStream) {
    let mut buf = [0u8; 1];
    match timeout(Duration::from_secs(10), stream.read(&mut buf))
        .await
        .expect("timed out waiting for close")
    {
        Ok(0) | Err(_) => {},
        Ok(n) => panic!("expected close, got {n} unexpected byte(s)"),
    }
}

pub async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}
