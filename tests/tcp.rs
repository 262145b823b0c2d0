use std::{sync::Arc, time::Duration};

use bytes::BytesMut;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    time,
};

use shadowsocks_mu::{
    config::{Config, PortConfig},
    crypto::{bytes_to_key, random_iv, Cipher, CipherKind, CryptoMode},
    manager::PortManager,
    relay::address::Address,
};

const METHOD: CipherKind = CipherKind::AES_256_CFB;

fn port_config(password: &str, openvpn_ok: bool) -> PortConfig {
    PortConfig {
        password: password.to_owned(),
        openvpn: if openvpn_ok { "ok" } else { "" }.to_owned(),
        udp: String::new(),
    }
}

fn start_manager(port: u16, config: PortConfig) -> Arc<PortManager> {
    let manager = Arc::new(PortManager::new(&Config::new(), false));
    manager.update(port, config);
    manager
}

/// Loopback echo standing in for an upstream service. Port 1194 passes the
/// destination policy of openvpn-enabled ports.
async fn spawn_tcp_echo(addr: &'static str) {
    let listener = TcpListener::bind(addr).await.expect("bind upstream echo");
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 8192];
                loop {
                    let n = match stream.read(&mut buf).await {
                        Ok(0) | Err(..) => return,
                        Ok(n) => n,
                    };
                    if stream.write_all(&buf[..n]).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
}

async fn connect_with_retry(port: u16) -> TcpStream {
    for _ in 0..50 {
        if let Ok(stream) = TcpStream::connect(("127.0.0.1", port)).await {
            return stream;
        }
        time::sleep(Duration::from_millis(100)).await;
    }
    panic!("server on port {} did not come up", port);
}

/// `iv || encrypt(header || payload)` plus the keystream for follow-up writes
fn seal_request(key: &[u8], target: &Address, payload: &[u8]) -> (Vec<u8>, Cipher) {
    let iv = random_iv(METHOD.iv_len());
    let mut cipher = Cipher::new(METHOD, key, &iv, CryptoMode::Encrypt);

    let mut plain = BytesMut::new();
    target.write_to_buf(&mut plain);
    plain.extend_from_slice(payload);

    let mut packet = iv.to_vec();
    let body_start = packet.len();
    packet.extend_from_slice(&plain);
    cipher.encrypt_packet(&mut packet[body_start..]);

    (packet, cipher)
}

async fn read_reply(stream: &mut TcpStream, key: &[u8], len: usize) -> Vec<u8> {
    let mut iv = vec![0u8; METHOD.iv_len()];
    stream.read_exact(&mut iv).await.expect("reply iv");

    let mut cipher = Cipher::new(METHOD, key, &iv, CryptoMode::Decrypt);
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await.expect("reply payload");
    cipher.decrypt_packet(&mut buf);
    buf
}

#[tokio::test]
async fn tcp_relay_roundtrip() {
    let _ = env_logger::try_init();

    spawn_tcp_echo("127.0.0.71:1194").await;
    let _manager = start_manager(31001, port_config("test-password", true));

    let key = bytes_to_key(b"test-password", METHOD.key_len());
    let target = Address::SocketAddress("127.0.0.71:1194".parse().unwrap());

    let mut client = connect_with_retry(31001).await;

    // header and first payload bytes in one segment, exercising the
    // leftover-forwarding path
    let (packet, _) = seal_request(&key, &target, b"hello");
    client.write_all(&packet).await.unwrap();

    let reply = time::timeout(Duration::from_secs(5), read_reply(&mut client, &key, 5))
        .await
        .expect("echo reply in time");
    assert_eq!(reply, b"hello");
}

#[tokio::test]
async fn tcp_relay_split_payload() {
    let _ = env_logger::try_init();

    spawn_tcp_echo("127.0.0.72:1194").await;
    let _manager = start_manager(31002, port_config("split-password", true));

    let key = bytes_to_key(b"split-password", METHOD.key_len());
    let target = Address::SocketAddress("127.0.0.72:1194".parse().unwrap());

    let mut client = connect_with_retry(31002).await;

    // header alone first, payload in later segments of the same keystream
    let (packet, mut cipher) = seal_request(&key, &target, b"");
    client.write_all(&packet).await.unwrap();

    for chunk in [&b"GET / "[..], &b"HTTP/1.0\r\n\r\n"[..]] {
        let mut enc = chunk.to_vec();
        cipher.encrypt_packet(&mut enc);
        client.write_all(&enc).await.unwrap();
        time::sleep(Duration::from_millis(50)).await;
    }

    let reply = time::timeout(
        Duration::from_secs(5),
        read_reply(&mut client, &key, b"GET / HTTP/1.0\r\n\r\n".len()),
    )
    .await
    .expect("echo reply in time");
    assert_eq!(reply, b"GET / HTTP/1.0\r\n\r\n");
}

#[tokio::test]
async fn tcp_relay_blocks_loopback() {
    let _ = env_logger::try_init();

    let _manager = start_manager(31003, port_config("blocked-password", false));

    let key = bytes_to_key(b"blocked-password", METHOD.key_len());
    let target = Address::SocketAddress("127.0.0.1:80".parse().unwrap());

    let mut client = connect_with_retry(31003).await;
    let (packet, _) = seal_request(&key, &target, b"hello");
    client.write_all(&packet).await.unwrap();

    // the server must drop the connection without relaying anything
    let mut buf = [0u8; 16];
    let n = time::timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .expect("connection closed in time")
        .unwrap_or(0);
    assert_eq!(n, 0);
}

#[tokio::test]
async fn tcp_relay_openvpn_carve_out_requires_flag() {
    let _ = env_logger::try_init();

    spawn_tcp_echo("127.0.0.73:1194").await;
    // same destination as the roundtrip test, but the port has no openvpn flag
    let _manager = start_manager(31004, port_config("no-carve-out", false));

    let key = bytes_to_key(b"no-carve-out", METHOD.key_len());
    let target = Address::SocketAddress("127.0.0.73:1194".parse().unwrap());

    let mut client = connect_with_retry(31004).await;
    let (packet, _) = seal_request(&key, &target, b"hello");
    client.write_all(&packet).await.unwrap();

    let mut buf = [0u8; 16];
    let n = time::timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .expect("connection closed in time")
        .unwrap_or(0);
    assert_eq!(n, 0);
}

#[tokio::test]
async fn tcp_relay_password_update() {
    let _ = env_logger::try_init();

    spawn_tcp_echo("127.0.0.74:1194").await;
    let manager = start_manager(31005, port_config("old-password", true));

    let target = Address::SocketAddress("127.0.0.74:1194".parse().unwrap());

    let old_key = bytes_to_key(b"old-password", METHOD.key_len());
    let mut client = connect_with_retry(31005).await;
    let (packet, _) = seal_request(&old_key, &target, b"before");
    client.write_all(&packet).await.unwrap();
    let reply = time::timeout(Duration::from_secs(5), read_reply(&mut client, &old_key, 6))
        .await
        .expect("echo reply in time");
    assert_eq!(reply, b"before");
    drop(client);

    manager.update(31005, port_config("new-password", true));
    time::sleep(Duration::from_millis(500)).await;

    // the old password now decrypts to garbage: the server drops the
    // connection (or at least never produces an echo)
    let mut stale = connect_with_retry(31005).await;
    let (packet, _) = seal_request(&old_key, &target, b"stale");
    stale.write_all(&packet).await.unwrap();
    let mut buf = [0u8; 16];
    match time::timeout(Duration::from_secs(3), stale.read(&mut buf)).await {
        Err(..) => {}                      // nothing relayed back
        Ok(Ok(0)) | Ok(Err(..)) => {}      // connection dropped
        Ok(Ok(n)) => panic!("received {} bytes through a stale password", n),
    }

    // the new password relays
    let new_key = bytes_to_key(b"new-password", METHOD.key_len());
    let mut fresh = connect_with_retry(31005).await;
    let (packet, _) = seal_request(&new_key, &target, b"after");
    fresh.write_all(&packet).await.unwrap();
    let reply = time::timeout(Duration::from_secs(5), read_reply(&mut fresh, &new_key, 5))
        .await
        .expect("echo reply in time");
    assert_eq!(reply, b"after");
}

#[tokio::test]
async fn tcp_relay_delete_stops_listening() {
    let _ = env_logger::try_init();

    let manager = start_manager(31006, port_config("short-lived", false));

    let client = connect_with_retry(31006).await;
    drop(client);

    manager.delete(31006);
    time::sleep(Duration::from_millis(500)).await;

    assert!(manager.get(31006).is_none());
    assert!(TcpStream::connect(("127.0.0.1", 31006)).await.is_err());
}
