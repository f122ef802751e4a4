mod common;

use std::net::TcpListener;
use std::time::Duration;

use sha1::{Digest, Sha1};
use sqlwire_core::{ClientErrorKind, ConnectionErrorKind, ServerErrorKind};
use sqlwire_mysql::protocol::{capabilities, server_status};
use sqlwire_mysql::{ConnectionState, MySqlConnection, SslMode};

use common::{FakeServer, SCRAMBLE, SERVER_CAPS};

fn native_scramble(password: &str, scramble: &[u8]) -> Vec<u8> {
    let stage1 = Sha1::digest(password.as_bytes());
    let stage2 = Sha1::digest(stage1);
    let mut hasher = Sha1::new();
    hasher.update(scramble);
    hasher.update(stage2);
    let stage3 = hasher.finalize();
    stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
}

#[test]
fn test_native_password_login() {
    let server = FakeServer::start(|peer| {
        peer.handshake("mysql_native_password", SERVER_CAPS);
        let (user, auth) = peer.read_handshake_response();
        assert_eq!(user, "app");
        assert_eq!(auth, native_scramble("secret", SCRAMBLE));
        peer.ok(0, 0, server_status::SERVER_STATUS_AUTOCOMMIT);

        assert_eq!(peer.read_command(), vec![0x0E]);
        peer.ok(0, 0, server_status::SERVER_STATUS_AUTOCOMMIT);
        assert_eq!(peer.read_command(), vec![0x01]);
    });

    let mut conn = MySqlConnection::connect(server.config()).unwrap();
    assert_eq!(conn.state(), ConnectionState::Ready);
    assert_eq!(conn.server_info(), "8.0.36-fake");
    assert_eq!(conn.server_version(), 80036);
    assert_eq!(conn.thread_id(), 77);
    assert!(conn.client_flags() & capabilities::CLIENT_PROTOCOL_41 != 0);
    assert!(!conn.is_encrypted());

    conn.ping().unwrap();
    conn.quit().unwrap();
    assert!(!conn.is_connected());
    server.join();
}

#[test]
fn test_caching_sha2_fast_auth() {
    let server = FakeServer::start(|peer| {
        peer.handshake("caching_sha2_password", SERVER_CAPS);
        let (_, auth) = peer.read_handshake_response();
        assert_eq!(auth.len(), 32);
        peer.write(&[0x01, 0x03]);
        peer.ok(0, 0, server_status::SERVER_STATUS_AUTOCOMMIT);
    });

    let conn = MySqlConnection::connect(server.config()).unwrap();
    assert_eq!(conn.state(), ConnectionState::Ready);
    server.join();
}

#[test]
fn test_caching_sha2_full_auth_refused_in_plaintext() {
    let server = FakeServer::start(|peer| {
        peer.handshake("caching_sha2_password", SERVER_CAPS);
        peer.read_handshake_response();
        peer.write(&[0x01, 0x04]);
    });

    let err = MySqlConnection::connect(server.config()).unwrap_err();
    assert_eq!(err.client_kind(), Some(ClientErrorKind::Unsupported));
    server.join();
}

#[test]
fn test_auth_switch_to_native_password() {
    let fresh = *b"ZYXWVUTSRQPONMLKJIHG";
    let server = FakeServer::start(move |peer| {
        peer.handshake("caching_sha2_password", SERVER_CAPS);
        peer.read_handshake_response();

        let mut switch = vec![0xFE];
        switch.extend_from_slice(b"mysql_native_password\0");
        switch.extend_from_slice(&fresh);
        switch.push(0);
        peer.write(&switch);

        assert_eq!(peer.read(), native_scramble("secret", &fresh));
        peer.ok(0, 0, server_status::SERVER_STATUS_AUTOCOMMIT);
    });

    let conn = MySqlConnection::connect(server.config()).unwrap();
    assert!(conn.is_connected());
    server.join();
}

#[test]
fn test_access_denied() {
    let server = FakeServer::start(|peer| {
        peer.handshake("mysql_native_password", SERVER_CAPS);
        peer.read_handshake_response();
        peer.err(1045, "28000", "Access denied for user 'app'@'localhost'");
    });

    let err = MySqlConnection::connect(server.config()).unwrap_err();
    let server_err = err.as_server_error().unwrap();
    assert_eq!(server_err.errno, 1045);
    assert_eq!(server_err.kind, ServerErrorKind::AccessDenied);
    server.join();
}

#[test]
fn test_connect_with_database() {
    let server = FakeServer::start(|peer| {
        peer.handshake("mysql_native_password", SERVER_CAPS);
        let payload = peer.read();
        let flags = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        assert!(flags & capabilities::CLIENT_CONNECT_WITH_DB != 0);
        assert!(payload.windows(5).any(|w| w == b"shop\0"));
        assert!(payload.windows(12).any(|w| w == b"_client_name"));
        peer.ok(0, 0, server_status::SERVER_STATUS_AUTOCOMMIT);
    });

    let conn = MySqlConnection::connect(server.config().database("shop")).unwrap();
    assert_eq!(conn.config().database.as_deref(), Some("shop"));
    server.join();
}

#[test]
fn test_read_timeout_closes_connection() {
    let server = FakeServer::start(|peer| {
        peer.login();
        peer.read_command();
        peer.stall(Duration::from_millis(500));
    });

    let config = server.config().read_timeout(Duration::from_millis(100));
    let mut conn = MySqlConnection::connect(config).unwrap();
    let err = conn.ping().unwrap_err();
    assert_eq!(err.connection_kind(), Some(ConnectionErrorKind::ReadTimeout));
    assert!(!conn.is_connected());

    let err = conn.ping().unwrap_err();
    assert_eq!(err.client_kind(), Some(ClientErrorKind::NotConnected));
    server.join();
}

#[test]
fn test_connection_refused() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let config = sqlwire_mysql::MySqlConfig::new()
        .host("127.0.0.1")
        .port(port)
        .connect_timeout(Duration::from_secs(2));

    let err = MySqlConnection::connect(config).unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(err.connection_kind(), Some(ConnectionErrorKind::Refused));
}

#[test]
fn test_required_ssl_against_plaintext_server() {
    let server = FakeServer::start(|peer| {
        peer.handshake("mysql_native_password", SERVER_CAPS);
        peer.expect_closed();
    });

    let config = server.config().ssl_mode(SslMode::Required);
    let err = MySqlConnection::connect(config).unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(err.connection_kind(), Some(ConnectionErrorKind::Ssl));
    server.join();
}

#[test]
fn test_preferred_ssl_falls_back_to_plaintext() {
    let server = FakeServer::start(|peer| {
        peer.login();
        assert_eq!(peer.read_command(), vec![0x0E]);
        peer.ok(0, 0, server_status::SERVER_STATUS_AUTOCOMMIT);
    });

    let config = server.config().ssl_mode(SslMode::Preferred);
    let mut conn = MySqlConnection::connect(config).unwrap();
    assert!(!conn.is_encrypted());
    assert_eq!(conn.client_flags() & capabilities::CLIENT_SSL, 0);
    conn.ping().unwrap();
    server.join();
}
