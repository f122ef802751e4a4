//! Scripted in-process MySQL server for integration tests.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use sqlwire_mysql::MySqlConfig;
use sqlwire_mysql::protocol::{PacketWriter, capabilities, charset, server_status};

pub const SCRAMBLE: &[u8; 20] = b"abcdefghijklmnopqrst";

pub const SERVER_CAPS: u32 = capabilities::DEFAULT_CLIENT_FLAGS
    | capabilities::CLIENT_MULTI_STATEMENTS
    | capabilities::CLIENT_LOCAL_FILES
    | capabilities::CLIENT_CONNECT_WITH_DB;

/// A server that accepts one connection and runs `script` against it.
pub struct FakeServer {
    addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl FakeServer {
    pub fn start<F>(script: F) -> Self
    where
        F: FnOnce(&mut Peer) + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(10)))
                .unwrap();
            let mut peer = Peer { stream, seq: 0 };
            script(&mut peer);
        });
        Self { addr, handle }
    }

    pub fn config(&self) -> MySqlConfig {
        MySqlConfig::new()
            .host("127.0.0.1")
            .port(self.addr.port())
            .user("app")
            .password("secret")
            .connect_timeout(Duration::from_secs(5))
            .read_timeout(Duration::from_secs(5))
    }

    /// Wait for the script to finish, surfacing its assertion failures.
    pub fn join(self) {
        self.handle.join().unwrap();
    }
}

/// Server end of the socket.
pub struct Peer {
    stream: TcpStream,
    seq: u8,
}

impl Peer {
    pub fn write(&mut self, payload: &[u8]) {
        let len = payload.len() as u32;
        let mut frame = vec![len as u8, (len >> 8) as u8, (len >> 16) as u8, self.seq];
        frame.extend_from_slice(payload);
        self.stream.write_all(&frame).unwrap();
        self.seq = self.seq.wrapping_add(1);
    }

    /// Read one packet, continuing the client's sequence.
    pub fn read(&mut self) -> Vec<u8> {
        let mut header = [0u8; 4];
        self.stream.read_exact(&mut header).unwrap();
        let len = usize::from(header[0])
            | usize::from(header[1]) << 8
            | usize::from(header[2]) << 16;
        self.seq = header[3].wrapping_add(1);
        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload).unwrap();
        payload
    }

    /// Read a command packet, which always starts a new sequence.
    pub fn read_command(&mut self) -> Vec<u8> {
        let payload = self.read();
        assert_eq!(self.seq, 1, "command must carry sequence id 0");
        payload
    }

    pub fn handshake(&mut self, plugin: &str, caps: u32) {
        self.seq = 0;
        let mut w = PacketWriter::new();
        w.write_u8(10);
        w.write_null_string("8.0.36-fake");
        w.write_u32_le(77);
        w.write_bytes(&SCRAMBLE[..8]);
        w.write_u8(0);
        w.write_u16_le(caps as u16);
        w.write_u8(charset::UTF8MB4_0900_AI_CI);
        w.write_u16_le(server_status::SERVER_STATUS_AUTOCOMMIT);
        w.write_u16_le((caps >> 16) as u16);
        w.write_u8(21);
        w.write_zeros(10);
        w.write_bytes(&SCRAMBLE[8..]);
        w.write_u8(0);
        w.write_null_string(plugin);
        self.write(&w.into_bytes());
    }

    /// Read the handshake response; returns (user, auth response).
    pub fn read_handshake_response(&mut self) -> (String, Vec<u8>) {
        let payload = self.read();
        let rest = &payload[32..];
        let nul = rest.iter().position(|&b| b == 0).unwrap();
        let user = String::from_utf8(rest[..nul].to_vec()).unwrap();
        let rest = &rest[nul + 1..];
        let len = usize::from(rest[0]);
        (user, rest[1..=len].to_vec())
    }

    /// Handshake, accept any credentials, send OK.
    pub fn login(&mut self) {
        self.handshake("mysql_native_password", SERVER_CAPS);
        self.read_handshake_response();
        self.ok(0, 0, server_status::SERVER_STATUS_AUTOCOMMIT);
    }

    pub fn ok(&mut self, affected: u64, insert_id: u64, status: u16) {
        let mut w = PacketWriter::new();
        w.write_u8(0);
        w.write_lenenc_int(affected);
        w.write_lenenc_int(insert_id);
        w.write_u16_le(status);
        w.write_u16_le(0);
        self.write(&w.into_bytes());
    }

    pub fn eof(&mut self, status: u16) {
        let mut w = PacketWriter::new();
        w.write_u8(0xFE);
        w.write_u16_le(0);
        w.write_u16_le(status);
        self.write(&w.into_bytes());
    }

    pub fn err(&mut self, errno: u16, sqlstate: &str, message: &str) {
        let mut w = PacketWriter::new();
        w.write_u8(0xFF);
        w.write_u16_le(errno);
        w.write_u8(b'#');
        w.write_bytes(sqlstate.as_bytes());
        w.write_bytes(message.as_bytes());
        self.write(&w.into_bytes());
    }

    pub fn column_count(&mut self, count: u64) {
        let mut w = PacketWriter::new();
        w.write_lenenc_int(count);
        self.write(&w.into_bytes());
    }

    pub fn column(&mut self, name: &str, column_type: u8, flags: u16, charset_id: u16) {
        let mut w = PacketWriter::new();
        w.write_lenenc_string("def");
        w.write_lenenc_string("test");
        w.write_lenenc_string("t");
        w.write_lenenc_string("t");
        w.write_lenenc_string(name);
        w.write_lenenc_string(name);
        w.write_u8(0x0C);
        w.write_u16_le(charset_id);
        w.write_u32_le(11);
        w.write_u8(column_type);
        w.write_u16_le(flags);
        w.write_u8(0);
        w.write_zeros(2);
        self.write(&w.into_bytes());
    }

    pub fn text_row(&mut self, values: &[Option<&str>]) {
        let mut w = PacketWriter::new();
        for value in values {
            match value {
                Some(v) => w.write_lenenc_string(v),
                None => w.write_lenenc_null(),
            }
        }
        self.write(&w.into_bytes());
    }

    pub fn prepare_ok(&mut self, statement_id: u32, columns: u16, params: u16) {
        let mut w = PacketWriter::new();
        w.write_u8(0);
        w.write_u32_le(statement_id);
        w.write_u16_le(columns);
        w.write_u16_le(params);
        w.write_u8(0);
        w.write_u16_le(0);
        self.write(&w.into_bytes());
    }

    /// Assert the client hung up without sending anything more.
    pub fn expect_closed(&mut self) {
        let mut buf = [0u8; 1];
        let n = self.stream.read(&mut buf).unwrap();
        assert_eq!(n, 0, "client sent data after the handshake");
    }

    /// Keep the socket open without answering.
    pub fn stall(&mut self, duration: Duration) {
        thread::sleep(duration);
    }
}
