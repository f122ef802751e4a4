//! Packet layouts exchanged during the handshake and by commands.

use std::collections::BTreeMap;

use sqlwire_core::{Error, Result, ServerError};

use super::packet::{Packet, PacketWriter};
use super::{PROTOCOL_VERSION, capabilities, server_status, session_track};

// ==================== Handshake ====================

/// The initial handshake sent by the server right after connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialHandshake {
    pub protocol_version: u8,
    pub server_version: String,
    pub thread_id: u32,
    pub capabilities: u32,
    pub charset: u8,
    pub status_flags: u16,
    /// Full scramble (both parts, without the trailing NUL)
    pub scramble: Vec<u8>,
    /// Default authentication plugin; empty if the server names none
    pub auth_plugin: String,
}

impl InitialHandshake {
    pub fn parse(mut pkt: Packet) -> Result<Self> {
        let protocol_version = pkt.read_u8()?;
        if protocol_version != PROTOCOL_VERSION {
            return Err(Error::protocol(format!(
                "unsupported protocol version: {}",
                protocol_version
            )));
        }
        let server_version = pkt.read_null_string()?;
        let thread_id = pkt.read_u32_le()?;
        let mut scramble = pkt.read_bytes(8)?.to_vec();
        pkt.skip(1)?; // filler
        let caps_lower = pkt.read_u16_le()?;
        let charset = pkt.read_u8()?;
        let status_flags = pkt.read_u16_le()?;
        let caps_upper = pkt.read_u16_le()?;
        let capabilities = u32::from(caps_lower) | (u32::from(caps_upper) << 16);
        let scramble_len = usize::from(pkt.read_u8()?);
        pkt.skip(10)?; // reserved

        if capabilities & capabilities::CLIENT_SECURE_CONNECTION != 0 {
            let len2 = scramble_len.saturating_sub(8).max(13).min(pkt.remaining());
            let part2 = pkt.read_bytes(len2)?;
            let part2 = part2.strip_suffix(&[0]).unwrap_or(part2);
            scramble.extend_from_slice(part2);
        }

        let auth_plugin = if pkt.is_empty() {
            String::new()
        } else if pkt.as_bytes().contains(&0) {
            pkt.read_null_string()?
        } else {
            String::from_utf8_lossy(pkt.read_rest()).into_owned()
        };

        Ok(Self {
            protocol_version,
            server_version,
            thread_id,
            capabilities,
            charset,
            status_flags,
            scramble,
            auth_plugin,
        })
    }
}

/// The client's answer to [`InitialHandshake`].
#[derive(Debug, Clone)]
pub struct HandshakeResponse<'a> {
    pub client_flags: u32,
    pub max_packet_size: u32,
    pub charset: u8,
    pub user: &'a str,
    pub auth_response: &'a [u8],
    pub database: Option<&'a str>,
    pub auth_plugin: &'a str,
    pub attributes: &'a [(String, String)],
}

impl HandshakeResponse<'_> {
    pub fn serialize(&self) -> Vec<u8> {
        let flags = self.client_flags;
        let mut w = PacketWriter::with_capacity(128);
        write_request_prefix(&mut w, flags, self.max_packet_size, self.charset);
        w.write_null_string(self.user);

        if flags & capabilities::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            w.write_lenenc_bytes(self.auth_response);
        } else {
            // Auth responses are always < 256 bytes without the lenenc flag
            w.write_u8(self.auth_response.len() as u8);
            w.write_bytes(self.auth_response);
        }

        if flags & capabilities::CLIENT_CONNECT_WITH_DB != 0 {
            w.write_null_string(self.database.unwrap_or(""));
        }
        if flags & capabilities::CLIENT_PLUGIN_AUTH != 0 {
            w.write_null_string(self.auth_plugin);
        }
        if flags & capabilities::CLIENT_CONNECT_ATTRS != 0 {
            let mut attrs = PacketWriter::new();
            for (key, value) in self.attributes {
                attrs.write_lenenc_string(key);
                attrs.write_lenenc_string(value);
            }
            w.write_lenenc_bytes(attrs.as_bytes());
        }
        w.into_bytes()
    }
}

/// Minimal request sent before a TLS upgrade: flags, max packet, charset.
pub fn ssl_request(client_flags: u32, max_packet_size: u32, charset: u8) -> Vec<u8> {
    let mut w = PacketWriter::with_capacity(32);
    write_request_prefix(
        &mut w,
        client_flags | capabilities::CLIENT_SSL,
        max_packet_size,
        charset,
    );
    w.into_bytes()
}

fn write_request_prefix(w: &mut PacketWriter, flags: u32, max_packet_size: u32, charset: u8) {
    w.write_u32_le(flags);
    w.write_u32_le(max_packet_size);
    w.write_u8(charset);
    w.write_zeros(23);
}

/// Server reply during authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResult {
    /// Authentication finished; payload is the OK packet
    Ok(Packet),
    /// Plugin-specific continuation data (after the 0x01 marker)
    MoreData(Vec<u8>),
    /// Server requests a different plugin with a fresh scramble
    Switch { plugin: String, scramble: Vec<u8> },
    /// Server requires another authentication factor
    MultiFactor,
}

impl AuthResult {
    pub fn parse(mut pkt: Packet) -> Result<Self> {
        match pkt.peek() {
            Some(0x00) => Ok(AuthResult::Ok(pkt)),
            Some(0x01) => {
                pkt.skip(1)?;
                Ok(AuthResult::MoreData(pkt.read_rest().to_vec()))
            }
            Some(0x02) => Ok(AuthResult::MultiFactor),
            Some(0xFE) => {
                pkt.skip(1)?;
                let plugin = if pkt.is_empty() {
                    String::new()
                } else {
                    pkt.read_null_string()?
                };
                let rest = pkt.read_rest();
                let scramble = rest.strip_suffix(&[0]).unwrap_or(rest).to_vec();
                Ok(AuthResult::Switch { plugin, scramble })
            }
            Some(other) => Err(Error::protocol(format!(
                "invalid authentication reply: 0x{:02X}",
                other
            ))),
            None => Err(Error::protocol("empty authentication reply")),
        }
    }
}

// ==================== Command responses ====================

/// Decode an error packet payload (first byte 0xFF) into a server error.
///
/// Handles both the 4.1 format (`#` marker + 5-byte SQLSTATE) and the legacy
/// format without SQLSTATE.
pub fn parse_err_packet(payload: &[u8]) -> Result<ServerError> {
    let mut pkt = Packet::new(payload.to_vec());
    if pkt.read_u8()? != 0xFF {
        return Err(Error::protocol("not an error packet"));
    }
    let errno = pkt.read_u16_le()?;
    let (sqlstate, message) = if pkt.peek() == Some(b'#') && pkt.remaining() >= 6 {
        pkt.skip(1)?;
        let state = String::from_utf8_lossy(pkt.read_bytes(5)?).into_owned();
        (state, pkt.read_rest())
    } else {
        (String::new(), pkt.read_rest())
    };
    Ok(ServerError::new(
        errno,
        sqlstate,
        String::from_utf8_lossy(message).into_owned(),
    ))
}

/// Alias kept for symmetry with the other packet types.
pub type ErrPacket = ServerError;

/// A value reported by a session state tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackedValue {
    Text(String),
    Pair(String, String),
}

/// Session state changes reported with an OK packet, keyed by tracker type.
pub type SessionTrack = BTreeMap<u8, Vec<TrackedValue>>;

/// OK packet fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
    pub info: String,
    pub session_track: Option<SessionTrack>,
}

impl OkPacket {
    /// Parse an OK packet; `client_flags` are the negotiated capabilities.
    pub fn parse(pkt: &mut Packet, client_flags: u32) -> Result<Self> {
        let header = pkt.read_u8()?;
        if header != 0x00 && header != 0xFE {
            return Err(Error::protocol(format!("not an OK packet: 0x{:02X}", header)));
        }
        Self::parse_body(pkt, client_flags)
    }

    /// Parse the OK fields that follow the header byte.
    pub fn parse_body(pkt: &mut Packet, client_flags: u32) -> Result<Self> {
        let affected_rows = pkt.read_lenenc_int_required()?;
        let last_insert_id = pkt.read_lenenc_int_required()?;
        let status_flags = pkt.read_u16_le()?;
        let warnings = pkt.read_u16_le()?;

        let mut ok = OkPacket {
            affected_rows,
            last_insert_id,
            status_flags,
            warnings,
            info: String::new(),
            session_track: None,
        };

        if client_flags & capabilities::CLIENT_SESSION_TRACK != 0 {
            if !pkt.is_empty() {
                ok.info = pkt.read_lenenc_string()?.unwrap_or_default();
            }
            if status_flags & server_status::SERVER_SESSION_STATE_CHANGED != 0 && !pkt.is_empty() {
                let block = pkt.read_lenenc_bytes()?.unwrap_or_default().to_vec();
                ok.session_track = Some(parse_session_track(block)?);
            }
        } else {
            ok.info = String::from_utf8_lossy(pkt.read_rest()).into_owned();
        }
        Ok(ok)
    }

    pub fn more_results(&self) -> bool {
        self.status_flags & server_status::SERVER_MORE_RESULTS_EXISTS != 0
    }
}

fn parse_session_track(block: Vec<u8>) -> Result<SessionTrack> {
    let mut track = SessionTrack::new();
    let mut data = Packet::new(block);
    while !data.is_empty() {
        let kind = data.read_u8()?;
        let entry = data.read_lenenc_bytes()?.unwrap_or_default().to_vec();
        let mut entry = Packet::new(entry);
        let value = match kind {
            session_track::SYSTEM_VARIABLES => {
                let name = entry.read_lenenc_string()?.unwrap_or_default();
                let value = entry.read_lenenc_string()?.unwrap_or_default();
                TrackedValue::Pair(name, value)
            }
            session_track::GTIDS => {
                entry.skip(1)?; // encoding byte
                TrackedValue::Text(entry.read_lenenc_string()?.unwrap_or_default())
            }
            session_track::SCHEMA
            | session_track::STATE_CHANGE
            | session_track::TRANSACTION_CHARACTERISTICS
            | session_track::TRANSACTION_STATE => {
                TrackedValue::Text(entry.read_lenenc_string()?.unwrap_or_default())
            }
            _ => continue,
        };
        track.entry(kind).or_default().push(value);
    }
    Ok(track)
}

/// Legacy EOF packet (0xFE + warnings + status).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EofPacket {
    pub warnings: u16,
    pub status_flags: u16,
}

impl EofPacket {
    pub fn parse(pkt: &mut Packet) -> Result<Self> {
        if !pkt.is_eof_marker() {
            return Err(Error::protocol("packet is not EOF"));
        }
        pkt.skip(1)?;
        Ok(Self {
            warnings: pkt.read_u16_le()?,
            status_flags: pkt.read_u16_le()?,
        })
    }

    pub fn more_results(&self) -> bool {
        self.status_flags & server_status::SERVER_MORE_RESULTS_EXISTS != 0
    }
}

/// First packet of a query or execute response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultHeader {
    /// Statement without a result set
    Ok(OkPacket),
    /// A result set with this many columns follows
    Columns(u64),
    /// LOAD DATA LOCAL INFILE request for this file name
    LocalInfile(String),
}

impl ResultHeader {
    pub fn parse(mut pkt: Packet, client_flags: u32) -> Result<Self> {
        match pkt.peek() {
            Some(0x00) => {
                pkt.skip(1)?;
                Ok(ResultHeader::Ok(OkPacket::parse_body(&mut pkt, client_flags)?))
            }
            Some(0xFB) => {
                pkt.skip(1)?;
                Ok(ResultHeader::LocalInfile(
                    String::from_utf8_lossy(pkt.read_rest()).into_owned(),
                ))
            }
            Some(_) => Ok(ResultHeader::Columns(pkt.read_lenenc_int_required()?)),
            None => Err(Error::protocol("empty result header")),
        }
    }
}

/// COM_STMT_PREPARE success response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrepareOk {
    pub statement_id: u32,
    pub num_columns: u16,
    pub num_params: u16,
    pub warnings: u16,
}

impl PrepareOk {
    pub fn parse(mut pkt: Packet) -> Result<Self> {
        if pkt.read_u8()? != 0x00 {
            return Err(Error::protocol("invalid prepare response"));
        }
        let statement_id = pkt.read_u32_le()?;
        let num_columns = pkt.read_u16_le()?;
        let num_params = pkt.read_u16_le()?;
        if pkt.read_u8()? != 0x00 {
            return Err(Error::protocol("invalid prepare response filler"));
        }
        let warnings = if pkt.remaining() >= 2 {
            pkt.read_u16_le()?
        } else {
            0
        };
        Ok(Self {
            statement_id,
            num_columns,
            num_params,
            warnings,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::protocol::charset;
    use sqlwire_core::ServerErrorKind;

    pub(crate) fn handshake_bytes(plugin: &str, caps: u32) -> Vec<u8> {
        let mut w = PacketWriter::new();
        w.write_u8(10);
        w.write_null_string("8.0.32-log");
        w.write_u32_le(42);
        w.write_bytes(b"abcdefgh");
        w.write_u8(0);
        w.write_u16_le(caps as u16);
        w.write_u8(charset::UTF8MB4_0900_AI_CI);
        w.write_u16_le(server_status::SERVER_STATUS_AUTOCOMMIT);
        w.write_u16_le((caps >> 16) as u16);
        w.write_u8(21);
        w.write_zeros(10);
        w.write_bytes(b"ijklmnopqrst");
        w.write_u8(0);
        w.write_null_string(plugin);
        w.into_bytes()
    }

    #[test]
    fn test_parse_initial_handshake() {
        let caps = capabilities::DEFAULT_CLIENT_FLAGS | capabilities::CLIENT_SSL;
        let hs = InitialHandshake::parse(Packet::new(handshake_bytes(
            "caching_sha2_password",
            caps,
        )))
        .unwrap();
        assert_eq!(hs.server_version, "8.0.32-log");
        assert_eq!(hs.thread_id, 42);
        assert_eq!(hs.capabilities, caps);
        assert_eq!(hs.scramble, b"abcdefghijklmnopqrst");
        assert_eq!(hs.auth_plugin, "caching_sha2_password");
        assert_eq!(hs.charset, charset::UTF8MB4_0900_AI_CI);
    }

    #[test]
    fn test_reject_protocol_version() {
        let mut bytes = handshake_bytes("mysql_native_password", capabilities::DEFAULT_CLIENT_FLAGS);
        bytes[0] = 9;
        let err = InitialHandshake::parse(Packet::new(bytes)).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_handshake_response_layout() {
        let attrs = vec![("_client_name".to_string(), "sqlwire".to_string())];
        let flags = capabilities::DEFAULT_CLIENT_FLAGS | capabilities::CLIENT_CONNECT_WITH_DB;
        let resp = HandshakeResponse {
            client_flags: flags,
            max_packet_size: 1 << 30,
            charset: charset::UTF8MB4_GENERAL_CI,
            user: "root",
            auth_response: &[1, 2, 3],
            database: Some("test"),
            auth_plugin: "mysql_native_password",
            attributes: &attrs,
        }
        .serialize();

        let mut pkt = Packet::new(resp);
        assert_eq!(pkt.read_u32_le().unwrap(), flags);
        assert_eq!(pkt.read_u32_le().unwrap(), 1 << 30);
        assert_eq!(pkt.read_u8().unwrap(), charset::UTF8MB4_GENERAL_CI);
        pkt.skip(23).unwrap();
        assert_eq!(pkt.read_null_string().unwrap(), "root");
        assert_eq!(pkt.read_lenenc_bytes().unwrap(), Some(&[1u8, 2, 3][..]));
        assert_eq!(pkt.read_null_string().unwrap(), "test");
        assert_eq!(pkt.read_null_string().unwrap(), "mysql_native_password");
        let attrs = pkt.read_lenenc_bytes().unwrap().unwrap().to_vec();
        let mut attrs = Packet::new(attrs);
        assert_eq!(attrs.read_lenenc_string().unwrap().unwrap(), "_client_name");
        assert_eq!(attrs.read_lenenc_string().unwrap().unwrap(), "sqlwire");
        assert!(pkt.is_empty());
    }

    #[test]
    fn test_ssl_request_is_32_bytes() {
        let req = ssl_request(capabilities::DEFAULT_CLIENT_FLAGS, 1 << 24, 45);
        assert_eq!(req.len(), 32);
        let flags = u32::from_le_bytes([req[0], req[1], req[2], req[3]]);
        assert!(flags & capabilities::CLIENT_SSL != 0);
        assert_eq!(req[8], 45);
    }

    #[test]
    fn test_parse_err_packet_41() {
        let mut payload = vec![0xFF, 0x7A, 0x04, b'#'];
        payload.extend_from_slice(b"42S02Table 'x' doesn't exist");
        let err = parse_err_packet(&payload).unwrap();
        assert_eq!(err.errno, 1146);
        assert_eq!(err.sqlstate, "42S02");
        assert_eq!(err.message, "Table 'x' doesn't exist");
        assert_eq!(err.kind, ServerErrorKind::NoSuchTable);
    }

    #[test]
    fn test_parse_err_packet_legacy() {
        let mut payload = vec![0xFF, 0x15, 0x04];
        payload.extend_from_slice(b"Access denied");
        let err = parse_err_packet(&payload).unwrap();
        assert_eq!(err.errno, 1045);
        assert_eq!(err.sqlstate, "");
        assert_eq!(err.message, "Access denied");
    }

    #[test]
    fn test_parse_ok_without_session_track() {
        let mut pkt = Packet::new(vec![0x00, 0x03, 0x0A, 0x02, 0x00, 0x01, 0x00, b'h', b'i']);
        let ok = OkPacket::parse(&mut pkt, 0).unwrap();
        assert_eq!(ok.affected_rows, 3);
        assert_eq!(ok.last_insert_id, 10);
        assert_eq!(ok.status_flags, server_status::SERVER_STATUS_AUTOCOMMIT);
        assert_eq!(ok.warnings, 1);
        assert_eq!(ok.info, "hi");
        assert!(ok.session_track.is_none());
    }

    #[test]
    fn test_parse_ok_with_session_track() {
        let mut entries = PacketWriter::new();
        // system variable autocommit=OFF
        let mut var = PacketWriter::new();
        var.write_lenenc_string("autocommit");
        var.write_lenenc_string("OFF");
        entries.write_u8(session_track::SYSTEM_VARIABLES);
        entries.write_lenenc_bytes(var.as_bytes());
        // schema change
        let mut schema = PacketWriter::new();
        schema.write_lenenc_string("test");
        entries.write_u8(session_track::SCHEMA);
        entries.write_lenenc_bytes(schema.as_bytes());

        let mut w = PacketWriter::new();
        w.write_u8(0x00);
        w.write_lenenc_int(0);
        w.write_lenenc_int(0);
        w.write_u16_le(server_status::SERVER_SESSION_STATE_CHANGED);
        w.write_u16_le(0);
        w.write_lenenc_string("");
        w.write_lenenc_bytes(entries.as_bytes());

        let mut pkt = Packet::new(w.into_bytes());
        let ok = OkPacket::parse(&mut pkt, capabilities::CLIENT_SESSION_TRACK).unwrap();
        let track = ok.session_track.unwrap();
        assert_eq!(
            track[&session_track::SYSTEM_VARIABLES],
            vec![TrackedValue::Pair("autocommit".into(), "OFF".into())]
        );
        assert_eq!(
            track[&session_track::SCHEMA],
            vec![TrackedValue::Text("test".into())]
        );
    }

    #[test]
    fn test_result_header_shapes() {
        assert_eq!(
            ResultHeader::parse(Packet::new(vec![0x02]), 0).unwrap(),
            ResultHeader::Columns(2)
        );
        assert_eq!(
            ResultHeader::parse(Packet::new(b"\xFB/tmp/data.csv".to_vec()), 0).unwrap(),
            ResultHeader::LocalInfile("/tmp/data.csv".to_string())
        );
        assert!(matches!(
            ResultHeader::parse(Packet::new(vec![0, 1, 0, 0, 0, 0, 0]), 0).unwrap(),
            ResultHeader::Ok(OkPacket { affected_rows: 1, .. })
        ));
    }

    #[test]
    fn test_auth_result_switch() {
        let mut payload = vec![0xFE];
        payload.extend_from_slice(b"mysql_native_password\0");
        payload.extend_from_slice(b"01234567890123456789\0");
        match AuthResult::parse(Packet::new(payload)).unwrap() {
            AuthResult::Switch { plugin, scramble } => {
                assert_eq!(plugin, "mysql_native_password");
                assert_eq!(scramble, b"01234567890123456789");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            AuthResult::parse(Packet::new(vec![0x02])).unwrap(),
            AuthResult::MultiFactor
        );
    }

    #[test]
    fn test_prepare_ok() {
        let pkt = Packet::new(vec![0x00, 0x01, 0, 0, 0, 0x02, 0x00, 0x03, 0x00, 0x00, 0x00, 0x00]);
        let ok = PrepareOk::parse(pkt).unwrap();
        assert_eq!(ok.statement_id, 1);
        assert_eq!(ok.num_columns, 2);
        assert_eq!(ok.num_params, 3);
    }

    #[test]
    fn test_eof_packet() {
        let mut pkt = Packet::new(vec![0xFE, 0x00, 0x00, 0x08, 0x00]);
        let eof = EofPacket::parse(&mut pkt).unwrap();
        assert!(eof.more_results());
        let mut pkt = Packet::new(vec![0x01, 0x00]);
        assert!(EofPacket::parse(&mut pkt).is_err());
    }
}
