//! MySQL connection: handshake, authentication and the command protocol.
//!
//! # Connection states
//!
//! ```text
//!             query / execute
//!   Ready ------------------------> (result header)
//!     ^                              |        |
//!     |  OK, no more results         |        | column count
//!     +------------------------------+        v
//!     |                                     Field --retr_fields--> Result
//!     |  EOF, no more results                                        |
//!     +--------------------------------------------------------------+
//!     |                                                              |
//!     |   EOF / OK with more results                                 |
//!     +------------- WaitResult <------------------------------------+
//!                       |  next_result
//!                       +--> (result header)
//! ```
//!
//! Every command declares the state it needs. A call in any other state fails
//! with [`ClientErrorKind::CommandsOutOfSync`] before anything is written.
//! Server errors leave the connection usable and put it back in `Ready`;
//! protocol and transport errors close it for good.
//!
//! Statement ids of [`Statement`] handles dropped without
//! [`MySqlConnection::close_statement`] are closed whenever the connection
//! returns to `Ready`, so a close never lands in the middle of a result
//! stream.

use std::collections::BTreeMap;
use std::io::{ErrorKind, Read};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use regex::Regex;
use sqlwire_core::error::ConnectionErrorKind;
use sqlwire_core::{ClientErrorKind, Error, Param, Result, Row};
use tracing::{debug, trace, warn};

use crate::auth::{self, AuthAction, AuthContext};
use crate::charset::Charset;
use crate::config::MySqlConfig;
use crate::infile::{FsInfileSource, LocalInfileSource};
use crate::protocol::messages::ssl_request;
use crate::protocol::{
    AuthResult, Command, EofPacket, HandshakeResponse, InitialHandshake, OkPacket, Packet,
    PrepareOk, ResultHeader, SessionTrack, capabilities, charset as charset_ids, server_status,
};
use crate::statement::{CloseQueue, Statement};
use crate::tls;
use crate::transport::{self, FrameTransport, NetStream};
use crate::types::{Field, build_execute, check_param_count, decode_binary_row, decode_text_row};

/// Chunk size used when streaming LOAD DATA LOCAL INFILE contents.
///
/// Must stay below the maximum packet size so that no data chunk is
/// mistaken for the end of the upload.
const INFILE_CHUNK_SIZE: usize = 64 * 1024;

/// Upper bound on authentication round trips (switches, key exchanges).
const MAX_AUTH_ROUNDS: usize = 8;

static VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)\.(\d+)\.(\d+)").expect("constant pattern"));

/// Protocol state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake in progress
    Init,
    /// Idle, ready for a new command
    Ready,
    /// Another result of a multi-result response is pending
    WaitResult,
    /// A result set header was read; field definitions are pending
    Field,
    /// Field definitions were read; rows are pending
    Result,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowFormat {
    Text,
    Binary,
}

/// A fully read result of one statement.
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    pub fields: Vec<Field>,
    pub rows: Vec<Row>,
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub warnings: u16,
    pub info: String,
}

/// Synchronous connection to a MySQL server.
pub struct MySqlConnection {
    /// `None` once closed
    transport: Option<FrameTransport>,
    state: ConnectionState,
    config: MySqlConfig,
    server_info: String,
    thread_id: u32,
    server_capabilities: u32,
    client_flags: u32,
    charset_id: u8,
    charset: Charset,
    status_flags: u16,
    affected_rows: u64,
    last_insert_id: u64,
    warning_count: u16,
    info: String,
    session_track: Option<SessionTrack>,
    field_count: usize,
    fields: Vec<Field>,
    columns: Arc<[String]>,
    row_format: RowFormat,
    close_queue: CloseQueue,
    infile_source: Box<dyn LocalInfileSource>,
}

impl std::fmt::Debug for MySqlConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MySqlConnection")
            .field("state", &self.state)
            .field("connected", &self.transport.is_some())
            .field("thread_id", &self.thread_id)
            .field("server_info", &self.server_info)
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("database", &self.config.database)
            .finish_non_exhaustive()
    }
}

impl MySqlConnection {
    /// Connect and authenticate.
    ///
    /// Opening the socket and the whole handshake share one deadline, the
    /// configured connect timeout.
    pub fn connect(config: MySqlConfig) -> Result<Self> {
        tls::validate_tls_config(config.ssl_mode, &config.tls_config)?;
        if let Some(id) = config.charset {
            charset_for(id)?;
        }

        let deadline = Instant::now() + config.connect_timeout;
        let stream = open_stream(&config)?;
        let mut transport = FrameTransport::new(stream)
            .with_timeouts(config.read_timeout, config.write_timeout);
        transport.set_connect_deadline(Some(deadline));

        Self::establish(transport, config)
    }

    /// Run the handshake over an already opened transport.
    pub(crate) fn establish(mut transport: FrameTransport, config: MySqlConfig) -> Result<Self> {
        transport.set_max_packet_size(config.max_packet_size as usize);
        let handshake = InitialHandshake::parse(transport.receive()?)?;
        debug!(
            server_version = %handshake.server_version,
            thread_id = handshake.thread_id,
            plugin = %handshake.auth_plugin,
            "received server handshake"
        );

        if handshake.capabilities & capabilities::CLIENT_PROTOCOL_41 == 0 {
            return Err(Error::protocol(
                "server does not support the 4.1 protocol",
            ));
        }

        let (charset_id, charset) = match config.charset {
            Some(id) => (id, charset_for(id)?),
            None => match Charset::from_id(u16::from(handshake.charset)) {
                Some(cs) if !cs.is_binary() && cs.can_encode() => (handshake.charset, cs),
                _ => (charset_ids::UTF8MB4_GENERAL_CI, Charset::Utf8),
            },
        };

        let mut client_flags = (config.capability_flags() & handshake.capabilities)
            | capabilities::MANDATORY_CLIENT_FLAGS;

        if tls::validate_ssl_mode(config.ssl_mode, handshake.capabilities, transport.is_local())? {
            client_flags |= capabilities::CLIENT_SSL;
            transport.send(&ssl_request(client_flags, config.max_packet_size, charset_id))?;

            let server_name = config
                .tls_config
                .server_name
                .clone()
                .unwrap_or_else(|| config.host.clone());
            transport = transport.upgrade(|stream, deadline| {
                tls::connect_tls(
                    stream,
                    config.ssl_mode,
                    &config.tls_config,
                    &server_name,
                    deadline,
                )
            })?;
            debug!(server_name = %server_name, "TLS established");
        }

        let infile_source: Box<dyn LocalInfileSource> =
            Box::new(FsInfileSource::from_config(&config));
        let mut conn = Self {
            transport: Some(transport),
            state: ConnectionState::Init,
            server_info: handshake.server_version.clone(),
            thread_id: handshake.thread_id,
            server_capabilities: handshake.capabilities,
            client_flags,
            charset_id,
            charset,
            status_flags: handshake.status_flags,
            affected_rows: 0,
            last_insert_id: 0,
            warning_count: 0,
            info: String::new(),
            session_track: None,
            field_count: 0,
            fields: Vec::new(),
            columns: Arc::from(Vec::<String>::new()),
            row_format: RowFormat::Text,
            close_queue: CloseQueue::new(),
            infile_source,
            config,
        };

        conn.authenticate(&handshake)?;

        if let Some(transport) = conn.transport.as_mut() {
            transport.set_connect_deadline(None);
        }
        conn.set_state(ConnectionState::Ready);
        debug!(thread_id = conn.thread_id, "connection ready");
        Ok(conn)
    }

    fn authenticate(&mut self, handshake: &InitialHandshake) -> Result<()> {
        let password = self.config.password.clone().unwrap_or_default();
        let allow_key = self.config.allow_public_key_retrieval;
        let secure = self.transport()?.is_secure();

        let plugin_name = if handshake.auth_plugin.is_empty() {
            "mysql_native_password"
        } else {
            handshake.auth_plugin.as_str()
        };
        let mut plugin = auth::plugin_for(plugin_name);
        let mut scramble = handshake.scramble.clone();
        debug!(plugin = plugin_name, secure, "authenticating");

        let response =
            plugin.initial_response(&auth_context(&password, &scramble, secure, allow_key))?;
        let attributes = connect_attributes(&self.config);
        let packet = HandshakeResponse {
            client_flags: self.client_flags,
            max_packet_size: self.config.max_packet_size,
            charset: self.charset_id,
            user: &self.config.user,
            auth_response: &response,
            database: self.config.database.as_deref(),
            auth_plugin: plugin_name,
            attributes: &attributes,
        }
        .serialize();
        self.transport()?.send(&packet)?;

        for _ in 0..MAX_AUTH_ROUNDS {
            let reply = self.transport()?.receive()?;
            match AuthResult::parse(reply)? {
                AuthResult::Ok(mut pkt) => {
                    let ok = OkPacket::parse(&mut pkt, self.client_flags)?;
                    self.apply_ok(ok);
                    return Ok(());
                }
                AuthResult::Switch {
                    plugin: name,
                    scramble: fresh,
                } => {
                    debug!(from = plugin.name(), to = %name, "authentication switch");
                    plugin = auth::plugin_for(&name);
                    scramble = fresh;
                    let mut response = plugin
                        .initial_response(&auth_context(&password, &scramble, secure, allow_key))?;
                    if response.is_empty() {
                        response.push(0);
                    }
                    self.transport()?.send(&response)?;
                }
                AuthResult::MoreData(data) => {
                    let ctx = auth_context(&password, &scramble, secure, allow_key);
                    match plugin.more_data(&data, &ctx)? {
                        AuthAction::Send(payload) => self.transport()?.send(&payload)?,
                        AuthAction::ReadNext => {}
                    }
                }
                AuthResult::MultiFactor => {
                    return Err(Error::client(
                        ClientErrorKind::Unsupported,
                        "multi-factor authentication is not supported",
                    ));
                }
            }
        }

        Err(Error::connection(
            ConnectionErrorKind::Authentication,
            "authentication did not complete",
        ))
    }

    // ==================== State machine ====================

    /// Run `op` if the connection is in `required`.
    ///
    /// On success the state becomes the one returned by `op`. A fatal error
    /// closes the connection; any other error moves it to `failure`.
    fn transition<T>(
        &mut self,
        required: ConnectionState,
        failure: ConnectionState,
        op: impl FnOnce(&mut Self) -> Result<(T, ConnectionState)>,
    ) -> Result<T> {
        self.check_state(required)?;
        match op(self) {
            Ok((value, next)) => {
                self.set_state(next);
                Ok(value)
            }
            Err(err) => {
                if err.is_fatal() {
                    self.abort(&err);
                } else {
                    self.set_state(failure);
                }
                Err(err)
            }
        }
    }

    /// A command that starts and ends in `Ready`.
    fn command<T>(&mut self, op: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.transition(ConnectionState::Ready, ConnectionState::Ready, |conn| {
            op(conn).map(|v| (v, ConnectionState::Ready))
        })
    }

    fn check_state(&self, required: ConnectionState) -> Result<()> {
        if self.transport.is_none() {
            return Err(not_connected());
        }
        if self.state != required {
            return Err(Error::client(
                ClientErrorKind::CommandsOutOfSync,
                format!(
                    "commands out of sync: {:?} required, connection is {:?}",
                    required, self.state
                ),
            ));
        }
        Ok(())
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        if state == ConnectionState::Ready {
            self.drain_close_queue();
        }
    }

    fn drain_close_queue(&mut self) {
        if self.transport.is_none() || self.close_queue.is_empty() {
            return;
        }
        for id in self.close_queue.drain() {
            debug!(statement_id = id, "closing dropped statement");
            if let Err(err) = self.send_command(Command::StmtClose, &id.to_le_bytes()) {
                self.abort(&err);
                return;
            }
        }
    }

    fn abort(&mut self, err: &Error) {
        if self.transport.take().is_some() {
            warn!(error = %err, "closing connection after fatal error");
        }
    }

    fn transport(&mut self) -> Result<&mut FrameTransport> {
        self.transport.as_mut().ok_or_else(not_connected)
    }

    /// Start a new command: reset the sequence and send opcode plus body.
    fn send_command(&mut self, command: Command, body: &[u8]) -> Result<()> {
        let mut payload = Vec::with_capacity(body.len() + 1);
        payload.push(command as u8);
        payload.extend_from_slice(body);
        self.send_payload(&payload)
    }

    fn send_payload(&mut self, payload: &[u8]) -> Result<()> {
        trace!(command = ?payload.first(), len = payload.len(), "send command");
        let transport = self.transport()?;
        transport.reset_sequence();
        transport.send(payload)
    }

    fn receive(&mut self) -> Result<Packet> {
        self.transport()?.receive()
    }

    fn apply_ok(&mut self, ok: OkPacket) {
        self.affected_rows = ok.affected_rows;
        self.last_insert_id = ok.last_insert_id;
        self.status_flags = ok.status_flags;
        self.warning_count = ok.warnings;
        self.info = ok.info;
        if ok.session_track.is_some() {
            self.session_track = ok.session_track;
        }
        self.field_count = 0;
    }

    fn apply_eof(&mut self, eof: EofPacket) {
        self.status_flags = eof.status_flags;
        self.warning_count = eof.warnings;
    }

    fn read_eof(&mut self) -> Result<EofPacket> {
        let mut pkt = self.receive()?;
        EofPacket::parse(&mut pkt)
    }

    fn read_ok(&mut self) -> Result<()> {
        let mut pkt = self.receive()?;
        let ok = OkPacket::parse(&mut pkt, self.client_flags)?;
        self.apply_ok(ok);
        Ok(())
    }

    /// Some commands answer with an EOF packet instead of an OK.
    fn read_ok_or_eof(&mut self) -> Result<()> {
        let mut pkt = self.receive()?;
        if pkt.is_eof_marker() {
            let eof = EofPacket::parse(&mut pkt)?;
            self.apply_eof(eof);
            Ok(())
        } else {
            let ok = OkPacket::parse(&mut pkt, self.client_flags)?;
            self.apply_ok(ok);
            Ok(())
        }
    }

    /// Where a finished result leaves the connection.
    fn after_result(&self) -> ConnectionState {
        if self.status_flags & server_status::SERVER_MORE_RESULTS_EXISTS != 0 {
            ConnectionState::WaitResult
        } else {
            ConnectionState::Ready
        }
    }

    // ==================== Results ====================

    /// Read a result header: an OK, a column count or an infile request.
    fn read_result(&mut self) -> Result<(Option<usize>, ConnectionState)> {
        let pkt = self.receive()?;
        match ResultHeader::parse(pkt, self.client_flags)? {
            ResultHeader::Ok(ok) => {
                self.apply_ok(ok);
                Ok((None, self.after_result()))
            }
            ResultHeader::Columns(count) => {
                let count = usize::try_from(count)
                    .map_err(|_| Error::protocol(format!("invalid column count {}", count)))?;
                self.field_count = count;
                Ok((Some(count), ConnectionState::Field))
            }
            ResultHeader::LocalInfile(filename) => {
                self.local_infile(&filename)?;
                Ok((None, self.after_result()))
            }
        }
    }

    /// Answer a LOAD DATA LOCAL INFILE request.
    ///
    /// A refused or unreadable file is answered with the empty terminator;
    /// the refusal is reported once the server's reply has been consumed.
    fn local_infile(&mut self, filename: &str) -> Result<()> {
        debug!(filename, "server requested local infile");
        let refusal = match self.infile_source.open(filename) {
            Ok(mut reader) => self.stream_infile(&mut *reader)?,
            Err(err) => Some(err),
        };
        self.transport()?.send(&[])?;

        match (self.read_ok(), refusal) {
            (Err(err), _) if err.is_fatal() => Err(err),
            (result, None) => result,
            (_, Some(refusal)) => {
                debug!(filename, error = %refusal, "local infile refused");
                Err(refusal)
            }
        }
    }

    /// Send file contents; returns the read error that cut the upload short.
    fn stream_infile(&mut self, reader: &mut dyn Read) -> Result<Option<Error>> {
        let mut buf = vec![0u8; INFILE_CHUNK_SIZE];
        let mut total = 0usize;
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Ok(Some(Error::client(
                        ClientErrorKind::LocalInfileRejected,
                        format!("failed to read local infile: {}", e),
                    )));
                }
            };
            self.transport()?.send(&buf[..n])?;
            total += n;
        }
        debug!(bytes = total, "local infile sent");
        Ok(None)
    }

    /// Send a text query and read its result header.
    ///
    /// Returns the column count of a result set, or `None` for statements
    /// answered with OK (affected rows etc. are then available through the
    /// accessors).
    pub fn query_command(&mut self, sql: &str) -> Result<Option<usize>> {
        let body = self.charset.encode(sql)?;
        self.transition(ConnectionState::Ready, ConnectionState::Ready, |conn| {
            conn.send_command(Command::Query, &body)?;
            conn.row_format = RowFormat::Text;
            conn.read_result()
        })
    }

    /// Read the field definitions of the current result set.
    pub fn retr_fields(&mut self) -> Result<Vec<Field>> {
        self.transition(ConnectionState::Field, ConnectionState::Ready, |conn| {
            let mut fields = Vec::with_capacity(conn.field_count);
            for _ in 0..conn.field_count {
                fields.push(Field::parse(conn.receive()?)?);
            }
            let eof = conn.read_eof()?;
            conn.apply_eof(eof);
            conn.set_fields(fields.clone());
            Ok((fields, ConnectionState::Result))
        })
    }

    fn set_fields(&mut self, fields: Vec<Field>) {
        self.columns = fields.iter().map(|f| f.name.clone()).collect();
        self.fields = fields;
    }

    /// Next undecoded row packet, or `None` at the end of the result set.
    fn next_row_packet(&mut self) -> Result<Option<Packet>> {
        self.transition(ConnectionState::Result, ConnectionState::Ready, |conn| {
            let mut pkt = conn.receive()?;
            if pkt.is_eof_marker() {
                let eof = EofPacket::parse(&mut pkt)?;
                conn.apply_eof(eof);
                Ok((None, conn.after_result()))
            } else {
                Ok((Some(pkt), ConnectionState::Result))
            }
        })
    }

    /// Fetch and decode the next row of the current result set.
    ///
    /// Returns `None` after the last row; the connection is then `Ready`, or
    /// `WaitResult` if more results follow. A row that fails to decode is
    /// consumed; the following rows are still available.
    pub fn fetch_row(&mut self) -> Result<Option<Row>> {
        let Some(pkt) = self.next_row_packet()? else {
            return Ok(None);
        };
        let decoded = match self.row_format {
            RowFormat::Text => decode_text_row(pkt, &self.fields, self.charset),
            RowFormat::Binary => decode_binary_row(pkt, &self.fields, self.charset),
        };
        match decoded {
            Ok(values) => Ok(Some(Row::new(Arc::clone(&self.columns), values))),
            Err(err) => {
                if err.is_fatal() {
                    self.abort(&err);
                }
                Err(err)
            }
        }
    }

    /// Fetch every remaining row of the current result set.
    pub fn retr_all_records(&mut self) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        while let Some(row) = self.fetch_row()? {
            rows.push(row);
        }
        Ok(rows)
    }

    /// Skip whatever is left of the current result set.
    pub fn free_result(&mut self) -> Result<()> {
        if self.state == ConnectionState::Field {
            self.retr_fields()?;
        }
        if self.state == ConnectionState::Result {
            while self.next_row_packet()?.is_some() {}
        }
        Ok(())
    }

    /// Whether another result of the last command is waiting.
    pub fn more_results(&self) -> bool {
        self.transport.is_some() && self.state == ConnectionState::WaitResult
    }

    /// Read the header of the next result; see [`Self::query_command`].
    pub fn next_result(&mut self) -> Result<Option<usize>> {
        self.transition(
            ConnectionState::WaitResult,
            ConnectionState::Ready,
            Self::read_result,
        )
    }

    /// Run a query and read its first result completely.
    pub fn query(&mut self, sql: &str) -> Result<ResultSet> {
        let count = self.query_command(sql)?;
        self.collect_result(count)
    }

    fn collect_result(&mut self, count: Option<usize>) -> Result<ResultSet> {
        let (fields, rows) = match count {
            Some(_) => {
                let fields = self.retr_fields()?;
                (fields, self.retr_all_records()?)
            }
            None => (Vec::new(), Vec::new()),
        };
        Ok(ResultSet {
            fields,
            rows,
            affected_rows: self.affected_rows,
            last_insert_id: self.last_insert_id,
            warnings: self.warning_count,
            info: self.info.clone(),
        })
    }

    // ==================== Prepared statements ====================

    /// Prepare a statement on the server.
    pub fn prepare(&mut self, sql: &str) -> Result<Statement> {
        let body = self.charset.encode(sql)?;
        self.command(|conn| {
            conn.send_command(Command::StmtPrepare, &body)?;
            let ok = PrepareOk::parse(conn.receive()?)?;
            let params = conn.read_field_group(ok.num_params)?;
            let fields = conn.read_field_group(ok.num_columns)?;
            conn.warning_count = ok.warnings;
            debug!(
                statement_id = ok.statement_id,
                params = ok.num_params,
                columns = ok.num_columns,
                "statement prepared"
            );
            Ok(Statement::new(
                ok.statement_id,
                usize::from(ok.num_params),
                params,
                fields,
                conn.close_queue.clone(),
            ))
        })
    }

    /// `count` field definitions followed by an EOF, or nothing at all.
    fn read_field_group(&mut self, count: u16) -> Result<Vec<Field>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut fields = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            fields.push(Field::parse(self.receive()?)?);
        }
        self.read_eof()?;
        Ok(fields)
    }

    /// Execute a prepared statement and read its result header.
    ///
    /// Rows of the result are read with [`Self::retr_fields`] and
    /// [`Self::fetch_row`] as for a text query, in the binary format.
    pub fn execute_command(&mut self, stmt: &Statement, params: &[Param]) -> Result<Option<usize>> {
        check_param_count(stmt.param_count(), params.len())?;
        let payload = build_execute(stmt.id(), params, self.charset)?;
        self.transition(ConnectionState::Ready, ConnectionState::Ready, |conn| {
            conn.send_payload(&payload)?;
            conn.row_format = RowFormat::Binary;
            conn.read_result()
        })
    }

    /// Execute a prepared statement and read its first result completely.
    pub fn execute(&mut self, stmt: &Statement, params: &[Param]) -> Result<ResultSet> {
        let count = self.execute_command(stmt, params)?;
        self.collect_result(count)
    }

    /// Release a prepared statement. The server sends no reply.
    ///
    /// If the close cannot be sent now, the id is queued and closed later.
    pub fn close_statement(&mut self, mut stmt: Statement) -> Result<()> {
        let id = stmt.id();
        self.command(|conn| conn.send_command(Command::StmtClose, &id.to_le_bytes()))?;
        stmt.mark_closed();
        debug!(statement_id = id, "statement closed");
        Ok(())
    }

    /// Reset the server-side state of a prepared statement.
    pub fn reset_statement(&mut self, stmt: &Statement) -> Result<()> {
        let id = stmt.id();
        self.command(|conn| {
            conn.send_command(Command::StmtReset, &id.to_le_bytes())?;
            conn.read_ok()
        })
    }

    /// Statement ids waiting to be closed.
    pub fn pending_statement_closes(&self) -> usize {
        self.close_queue.len()
    }

    // ==================== Simple commands ====================

    pub fn ping(&mut self) -> Result<()> {
        self.command(|conn| {
            conn.send_command(Command::Ping, &[])?;
            conn.read_ok()
        })
    }

    /// Change the default database.
    pub fn select_db(&mut self, database: &str) -> Result<()> {
        let body = self.charset.encode(database)?;
        self.command(|conn| {
            conn.send_command(Command::InitDb, &body)?;
            conn.read_ok()
        })?;
        self.config.database = Some(database.to_string());
        Ok(())
    }

    /// Ask the server to kill a connection thread.
    pub fn kill(&mut self, thread_id: u32) -> Result<()> {
        self.command(|conn| {
            conn.send_command(Command::ProcessKill, &thread_id.to_le_bytes())?;
            conn.read_ok()
        })
    }

    /// COM_REFRESH with the [`refresh`](crate::protocol::refresh) bits in `options`.
    pub fn refresh(&mut self, options: u8) -> Result<()> {
        self.command(|conn| {
            conn.send_command(Command::Refresh, &[options])?;
            conn.read_ok()
        })
    }

    /// COM_SET_OPTION, e.g. [`set_option::MULTI_STATEMENTS_ON`](crate::protocol::set_option).
    pub fn set_option(&mut self, option: u16) -> Result<()> {
        self.command(|conn| {
            conn.send_command(Command::SetOption, &option.to_le_bytes())?;
            conn.read_ok_or_eof()
        })
    }

    pub fn shutdown(&mut self, level: u8) -> Result<()> {
        self.command(|conn| {
            conn.send_command(Command::Shutdown, &[level])?;
            conn.read_ok_or_eof()
        })
    }

    /// Server status summary as a human-readable string.
    pub fn statistics(&mut self) -> Result<String> {
        self.command(|conn| {
            conn.send_command(Command::Statistics, &[])?;
            let pkt = conn.receive()?;
            conn.charset.decode(pkt.as_bytes())
        })
    }

    /// Column definitions of `table`, optionally filtered by a LIKE pattern.
    pub fn field_list_command(&mut self, table: &str, wildcard: Option<&str>) -> Result<Vec<Field>> {
        let mut body = self.charset.encode(table)?;
        body.push(0);
        if let Some(wildcard) = wildcard {
            body.extend(self.charset.encode(wildcard)?);
        }
        self.command(|conn| {
            conn.send_command(Command::FieldList, &body)?;
            let mut fields = Vec::new();
            loop {
                let mut pkt = conn.receive()?;
                if pkt.is_eof_marker() {
                    let eof = EofPacket::parse(&mut pkt)?;
                    conn.apply_eof(eof);
                    return Ok(fields);
                }
                fields.push(Field::parse(pkt)?);
            }
        })
    }

    /// Start a process list result; rows are read with [`Self::fetch_row`].
    pub fn process_info_command(&mut self) -> Result<Vec<Field>> {
        self.transition(ConnectionState::Ready, ConnectionState::Ready, |conn| {
            conn.send_command(Command::ProcessInfo, &[])?;
            let mut pkt = conn.receive()?;
            let count = pkt.read_lenenc_int_required()?;
            let mut fields = Vec::new();
            for _ in 0..count {
                fields.push(Field::parse(conn.receive()?)?);
            }
            let eof = conn.read_eof()?;
            conn.apply_eof(eof);
            conn.row_format = RowFormat::Text;
            conn.field_count = fields.len();
            conn.set_fields(fields.clone());
            Ok((fields, ConnectionState::Result))
        })
    }

    /// Send COM_QUIT and close the connection.
    pub fn quit(&mut self) -> Result<()> {
        self.check_state(ConnectionState::Ready)?;
        let sent = self.send_command(Command::Quit, &[]);
        self.transport = None;
        debug!(thread_id = self.thread_id, "connection closed");
        sent
    }

    /// Close the connection, saying goodbye to the server when idle.
    pub fn close(&mut self) {
        if self.transport.is_some() && self.state == ConnectionState::Ready {
            if let Err(e) = self.quit() {
                debug!(error = %e, "COM_QUIT failed during close");
            }
        }
        self.transport = None;
    }

    // ==================== Accessors ====================

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    /// Whether traffic is encrypted with TLS.
    pub fn is_encrypted(&self) -> bool {
        self.transport.as_ref().is_some_and(FrameTransport::is_encrypted)
    }

    pub fn config(&self) -> &MySqlConfig {
        &self.config
    }

    /// Server version string from the handshake.
    pub fn server_info(&self) -> &str {
        &self.server_info
    }

    /// Numeric server version, `major * 10000 + minor * 100 + patch`.
    pub fn server_version(&self) -> u32 {
        parse_server_version(&self.server_info)
    }

    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    pub fn server_capabilities(&self) -> u32 {
        self.server_capabilities
    }

    /// Capability flags in effect for this session.
    pub fn client_flags(&self) -> u32 {
        self.client_flags
    }

    pub fn charset(&self) -> Charset {
        self.charset
    }

    pub fn charset_id(&self) -> u8 {
        self.charset_id
    }

    pub fn server_status(&self) -> u16 {
        self.status_flags
    }

    pub fn affected_rows(&self) -> u64 {
        self.affected_rows
    }

    pub fn last_insert_id(&self) -> u64 {
        self.last_insert_id
    }

    pub fn warning_count(&self) -> u16 {
        self.warning_count
    }

    pub fn info(&self) -> &str {
        &self.info
    }

    pub fn session_track(&self) -> Option<&SessionTrack> {
        self.session_track.as_ref()
    }

    /// Column count of the current result set.
    pub fn field_count(&self) -> usize {
        self.field_count
    }

    /// Field definitions of the current result set.
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Replace the source consulted for LOAD DATA LOCAL INFILE requests.
    pub fn set_local_infile_source(&mut self, source: Box<dyn LocalInfileSource>) {
        self.infile_source = source;
    }
}

fn open_stream(config: &MySqlConfig) -> Result<Box<dyn NetStream>> {
    if let Some(path) = &config.socket {
        return open_socket(path, config.connect_timeout);
    }

    let addr = config.socket_addr();
    debug!(addr = %addr, "connecting over tcp");
    Ok(Box::new(transport::connect_tcp(&addr, config.connect_timeout)?))
}

#[cfg(unix)]
fn open_socket(path: &std::path::Path, timeout: Duration) -> Result<Box<dyn NetStream>> {
    debug!(socket = %path.display(), "connecting over unix socket");
    Ok(Box::new(transport::connect_unix(path, timeout)?))
}

#[cfg(not(unix))]
fn open_socket(path: &std::path::Path, _timeout: Duration) -> Result<Box<dyn NetStream>> {
    Err(Error::connection(
        ConnectionErrorKind::Connect,
        format!("unix sockets are not available ({})", path.display()),
    ))
}

/// Resolve a configured connection charset; it must be usable both ways.
fn charset_for(id: u8) -> Result<Charset> {
    Charset::from_id(u16::from(id))
        .filter(|cs| cs.can_encode())
        .ok_or_else(|| {
            Error::client(
                ClientErrorKind::Charset,
                format!("unsupported connection character set id {}", id),
            )
        })
}

fn auth_context<'a>(
    password: &'a str,
    scramble: &'a [u8],
    secure: bool,
    allow_public_key_retrieval: bool,
) -> AuthContext<'a> {
    AuthContext {
        password,
        scramble,
        secure,
        allow_public_key_retrieval,
    }
}

/// Built-in `_client_*` attributes, overridden by the configured ones.
fn connect_attributes(config: &MySqlConfig) -> Vec<(String, String)> {
    let mut attrs = BTreeMap::from([
        ("_client_name".to_string(), "sqlwire".to_string()),
        (
            "_client_version".to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        ),
        ("_os".to_string(), std::env::consts::OS.to_string()),
        ("_pid".to_string(), std::process::id().to_string()),
        ("_platform".to_string(), std::env::consts::ARCH.to_string()),
    ]);
    attrs.extend(
        config
            .attributes
            .iter()
            .map(|(k, v)| (k.clone(), v.clone())),
    );
    attrs.into_iter().collect()
}

fn parse_server_version(info: &str) -> u32 {
    let Some(caps) = VERSION_RE.captures(info) else {
        return 0;
    };
    let part = |i: usize| {
        caps.get(i)
            .and_then(|m| m.as_str().parse::<u32>().ok())
            .unwrap_or(0)
    };
    part(1) * 10000 + part(2) * 100 + part(3)
}

fn not_connected() -> Error {
    Error::client(ClientErrorKind::NotConnected, "connection is closed")
}
