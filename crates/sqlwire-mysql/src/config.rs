//! MySQL connection configuration.
//!
//! Everything the engine needs to open, secure and authenticate a
//! connection. The struct is a builder and also (de)serializable, so
//! applications can keep it in a JSON or TOML file.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::capabilities;

/// Certificates and verification knobs for the TLS upgrade.
///
/// Only consulted when the crate is built with the `tls` feature.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// PEM bundle of trusted CAs. Used by `SslMode::VerifyCa` and `SslMode::VerifyIdentity`; without it
    /// the bundled web PKI roots are trusted.
    pub ca_cert_path: Option<PathBuf>,

    /// PEM client certificate chain, sent when the server asks for one.
    pub client_cert_path: Option<PathBuf>,

    /// PEM private key matching `client_cert_path`.
    pub client_key_path: Option<PathBuf>,

    /// Skip server certificate verification even in the verifying modes.
    ///
    /// # Security Warning
    /// Makes the connection vulnerable to man-in-the-middle attacks.
    pub danger_skip_verify: bool,

    /// Server name for SNI. Defaults to the connection hostname.
    pub server_name: Option<String>,
}

impl TlsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_path = Some(path.into());
        self
    }

    pub fn client_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.client_cert_path = Some(path.into());
        self
    }

    pub fn client_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.client_key_path = Some(path.into());
        self
    }

    /// Accept any server certificate.
    pub fn skip_verify(mut self, skip: bool) -> Self {
        self.danger_skip_verify = skip;
        self
    }

    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }
}

/// When to upgrade the connection to TLS and how much to verify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SslMode {
    /// Stay in plaintext
    #[default]
    Disable,
    /// Use SSL when both sides support it, except over a Unix socket
    Preferred,
    /// Encrypt, fail if the server cannot; no certificate checks
    Required,
    /// Require SSL and verify the server certificate chain
    VerifyCa,
    /// Require SSL and verify the certificate matches the hostname
    VerifyIdentity,
}

impl SslMode {
    /// Whether an upgrade may happen at all.
    pub const fn should_try_ssl(self) -> bool {
        !matches!(self, SslMode::Disable)
    }

    /// Whether the server certificate must be verified.
    pub const fn verifies_certificate(self) -> bool {
        matches!(self, SslMode::VerifyCa | SslMode::VerifyIdentity)
    }
}

/// Settings for one client connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MySqlConfig {
    /// Server host name or address
    pub host: String,
    /// TCP port, 3306 unless set
    pub port: u16,
    /// Unix-domain socket path; takes precedence over host/port
    pub socket: Option<PathBuf>,
    /// Account name
    pub user: String,
    /// Account password; never written out when serializing
    #[serde(skip_serializing)]
    pub password: Option<String>,
    /// Default schema selected during the handshake
    pub database: Option<String>,
    /// Character set id; `None` adopts the server's default when supported
    pub charset: Option<u8>,
    /// Bound on TCP/Unix connect plus the handshake
    pub connect_timeout: Duration,
    /// Bound on every receive; `None` waits indefinitely
    pub read_timeout: Option<Duration>,
    /// Bound on every send; `None` waits indefinitely
    pub write_timeout: Option<Duration>,
    pub ssl_mode: SslMode,
    pub tls_config: TlsConfig,
    /// Extra client capability flags requested on top of the defaults
    pub flags: u32,
    /// Connection attributes sent next to the built-in `_client_*` ones
    pub attributes: BTreeMap<String, String>,
    /// Serve any file the server asks for in LOAD DATA LOCAL INFILE
    pub local_infile: bool,
    /// Serve only files inside this directory
    pub local_infile_dir: Option<PathBuf>,
    /// Allow fetching the server's RSA key for full authentication over
    /// an unencrypted channel
    pub allow_public_key_retrieval: bool,
    /// Max allowed packet size announced to the server (default: 64MB)
    pub max_packet_size: u32,
}

impl Default for MySqlConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3306,
            socket: None,
            user: String::new(),
            password: None,
            database: None,
            charset: None,
            connect_timeout: Duration::from_secs(30),
            read_timeout: None,
            write_timeout: None,
            ssl_mode: SslMode::default(),
            tls_config: TlsConfig::default(),
            flags: 0,
            attributes: BTreeMap::new(),
            local_infile: false,
            local_infile_dir: None,
            allow_public_key_retrieval: false,
            max_packet_size: 64 * 1024 * 1024,
        }
    }
}

impl MySqlConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a configuration from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Connect through a Unix-domain socket.
    pub fn socket(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket = Some(path.into());
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Set the character set id (see [`crate::protocol::charset`]).
    pub fn charset(mut self, charset: u8) -> Self {
        self.charset = Some(charset);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }

    pub fn ssl_mode(mut self, mode: SslMode) -> Self {
        self.ssl_mode = mode;
        self
    }

    pub fn tls_config(mut self, config: TlsConfig) -> Self {
        self.tls_config = config;
        self
    }

    /// Shorthand for `tls_config.ca_cert_path`.
    pub fn ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.tls_config.ca_cert_path = Some(path.into());
        self
    }

    /// Present this certificate and key if the server requests one.
    pub fn client_cert(
        mut self,
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
    ) -> Self {
        self.tls_config.client_cert_path = Some(cert_path.into());
        self.tls_config.client_key_path = Some(key_path.into());
        self
    }

    /// Request additional capability flags.
    pub fn flags(mut self, flags: u32) -> Self {
        self.flags |= flags;
        self
    }

    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Enable or disable local infile handling for any path.
    ///
    /// # Security Warning
    /// The server picks the file name. Only enable this for servers you
    /// trust; prefer [`MySqlConfig::local_infile_dir`].
    pub fn local_infile(mut self, enabled: bool) -> Self {
        self.local_infile = enabled;
        self
    }

    /// Allow local infile only for files under `dir`.
    pub fn local_infile_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.local_infile_dir = Some(dir.into());
        self
    }

    pub fn allow_public_key_retrieval(mut self, allow: bool) -> Self {
        self.allow_public_key_retrieval = allow;
        self
    }

    pub fn max_packet_size(mut self, size: u32) -> Self {
        self.max_packet_size = size;
        self
    }

    /// `host:port` for the TCP connect.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Whether LOAD DATA LOCAL INFILE may be served at all.
    pub fn local_infile_enabled(&self) -> bool {
        self.local_infile || self.local_infile_dir.is_some()
    }

    /// Build the capability flags the client wants.
    ///
    /// The connection intersects these with what the server advertises.
    pub fn capability_flags(&self) -> u32 {
        use capabilities::{CLIENT_CONNECT_WITH_DB, CLIENT_LOCAL_FILES, DEFAULT_CLIENT_FLAGS};

        let mut flags = DEFAULT_CLIENT_FLAGS | self.flags;

        if self.database.is_some() {
            flags |= CLIENT_CONNECT_WITH_DB;
        }

        if self.local_infile_enabled() {
            flags |= CLIENT_LOCAL_FILES;
        }

        flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::capabilities::*;

    #[test]
    fn test_defaults() {
        let config = MySqlConfig::default();

        assert_eq!(config.socket_addr(), "localhost:3306");
        assert_eq!(config.socket, None);
        assert_eq!(config.charset, None);
        assert_eq!(config.read_timeout, None);
        assert_eq!(config.ssl_mode, SslMode::Disable);
        assert!(!config.local_infile_enabled());
        assert!(!config.allow_public_key_retrieval);
        assert_eq!(config.max_packet_size, 64 * 1024 * 1024);
    }

    #[test]
    fn test_builder_chain() {
        let config = MySqlConfig::new()
            .host("10.1.2.3")
            .port(3307)
            .socket("/run/mysqld/mysqld.sock")
            .user("reporter")
            .password("pw")
            .charset(crate::protocol::charset::UTF8MB4_GENERAL_CI)
            .write_timeout(Duration::from_millis(250))
            .client_cert("client.pem", "client-key.pem")
            .attribute("program_name", "nightly-export")
            .allow_public_key_retrieval(true);

        assert_eq!(config.socket_addr(), "10.1.2.3:3307");
        assert_eq!(config.socket, Some(PathBuf::from("/run/mysqld/mysqld.sock")));
        assert_eq!(config.user, "reporter");
        assert_eq!(config.charset, Some(45));
        assert_eq!(config.write_timeout, Some(Duration::from_millis(250)));
        assert_eq!(
            config.tls_config.client_key_path,
            Some(PathBuf::from("client-key.pem"))
        );
        assert_eq!(config.attributes["program_name"], "nightly-export");
        assert!(config.allow_public_key_retrieval);
    }

    #[test]
    fn test_ssl_modes() {
        assert!(!SslMode::Disable.should_try_ssl());
        assert!(SslMode::Preferred.should_try_ssl());
        assert!(!SslMode::Preferred.verifies_certificate());
        assert!(!SslMode::Required.verifies_certificate());
        assert!(SslMode::VerifyCa.verifies_certificate());
        assert!(SslMode::VerifyIdentity.verifies_certificate());
    }

    #[test]
    fn test_requested_flags() {
        let flags = MySqlConfig::new().capability_flags();
        assert_eq!(flags & DEFAULT_CLIENT_FLAGS, DEFAULT_CLIENT_FLAGS);
        assert_eq!(flags & (CLIENT_CONNECT_WITH_DB | CLIENT_LOCAL_FILES | CLIENT_SSL), 0);

        let flags = MySqlConfig::new()
            .database("shop")
            .flags(CLIENT_MULTI_STATEMENTS)
            .capability_flags();
        assert_ne!(flags & CLIENT_CONNECT_WITH_DB, 0);
        assert_ne!(flags & CLIENT_MULTI_STATEMENTS, 0);
    }

    #[test]
    fn test_infile_policy_requests_local_files() {
        let dir_only = MySqlConfig::new().local_infile_dir("/var/lib/imports");
        assert!(dir_only.local_infile_enabled());
        assert_ne!(dir_only.capability_flags() & CLIENT_LOCAL_FILES, 0);

        let any = MySqlConfig::new().local_infile(true);
        assert_ne!(any.capability_flags() & CLIENT_LOCAL_FILES, 0);
    }

    #[test]
    fn test_from_json() {
        let config = MySqlConfig::from_json(
            r#"{
                "host": "10.0.0.5",
                "user": "app",
                "password": "pw",
                "ssl_mode": "verify_identity",
                "read_timeout": { "secs": 3, "nanos": 0 },
                "local_infile_dir": "/srv/imports",
                "tls_config": { "ca_cert_path": "/etc/mysql/ca.pem", "server_name": "db.internal" }
            }"#,
        )
        .unwrap();

        assert_eq!(config.port, 3306);
        assert_eq!(config.password.as_deref(), Some("pw"));
        assert_eq!(config.ssl_mode, SslMode::VerifyIdentity);
        assert_eq!(config.read_timeout, Some(Duration::from_secs(3)));
        assert_eq!(config.local_infile_dir, Some(PathBuf::from("/srv/imports")));
        assert_eq!(config.tls_config.server_name.as_deref(), Some("db.internal"));
        assert!(!config.tls_config.danger_skip_verify);
    }

    #[test]
    fn test_from_json_rejects_unknown_ssl_mode() {
        assert!(MySqlConfig::from_json(r#"{ "ssl_mode": "sometimes" }"#).is_err());
    }

    #[test]
    fn test_password_not_serialized() {
        let json = serde_json::to_string(&MySqlConfig::new().password("hunter2")).unwrap();
        assert!(!json.contains("hunter2"));
    }
}
