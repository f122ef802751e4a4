//! TLS/SSL support for MySQL connections.
//!
//! # MySQL TLS Handshake Flow
//!
//! 1. Server sends initial handshake with `CLIENT_SSL` capability
//! 2. If SSL is requested, client sends short SSL request packet:
//!    - 4 bytes: capability flags (with `CLIENT_SSL`)
//!    - 4 bytes: max packet size
//!    - 1 byte: character set
//!    - 23 bytes: reserved (zeros)
//! 3. Client performs TLS handshake on the same socket
//! 4. Client sends full handshake response over TLS; packet sequence
//!    numbering continues where the SSL request left it
//! 5. Server sends auth result over TLS
//!
//! The TLS session itself is provided by `rustls` behind the `tls` feature.
//! Without the feature, `Preferred` silently stays in plaintext and the
//! other modes fail at connect time.
//!
//! # Verification
//!
//! | mode             | chain checked | hostname checked |
//! |------------------|---------------|------------------|
//! | `Preferred`      | no            | no               |
//! | `Required`       | no            | no               |
//! | `VerifyCa`       | yes           | no               |
//! | `VerifyIdentity` | yes           | yes              |
//!
//! The chain is checked against `TlsConfig::ca_cert_path` when set, else
//! against the bundled web PKI roots.

#[cfg(not(feature = "tls"))]
use std::time::Instant;

use sqlwire_core::Error;
use sqlwire_core::error::{ConnectionError, ConnectionErrorKind};

use crate::config::{SslMode, TlsConfig};
use crate::protocol::capabilities;
#[cfg(not(feature = "tls"))]
use crate::transport::NetStream;

/// Check if the server supports SSL/TLS.
pub const fn server_supports_ssl(server_caps: u32) -> bool {
    server_caps & capabilities::CLIENT_SSL != 0
}

/// Decide whether to upgrade the connection.
///
/// # Returns
///
/// - `Ok(true)` if SSL should be used
/// - `Ok(false)` if SSL should not be used
/// - `Err(_)` if SSL is required but cannot be used
pub fn validate_ssl_mode(
    ssl_mode: SslMode,
    server_caps: u32,
    local_socket: bool,
) -> Result<bool, Error> {
    let server_supports = server_supports_ssl(server_caps);

    match ssl_mode {
        SslMode::Disable => Ok(false),
        SslMode::Preferred => Ok(server_supports && !local_socket && cfg!(feature = "tls")),
        SslMode::Required | SslMode::VerifyCa | SslMode::VerifyIdentity => {
            if !server_supports {
                Err(tls_error("SSL required but server does not support it"))
            } else if !cfg!(feature = "tls") {
                Err(tls_error(
                    "SSL required but TLS support is not compiled in; enable the 'tls' feature",
                ))
            } else {
                Ok(true)
            }
        }
    }
}

/// Validate TLS configuration for the given SSL mode.
pub fn validate_tls_config(ssl_mode: SslMode, tls_config: &TlsConfig) -> Result<(), Error> {
    if !ssl_mode.should_try_ssl() {
        return Ok(());
    }

    if tls_config.client_cert_path.is_some() != tls_config.client_key_path.is_some() {
        return Err(tls_error(
            "Client certificate and client key must be set together for mutual TLS.",
        ));
    }

    Ok(())
}

/// Create a TLS-related connection error.
fn tls_error(message: impl Into<String>) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Ssl,
        message: message.into(),
        source: None,
    })
}

/// Wrap `stream` in a TLS session and complete the TLS handshake.
#[cfg(not(feature = "tls"))]
pub fn connect_tls(
    _stream: Box<dyn NetStream>,
    _ssl_mode: SslMode,
    _tls_config: &TlsConfig,
    _server_name: &str,
    _deadline: Option<Instant>,
) -> Result<Box<dyn NetStream>, Error> {
    Err(tls_error(
        "TLS support requires the 'tls' feature of sqlwire-mysql",
    ))
}

#[cfg(feature = "tls")]
pub use rustls_impl::{TlsStream, connect_tls};

#[cfg(feature = "tls")]
mod rustls_impl {
    use std::fmt;
    use std::fs::File;
    use std::io::{self, BufReader, ErrorKind, Read, Write};
    use std::path::Path;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use rustls::client::WebPkiServerVerifier;
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::crypto::CryptoProvider;
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
    use rustls::{
        CertificateError, ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore,
        SignatureScheme, StreamOwned,
    };
    use sqlwire_core::Error;
    use sqlwire_core::error::{ConnectionError, ConnectionErrorKind};
    use tracing::debug;

    use super::tls_error;
    use crate::config::{SslMode, TlsConfig};
    use crate::transport::{NetStream, time_left};

    /// A stream encrypted with rustls.
    pub struct TlsStream {
        inner: StreamOwned<ClientConnection, Box<dyn NetStream>>,
    }

    impl Read for TlsStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.inner.read(buf)
        }
    }

    impl Write for TlsStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.inner.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            self.inner.flush()
        }
    }

    impl NetStream for TlsStream {
        fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
            self.inner.sock.set_read_timeout(timeout)
        }

        fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
            self.inner.sock.set_write_timeout(timeout)
        }

        fn is_local(&self) -> bool {
            self.inner.sock.is_local()
        }

        fn is_encrypted(&self) -> bool {
            true
        }
    }

    impl fmt::Debug for TlsStream {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("TlsStream")
                .field("sock", &self.inner.sock)
                .field("protocol", &self.inner.conn.protocol_version())
                .finish_non_exhaustive()
        }
    }

    pub fn connect_tls(
        mut stream: Box<dyn NetStream>,
        ssl_mode: SslMode,
        tls_config: &TlsConfig,
        server_name: &str,
        deadline: Option<Instant>,
    ) -> Result<Box<dyn NetStream>, Error> {
        let config = build_client_config(ssl_mode, tls_config)?;
        let name = tls_config.server_name.as_deref().unwrap_or(server_name);
        let server_name = ServerName::try_from(name.to_string())
            .map_err(|e| tls_error(format!("Invalid TLS server name '{}': {}", name, e)))?;

        let mut conn = ClientConnection::new(Arc::new(config), server_name)
            .map_err(|e| tls_error(format!("Failed to start TLS session: {}", e)))?;

        while conn.is_handshaking() {
            let left = match deadline {
                None => None,
                Some(deadline) => Some(time_left(deadline).ok_or_else(|| {
                    Error::connection(
                        ConnectionErrorKind::ConnectTimeout,
                        "Timed out during TLS handshake",
                    )
                })?),
            };
            stream
                .set_read_timeout(left)
                .and_then(|()| stream.set_write_timeout(left))
                .map_err(|e| tls_io_error("socket error", e))?;
            match conn.complete_io(&mut stream) {
                Ok(_) => {}
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                    ) => {}
                Err(e) => return Err(tls_io_error("TLS handshake failed", e)),
            }
        }

        debug!(
            protocol = ?conn.protocol_version(),
            cipher = ?conn.negotiated_cipher_suite().map(|s| s.suite()),
            "TLS established"
        );

        Ok(Box::new(TlsStream {
            inner: StreamOwned::new(conn, stream),
        }))
    }

    fn build_client_config(ssl_mode: SslMode, tls_config: &TlsConfig) -> Result<ClientConfig, Error> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| tls_error(format!("Invalid TLS protocol versions: {}", e)))?;

        let builder = if !ssl_mode.verifies_certificate() || tls_config.danger_skip_verify {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerify(provider)))
        } else {
            let roots = Arc::new(root_store(tls_config)?);
            let webpki = WebPkiServerVerifier::builder_with_provider(roots, provider)
                .build()
                .map_err(|e| tls_error(format!("Failed to build certificate verifier: {}", e)))?;
            if ssl_mode == SslMode::VerifyCa {
                builder
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(ChainOnly(webpki)))
            } else {
                builder.with_webpki_verifier(webpki)
            }
        };

        match (&tls_config.client_cert_path, &tls_config.client_key_path) {
            (Some(cert), Some(key)) => {
                let certs = load_certs(cert)?;
                let key = load_key(key)?;
                builder
                    .with_client_auth_cert(certs, key)
                    .map_err(|e| tls_error(format!("Invalid client certificate: {}", e)))
            }
            _ => Ok(builder.with_no_client_auth()),
        }
    }

    fn root_store(tls_config: &TlsConfig) -> Result<RootCertStore, Error> {
        let mut roots = RootCertStore::empty();
        match &tls_config.ca_cert_path {
            Some(path) => {
                for cert in load_certs(path)? {
                    roots
                        .add(cert)
                        .map_err(|e| tls_error(format!("Invalid CA certificate: {}", e)))?;
                }
            }
            None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
        }
        Ok(roots)
    }

    fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, Error> {
        let file = File::open(path)
            .map_err(|e| tls_io_error(format!("Failed to open {}", path.display()), e))?;
        let certs = rustls_pemfile::certs(&mut BufReader::new(file))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| tls_io_error(format!("Failed to read {}", path.display()), e))?;
        if certs.is_empty() {
            return Err(tls_error(format!(
                "No certificates found in {}",
                path.display()
            )));
        }
        Ok(certs)
    }

    fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, Error> {
        let file = File::open(path)
            .map_err(|e| tls_io_error(format!("Failed to open {}", path.display()), e))?;
        rustls_pemfile::private_key(&mut BufReader::new(file))
            .map_err(|e| tls_io_error(format!("Failed to read {}", path.display()), e))?
            .ok_or_else(|| tls_error(format!("No private key found in {}", path.display())))
    }

    fn tls_io_error(message: impl Into<String>, source: io::Error) -> Error {
        Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Ssl,
            message: format!("{}: {}", message.into(), source),
            source: Some(Box::new(source)),
        })
    }

    /// Accepts any server certificate (`Preferred`, `Required`).
    #[derive(Debug)]
    struct NoVerify(Arc<CryptoProvider>);

    impl ServerCertVerifier for NoVerify {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls12_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls13_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }

    /// Verifies the chain but not the hostname (`VerifyCa`).
    #[derive(Debug)]
    struct ChainOnly(Arc<WebPkiServerVerifier>);

    impl ServerCertVerifier for ChainOnly {
        fn verify_server_cert(
            &self,
            end_entity: &CertificateDer<'_>,
            intermediates: &[CertificateDer<'_>],
            server_name: &ServerName<'_>,
            ocsp_response: &[u8],
            now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            match self.0.verify_server_cert(
                end_entity,
                intermediates,
                server_name,
                ocsp_response,
                now,
            ) {
                Err(rustls::Error::InvalidCertificate(CertificateError::NotValidForName)) => {
                    Ok(ServerCertVerified::assertion())
                }
                other => other,
            }
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            self.0.verify_tls12_signature(message, cert, dss)
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            self.0.verify_tls13_signature(message, cert, dss)
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.0.supported_verify_schemes()
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_client_config_for_each_mode() {
            let tls = TlsConfig::new();
            for mode in [
                SslMode::Preferred,
                SslMode::Required,
                SslMode::VerifyCa,
                SslMode::VerifyIdentity,
            ] {
                assert!(build_client_config(mode, &tls).is_ok(), "{:?}", mode);
            }
        }

        #[test]
        fn test_missing_ca_file() {
            let tls = TlsConfig::new().ca_cert("/nonexistent/ca.pem");
            let err = build_client_config(SslMode::VerifyCa, &tls).unwrap_err();
            assert_eq!(err.connection_kind(), Some(ConnectionErrorKind::Ssl));
        }

        #[test]
        fn test_ca_file_without_certificates() {
            let file = tempfile::NamedTempFile::new().unwrap();
            let tls = TlsConfig::new().ca_cert(file.path());
            assert!(build_client_config(SslMode::VerifyIdentity, &tls).is_err());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_supports_ssl() {
        assert!(server_supports_ssl(capabilities::CLIENT_SSL));
        assert!(server_supports_ssl(
            capabilities::CLIENT_SSL | capabilities::CLIENT_PROTOCOL_41
        ));
        assert!(!server_supports_ssl(0));
        assert!(!server_supports_ssl(capabilities::CLIENT_PROTOCOL_41));
    }

    #[test]
    fn test_validate_ssl_mode_disable() {
        assert!(!validate_ssl_mode(SslMode::Disable, 0, false).unwrap());
        assert!(!validate_ssl_mode(SslMode::Disable, capabilities::CLIENT_SSL, false).unwrap());
    }

    #[test]
    fn test_validate_ssl_mode_preferred() {
        assert!(!validate_ssl_mode(SslMode::Preferred, 0, false).unwrap());
        assert_eq!(
            validate_ssl_mode(SslMode::Preferred, capabilities::CLIENT_SSL, false).unwrap(),
            cfg!(feature = "tls")
        );
        // Never over a local socket
        assert!(!validate_ssl_mode(SslMode::Preferred, capabilities::CLIENT_SSL, true).unwrap());
    }

    #[test]
    fn test_validate_ssl_mode_required() {
        let err = validate_ssl_mode(SslMode::Required, 0, false).unwrap_err();
        assert_eq!(err.connection_kind(), Some(ConnectionErrorKind::Ssl));
        assert!(validate_ssl_mode(SslMode::VerifyCa, 0, false).is_err());
        assert!(validate_ssl_mode(SslMode::VerifyIdentity, 0, true).is_err());

        let with_ssl = validate_ssl_mode(SslMode::Required, capabilities::CLIENT_SSL, true);
        assert_eq!(with_ssl.is_ok(), cfg!(feature = "tls"));
    }

    #[test]
    fn test_validate_tls_config_client_cert() {
        let config = TlsConfig::new().client_cert("/path/to/client.pem");
        assert!(validate_tls_config(SslMode::VerifyCa, &config).is_err());
        assert!(validate_tls_config(SslMode::Disable, &config).is_ok());

        let config = config.client_key("/path/to/client-key.pem");
        assert!(validate_tls_config(SslMode::VerifyCa, &config).is_ok());
        assert!(validate_tls_config(SslMode::Required, &TlsConfig::new()).is_ok());
    }
}
