//! Authentication plugins.
//!
//! The server names a plugin in its handshake (and may switch to another
//! mid-way). Each plugin produces the first response from the password and
//! the scramble, and reacts to any extra data the server sends before the
//! final OK.
//!
//! Supported plugins:
//! - `mysql_native_password`: SHA-1 scramble, single round trip
//! - `caching_sha2_password`: SHA-256 scramble plus fast/full auth
//! - `sha256_password`: RSA-encrypted or TLS-protected password
//! - `mysql_clear_password`: plain password, secure channels only
//!
//! Unknown plugin names get an empty response, leaving the server free to
//! switch to a plugin this client understands.

mod caching_sha2_password;
mod native_password;
mod sha256_password;

pub use caching_sha2_password::CachingSha2Password;
pub use native_password::NativePassword;
pub use sha256_password::Sha256Password;

use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Oaep, RsaPublicKey};
use sqlwire_core::{ClientErrorKind, Error, Result};

/// Inputs every plugin may draw on.
#[derive(Debug, Clone, Copy)]
pub struct AuthContext<'a> {
    pub password: &'a str,
    pub scramble: &'a [u8],
    /// The channel is encrypted or never leaves the host
    pub secure: bool,
    pub allow_public_key_retrieval: bool,
}

/// What to do after the server sent plugin-specific data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthAction {
    /// Send this payload and keep reading
    Send(Vec<u8>),
    /// Nothing to send; the next packet finishes authentication
    ReadNext,
}

/// An authentication strategy selected by plugin name.
pub trait AuthPlugin: Send + Sync {
    fn name(&self) -> &'static str;

    /// Response to the handshake (or to an auth switch request).
    fn initial_response(&self, ctx: &AuthContext<'_>) -> Result<Vec<u8>>;

    /// React to a 0x01-prefixed "more data" packet.
    fn more_data(&self, data: &[u8], _ctx: &AuthContext<'_>) -> Result<AuthAction> {
        Err(Error::protocol(format!(
            "unexpected authentication data for {} ({} bytes)",
            self.name(),
            data.len()
        )))
    }
}

/// `mysql_clear_password`: the password itself, NUL-terminated.
#[derive(Debug, Clone, Copy)]
pub struct ClearPassword;

impl AuthPlugin for ClearPassword {
    fn name(&self) -> &'static str {
        "mysql_clear_password"
    }

    fn initial_response(&self, ctx: &AuthContext<'_>) -> Result<Vec<u8>> {
        if !ctx.secure {
            return Err(insecure_channel());
        }
        Ok(nul_terminated(ctx.password))
    }
}

/// Fallback for plugin names this client does not know.
#[derive(Debug, Clone, Copy)]
pub struct NoopPlugin;

impl AuthPlugin for NoopPlugin {
    fn name(&self) -> &'static str {
        ""
    }

    fn initial_response(&self, _ctx: &AuthContext<'_>) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }
}

static PLUGINS: &[&dyn AuthPlugin] = &[
    &NativePassword,
    &CachingSha2Password,
    &Sha256Password,
    &ClearPassword,
];

/// Look up a plugin by name.
pub fn plugin_for(name: &str) -> &'static dyn AuthPlugin {
    PLUGINS
        .iter()
        .copied()
        .find(|p| p.name() == name)
        .unwrap_or(&NoopPlugin)
}

/// `a XOR b`, cycling `b`.
pub(crate) fn xor_cycle(a: &[u8], b: &[u8]) -> Vec<u8> {
    if b.is_empty() {
        return a.to_vec();
    }
    a.iter()
        .zip(b.iter().cycle())
        .map(|(x, y)| x ^ y)
        .collect()
}

pub(crate) fn nul_terminated(password: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(password.len() + 1);
    out.extend_from_slice(password.as_bytes());
    out.push(0);
    out
}

/// Encrypt the password for full authentication over plaintext.
///
/// The NUL-terminated password is XOR-ed with the scramble, then encrypted
/// with RSA-OAEP (SHA-1) under the server's public key.
pub(crate) fn rsa_encrypt_password(key_data: &[u8], ctx: &AuthContext<'_>) -> Result<Vec<u8>> {
    let key = parse_public_key(key_data)?;
    let message = xor_cycle(&nul_terminated(ctx.password), ctx.scramble);
    key.encrypt(&mut rand::thread_rng(), Oaep::new::<sha1::Sha1>(), &message)
        .map_err(|e| auth_error(format!("RSA encryption failed: {}", e)))
}

fn parse_public_key(data: &[u8]) -> Result<RsaPublicKey> {
    let pem = std::str::from_utf8(data)
        .ok()
        .map(|s| s.trim_end_matches('\0').trim());
    let parsed = match pem {
        Some(pem) if pem.starts_with("-----BEGIN RSA PUBLIC KEY") => {
            RsaPublicKey::from_pkcs1_pem(pem).map_err(|e| e.to_string())
        }
        Some(pem) if pem.starts_with("-----BEGIN") => {
            RsaPublicKey::from_public_key_pem(pem).map_err(|e| e.to_string())
        }
        _ => RsaPublicKey::from_public_key_der(data).map_err(|e| e.to_string()),
    };
    parsed.map_err(|e| auth_error(format!("invalid server public key: {}", e)))
}

pub(crate) fn insecure_channel() -> Error {
    Error::client(
        ClientErrorKind::Unsupported,
        "authentication requires secure connection",
    )
}

fn auth_error(message: String) -> Error {
    Error::connection(
        sqlwire_core::ConnectionErrorKind::Authentication,
        message,
    )
}
