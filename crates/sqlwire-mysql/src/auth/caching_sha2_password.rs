//! `caching_sha2_password`, the MySQL 8 default.
//!
//! After the scrambled response the server answers with one status byte
//! inside a "more data" packet:
//!
//! - `0x03` fast auth succeeded; an OK packet follows
//! - `0x04` full authentication is required: send the password over a
//!   secure channel, or request the server's RSA key (`0x02`) and send it
//!   encrypted

use sha2::{Digest, Sha256};
use sqlwire_core::Result;
use tracing::debug;

use super::{
    AuthAction, AuthContext, AuthPlugin, insecure_channel, nul_terminated, rsa_encrypt_password,
    xor_cycle,
};

const FAST_AUTH_SUCCESS: u8 = 0x03;
const PERFORM_FULL_AUTH: u8 = 0x04;
const REQUEST_PUBLIC_KEY: u8 = 0x02;

#[derive(Debug, Clone, Copy)]
pub struct CachingSha2Password;

impl AuthPlugin for CachingSha2Password {
    fn name(&self) -> &'static str {
        "caching_sha2_password"
    }

    fn initial_response(&self, ctx: &AuthContext<'_>) -> Result<Vec<u8>> {
        Ok(scramble_sha256(ctx.password, ctx.scramble))
    }

    fn more_data(&self, data: &[u8], ctx: &AuthContext<'_>) -> Result<AuthAction> {
        match data {
            [FAST_AUTH_SUCCESS] => Ok(AuthAction::ReadNext),
            [PERFORM_FULL_AUTH] => {
                debug!(secure = ctx.secure, "caching_sha2_password full authentication");
                if ctx.secure {
                    Ok(AuthAction::Send(nul_terminated(ctx.password)))
                } else if ctx.allow_public_key_retrieval {
                    Ok(AuthAction::Send(vec![REQUEST_PUBLIC_KEY]))
                } else {
                    Err(insecure_channel())
                }
            }
            // Anything longer is the public key we asked for
            key if ctx.allow_public_key_retrieval && key.len() > 1 => {
                Ok(AuthAction::Send(rsa_encrypt_password(key, ctx)?))
            }
            _ => Err(sqlwire_core::Error::protocol(format!(
                "unexpected caching_sha2_password status ({} bytes)",
                data.len()
            ))),
        }
    }
}

/// SHA256(password) XOR SHA256(SHA256(SHA256(password)) + scramble).
pub(crate) fn scramble_sha256(password: &str, scramble: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let stage1 = Sha256::digest(password.as_bytes());
    let stage2 = Sha256::digest(stage1);

    let mut hasher = Sha256::new();
    hasher.update(stage2);
    hasher.update(scramble);
    let stage3 = hasher.finalize();

    xor_cycle(&stage1, &stage3)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::tests::{TEST_PUBLIC_KEY, ctx, decrypt_password};
    use sqlwire_core::ClientErrorKind;

    #[test]
    fn test_known_vector() {
        let resp = CachingSha2Password
            .initial_response(&ctx("secret", false, false))
            .unwrap();
        let hex: String = resp.iter().map(|b| format!("{:02x}", b)).collect();
        assert_eq!(
            hex,
            "c76e2898612a4cf042c77fa8c4702c4c64c0c2c557c53c4d75595aaa6abae809"
        );
    }

    #[test]
    fn test_fast_auth_success() {
        let action = CachingSha2Password
            .more_data(&[FAST_AUTH_SUCCESS], &ctx("pw", false, false))
            .unwrap();
        assert_eq!(action, AuthAction::ReadNext);
    }

    #[test]
    fn test_full_auth_over_secure_channel() {
        let action = CachingSha2Password
            .more_data(&[PERFORM_FULL_AUTH], &ctx("pw", true, false))
            .unwrap();
        assert_eq!(action, AuthAction::Send(b"pw\0".to_vec()));
    }

    #[test]
    fn test_full_auth_plaintext_refused() {
        let err = CachingSha2Password
            .more_data(&[PERFORM_FULL_AUTH], &ctx("pw", false, false))
            .unwrap_err();
        assert_eq!(err.client_kind(), Some(ClientErrorKind::Unsupported));
        assert!(err.to_string().contains("secure connection"));
    }

    #[test]
    fn test_full_auth_with_key_retrieval() {
        let c = ctx("secret", false, true);
        let action = CachingSha2Password.more_data(&[PERFORM_FULL_AUTH], &c).unwrap();
        assert_eq!(action, AuthAction::Send(vec![REQUEST_PUBLIC_KEY]));

        match CachingSha2Password
            .more_data(TEST_PUBLIC_KEY.as_bytes(), &c)
            .unwrap()
        {
            AuthAction::Send(ct) => assert_eq!(decrypt_password(&ct), b"secret\0"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
