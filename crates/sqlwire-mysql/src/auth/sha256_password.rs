//! `sha256_password`.
//!
//! Always performs full authentication: over a secure channel the password
//! is sent as is; otherwise the client asks for the server's RSA key
//! (`0x01`) and sends the password encrypted under it.

use sqlwire_core::Result;

use super::{
    AuthAction, AuthContext, AuthPlugin, insecure_channel, nul_terminated, rsa_encrypt_password,
};

const REQUEST_PUBLIC_KEY: u8 = 0x01;

#[derive(Debug, Clone, Copy)]
pub struct Sha256Password;

impl AuthPlugin for Sha256Password {
    fn name(&self) -> &'static str {
        "sha256_password"
    }

    fn initial_response(&self, ctx: &AuthContext<'_>) -> Result<Vec<u8>> {
        if ctx.password.is_empty() {
            return Ok(vec![0]);
        }
        if ctx.secure {
            Ok(nul_terminated(ctx.password))
        } else if ctx.allow_public_key_retrieval {
            Ok(vec![REQUEST_PUBLIC_KEY])
        } else {
            Err(insecure_channel())
        }
    }

    fn more_data(&self, data: &[u8], ctx: &AuthContext<'_>) -> Result<AuthAction> {
        Ok(AuthAction::Send(rsa_encrypt_password(data, ctx)?))
    }
}
