//! `mysql_native_password`.

use sha1::{Digest, Sha1};
use sqlwire_core::Result;

use super::{AuthContext, AuthPlugin, xor_cycle};

/// SHA1(password) XOR SHA1(scramble + SHA1(SHA1(password))).
#[derive(Debug, Clone, Copy)]
pub struct NativePassword;

impl AuthPlugin for NativePassword {
    fn name(&self) -> &'static str {
        "mysql_native_password"
    }

    fn initial_response(&self, ctx: &AuthContext<'_>) -> Result<Vec<u8>> {
        Ok(scramble_password(ctx.password, ctx.scramble))
    }
}

pub(crate) fn scramble_password(password: &str, scramble: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let stage1 = Sha1::digest(password.as_bytes());
    let stage2 = Sha1::digest(stage1);

    let mut hasher = Sha1::new();
    hasher.update(scramble);
    hasher.update(stage2);
    let stage3 = hasher.finalize();

    xor_cycle(&stage1, &stage3)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::tests::{SCRAMBLE, ctx};

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }

    #[test]
    fn test_known_vector() {
        let resp = NativePassword.initial_response(&ctx("secret", false, false)).unwrap();
        assert_eq!(hex(&resp), "8817c50fa779daef010ee7577825b0847df9842e");
    }

    #[test]
    fn test_empty_password() {
        assert!(scramble_password("", SCRAMBLE).is_empty());
    }
}
