use std::time::SystemTime;

use totp_rs::{Algorithm, Secret as TotpSecret, TOTP};

use crate::types::Secret;

/// Computes the current six-digit TOTP code for a base32-encoded secret, the
/// way an authenticator app would.
pub fn totp_code(secret_base32: &Secret<String>) -> anyhow::Result<Secret<String>> {
    let key = TotpSecret::Encoded(secret_base32.expose_secret().trim().to_owned())
        .to_bytes()
        .map_err(|e| anyhow::anyhow!("invalid TOTP secret: {e:?}"))?;
    let totp = TOTP {
        algorithm: Algorithm::SHA1,
        digits: 6,
        skew: 1,
        step: 30,
        secret: key,
        issuer: None,
        account_name: String::new(),
    };
    let time = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)?
        .as_secs();
    Ok(Secret::new(totp.generate(time)))
}
