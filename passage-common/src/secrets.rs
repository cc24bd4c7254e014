use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use data_encoding::HEXLOWER_PERMISSIVE;

use crate::helpers::random::random_bytes;

/// Fixed key for secrets at rest. The codec obfuscates credentials in the
/// secret config file; it is not a substitute for file permissions.
const SECRET_KEY: [u8; 32] = *b"\x8f\x3a\x1c\x65\xd2\x07\x49\xbe\x5d\x90\x12\xe4\x7b\xa8\x33\xc6\x0e\x51\xfa\x24\x68\x8d\xb1\x49\x07\xdc\x62\x95\x3e\x70\xab\x1f";

const NONCE_LEN: usize = 12;

#[derive(thiserror::Error, Debug)]
pub enum SecretCodecError {
    #[error("ciphertext is not valid hex")]
    Hex,
    #[error("ciphertext too short")]
    Truncated,
    #[error("decryption failed")]
    Decrypt,
    #[error("encryption failed")]
    Encrypt,
}

/// Encrypts a secret for storage: hex(nonce || AES-256-GCM ciphertext).
pub fn encode_secret(plain: &[u8]) -> Result<String, SecretCodecError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&SECRET_KEY));
    let nonce_bytes: [u8; NONCE_LEN] = random_bytes();
    let nonce = Nonce::from_slice(&nonce_bytes);
    let mut sealed = cipher
        .encrypt(nonce, plain)
        .map_err(|_| SecretCodecError::Encrypt)?;
    let mut out = nonce_bytes.to_vec();
    out.append(&mut sealed);
    Ok(HEXLOWER_PERMISSIVE.encode(&out))
}

/// Reverses [`encode_secret`]. Any malformed input yields a non-fatal error
/// so callers can fall back to a plaintext lookup.
pub fn decode_secret(hexed: &str) -> Result<Vec<u8>, SecretCodecError> {
    let raw = HEXLOWER_PERMISSIVE
        .decode(hexed.trim().as_bytes())
        .map_err(|_| SecretCodecError::Hex)?;
    if raw.len() <= NONCE_LEN {
        return Err(SecretCodecError::Truncated);
    }
    let (nonce_bytes, sealed) = raw.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&SECRET_KEY));
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), sealed)
        .map_err(|_| SecretCodecError::Decrypt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        for plain in [&b""[..], b"p4ssw0rd", b"\x00\xff\x10long secret value"] {
            let encoded = encode_secret(plain).unwrap();
            assert_eq!(decode_secret(&encoded).unwrap(), plain);
        }
    }

    #[test]
    fn test_nonce_varies() {
        assert_ne!(
            encode_secret(b"same").unwrap(),
            encode_secret(b"same").unwrap()
        );
    }

    #[test]
    fn test_garbage_is_nonfatal() {
        assert!(matches!(decode_secret("zzzz"), Err(SecretCodecError::Hex)));
        assert!(matches!(
            decode_secret("00ff"),
            Err(SecretCodecError::Truncated)
        ));
        // valid hex, wrong ciphertext
        let bad = "00".repeat(NONCE_LEN + 17);
        assert!(matches!(
            decode_secret(&bad),
            Err(SecretCodecError::Decrypt)
        ));
    }

    #[test]
    fn test_tamper_detected() {
        let mut encoded = encode_secret(b"integrity");
        let last = encoded.pop().unwrap();
        encoded.push(if last == '0' { '1' } else { '0' });
        assert!(matches!(
            decode_secret(&encoded),
            Err(SecretCodecError::Decrypt)
        ));
    }
}
