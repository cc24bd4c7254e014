use std::path::{Path, PathBuf};

use passage_common::{decode_secret, Secret};
use tracing::*;

use super::ConfigFile;

/// The extended secret config: same syntax as the main config, holding
/// per-host credentials. Values may be stored encrypted under an
/// `enc`-prefixed key.
pub struct SecretStore {
    file: ConfigFile,
}

impl SecretStore {
    pub fn load(path: &Path) -> Self {
        Self {
            file: ConfigFile::load(path),
        }
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".ssh")
            .join("secrets")
    }

    /// Looks up `enc<key>` first and decrypts it; a decryption failure warns
    /// and falls back to the plaintext `key`.
    pub fn get_secret(&self, alias: &str, key: &str) -> Option<Secret<String>> {
        let enc_key = format!("enc{key}");
        if let Some(ciphertext) = self.file.first(alias, &enc_key) {
            match decode_secret(ciphertext) {
                Ok(plain) => match String::from_utf8(plain) {
                    Ok(text) => return Some(Secret::new(text)),
                    Err(_) => {
                        warn!(%alias, key = %enc_key, "decrypted secret is not valid UTF-8");
                    }
                },
                Err(error) => {
                    warn!(%alias, key = %enc_key, %error, "cannot decrypt secret, falling back to plaintext");
                }
            }
        }
        self.file
            .first(alias, key)
            .map(|v| Secret::new(v.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use passage_common::encode_secret;

    use super::*;

    fn store(content: &str) -> SecretStore {
        let mut file = ConfigFile::default();
        file.parse_into(content, None, &mut HashSet::new());
        SecretStore { file }
    }

    #[test]
    fn test_plaintext_lookup() {
        let store = store("Host web\n  Password hunter2\n");
        assert_eq!(
            store
                .get_secret("web", "Password")
                .unwrap()
                .expose_secret(),
            "hunter2"
        );
        assert!(store.get_secret("other", "Password").is_none());
    }

    #[test]
    fn test_encrypted_wins() {
        let encoded = encode_secret(b"s3cret").unwrap();
        let store = store(&format!(
            "Host web\n  encPassword {encoded}\n  Password plain\n"
        ));
        assert_eq!(
            store
                .get_secret("web", "Password")
                .unwrap()
                .expose_secret(),
            "s3cret"
        );
    }

    #[test]
    fn test_bad_ciphertext_falls_back() {
        let store = store("Host web\n  encPassword nothex\n  Password plain\n");
        assert_eq!(
            store
                .get_secret("web", "Password")
                .unwrap()
                .expose_secret(),
            "plain"
        );
    }
}
