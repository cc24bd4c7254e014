//! OpenSSH known_hosts handling: file lookup (plain and hashed entries),
//! the session-scoped acceptance set, and trust-on-first-use write-back.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use data_encoding::BASE64;
use hmac::{Hmac, Mac};
use passage_core::config::{expand_tilde, pattern_matches};
use passage_core::tokens::{TokenExpander, PATH_TOKENS};
use passage_core::{LoginParam, Services};
use russh::keys::ssh_key::public::KeyData;
use russh::keys::{HashAlg, PublicKey};
use sha1::Sha1;
use tracing::*;

pub enum KnownHostValidationResult {
    Valid,
    Invalid {
        key_type: String,
        fingerprint: String,
    },
    Unknown,
}

pub struct KnownHosts {
    /// Readable files, the writable primary first.
    files: Vec<PathBuf>,
    primary: PathBuf,
    /// Keys accepted during this session; a later mismatch for the same
    /// host is fatal.
    session: Mutex<HashMap<String, KeyData>>,
}

impl KnownHosts {
    pub fn load(services: &Services, param: &LoginParam) -> Self {
        let expander = TokenExpander::new(param);
        let mut files = Vec::new();
        let mut primary = None;

        let user_files = services
            .config
            .get_splits(&param.alias, "UserKnownHostsFile");
        for raw in &user_files {
            let path = match expander.expand(raw, PATH_TOKENS) {
                Ok(path) => PathBuf::from(expand_tilde(&path)),
                Err(error) => {
                    warn!(%raw, %error, "cannot expand known-hosts path");
                    continue;
                }
            };
            if primary.is_none() {
                primary = Some(path.clone());
            }
            files.push(path);
        }
        for raw in services
            .config
            .get_splits(&param.alias, "GlobalKnownHostsFile")
        {
            files.push(PathBuf::from(expand_tilde(&raw)));
        }

        let primary = primary.unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".ssh")
                .join("known_hosts")
        });
        Self {
            files,
            primary,
            session: Mutex::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    fn for_files(files: Vec<PathBuf>, primary: PathBuf) -> Self {
        Self {
            files,
            primary,
            session: Mutex::new(HashMap::new()),
        }
    }

    pub fn validate(&self, host: &str, port: u16, key: &PublicKey) -> KnownHostValidationResult {
        let token = host_token(host, port);

        if let Ok(session) = self.session.lock() {
            if let Some(accepted) = session.get(&token) {
                return if accepted == key.key_data() {
                    KnownHostValidationResult::Valid
                } else {
                    KnownHostValidationResult::Invalid {
                        key_type: key_type_name(accepted),
                        fingerprint: fingerprint_of(accepted),
                    }
                };
            }
        }

        let mut mismatch = None;
        for file in &self.files {
            for entry in read_entries(file) {
                if !entry.matches(&token) {
                    continue;
                }
                if entry.revoked {
                    warn!(%token, "host key is revoked in {}", file.display());
                    return KnownHostValidationResult::Invalid {
                        key_type: key_type_name(&entry.key),
                        fingerprint: fingerprint_of(&entry.key),
                    };
                }
                if &entry.key == key.key_data() {
                    self.remember(&token, key);
                    return KnownHostValidationResult::Valid;
                }
                if key_type_name(&entry.key) == key.algorithm().as_str() && mismatch.is_none() {
                    mismatch = Some(KnownHostValidationResult::Invalid {
                        key_type: key_type_name(&entry.key),
                        fingerprint: fingerprint_of(&entry.key),
                    });
                }
            }
        }
        mismatch.unwrap_or(KnownHostValidationResult::Unknown)
    }

    /// Appends the key to the primary file. Write failures downgrade to a
    /// warning; the in-memory acceptance stands either way.
    pub fn trust(&self, host: &str, port: u16, key: &PublicKey) {
        let token = host_token(host, port);
        self.remember(&token, key);

        let result: std::io::Result<()> = (|| {
            use std::os::unix::fs::OpenOptionsExt;
            if let Some(parent) = self.primary.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .mode(0o600)
                .open(&self.primary)?;
            let openssh = key
                .to_openssh()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            writeln!(file, "{token} {openssh}")
        })();
        match result {
            Ok(()) => info!(
                "Permanently added '{}' to the list of known hosts ({}).",
                token,
                self.primary.display()
            ),
            Err(error) => warn!(%error, path = %self.primary.display(), "cannot record host key"),
        }
    }

    fn remember(&self, token: &str, key: &PublicKey) {
        if let Ok(mut session) = self.session.lock() {
            session
                .entry(token.to_owned())
                .or_insert_with(|| key.key_data().clone());
        }
    }

    /// Algorithms already on file for the address, used to steer the server
    /// towards presenting a key we can verify.
    pub fn known_algorithms(&self, host: &str, port: u16) -> Vec<String> {
        let token = host_token(host, port);
        let mut algos = Vec::new();
        for file in &self.files {
            for entry in read_entries(file) {
                if entry.matches(&token) && !entry.revoked {
                    let name = key_type_name(&entry.key);
                    if !algos.contains(&name) {
                        algos.push(name);
                    }
                }
            }
        }
        algos
    }
}

fn host_token(host: &str, port: u16) -> String {
    if port == 22 {
        host.to_owned()
    } else {
        format!("[{host}]:{port}")
    }
}

fn key_type_name(key: &KeyData) -> String {
    key.algorithm().as_str().to_owned()
}

fn fingerprint_of(key: &KeyData) -> String {
    key.fingerprint(HashAlg::Sha256).to_string()
}

struct Entry {
    hosts: String,
    key: KeyData,
    revoked: bool,
}

impl Entry {
    fn matches(&self, token: &str) -> bool {
        if let Some(hashed) = self.hosts.strip_prefix("|1|") {
            return hashed_matches(hashed, token);
        }
        let mut matched = false;
        for pattern in self.hosts.split(',') {
            if let Some(negated) = pattern.strip_prefix('!') {
                if pattern_matches(negated, token) {
                    return false;
                }
            } else if pattern_matches(pattern, token) {
                matched = true;
            }
        }
        matched
    }
}

fn hashed_matches(hashed: &str, token: &str) -> bool {
    let Some((salt_b64, hash_b64)) = hashed.split_once('|') else {
        return false;
    };
    let (Ok(salt), Ok(hash)) = (
        BASE64.decode(salt_b64.as_bytes()),
        BASE64.decode(hash_b64.as_bytes()),
    ) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha1>::new_from_slice(&salt) else {
        return false;
    };
    mac.update(token.as_bytes());
    mac.verify_slice(&hash).is_ok()
}

fn read_entries(path: &Path) -> Vec<Entry> {
    let Ok(content) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    let mut entries = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (revoked, line) = match line.strip_prefix('@') {
            Some(marked) => {
                let Some((marker, rest)) = marked.split_once(char::is_whitespace) else {
                    continue;
                };
                match marker {
                    "revoked" => (true, rest.trim_start()),
                    // certificate authorities are not used for plain host keys
                    _ => continue,
                }
            }
            None => (false, line),
        };
        let mut fields = line.split_whitespace();
        let (Some(hosts), Some(algo), Some(b64)) = (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        let Ok(key) = PublicKey::from_openssh(&format!("{algo} {b64}")) else {
            continue;
        };
        entries.push(Entry {
            hosts: hosts.to_owned(),
            key: key.key_data().clone(),
            revoked,
        });
    }
    entries
}

/// The fixed warning OpenSSH users expect when a host key no longer matches.
pub fn host_key_changed_warning(host: &str, key_type: &str, fingerprint: &str) -> String {
    format!(
        "@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@\n\
         @    WARNING: REMOTE HOST IDENTIFICATION HAS CHANGED!     @\n\
         @@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@\n\
         IT IS POSSIBLE THAT SOMEONE IS DOING SOMETHING NASTY!\n\
         Someone could be eavesdropping on you right now (man-in-the-middle attack)!\n\
         It is also possible that a host key has just been changed.\n\
         The fingerprint for the {key_type} key sent by the remote host [{host}] is\n\
         {fingerprint}\n\
         Please contact your system administrator."
    )
}

#[cfg(test)]
mod tests {
    use russh::keys::ssh_key::private::Ed25519Keypair;
    use russh::keys::ssh_key::rand_core::OsRng;

    use super::*;

    fn test_key(seed: u8) -> PublicKey {
        let mut rng = OsRng;
        let _ = seed;
        let pair = Ed25519Keypair::random(&mut rng);
        PublicKey::new(KeyData::Ed25519(pair.public), "")
    }

    fn write_known_hosts(dir: &Path, lines: &[String]) -> PathBuf {
        let path = dir.join("known_hosts");
        std::fs::write(&path, lines.join("\n") + "\n").unwrap();
        path
    }

    fn entry_line(token: &str, key: &PublicKey) -> String {
        format!("{} {}", token, key.to_openssh().unwrap())
    }

    #[test]
    fn test_match_accept_and_changed() {
        let dir = std::env::temp_dir().join(format!("passage-kh-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let good = test_key(1);
        let evil = test_key(2);
        let path = write_known_hosts(&dir, &[entry_line("web.example.com", &good)]);

        let hosts = KnownHosts::for_files(vec![path.clone()], path);
        assert!(matches!(
            hosts.validate("web.example.com", 22, &good),
            KnownHostValidationResult::Valid
        ));
        assert!(matches!(
            hosts.validate("web.example.com", 22, &evil),
            KnownHostValidationResult::Invalid { .. }
        ));
        assert!(matches!(
            hosts.validate("other.example.com", 22, &good),
            KnownHostValidationResult::Unknown
        ));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_session_acceptance_is_sticky() {
        let dir = std::env::temp_dir().join(format!("passage-kh-tofu-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        // primary points at an unwritable location to exercise the warning path
        let primary = dir.join("known_hosts");
        let hosts = KnownHosts::for_files(vec![primary.clone()], primary);

        let first = test_key(1);
        let second = test_key(2);
        assert!(matches!(
            hosts.validate("fresh", 22, &first),
            KnownHostValidationResult::Unknown
        ));
        hosts.trust("fresh", 22, &first);
        assert!(matches!(
            hosts.validate("fresh", 22, &first),
            KnownHostValidationResult::Valid
        ));
        // a different key for the same host within this session is fatal
        assert!(matches!(
            hosts.validate("fresh", 22, &second),
            KnownHostValidationResult::Invalid { .. }
        ));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_port_token_and_trust_roundtrip() {
        let dir = std::env::temp_dir().join(format!("passage-kh-port-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let primary = dir.join("known_hosts");
        let key = test_key(1);
        {
            let hosts = KnownHosts::for_files(vec![primary.clone()], primary.clone());
            hosts.trust("db", 2022, &key);
        }
        let content = std::fs::read_to_string(&primary).unwrap();
        assert!(content.starts_with("[db]:2022 "));

        // a fresh table (new session) reads it back from disk
        let hosts = KnownHosts::for_files(vec![primary.clone()], primary);
        assert!(matches!(
            hosts.validate("db", 2022, &key),
            KnownHostValidationResult::Valid
        ));
        assert_eq!(hosts.known_algorithms("db", 2022), vec!["ssh-ed25519"]);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_hashed_entry() {
        let token = "hashed.example.com";
        let salt = b"0123456789abcdefghij";
        let mut mac = Hmac::<Sha1>::new_from_slice(salt).unwrap();
        mac.update(token.as_bytes());
        let digest = mac.finalize().into_bytes();
        let hosts_field = format!(
            "|1|{}|{}",
            BASE64.encode(salt),
            BASE64.encode(&digest)
        );

        let key = test_key(1);
        let dir = std::env::temp_dir().join(format!("passage-kh-hash-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = write_known_hosts(&dir, &[entry_line(&hosts_field, &key)]);
        let hosts = KnownHosts::for_files(vec![path.clone()], path);
        assert!(matches!(
            hosts.validate(token, 22, &key),
            KnownHostValidationResult::Valid
        ));
        assert!(matches!(
            hosts.validate("other.example.com", 22, &key),
            KnownHostValidationResult::Unknown
        ));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
