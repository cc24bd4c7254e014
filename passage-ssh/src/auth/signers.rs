//! Identity loading: plain keys, certificate-wrapped keys and
//! passphrase-locked keys that unlock lazily at sign time.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use passage_common::{PassageError, Secret};
use passage_core::config::expand_tilde;
use passage_core::tokens::{TokenExpander, PATH_TOKENS};
use passage_core::{LoginParam, Services};
use russh::keys::{load_public_key, load_secret_key, Certificate, HashAlg, PrivateKey, PublicKey};
use tracing::*;

use crate::SshArgs;

const DEFAULT_IDENTITIES: &[&str] = &[
    "id_rsa",
    "id_ecdsa",
    "id_ecdsa_sk",
    "id_ed25519",
    "id_ed25519_sk",
    "identity",
];

const PASSPHRASE_ATTEMPTS: usize = 3;

pub enum Signer {
    /// A decrypted private key, optionally paired with its certificate.
    Key {
        path: PathBuf,
        key: Arc<PrivateKey>,
        certificate: Option<Certificate>,
    },
    /// Still locked; holds the on-disk bytes and the public half when a
    /// `.pub` sibling exists.
    Encrypted {
        path: PathBuf,
        public: Option<PublicKey>,
    },
}

impl Signer {
    pub fn path(&self) -> &Path {
        match self {
            Signer::Key { path, .. } | Signer::Encrypted { path, .. } => path,
        }
    }

    fn fingerprint(&self) -> Option<String> {
        let public = match self {
            Signer::Key { key, .. } => Some(key.public_key().clone()),
            Signer::Encrypted { public, .. } => public.clone(),
        };
        public.map(|p| p.fingerprint(HashAlg::Sha256).to_string())
    }

    /// Produces a usable private key, prompting for the passphrase when the
    /// configured one is missing or wrong. Three attempts, as `ssh` allows.
    pub async fn unlock(
        &self,
        configured: Option<Secret<String>>,
    ) -> Result<Arc<PrivateKey>, PassageError> {
        match self {
            Signer::Key { key, .. } => Ok(key.clone()),
            Signer::Encrypted { path, .. } => {
                if let Some(passphrase) = configured {
                    match load_secret_key(path, Some(passphrase.expose_secret().as_str())) {
                        Ok(key) => return Ok(Arc::new(key)),
                        Err(error) => {
                            warn!(path = %path.display(), %error, "configured passphrase did not unlock the key");
                        }
                    }
                }
                let display = path.display().to_string();
                for _ in 0..PASSPHRASE_ATTEMPTS {
                    let prompt = format!("Enter passphrase for key '{display}': ");
                    let entered = tokio::task::spawn_blocking(move || {
                        dialoguer::Password::new()
                            .with_prompt(prompt)
                            .allow_empty_password(true)
                            .interact()
                    })
                    .await
                    .map_err(PassageError::other)?
                    .map_err(|e| PassageError::Config(format!("passphrase prompt failed: {e}")))?;
                    match load_secret_key(path, Some(entered.as_str())) {
                        Ok(key) => return Ok(Arc::new(key)),
                        Err(_) => warn!(path = %path.display(), "bad passphrase"),
                    }
                }
                Err(PassageError::Config(format!(
                    "cannot decrypt key [{display}]"
                )))
            }
        }
    }

    pub fn certificate(&self) -> Option<&Certificate> {
        match self {
            Signer::Key { certificate, .. } => certificate.as_ref(),
            Signer::Encrypted { .. } => None,
        }
    }
}

/// Gathers identity files: `-i` flags first, then config `IdentityFile`
/// entries (token-expanded), then the default `~/.ssh` list when nothing is
/// configured. Signers are deduplicated by SHA-256 fingerprint.
pub fn load_signers(services: &Services, param: &LoginParam, args: &SshArgs) -> Vec<Signer> {
    let expander = TokenExpander::new(param);
    let mut paths: Vec<PathBuf> = Vec::new();

    for identity in &args.identities {
        paths.push(PathBuf::from(expand_tilde(identity)));
    }
    for identity in services.config.get_all_splits(&param.alias, "IdentityFile") {
        match expander.expand(&identity, PATH_TOKENS) {
            Ok(expanded) => paths.push(PathBuf::from(expand_tilde(&expanded))),
            Err(error) => warn!(%identity, %error, "cannot expand identity path"),
        }
    }
    if paths.is_empty() {
        if let Some(home) = dirs::home_dir() {
            for name in DEFAULT_IDENTITIES {
                paths.push(home.join(".ssh").join(name));
            }
        }
    }

    let mut signers = Vec::new();
    let mut fingerprints = HashSet::new();
    for path in paths {
        let Some(signer) = load_one(&path) else {
            continue;
        };
        if let Some(fingerprint) = signer.fingerprint() {
            if !fingerprints.insert(fingerprint) {
                debug!(path = %path.display(), "duplicate identity skipped");
                continue;
            }
        }
        signers.push(signer);
    }
    signers
}

fn load_one(path: &Path) -> Option<Signer> {
    if !path.exists() {
        return None;
    }
    match load_secret_key(path, None) {
        Ok(key) => {
            let certificate = load_adjacent_certificate(path);
            Some(Signer::Key {
                path: path.to_owned(),
                key: Arc::new(key),
                certificate,
            })
        }
        Err(russh::keys::Error::KeyIsEncrypted) => {
            // the public half comes from the .pub sibling when present
            let public = load_public_key(path.with_extension("pub")).ok();
            Some(Signer::Encrypted {
                path: path.to_owned(),
                public,
            })
        }
        Err(error) => {
            warn!(path = %path.display(), %error, "cannot load identity");
            None
        }
    }
}

/// `<identity>-cert.pub` next to the key produces a certificate signer.
fn load_adjacent_certificate(path: &Path) -> Option<Certificate> {
    let mut cert_path = path.as_os_str().to_owned();
    cert_path.push("-cert.pub");
    let cert_path = PathBuf::from(cert_path);
    let content = std::fs::read_to_string(&cert_path).ok()?;
    match Certificate::from_openssh(&content) {
        Ok(cert) => {
            debug!(path = %cert_path.display(), "loaded certificate");
            Some(cert)
        }
        Err(error) => {
            warn!(path = %cert_path.display(), %error, "cannot parse certificate");
            None
        }
    }
}
