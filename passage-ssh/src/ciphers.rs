//! `Ciphers` directive handling, including the OpenSSH operator prefixes:
//! `+` appends, `-` removes (globs allowed), `^` moves to the front, no
//! prefix replaces the list.

use regex::Regex;
use russh::cipher;
use tracing::*;

/// Cipher universe this build understands, preference order first.
const KNOWN_CIPHERS: &[(&str, cipher::Name)] = &[
    ("chacha20-poly1305@openssh.com", cipher::CHACHA20_POLY1305),
    ("aes256-gcm@openssh.com", cipher::AES_256_GCM),
    ("aes256-ctr", cipher::AES_256_CTR),
    ("aes192-ctr", cipher::AES_192_CTR),
    ("aes128-ctr", cipher::AES_128_CTR),
];

fn default_names() -> Vec<&'static str> {
    KNOWN_CIPHERS.iter().map(|(name, _)| *name).collect()
}

fn lookup(name: &str) -> Option<cipher::Name> {
    KNOWN_CIPHERS
        .iter()
        .find(|(known, _)| *known == name)
        .map(|(_, value)| value.clone())
}

fn glob_to_regex(glob: &str) -> Option<Regex> {
    let escaped = regex::escape(glob).replace(r"\*", ".*").replace(r"\?", ".");
    Regex::new(&format!("^{escaped}$")).ok()
}

/// Resolves a `Ciphers` value to the cipher list handed to the transport.
/// Unknown names are warned about and skipped; an empty result falls back
/// to the defaults.
pub fn resolve_cipher_spec(spec: &str) -> Vec<cipher::Name> {
    let spec = spec.trim();
    let (operator, body) = match spec.chars().next() {
        Some(op @ ('+' | '-' | '^')) => (Some(op), &spec[1..]),
        _ => (None, spec),
    };
    let requested: Vec<&str> = body
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();

    let names: Vec<&'static str> = match operator {
        Some('-') => {
            let regexes: Vec<Regex> = requested.iter().filter_map(|g| glob_to_regex(g)).collect();
            default_names()
                .into_iter()
                .filter(|name| !regexes.iter().any(|re| re.is_match(name)))
                .collect()
        }
        Some('+') => {
            let mut names = default_names();
            for name in &requested {
                match KNOWN_CIPHERS.iter().find(|(known, _)| known == name) {
                    Some((known, _)) if !names.contains(known) => names.push(known),
                    Some(_) => {}
                    None => warn!(cipher = %name, "unknown cipher ignored"),
                }
            }
            names
        }
        Some('^') => {
            let mut names: Vec<&'static str> = Vec::new();
            for name in &requested {
                match KNOWN_CIPHERS.iter().find(|(known, _)| known == name) {
                    Some((known, _)) if !names.contains(known) => names.push(known),
                    Some(_) => {}
                    None => warn!(cipher = %name, "unknown cipher ignored"),
                }
            }
            for name in default_names() {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
            names
        }
        _ => {
            let mut names = Vec::new();
            for name in &requested {
                match KNOWN_CIPHERS.iter().find(|(known, _)| known == name) {
                    Some((known, _)) if !names.contains(known) => names.push(known),
                    Some(_) => {}
                    None => warn!(cipher = %name, "unknown cipher ignored"),
                }
            }
            names
        }
    };

    let resolved: Vec<cipher::Name> = names.iter().filter_map(|name| lookup(name)).collect();
    if resolved.is_empty() {
        default_names()
            .iter()
            .filter_map(|name| lookup(name))
            .collect()
    } else {
        resolved
    }
}
