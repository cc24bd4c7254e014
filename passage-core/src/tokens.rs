//! Percent-token expansion for config values such as `ControlPath`,
//! `IdentityFile` and `LocalCommand`.

use data_encoding::HEXLOWER;
use passage_common::PassageError;
use sha1::{Digest, Sha1};

use crate::LoginParam;

/// Tokens permitted in most path-like directives.
pub const PATH_TOKENS: &str = "hprnlLjC";

/// Characters never allowed in a host or user that reaches an external
/// process.
const DENY_CHARS: &str = "`'\"$&;<>|(){}";

pub struct TokenExpander<'a> {
    param: &'a LoginParam,
    local_user: String,
    local_hostname: String,
}

impl<'a> TokenExpander<'a> {
    pub fn new(param: &'a LoginParam) -> Self {
        Self {
            param,
            local_user: whoami::username(),
            local_hostname: whoami::fallible::hostname().unwrap_or_else(|_| "localhost".into()),
        }
    }

    #[cfg(test)]
    fn with_local(param: &'a LoginParam, local_user: &str, local_hostname: &str) -> Self {
        Self {
            param,
            local_user: local_user.to_owned(),
            local_hostname: local_hostname.to_owned(),
        }
    }

    pub fn expand(&self, template: &str, allowed: &str) -> Result<String, PassageError> {
        let mut out = String::with_capacity(template.len());
        let mut chars = template.chars();
        while let Some(c) = chars.next() {
            if c != '%' {
                out.push(c);
                continue;
            }
            let token = chars.next().ok_or_else(|| PassageError::Token {
                template: template.to_owned(),
                message: "trailing %".to_owned(),
            })?;
            if token == '%' {
                out.push('%');
                continue;
            }
            if !allowed.contains(token) {
                return Err(PassageError::Token {
                    template: template.to_owned(),
                    message: format!("token %{token} not allowed here"),
                });
            }
            match token {
                'h' => out.push_str(&self.param.host),
                'p' => out.push_str(&self.param.port),
                'r' => out.push_str(&self.param.user),
                'n' => out.push_str(&self.param.alias),
                'l' => out.push_str(&self.local_hostname),
                'L' => out.push_str(short_hostname(&self.local_hostname)),
                'j' => out.push_str(self.param.last_proxy().unwrap_or("")),
                'C' => out.push_str(&self.connection_hash()),
                _ => {
                    return Err(PassageError::Token {
                        template: template.to_owned(),
                        message: format!("unknown token %{token}"),
                    })
                }
            }
        }
        Ok(out)
    }

    /// `%C`: SHA1 over hostname, host, port, user and the last proxy hop
    /// when present.
    fn connection_hash(&self) -> String {
        let mut hasher = Sha1::new();
        hasher.update(self.local_hostname.as_bytes());
        hasher.update(self.param.host.as_bytes());
        hasher.update(self.param.port.as_bytes());
        hasher.update(self.param.user.as_bytes());
        if let Some(proxy) = self.param.last_proxy() {
            hasher.update(proxy.as_bytes());
        }
        HEXLOWER.encode(&hasher.finalize())
    }

    pub fn local_user(&self) -> &str {
        &self.local_user
    }
}

fn short_hostname(hostname: &str) -> &str {
    hostname.split('.').next().unwrap_or(hostname)
}

/// Rejects host and user values that could smuggle shell syntax into a
/// ProxyCommand or xauth invocation. Runs before any process is spawned.
pub fn validate_spawn_safe(kind: &str, value: &str) -> Result<(), PassageError> {
    let bad = value.starts_with('-')
        || value.ends_with('\\')
        || value
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || DENY_CHARS.contains(c));
    if bad {
        return Err(PassageError::Token {
            template: value.to_owned(),
            message: format!("unsafe characters in {kind}"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn param() -> LoginParam {
        LoginParam {
            alias: "box".to_owned(),
            host: "127.0.0.1".to_owned(),
            port: "1337".to_owned(),
            user: "penny".to_owned(),
            proxy_chain: vec![],
            proxy_command: None,
        }
    }

    #[test]
    fn test_basic_tokens() {
        let param = param();
        let exp = TokenExpander::with_local(&param, "local", "myhostname.mydomain.com");
        assert_eq!(
            exp.expand("%r@%h:%p (%n)", PATH_TOKENS).unwrap(),
            "penny@127.0.0.1:1337 (box)"
        );
        assert_eq!(exp.expand("%L", PATH_TOKENS).unwrap(), "myhostname");
        assert_eq!(exp.expand("100%%", PATH_TOKENS).unwrap(), "100%");
        assert_eq!(exp.expand("%j.", PATH_TOKENS).unwrap(), ".");
    }

    #[test]
    fn test_connection_hash_vector() {
        let param = param();
        let exp = TokenExpander::with_local(&param, "local", "myhostname.mydomain.com");
        assert_eq!(
            exp.expand("/A/%C/B", PATH_TOKENS).unwrap(),
            "/A/07f25c03a322b120bcaa54d2dd0a618f2673cb1c/B"
        );
    }

    #[test]
    fn test_hash_includes_proxy() {
        let mut with_proxy = param();
        with_proxy.proxy_chain = vec!["jump".to_owned()];
        let direct = param();
        let a = TokenExpander::with_local(&with_proxy, "l", "h").expand("%C", PATH_TOKENS);
        let b = TokenExpander::with_local(&direct, "l", "h").expand("%C", PATH_TOKENS);
        assert_ne!(a.unwrap(), b.unwrap());
    }

    #[test]
    fn test_rejects_bad_tokens() {
        let param = param();
        let exp = TokenExpander::with_local(&param, "l", "h");
        assert!(exp.expand("%q", PATH_TOKENS).is_err());
        assert!(exp.expand("50%", PATH_TOKENS).is_err());
        assert!(exp.expand("%C", "hp").is_err());
    }

    #[test]
    fn test_spawn_safety() {
        assert!(validate_spawn_safe("hostname", "db.example.com").is_ok());
        assert!(validate_spawn_safe("hostname", "fe80::1%eth0").is_ok());
        assert!(validate_spawn_safe("hostname", "host;rm -rf /").is_err());
        assert!(validate_spawn_safe("hostname", "a b").is_err());
        assert!(validate_spawn_safe("hostname", "-oProxyCommand=x").is_err());
        assert!(validate_spawn_safe("user", "root\\").is_err());
        assert!(validate_spawn_safe("user", "tab\there").is_err());
        assert!(validate_spawn_safe("user", "$(id)").is_err());
    }
}
