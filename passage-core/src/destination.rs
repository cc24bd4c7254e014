use passage_common::PassageError;

/// A parsed `[user@]host[:port]` destination string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub user: Option<String>,
    pub host: String,
    pub port: Option<String>,
}

impl Destination {
    /// Accepts `host`, `user@host`, `host:port`, `[v6]:port`,
    /// `user@[v6]:port` and bare IPv6 addresses (two or more colons, no
    /// brackets).
    pub fn parse(dest: &str) -> Result<Self, PassageError> {
        let bad = |message: &str| PassageError::Config(format!("destination \"{dest}\": {message}"));

        let (user, rest) = match dest.rfind('@') {
            Some(0) => return Err(bad("empty user")),
            Some(idx) => (Some(dest[..idx].to_owned()), &dest[idx + 1..]),
            None => (None, dest),
        };
        if rest.is_empty() {
            return Err(bad("empty host"));
        }

        let (host, port) = if let Some(stripped) = rest.strip_prefix('[') {
            let end = stripped.find(']').ok_or_else(|| bad("missing ]"))?;
            let host = &stripped[..end];
            let tail = &stripped[end + 1..];
            let port = match tail.strip_prefix(':') {
                Some(port) if !port.is_empty() => Some(port.to_owned()),
                Some(_) => return Err(bad("empty port")),
                None if tail.is_empty() => None,
                None => return Err(bad("garbage after ]")),
            };
            (host.to_owned(), port)
        } else if rest.matches(':').count() >= 2 {
            // Bare IPv6 address; a port needs the bracketed form.
            (rest.to_owned(), None)
        } else if let Some((host, port)) = rest.split_once(':') {
            if port.is_empty() {
                return Err(bad("empty port"));
            }
            (host.to_owned(), Some(port.to_owned()))
        } else {
            (rest.to_owned(), None)
        };

        if host.is_empty() {
            return Err(bad("empty host"));
        }
        if let Some(port) = &port {
            port.parse::<u16>().map_err(|_| bad("invalid port"))?;
        }
        Ok(Self { user, host, port })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_forms() {
        assert_eq!(
            Destination::parse("web").unwrap(),
            Destination {
                user: None,
                host: "web".into(),
                port: None
            }
        );
        assert_eq!(
            Destination::parse("admin@web:2022").unwrap(),
            Destination {
                user: Some("admin".into()),
                host: "web".into(),
                port: Some("2022".into())
            }
        );
    }

    #[test]
    fn test_ipv6_bracketed() {
        assert_eq!(
            Destination::parse("user@[fe80::6358:bbae:26f8:7859]:1022").unwrap(),
            Destination {
                user: Some("user".into()),
                host: "fe80::6358:bbae:26f8:7859".into(),
                port: Some("1022".into())
            }
        );
        assert_eq!(
            Destination::parse("[::1]").unwrap().host,
            "::1"
        );
    }

    #[test]
    fn test_ipv6_bare() {
        let dest = Destination::parse("fe80::1").unwrap();
        assert_eq!(dest.host, "fe80::1");
        assert_eq!(dest.port, None);
    }

    #[test]
    fn test_user_with_at_sign() {
        // the last @ separates the user part
        let dest = Destination::parse("user@domain@host").unwrap();
        assert_eq!(dest.user.as_deref(), Some("user@domain"));
        assert_eq!(dest.host, "host");
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(Destination::parse("@host").is_err());
        assert!(Destination::parse("host:").is_err());
        assert!(Destination::parse("host:notaport").is_err());
        assert!(Destination::parse("[fe80::1").is_err());
        assert!(Destination::parse("[fe80::1]x").is_err());
        assert!(Destination::parse("user@").is_err());
    }
}
