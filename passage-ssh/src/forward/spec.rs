//! Bind and forward specification parsing, covering the `-L`/`-R`/`-D`
//! syntaxes including bracketed IPv6, slash separators and Unix socket
//! paths. Every parsed spec keeps the text it came from; errors echo the
//! offending input verbatim.

use std::fmt::{Display, Formatter};
use std::sync::OnceLock;

use passage_common::PassageError;
use regex::Regex;

/// A `-D`-style listen specification. `addr` of `None` means loopback under
/// the implicit gateway rule; `Some("")`/`Some("*")` means all interfaces.
/// A port of −1 marks a Unix socket path carried in `addr`. `raw` is the
/// text the spec was parsed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindSpec {
    pub raw: String,
    pub addr: Option<String>,
    pub port: i32,
}

/// A `-L`/`-R` forwarding specification, `raw` holding the original text. A
/// `dest_port` of −1 together with a `dest_host` starting with `/` denotes a
/// Unix endpoint; same for the bind side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardSpec {
    pub raw: String,
    pub bind_addr: Option<String>,
    pub bind_port: i32,
    pub dest_host: String,
    pub dest_port: i32,
}

pub const UNIX_PORT: i32 = -1;

fn bad(spec: &str) -> PassageError {
    PassageError::ForwardSpec(format!("invalid forward specification \"{spec}\""))
}

fn parse_port(text: &str, spec: &str) -> Result<i32, PassageError> {
    let port: i32 = text.parse().map_err(|_| bad(spec))?;
    if !(0..=65535).contains(&port) {
        return Err(bad(spec));
    }
    Ok(port)
}

impl BindSpec {
    /// Accepts `port`, `addr:port`, `[v6]:port`, `addr/port` (so an IPv6
    /// address works without brackets) and `/unix/path`.
    pub fn parse(spec: &str) -> Result<Self, PassageError> {
        if spec.is_empty() || spec.chars().any(char::is_whitespace) {
            return Err(bad(spec));
        }
        let raw = spec.to_owned();
        if spec.starts_with('/') {
            return Ok(Self {
                raw,
                addr: Some(spec.to_owned()),
                port: UNIX_PORT,
            });
        }
        if let Some(rest) = spec.strip_prefix('[') {
            let (addr, tail) = rest.split_once(']').ok_or_else(|| bad(spec))?;
            let port = tail
                .strip_prefix(':')
                .or_else(|| tail.strip_prefix('/'))
                .ok_or_else(|| bad(spec))?;
            return Ok(Self {
                raw,
                addr: Some(addr.to_owned()),
                port: parse_port(port, spec)?,
            });
        }
        if let Some((addr, port)) = spec.rsplit_once('/') {
            return Ok(Self {
                raw,
                addr: Some(addr.to_owned()),
                port: parse_port(port, spec)?,
            });
        }
        if let Some((addr, port)) = spec.rsplit_once(':') {
            if addr.contains(':') {
                // a bare IPv6 address needs brackets or the slash form
                return Err(bad(spec));
            }
            return Ok(Self {
                raw,
                addr: Some(addr.to_owned()),
                port: parse_port(port, spec)?,
            });
        }
        Ok(Self {
            port: parse_port(spec, spec)?,
            raw,
            addr: None,
        })
    }

    pub fn is_unix(&self) -> bool {
        self.port == UNIX_PORT
    }
}

/// The canonical text for a bind address/port pair, used when a spec is
/// derived rather than parsed.
fn format_bind(addr: &Option<String>, port: i32) -> String {
    match addr {
        None => port.to_string(),
        Some(addr) if port == UNIX_PORT => addr.clone(),
        Some(addr) if addr.contains(':') => format!("[{addr}]:{port}"),
        Some(addr) => format!("{addr}:{port}"),
    }
}

impl Display for BindSpec {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.raw)
    }
}

fn regexes() -> &'static [Regex; 3] {
    static REGEXES: OnceLock<[Regex; 3]> = OnceLock::new();
    #[allow(clippy::unwrap_used)]
    REGEXES.get_or_init(|| {
        [
            // [v6]:port:[v6]:port
            Regex::new(r"^\[([^\[\]]+)\][:/](\d+)[:/]\[([^\[\]]+)\][:/](\d+)$").unwrap(),
            // [v6]:port:host:port
            Regex::new(r"^\[([^\[\]]+)\][:/](\d+)[:/]([^\[\]:/]+)[:/](\d+)$").unwrap(),
            // host:port:[v6]:port and port:[v6]:port
            Regex::new(r"^(?:([^\[\]:/]*)[:/])?(\d+)[:/]\[([^\[\]]+)\][:/](\d+)$").unwrap(),
        ]
    })
}

impl ForwardSpec {
    /// Accepts the packed `bind:port:host:hostport` family (with `/` also
    /// accepted as separator) and the two-token config form
    /// `bindspec desthostspec`. Whitespace inside a token is forbidden.
    pub fn parse(spec: &str) -> Result<Self, PassageError> {
        let trimmed = spec.trim();
        if trimmed.is_empty() {
            return Err(bad(spec));
        }
        if trimmed.chars().any(char::is_whitespace) {
            let mut tokens = trimmed.split_whitespace();
            let (Some(bind), Some(dest), None) = (tokens.next(), tokens.next(), tokens.next())
            else {
                return Err(bad(spec));
            };
            let bind = BindSpec::parse(bind).map_err(|_| bad(spec))?;
            let (dest_host, dest_port) = parse_dest(dest, spec)?;
            return Ok(Self {
                raw: trimmed.to_owned(),
                bind_addr: bind.addr,
                bind_port: bind.port,
                dest_host,
                dest_port,
            });
        }

        for (index, regex) in regexes().iter().enumerate() {
            if let Some(captures) = regex.captures(trimmed) {
                let addr = captures.get(1).map(|m| m.as_str().to_owned());
                // the third regex makes the bind address optional
                let bind_addr = match (index, &addr) {
                    (2, None) => None,
                    _ => addr,
                };
                #[allow(clippy::unwrap_used)]
                let bind_port = parse_port(captures.get(2).unwrap().as_str(), spec)?;
                #[allow(clippy::unwrap_used)]
                let dest_host = captures.get(3).unwrap().as_str().to_owned();
                #[allow(clippy::unwrap_used)]
                let dest_port = parse_port(captures.get(4).unwrap().as_str(), spec)?;
                return Ok(Self {
                    raw: trimmed.to_owned(),
                    bind_addr,
                    bind_port,
                    dest_host,
                    dest_port,
                });
            }
        }

        Self::parse_packed(trimmed, spec)
    }

    /// The colon-separated shapes without bracketed IPv6 anywhere.
    fn parse_packed(trimmed: &str, spec: &str) -> Result<Self, PassageError> {
        // Unix destinations terminate the split: everything after the first
        // `:/` belongs to the path.
        if let Some((head, path)) = trimmed.split_once(":/") {
            let path = format!("/{path}");
            let bind = BindSpec::parse(head).map_err(|_| bad(spec))?;
            return Ok(Self {
                raw: trimmed.to_owned(),
                bind_addr: bind.addr,
                bind_port: bind.port,
                dest_host: path,
                dest_port: UNIX_PORT,
            });
        }
        let parts: Vec<&str> = trimmed.split(':').collect();
        match parts.as_slice() {
            [port, host, host_port] => Ok(Self {
                raw: trimmed.to_owned(),
                bind_addr: None,
                bind_port: parse_port(port, spec)?,
                dest_host: (*host).to_owned(),
                dest_port: parse_port(host_port, spec)?,
            }),
            [addr, port, host, host_port] => Ok(Self {
                raw: trimmed.to_owned(),
                bind_addr: Some((*addr).to_owned()),
                bind_port: parse_port(port, spec)?,
                dest_host: (*host).to_owned(),
                dest_port: parse_port(host_port, spec)?,
            }),
            _ => Err(bad(spec)),
        }
    }

    pub fn bind_spec(&self) -> BindSpec {
        BindSpec {
            raw: format_bind(&self.bind_addr, self.bind_port),
            addr: self.bind_addr.clone(),
            port: self.bind_port,
        }
    }

    pub fn dest_is_unix(&self) -> bool {
        self.dest_port == UNIX_PORT
    }
}

fn parse_dest(dest: &str, spec: &str) -> Result<(String, i32), PassageError> {
    if dest.starts_with('/') {
        return Ok((dest.to_owned(), UNIX_PORT));
    }
    if let Some(rest) = dest.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(|| bad(spec))?;
        let port = tail
            .strip_prefix(':')
            .or_else(|| tail.strip_prefix('/'))
            .ok_or_else(|| bad(spec))?;
        return Ok((host.to_owned(), parse_port(port, spec)?));
    }
    let (host, port) = dest
        .rsplit_once(':')
        .or_else(|| dest.rsplit_once('/'))
        .ok_or_else(|| bad(spec))?;
    if host.contains(':') {
        return Err(bad(spec));
    }
    Ok((host.to_owned(), parse_port(port, spec)?))
}

impl Display for ForwardSpec {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_spec_forms() {
        assert_eq!(
            BindSpec::parse("8000").unwrap(),
            BindSpec {
                raw: "8000".into(),
                addr: None,
                port: 8000
            }
        );
        assert_eq!(
            BindSpec::parse("*:8005").unwrap(),
            BindSpec {
                raw: "*:8005".into(),
                addr: Some("*".into()),
                port: 8005
            }
        );
        assert_eq!(
            BindSpec::parse(":8005").unwrap().addr,
            Some(String::new())
        );
        assert_eq!(
            BindSpec::parse("[fe80::1]:9000").unwrap(),
            BindSpec {
                raw: "[fe80::1]:9000".into(),
                addr: Some("fe80::1".into()),
                port: 9000
            }
        );
        assert_eq!(
            BindSpec::parse("fe80::1/9000").unwrap(),
            BindSpec {
                raw: "fe80::1/9000".into(),
                addr: Some("fe80::1".into()),
                port: 9000
            }
        );
        assert_eq!(
            BindSpec::parse("/run/bind.sock").unwrap(),
            BindSpec {
                raw: "/run/bind.sock".into(),
                addr: Some("/run/bind.sock".into()),
                port: -1
            }
        );
    }

    #[test]
    fn test_bind_spec_rejects() {
        assert!(BindSpec::parse("").is_err());
        assert!(BindSpec::parse("a b").is_err());
        assert!(BindSpec::parse("fe80::1:9000").is_err());
        assert!(BindSpec::parse("host:99999").is_err());
        assert!(BindSpec::parse("[fe80::1]9000").is_err());
    }

    #[test]
    fn test_forward_ipv6_bind() {
        let text = "[fe80::6358:bbae:26f8:7859]:8006:127.0.0.1:9006";
        let spec = ForwardSpec::parse(text).unwrap();
        assert_eq!(
            spec,
            ForwardSpec {
                raw: text.into(),
                bind_addr: Some("fe80::6358:bbae:26f8:7859".into()),
                bind_port: 8006,
                dest_host: "127.0.0.1".into(),
                dest_port: 9006,
            }
        );
    }

    #[test]
    fn test_forward_ipv6_positions() {
        let both = ForwardSpec::parse("[::1]:8006:[fe80::2]:9006").unwrap();
        assert_eq!(both.bind_addr.as_deref(), Some("::1"));
        assert_eq!(both.dest_host, "fe80::2");

        let dest_only = ForwardSpec::parse("127.0.0.1:8006:[fe80::2]:9006").unwrap();
        assert_eq!(dest_only.bind_addr.as_deref(), Some("127.0.0.1"));
        assert_eq!(dest_only.dest_host, "fe80::2");

        let no_addr = ForwardSpec::parse("8006:[fe80::2]:9006").unwrap();
        assert_eq!(no_addr.bind_addr, None);
        assert_eq!(no_addr.dest_host, "fe80::2");
    }

    #[test]
    fn test_forward_plain_shapes() {
        let three = ForwardSpec::parse("8080:localhost:80").unwrap();
        assert_eq!(three.bind_addr, None);
        assert_eq!(three.raw, "8080:localhost:80");
        let four = ForwardSpec::parse("*:8080:localhost:80").unwrap();
        assert_eq!(four.bind_addr.as_deref(), Some("*"));
        let spaced = ForwardSpec::parse("8080 localhost:80").unwrap();
        assert_eq!(spaced.dest_host, "localhost");
        assert_eq!(spaced.dest_port, 80);
        assert_eq!(spaced.raw, "8080 localhost:80");
    }

    #[test]
    fn test_forward_unix() {
        let unix_dest = ForwardSpec::parse("8080:/var/run/app.sock").unwrap();
        assert_eq!(unix_dest.bind_port, 8080);
        assert_eq!(unix_dest.dest_host, "/var/run/app.sock");
        assert_eq!(unix_dest.dest_port, UNIX_PORT);

        let unix_bind = ForwardSpec::parse("/run/in.sock localhost:80").unwrap();
        assert_eq!(unix_bind.bind_addr.as_deref(), Some("/run/in.sock"));
        assert_eq!(unix_bind.bind_port, UNIX_PORT);

        let both = ForwardSpec::parse("/run/in.sock /run/out.sock").unwrap();
        assert_eq!(both.dest_port, UNIX_PORT);
        assert_eq!(both.dest_host, "/run/out.sock");
    }

    #[test]
    fn test_forward_rejects() {
        assert!(ForwardSpec::parse("").is_err());
        assert!(ForwardSpec::parse("one two three").is_err());
        assert!(ForwardSpec::parse("8080").is_err());
        assert!(ForwardSpec::parse("a:b:c:d:e").is_err());
        assert!(ForwardSpec::parse("8080:host:badport").is_err());
    }

    #[test]
    fn test_roundtrip_through_raw() {
        for input in [
            "[fe80::6358:bbae:26f8:7859]:8006:127.0.0.1:9006",
            "8080:localhost:80",
            "*:8080:localhost:80",
            "127.0.0.1:8006:[fe80::2]:9006",
            "8080:/var/run/app.sock",
            "/run/in.sock localhost:80",
        ] {
            let parsed = ForwardSpec::parse(input).unwrap();
            assert_eq!(parsed.raw, input.trim());
            let reparsed = ForwardSpec::parse(&parsed.to_string()).unwrap();
            assert_eq!(parsed, reparsed, "{input}");
        }
    }

    #[test]
    fn test_derived_bind_spec_raw() {
        let spec = ForwardSpec::parse("[fe80::2]:8006:localhost:80").unwrap();
        let bind = spec.bind_spec();
        assert_eq!(bind.raw, "[fe80::2]:8006");
        assert_eq!(BindSpec::parse(&bind.raw).unwrap().addr, bind.addr);

        let loopback = ForwardSpec::parse("8080:localhost:80").unwrap();
        assert_eq!(loopback.bind_spec().raw, "8080");

        let unix = ForwardSpec::parse("/run/in.sock localhost:80").unwrap();
        assert_eq!(unix.bind_spec().raw, "/run/in.sock");
    }
}
