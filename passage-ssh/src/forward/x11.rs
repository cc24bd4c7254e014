//! X11 forwarding: cookie provisioning via `xauth`, setup-packet parsing
//! with byte-exact cookie substitution, and the bridge to the local X
//! server.

use data_encoding::HEXLOWER;
use passage_common::PassageError;
use russh::client::Msg;
use russh::Channel;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;
use tracing::*;

use crate::connect_pipe;

const AUTH_PROTOCOL: &str = "MIT-MAGIC-COOKIE-1";
const COOKIE_LEN: usize = 16;

#[derive(Clone)]
pub struct X11Config {
    pub auth_protocol: String,
    pub fake_cookie: Vec<u8>,
    pub real_cookie: Vec<u8>,
    pub display: String,
    pub trusted: bool,
    /// Untrusted forwarding stops accepting new channels past this point.
    pub deadline: Option<Instant>,
}

impl X11Config {
    /// Provisions the cookie pair. Untrusted mode asks `xauth generate` for
    /// a time-limited cookie; trusted mode (or any xauth failure) falls
    /// back to a random cookie used as both fake and real.
    pub async fn prepare(xauth: &str, trusted: bool, timeout_secs: u64) -> Result<Self, PassageError> {
        let display = std::env::var("DISPLAY")
            .map_err(|_| PassageError::XauthFailure("DISPLAY is not set".to_owned()))?;

        let fake_cookie = random_cookie();
        let real_cookie = if trusted {
            match query_real_cookie(xauth, &display, None).await {
                Ok(cookie) => cookie,
                Err(error) => {
                    debug!(%error, "xauth unavailable, using a synthetic cookie");
                    fake_cookie.clone()
                }
            }
        } else {
            match query_real_cookie(xauth, &display, Some(timeout_secs)).await {
                Ok(cookie) => cookie,
                Err(error) => {
                    warn!(%error, "xauth generate failed, using a synthetic cookie");
                    fake_cookie.clone()
                }
            }
        };

        Ok(Self {
            auth_protocol: AUTH_PROTOCOL.to_owned(),
            fake_cookie,
            real_cookie,
            display,
            trusted,
            deadline: (!trusted).then(|| Instant::now() + std::time::Duration::from_secs(timeout_secs)),
        })
    }

    pub fn fake_cookie_hex(&self) -> String {
        HEXLOWER.encode(&self.fake_cookie)
    }
}

fn random_cookie() -> Vec<u8> {
    passage_common::helpers::random::random_bytes::<COOKIE_LEN>().to_vec()
}

/// `xauth generate <display> . untrusted timeout <secs>` (untrusted) then
/// `xauth list -n <display>`, whose last field is the hex cookie.
async fn query_real_cookie(
    xauth: &str,
    display: &str,
    untrusted_timeout: Option<u64>,
) -> Result<Vec<u8>, PassageError> {
    let xauth = if xauth.is_empty() { "xauth" } else { xauth };
    if let Some(timeout) = untrusted_timeout {
        let generate = tokio::process::Command::new(xauth)
            .args([
                "generate",
                display,
                ".",
                "untrusted",
                "timeout",
                &timeout.to_string(),
            ])
            .output()
            .await
            .map_err(|e| PassageError::XauthFailure(format!("cannot run {xauth}: {e}")))?;
        if !generate.status.success() {
            return Err(PassageError::XauthFailure(format!(
                "xauth generate failed: {}",
                String::from_utf8_lossy(&generate.stderr).trim()
            )));
        }
    }

    let list = tokio::process::Command::new(xauth)
        .args(["list", "-n", display])
        .output()
        .await
        .map_err(|e| PassageError::XauthFailure(format!("cannot run {xauth}: {e}")))?;
    if !list.status.success() {
        return Err(PassageError::XauthFailure("xauth list failed".to_owned()));
    }
    let stdout = String::from_utf8_lossy(&list.stdout);
    let cookie_hex = stdout
        .lines()
        .filter_map(|line| line.split_whitespace().last())
        .next()
        .ok_or_else(|| PassageError::XauthFailure("no xauth entry for the display".to_owned()))?;
    hex::decode(cookie_hex)
        .map_err(|_| PassageError::XauthFailure("unparsable xauth cookie".to_owned()))
}

fn pad4(len: usize) -> usize {
    (len + 3) & !3
}

/// Verifies the setup packet against the provisioned fake cookie and
/// replaces it, in place, with the real one. Every other byte is preserved.
fn substitute_cookie(
    packet: &mut [u8],
    auth_protocol: &str,
    fake: &[u8],
    real: &[u8],
) -> Result<(), String> {
    if packet.len() < 12 {
        return Err("short X11 setup packet".to_owned());
    }
    let read_u16 = |hi: usize| -> u16 {
        match packet[0] {
            0x42 => u16::from_be_bytes([packet[hi], packet[hi + 1]]),
            0x6c => u16::from_le_bytes([packet[hi], packet[hi + 1]]),
            _ => 0,
        }
    };
    if packet[0] != 0x42 && packet[0] != 0x6c {
        return Err(format!("unknown X11 byte order {:#x}", packet[0]));
    }
    let proto_len = read_u16(6) as usize;
    let cookie_len = read_u16(8) as usize;
    let proto_start = 12;
    let cookie_start = proto_start + pad4(proto_len);
    let end = cookie_start + pad4(cookie_len);
    if packet.len() < end {
        return Err("truncated X11 setup packet".to_owned());
    }
    let proto = &packet[proto_start..proto_start + proto_len];
    if proto != auth_protocol.as_bytes() {
        return Err(format!(
            "unexpected X11 auth protocol {:?}",
            String::from_utf8_lossy(proto)
        ));
    }
    if cookie_len != fake.len() || &packet[cookie_start..cookie_start + cookie_len] != fake {
        return Err("X11 cookie does not match".to_owned());
    }
    if real.len() != cookie_len {
        return Err("real cookie length mismatch".to_owned());
    }
    packet[cookie_start..cookie_start + cookie_len].copy_from_slice(real);
    Ok(())
}

enum DisplayTarget {
    Unix(String),
    Tcp(String, u16),
}

/// `unix:$DISPLAY` | `tcp host:6000+n` | `/tmp/.X11-unix/X<n>`.
fn parse_display(display: &str) -> Result<DisplayTarget, String> {
    let without_screen = match display.rfind('.') {
        Some(dot) if display[dot + 1..].chars().all(|c| c.is_ascii_digit()) && display.contains(':') => {
            &display[..dot]
        }
        _ => display,
    };
    if let Some(path) = without_screen.strip_prefix("unix:") {
        if path.starts_with('/') {
            return Ok(DisplayTarget::Unix(path.to_owned()));
        }
        return Ok(DisplayTarget::Unix(format!("/tmp/.X11-unix/X{path}")));
    }
    if without_screen.starts_with('/') {
        return Ok(DisplayTarget::Unix(
            without_screen
                .rsplit_once(':')
                .map(|(path, _)| path.to_owned())
                .unwrap_or_else(|| without_screen.to_owned()),
        ));
    }
    let (host, number) = without_screen
        .rsplit_once(':')
        .ok_or_else(|| format!("unparsable DISPLAY [{display}]"))?;
    let number: u16 = number
        .parse()
        .map_err(|_| format!("unparsable DISPLAY [{display}]"))?;
    if host.is_empty() {
        return Ok(DisplayTarget::Unix(format!("/tmp/.X11-unix/X{number}")));
    }
    Ok(DisplayTarget::Tcp(host.to_owned(), 6000 + number))
}

/// Handles one `"x11"` channel from the server.
pub(crate) fn serve_channel(
    channel: Channel<Msg>,
    config: X11Config,
    originator: String,
    originator_port: u32,
) {
    tokio::spawn(async move {
        if let Some(deadline) = config.deadline {
            if Instant::now() > deadline {
                warn!(%originator, originator_port, "rejecting X11 connection: untrusted forwarding timed out");
                return;
            }
        }
        if let Err(error) = bridge_channel(channel, &config).await {
            warn!(%originator, originator_port, %error, "X11 forwarding failed");
        }
    });
}

async fn bridge_channel(channel: Channel<Msg>, config: &X11Config) -> Result<(), String> {
    let mut stream = channel.into_stream();

    // connection setup prefix: fixed 12 bytes, then the padded auth fields
    let mut header = [0u8; 12];
    stream
        .read_exact(&mut header)
        .await
        .map_err(|e| format!("cannot read X11 setup: {e}"))?;
    let read_u16 = |hi: usize| -> usize {
        match header[0] {
            0x42 => u16::from_be_bytes([header[hi], header[hi + 1]]) as usize,
            _ => u16::from_le_bytes([header[hi], header[hi + 1]]) as usize,
        }
    };
    let rest_len = pad4(read_u16(6)) + pad4(read_u16(8));
    let mut packet = header.to_vec();
    packet.resize(12 + rest_len, 0);
    stream
        .read_exact(&mut packet[12..])
        .await
        .map_err(|e| format!("cannot read X11 auth data: {e}"))?;

    substitute_cookie(
        &mut packet,
        &config.auth_protocol,
        &config.fake_cookie,
        &config.real_cookie,
    )?;

    match parse_display(&config.display)? {
        DisplayTarget::Unix(path) => {
            let mut local = tokio::net::UnixStream::connect(&path)
                .await
                .map_err(|e| format!("cannot reach X server at [{path}]: {e}"))?;
            local
                .write_all(&packet)
                .await
                .map_err(|e| format!("cannot relay X11 setup: {e}"))?;
            connect_pipe(stream, local).await;
        }
        DisplayTarget::Tcp(host, port) => {
            let mut local = tokio::net::TcpStream::connect((host.as_str(), port))
                .await
                .map_err(|e| format!("cannot reach X server at [{host}:{port}]: {e}"))?;
            local
                .write_all(&packet)
                .await
                .map_err(|e| format!("cannot relay X11 setup: {e}"))?;
            connect_pipe(stream, local).await;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_setup(byte_order: u8, proto: &[u8], cookie: &[u8]) -> Vec<u8> {
        let mut packet = vec![0u8; 12];
        packet[0] = byte_order;
        let write_u16 = |packet: &mut Vec<u8>, at: usize, value: u16| {
            let bytes = if byte_order == 0x42 {
                value.to_be_bytes()
            } else {
                value.to_le_bytes()
            };
            packet[at] = bytes[0];
            packet[at + 1] = bytes[1];
        };
        write_u16(&mut packet, 6, proto.len() as u16);
        write_u16(&mut packet, 8, cookie.len() as u16);
        packet.extend_from_slice(proto);
        packet.resize(12 + pad4(proto.len()), 0);
        packet.extend_from_slice(cookie);
        packet.resize(12 + pad4(proto.len()) + pad4(cookie.len()), 0);
        packet
    }

    #[test]
    fn test_cookie_swap_msb() {
        let proto = b"MIT-MAGIC-COOKIE-1"; // 18 bytes, padded to 20
        let fake: Vec<u8> = (0..16).collect();
        let real: Vec<u8> = (100..116).collect();
        let mut packet = build_setup(0x42, proto, &fake);
        let original = packet.clone();

        substitute_cookie(&mut packet, AUTH_PROTOCOL, &fake, &real).unwrap();

        let cookie_start = 12 + pad4(proto.len());
        assert_eq!(&packet[cookie_start..cookie_start + 16], &real[..]);
        // every byte outside the cookie window is untouched
        assert_eq!(&packet[..cookie_start], &original[..cookie_start]);
        assert_eq!(
            &packet[cookie_start + 16..],
            &original[cookie_start + 16..]
        );
    }

    #[test]
    fn test_cookie_swap_lsb() {
        let fake = vec![7u8; 16];
        let real = vec![9u8; 16];
        let mut packet = build_setup(0x6c, AUTH_PROTOCOL.as_bytes(), &fake);
        substitute_cookie(&mut packet, AUTH_PROTOCOL, &fake, &real).unwrap();
        let cookie_start = 12 + pad4(AUTH_PROTOCOL.len());
        assert_eq!(&packet[cookie_start..cookie_start + 16], &real[..]);
    }

    #[test]
    fn test_rejects_wrong_cookie() {
        let fake = vec![7u8; 16];
        let wrong = vec![8u8; 16];
        let real = vec![9u8; 16];
        let mut packet = build_setup(0x42, AUTH_PROTOCOL.as_bytes(), &wrong);
        assert!(substitute_cookie(&mut packet, AUTH_PROTOCOL, &fake, &real).is_err());
    }

    #[test]
    fn test_rejects_unknown_byte_order() {
        let fake = vec![7u8; 16];
        let mut packet = build_setup(0x55, AUTH_PROTOCOL.as_bytes(), &fake);
        assert!(substitute_cookie(&mut packet, AUTH_PROTOCOL, &fake, &fake.clone()).is_err());
    }

    #[test]
    fn test_parse_display_forms() {
        assert!(matches!(
            parse_display(":0").unwrap(),
            DisplayTarget::Unix(path) if path == "/tmp/.X11-unix/X0"
        ));
        assert!(matches!(
            parse_display(":1.0").unwrap(),
            DisplayTarget::Unix(path) if path == "/tmp/.X11-unix/X1"
        ));
        assert!(matches!(
            parse_display("unix:3").unwrap(),
            DisplayTarget::Unix(path) if path == "/tmp/.X11-unix/X3"
        ));
        assert!(matches!(
            parse_display("remote.host:2").unwrap(),
            DisplayTarget::Tcp(host, 6002) if host == "remote.host"
        ));
        assert!(matches!(
            parse_display("/run/x11/sock:0").unwrap(),
            DisplayTarget::Unix(path) if path == "/run/x11/sock"
        ));
        assert!(parse_display("garbage").is_err());
    }
}
