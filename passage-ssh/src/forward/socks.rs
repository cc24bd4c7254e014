//! Dynamic forwarding: a minimal SOCKS5 (RFC 1928) server whose CONNECT
//! dials through the tunnel. Domains are passed to the SSH side verbatim,
//! never resolved locally.

use std::sync::Arc;

use passage_common::PassageError;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::*;

use super::{listen_addresses, BindSpec};
use crate::{connect_pipe, SshConnection};

const SOCKS_VERSION: u8 = 0x05;
const NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;

const REPLY_SUCCESS: [u8; 10] = [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
const REPLY_HOST_UNREACHABLE: [u8; 10] = [0x05, 0x04, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
const REPLY_COMMAND_UNSUPPORTED: [u8; 10] = [0x05, 0x07, 0x00, 0x01, 0, 0, 0, 0, 0, 0];

pub async fn install(
    connection: &Arc<SshConnection>,
    bind: BindSpec,
    gateway: bool,
) -> Result<(), PassageError> {
    if bind.is_unix() {
        return Err(PassageError::ForwardSpec(
            "dynamic forwarding needs a TCP listen port".to_owned(),
        ));
    }

    // both the v4 and v6 loopback listeners are opened; the kernel decides
    // which one a client reaches
    let mut bound = 0usize;
    let mut last_error: Option<std::io::Error> = None;
    for addr in listen_addresses(&bind, gateway) {
        match TcpListener::bind(&addr).await {
            Ok(listener) => {
                info!(%addr, "SOCKS5 listener up");
                bound += 1;
                let connection = connection.clone();
                tokio::spawn(async move {
                    loop {
                        match listener.accept().await {
                            Ok((stream, peer)) => {
                                debug!(%peer, "socks client connected");
                                let connection = connection.clone();
                                tokio::spawn(async move {
                                    if let Err(error) = handle_client(stream, connection).await {
                                        // per-connection failures never stop the accept loop
                                        debug!(%peer, %error, "socks request failed");
                                    }
                                });
                            }
                            Err(error) => {
                                warn!(%addr, %error, "socks accept failed");
                                break;
                            }
                        }
                    }
                });
            }
            Err(error) => {
                debug!(%addr, %error, "cannot bind socks listener");
                last_error = Some(error);
            }
        }
    }
    if bound == 0 {
        return Err(PassageError::ForwardDenied {
            addr: bind.to_string(),
            source: last_error
                .unwrap_or_else(|| std::io::Error::from(std::io::ErrorKind::AddrNotAvailable)),
        });
    }
    Ok(())
}

async fn handle_client(
    mut stream: TcpStream,
    connection: Arc<SshConnection>,
) -> Result<(), PassageError> {
    let (host, port) = match handshake(&mut stream).await? {
        Some(dest) => dest,
        None => return Ok(()),
    };

    match connection.dial_through(&host, u32::from(port)).await {
        Ok(channel) => {
            stream
                .write_all(&REPLY_SUCCESS)
                .await
                .map_err(PassageError::Io)?;
            connect_pipe(stream, channel).await;
            Ok(())
        }
        Err(error) => {
            let _ = stream.write_all(&REPLY_HOST_UNREACHABLE).await;
            match error {
                // the dial timeout is routine chatter, not a failure report
                PassageError::TimeoutExceeded => {
                    debug!(%host, port, "socks dial timed out");
                    Ok(())
                }
                other => Err(other),
            }
        }
    }
}

/// Negotiates no-auth and reads the CONNECT request. `Ok(None)` means the
/// request was answered with an error reply already.
async fn handshake(stream: &mut TcpStream) -> Result<Option<(String, u16)>, PassageError> {
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await.map_err(PassageError::Io)?;
    if head[0] != SOCKS_VERSION {
        return Err(PassageError::Config(format!(
            "unsupported socks version {:#x}",
            head[0]
        )));
    }
    let mut methods = vec![0u8; head[1] as usize];
    stream
        .read_exact(&mut methods)
        .await
        .map_err(PassageError::Io)?;
    stream
        .write_all(&[SOCKS_VERSION, NO_AUTH])
        .await
        .map_err(PassageError::Io)?;

    let mut request = [0u8; 4];
    stream
        .read_exact(&mut request)
        .await
        .map_err(PassageError::Io)?;
    if request[1] != CMD_CONNECT {
        let _ = stream.write_all(&REPLY_COMMAND_UNSUPPORTED).await;
        return Ok(None);
    }

    let host = match request[3] {
        0x01 => {
            let mut raw = [0u8; 4];
            stream.read_exact(&mut raw).await.map_err(PassageError::Io)?;
            std::net::Ipv4Addr::from(raw).to_string()
        }
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await.map_err(PassageError::Io)?;
            let mut raw = vec![0u8; len[0] as usize];
            stream.read_exact(&mut raw).await.map_err(PassageError::Io)?;
            String::from_utf8_lossy(&raw).into_owned()
        }
        0x04 => {
            let mut raw = [0u8; 16];
            stream.read_exact(&mut raw).await.map_err(PassageError::Io)?;
            std::net::Ipv6Addr::from(raw).to_string()
        }
        other => {
            let _ = stream.write_all(&REPLY_COMMAND_UNSUPPORTED).await;
            return Err(PassageError::Config(format!(
                "unsupported socks address type {other:#x}"
            )));
        }
    };
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await.map_err(PassageError::Io)?;
    Ok(Some((host, u16::from_be_bytes(port))))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run_handshake(request: Vec<u8>) -> Result<Option<(String, u16)>, PassageError> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(&request).await.unwrap();
            let mut reply = vec![0u8; 2];
            let _ = stream.read_exact(&mut reply).await;
            stream
        });
        let (mut server_side, _) = listener.accept().await.unwrap();
        let result = handshake(&mut server_side).await;
        let _ = client.await;
        result
    }

    #[tokio::test]
    async fn test_connect_with_domain() {
        let mut request = vec![0x05, 0x01, 0x00]; // greeting: one method, no auth
        request.extend_from_slice(&[0x05, 0x01, 0x00, 0x03]); // CONNECT, domain
        request.push(11);
        request.extend_from_slice(b"example.com");
        request.extend_from_slice(&443u16.to_be_bytes());

        let dest = run_handshake(request).await.unwrap().unwrap();
        // the domain is handed over verbatim, never resolved here
        assert_eq!(dest, ("example.com".to_owned(), 443));
    }

    #[tokio::test]
    async fn test_connect_with_ipv4() {
        let mut request = vec![0x05, 0x01, 0x00];
        request.extend_from_slice(&[0x05, 0x01, 0x00, 0x01, 10, 0, 0, 7]);
        request.extend_from_slice(&8080u16.to_be_bytes());
        let dest = run_handshake(request).await.unwrap().unwrap();
        assert_eq!(dest, ("10.0.0.7".to_owned(), 8080));
    }

    #[tokio::test]
    async fn test_rejects_bind_command() {
        let mut request = vec![0x05, 0x01, 0x00];
        request.extend_from_slice(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1]); // BIND
        request.extend_from_slice(&8080u16.to_be_bytes());
        let dest = run_handshake(request).await.unwrap();
        assert!(dest.is_none());
    }

    #[tokio::test]
    async fn test_rejects_wrong_version() {
        let request = vec![0x04, 0x01, 0x00];
        assert!(run_handshake(request).await.is_err());
    }
}
