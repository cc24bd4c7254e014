//! TCP and Unix-domain stream forwarding, local and remote.

use std::sync::Arc;

use passage_common::PassageError;
use tokio::net::{TcpListener, UnixListener};
use tracing::*;

use super::{listen_addresses, ForwardSpec};
use crate::client::RemoteTarget;
use crate::{connect_pipe, SshConnection};

/// Opens local listeners for a `-L` spec and bridges every accepted
/// connection through the tunnel.
pub async fn install_local(
    connection: &Arc<SshConnection>,
    spec: ForwardSpec,
    gateway: bool,
) -> Result<(), PassageError> {
    let bind = spec.bind_spec();
    if bind.is_unix() {
        let path = bind.addr.clone().unwrap_or_default();
        let listener = UnixListener::bind(&path).map_err(|source| PassageError::ForwardDenied {
            addr: path.clone(),
            source,
        })?;
        info!(%path, dest = %spec.dest_host, "listening on unix socket");
        let cleanup = path.clone();
        connection.services.lifecycle.on_close(move || {
            let _ = std::fs::remove_file(&cleanup);
        });
        let connection = connection.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => serve_local_connection(&connection, &spec, stream),
                    Err(error) => {
                        warn!(%path, %error, "unix accept failed");
                        break;
                    }
                }
            }
        });
        return Ok(());
    }

    let mut bound = 0usize;
    let mut last_error: Option<std::io::Error> = None;
    for addr in listen_addresses(&bind, gateway) {
        match TcpListener::bind(&addr).await {
            Ok(listener) => {
                info!(%addr, dest = %format_dest(&spec), "listening");
                bound += 1;
                let connection = connection.clone();
                let spec = spec.clone();
                tokio::spawn(async move {
                    loop {
                        match listener.accept().await {
                            Ok((stream, peer)) => {
                                debug!(%peer, "accepted forward connection");
                                let _ = stream.set_nodelay(true);
                                serve_local_connection(&connection, &spec, stream);
                            }
                            Err(error) => {
                                warn!(%addr, %error, "accept failed");
                                break;
                            }
                        }
                    }
                });
            }
            Err(error) => {
                debug!(%addr, %error, "cannot bind");
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

fn format_dest(spec: &ForwardSpec) -> String {
    if spec.dest_is_unix() {
        spec.dest_host.clone()
    } else {
        format!("{}:{}", spec.dest_host, spec.dest_port)
    }
}

fn serve_local_connection<S>(connection: &Arc<SshConnection>, spec: &ForwardSpec, stream: S)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static,
{
    let connection = connection.clone();
    let spec = spec.clone();
    tokio::spawn(async move {
        let dest = format_dest(&spec);
        let remote = if spec.dest_is_unix() {
            connection
                .open_direct_streamlocal(&spec.dest_host)
                .await
                .map(|c| c.into_stream())
        } else {
            connection
                .dial_through(&spec.dest_host, spec.dest_port as u32)
                .await
        };
        match remote {
            Ok(remote) => {
                connect_pipe(stream, remote).await;
            }
            Err(error) => {
                warn!(%dest, %error, "cannot open forward channel");
            }
        }
    });
}

/// Requests server-side listeners for a `-R` spec and records where the
/// forwarded channels should land locally.
pub async fn install_remote(
    connection: &Arc<SshConnection>,
    spec: ForwardSpec,
    gateway: bool,
) -> Result<(), PassageError> {
    let target = if spec.dest_is_unix() {
        RemoteTarget::Unix(spec.dest_host.clone())
    } else {
        RemoteTarget::Tcp(spec.dest_host.clone(), spec.dest_port as u32)
    };

    let bind = spec.bind_spec();
    if bind.is_unix() {
        let path = bind.addr.clone().unwrap_or_default();
        connection.streamlocal_forward(&path).await?;
        connection.register_remote_unix_target(&path, target).await;
        info!(%path, "remote unix forward installed");
        return Ok(());
    }

    let port = spec.bind_port as u32;
    let addresses: Vec<String> = match &bind.addr {
        None if gateway => vec!["0.0.0.0".into(), "::".into()],
        None => vec!["127.0.0.1".into(), "::1".into()],
        Some(addr) if addr.is_empty() || addr == "*" => vec!["0.0.0.0".into(), "::".into()],
        Some(addr) => vec![addr.clone()],
    };

    let mut installed = 0usize;
    for (index, address) in addresses.iter().enumerate() {
        match connection.tcpip_forward(address, port).await {
            Ok(()) => {
                connection
                    .register_remote_tcp_target(address, port, target.clone())
                    .await;
                installed += 1;
            }
            Err(error) => {
                // the v6 sibling of a dual bind quietly not working is routine
                if index > 0 {
                    debug!(%address, port, %error, "remote listener not available");
                } else {
                    warn!(%address, port, %error, "remote listener failed");
                }
            }
        }
    }
    if installed == 0 {
        return Err(PassageError::ForwardDenied {
            addr: format!("{bind}"),
            source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
        });
    }
    info!(bind = %bind, dest = %format_dest(&spec), "remote forward installed");
    Ok(())
}
