//! The forwarding engine: spec parsing, listener setup per the gateway
//! rules, and the per-protocol forwarders.

pub(crate) mod agent;
mod socks;
mod spec;
mod tcp;
mod udp;
pub(crate) mod x11;

use std::sync::Arc;

use passage_common::PassageError;
use russh::client::Msg;
use russh::Channel;
use tracing::*;

pub use spec::{BindSpec, ForwardSpec, UNIX_PORT};

use crate::client::RemoteTarget;
use crate::{ForwardedTcpIpParams, SshArgs, SshConnection};

/// Transport selector carried by a spec's optional `udp://` scheme prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    Tcp,
    Udp,
}

pub fn strip_scheme(raw: &str) -> (Proto, &str) {
    if let Some(rest) = raw.strip_prefix("udp://") {
        return (Proto::Udp, rest);
    }
    (Proto::Tcp, raw.strip_prefix("tcp://").unwrap_or(raw))
}

/// The §gateway rule: which sockets a bind spec opens.
pub fn listen_addresses(bind: &BindSpec, gateway: bool) -> Vec<String> {
    match &bind.addr {
        None if gateway => vec![
            format!("0.0.0.0:{}", bind.port),
            format!("[::]:{}", bind.port),
        ],
        None => vec![
            format!("127.0.0.1:{}", bind.port),
            format!("[::1]:{}", bind.port),
        ],
        Some(addr) if addr.is_empty() || addr == "*" => vec![
            format!("0.0.0.0:{}", bind.port),
            format!("[::]:{}", bind.port),
        ],
        Some(addr) if addr.contains(':') => vec![format!("[{addr}]:{}", bind.port)],
        Some(addr) => vec![format!("{addr}:{}", bind.port)],
    }
}

/// Installs every requested forward on a live connection. Listener failures
/// are warned and skipped unless `ExitOnForwardFailure` is set.
pub async fn install_forwards(
    connection: &Arc<SshConnection>,
    args: &SshArgs,
) -> Result<(), PassageError> {
    let services = &connection.services;
    let alias = &connection.param.alias;

    if services
        .config
        .get(alias, "ClearAllForwardings")
        .eq_ignore_ascii_case("yes")
    {
        warn!("ClearAllForwardings is set, dropping every forwarding request");
        return Ok(());
    }

    let exit_on_failure = services
        .config
        .get(alias, "ExitOnForwardFailure")
        .eq_ignore_ascii_case("yes");
    let gateway = args.gateway_ports
        || services
            .config
            .get(alias, "GatewayPorts")
            .eq_ignore_ascii_case("yes");

    let mut locals: Vec<String> = args.local_forwards.clone();
    locals.extend(services.config.get_all(alias, "LocalForward"));
    for raw in locals {
        let (proto, rest) = strip_scheme(&raw);
        let result = match ForwardSpec::parse(rest) {
            Ok(spec) => match proto {
                Proto::Udp => udp::install_local(connection, spec, gateway).await,
                Proto::Tcp => tcp::install_local(connection, spec, gateway).await,
            },
            Err(error) => Err(error),
        };
        if let Err(error) = result {
            if exit_on_failure {
                return Err(error);
            }
            warn!(forward = %raw, %error, "cannot install local forward");
        }
    }

    let mut remotes: Vec<String> = args.remote_forwards.clone();
    remotes.extend(services.config.get_all(alias, "RemoteForward"));
    for raw in remotes {
        let (proto, rest) = strip_scheme(&raw);
        let result = match ForwardSpec::parse(rest) {
            Ok(spec) => match proto {
                Proto::Udp => udp::install_remote(connection, spec, gateway).await,
                Proto::Tcp => tcp::install_remote(connection, spec, gateway).await,
            },
            Err(error) => Err(error),
        };
        if let Err(error) = result {
            if exit_on_failure {
                return Err(error);
            }
            warn!(forward = %raw, %error, "cannot install remote forward");
        }
    }

    let mut dynamics: Vec<String> = args.dynamic_forwards.clone();
    dynamics.extend(services.config.get_all_splits(alias, "DynamicForward"));
    for raw in dynamics {
        let result = match BindSpec::parse(&raw) {
            Ok(bind) => socks::install(connection, bind, gateway).await,
            Err(error) => Err(error),
        };
        if let Err(error) = result {
            if exit_on_failure {
                return Err(error);
            }
            warn!(forward = %raw, %error, "cannot install dynamic forward");
        }
    }

    Ok(())
}

/// Delivers a server-initiated forwarded channel to its local destination.
pub(crate) fn serve_remote_channel(
    channel: Channel<Msg>,
    target: RemoteTarget,
    params: &ForwardedTcpIpParams,
) {
    debug!(%params, ?target, "incoming forwarded connection");
    tokio::spawn(async move {
        match target {
            RemoteTarget::Tcp(host, port) => {
                match tokio::net::TcpStream::connect((host.as_str(), port as u16)).await {
                    Ok(local) => {
                        crate::connect_pipe(local, channel.into_stream()).await;
                    }
                    Err(error) => {
                        warn!(%host, port, %error, "cannot reach forward destination");
                    }
                }
            }
            RemoteTarget::Unix(path) => match tokio::net::UnixStream::connect(&path).await {
                Ok(local) => {
                    crate::connect_pipe(local, channel.into_stream()).await;
                }
                Err(error) => {
                    warn!(%path, %error, "cannot reach forward destination");
                }
            },
            RemoteTarget::Udp(host, port) => {
                udp::serve_remote_channel(channel, host, port).await;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_rule_table() {
        let loopback = BindSpec::parse("8000").unwrap();
        assert_eq!(
            listen_addresses(&loopback, false),
            vec!["127.0.0.1:8000", "[::1]:8000"]
        );
        assert_eq!(
            listen_addresses(&loopback, true),
            vec!["0.0.0.0:8000", "[::]:8000"]
        );
        let all = BindSpec::parse("*:8000").unwrap();
        assert_eq!(
            listen_addresses(&all, false),
            vec!["0.0.0.0:8000", "[::]:8000"]
        );
        let v6 = BindSpec::parse("[fe80::1]:8000").unwrap();
        assert_eq!(listen_addresses(&v6, true), vec!["[fe80::1]:8000"]);
        let plain = BindSpec::parse("10.0.0.5:8000").unwrap();
        assert_eq!(listen_addresses(&plain, false), vec!["10.0.0.5:8000"]);
    }

    #[test]
    fn test_scheme_prefix() {
        assert_eq!(strip_scheme("udp://8053:1.1.1.1:53"), (Proto::Udp, "8053:1.1.1.1:53"));
        assert_eq!(strip_scheme("8080:web:80"), (Proto::Tcp, "8080:web:80"));
        assert_eq!(strip_scheme("tcp://8080:web:80"), (Proto::Tcp, "8080:web:80"));
    }
}
