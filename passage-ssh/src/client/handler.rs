use std::sync::Arc;

use russh::client::{Msg, Session};
use russh::keys::PublicKey;
use russh::Channel;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;
use tracing::*;

use crate::known_hosts::{KnownHostValidationResult, KnownHosts};
use crate::{ForwardedStreamlocalParams, ForwardedTcpIpParams};

/// `StrictHostKeyChecking` policy for unknown host keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrictHostKeyChecking {
    Yes,
    AcceptNew,
    Ask,
}

impl StrictHostKeyChecking {
    pub fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "yes" => Self::Yes,
            "accept-new" | "no" | "off" => Self::AcceptNew,
            _ => Self::Ask,
        }
    }
}

#[derive(Debug)]
pub enum ClientHandlerEvent {
    HostKeyReceived(PublicKey),
    HostKeyUnknown(PublicKey, oneshot::Sender<bool>),
    Banner(String),
    ForwardedTcpIp(Channel<Msg>, ForwardedTcpIpParams),
    ForwardedStreamlocal(Channel<Msg>, ForwardedStreamlocalParams),
    AgentForward(Channel<Msg>),
    X11(Channel<Msg>, String, u32),
    Disconnect,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientHandlerError {
    #[error("host key for [{host}] changed: known {key_type} key is {fingerprint}")]
    HostKeyChanged {
        host: String,
        key_type: String,
        fingerprint: String,
    },

    #[error("host key for [{host}] rejected")]
    HostKeyRejected { host: String },

    #[error(transparent)]
    Ssh(#[from] russh::Error),

    #[error("internal error")]
    Internal,
}

pub struct ClientHandler {
    pub host: String,
    pub port: u16,
    pub known_hosts: Arc<KnownHosts>,
    pub strict: StrictHostKeyChecking,
    pub event_tx: UnboundedSender<ClientHandlerEvent>,
}

impl russh::client::Handler for ClientHandler {
    type Error = ClientHandlerError;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        let _ = self
            .event_tx
            .send(ClientHandlerEvent::HostKeyReceived(server_public_key.clone()));
        match self
            .known_hosts
            .validate(&self.host, self.port, server_public_key)
        {
            KnownHostValidationResult::Valid => Ok(true),
            KnownHostValidationResult::Invalid {
                key_type,
                fingerprint,
            } => Err(ClientHandlerError::HostKeyChanged {
                host: self.host.clone(),
                key_type,
                fingerprint,
            }),
            KnownHostValidationResult::Unknown => match self.strict {
                StrictHostKeyChecking::Yes => {
                    warn!(host = %self.host, "no host key on record and StrictHostKeyChecking=yes");
                    Err(ClientHandlerError::HostKeyRejected {
                        host: self.host.clone(),
                    })
                }
                StrictHostKeyChecking::AcceptNew => {
                    self.known_hosts
                        .trust(&self.host, self.port, server_public_key);
                    Ok(true)
                }
                StrictHostKeyChecking::Ask => {
                    let (tx, rx) = oneshot::channel();
                    self.event_tx
                        .send(ClientHandlerEvent::HostKeyUnknown(
                            server_public_key.clone(),
                            tx,
                        ))
                        .map_err(|_| ClientHandlerError::Internal)?;
                    let accepted = rx.await.map_err(|_| ClientHandlerError::Internal)?;
                    if accepted {
                        self.known_hosts
                            .trust(&self.host, self.port, server_public_key);
                        Ok(true)
                    } else {
                        Err(ClientHandlerError::HostKeyRejected {
                            host: self.host.clone(),
                        })
                    }
                }
            },
        }
    }

    async fn auth_banner(&mut self, banner: &str, _session: &mut Session) -> Result<(), Self::Error> {
        let _ = self
            .event_tx
            .send(ClientHandlerEvent::Banner(banner.to_owned()));
        Ok(())
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let _ = self.event_tx.send(ClientHandlerEvent::ForwardedTcpIp(
            channel,
            ForwardedTcpIpParams {
                connected_address: connected_address.to_owned(),
                connected_port,
                originator_address: originator_address.to_owned(),
                originator_port,
            },
        ));
        Ok(())
    }

    async fn server_channel_open_forwarded_streamlocal(
        &mut self,
        channel: Channel<Msg>,
        socket_path: &str,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let _ = self
            .event_tx
            .send(ClientHandlerEvent::ForwardedStreamlocal(
                channel,
                ForwardedStreamlocalParams {
                    socket_path: socket_path.to_owned(),
                },
            ));
        Ok(())
    }

    async fn server_channel_open_agent_forward(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let _ = self.event_tx.send(ClientHandlerEvent::AgentForward(channel));
        Ok(())
    }

    async fn server_channel_open_x11(
        &mut self,
        channel: Channel<Msg>,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let _ = self.event_tx.send(ClientHandlerEvent::X11(
            channel,
            originator_address.to_owned(),
            originator_port,
        ));
        Ok(())
    }
}

impl Drop for ClientHandler {
    fn drop(&mut self) {
        let _ = self.event_tx.send(ClientHandlerEvent::Disconnect);
        debug!(host = %self.host, "handler dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strict_parse() {
        assert_eq!(StrictHostKeyChecking::parse("yes"), StrictHostKeyChecking::Yes);
        for lenient in ["accept-new", "no", "off", "No", "OFF"] {
            assert_eq!(
                StrictHostKeyChecking::parse(lenient),
                StrictHostKeyChecking::AcceptNew
            );
        }
        for ask in ["ask", "", "anything"] {
            assert_eq!(StrictHostKeyChecking::parse(ask), StrictHostKeyChecking::Ask);
        }
    }
}
