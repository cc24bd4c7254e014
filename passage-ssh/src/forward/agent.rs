//! Authentication-agent forwarding: resolve the local agent endpoint and
//! splice every `auth-agent@openssh.com` channel onto a fresh agent
//! connection.

use passage_core::config::expand_tilde;
use passage_core::Services;
use russh::client::Msg;
use russh::Channel;
use tracing::*;

use crate::connect_pipe;

/// `IdentityAgent` beats `$SSH_AUTH_SOCK`; there is no platform default
/// socket on Unix.
pub(crate) fn resolve_agent_endpoint(services: &Services, alias: &str) -> Option<String> {
    if let Some(configured) = services.config.get_optional(alias, "IdentityAgent") {
        if configured.eq_ignore_ascii_case("none") {
            return None;
        }
        if configured == "SSH_AUTH_SOCK" {
            return std::env::var("SSH_AUTH_SOCK").ok().filter(|v| !v.is_empty());
        }
        return Some(expand_tilde(&configured));
    }
    std::env::var("SSH_AUTH_SOCK").ok().filter(|v| !v.is_empty())
}

/// Requests land here after `auth-agent-req@openssh.com` succeeded; the
/// channel's requests are simply relayed to the local agent.
pub(crate) fn serve_channel(channel: Channel<Msg>, endpoint: String) {
    tokio::spawn(async move {
        match tokio::net::UnixStream::connect(&endpoint).await {
            Ok(agent) => {
                debug!(%endpoint, "agent channel attached");
                connect_pipe(agent, channel.into_stream()).await;
            }
            Err(error) => {
                warn!(%endpoint, %error, "cannot reach the authentication agent");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use passage_core::config::{ConfigStore, SecretStore};
    use passage_core::Lifecycle;

    use super::*;

    fn services(config: &str) -> Services {
        let dir = std::env::temp_dir().join(format!(
            "passage-agent-{}-{}",
            std::process::id(),
            config.len()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("config"), config).unwrap();
        Services {
            config: Arc::new(ConfigStore::load(&dir.join("config"), &dir.join("missing"))),
            secrets: Arc::new(SecretStore::load(&dir.join("missing"))),
            lifecycle: Lifecycle::new(),
        }
    }

    #[test]
    fn test_identity_agent_override() {
        let services = services("Host web\n  IdentityAgent /run/agent.sock\n");
        assert_eq!(
            resolve_agent_endpoint(&services, "web").as_deref(),
            Some("/run/agent.sock")
        );
    }

    #[test]
    fn test_identity_agent_none_disables() {
        let services = services("Host web\n  IdentityAgent none\n");
        assert_eq!(resolve_agent_endpoint(&services, "web"), None);
    }
}
