//! Authentication method assembly and execution: public keys (agent first,
//! then identity files, certificates included), keyboard-interactive with
//! configured answers, then passwords.

mod interactive;
mod signers;

use passage_common::{PassageError, Secret};
use passage_core::{LoginParam, Services};
use russh::client::{Handle, KeyboardInteractiveAuthResponse};
use russh::keys::agent::client::AgentClient;
use russh::keys::agent::AgentIdentity;
use russh::keys::{HashAlg, PrivateKeyWithHashAlg};
use tracing::*;

use crate::client::handler::ClientHandler;
use crate::forward::agent::resolve_agent_endpoint;
use crate::SshArgs;
use interactive::InteractiveAnswers;
use signers::load_signers;

const KEYBOARD_INTERACTIVE_ROUNDS: usize = 3;
const PASSWORD_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    Authenticated,
    Exhausted,
}

fn enabled(services: &Services, alias: &str, key: &str) -> bool {
    !services.config.get(alias, key).eq_ignore_ascii_case("no")
}

/// Runs the assembled method list against a freshly connected session.
pub async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    services: &Services,
    param: &LoginParam,
    args: &SshArgs,
) -> Result<(), PassageError> {
    let alias = &param.alias;

    if enabled(services, alias, "PubkeyAuthentication") {
        if try_publickey(handle, services, param, args).await? == AuthOutcome::Authenticated {
            return Ok(());
        }
    }
    if enabled(services, alias, "KbdInteractiveAuthentication") {
        if try_keyboard_interactive(handle, services, param).await? == AuthOutcome::Authenticated {
            return Ok(());
        }
    }
    if enabled(services, alias, "PasswordAuthentication") {
        if try_password(handle, services, param).await? == AuthOutcome::Authenticated {
            return Ok(());
        }
    }

    Err(PassageError::AuthExhausted {
        user: param.user.clone(),
        addr: param.addr(),
    })
}

async fn try_publickey(
    handle: &mut Handle<ClientHandler>,
    services: &Services,
    param: &LoginParam,
    args: &SshArgs,
) -> Result<AuthOutcome, PassageError> {
    let hash_alg = best_rsa_hash(handle).await;
    let identities_only = services
        .config
        .get(&param.alias, "IdentitiesOnly")
        .eq_ignore_ascii_case("yes");

    if !identities_only {
        if let AuthOutcome::Authenticated =
            try_agent_keys(handle, services, param, hash_alg).await
        {
            return Ok(AuthOutcome::Authenticated);
        }
    }

    let passphrase = services.secrets.get_secret(&param.alias, "Passphrase");
    for signer in load_signers(services, param, args) {
        let key = match signer.unlock(passphrase.clone()).await {
            Ok(key) => key,
            Err(error) => {
                warn!(path = %signer.path().display(), %error, "skipping identity");
                continue;
            }
        };
        if let Some(certificate) = signer.certificate() {
            match handle
                .authenticate_openssh_cert(param.user.as_str(), key.clone(), certificate.clone())
                .await
            {
                Ok(result) if result.success() => {
                    debug!(path = %signer.path().display(), "authenticated with certificate");
                    return Ok(AuthOutcome::Authenticated);
                }
                Ok(_) => {}
                Err(error) => debug!(%error, "certificate authentication failed"),
            }
        }
        match handle
            .authenticate_publickey(
                param.user.as_str(),
                PrivateKeyWithHashAlg::new(key, hash_alg),
            )
            .await
        {
            Ok(result) if result.success() => {
                debug!(path = %signer.path().display(), "authenticated with public key");
                return Ok(AuthOutcome::Authenticated);
            }
            Ok(_) => debug!(path = %signer.path().display(), "public key rejected"),
            Err(error) => debug!(%error, "public key attempt failed"),
        }
    }
    Ok(AuthOutcome::Exhausted)
}

async fn try_agent_keys(
    handle: &mut Handle<ClientHandler>,
    services: &Services,
    param: &LoginParam,
    hash_alg: Option<HashAlg>,
) -> AuthOutcome {
    let Some(endpoint) = resolve_agent_endpoint(services, &param.alias) else {
        return AuthOutcome::Exhausted;
    };
    let mut agent = match AgentClient::connect_uds(&endpoint).await {
        Ok(agent) => agent,
        Err(error) => {
            debug!(%endpoint, %error, "cannot reach the authentication agent");
            return AuthOutcome::Exhausted;
        }
    };
    let identities = match agent.request_identities().await {
        Ok(identities) => identities,
        Err(error) => {
            debug!(%error, "agent refused to list identities");
            return AuthOutcome::Exhausted;
        }
    };
    for identity in identities {
        let result = match identity {
            AgentIdentity::PublicKey { key, .. } => {
                let fingerprint = key.fingerprint(HashAlg::Sha256).to_string();
                let outcome = handle
                    .authenticate_publickey_with(param.user.as_str(), key, hash_alg, &mut agent)
                    .await;
                (fingerprint, outcome)
            }
            AgentIdentity::Certificate { certificate, .. } => {
                let fingerprint = certificate.public_key().fingerprint(HashAlg::Sha256).to_string();
                let outcome = handle
                    .authenticate_certificate_with(
                        param.user.as_str(),
                        certificate,
                        hash_alg,
                        &mut agent,
                    )
                    .await;
                (fingerprint, outcome)
            }
        };
        let (fingerprint, outcome) = result;
        match outcome {
            Ok(result) if result.success() => {
                debug!(%fingerprint, "authenticated with agent key");
                return AuthOutcome::Authenticated;
            }
            Ok(_) => debug!(%fingerprint, "agent key rejected"),
            Err(error) => debug!(%fingerprint, %error, "agent attempt failed"),
        }
    }
    AuthOutcome::Exhausted
}

async fn best_rsa_hash(handle: &mut Handle<ClientHandler>) -> Option<HashAlg> {
    match handle.best_supported_rsa_hash().await {
        Ok(hash) => hash.flatten(),
        Err(error) => {
            debug!(%error, "cannot query rsa-sha2 support");
            None
        }
    }
}

async fn try_keyboard_interactive(
    handle: &mut Handle<ClientHandler>,
    services: &Services,
    param: &LoginParam,
) -> Result<AuthOutcome, PassageError> {
    let mut answers = InteractiveAnswers::new(&param.alias);

    for round in 0..KEYBOARD_INTERACTIVE_ROUNDS {
        let mut response = match handle
            .authenticate_keyboard_interactive_start(param.user.as_str(), None)
            .await
        {
            Ok(response) => response,
            Err(error) => {
                debug!(%error, "keyboard-interactive not available");
                return Ok(AuthOutcome::Exhausted);
            }
        };
        loop {
            match response {
                KeyboardInteractiveAuthResponse::Success => {
                    debug!("authenticated with keyboard-interactive");
                    return Ok(AuthOutcome::Authenticated);
                }
                KeyboardInteractiveAuthResponse::Failure { .. } => {
                    debug!(round, "keyboard-interactive round failed");
                    break;
                }
                KeyboardInteractiveAuthResponse::InfoRequest {
                    name,
                    instructions,
                    prompts,
                } => {
                    if !name.trim().is_empty() {
                        eprintln!("{name}");
                    }
                    if !instructions.trim().is_empty() {
                        eprintln!("{instructions}");
                    }
                    let mut replies = Vec::with_capacity(prompts.len());
                    for prompt in prompts {
                        let reply = match answers.answer_for(services, &prompt.prompt).await {
                            Some(answer) => answer.expose_secret().clone(),
                            None => ask_user(&prompt.prompt, prompt.echo).await?,
                        };
                        replies.push(reply);
                    }
                    response = handle
                        .authenticate_keyboard_interactive_respond(replies)
                        .await
                        .map_err(PassageError::other)?;
                }
            }
        }
    }
    Ok(AuthOutcome::Exhausted)
}

async fn try_password(
    handle: &mut Handle<ClientHandler>,
    services: &Services,
    param: &LoginParam,
) -> Result<AuthOutcome, PassageError> {
    let mut configured = services.secrets.get_secret(&param.alias, "Password");

    for _ in 0..PASSWORD_ATTEMPTS {
        // the configured password is tried once, then we fall back to asking
        let password: Secret<String> = match configured.take() {
            Some(secret) => secret,
            None => {
                let prompt = format!("{}@{}'s password: ", param.user, param.host);
                Secret::new(ask_hidden(&prompt).await?)
            }
        };
        match handle
            .authenticate_password(param.user.as_str(), password.expose_secret())
            .await
        {
            Ok(result) if result.success() => {
                debug!("authenticated with password");
                return Ok(AuthOutcome::Authenticated);
            }
            Ok(_) => warn!("Permission denied, please try again."),
            Err(error) => {
                debug!(%error, "password attempt failed");
                return Ok(AuthOutcome::Exhausted);
            }
        }
    }
    Ok(AuthOutcome::Exhausted)
}

async fn ask_user(prompt: &str, echo: bool) -> Result<String, PassageError> {
    if echo {
        let prompt = prompt.to_owned();
        tokio::task::spawn_blocking(move || {
            dialoguer::Input::<String>::new()
                .with_prompt(prompt)
                .allow_empty(true)
                .interact_text()
        })
        .await
        .map_err(PassageError::other)?
        .map_err(|e| PassageError::Config(format!("prompt failed: {e}")))
    } else {
        ask_hidden(prompt).await
    }
}

async fn ask_hidden(prompt: &str) -> Result<String, PassageError> {
    let prompt = prompt.to_owned();
    tokio::task::spawn_blocking(move || {
        dialoguer::Password::new()
            .with_prompt(prompt)
            .allow_empty_password(true)
            .interact()
    })
    .await
    .map_err(PassageError::other)?
    .map_err(|e| PassageError::Config(format!("prompt failed: {e}")))
}
