//! Drives the session channel once forwarders are installed: environment,
//! pty, X11/agent requests, shell or command, stdio wiring and exit-code
//! propagation.

use std::io::IsTerminal;

use passage_common::PassageError;
use passage_core::config::pattern_matches;
use passage_core::tokens::{TokenExpander, PATH_TOKENS};
use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::*;

use crate::forward::agent::resolve_agent_endpoint;
use crate::forward::x11::X11Config;
use crate::{connect_pipe, SessionMode, SshArgs, SshConnection};

pub async fn run_session(
    connection: &SshConnection,
    args: &SshArgs,
    mode: SessionMode,
) -> Result<i32, PassageError> {
    run_local_command(connection).await;

    match mode {
        SessionMode::None => {
            connection.wait_closed().await;
            Ok(0)
        }
        SessionMode::StdioForward(host, port) => stdio_forward(connection, &host, port).await,
        SessionMode::Command(command) => run_command(connection, args, command).await,
    }
}

/// `PermitLocalCommand` + `LocalCommand`: runs on this side of the
/// connection, token-expanded, after a successful login.
async fn run_local_command(connection: &SshConnection) {
    let services = &connection.services;
    let alias = &connection.param.alias;
    if !services
        .config
        .get(alias, "PermitLocalCommand")
        .eq_ignore_ascii_case("yes")
    {
        return;
    }
    let Some(command) = services.config.get_optional(alias, "LocalCommand") else {
        return;
    };
    let expander = TokenExpander::new(&connection.param);
    let expanded = match expander.expand(&command, PATH_TOKENS) {
        Ok(expanded) => expanded,
        Err(error) => {
            warn!(%error, "cannot expand LocalCommand");
            return;
        }
    };
    debug!(command = %expanded, "running local command");
    match tokio::process::Command::new("/bin/sh")
        .arg("-c")
        .arg(&expanded)
        .status()
        .await
    {
        Ok(status) if !status.success() => warn!(?status, "LocalCommand failed"),
        Err(error) => warn!(%error, "cannot run LocalCommand"),
        _ => {}
    }
}

async fn stdio_forward(
    connection: &SshConnection,
    host: &str,
    port: u32,
) -> Result<i32, PassageError> {
    let channel = connection
        .open_direct_tcpip(host, port, "127.0.0.1", 0)
        .await
        .map_err(|e| PassageError::StdinWiring(format!("cannot reach [{host}:{port}]: {e}")))?;
    let stdio = tokio::io::join(tokio::io::stdin(), tokio::io::stdout());
    connect_pipe(stdio, channel.into_stream()).await;
    Ok(0)
}

fn wants_tty(connection: &SshConnection, args: &SshArgs, has_command: bool) -> bool {
    if args.disable_tty {
        return false;
    }
    if args.force_tty {
        return true;
    }
    match connection
        .services
        .config
        .get(&connection.param.alias, "RequestTTY")
        .to_lowercase()
        .as_str()
    {
        "yes" => true,
        "force" => true,
        "no" => false,
        _ => !has_command && std::io::stdin().is_terminal(),
    }
}

async fn run_command(
    connection: &SshConnection,
    args: &SshArgs,
    command: Option<String>,
) -> Result<i32, PassageError> {
    let services = &connection.services;
    let alias = &connection.param.alias;

    let mut channel = connection
        .open_session_channel()
        .await
        .map_err(|e| PassageError::OpenSession(e.to_string()))?;

    if let Some(endpoint) = agent_forward_endpoint(connection, args) {
        channel
            .agent_forward(true)
            .await
            .map_err(|e| PassageError::StartCommand(format!("agent forwarding: {e}")))?;
        if !wait_request_reply(&mut channel).await {
            return Err(PassageError::StartCommand(
                "agent forwarding request denied".to_owned(),
            ));
        }
        connection.enable_agent_forwarding(endpoint).await;
        debug!("agent forwarding enabled");
    }

    if let Some(x11) = x11_config(connection, args).await {
        channel
            .request_x11(
                true,
                false,
                x11.auth_protocol.clone(),
                x11.fake_cookie_hex(),
                0,
            )
            .await
            .map_err(|e| PassageError::StartCommand(format!("x11 forwarding: {e}")))?;
        if wait_request_reply(&mut channel).await {
            connection.enable_x11(x11).await;
            debug!("x11 forwarding enabled");
        } else {
            warn!("x11 forwarding request denied");
        }
    }

    send_environment(&mut channel, connection).await;

    let use_tty = wants_tty(connection, args, command.is_some());
    if use_tty {
        let term = std::env::var("TERM").unwrap_or_else(|_| "xterm-256color".to_owned());
        let (cols, rows) = terminal_size();
        channel
            .request_pty(false, &term, cols, rows, 0, 0, &[])
            .await
            .map_err(|e| PassageError::StartCommand(format!("pty request: {e}")))?;
    }

    let command = command.or_else(|| {
        services
            .config
            .get_optional(alias, "RemoteCommand")
            .filter(|c| !c.eq_ignore_ascii_case("none"))
    });
    match &command {
        Some(command) => {
            channel
                .exec(false, command.as_str())
                .await
                .map_err(|e| PassageError::StartCommand(format!("exec: {e}")))?;
        }
        None => {
            channel
                .request_shell(false)
                .await
                .map_err(|e| PassageError::Shell(format!("shell request: {e}")))?;
        }
    }

    drive_stdio(channel, args.background).await
}

fn agent_forward_endpoint(connection: &SshConnection, args: &SshArgs) -> Option<String> {
    if args.no_forward_agent {
        return None;
    }
    let configured = connection
        .services
        .config
        .get(&connection.param.alias, "ForwardAgent")
        .eq_ignore_ascii_case("yes");
    if !(args.forward_agent || configured) {
        return None;
    }
    resolve_agent_endpoint(&connection.services, &connection.param.alias)
}

async fn x11_config(connection: &SshConnection, args: &SshArgs) -> Option<X11Config> {
    if args.no_forward_x11 {
        return None;
    }
    let services = &connection.services;
    let alias = &connection.param.alias;
    let configured = services
        .config
        .get(alias, "ForwardX11")
        .eq_ignore_ascii_case("yes");
    if !(args.forward_x11 || configured) {
        return None;
    }
    let trusted = args.trusted_x11
        || services
            .config
            .get(alias, "ForwardX11Trusted")
            .eq_ignore_ascii_case("yes");
    let timeout: u64 = services
        .config
        .get(alias, "ForwardX11Timeout")
        .parse()
        .unwrap_or(1200);
    let xauth = services.config.get(alias, "XAuthLocation");
    match X11Config::prepare(&xauth, trusted, timeout).await {
        Ok(config) => Some(config),
        Err(error) => {
            warn!(%error, "cannot set up X11 forwarding");
            None
        }
    }
}

/// `SetEnv` pairs and `SendEnv` patterns from the local environment.
async fn send_environment(channel: &mut Channel<Msg>, connection: &SshConnection) {
    let services = &connection.services;
    let alias = &connection.param.alias;

    for pair in services.config.get_all_splits(alias, "SetEnv") {
        if let Some((name, value)) = pair.split_once('=') {
            if let Err(error) = channel.set_env(false, name, value).await {
                debug!(%name, %error, "cannot set remote environment variable");
            }
        }
    }
    let patterns = services.config.get_all_splits(alias, "SendEnv");
    if !patterns.is_empty() {
        for (name, value) in std::env::vars() {
            if patterns.iter().any(|p| pattern_matches(p, &name)) {
                if let Err(error) = channel.set_env(false, &name, &value).await {
                    debug!(%name, %error, "cannot forward environment variable");
                }
            }
        }
    }
}

/// Waits for the success/failure reply to a wantReply session request.
async fn wait_request_reply(channel: &mut Channel<Msg>) -> bool {
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Success) => return true,
            Some(ChannelMsg::Failure) => return false,
            Some(ChannelMsg::WindowAdjusted { .. }) => continue,
            Some(other) => {
                debug!(?other, "unexpected message while waiting for a reply");
                continue;
            }
            None => return false,
        }
    }
}

fn terminal_size() -> (u32, u32) {
    let cols = std::env::var("COLUMNS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(80);
    let rows = std::env::var("LINES")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(24);
    (cols, rows)
}

/// The interactive pump: local stdin feeds the channel, channel data feeds
/// stdout/stderr, and the remote exit status is propagated verbatim.
async fn drive_stdio(mut channel: Channel<Msg>, detach_stdin: bool) -> Result<i32, PassageError> {
    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();
    let mut buf = vec![0u8; 8192];
    let mut stdin_open = !detach_stdin;
    let mut exit_code: Option<i32> = None;

    loop {
        tokio::select! {
            read = stdin.read(&mut buf), if stdin_open => {
                match read {
                    Ok(0) => {
                        stdin_open = false;
                        if let Err(error) = channel.eof().await {
                            debug!(%error, "cannot send EOF");
                        }
                    }
                    Ok(n) => {
                        channel
                            .data(&buf[..n])
                            .await
                            .map_err(|e| PassageError::StdinWiring(e.to_string()))?;
                    }
                    Err(error) => {
                        debug!(%error, "stdin closed");
                        stdin_open = false;
                    }
                }
            }
            msg = channel.wait() => {
                match msg {
                    Some(ChannelMsg::Data { data }) => {
                        stdout
                            .write_all(&data)
                            .await
                            .map_err(|e| PassageError::Shell(e.to_string()))?;
                        let _ = stdout.flush().await;
                    }
                    Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                        let _ = stderr.write_all(&data).await;
                        let _ = stderr.flush().await;
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        exit_code = Some(exit_status as i32);
                    }
                    Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                        warn!(?signal_name, "remote command killed by signal");
                        exit_code = Some(128);
                    }
                    Some(ChannelMsg::Eof) => {}
                    Some(ChannelMsg::Close) | None => break,
                    Some(other) => {
                        debug!(?other, "unhandled channel message");
                    }
                }
            }
        }
    }
    Ok(exit_code.unwrap_or(0))
}
