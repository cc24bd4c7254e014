//! The login orchestrator: resolves the destination, walks ProxyJump
//! chains, picks a transport (control socket, ProxyCommand, parent hop or
//! direct TCP), drives the handshake and authentication, then owns the live
//! connection that forwarders and the session run on.

pub(crate) mod handler;
mod session;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::pin_mut;
use passage_common::PassageError;
use passage_core::tokens::{validate_spawn_safe, TokenExpander};
use passage_core::{Destination, LoginParam, Services};
use russh::client::{Handle, Msg};
use russh::keys::{Algorithm, HashAlg, PublicKey};
use russh::{Channel, ChannelStream, Preferred};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::sync::Mutex;
use tracing::*;

use crate::ciphers::resolve_cipher_spec;
use crate::control::ControlMaster;
use crate::expect::{load_expect, PtySession};
use crate::forward::x11::X11Config;
use crate::known_hosts::{host_key_changed_warning, KnownHosts};
use crate::with_timeout;
use handler::{ClientHandler, ClientHandlerError, ClientHandlerEvent, StrictHostKeyChecking};

pub use session::run_session;

use crate::SshArgs;

const MAX_PROXY_DEPTH: usize = 16;

pub(crate) trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub(crate) type BoxStream = Box<dyn AsyncStream + 'static>;

/// Where a server-initiated forwarded channel should be delivered locally.
#[derive(Debug, Clone)]
pub enum RemoteTarget {
    Tcp(String, u32),
    Unix(String),
    Udp(String, u32),
}

pub struct SshConnection {
    pub param: LoginParam,
    pub services: Services,
    handle: Arc<Mutex<Handle<ClientHandler>>>,
    remote_tcp_targets: Arc<Mutex<HashMap<(String, u32), RemoteTarget>>>,
    remote_unix_targets: Arc<Mutex<HashMap<String, RemoteTarget>>>,
    x11: Arc<Mutex<Option<X11Config>>>,
    agent_endpoint: Arc<Mutex<Option<String>>>,
    closed_rx: tokio::sync::watch::Receiver<bool>,
    /// Keeps the jump-host connection alive for the lifetime of this one.
    _parent: Option<Box<SshConnection>>,
}

/// Entry point: connect (through every hop) and authenticate.
pub async fn login(services: &Services, args: &SshArgs) -> Result<SshConnection, PassageError> {
    let destination = Destination::parse(&args.destination)?;
    establish(services, args, &destination, true, 0).await
}

fn resolve_param(
    services: &Services,
    args: &SshArgs,
    destination: &Destination,
    top_level: bool,
) -> Result<LoginParam, PassageError> {
    let alias = destination.host.clone();
    let host = services
        .config
        .get_optional(&alias, "HostName")
        .unwrap_or_else(|| alias.clone());

    let port = destination
        .port
        .clone()
        .or_else(|| (top_level).then(|| args.port.map(|p| p.to_string())).flatten())
        .or_else(|| services.config.get_optional(&alias, "Port"))
        .unwrap_or_else(|| "22".to_owned());

    let user = destination
        .user
        .clone()
        .or_else(|| (top_level).then(|| args.login_name.clone()).flatten())
        .or_else(|| services.config.get_optional(&alias, "User"))
        .unwrap_or_else(whoami::username);

    let mut param = LoginParam {
        alias,
        host,
        port,
        user,
        proxy_chain: Vec::new(),
        proxy_command: None,
    };

    // -J beats ProxyJump which beats ProxyCommand
    let jump = (top_level)
        .then(|| args.proxy_jump.clone())
        .flatten()
        .or_else(|| services.config.get_optional(&param.alias, "ProxyJump"));
    match jump {
        Some(jump) if !jump.eq_ignore_ascii_case("none") => {
            param.proxy_chain = jump.split(',').map(|s| s.trim().to_owned()).collect();
        }
        _ => {
            if let Some(command) = services.config.get_optional(&param.alias, "ProxyCommand") {
                if !command.eq_ignore_ascii_case("none") {
                    let expander = TokenExpander::new(&param);
                    let expanded = expander.expand(&command, "hprnlLjC")?;
                    let argv = shell_words::split(&expanded).map_err(|e| {
                        PassageError::Config(format!("bad ProxyCommand [{expanded}]: {e}"))
                    })?;
                    param.proxy_command = Some(argv);
                }
            }
        }
    }
    Ok(param)
}

async fn establish(
    services: &Services,
    args: &SshArgs,
    destination: &Destination,
    top_level: bool,
    depth: usize,
) -> Result<SshConnection, PassageError> {
    if depth > MAX_PROXY_DEPTH {
        return Err(PassageError::Config("ProxyJump chain too deep".to_owned()));
    }
    let param = resolve_param(services, args, destination, top_level)?;
    validate_spawn_safe("hostname", &param.host)?;
    validate_spawn_safe("user", &param.user)?;

    // (i) an established control master wins
    match ControlMaster::connect(services, &param).await {
        Ok(Some(socket)) => {
            return connect_stream(services, args, param, Box::new(socket), None).await;
        }
        Ok(None) => {}
        Err(error) => {
            warn!(%error, "control master unavailable, falling back to a direct connection");
        }
    }

    // (ii) ProxyCommand becomes the transport
    if let Some(argv) = param.proxy_command.clone() {
        let stream = spawn_proxy_command(services, &param, &argv).await?;
        return connect_stream(services, args, param, stream, None).await;
    }

    // (iii) a ProxyJump chain recurses per hop
    if !param.proxy_chain.is_empty() {
        let chain = param.proxy_chain.clone();
        let mut parent: Option<SshConnection> = None;
        for hop in &chain {
            let hop_destination = Destination::parse(hop)?;
            let hop_conn = match parent.take() {
                None => Box::pin(establish(services, args, &hop_destination, false, depth + 1)).await?,
                Some(via) => {
                    let hop_param = resolve_param(services, args, &hop_destination, false)?;
                    let stream = dial_via_parent(&via, &hop_param).await?;
                    connect_stream(services, args, hop_param, stream, Some(Box::new(via))).await?
                }
            };
            parent = Some(hop_conn);
        }
        let via = parent.ok_or_else(|| PassageError::Config("empty proxy chain".to_owned()))?;
        let stream = dial_via_parent(&via, &param).await?;
        return connect_stream(services, args, param, stream, Some(Box::new(via))).await;
    }

    // (iv) plain TCP
    let connect_timeout = connect_timeout(services, &param);
    let addr = param.addr();
    let stream = with_timeout(dial_tcp(&addr, args), connect_timeout)
        .await
        .map_err(|_| PassageError::DialTimeout {
            addr: addr.clone(),
            seconds: connect_timeout.as_secs(),
        })?
        .map_err(|error| {
            PassageError::Config(format!(
                "proxy [{}] dial tcp [{}] failed: {error}",
                param.alias, addr
            ))
        })?;
    let _ = stream.set_nodelay(true);
    connect_stream(services, args, param, Box::new(stream), None).await
}

/// Resolves and dials, honouring `-4`/`-6` address-family restrictions.
async fn dial_tcp(addr: &str, args: &SshArgs) -> std::io::Result<TcpStream> {
    if !(args.ipv4_only || args.ipv6_only) {
        return TcpStream::connect(addr).await;
    }
    let mut last_error = None;
    for resolved in tokio::net::lookup_host(addr).await? {
        let family_ok = (args.ipv4_only && resolved.is_ipv4())
            || (args.ipv6_only && resolved.is_ipv6());
        if !family_ok {
            continue;
        }
        match TcpStream::connect(resolved).await {
            Ok(stream) => return Ok(stream),
            Err(error) => last_error = Some(error),
        }
    }
    Err(last_error
        .unwrap_or_else(|| std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            "no address in the requested family",
        )))
}

fn connect_timeout(services: &Services, param: &LoginParam) -> Duration {
    services
        .config
        .get(&param.alias, "ConnectTimeout")
        .parse()
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(10))
}

async fn dial_via_parent(
    parent: &SshConnection,
    param: &LoginParam,
) -> Result<BoxStream, PassageError> {
    let port: u32 = param
        .port
        .parse()
        .map_err(|_| PassageError::Config(format!("bad port [{}]", param.port)))?;
    let channel = parent
        .open_direct_tcpip(&param.host, port, "127.0.0.1", 0)
        .await
        .map_err(|error| {
            PassageError::Config(format!(
                "proxy [{}] dial tcp [{}] failed: {error}",
                parent.param.alias,
                param.addr()
            ))
        })?;
    Ok(Box::new(channel.into_stream()))
}

async fn spawn_proxy_command(
    services: &Services,
    param: &LoginParam,
    argv: &[String],
) -> Result<BoxStream, PassageError> {
    if argv.is_empty() {
        return Err(PassageError::Config("empty ProxyCommand".to_owned()));
    }
    info!(command = %argv.join(" "), "running proxy command");

    // With expect interactions configured the command runs on a pty and the
    // harness answers its prompts first; the pty then carries the SSH bytes.
    if let Some(harness) = load_expect(services, &param.alias, "") {
        let mut pty = PtySession::spawn(argv)
            .map_err(|e| PassageError::Config(format!("cannot spawn ProxyCommand: {e}")))?;
        pty.expect(&harness).await?;
        return Ok(Box::new(pty.into_stream()));
    }

    let mut child = tokio::process::Command::new(&argv[0])
        .args(&argv[1..])
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| PassageError::Config(format!("cannot spawn ProxyCommand: {e}")))?;
    let stdin = child.stdin.take().ok_or(PassageError::TimeoutExceeded)?;
    let stdout = child.stdout.take().ok_or(PassageError::TimeoutExceeded)?;
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) if !status.success() => debug!(?status, "proxy command exited"),
            Err(error) => debug!(%error, "proxy command wait failed"),
            _ => {}
        }
    });
    Ok(Box::new(tokio::io::join(stdout, stdin)))
}

fn build_client_config(
    services: &Services,
    args: &SshArgs,
    param: &LoginParam,
    known_hosts: &KnownHosts,
) -> russh::client::Config {
    let mut preferred = Preferred::default();

    let cipher_spec = args
        .ciphers
        .clone()
        .or_else(|| args.option("Ciphers").map(str::to_owned))
        .or_else(|| services.config.get_optional(&param.alias, "Ciphers"));
    if let Some(spec) = cipher_spec {
        preferred.cipher = std::borrow::Cow::Owned(resolve_cipher_spec(&spec));
    }

    // Prefer host key algorithms we already have on record so an unknown
    // key type never masks a known host.
    let port: u16 = param.port.parse().unwrap_or(22);
    let known = known_hosts.known_algorithms(&param.host, port);
    if !known.is_empty() {
        let mut ordered: Vec<Algorithm> = Vec::new();
        for name in &known {
            if let Ok(algorithm) = Algorithm::new(name) {
                if !ordered.contains(&algorithm) {
                    ordered.push(algorithm);
                }
            }
        }
        for algorithm in preferred.key.iter() {
            if !ordered.contains(algorithm) {
                ordered.push(algorithm.clone());
            }
        }
        preferred.key = std::borrow::Cow::Owned(ordered);
    }

    let keepalive_interval: u64 = services
        .config
        .get(&param.alias, "ServerAliveInterval")
        .parse()
        .unwrap_or(10);
    let keepalive_max: usize = services
        .config
        .get(&param.alias, "ServerAliveCountMax")
        .parse()
        .unwrap_or(3);

    russh::client::Config {
        preferred,
        keepalive_interval: (keepalive_interval > 0)
            .then(|| Duration::from_secs(keepalive_interval)),
        keepalive_max,
        ..Default::default()
    }
}

async fn connect_stream(
    services: &Services,
    args: &SshArgs,
    param: LoginParam,
    stream: BoxStream,
    parent: Option<Box<SshConnection>>,
) -> Result<SshConnection, PassageError> {
    let known_hosts = Arc::new(KnownHosts::load(services, &param));
    let strict = StrictHostKeyChecking::parse(
        args.option("StrictHostKeyChecking")
            .map(str::to_owned)
            .unwrap_or_else(|| services.config.get(&param.alias, "StrictHostKeyChecking"))
            .as_str(),
    );
    let port: u16 = param.port.parse().unwrap_or(22);

    let config = Arc::new(build_client_config(services, args, &param, &known_hosts));
    let (event_tx, mut event_rx) = unbounded_channel();
    let handler = ClientHandler {
        host: param.host.clone(),
        port,
        known_hosts,
        strict,
        event_tx,
    };

    info!(addr = %param.addr(), user = %param.user, "connecting");
    let handshake_timeout = connect_timeout(services, &param);
    let fut_connect = russh::client::connect_stream(config, stream, handler);
    pin_mut!(fut_connect);
    let deadline = tokio::time::sleep(handshake_timeout);
    pin_mut!(deadline);

    // the deadline stops counting once the user is at a trust prompt
    let mut prompting = false;
    let mut handle = loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                if matches!(event, ClientHandlerEvent::HostKeyUnknown(..)) {
                    prompting = true;
                }
                handle_preauth_event(&param, event).await;
            }
            result = &mut fut_connect => {
                match with_handshake_error(result, &param) {
                    Ok(handle) => break handle,
                    Err(error) => return Err(error),
                }
            }
            () = &mut deadline, if !prompting => {
                return Err(PassageError::DialTimeout {
                    addr: param.addr(),
                    seconds: handshake_timeout.as_secs(),
                });
            }
        }
    };

    let handle_result = with_timeout(
        crate::auth::authenticate(&mut handle, services, &param, args),
        Duration::from_secs(120),
    )
    .await;
    // surface banners that arrived during auth
    while let Ok(event) = event_rx.try_recv() {
        handle_preauth_event(&param, event).await;
    }
    match handle_result {
        Ok(Ok(())) => {}
        Ok(Err(error)) => return Err(error),
        Err(error) => return Err(error),
    }
    info!(addr = %param.addr(), "connected");

    let (closed_tx, closed_rx) = tokio::sync::watch::channel(false);
    let connection = SshConnection {
        param,
        services: services.clone(),
        handle: Arc::new(Mutex::new(handle)),
        remote_tcp_targets: Arc::new(Mutex::new(HashMap::new())),
        remote_unix_targets: Arc::new(Mutex::new(HashMap::new())),
        x11: Arc::new(Mutex::new(None)),
        agent_endpoint: Arc::new(Mutex::new(None)),
        closed_rx,
        _parent: parent,
    };
    connection.start_dispatcher(event_rx, closed_tx);
    Ok(connection)
}

fn with_handshake_error(
    result: Result<Handle<ClientHandler>, ClientHandlerError>,
    param: &LoginParam,
) -> Result<Handle<ClientHandler>, PassageError> {
    match result {
        Ok(handle) => Ok(handle),
        Err(ClientHandlerError::HostKeyChanged {
            host,
            key_type,
            fingerprint,
        }) => {
            eprintln!("{}", host_key_changed_warning(&host, &key_type, &fingerprint));
            Err(PassageError::HostKeyChanged { host })
        }
        Err(ClientHandlerError::HostKeyRejected { host }) => {
            Err(PassageError::HostKeyRejected { host })
        }
        Err(error) => Err(PassageError::Config(format!(
            "ssh handshake with [{}] failed: {error}",
            param.addr()
        ))),
    }
}

async fn handle_preauth_event(param: &LoginParam, event: ClientHandlerEvent) {
    match event {
        ClientHandlerEvent::Banner(banner) => {
            eprint!("{banner}");
        }
        ClientHandlerEvent::HostKeyReceived(key) => {
            debug!(algorithm = %key.algorithm(), "host key received");
        }
        ClientHandlerEvent::HostKeyUnknown(key, reply) => {
            let accepted = prompt_unknown_host_key(param, &key).await;
            let _ = reply.send(accepted);
        }
        other => debug!(?other, "early client event ignored"),
    }
}

async fn prompt_unknown_host_key(param: &LoginParam, key: &PublicKey) -> bool {
    let fingerprint = key.fingerprint(HashAlg::Sha256).to_string();
    let question = format!(
        "The authenticity of host '{} ({})' can't be established.\n\
         {} key fingerprint is {}.\n\
         Are you sure you want to continue connecting (yes/no/[fingerprint])?",
        param.alias,
        param.addr(),
        key.algorithm(),
        fingerprint,
    );
    let expected = fingerprint.clone();
    let result = tokio::task::spawn_blocking(move || {
        for _ in 0..3 {
            let answer: Result<String, _> = dialoguer::Input::new()
                .with_prompt(question.clone())
                .allow_empty(true)
                .interact_text();
            match answer {
                Ok(answer) => {
                    let answer = answer.trim().to_owned();
                    if answer == "yes" || answer == expected {
                        return true;
                    }
                    if answer == "no" {
                        return false;
                    }
                    eprintln!("Please type 'yes', 'no' or the full fingerprint.");
                }
                Err(_) => return false,
            }
        }
        false
    })
    .await;
    result.unwrap_or(false)
}

impl SshConnection {
    fn start_dispatcher(
        &self,
        mut event_rx: UnboundedReceiver<ClientHandlerEvent>,
        closed_tx: tokio::sync::watch::Sender<bool>,
    ) {
        let param = self.param.clone();
        let tcp_targets = self.remote_tcp_targets.clone();
        let unix_targets = self.remote_unix_targets.clone();
        let x11 = self.x11.clone();
        let agent_endpoint = self.agent_endpoint.clone();
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                match event {
                    ClientHandlerEvent::ForwardedTcpIp(channel, params) => {
                        let target = {
                            let targets = tcp_targets.lock().await;
                            lookup_remote_target(&targets, &params)
                        };
                        match target {
                            Some(target) => {
                                crate::forward::serve_remote_channel(channel, target, &params)
                            }
                            None => {
                                warn!(%params, "forwarded connection with no matching forward");
                            }
                        }
                    }
                    ClientHandlerEvent::ForwardedStreamlocal(channel, params) => {
                        let target = {
                            let targets = unix_targets.lock().await;
                            targets.get(&params.socket_path).cloned()
                        };
                        match target {
                            Some(target) => {
                                let params = crate::ForwardedTcpIpParams {
                                    connected_address: params.socket_path.clone(),
                                    connected_port: 0,
                                    originator_address: String::new(),
                                    originator_port: 0,
                                };
                                crate::forward::serve_remote_channel(channel, target, &params)
                            }
                            None => warn!(
                                path = %params.socket_path,
                                "forwarded unix connection with no matching forward"
                            ),
                        }
                    }
                    ClientHandlerEvent::AgentForward(channel) => {
                        let endpoint = agent_endpoint.lock().await.clone();
                        match endpoint {
                            Some(endpoint) => crate::forward::agent::serve_channel(channel, endpoint),
                            None => debug!("agent channel without agent forwarding enabled"),
                        }
                    }
                    ClientHandlerEvent::X11(channel, originator, originator_port) => {
                        let config = x11.lock().await.clone();
                        match config {
                            Some(config) => crate::forward::x11::serve_channel(
                                channel,
                                config,
                                originator,
                                originator_port,
                            ),
                            None => debug!("x11 channel without x11 forwarding enabled"),
                        }
                    }
                    ClientHandlerEvent::Banner(banner) => eprint!("{banner}"),
                    ClientHandlerEvent::Disconnect => {
                        debug!(alias = %param.alias, "connection closed");
                        let _ = closed_tx.send(true);
                        break;
                    }
                    other => debug!(?other, "unhandled client event"),
                }
            }
        });
    }

    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>, PassageError> {
        let handle = self.handle.lock().await;
        handle
            .channel_open_direct_tcpip(host, port, originator, originator_port)
            .await
            .map_err(map_ssh_error)
    }

    pub async fn open_direct_streamlocal(&self, path: &str) -> Result<Channel<Msg>, PassageError> {
        let handle = self.handle.lock().await;
        handle
            .channel_open_direct_streamlocal(path)
            .await
            .map_err(map_ssh_error)
    }

    pub async fn open_session_channel(&self) -> Result<Channel<Msg>, PassageError> {
        let handle = self.handle.lock().await;
        handle.channel_open_session().await.map_err(map_ssh_error)
    }

    /// Dials a destination through the tunnel with a 10 s cap, as the
    /// dynamic and local forwarders need.
    pub async fn dial_through(
        &self,
        host: &str,
        port: u32,
    ) -> Result<ChannelStream<Msg>, PassageError> {
        let channel = with_timeout(
            self.open_direct_tcpip(host, port, "127.0.0.1", 0),
            Duration::from_secs(10),
        )
        .await??;
        Ok(channel.into_stream())
    }

    pub async fn tcpip_forward(&self, address: &str, port: u32) -> Result<(), PassageError> {
        let mut handle = self.handle.lock().await;
        handle
            .tcpip_forward(address, port)
            .await
            .map_err(map_ssh_error)?;
        Ok(())
    }

    pub async fn streamlocal_forward(&self, path: &str) -> Result<(), PassageError> {
        let mut handle = self.handle.lock().await;
        handle
            .streamlocal_forward(path)
            .await
            .map_err(map_ssh_error)?;
        Ok(())
    }

    pub(crate) async fn register_remote_tcp_target(
        &self,
        address: &str,
        port: u32,
        target: RemoteTarget,
    ) {
        self.remote_tcp_targets
            .lock()
            .await
            .insert((address.to_owned(), port), target);
    }

    pub(crate) async fn register_remote_unix_target(&self, path: &str, target: RemoteTarget) {
        self.remote_unix_targets
            .lock()
            .await
            .insert(path.to_owned(), target);
    }

    pub(crate) async fn enable_agent_forwarding(&self, endpoint: String) {
        *self.agent_endpoint.lock().await = Some(endpoint);
    }

    pub(crate) async fn enable_x11(&self, config: X11Config) {
        *self.x11.lock().await = Some(config);
    }

    /// Resolves once the server closes the connection.
    pub async fn wait_closed(&self) {
        let mut closed = self.closed_rx.clone();
        while !*closed.borrow() {
            if closed.changed().await.is_err() {
                return;
            }
        }
    }

    pub async fn disconnect(&self) {
        let mut handle = self.handle.lock().await;
        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "", "")
            .await;
    }
}

fn lookup_remote_target(
    targets: &HashMap<(String, u32), RemoteTarget>,
    params: &crate::ForwardedTcpIpParams,
) -> Option<RemoteTarget> {
    let key = (
        params.connected_address.clone(),
        params.connected_port,
    );
    if let Some(target) = targets.get(&key) {
        return Some(target.clone());
    }
    // servers report wildcard binds in different spellings
    for spelling in ["", "0.0.0.0", "::", "localhost", "127.0.0.1"] {
        if let Some(target) = targets.get(&(spelling.to_owned(), params.connected_port)) {
            return Some(target.clone());
        }
    }
    None
}

pub(crate) fn map_ssh_error(error: russh::Error) -> PassageError {
    match error {
        russh::Error::KeepaliveTimeout => PassageError::KeepaliveLoss,
        other => PassageError::Config(format!("ssh: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use passage_core::config::{ConfigStore, SecretStore};
    use passage_core::Lifecycle;

    use super::*;

    fn services(config: &str, tag: &str) -> Services {
        let dir = std::env::temp_dir().join(format!("passage-client-{tag}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("config"), config).unwrap();
        Services {
            config: Arc::new(ConfigStore::load(&dir.join("config"), &dir.join("missing"))),
            secrets: Arc::new(SecretStore::load(&dir.join("missing"))),
            lifecycle: Lifecycle::new(),
        }
    }

    fn args(destination: &str) -> SshArgs {
        SshArgs {
            destination: destination.to_owned(),
            ..Default::default()
        }
    }

    #[test]
    fn test_alias_resolution() {
        let services = services(
            "Host web\n  HostName web.internal.example.com\n  Port 2022\n  User deploy\n",
            "alias",
        );
        let destination = Destination::parse("web").unwrap();
        let param = resolve_param(&services, &args("web"), &destination, true).unwrap();
        assert_eq!(param.alias, "web");
        assert_eq!(param.host, "web.internal.example.com");
        assert_eq!(param.port, "2022");
        assert_eq!(param.user, "deploy");
        assert!(param.proxy_chain.is_empty());
        assert!(param.proxy_command.is_none());
    }

    #[test]
    fn test_cli_beats_config() {
        let services = services("Host web\n  Port 2022\n  User deploy\n", "cli");
        let destination = Destination::parse("admin@web:4022").unwrap();
        let mut cli = args("admin@web:4022");
        cli.port = Some(9922);
        cli.login_name = Some("ops".to_owned());
        let param = resolve_param(&services, &cli, &destination, true).unwrap();
        // the destination string wins over both -p/-l and the config
        assert_eq!(param.port, "4022");
        assert_eq!(param.user, "admin");

        let bare = Destination::parse("web").unwrap();
        let mut cli = args("web");
        cli.port = Some(9922);
        cli.login_name = Some("ops".to_owned());
        let param = resolve_param(&services, &cli, &bare, true).unwrap();
        assert_eq!(param.port, "9922");
        assert_eq!(param.user, "ops");
    }

    #[test]
    fn test_proxy_jump_chain() {
        let services = services("Host target\n  ProxyJump bastion,admin@inner:2022\n", "jump");
        let destination = Destination::parse("target").unwrap();
        let param = resolve_param(&services, &args("target"), &destination, true).unwrap();
        assert_eq!(param.proxy_chain, vec!["bastion", "admin@inner:2022"]);
        assert_eq!(param.last_proxy(), Some("admin@inner:2022"));
    }

    #[test]
    fn test_jump_flag_overrides_config_chain() {
        let services = services("Host target\n  ProxyJump bastion\n", "jumpflag");
        let destination = Destination::parse("target").unwrap();
        let mut cli = args("target");
        cli.proxy_jump = Some("edge".to_owned());
        let param = resolve_param(&services, &cli, &destination, true).unwrap();
        assert_eq!(param.proxy_chain, vec!["edge"]);
    }

    #[test]
    fn test_proxy_command_expansion() {
        let services = services(
            "Host deep\n  HostName deep.example.com\n  ProxyCommand connect -H proxy %h %p\n",
            "proxycmd",
        );
        let destination = Destination::parse("deep:2200").unwrap();
        let param = resolve_param(&services, &args("deep:2200"), &destination, true).unwrap();
        assert_eq!(
            param.proxy_command.unwrap(),
            vec!["connect", "-H", "proxy", "deep.example.com", "2200"]
        );
    }

    #[test]
    fn test_proxy_jump_none_allows_proxy_command() {
        let services = services(
            "Host direct\n  ProxyJump none\n  ProxyCommand none\n",
            "nones",
        );
        let destination = Destination::parse("direct").unwrap();
        let param = resolve_param(&services, &args("direct"), &destination, true).unwrap();
        assert!(param.proxy_chain.is_empty());
        assert!(param.proxy_command.is_none());
    }

    #[test]
    fn test_remote_target_lookup_spellings() {
        let mut targets = HashMap::new();
        targets.insert(
            ("0.0.0.0".to_owned(), 8080),
            RemoteTarget::Tcp("localhost".to_owned(), 80),
        );
        let params = crate::ForwardedTcpIpParams {
            connected_address: String::new(),
            connected_port: 8080,
            originator_address: "10.0.0.9".to_owned(),
            originator_port: 55111,
        };
        assert!(lookup_remote_target(&targets, &params).is_some());
        let miss = crate::ForwardedTcpIpParams {
            connected_port: 8081,
            ..params
        };
        assert!(lookup_remote_target(&targets, &miss).is_none());
    }
}
