//! UDP forwarding. Datagrams ride stream channels with a 4-byte big-endian
//! length prefix; each local client gets its own session with an idle
//! timestamp, and one lazily started process-wide GC task evicts sessions
//! that outlive `ForwardUdpTimeout`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use passage_common::PassageError;
use russh::client::Msg;
use russh::Channel;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::*;

use super::{listen_addresses, ForwardSpec};
use crate::client::RemoteTarget;
use crate::SshConnection;

const MAX_DATAGRAM: usize = 65535;
const WARN_WINDOW: Duration = Duration::from_secs(60);

pub(crate) async fn write_datagram<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> std::io::Result<()> {
    if payload.len() > MAX_DATAGRAM {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "datagram too large",
        ));
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

/// `Ok(None)` is a clean EOF on the framing boundary.
pub(crate) async fn read_datagram<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> std::io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(error) if error.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(error) => return Err(error),
    }
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_DATAGRAM {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "datagram length out of range",
        ));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Rate limit for repeated warnings: per format key, one `warn!` per
/// 60-second window; callers demote the rest to `debug!`.
pub(crate) struct WarnLimiter {
    entries: StdMutex<HashMap<String, Instant>>,
}

impl WarnLimiter {
    pub fn new() -> Self {
        Self {
            entries: StdMutex::new(HashMap::new()),
        }
    }

    /// True when the caller should log at warning level.
    pub fn should_warn(&self, key: &str) -> bool {
        let Ok(mut entries) = self.entries.lock() else {
            return true;
        };
        let now = Instant::now();
        match entries.get(key) {
            Some(last) if now.duration_since(*last) < WARN_WINDOW => false,
            _ => {
                entries.insert(key.to_owned(), now);
                true
            }
        }
    }

    /// Drops stale per-key entries, called from the GC pass.
    pub fn purge(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            let now = Instant::now();
            entries.retain(|_, last| now.duration_since(*last) < WARN_WINDOW);
        }
    }
}

type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub(crate) struct UdpForwardSession {
    writer: Mutex<BoxWriter>,
    last_active: AtomicI64,
    closed: AtomicBool,
}

impl UdpForwardSession {
    fn new(writer: BoxWriter) -> Arc<Self> {
        Arc::new(Self {
            writer: Mutex::new(writer),
            last_active: AtomicI64::new(now_unix()),
            closed: AtomicBool::new(false),
        })
    }

    fn touch(&self) {
        self.last_active.store(now_unix(), Ordering::Relaxed);
    }

    fn idle_since(&self) -> i64 {
        self.last_active.load(Ordering::Relaxed)
    }

    async fn send(&self, payload: &[u8]) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        write_datagram(&mut *writer, payload).await?;
        self.touch();
        Ok(())
    }

    /// Half-closes the remote side; the consumer task sees EOF and removes
    /// the map entry. Safe to call more than once.
    fn close(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let session = self.clone();
        tokio::spawn(async move {
            let mut writer = session.writer.lock().await;
            let _ = writer.shutdown().await;
        });
    }
}

trait GcSweep: Send + Sync {
    fn sweep(&self);
}

static GC_TARGETS: OnceLock<StdMutex<Vec<Weak<dyn GcSweep>>>> = OnceLock::new();
static GC_STARTED: OnceLock<()> = OnceLock::new();

fn register_gc(target: Weak<dyn GcSweep>, timeout: Duration) {
    let targets = GC_TARGETS.get_or_init(|| StdMutex::new(Vec::new()));
    if let Ok(mut targets) = targets.lock() {
        targets.push(target);
    }
    GC_STARTED.get_or_init(|| {
        let tick = timeout.checked_div(5).unwrap_or(timeout).max(Duration::from_secs(1));
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(tick).await;
                // snapshot-and-drain: never hold the registry lock while a
                // forwarder takes its own
                let snapshot: Vec<Arc<dyn GcSweep>> = {
                    let Some(targets) = GC_TARGETS.get() else {
                        continue;
                    };
                    let Ok(mut targets) = targets.lock() else {
                        continue;
                    };
                    targets.retain(|weak| weak.strong_count() > 0);
                    targets.iter().filter_map(Weak::upgrade).collect()
                };
                for target in snapshot {
                    target.sweep();
                }
            }
        });
    });
}

pub(crate) struct UdpLocalForwarder {
    socket: Arc<UdpSocket>,
    sessions: Mutex<HashMap<String, Arc<UdpForwardSession>>>,
    timeout: Duration,
    limiter: WarnLimiter,
}

impl GcSweep for UdpLocalForwarder {
    fn sweep(&self) {
        let Ok(sessions) = self.sessions.try_lock() else {
            return;
        };
        let cutoff = now_unix() - self.timeout.as_secs() as i64;
        for (key, session) in sessions.iter() {
            if session.idle_since() < cutoff {
                debug!(client = %key, "closing idle UDP session");
                session.close();
            }
        }
        drop(sessions);
        self.limiter.purge();
    }
}

fn forward_udp_timeout(connection: &SshConnection) -> Duration {
    connection
        .services
        .config
        .get(&connection.param.alias, "ForwardUdpTimeout")
        .parse()
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(300))
}

pub async fn install_local(
    connection: &Arc<SshConnection>,
    spec: ForwardSpec,
    gateway: bool,
) -> Result<(), PassageError> {
    let bind = spec.bind_spec();
    if bind.is_unix() {
        return Err(PassageError::ForwardSpec(
            "unixgram listeners are not supported on the local side".to_owned(),
        ));
    }
    let timeout = forward_udp_timeout(connection);

    let mut bound = 0usize;
    let mut last_error: Option<std::io::Error> = None;
    for addr in listen_addresses(&bind, gateway) {
        match UdpSocket::bind(&addr).await {
            Ok(socket) => {
                info!(%addr, dest = %spec.dest_host, "listening (udp)");
                bound += 1;
                let forwarder = Arc::new(UdpLocalForwarder {
                    socket: Arc::new(socket),
                    sessions: Mutex::new(HashMap::new()),
                    timeout,
                    limiter: WarnLimiter::new(),
                });
                register_gc(
                    Arc::downgrade(&forwarder) as Weak<dyn GcSweep>,
                    timeout,
                );
                let connection = connection.clone();
                let spec = spec.clone();
                tokio::spawn(async move {
                    forwarder.run(connection, spec).await;
                });
            }
            Err(error) => {
                debug!(%addr, %error, "cannot bind udp");
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

impl UdpLocalForwarder {
    async fn run(self: Arc<Self>, connection: Arc<SshConnection>, spec: ForwardSpec) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, peer) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(error) => {
                    if self.limiter.should_warn("recv") {
                        warn!(%error, "udp receive failed");
                    } else {
                        debug!(%error, "udp receive failed");
                    }
                    continue;
                }
            };
            let key = peer.to_string();
            let session = match self.session_for(&connection, &spec, &key, peer).await {
                Ok(session) => session,
                Err(error) => {
                    if self.limiter.should_warn("dial") {
                        warn!(dest = %spec.dest_host, %error, "cannot open udp channel");
                    } else {
                        debug!(dest = %spec.dest_host, %error, "cannot open udp channel");
                    }
                    continue;
                }
            };
            if let Err(error) = session.send(&buf[..len]).await {
                if self.limiter.should_warn("send") {
                    warn!(client = %key, %error, "udp relay failed");
                } else {
                    debug!(client = %key, %error, "udp relay failed");
                }
                session.close();
                self.sessions.lock().await.remove(&key);
            }
        }
    }

    async fn session_for(
        self: &Arc<Self>,
        connection: &Arc<SshConnection>,
        spec: &ForwardSpec,
        key: &str,
        peer: std::net::SocketAddr,
    ) -> Result<Arc<UdpForwardSession>, PassageError> {
        if let Some(session) = self.sessions.lock().await.get(key) {
            return Ok(session.clone());
        }

        // first packet from this client: open its remote datagram channel
        let stream = if spec.dest_is_unix() {
            connection
                .open_direct_streamlocal(&spec.dest_host)
                .await?
                .into_stream()
        } else {
            connection
                .dial_through(&spec.dest_host, spec.dest_port as u32)
                .await?
        };
        let (mut reader, writer) = tokio::io::split(stream);
        let session = UdpForwardSession::new(Box::new(writer));
        self.sessions
            .lock()
            .await
            .insert(key.to_owned(), session.clone());
        debug!(client = %key, "new udp session");

        // consumer: remote datagrams go back to this client's address
        let forwarder = self.clone();
        let socket = self.socket.clone();
        let consumer_key = key.to_owned();
        let consumer = session.clone();
        tokio::spawn(async move {
            loop {
                match read_datagram(&mut reader).await {
                    Ok(Some(payload)) => {
                        consumer.touch();
                        if let Err(error) = socket.send_to(&payload, peer).await {
                            debug!(client = %consumer_key, %error, "cannot deliver udp reply");
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(error) => {
                        debug!(client = %consumer_key, %error, "udp channel read failed");
                        break;
                    }
                }
            }
            consumer.close();
            forwarder.sessions.lock().await.remove(&consumer_key);
            debug!(client = %consumer_key, "udp session closed");
        });
        Ok(session)
    }
}

/// Requests the server-side listener for a remote UDP forward; incoming
/// channels land in [`serve_remote_channel`].
pub async fn install_remote(
    connection: &Arc<SshConnection>,
    spec: ForwardSpec,
    gateway: bool,
) -> Result<(), PassageError> {
    if spec.dest_is_unix() {
        return Err(PassageError::ForwardSpec(
            "unixgram destinations are not supported for remote udp forwards".to_owned(),
        ));
    }
    let target = RemoteTarget::Udp(spec.dest_host.clone(), spec.dest_port as u32);
    let bind = spec.bind_spec();
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
            Err(error) if index > 0 => debug!(%address, port, %error, "remote listener not available"),
            Err(error) => warn!(%address, port, %error, "remote listener failed"),
        }
    }
    if installed == 0 {
        return Err(PassageError::ForwardDenied {
            addr: bind.to_string(),
            source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
        });
    }
    info!(bind = %bind, dest = %spec.dest_host, "remote udp forward installed");
    Ok(())
}

/// One remote-initiated datagram channel: dial the local UDP target and
/// copy both directions until either side stops.
pub(crate) async fn serve_remote_channel(channel: Channel<Msg>, host: String, port: u32) {
    let bind_addr = if host.contains(':') { "[::]:0" } else { "0.0.0.0:0" };
    let socket = match UdpSocket::bind(bind_addr).await {
        Ok(socket) => socket,
        Err(error) => {
            warn!(%host, port, %error, "cannot open local udp socket");
            return;
        }
    };
    if let Err(error) = socket.connect((host.as_str(), port as u16)).await {
        warn!(%host, port, %error, "cannot reach udp destination");
        return;
    }

    let (mut reader, mut writer) = tokio::io::split(channel.into_stream());
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            incoming = read_datagram(&mut reader) => {
                match incoming {
                    Ok(Some(payload)) => {
                        if let Err(error) = socket.send(&payload).await {
                            debug!(%error, "udp send failed");
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(error) => {
                        debug!(%error, "udp channel read failed");
                        break;
                    }
                }
            }
            reply = socket.recv(&mut buf) => {
                match reply {
                    Ok(len) => {
                        if let Err(error) = write_datagram(&mut writer, &buf[..len]).await {
                            debug!(%error, "udp channel write failed");
                            break;
                        }
                    }
                    Err(error) => {
                        debug!(%error, "udp recv failed");
                        break;
                    }
                }
            }
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_datagram_framing_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(1 << 16);
        write_datagram(&mut a, b"hello").await.unwrap();
        write_datagram(&mut a, b"").await.unwrap();
        write_datagram(&mut a, &[0u8; 1000]).await.unwrap();
        assert_eq!(read_datagram(&mut b).await.unwrap().unwrap(), b"hello");
        assert_eq!(read_datagram(&mut b).await.unwrap().unwrap(), b"");
        assert_eq!(
            read_datagram(&mut b).await.unwrap().unwrap().len(),
            1000
        );
        drop(a);
        assert!(read_datagram(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_datagram_length_guard() {
        let (mut a, mut b) = tokio::io::duplex(64);
        tokio::spawn(async move {
            let _ = a.write_all(&(u32::MAX).to_be_bytes()).await;
        });
        assert!(read_datagram(&mut b).await.is_err());
    }

    #[tokio::test]
    async fn test_gc_evicts_only_after_timeout() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let forwarder = Arc::new(UdpLocalForwarder {
            socket: Arc::new(socket),
            sessions: Mutex::new(HashMap::new()),
            timeout: Duration::from_secs(2),
            limiter: WarnLimiter::new(),
        });
        let (_keep, writer) = tokio::io::duplex(64);
        let session = UdpForwardSession::new(Box::new(writer));
        forwarder
            .sessions
            .lock()
            .await
            .insert("client".to_owned(), session.clone());

        // fresh session survives a pass
        forwarder.sweep();
        assert!(!session.closed.load(Ordering::SeqCst));

        // an idle session older than the timeout is closed
        session
            .last_active
            .store(now_unix() - 3, Ordering::Relaxed);
        forwarder.sweep();
        assert!(session.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_session_send_touches() {
        let (_keep, writer) = tokio::io::duplex(1 << 16);
        let session = UdpForwardSession::new(Box::new(writer));
        session.last_active.store(0, Ordering::Relaxed);
        session.send(b"ping").await.unwrap();
        assert!(session.idle_since() > 0);
    }

    #[test]
    fn test_warn_limiter_window() {
        let limiter = WarnLimiter::new();
        assert!(limiter.should_warn("send"));
        assert!(!limiter.should_warn("send"));
        assert!(limiter.should_warn("recv"));
        limiter.purge();
        // entries inside the window survive a purge
        assert!(!limiter.should_warn("send"));
    }
}
