//! Expect-driven interaction against a child process on a pty, used to
//! answer ProxyCommand and ControlMaster password prompts. The pty reader
//! feeds a channel so the matcher never blocks the producer; bytes read
//! after the final interaction are handed on unchanged.

use std::io::{Read, Write};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use passage_common::{PassageError, Secret};
use passage_core::Services;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use regex::Regex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::time::Instant;
use tracing::*;

pub struct ExpectInteraction {
    /// Wildcard pattern (`*` matches anything); `None` sends immediately.
    pub pattern: Option<String>,
    pub response: Secret<String>,
}

pub struct ExpectHarness {
    pub interactions: Vec<ExpectInteraction>,
    pub timeout: Duration,
}

/// Reads the `ExpectCount`/`ExpectPattern<n>`/`ExpectSendText<n>`/
/// `ExpectSendPass<n>` family, optionally under a prefix (`Ctrl` for the
/// control-master path).
pub fn load_expect(services: &Services, alias: &str, prefix: &str) -> Option<ExpectHarness> {
    let count: usize = services
        .config
        .get(alias, &format!("{prefix}ExpectCount"))
        .parse()
        .ok()?;
    if count == 0 {
        return None;
    }
    let timeout = services
        .config
        .get(alias, &format!("{prefix}ExpectTimeout"))
        .parse()
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(30));

    let mut interactions = Vec::with_capacity(count);
    for index in 1..=count {
        let pattern = services
            .config
            .get_optional(alias, &format!("{prefix}ExpectPattern{index}"));
        let response = match services
            .secrets
            .get_secret(alias, &format!("{prefix}ExpectSendPass{index}"))
        {
            Some(pass) => Secret::new(format!("{}\r", pass.expose_secret())),
            None => {
                let text = services
                    .config
                    .get(alias, &format!("{prefix}ExpectSendText{index}"));
                Secret::new(unescape(&text))
            }
        };
        interactions.push(ExpectInteraction { pattern, response });
    }
    Some(ExpectHarness {
        interactions,
        timeout,
    })
}

fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

fn compile_wildcard(pattern: &str) -> Option<Regex> {
    let translated = regex::escape(pattern).replace(r"\*", ".*");
    match Regex::new(&format!("(?s){translated}")) {
        Ok(regex) => Some(regex),
        Err(error) => {
            warn!(%pattern, %error, "cannot compile expect pattern");
            None
        }
    }
}

impl ExpectHarness {
    /// Runs every interaction: wait for the pattern in the rolling buffer,
    /// send the response. On return `buffer` holds exactly the bytes read
    /// after the final match, ready to be forwarded verbatim.
    pub async fn drive(
        &self,
        chunks: &mut UnboundedReceiver<Vec<u8>>,
        mut send: impl FnMut(Vec<u8>) -> std::io::Result<()>,
        buffer: &mut Vec<u8>,
    ) -> Result<(), PassageError> {
        let deadline = Instant::now() + self.timeout;
        for (index, interaction) in self.interactions.iter().enumerate() {
            if let Some(regex) = interaction
                .pattern
                .as_deref()
                .and_then(compile_wildcard)
            {
                loop {
                    if regex.is_match(&String::from_utf8_lossy(buffer)) {
                        buffer.clear();
                        break;
                    }
                    let chunk = tokio::time::timeout_at(deadline, chunks.recv())
                        .await
                        .map_err(|_| {
                            debug!(interaction = index + 1, "expect deadline elapsed");
                            PassageError::TimeoutExceeded
                        })?
                        .ok_or(PassageError::TimeoutExceeded)?;
                    buffer.extend_from_slice(&chunk);
                }
            }
            debug!(interaction = index + 1, "sending expect response");
            send(interaction.response.expose_secret().clone().into_bytes())?;
        }
        Ok(())
    }
}

/// A child process attached to a pty master, its output pumped into a
/// channel by a blocking reader thread.
pub struct PtySession {
    chunks: UnboundedReceiver<Vec<u8>>,
    writer_tx: std::sync::mpsc::Sender<Vec<u8>>,
    child: Box<dyn Child + Send + Sync>,
    _master: Box<dyn MasterPty + Send>,
    residue: Vec<u8>,
}

impl PtySession {
    pub fn spawn(argv: &[String]) -> anyhow::Result<Self> {
        anyhow::ensure!(!argv.is_empty(), "empty command");
        let pty_system = native_pty_system();
        let pair = pty_system.openpty(PtySize {
            rows: 24,
            cols: 80,
            pixel_width: 0,
            pixel_height: 0,
        })?;
        let mut cmd = CommandBuilder::new(&argv[0]);
        cmd.args(&argv[1..]);
        let child = pair.slave.spawn_command(cmd)?;
        drop(pair.slave);

        let mut reader = pair.master.try_clone_reader()?;
        let (chunk_tx, chunks) = unbounded_channel();
        std::thread::spawn(move || pump_reader(&mut reader, chunk_tx));

        let mut writer = pair.master.take_writer()?;
        let (writer_tx, writer_rx) = std::sync::mpsc::channel::<Vec<u8>>();
        std::thread::spawn(move || {
            while let Ok(data) = writer_rx.recv() {
                if writer.write_all(&data).and_then(|_| writer.flush()).is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            chunks,
            writer_tx,
            child,
            _master: pair.master,
            residue: Vec::new(),
        })
    }

    pub async fn expect(&mut self, harness: &ExpectHarness) -> Result<(), PassageError> {
        let writer_tx = self.writer_tx.clone();
        let chunks = &mut self.chunks;
        let residue = &mut self.residue;
        harness
            .drive(
                chunks,
                move |data| {
                    writer_tx
                        .send(data)
                        .map_err(|_| std::io::Error::from(std::io::ErrorKind::BrokenPipe))
                },
                residue,
            )
            .await
    }

    /// Waits until `needle` shows up in the output, buffering everything
    /// else. Used by the control-master bridge to spot its `ok` marker.
    pub async fn wait_for_literal(
        &mut self,
        needle: &str,
        timeout: Duration,
    ) -> Result<(), PassageError> {
        let deadline = Instant::now() + timeout;
        loop {
            if String::from_utf8_lossy(&self.residue).contains(needle) {
                return Ok(());
            }
            let chunk = tokio::time::timeout_at(deadline, self.chunks.recv())
                .await
                .map_err(|_| PassageError::TimeoutExceeded)?
                .ok_or(PassageError::TimeoutExceeded)?;
            self.residue.extend_from_slice(&chunk);
        }
    }

    pub fn kill(&mut self) {
        let _ = self.child.kill();
    }

    /// Hands the pty over as a byte stream; residue left from the expect
    /// phase is replayed first.
    pub fn into_stream(self) -> PtyStream {
        PtyStream {
            residue: self.residue,
            chunks: self.chunks,
            writer_tx: self.writer_tx,
            _child: self.child,
            _master: self._master,
        }
    }
}

fn pump_reader(reader: &mut Box<dyn Read + Send>, tx: UnboundedSender<Vec<u8>>) {
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
        }
    }
}

pub struct PtyStream {
    residue: Vec<u8>,
    chunks: UnboundedReceiver<Vec<u8>>,
    writer_tx: std::sync::mpsc::Sender<Vec<u8>>,
    _child: Box<dyn Child + Send + Sync>,
    _master: Box<dyn MasterPty + Send>,
}

impl AsyncRead for PtyStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if !self.residue.is_empty() {
            let take = self.residue.len().min(buf.remaining());
            let rest = self.residue.split_off(take);
            buf.put_slice(&self.residue);
            self.residue = rest;
            return Poll::Ready(Ok(()));
        }
        match self.chunks.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => {
                let take = chunk.len().min(buf.remaining());
                buf.put_slice(&chunk[..take]);
                if take < chunk.len() {
                    self.residue = chunk[take..].to_vec();
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for PtyStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.writer_tx.send(buf.to_vec()) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn harness(patterns: &[(&str, &str)]) -> ExpectHarness {
        ExpectHarness {
            interactions: patterns
                .iter()
                .map(|(pattern, response)| ExpectInteraction {
                    pattern: (!pattern.is_empty()).then(|| (*pattern).to_owned()),
                    response: Secret::new((*response).to_owned()),
                })
                .collect(),
            timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn test_consumes_exact_prompt_cycles() {
        let harness = harness(&[("*assword*", "hunter2\r"), ("*[y/n]*", "y\r")]);
        let (tx, mut rx) = unbounded_channel();
        tx.send(b"Pass".to_vec()).unwrap();
        tx.send(b"word: ".to_vec()).unwrap();
        tx.send(b"continue [y/n] ".to_vec()).unwrap();
        tx.send(b"residual output".to_vec()).unwrap();

        let mut sent = Vec::new();
        let mut buffer = Vec::new();
        harness
            .drive(
                &mut rx,
                |data| {
                    sent.push(String::from_utf8(data).unwrap());
                    Ok(())
                },
                &mut buffer,
            )
            .await
            .unwrap();

        assert_eq!(sent, vec!["hunter2\r", "y\r"]);
        // everything after the final match is residue for the consumer
        let mut residue = buffer;
        while let Ok(chunk) = rx.try_recv() {
            residue.extend_from_slice(&chunk);
        }
        assert_eq!(residue, b"residual output");
    }

    #[tokio::test]
    async fn test_timeout_mid_prompt() {
        let harness = harness(&[("*never-matches*", "x")]);
        let (tx, mut rx) = unbounded_channel();
        tx.send(b"some output".to_vec()).unwrap();

        let mut buffer = Vec::new();
        let result = harness.drive(&mut rx, |_| Ok(()), &mut buffer).await;
        assert!(matches!(result, Err(PassageError::TimeoutExceeded)));
        // the bytes received so far are still available for forwarding
        assert_eq!(buffer, b"some output");
    }

    #[tokio::test]
    async fn test_patternless_sends_immediately() {
        let harness = harness(&[("", "hello\r")]);
        let (_tx, mut rx) = unbounded_channel();
        let mut sent = Vec::new();
        let mut buffer = Vec::new();
        harness
            .drive(
                &mut rx,
                |data| {
                    sent.push(data);
                    Ok(())
                },
                &mut buffer,
            )
            .await
            .unwrap();
        assert_eq!(sent, vec![b"hello\r".to_vec()]);
    }

    #[test]
    fn test_unescape() {
        assert_eq!(unescape(r"a\\b\rc"), "a\\b\rc");
        assert_eq!(unescape(r"plain"), "plain");
        assert_eq!(unescape(r"trailing\"), "trailing\\");
    }
}
