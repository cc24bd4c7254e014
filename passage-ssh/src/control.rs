//! OpenSSH control-master client: launches the external `ssh` binary to
//! establish (or reuse) a multiplexing master, then dials its control
//! socket and hands the connection back as an SSH transport.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use passage_common::PassageError;
use passage_core::config::expand_tilde;
use passage_core::tokens::TokenExpander;
use passage_core::{LoginParam, Services};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::UnixStream;
use tokio::process::Command;
use tracing::*;

use crate::expect::{load_expect, PtySession};
use crate::with_timeout;

const MASTER_WAIT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlMode {
    No,
    Auto,
    AutoAsk,
    Yes,
    Ask,
}

impl ControlMode {
    fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "auto" => Self::Auto,
            "autoask" => Self::AutoAsk,
            "yes" => Self::Yes,
            "ask" => Self::Ask,
            _ => Self::No,
        }
    }

    fn as_option(self) -> &'static str {
        match self {
            Self::No => "no",
            Self::Auto => "auto",
            Self::AutoAsk => "autoask",
            Self::Yes => "yes",
            Self::Ask => "ask",
        }
    }
}

pub struct ControlMaster;

impl ControlMaster {
    /// Returns a connected control-socket stream when multiplexing applies
    /// to this invocation, `None` otherwise.
    pub async fn connect(
        services: &Services,
        param: &LoginParam,
    ) -> Result<Option<UnixStream>, PassageError> {
        let mode = ControlMode::parse(&services.config.get(&param.alias, "ControlMaster"));
        if mode == ControlMode::No {
            return Ok(None);
        }
        let template = services.config.get(&param.alias, "ControlPath");
        if template.is_empty() || template.eq_ignore_ascii_case("none") {
            return Ok(None);
        }

        let allowed = control_path_tokens(detect_openssh_version().await);
        let expander = TokenExpander::new(param);
        let path = PathBuf::from(expand_tilde(&expander.expand(&template, &allowed)?));

        if path.exists() {
            if matches!(mode, ControlMode::Yes | ControlMode::Ask) {
                // an existing socket under yes/ask disables multiplexing
                // for this invocation
                debug!(path = %path.display(), "control socket exists, multiplexing disabled");
                return Ok(None);
            }
            match UnixStream::connect(&path).await {
                Ok(stream) => {
                    info!(path = %path.display(), "reusing control master");
                    return Ok(Some(stream));
                }
                Err(error) => {
                    debug!(path = %path.display(), %error, "stale control socket");
                    let _ = std::fs::remove_file(&path);
                }
            }
        }

        spawn_master(services, param, mode, &path).await?;

        let stream = with_timeout(UnixStream::connect(&path), Duration::from_secs(10))
            .await?
            .map_err(|error| {
                PassageError::Config(format!(
                    "cannot dial control socket [{}]: {error}",
                    path.display()
                ))
            })?;
        Ok(Some(stream))
    }
}

fn master_argv(param: &LoginParam, mode: ControlMode, path: &Path) -> Vec<String> {
    vec![
        "ssh".to_owned(),
        "-T".to_owned(),
        "-oRemoteCommand=none".to_owned(),
        "-oConnectTimeout=10".to_owned(),
        format!("-oControlMaster={}", mode.as_option()),
        format!("-oControlPath={}", path.display()),
        "-p".to_owned(),
        param.port.clone(),
        "-l".to_owned(),
        param.user.clone(),
        param.host.clone(),
        "echo ok; sleep 10".to_owned(),
    ]
}

async fn spawn_master(
    services: &Services,
    param: &LoginParam,
    mode: ControlMode,
    path: &Path,
) -> Result<(), PassageError> {
    passage_core::tokens::validate_spawn_safe("hostname", &param.host)?;
    passage_core::tokens::validate_spawn_safe("user", &param.user)?;
    let argv = master_argv(param, mode, path);
    info!(host = %param.host, "establishing control master");

    // A Ctrl-prefixed expect configuration means the master needs a pty so
    // the harness can answer its prompts.
    if let Some(harness) = load_expect(services, &param.alias, "Ctrl") {
        let mut session = PtySession::spawn(&argv)
            .map_err(|e| PassageError::Config(format!("cannot spawn control master: {e}")))?;
        let result: Result<(), PassageError> = async {
            session.expect(&harness).await?;
            session.wait_for_literal("ok", MASTER_WAIT).await
        }
        .await;
        if let Err(error) = result {
            session.kill();
            return Err(error);
        }
        return Ok(());
    }

    let mut child = Command::new(&argv[0])
        .args(&argv[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| PassageError::Config(format!("cannot spawn control master: {e}")))?;

    let stdout = child.stdout.take().ok_or(PassageError::TimeoutExceeded)?;
    let mut stderr = child.stderr.take().ok_or(PassageError::TimeoutExceeded)?;

    let scan = async {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim() == "ok" {
                return true;
            }
        }
        false
    };

    match with_timeout(scan, MASTER_WAIT).await {
        Ok(true) => {
            // the master daemonizes itself; just reap our child
            tokio::spawn(async move {
                let _ = child.wait().await;
            });
            Ok(())
        }
        other => {
            // diagnostics only surface on failure
            let mut diagnostics = String::new();
            let _ = stderr.read_to_string(&mut diagnostics).await;
            if !diagnostics.trim().is_empty() {
                warn!("control master: {}", diagnostics.trim());
            }
            terminate(&mut child).await;
            match other {
                Err(error) => Err(error),
                _ => Err(PassageError::Config(
                    "control master did not come up".to_owned(),
                )),
            }
        }
    }
}

/// SIGINT first, SIGKILL 500 ms later.
async fn terminate(child: &mut tokio::process::Child) {
    if let Some(pid) = child.id() {
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGINT,
        );
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    let _ = child.start_kill();
}

/// `%j` in `ControlPath` needs OpenSSH 9.6 or newer.
fn control_path_tokens(version: Option<(u32, u32)>) -> String {
    match version {
        Some((major, minor)) if (major, minor) >= (9, 6) => "hprnlLCj".to_owned(),
        _ => "hprnlLC".to_owned(),
    }
}

async fn detect_openssh_version() -> Option<(u32, u32)> {
    let output = Command::new("ssh").arg("-V").output().await.ok()?;
    // `ssh -V` reports on stderr: OpenSSH_9.7p1 ...
    parse_openssh_version(&String::from_utf8_lossy(&output.stderr))
}

fn parse_openssh_version(banner: &str) -> Option<(u32, u32)> {
    let rest = banner.split("OpenSSH_").nth(1)?;
    let version: String = rest
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let (major, minor) = version.split_once('.')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_parse() {
        assert_eq!(
            parse_openssh_version("OpenSSH_9.7p1 Debian-7, OpenSSL 3.0"),
            Some((9, 7))
        );
        assert_eq!(
            parse_openssh_version("OpenSSH_8.9p1 Ubuntu"),
            Some((8, 9))
        );
        assert_eq!(parse_openssh_version("Dropbear v2022.83"), None);
    }

    #[test]
    fn test_token_set_gate() {
        assert!(control_path_tokens(Some((9, 6))).contains('j'));
        assert!(control_path_tokens(Some((9, 7))).contains('j'));
        assert!(!control_path_tokens(Some((9, 5))).contains('j'));
        assert!(!control_path_tokens(None).contains('j'));
    }

    #[test]
    fn test_master_argv_shape() {
        let param = passage_core::LoginParam {
            alias: "web".into(),
            host: "web.example.com".into(),
            port: "2022".into(),
            user: "admin".into(),
            ..Default::default()
        };
        let argv = master_argv(&param, ControlMode::Auto, Path::new("/tmp/cm.sock"));
        assert_eq!(argv[0], "ssh");
        assert!(argv.contains(&"-oControlMaster=auto".to_owned()));
        assert!(argv.contains(&"-oRemoteCommand=none".to_owned()));
        assert_eq!(argv.last().unwrap(), "echo ok; sleep 10");
        assert_eq!(argv[argv.len() - 2], "web.example.com");
    }
}
