use std::error::Error;

use crate::types::exit_code;

#[derive(thiserror::Error, Debug)]
pub enum PassageError {
    #[error("config: {0}")]
    Config(String),

    #[error("invalid token in \"{template}\": {message}")]
    Token { template: String, message: String },

    #[error("forward spec: {0}")]
    ForwardSpec(String),

    #[error("remote host identification has changed for [{host}]")]
    HostKeyChanged { host: String },

    #[error("host key verification failed for [{host}]")]
    HostKeyRejected { host: String },

    #[error("authentication failed for [{user}@{addr}]")]
    AuthExhausted { user: String, addr: String },

    #[error("dial [{addr}] timed out after {seconds}s")]
    DialTimeout { addr: String, seconds: u64 },

    #[error("forward listener on [{addr}] denied: {source}")]
    ForwardDenied {
        addr: String,
        source: std::io::Error,
    },

    #[error("xauth: {0}")]
    XauthFailure(String),

    #[error("cannot open session: {0}")]
    OpenSession(String),

    #[error("cannot start command: {0}")]
    StartCommand(String),

    #[error("shell failed: {0}")]
    Shell(String),

    #[error("stdin wiring failed: {0}")]
    StdinWiring(String),

    #[error("operation timed out")]
    TimeoutExceeded,

    #[error("killed by signal")]
    SignalKill,

    #[error("keepalive lost")]
    KeepaliveLoss,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(Box<dyn Error + Send + Sync>),
}

impl PassageError {
    pub fn other<E: Error + Send + Sync + 'static>(err: E) -> Self {
        Self::Other(Box::new(err))
    }

    /// Process exit code for errors that terminate the client.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::HostKeyChanged { .. }
            | Self::HostKeyRejected { .. }
            | Self::AuthExhausted { .. }
            | Self::DialTimeout { .. } => exit_code::HANDSHAKE,
            Self::ForwardDenied { .. } | Self::ForwardSpec(_) => exit_code::IO_FORWARD,
            Self::OpenSession(_) => exit_code::OPEN_SESSION,
            Self::StartCommand(_) => exit_code::START_COMMAND,
            Self::Shell(_) => exit_code::SHELL,
            Self::StdinWiring(_) => exit_code::STDIN_WIRING,
            Self::SignalKill => exit_code::SIGNAL_KILL,
            Self::KeepaliveLoss => exit_code::KEEPALIVE_LOSS,
            _ => exit_code::FORCED_EXIT,
        }
    }
}

/// Recognises the I/O errors every socket raises while the connection is
/// being torn down, so shutdown-path failures can be demoted to debug.
pub fn is_closed_io_error(error: &std::io::Error) -> bool {
    use std::io::ErrorKind::*;
    matches!(
        error.kind(),
        BrokenPipe | ConnectionReset | ConnectionAborted | NotConnected | UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_predicate() {
        let closed = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let open = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "perm");
        assert!(is_closed_io_error(&closed));
        assert!(!is_closed_io_error(&open));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(
            PassageError::SignalKill.exit_code(),
            exit_code::SIGNAL_KILL
        );
        assert_eq!(
            PassageError::AuthExhausted {
                user: "u".into(),
                addr: "h:22".into()
            }
            .exit_code(),
            exit_code::HANDSHAKE
        );
    }
}
