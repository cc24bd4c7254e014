mod auth;
mod ciphers;
mod client;
mod common;
mod control;
mod expect;
pub mod forward;
mod known_hosts;
mod pipe;
mod util;

pub use auth::AuthOutcome;
pub use client::{login, run_session, SshConnection};
pub use common::*;
pub use control::ControlMaster;
pub use expect::{ExpectHarness, ExpectInteraction};
pub use forward::install_forwards;
pub use known_hosts::{KnownHosts, KnownHostValidationResult};
pub use pipe::connect_pipe;
pub use util::with_timeout;
