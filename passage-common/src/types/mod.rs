mod secret;

pub use secret::Secret;

pub mod exit_code {
    pub const HANDSHAKE: i32 = 16;
    pub const IO_FORWARD: i32 = 17;
    pub const START_COMMAND: i32 = 19;
    pub const SHELL: i32 = 20;
    pub const STDIN_WIRING: i32 = 21;
    pub const FILTER: i32 = 22;
    pub const OPEN_SESSION: i32 = 23;
    pub const FORCED_EXIT: i32 = 204;
    pub const KEEPALIVE_LOSS: i32 = 205;
    pub const SIGNAL_KILL: i32 = 206;
}
