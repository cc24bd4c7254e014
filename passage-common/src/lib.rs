mod duration;
mod error;
mod secrets;
pub mod helpers;
pub mod types;

pub use duration::parse_duration_seconds;
pub use error::{is_closed_io_error, PassageError};
pub use secrets::{decode_secret, encode_secret, SecretCodecError};
pub use types::*;
