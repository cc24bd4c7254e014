pub mod config;
mod destination;
mod lifecycle;
mod param;
mod services;
pub mod tokens;

pub use destination::Destination;
pub use lifecycle::Lifecycle;
pub use param::LoginParam;
pub use services::Services;
