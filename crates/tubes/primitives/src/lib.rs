pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod messages;
pub mod session;
pub mod wire;
