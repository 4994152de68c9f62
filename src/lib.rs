//! Wakegate - a lazy-start proxy for a game server
//!
//! This library provides a TCP proxy that sits on the game's port and:
//! - Answers server-list queries itself, even while the backend is down
//! - Starts the backend through an operator script on the first login
//! - Relays logged-in sessions to the backend byte for byte
//! - Stops the backend again once nobody has been connected for a while

pub mod codec;
pub mod config;
pub mod controller;
pub mod error;
pub mod handshake;
pub mod lifecycle;
pub mod proxy;
pub mod relay;
pub mod status;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
