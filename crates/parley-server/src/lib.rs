pub mod client;
pub mod config;
pub mod protocol;
pub mod server;

pub use client::ClientRegistry;
pub use config::ServerConfig;
pub use server::{start, ServerHandle};
