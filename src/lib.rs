#![forbid(unsafe_code)]

pub mod config;
pub mod echo;
pub mod errors;
pub mod ipc;
pub mod models;

pub use config::ChannelConfig;
pub use errors::{AppError, Result};
