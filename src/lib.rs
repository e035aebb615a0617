pub mod config;
pub mod context;
pub mod core;
pub mod daemon;
pub mod error;
pub mod logging;
pub mod status;
