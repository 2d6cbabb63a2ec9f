pub mod client;
pub mod config;
pub mod history;
pub mod media;
pub mod protocol;
pub mod session;
pub mod telemetry;
pub mod transcript;
pub mod transport;
