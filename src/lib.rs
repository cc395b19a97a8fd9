pub mod client;
pub mod config;
pub mod geometry;
pub mod server;
pub mod store;
pub mod types;
