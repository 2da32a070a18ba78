// Library root: re-exports all modules so integration tests and the binary
// can access the crate's public API.

pub mod app;
pub mod config;
pub mod db;
pub mod draft;
pub mod hub;
pub mod league;
pub mod protocol;
pub mod store;
pub mod ws_server;
