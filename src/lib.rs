pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod state;
pub mod store;
pub mod stream;
