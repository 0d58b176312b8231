pub mod config;
pub mod handler;
pub mod listener;
pub mod logger;
