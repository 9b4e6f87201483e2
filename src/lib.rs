pub mod config;
pub mod db;
pub mod detect;
pub mod download;
pub mod engine;
pub mod error;
pub mod model;
pub mod notion;
pub mod rehost;
pub mod render;
pub mod retry;
pub mod shutdown;
pub mod storage;
pub mod sweep;
pub mod walker;
