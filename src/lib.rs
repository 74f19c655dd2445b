pub mod config;
pub mod error;
pub mod import;
pub mod metadata;
pub mod storage;
pub mod tracking;
