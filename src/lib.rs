pub mod collectors;
pub mod config;
pub mod db;
pub mod dedup;
pub mod domain;
pub mod error;
pub mod exporter;
pub mod llm;
pub mod logging;
pub mod pipeline;
pub mod rate_limiter;
pub mod storage;
pub mod types;
