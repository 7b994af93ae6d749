pub mod broker;
pub mod config;
pub mod error;
pub mod executor;
pub mod http;
pub mod ingest;
pub mod registry;
pub mod scheduler;
pub mod shutdown;
