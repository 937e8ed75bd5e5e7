pub mod backoff;
pub mod cluster;
pub mod config;
pub mod context;
pub mod errors;
pub mod k8s;
pub mod metrics;
pub mod plugin;
pub mod registry;
pub mod server;
pub mod teamrbac;
