pub mod compactor;
pub mod config;
pub mod engine;
pub mod limits;
pub mod model;
pub mod observability;
pub mod request;
pub mod scheduler;
pub mod store;
pub mod wal;
pub mod wire;
