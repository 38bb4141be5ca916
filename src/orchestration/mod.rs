//! High-level orchestration: wiring components from config, the worker
//! loop, and graceful shutdown.

pub mod builder;
pub mod shutdown;
pub mod worker;

pub use builder::{build_crawler, CrawlReport, Crawler};
pub use shutdown::setup_shutdown_handler;
