//! cnscan Core Library
//!
//! This crate provides the core functionality for scanning multi-tenant
//! SaaS instances exposed as `<prefix><N>.<domain>` hosts:
//! - HTTP transport with retries, backoff and redirect history
//! - Per-instance probing (DNS, liveness, version, hostname, geolocation)
//! - Shuffled work partitioning and a cancellable worker pool
//! - Record rendering as CSV, JSON lines or text
//!
//! # Example
//!
//! ```no_run
//! use cnscan_core::{config, render::OutputFormat, scanner::ScanOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = config::load_scan_settings();
//!     settings.validate()?;
//!
//!     let scan = ScanOrchestrator::with_defaults(settings);
//!     let mut stream = scan.run(100, 4);
//!
//!     let renderer = OutputFormat::Csv.renderer();
//!     while let Some(record) = stream.next_record().await {
//!         println!("{}", renderer.render(&record));
//!     }
//!
//!     let summary = stream.finish().await;
//!     println!("{} active", summary.active);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod render;
pub mod scanner;
pub mod transport;

// Re-export commonly used types
pub use config::{ConfigSource, ScanSettings};
pub use error::{ConfigError, StageError, TransportError};
pub use render::{OutputFormat, Renderer};
pub use scanner::{
    InstanceProbe, InstanceRecord, Location, ScanOrchestrator, ScanStream, ScanSummary,
};
pub use transport::{Transport, TransportClient, TransportConfig};
