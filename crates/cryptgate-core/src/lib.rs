//! Gateway core for cryptgate.
//!
//! This crate hosts everything between the HTTP surface and the upstream
//! store: validated configuration, the upstream client seam, the
//! single-object encryption pipeline, the multipart encryption engine with
//! its background reaper, and the error mapping onto the S3 surface.
//!
//! The entry point is [`Gateway`]: the HTTP layer routes a request and
//! calls the matching operation (`put_object`, `get_object`,
//! `create_multipart_upload`, `passthrough`, ...), each of which returns an
//! upstream-shaped response ready to be written back to the client.

pub mod config;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod multipart;
pub mod object;
pub mod upstream;

pub use config::{ConfigError, GatewayConfig, IntegrityMode};
pub use gateway::{Gateway, build_encryption};
pub use metrics::Metrics;
pub use multipart::{MultipartTable, spawn_reaper};
