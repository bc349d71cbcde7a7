//! S3 error model and wire XML for the cryptgate gateway.
//!
//! The gateway speaks the S3 REST protocol on both sides, so every failure
//! it produces must surface as an S3-shaped XML error with the right code
//! and HTTP status. This crate owns that error model plus the small set of
//! XML documents the proxy must actually understand (multipart initiate
//! results and complete-request part lists); everything else is forwarded
//! upstream as opaque bytes.

pub mod error;
pub mod xml;

pub use error::{S3Error, S3ErrorCode};
