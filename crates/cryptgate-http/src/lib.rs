//! HTTP surface for the cryptgate gateway.
//!
//! Glue between hyper and the gateway core: [`router`] maps an incoming
//! request to an S3 operation (path-style only), [`codec`] strips the
//! aws-chunked framing from streaming uploads, [`service`] runs the
//! request lifecycle (request-id, auth, dispatch, error shaping), and
//! [`body`] is the response body type handed back to hyper.

pub mod body;
pub mod codec;
pub mod router;
pub mod service;

pub use body::GatewayBody;
pub use router::{GatewayOperation, RouteContext, resolve};
pub use service::GatewayService;
