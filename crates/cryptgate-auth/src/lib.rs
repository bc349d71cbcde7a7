//! AWS Signature Version 4 for the cryptgate gateway.
//!
//! The gateway sits on both sides of the signing boundary:
//!
//! - **Inbound**, it verifies that each request was signed by a registered
//!   client credential ([`verify::verify_request`]), enforcing the clock-skew
//!   window, the Authorization header length cap, and the payload-hash
//!   policy.
//! - **Outbound**, it re-signs the rewritten request with the gateway's own
//!   service credentials ([`sign::sign_request`]); client credentials never
//!   reach the upstream store.

pub mod canonical;
pub mod credentials;
pub mod error;
pub mod sign;
pub mod verify;

pub use credentials::{CredentialProvider, CredentialRecord, StaticCredentialProvider};
pub use error::AuthError;
pub use sign::{ServiceCredentials, sign_request};
pub use verify::{AuthResult, PayloadHash, VerifyPolicy, hash_payload, verify_request};
