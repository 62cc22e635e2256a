//! HTTP plumbing for the Souk backend.
//!
//! This module provides:
//! - `HttpTransport`: the bare client seam; never attaches tokens
//! - `ReqwestTransport`: the production transport
//! - `ApiClient`: resolves a token through the session manager, attaches it,
//!   and tears the session down when an authenticated call comes back 401
//! - `ResponseCache`: in-memory GET cache tied to the signed-in identity

pub mod cache;
pub mod client;
pub mod error;
pub mod transport;

pub use cache::{CachedData, ResponseCache};
pub use client::{ApiClient, VALIDATION_HEADER};
pub use error::ApiError;
pub use transport::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
