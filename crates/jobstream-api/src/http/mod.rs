//! HTTP/REST API layer for jobstream.
//!
//! Axum-based REST API at `/api/v1/` with envelope response format, SSE
//! execution streams, and CORS support.

pub mod error;
pub mod handlers;
pub mod response;
pub mod router;
