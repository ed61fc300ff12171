//! HTTP surface for function invocation.

pub mod request;
pub mod router;
pub mod server;

pub use router::{ApiError, app_router};
pub use server::serve_http;
