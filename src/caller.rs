//! Caller identity middleware
//!
//! Reads the caller's user id from the `X-Caller-Id` header and stores it in
//! the request extensions. The id is opaque; the metadata store decides what
//! it may do.

use axum::{extract::Request, middleware::Next, response::Response};

pub const CALLER_HEADER: &str = "x-caller-id";
pub const ANONYMOUS: &str = "anonymous";

/// The user id every store call in a request is made as
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller(pub String);

impl Caller {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Attach the caller identity to the request
pub async fn caller_middleware(mut request: Request, next: Next) -> Response {
    let caller = request
        .headers()
        .get(CALLER_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(ANONYMOUS)
        .to_string();

    request.extensions_mut().insert(Caller(caller));
    next.run(request).await
}
