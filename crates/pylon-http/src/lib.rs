//! # pylon-http
//!
//! REST request core for the Pylon client.
//!
//! Hosts the bucket rate limiter, which is shared between the REST request
//! path and the gateway send path, plus the generic request machinery
//! (authorization, retries, error taxonomy). Per-endpoint API methods live
//! outside this crate; only the gateway bootstrap route is provided here
//! because connecting consumes its payload.

pub mod client;
pub mod error;
pub mod rate_limit;
pub mod routes;

pub use client::{GatewayBotInfo, HttpClient, SessionStartLimit};
pub use error::HttpError;
pub use rate_limit::{BucketKey, RateLimitInfo, RateLimiter};
pub use routes::Route;
