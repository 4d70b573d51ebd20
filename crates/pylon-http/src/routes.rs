//! API routes
//!
//! A route is an HTTP method plus a path template with `{name}` parameters.
//! Its rate-limit bucket keeps only the major parameters (guild, channel)
//! filled in, so every URL sharing a template shares one bucket.

use crate::rate_limit::BucketKey;
use reqwest::Method;

/// Route parameters considered "major": they distinguish buckets, all other
/// parameters collapse into one bucket per template.
const MAJOR_PARAMS: [&str; 2] = ["guild", "channel"];

/// An API route template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub method: Method,
    pub path: &'static str,
}

/// Gateway bootstrap route consumed by the connect path.
pub const GET_GATEWAY_BOT: Route = Route::new(Method::GET, "/gateway/bot");

impl Route {
    #[must_use]
    pub const fn new(method: Method, path: &'static str) -> Self {
        Self { method, path }
    }

    /// Render the path with all parameters substituted.
    #[must_use]
    pub fn format(&self, params: &[(&str, &str)]) -> String {
        Self::substitute(self.path, params, false)
    }

    /// The rate-limit bucket for this route: method plus the template with
    /// only major parameters substituted.
    #[must_use]
    pub fn bucket(&self, params: &[(&str, &str)]) -> BucketKey {
        BucketKey::Route {
            method: self.method.as_str().to_string(),
            path: Self::substitute(self.path, params, true),
        }
    }

    fn substitute(template: &str, params: &[(&str, &str)], major_only: bool) -> String {
        let mut path = template.to_string();
        for (name, value) in params {
            let placeholder = format!("{{{name}}}");
            let value = if major_only && !MAJOR_PARAMS.contains(name) {
                ""
            } else {
                value
            };
            path = path.replace(&placeholder, value);
        }
        path
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}
