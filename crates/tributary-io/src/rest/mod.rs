//! REST API source
//!
//! The source is assembled from three parts:
//!
//! - a [`uri::UriProvider`] rendering request URLs and bodies from templates,
//!   with date windows and an optional [`paging::PageResolver`]
//! - an [`auth::AuthProvider`] attaching credentials
//! - an optional [`crate::rate_limit::RateLimiter`]

pub mod auth;
pub mod paging;
mod source;
pub mod uri;

pub use auth::{AuthProvider, DynamicBearerAuth, FixedHeaderAuth};
pub use paging::{Page, PageResolver};
pub use source::RestApiSource;
pub use uri::{ApiRequest, UriProvider};

use serde_json::Value;
use tributary_core::{StreamError, StreamResult};

/// Follow a property chain; an empty chain is the value itself
pub fn json_at<'a>(value: &'a Value, chain: &[String]) -> Option<&'a Value> {
    chain.iter().try_fold(value, |current, key| current.get(key))
}

pub(crate) fn parse_method(method: &str) -> StreamResult<reqwest::Method> {
    reqwest::Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .map_err(|_| StreamError::config(format!("invalid HTTP method {method}")))
}

pub(crate) fn http_error(e: reqwest::Error) -> StreamError {
    if e.is_timeout() {
        StreamError::Timeout(e.to_string())
    } else if e.is_decode() {
        StreamError::parse(e.to_string())
    } else if let Some(status) = e.status() {
        StreamError::Http {
            status: status.as_u16(),
            message: e.to_string(),
        }
    } else {
        StreamError::io(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_at() {
        let value = json!({ "data": { "items": [1, 2] } });
        let chain = vec!["data".to_string(), "items".to_string()];
        assert_eq!(json_at(&value, &chain), Some(&json!([1, 2])));
        assert_eq!(json_at(&value, &[]), Some(&value));
        assert_eq!(json_at(&value, &["missing".to_string()]), None);
    }

    #[test]
    fn test_parse_method() {
        assert_eq!(parse_method("post").unwrap(), reqwest::Method::POST);
    }
}
