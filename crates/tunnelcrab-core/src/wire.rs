use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, TunnelError};

/// Ordered-by-insertion header map: header name -> sequence of values.
pub type Headers = HashMap<String, Vec<String>>;

/// Serialized HTTP Request (SHR). The body travels as the next binary frame,
/// never as part of this struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializedRequest {
    #[serde(rename = "Method")]
    pub method: String,
    #[serde(rename = "URL")]
    pub url: String,
    #[serde(rename = "Header")]
    pub header: Headers,
    #[serde(rename = "ContentLength")]
    pub content_length: i64,
}

/// Serialized HTTP Response (SHP). The body travels as the next binary frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializedResponse {
    #[serde(rename = "StatusCode")]
    pub status_code: u16,
    #[serde(rename = "Header")]
    pub header: Headers,
    #[serde(rename = "ContentLength")]
    pub content_length: i64,
}

impl SerializedResponse {
    pub fn error(status_code: u16, body_len: usize) -> Self {
        Self {
            status_code,
            header: Headers::new(),
            content_length: body_len as i64,
        }
    }
}

/// Opaque Client-generated identifier. Same PoolID reusing a subdomain is
/// the same Client instance reconnecting; a different PoolID on an
/// already-claimed subdomain is a conflict.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PoolId(String);

impl PoolId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for PoolId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A validated subdomain: `^[a-z0-9]+(-[a-z0-9]+)*$`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subdomain(String);

impl Subdomain {
    pub fn parse(raw: &str) -> Result<Self> {
        if is_valid_subdomain(raw) {
            Ok(Self(raw.to_string()))
        } else {
            Err(TunnelError::InvalidSubdomain(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Subdomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `^[a-z0-9]+(-[a-z0-9]+)*$` without pulling in the `regex` crate: lowercase
/// alphanumeric labels joined by single hyphens, no leading/trailing hyphen,
/// no empty labels.
pub fn is_valid_subdomain(raw: &str) -> bool {
    if raw.is_empty() {
        return false;
    }
    raw.split('-').all(|label| {
        !label.is_empty() && label.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
    })
}

/// The `X-Greeting-Message` header: `<PoolID>_<PoolIdleSize>`.
#[derive(Debug, Clone)]
pub struct Greeting {
    pub pool_id: PoolId,
    pub pool_idle_size: u32,
}

impl Greeting {
    pub fn format(pool_id: &PoolId, pool_idle_size: u32) -> String {
        format!("{pool_id}_{pool_idle_size}")
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let (id, size) = raw
            .split_once('_')
            .ok_or_else(|| TunnelError::InvalidGreeting(raw.to_string()))?;
        if id.is_empty() {
            return Err(TunnelError::InvalidGreeting(raw.to_string()));
        }
        let pool_idle_size: u32 = size
            .parse()
            .map_err(|_| TunnelError::InvalidGreeting(raw.to_string()))?;
        if pool_idle_size == 0 {
            return Err(TunnelError::InvalidGreeting(raw.to_string()));
        }
        Ok(Self {
            pool_id: PoolId::from(id.to_string()),
            pool_idle_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subdomain_accepts_valid_forms() {
        for s in ["abc", "a-b", "a1-b2"] {
            assert!(Subdomain::parse(s).is_ok(), "{s} should be valid");
        }
    }

    #[test]
    fn subdomain_rejects_invalid_forms() {
        for s in ["-a", "a-", "a_b", "A", "a.b", ""] {
            assert!(Subdomain::parse(s).is_err(), "{s} should be invalid");
        }
    }

    #[test]
    fn greeting_parses_uuid_and_size() {
        let g = Greeting::parse("uuid-like_5").unwrap();
        assert_eq!(g.pool_id.as_str(), "uuid-like");
        assert_eq!(g.pool_idle_size, 5);
    }

    #[test]
    fn greeting_rejects_missing_parts() {
        assert!(Greeting::parse("x").is_err());
        assert!(Greeting::parse("x_z").is_err());
        assert!(Greeting::parse("x_0").is_err());
    }

    #[test]
    fn greeting_roundtrips_through_format() {
        let id = PoolId::generate();
        let raw = Greeting::format(&id, 3);
        let g = Greeting::parse(&raw).unwrap();
        assert_eq!(g.pool_id, id);
        assert_eq!(g.pool_idle_size, 3);
    }

    #[test]
    fn serialized_request_uses_go_style_field_names() {
        let req = SerializedRequest {
            method: "GET".into(),
            url: "http://localhost/hello".into(),
            header: Headers::new(),
            content_length: 0,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"Method\":\"GET\""));
        assert!(json.contains("\"ContentLength\":0"));
    }
}
