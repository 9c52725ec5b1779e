//! Origin/window admission checks.
//!
//! A context never holds a live reference to another context: identity is a
//! stable [`ContextId`] resolved through the engine's context registry. The
//! validator decides whether an observed (source context, source origin) pair
//! is admissible against a configured filter.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{PostlinkError, Result};

/// Stable opaque identity of one execution context (the window/iframe
/// analogue). Holding a `ContextId` confers no ownership and never keeps the
/// context alive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(String);

impl ContextId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContextId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Domain filter: `*` (any), an exact origin string, or a `*.suffix`
/// host wildcard (e.g. `*.example.com`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainPattern {
    Any,
    Exact(String),
    Suffix(String),
}

impl DomainPattern {
    pub fn parse(pattern: &str) -> Self {
        if pattern == "*" {
            DomainPattern::Any
        } else if let Some(suffix) = pattern.strip_prefix("*.") {
            DomainPattern::Suffix(suffix.to_owned())
        } else {
            DomainPattern::Exact(pattern.to_owned())
        }
    }

    /// Match an observed origin (`scheme://host[:port]`) against the pattern.
    /// Wildcards match on the host part only.
    pub fn matches(&self, origin: &str) -> bool {
        match self {
            DomainPattern::Any => true,
            DomainPattern::Exact(expected) => expected == origin,
            DomainPattern::Suffix(suffix) => {
                let host = host_of(origin);
                host == suffix.as_str() || host.ends_with(&format!(".{suffix}"))
            }
        }
    }
}

impl fmt::Display for DomainPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DomainPattern::Any => f.write_str("*"),
            DomainPattern::Exact(s) => f.write_str(s),
            DomainPattern::Suffix(s) => write!(f, "*.{s}"),
        }
    }
}

/// Host part of an origin string: scheme and port stripped.
fn host_of(origin: &str) -> &str {
    let rest = origin
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(origin);
    rest.split_once(':').map(|(host, _)| host).unwrap_or(rest)
}

/// Filter configured on a send or a listener registration. Neither field set
/// means the channel is open (always admits).
#[derive(Debug, Clone, Default)]
pub struct ExpectedSource {
    pub context: Option<ContextId>,
    pub domain: Option<DomainPattern>,
}

/// Identity observed on an inbound delivery, as surfaced by the transport
/// (or, for relayed traffic, as stamped by a trusted bridge).
#[derive(Debug, Clone)]
pub struct ObservedSource {
    pub context: ContextId,
    pub origin: String,
}

/// Admission check: context filter is reference identity by id; domain filter
/// is pattern match on the observed origin.
pub fn validate(expected: &ExpectedSource, observed: &ObservedSource) -> Result<()> {
    if let Some(ctx) = &expected.context {
        if ctx != &observed.context {
            return Err(PostlinkError::WindowMismatch);
        }
    }
    if let Some(pattern) = &expected.domain {
        if !pattern.matches(&observed.origin) {
            return Err(PostlinkError::DomainMismatch {
                expected: pattern.to_string(),
                observed: observed.origin.clone(),
            });
        }
    }
    Ok(())
}
