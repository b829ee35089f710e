use std::collections::HashMap;

use axum::http::Method;

use crate::config::AclConfig;

/// Decides whether the caller behind a bearer token may reach a path.
/// Token validation and per-user rules live with the implementation.
pub trait Authorizer: Send + Sync {
    fn is_authorized(&self, identity: Option<&str>, method: &Method, path: &str) -> bool;
}

/// Used when no ACL is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn is_authorized(&self, _identity: Option<&str>, _method: &Method, _path: &str) -> bool {
        true
    }
}

/// One entry of a token's grant list: `/api/clusters/c1` or
/// `GET /api/clusters/c1`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Grant {
    method: Option<Method>,
    prefix: String,
}

impl Grant {
    fn parse(entry: &str) -> Self {
        let entry = entry.trim();
        let (method, prefix) = match entry.split_once(' ') {
            Some((method, prefix)) => (method.parse::<Method>().ok(), prefix.trim()),
            None => (None, entry),
        };
        Self {
            method,
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    /// A prefix covers itself and the paths below it, never siblings that
    /// merely share its leading characters.
    fn covers(&self, method: &Method, path: &str) -> bool {
        if self.method.as_ref().is_some_and(|m| m != method) {
            return false;
        }
        match path.strip_prefix(self.prefix.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }
}

/// Static token table: a token grants every path under its prefixes.
#[derive(Debug, Clone)]
pub struct TokenAcl {
    tokens: HashMap<String, Vec<Grant>>,
}

impl TokenAcl {
    pub fn new(config: &AclConfig) -> Self {
        let tokens = config
            .tokens
            .iter()
            .map(|(token, grants)| {
                (
                    token.clone(),
                    grants.iter().map(|g| Grant::parse(g)).collect(),
                )
            })
            .collect();
        Self { tokens }
    }
}

impl Authorizer for TokenAcl {
    fn is_authorized(&self, identity: Option<&str>, method: &Method, path: &str) -> bool {
        identity
            .and_then(|token| self.tokens.get(token))
            .is_some_and(|grants| grants.iter().any(|grant| grant.covers(method, path)))
    }
}
