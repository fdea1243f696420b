//! Role-based route authorization
//!
//! Each route pattern maps to the roles allowed and denied on it. The
//! table is built once at startup; [`authorize`] is a pure check of a
//! caller's roles against one entry.

use super::dto::ErrorPayload;
use super::state::AppState;
use axum::extract::{MatchedPath, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Role granted to allocation clients
pub const RUNNER_ROLE: &str = "Runner";

/// Header carrying the caller id when identity headers are trusted
pub const CALLER_ID_HEADER: &str = "x-caller-id";

/// Header carrying comma-separated caller roles when identity headers are trusted
pub const CALLER_ROLES_HEADER: &str = "x-caller-roles";

/// Authenticated caller, attached to requests as an extension by the
/// authentication layer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallerIdentity {
    pub id: String,
    pub roles: BTreeSet<String>,
}

impl CallerIdentity {
    pub fn new<I, S>(id: impl Into<String>, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            roles: roles.into_iter().map(Into::into).collect(),
        }
    }

    /// Build from `x-caller-id` / `x-caller-roles`; `None` without an id
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let id = headers
            .get(CALLER_ID_HEADER)?
            .to_str()
            .ok()?
            .trim()
            .to_string();
        if id.is_empty() {
            return None;
        }

        let roles = headers
            .get(CALLER_ROLES_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|r| !r.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Some(Self { id, roles })
    }
}

/// Allowed and denied roles of one route
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteRules {
    pub allowed: BTreeSet<String>,
    pub denied: BTreeSet<String>,
}

impl RouteRules {
    pub fn allow<I, S>(roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: roles.into_iter().map(Into::into).collect(),
            denied: BTreeSet::new(),
        }
    }

    pub fn deny<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.denied.extend(roles.into_iter().map(Into::into));
        self
    }

    /// Whether the route carries no rules at all
    pub fn is_public(&self) -> bool {
        self.allowed.is_empty() && self.denied.is_empty()
    }
}

/// Decide whether a caller with `roles` may use a route.
///
/// A route without rules is public. Otherwise the caller needs at least one
/// allowed role and no denied role; a caller without roles is rejected.
pub fn authorize(rules: &RouteRules, roles: &BTreeSet<String>) -> bool {
    if rules.is_public() {
        return true;
    }
    if roles.is_empty() {
        return false;
    }
    rules.allowed.intersection(roles).next().is_some()
        && rules.denied.intersection(roles).next().is_none()
}

/// Route pattern -> rules
#[derive(Debug, Clone, Default)]
pub struct AccessTable {
    routes: HashMap<String, RouteRules>,
}

impl AccessTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_route(mut self, pattern: impl Into<String>, rules: RouteRules) -> Self {
        self.routes.insert(pattern.into(), rules);
        self
    }

    /// Rules for a matched route pattern; unknown routes are public
    pub fn rules_for(&self, pattern: &str) -> RouteRules {
        self.routes.get(pattern).cloned().unwrap_or_default()
    }

    pub fn is_allowed(&self, pattern: &str, roles: &BTreeSet<String>) -> bool {
        authorize(&self.rules_for(pattern), roles)
    }

    /// Rules of the service's own routes
    pub fn standard() -> Self {
        Self::new()
            .with_route(super::router::ALLOCATION_ROUTE, RouteRules::allow([RUNNER_ROLE]))
            .with_route(super::router::HEALTH_ROUTE, RouteRules::default())
    }
}

/// Middleware rejecting callers the access table does not admit
pub async fn authorize_request(
    State(state): State<Arc<AppState>>,
    matched: Option<MatchedPath>,
    mut request: Request,
    next: Next,
) -> Response {
    if state.trust_identity_headers && request.extensions().get::<CallerIdentity>().is_none() {
        if let Some(identity) = CallerIdentity::from_headers(request.headers()) {
            request.extensions_mut().insert(identity);
        }
    }

    let pattern = matched
        .as_ref()
        .map(MatchedPath::as_str)
        .unwrap_or_else(|| request.uri().path());
    let identity = request.extensions().get::<CallerIdentity>();
    let empty = BTreeSet::new();
    let roles = identity.map(|i| &i.roles).unwrap_or(&empty);

    if !state.access.is_allowed(pattern, roles) {
        tracing::warn!(
            route = %pattern,
            caller = identity.map(|i| i.id.as_str()).unwrap_or("anonymous"),
            "Forbidden"
        );
        return (StatusCode::FORBIDDEN, Json(ErrorPayload::forbidden())).into_response();
    }

    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn roles(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_public_route() {
        let rules = RouteRules::default();
        assert!(authorize(&rules, &roles(&[])));
        assert!(authorize(&rules, &roles(&["Runner"])));
    }

    #[test]
    fn test_allow_and_deny() {
        let rules = RouteRules::allow(["Runner", "Admin"]).deny(["Suspended"]);

        assert!(authorize(&rules, &roles(&["Runner"])));
        assert!(authorize(&rules, &roles(&["Admin", "Other"])));
        assert!(!authorize(&rules, &roles(&["Other"])));
        assert!(!authorize(&rules, &roles(&["Runner", "Suspended"])));
        assert!(!authorize(&rules, &roles(&[])));
    }

    #[test]
    fn test_deny_only_route_rejects_everyone() {
        let rules = RouteRules::default().deny(["Suspended"]);
        assert!(!authorize(&rules, &roles(&["Runner"])));
        assert!(!authorize(&rules, &roles(&[])));
    }

    #[test]
    fn test_standard_table() {
        let table = AccessTable::standard();
        assert!(table.is_allowed("/api/health", &roles(&[])));
        assert!(table.is_allowed("/api/allocation/:key", &roles(&["Runner"])));
        assert!(!table.is_allowed("/api/allocation/:key", &roles(&[])));
    }

    #[test]
    fn test_identity_from_headers() {
        let mut headers = HeaderMap::new();
        assert!(CallerIdentity::from_headers(&headers).is_none());

        headers.insert(CALLER_ID_HEADER, HeaderValue::from_static("runner-7"));
        headers.insert(CALLER_ROLES_HEADER, HeaderValue::from_static("Runner, Reader,,"));

        let identity = CallerIdentity::from_headers(&headers).unwrap();
        assert_eq!(identity.id, "runner-7");
        assert_eq!(identity.roles, roles(&["Reader", "Runner"]));
    }
}
