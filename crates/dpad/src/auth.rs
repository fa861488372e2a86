//! Static bearer-token authentication
//!
//! Attaches the caller's [`UserInfo`] as a request extension. With no
//! tokens configured every caller is anonymous.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use dpa_core::models::reason;
use dpa_core::{Status, UserInfo};

use crate::config::TokenEntry;

/// Served without credentials
const PROBE_PATHS: &[&str] = &["/healthz", "/readyz"];

#[derive(Debug, Default)]
pub struct TokenAuthenticator {
    tokens: HashMap<String, UserInfo>,
}

impl TokenAuthenticator {
    pub fn new(entries: &[TokenEntry]) -> Self {
        Self {
            tokens: entries
                .iter()
                .map(|e| (e.token.clone(), e.user_info()))
                .collect(),
        }
    }

    /// `None` means the request must be rejected
    pub fn authenticate(&self, authorization: Option<&str>) -> Option<UserInfo> {
        if self.tokens.is_empty() {
            return Some(UserInfo::anonymous());
        }
        let token = authorization?.strip_prefix("Bearer ")?.trim();
        self.tokens.get(token).cloned()
    }
}

pub async fn authenticate(
    State(auth): State<Arc<TokenAuthenticator>>,
    mut req: Request,
    next: Next,
) -> Response {
    if PROBE_PATHS.contains(&req.uri().path()) {
        return next.run(req).await;
    }
    let header = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    match auth.authenticate(header) {
        Some(user) => {
            tracing::debug!(user = %user.name, "Authenticated");
            req.extensions_mut().insert(user);
            next.run(req).await
        }
        None => (
            StatusCode::UNAUTHORIZED,
            Json(Status::failure(401, reason::UNAUTHORIZED, "Unauthorized")),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dpa_core::models::{ANONYMOUS_USER, UNAUTHENTICATED_GROUP};

    fn entry(token: &str, user: &str) -> TokenEntry {
        TokenEntry {
            token: token.to_string(),
            user: user.to_string(),
            uid: Some("42".to_string()),
            groups: vec!["admins".to_string()],
        }
    }

    #[test]
    fn anonymous_without_tokens() {
        let auth = TokenAuthenticator::new(&[]);
        let user = auth.authenticate(None).unwrap();
        assert_eq!(user.name, ANONYMOUS_USER);
        assert_eq!(user.groups, [UNAUTHENTICATED_GROUP]);
    }

    #[test]
    fn bearer_tokens() {
        let auth = TokenAuthenticator::new(&[entry("secret", "admin")]);
        let user = auth.authenticate(Some("Bearer secret")).unwrap();
        assert_eq!(user.name, "admin");
        assert_eq!(user.uid.as_deref(), Some("42"));

        assert!(auth.authenticate(Some("Bearer wrong")).is_none());
        assert!(auth.authenticate(Some("Basic c2VjcmV0")).is_none());
        assert!(auth.authenticate(None).is_none());
    }
}
