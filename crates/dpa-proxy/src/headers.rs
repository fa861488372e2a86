//! Identity and hop-by-hop header handling

use dpa_core::UserInfo;
use http::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, UPGRADE};

use crate::error::ProxyError;

pub const X_REMOTE_USER: &str = "x-remote-user";
pub const X_REMOTE_UID: &str = "x-remote-uid";
pub const X_REMOTE_GROUP: &str = "x-remote-group";
pub const X_REMOTE_EXTRA_PREFIX: &str = "x-remote-extra-";

/// Check if a header is hop-by-hop and should not be forwarded
/// (RFC 7230 section 6.1)
pub fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Remove hop-by-hop headers, including any named in `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }

    let hop: Vec<HeaderName> = headers
        .keys()
        .filter(|name| is_hop_by_hop_header(name.as_str()))
        .cloned()
        .collect();
    for name in hop {
        headers.remove(name);
    }
}

/// Whether the request asks for a protocol upgrade (websocket, SPDY)
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    let connection_upgrade = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    connection_upgrade && headers.contains_key(UPGRADE)
}

/// Drop any inbound identity headers so callers cannot impersonate
pub fn strip_identity_headers(headers: &mut HeaderMap) {
    let names: Vec<HeaderName> = headers
        .keys()
        .filter(|name| {
            let n = name.as_str();
            n == X_REMOTE_USER
                || n == X_REMOTE_UID
                || n == X_REMOTE_GROUP
                || n.starts_with(X_REMOTE_EXTRA_PREFIX)
        })
        .cloned()
        .collect();
    for name in names {
        headers.remove(name);
    }
}

fn header_value(value: &str) -> Result<HeaderValue, ProxyError> {
    HeaderValue::from_str(value).map_err(|e| ProxyError::InvalidHeader(e.to_string()))
}

/// Append identity headers for `user`.
///
/// Groups and extra values repeat the header; extra keys are
/// percent-escaped into the header name.
pub fn append_identity_headers(headers: &mut HeaderMap, user: &UserInfo) -> Result<(), ProxyError> {
    headers.insert(X_REMOTE_USER, header_value(&user.name)?);
    if let Some(uid) = &user.uid {
        headers.insert(X_REMOTE_UID, header_value(uid)?);
    }
    for group in &user.groups {
        headers.append(X_REMOTE_GROUP, header_value(group)?);
    }
    for (key, values) in &user.extra {
        let name = format!("{}{}", X_REMOTE_EXTRA_PREFIX, urlencoding::encode(key));
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ProxyError::InvalidHeader(e.to_string()))?;
        for value in values {
            headers.append(name.clone(), header_value(value)?);
        }
    }
    Ok(())
}

/// Replace whatever identity the request carried with `user`'s
pub fn set_identity_headers(headers: &mut HeaderMap, user: &UserInfo) -> Result<(), ProxyError> {
    strip_identity_headers(headers);
    append_identity_headers(headers, user)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn values(headers: &HeaderMap, name: &str) -> Vec<String> {
        headers
            .get_all(name)
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn inbound_identity_is_replaced() {
        let mut headers = HeaderMap::new();
        headers.insert(X_REMOTE_USER, HeaderValue::from_static("mallory"));
        headers.insert("x-remote-extra-scopes", HeaderValue::from_static("admin"));
        headers.insert("content-type", HeaderValue::from_static("application/json"));

        let mut user = UserInfo::new("alice");
        user.uid = Some("42".into());
        user.groups = vec!["devs".into(), "ops".into()];
        user.extra
            .insert("example.org/team".into(), vec!["a".into(), "b".into()]);

        set_identity_headers(&mut headers, &user).unwrap();

        assert_eq!(values(&headers, X_REMOTE_USER), vec!["alice"]);
        assert_eq!(values(&headers, X_REMOTE_UID), vec!["42"]);
        assert_eq!(values(&headers, X_REMOTE_GROUP), vec!["devs", "ops"]);
        assert_eq!(
            values(&headers, "x-remote-extra-example.org%2fteam"),
            vec!["a", "b"]
        );
        assert!(headers.get("x-remote-extra-scopes").is_none());
        assert!(headers.contains_key("content-type"));
    }

    #[test]
    fn hop_by_hop_stripping_honours_connection_list() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, x-private"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-private", HeaderValue::from_static("1"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("accept", HeaderValue::from_static("*/*"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("accept"));
    }

    #[test]
    fn detects_upgrade() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        assert!(!is_upgrade_request(&headers));
        headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
        assert!(is_upgrade_request(&headers));
    }
}
