//! Session and broker response types.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// One cookie ready to be injected into a browser context.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    pub secure: bool,
    pub http_only: bool,
    /// Expiry as seconds since the Unix epoch; `None` for a session cookie.
    pub expires: Option<f64>,
}

impl fmt::Debug for SessionCookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCookie")
            .field("name", &self.name)
            .field("value", &"<redacted>")
            .field("domain", &self.domain)
            .field("path", &self.path)
            .field("secure", &self.secure)
            .field("http_only", &self.http_only)
            .field("expires", &self.expires)
            .finish()
    }
}

/// Which broker response shape a session came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionSource {
    CookieJar,
    Token,
}

/// Credentials for one account, ready for a browser context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrowserSession {
    pub account_ref: String,
    pub cookies: Vec<SessionCookie>,
    pub source: SessionSource,
}

/// Values filled in when the broker leaves a cookie field out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieDefaults {
    /// Cookie name used when the broker only returns a session token.
    pub token_cookie_name: String,
    pub domain: String,
}

impl Default for CookieDefaults {
    fn default() -> Self {
        Self {
            token_cookie_name: "li_at".to_string(),
            domain: ".linkedin.com".to_string(),
        }
    }
}

/// The shapes a broker account lookup can take.
///
/// Variants are tried in order; anything unrecognized falls through to
/// [`BrokerCredentials::Unrecognized`] rather than failing to decode.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum BrokerCredentials {
    /// Explicit cookie list, possibly alongside a token.
    CookieJar {
        cookies: Vec<Value>,
        #[serde(default)]
        session_token: Option<String>,
    },
    /// A single opaque session token.
    Token { session_token: String },
    Unrecognized(Value),
}

impl BrokerCredentials {
    /// Normalize into a browser session, or `None` if nothing usable was returned.
    pub fn into_session(self, account_ref: &str, defaults: &CookieDefaults) -> Option<BrowserSession> {
        match self {
            BrokerCredentials::CookieJar {
                cookies,
                session_token,
            } => {
                let total = cookies.len();
                let cookies: Vec<SessionCookie> = cookies
                    .iter()
                    .filter_map(|raw| normalize_cookie(raw, defaults))
                    .collect();
                if cookies.len() < total {
                    warn!(
                        account_ref,
                        dropped = total - cookies.len(),
                        "dropped malformed cookies from broker response"
                    );
                }

                if !cookies.is_empty() {
                    return Some(BrowserSession {
                        account_ref: account_ref.to_string(),
                        cookies,
                        source: SessionSource::CookieJar,
                    });
                }
                session_token.and_then(|token| token_session(account_ref, &token, defaults))
            }
            BrokerCredentials::Token { session_token } => {
                token_session(account_ref, &session_token, defaults)
            }
            BrokerCredentials::Unrecognized(_) => None,
        }
    }
}

fn token_session(
    account_ref: &str,
    token: &str,
    defaults: &CookieDefaults,
) -> Option<BrowserSession> {
    let token = token.trim();
    if token.is_empty() {
        return None;
    }
    Some(BrowserSession {
        account_ref: account_ref.to_string(),
        cookies: vec![SessionCookie {
            name: defaults.token_cookie_name.clone(),
            value: token.to_string(),
            domain: defaults.domain.clone(),
            path: "/".to_string(),
            secure: true,
            http_only: true,
            expires: None,
        }],
        source: SessionSource::Token,
    })
}

/// Normalize one loosely-shaped cookie object.
///
/// Requires a non-empty string `name` and a string or number `value`; other
/// fields accept common spellings and fall back to defaults.
fn normalize_cookie(raw: &Value, defaults: &CookieDefaults) -> Option<SessionCookie> {
    let obj = raw.as_object()?;

    let name = obj.get("name")?.as_str()?.trim();
    if name.is_empty() {
        return None;
    }
    let value = match obj.get("value")? {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };

    let string_field = |keys: &[&str]| {
        keys.iter()
            .find_map(|k| obj.get(*k).and_then(Value::as_str))
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    let bool_field = |keys: &[&str]| keys.iter().find_map(|k| obj.get(*k).and_then(Value::as_bool));

    Some(SessionCookie {
        name: name.to_string(),
        value,
        domain: string_field(&["domain"]).unwrap_or_else(|| defaults.domain.clone()),
        path: string_field(&["path"]).unwrap_or_else(|| "/".to_string()),
        secure: bool_field(&["secure"]).unwrap_or(true),
        http_only: bool_field(&["httpOnly", "http_only", "httponly"]).unwrap_or(false),
        expires: ["expires", "expirationDate", "expiry"]
            .iter()
            .find_map(|k| obj.get(*k).and_then(Value::as_f64))
            .filter(|e| *e > 0.0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn decode(value: Value) -> Option<BrowserSession> {
        let creds: BrokerCredentials = serde_json::from_value(value).unwrap();
        creds.into_session("acc-1", &CookieDefaults::default())
    }

    #[test]
    fn test_cookie_list_normalized() {
        let session = decode(json!({
            "cookies": [
                {"name": "li_at", "value": "abc", "domain": ".linkedin.com", "path": "/", "secure": true, "httpOnly": true},
                {"name": "JSESSIONID", "value": "ajax:123", "http_only": false, "expirationDate": 1893456000.0}
            ]
        }))
        .unwrap();

        assert_eq!(session.source, SessionSource::CookieJar);
        assert_eq!(session.cookies.len(), 2);
        assert_eq!(session.cookies[0].name, "li_at");
        assert!(session.cookies[0].http_only);
        assert_eq!(session.cookies[1].domain, ".linkedin.com");
        assert_eq!(session.cookies[1].path, "/");
        assert!(session.cookies[1].secure);
        assert!(!session.cookies[1].http_only);
        assert_eq!(session.cookies[1].expires, Some(1893456000.0));
    }

    #[test]
    fn test_token_only_yields_one_cookie() {
        let session = decode(json!({"session_token": "tok-123"})).unwrap();
        assert_eq!(session.source, SessionSource::Token);
        assert_eq!(
            session.cookies,
            vec![SessionCookie {
                name: "li_at".to_string(),
                value: "tok-123".to_string(),
                domain: ".linkedin.com".to_string(),
                path: "/".to_string(),
                secure: true,
                http_only: true,
                expires: None,
            }]
        );
    }

    #[test]
    fn test_malformed_cookies_dropped() {
        let session = decode(json!({
            "cookies": [
                "not-an-object",
                {"value": "missing-name"},
                {"name": "", "value": "blank-name"},
                {"name": "bad-value", "value": {"nested": true}},
                {"name": "numeric", "value": 42}
            ]
        }))
        .unwrap();
        assert_eq!(session.cookies.len(), 1);
        assert_eq!(session.cookies[0].name, "numeric");
        assert_eq!(session.cookies[0].value, "42");
    }

    #[test]
    fn test_empty_cookie_list_falls_back_to_token() {
        let session = decode(json!({"cookies": [], "session_token": "tok"})).unwrap();
        assert_eq!(session.source, SessionSource::Token);
        assert_eq!(session.cookies.len(), 1);
    }

    #[test]
    fn test_nothing_usable() {
        assert!(decode(json!({"cookies": []})).is_none());
        assert!(decode(json!({"session_token": "   "})).is_none());
        assert!(decode(json!({"id": "acc-1", "provider": "LINKEDIN"})).is_none());
        assert!(decode(json!(null)).is_none());
    }

    #[test]
    fn test_cookie_debug_redacts_value() {
        let session = decode(json!({"session_token": "super-secret"})).unwrap();
        let debug = format!("{:?}", session);
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_custom_token_cookie_name() {
        let creds: BrokerCredentials =
            serde_json::from_value(json!({"session_token": "t"})).unwrap();
        let defaults = CookieDefaults {
            token_cookie_name: "auth_token".to_string(),
            domain: ".example.com".to_string(),
        };
        let session = creds.into_session("acc", &defaults).unwrap();
        assert_eq!(session.cookies[0].name, "auth_token");
        assert_eq!(session.cookies[0].domain, ".example.com");
    }
}
