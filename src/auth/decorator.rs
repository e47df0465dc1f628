// Attaches session tokens to outbound requests

use reqwest::header::{HeaderValue, COOKIE};
use reqwest::Request;

use super::session::SessionState;

/// Adds the login and session tokens to a request, at most once each
#[derive(Debug, Clone)]
pub struct RequestDecorator {
    token_cookie_name: String,
    session_cookie_name: String,
}

impl RequestDecorator {
    pub fn new(token_cookie_name: impl Into<String>, session_cookie_name: impl Into<String>) -> Self {
        Self {
            token_cookie_name: token_cookie_name.into(),
            session_cookie_name: session_cookie_name.into(),
        }
    }

    /// Append each known token as a query parameter named after its cookie,
    /// unless a parameter with that name is already present. The same pairs
    /// go into a Cookie header when the request has none yet.
    pub fn decorate(&self, request: &mut Request, state: &SessionState) {
        let tokens = [
            (self.token_cookie_name.as_str(), state.login_token.as_deref()),
            (self.session_cookie_name.as_str(), state.session_token.as_deref()),
        ];

        let mut cookie_pairs = Vec::new();
        for (name, token) in tokens {
            let Some(token) = token.filter(|t| !t.is_empty()) else {
                continue;
            };

            let present = request.url().query_pairs().any(|(key, _)| key == name);
            if !present {
                request.url_mut().query_pairs_mut().append_pair(name, token);
            }
            cookie_pairs.push(format!("{}={}", name, token));
        }

        if !cookie_pairs.is_empty() && !request.headers().contains_key(COOKIE) {
            if let Ok(value) = HeaderValue::from_str(&cookie_pairs.join("; ")) {
                request.headers_mut().insert(COOKIE, value);
            }
        }
    }
}
