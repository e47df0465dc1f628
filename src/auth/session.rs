// Session token storage and renewal decisions

use chrono::{DateTime, Duration, Utc};
use reqwest::Method;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::decorator::RequestDecorator;
use crate::error::{AlmError, Result};
use crate::http_client::{AlmHttpClient, RawResponse};

/// A session token is reused for this long after it was issued
pub const SESSION_REUSE_WINDOW_MINUTES: i64 = 60;

/// What to do with the server-side session before a data call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAction {
    /// Keep the current session (idempotent read)
    Reuse,
    /// Create or extend the session (state-changing call)
    Renew,
    /// Tear the session down
    Close,
}

impl SessionAction {
    pub fn method(self) -> Method {
        match self {
            SessionAction::Reuse => Method::GET,
            SessionAction::Renew => Method::POST,
            SessionAction::Close => Method::DELETE,
        }
    }
}

/// The two opaque tokens and when the session token was issued
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionState {
    pub login_token: Option<String>,
    pub session_token: Option<String>,
    pub session_issued_at: Option<DateTime<Utc>>,
}

impl SessionState {
    /// Reuse while `now - issued_at` is at most the reuse window (the exact
    /// 60:00 mark still reuses); renew past it or when no session is known.
    pub fn renewal_action_at(&self, now: DateTime<Utc>) -> SessionAction {
        match (&self.session_token, self.session_issued_at) {
            (Some(_), Some(issued_at)) => {
                if now - issued_at <= Duration::minutes(SESSION_REUSE_WINDOW_MINUTES) {
                    SessionAction::Reuse
                } else {
                    SessionAction::Renew
                }
            }
            _ => SessionAction::Renew,
        }
    }

    /// Overwrite whichever tokens the response sets; absent cookies leave
    /// the previous value in place
    pub fn absorb_cookies(
        &mut self,
        response: &RawResponse,
        token_cookie_name: &str,
        session_cookie_name: &str,
        now: DateTime<Utc>,
    ) {
        if let Some(token) = response.cookie(token_cookie_name) {
            self.login_token = Some(token.to_string());
        }

        if let Some(token) = response.cookie(session_cookie_name) {
            self.session_token = Some(token.to_string());
            self.session_issued_at = Some(now);
        }
    }
}

/// Owns the session tokens of one client instance
pub struct SessionTokenStore {
    state: RwLock<SessionState>,

    token_cookie_name: String,
    session_cookie_name: String,

    /// Session address template
    session_address: String,

    is_session_required: bool,
}

impl SessionTokenStore {
    pub fn new(
        token_cookie_name: impl Into<String>,
        session_cookie_name: impl Into<String>,
        session_address: impl Into<String>,
        is_session_required: bool,
    ) -> Self {
        Self {
            state: RwLock::new(SessionState::default()),
            token_cookie_name: token_cookie_name.into(),
            session_cookie_name: session_cookie_name.into(),
            session_address: session_address.into(),
            is_session_required,
        }
    }

    /// Copy of the current tokens
    pub async fn snapshot(&self) -> SessionState {
        self.state.read().await.clone()
    }

    pub fn is_session_required(&self) -> bool {
        self.is_session_required
    }

    /// Decide whether the current session can be reused or must be renewed
    pub async fn decide_renewal_action(&self) -> SessionAction {
        self.state.read().await.renewal_action_at(Utc::now())
    }

    /// Pick up tokens from a response's cookies
    pub async fn extract_tokens(&self, response: &RawResponse) {
        let mut state = self.state.write().await;
        state.absorb_cookies(
            response,
            &self.token_cookie_name,
            &self.session_cookie_name,
            Utc::now(),
        );

        tracing::debug!(
            has_login_token = state.login_token.is_some(),
            has_session_token = state.session_token.is_some(),
            "Session tokens updated from response cookies"
        );
    }

    /// Issue the session call for `action`; a no-op when the backend has no sessions.
    /// Success is 200 or 201, after which both tokens are re-read from the cookies.
    pub async fn apply_session_action(
        &self,
        http: &AlmHttpClient,
        decorator: &RequestDecorator,
        action: SessionAction,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if !self.is_session_required {
            return Ok(());
        }

        tracing::debug!(?action, "Managing server session");

        let url = http.resolve(&self.session_address)?;
        let mut request = http
            .request(action.method(), url)
            .build()
            .map_err(|e| AlmError::Config(format!("Failed to build session request: {}", e)))?;
        decorator.decorate(&mut request, &self.snapshot().await);

        let response = http.send(request, cancel).await?;

        if !response.is_status(&[200, 201]) {
            tracing::warn!(status = response.status, ?action, "Session call rejected");
            return Err(AlmError::SessionRenewalFailure {
                status: response.status,
                message: format!("Session {:?} rejected", action),
                body: response.body,
            });
        }

        self.extract_tokens(&response).await;
        Ok(())
    }
}
