use reqwest::{Method, Request};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::decorator::RequestDecorator;
use super::session::{SessionAction, SessionState, SessionTokenStore};
use crate::config::BackendProfile;
use crate::error::{AlmError, Result};
use crate::http_client::AlmHttpClient;

/// Authentication controller
/// Handles login, logout and the authentication check, and keeps the
/// server session alive before every data call
pub struct AuthController {
    http: Arc<AlmHttpClient>,

    /// Session tokens for this client instance
    store: SessionTokenStore,

    decorator: RequestDecorator,

    username: String,
    password: String,

    login_address: String,
    logout_address: String,
    is_authenticated_address: String,

    is_logout_required: bool,
}

impl AuthController {
    pub fn new(
        http: Arc<AlmHttpClient>,
        profile: &BackendProfile,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            http,
            store: SessionTokenStore::new(
                &profile.token_cookie_name,
                &profile.session_cookie_name,
                &profile.addresses.session,
                profile.is_session_required,
            ),
            decorator: RequestDecorator::new(
                &profile.token_cookie_name,
                &profile.session_cookie_name,
            ),
            username: username.into(),
            password: password.into(),
            login_address: profile.addresses.login.clone(),
            logout_address: profile.addresses.logout.clone(),
            is_authenticated_address: profile.addresses.is_authenticated.clone(),
            is_logout_required: profile.is_logout_required,
        }
    }

    /// Current tokens
    pub async fn session_state(&self) -> SessionState {
        self.store.snapshot().await
    }

    /// Attach the current tokens to a request
    pub async fn decorate(&self, request: &mut Request) {
        let state = self.store.snapshot().await;
        self.decorator.decorate(request, &state);
    }

    fn build(&self, method: Method, address: &str) -> Result<Request> {
        let url = self.http.resolve(address)?;
        self.http
            .request(method, url)
            .build()
            .map_err(|e| AlmError::Config(format!("Failed to build request for {}: {}", address, e)))
    }

    /// Send basic credentials to the login address; tokens are read from
    /// the response cookies on success
    pub async fn login(&self, cancel: &CancellationToken) -> Result<()> {
        tracing::info!(user = %self.username, "Logging in to ALM");

        let url = self.http.resolve(&self.login_address)?;
        let request = self
            .http
            .request(Method::GET, url)
            .basic_auth(&self.username, Some(&self.password))
            .build()
            .map_err(|e| AlmError::Config(format!("Failed to build login request: {}", e)))?;

        let response = self.http.send(request, cancel).await?;

        if !response.is_status(&[200]) {
            tracing::warn!(status = response.status, "ALM login rejected");
            return Err(AlmError::AuthenticationFailure {
                status: response.status,
                message: "Error in login".to_string(),
                body: response.body,
            });
        }

        self.store.extract_tokens(&response).await;
        tracing::info!("✅ ALM login successful");
        Ok(())
    }

    /// Query the authentication status address; only 200 counts as authenticated.
    /// Never triggers a login.
    pub async fn check_authenticated(&self, cancel: &CancellationToken) -> Result<bool> {
        let mut request = self.build(Method::GET, &self.is_authenticated_address)?;
        self.decorate(&mut request).await;

        let response = self.http.send(request, cancel).await?;
        tracing::debug!(status = response.status, "Authentication check answered");
        Ok(response.is_status(&[200]))
    }

    /// Like `check_authenticated`, but a negative answer is an `AuthenticationFailure`
    pub async fn is_authenticated(&self, cancel: &CancellationToken) -> Result<()> {
        let mut request = self.build(Method::GET, &self.is_authenticated_address)?;
        self.decorate(&mut request).await;

        let response = self.http.send(request, cancel).await?;
        if !response.is_status(&[200]) {
            return Err(AlmError::AuthenticationFailure {
                status: response.status,
                message: "Error in IsAuthenticated".to_string(),
                body: response.body,
            });
        }
        Ok(())
    }

    /// Close the server session (when the backend has one), then call the
    /// logout address. Backends that do not need a logout succeed immediately.
    /// Tokens are kept locally.
    pub async fn logout(&self, cancel: &CancellationToken) -> Result<()> {
        if !self.is_logout_required {
            return Ok(());
        }

        if self.store.is_session_required() {
            if let Err(e) = self.apply_session_action(SessionAction::Close, cancel).await {
                if matches!(e, AlmError::Cancelled) {
                    return Err(e);
                }
                tracing::warn!("Failed to close ALM session before logout: {}", e);
            }
        }

        let mut request = self.build(Method::GET, &self.logout_address)?;
        self.decorate(&mut request).await;

        let response = self.http.send(request, cancel).await?;
        if !response.is_status(&[200]) {
            return Err(AlmError::RemoteOperationFailure {
                status: response.status,
                message: "Error in Logout".to_string(),
                body: response.body,
            });
        }

        tracing::info!("Logged out of ALM");
        Ok(())
    }

    /// Decide whether the current session is reused or renewed
    pub async fn decide_renewal_action(&self) -> SessionAction {
        self.store.decide_renewal_action().await
    }

    pub async fn apply_session_action(
        &self,
        action: SessionAction,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.store
            .apply_session_action(&self.http, &self.decorator, action, cancel)
            .await
    }

    /// Precondition for every data call: authenticated (logging in when the
    /// status check says otherwise), then the session reused or renewed when the
    /// backend requires one
    pub async fn ensure_session_active(&self, cancel: &CancellationToken) -> Result<()> {
        if !self.check_authenticated(cancel).await? {
            tracing::debug!("Not authenticated, logging in");
            self.login(cancel).await?;
        }

        if self.store.is_session_required() {
            let action = self.decide_renewal_action().await;
            self.apply_session_action(action, cancel).await?;
        }

        Ok(())
    }
}
