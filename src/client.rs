use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::auth::{AuthController, SessionState};
use crate::collection::CollectionReader;
use crate::config::{BackendProfile, ClientOptions};
use crate::error::Result;
use crate::http_client::AlmHttpClient;
use crate::models::Entity;
use crate::mutation::{MutationCoordinator, MutationOutcome};

/// Entity type used by the defect shortcuts
pub const DEFECTS: &str = "defects";

/// Client for one ALM user, domain and project.
///
/// Public operations are serialized on the instance, so a client can be
/// shared between tasks but never runs two round-trip sequences at once.
/// Separate instances hold separate tokens and do not interfere.
///
/// With `hide_custom_errors` set, ALM and transport errors come back as
/// `Ok(false)` / `Ok(None)` instead of `Err`. Cancellation and
/// configuration errors are always returned.
///
/// Call [`AlmClient::dispose`] when done; some backends require a logout
/// before the session can be released.
pub struct AlmClient {
    auth: AuthController,
    collections: CollectionReader,
    mutations: MutationCoordinator,

    domain: String,
    project: String,
    hide_custom_errors: bool,

    /// Fires to abort in-flight operations
    cancel: CancellationToken,

    /// Serializes public operations on this instance
    op_lock: Mutex<()>,
}

impl AlmClient {
    /// Create a client for the selected backend profile
    pub fn new(options: ClientOptions, profile: &BackendProfile) -> Result<Self> {
        let http = Arc::new(AlmHttpClient::new(
            &options.base_url,
            options.connect_timeout,
            options.request_timeout,
            options.max_retries,
        )?);

        tracing::debug!(
            base_url = %http.base_url(),
            version = %profile.version,
            "Creating ALM client"
        );

        Ok(Self {
            auth: AuthController::new(
                http.clone(),
                profile,
                options.username,
                options.password,
            ),
            collections: CollectionReader::new(
                http.clone(),
                &profile.addresses.entity_collection,
                &options.domain,
                &options.project,
            ),
            mutations: MutationCoordinator::new(
                http,
                &profile.addresses.entity,
                &profile.addresses.lock_entity,
                &options.domain,
                &options.project,
            ),
            domain: options.domain,
            project: options.project,
            hide_custom_errors: options.hide_custom_errors,
            cancel: CancellationToken::new(),
            op_lock: Mutex::new(()),
        })
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn hides_custom_errors(&self) -> bool {
        self.hide_custom_errors
    }

    /// Token that aborts the client's in-flight and future operations when cancelled.
    /// A lock taken by an interrupted update is still released.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Current login/session tokens
    pub async fn session_state(&self) -> SessionState {
        self.auth.session_state().await
    }

    /// Log in with the configured credentials
    pub async fn login(&self) -> Result<bool> {
        let _guard = self.op_lock.lock().await;
        self.flag(self.auth.login(&self.cancel).await)
    }

    /// Whether the server considers this client authenticated
    pub async fn is_authenticated(&self) -> Result<bool> {
        let _guard = self.op_lock.lock().await;
        self.flag(self.auth.is_authenticated(&self.cancel).await)
    }

    /// Close the session and log out, where the backend requires it
    pub async fn logout(&self) -> Result<bool> {
        let _guard = self.op_lock.lock().await;
        self.flag(self.auth.logout(&self.cancel).await)
    }

    /// Log in if needed and reuse or renew the server session
    pub async fn ensure_session_active(&self) -> Result<bool> {
        let _guard = self.op_lock.lock().await;
        self.flag(self.auth.ensure_session_active(&self.cancel).await)
    }

    /// Read every entity of `entity_type`
    pub async fn read_all(&self, entity_type: &str) -> Result<Option<Vec<Entity>>> {
        let _guard = self.op_lock.lock().await;
        let result = self
            .collections
            .read_all(&self.auth, entity_type, &self.cancel)
            .await;
        self.optional(result)
    }

    pub async fn get_defects(&self) -> Result<Option<Vec<Entity>>> {
        self.read_all(DEFECTS).await
    }

    /// Lock, update and unlock an entity. The returned flag reports whether
    /// the lock release succeeded. A rejected update raises `UpdateFailure`
    /// after the release; with hidden errors only the release is reported.
    /// See [`AlmClient::update_entity_detailed`] for the outcome of each step.
    pub async fn update_entity(&self, entity_type: &str, id: &str, changes: &Entity) -> Result<bool> {
        let _guard = self.op_lock.lock().await;
        let result = match self
            .mutations
            .update_entity(&self.auth, entity_type, id, changes, &self.cancel)
            .await
        {
            Ok(outcome) if self.hide_custom_errors => {
                if let Some(e) = outcome.update_failure() {
                    tracing::debug!("Hiding ALM error: {}", e);
                }
                outcome.into_unlock_result()
            }
            Ok(outcome) => outcome.into_result(),
            Err(e) => Err(e),
        };
        self.flag_value(result)
    }

    pub async fn update_defect(&self, id: &str, changes: &Entity) -> Result<bool> {
        self.update_entity(DEFECTS, id, changes).await
    }

    /// Lock, update and unlock an entity, reporting every step
    pub async fn update_entity_detailed(
        &self,
        entity_type: &str,
        id: &str,
        changes: &Entity,
    ) -> Result<Option<MutationOutcome>> {
        let _guard = self.op_lock.lock().await;
        let result = self
            .mutations
            .update_entity(&self.auth, entity_type, id, changes, &self.cancel)
            .await;
        self.optional(result)
    }

    /// Best-effort logout; errors are logged and dropped.
    /// Runs even after the client's cancellation token has fired.
    pub async fn dispose(self) {
        let _guard = self.op_lock.lock().await;
        if let Err(e) = self.auth.logout(&CancellationToken::new()).await {
            tracing::warn!("Logout during dispose failed: {}", e);
        }
    }

    fn flag(&self, result: Result<()>) -> Result<bool> {
        self.flag_value(result.map(|_| true))
    }

    fn flag_value(&self, result: Result<bool>) -> Result<bool> {
        match result {
            Err(e) if self.hide_custom_errors && e.is_suppressible() => {
                tracing::debug!("Hiding ALM error: {}", e);
                Ok(false)
            }
            other => other,
        }
    }

    fn optional<T>(&self, result: Result<T>) -> Result<Option<T>> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(e) if self.hide_custom_errors && e.is_suppressible() => {
                tracing::debug!("Hiding ALM error: {}", e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
