// Lock-guarded entity updates

use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Method, Request};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::auth::AuthController;
use crate::error::{AlmError, Result};
use crate::http_client::{expand_template, AlmHttpClient, RawResponse};
use crate::models::Entity;

/// States a single mutation passes through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationState {
    Idle,
    Locking,
    Locked,
    LockFailed,
    Updating,
    Updated,
    UpdateFailed,
    Unlocking,
    Done,
}

/// Result of the lock or update step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Succeeded { status: u16 },
    Rejected { status: u16, body: String },
    /// No usable response (transport or request-building failure)
    Failed(String),
    Cancelled,
    /// Not attempted because the mutation was cancelled earlier
    Skipped,
}

impl StepOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, StepOutcome::Succeeded { .. })
    }

    fn from_response(result: Result<RawResponse>, accepted: &[u16]) -> Self {
        match result {
            Ok(response) if response.is_status(accepted) => StepOutcome::Succeeded {
                status: response.status,
            },
            Ok(response) => StepOutcome::Rejected {
                status: response.status,
                body: response.body,
            },
            Err(AlmError::Cancelled) => StepOutcome::Cancelled,
            Err(e) => StepOutcome::Failed(e.to_string()),
        }
    }
}

/// Result of the lock release
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnlockOutcome {
    Released { status: u16 },
    Rejected { status: u16, body: String },
    /// The release never reached the server; the lock may still be held
    Orphaned(String),
}

/// Per-step record of one lock, update, unlock sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationOutcome {
    pub entity_type: String,
    pub id: String,
    pub lock: StepOutcome,
    pub update: StepOutcome,
    pub unlock: UnlockOutcome,
    /// States visited, from `Idle` to `Done`
    pub states: Vec<MutationState>,
}

impl MutationOutcome {
    pub fn is_cancelled(&self) -> bool {
        matches!(self.lock, StepOutcome::Cancelled)
            || matches!(self.update, StepOutcome::Cancelled)
    }

    /// Error for an update the server rejected or never received
    pub fn update_failure(&self) -> Option<AlmError> {
        match &self.update {
            StepOutcome::Rejected { status, body } => Some(AlmError::UpdateFailure {
                status: *status,
                message: format!("Error in update {}/{}", self.entity_type, self.id),
                body: body.clone(),
            }),
            StepOutcome::Failed(reason) => Some(AlmError::UpdateFailure {
                status: 0,
                message: format!(
                    "Update of {}/{} not delivered: {}",
                    self.entity_type, self.id, reason
                ),
                body: String::new(),
            }),
            _ => None,
        }
    }

    /// Unlock result, with a failed update raised once the lock is released.
    /// An unlock failure takes precedence over the update failure.
    pub fn into_result(self) -> Result<bool> {
        let update_failure = self.update_failure();
        let released = self.into_unlock_result()?;
        match update_failure {
            Some(e) => Err(e),
            None => Ok(released),
        }
    }

    /// Success as reported by the unlock call alone; the update step does not
    /// contribute. Cancellation surfaces as `Cancelled` once the lock is released.
    pub fn into_unlock_result(self) -> Result<bool> {
        if self.is_cancelled() {
            return Err(AlmError::Cancelled);
        }

        match self.unlock {
            UnlockOutcome::Released { .. } => Ok(true),
            UnlockOutcome::Rejected { status, body } => Err(AlmError::LockFailure {
                status,
                message: format!("Error in unlock {}/{}", self.entity_type, self.id),
                body,
            }),
            UnlockOutcome::Orphaned(reason) => Err(AlmError::LockFailure {
                status: 0,
                message: format!(
                    "Lock on {}/{} may still be held: {}",
                    self.entity_type, self.id, reason
                ),
                body: String::new(),
            }),
        }
    }
}

/// Runs lock → update → unlock with an unconditional unlock
pub struct MutationCoordinator {
    http: Arc<AlmHttpClient>,

    /// Entity and lock address templates
    entity_address: String,
    lock_address: String,

    domain: String,
    project: String,
}

impl MutationCoordinator {
    pub fn new(
        http: Arc<AlmHttpClient>,
        entity_address: impl Into<String>,
        lock_address: impl Into<String>,
        domain: impl Into<String>,
        project: impl Into<String>,
    ) -> Self {
        Self {
            http,
            entity_address: entity_address.into(),
            lock_address: lock_address.into(),
            domain: domain.into(),
            project: project.into(),
        }
    }

    fn build(
        &self,
        method: Method,
        template: &str,
        entity_type: &str,
        id: &str,
    ) -> Result<reqwest::RequestBuilder> {
        let path = expand_template(
            template,
            &[
                ("domain", self.domain.as_str()),
                ("project", self.project.as_str()),
                ("Entity Type", entity_type),
                ("Entity ID", id),
            ],
        );
        Ok(self.http.request(method, self.http.resolve(&path)?))
    }

    async fn finish(
        &self,
        auth: &AuthController,
        builder: Result<reqwest::RequestBuilder>,
    ) -> Result<Request> {
        let mut request = builder?
            .build()
            .map_err(|e| AlmError::Config(format!("Failed to build request: {}", e)))?;
        auth.decorate(&mut request).await;
        Ok(request)
    }

    async fn lock(
        &self,
        auth: &AuthController,
        entity_type: &str,
        id: &str,
        cancel: &CancellationToken,
    ) -> StepOutcome {
        let builder = self.build(Method::POST, &self.lock_address, entity_type, id);
        let result = match self.finish(auth, builder).await {
            Ok(request) => self.http.send(request, cancel).await,
            Err(e) => Err(e),
        };
        StepOutcome::from_response(result, &[200, 201])
    }

    async fn update(
        &self,
        auth: &AuthController,
        entity_type: &str,
        id: &str,
        changes: &Entity,
        cancel: &CancellationToken,
    ) -> StepOutcome {
        let body = match changes.to_xml(entity_type) {
            Ok(body) => body,
            Err(e) => return StepOutcome::Failed(e.to_string()),
        };

        let builder = self
            .build(Method::PUT, &self.entity_address, entity_type, id)
            .map(|b| {
                b.header(CONTENT_TYPE, "application/xml")
                    .header(ACCEPT, "application/xml")
                    .body(body)
            });
        let result = match self.finish(auth, builder).await {
            Ok(request) => self.http.send(request, cancel).await,
            Err(e) => Err(e),
        };
        StepOutcome::from_response(result, &[200])
    }

    /// The release is never raced against cancellation; it is bounded by the
    /// request timeout only.
    async fn unlock(&self, auth: &AuthController, entity_type: &str, id: &str) -> UnlockOutcome {
        let builder = self.build(Method::DELETE, &self.lock_address, entity_type, id);
        let result = match self.finish(auth, builder).await {
            Ok(request) => self.http.send_uncancellable(request).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(response) if response.is_status(&[200, 202, 204]) => UnlockOutcome::Released {
                status: response.status,
            },
            Ok(response) => UnlockOutcome::Rejected {
                status: response.status,
                body: response.body,
            },
            Err(e) => UnlockOutcome::Orphaned(e.to_string()),
        }
    }

    /// Lock the entity, write `changes`, then release the lock.
    ///
    /// A failed lock does not stop the update. The unlock runs after every
    /// lock/update combination, including cancellation. Only a failure to
    /// establish the session, before anything is locked, returns an error.
    pub async fn update_entity(
        &self,
        auth: &AuthController,
        entity_type: &str,
        id: &str,
        changes: &Entity,
        cancel: &CancellationToken,
    ) -> Result<MutationOutcome> {
        let mut states = vec![MutationState::Idle];

        auth.ensure_session_active(cancel).await?;

        states.push(MutationState::Locking);
        let lock = self.lock(auth, entity_type, id, cancel).await;
        match &lock {
            StepOutcome::Succeeded { .. } => states.push(MutationState::Locked),
            StepOutcome::Cancelled => {
                states.push(MutationState::LockFailed);
                tracing::warn!(entity_type, id, "Lock cancelled, skipping update and releasing");
            }
            _ => {
                states.push(MutationState::LockFailed);
                tracing::warn!(entity_type, id, outcome = ?lock, "Lock not acquired, updating anyway");
            }
        }

        let update = if matches!(lock, StepOutcome::Cancelled) {
            StepOutcome::Skipped
        } else {
            states.push(MutationState::Updating);
            let update = self.update(auth, entity_type, id, changes, cancel).await;
            if update.is_success() {
                states.push(MutationState::Updated);
            } else {
                states.push(MutationState::UpdateFailed);
                tracing::error!(entity_type, id, outcome = ?update, "Entity update failed");
            }
            update
        };

        states.push(MutationState::Unlocking);
        let unlock = self.unlock(auth, entity_type, id).await;
        match &unlock {
            UnlockOutcome::Released { .. } => {}
            UnlockOutcome::Rejected { status, .. } => {
                tracing::warn!(entity_type, id, status, "Unlock rejected");
            }
            UnlockOutcome::Orphaned(reason) => {
                tracing::error!(entity_type, id, reason = %reason, "Lock release failed, lock may be orphaned");
            }
        }
        states.push(MutationState::Done);

        Ok(MutationOutcome {
            entity_type: entity_type.to_string(),
            id: id.to_string(),
            lock,
            update,
            unlock,
            states,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(lock: StepOutcome, update: StepOutcome, unlock: UnlockOutcome) -> MutationOutcome {
        MutationOutcome {
            entity_type: "defects".to_string(),
            id: "7".to_string(),
            lock,
            update,
            unlock,
            states: vec![],
        }
    }

    #[test]
    fn test_step_outcome_from_response() {
        let ok = RawResponse {
            status: 201,
            set_cookies: vec![],
            body: String::new(),
        };
        assert_eq!(
            StepOutcome::from_response(Ok(ok.clone()), &[200, 201]),
            StepOutcome::Succeeded { status: 201 }
        );
        assert_eq!(
            StepOutcome::from_response(Ok(ok), &[200]),
            StepOutcome::Rejected {
                status: 201,
                body: String::new()
            }
        );
        assert_eq!(
            StepOutcome::from_response(Err(AlmError::Cancelled), &[200]),
            StepOutcome::Cancelled
        );
    }

    #[test]
    fn test_result_follows_unlock_not_update() {
        let result = outcome(
            StepOutcome::Succeeded { status: 200 },
            StepOutcome::Rejected {
                status: 400,
                body: "bad field".to_string(),
            },
            UnlockOutcome::Released { status: 200 },
        )
        .into_unlock_result();
        assert!(matches!(result, Ok(true)));

        let result = outcome(
            StepOutcome::Succeeded { status: 200 },
            StepOutcome::Succeeded { status: 200 },
            UnlockOutcome::Rejected {
                status: 500,
                body: "oops".to_string(),
            },
        )
        .into_unlock_result();
        assert!(matches!(result, Err(AlmError::LockFailure { status: 500, .. })));
    }

    #[test]
    fn test_orphaned_lock_is_a_lock_failure() {
        let result = outcome(
            StepOutcome::Succeeded { status: 200 },
            StepOutcome::Succeeded { status: 200 },
            UnlockOutcome::Orphaned("timeout".to_string()),
        )
        .into_unlock_result();

        match result {
            Err(AlmError::LockFailure { status, message, .. }) => {
                assert_eq!(status, 0);
                assert!(message.contains("defects/7"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_failed_update_raises_after_release() {
        let result = outcome(
            StepOutcome::Succeeded { status: 200 },
            StepOutcome::Rejected {
                status: 400,
                body: "field 'status' is read-only".to_string(),
            },
            UnlockOutcome::Released { status: 200 },
        )
        .into_result();

        match result {
            Err(AlmError::UpdateFailure { status, body, .. }) => {
                assert_eq!(status, 400);
                assert_eq!(body, "field 'status' is read-only");
            }
            other => panic!("unexpected result: {:?}", other),
        }

        let result = outcome(
            StepOutcome::Succeeded { status: 200 },
            StepOutcome::Failed("connection reset".to_string()),
            UnlockOutcome::Released { status: 200 },
        )
        .into_result();
        assert!(matches!(result, Err(AlmError::UpdateFailure { status: 0, .. })));
    }

    #[test]
    fn test_unlock_failure_takes_precedence_over_update_failure() {
        let result = outcome(
            StepOutcome::Rejected {
                status: 409,
                body: String::new(),
            },
            StepOutcome::Rejected {
                status: 500,
                body: String::new(),
            },
            UnlockOutcome::Rejected {
                status: 500,
                body: "not locked".to_string(),
            },
        )
        .into_result();
        assert!(matches!(result, Err(AlmError::LockFailure { status: 500, .. })));

        let result = outcome(
            StepOutcome::Rejected {
                status: 409,
                body: String::new(),
            },
            StepOutcome::Succeeded { status: 200 },
            UnlockOutcome::Released { status: 200 },
        )
        .into_result();
        assert!(matches!(result, Ok(true)));
    }

    #[test]
    fn test_cancellation_surfaces_after_release() {
        let result = outcome(
            StepOutcome::Cancelled,
            StepOutcome::Skipped,
            UnlockOutcome::Released { status: 200 },
        )
        .into_unlock_result();
        assert!(matches!(result, Err(AlmError::Cancelled)));
    }
}
