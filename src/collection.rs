// Paginated collection reads

use reqwest::header::ACCEPT;
use reqwest::Method;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::auth::AuthController;
use crate::error::{AlmError, Result};
use crate::http_client::{expand_template, AlmHttpClient};
use crate::models::{Entity, EntityPage};

/// Entities requested per page
pub const PAGE_SIZE: usize = 100;

/// Reads whole entity collections page by page
pub struct CollectionReader {
    http: Arc<AlmHttpClient>,

    /// Entity collection address template
    address: String,

    domain: String,
    project: String,
}

impl CollectionReader {
    pub fn new(
        http: Arc<AlmHttpClient>,
        address: impl Into<String>,
        domain: impl Into<String>,
        project: impl Into<String>,
    ) -> Self {
        Self {
            http,
            address: address.into(),
            domain: domain.into(),
            project: project.into(),
        }
    }

    /// Fetch every entity of `entity_type`.
    ///
    /// Pages hold `PAGE_SIZE` entities and `start-index` is 1-based. The
    /// session is re-checked before each page so long reads survive a session
    /// expiring halfway. Reading stops once the next start index reaches the
    /// `TotalResults` of the last page; a page without a usable total counts
    /// as total 0, so only that page is returned.
    pub async fn read_all(
        &self,
        auth: &AuthController,
        entity_type: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Entity>> {
        let path = expand_template(
            &self.address,
            &[
                ("domain", self.domain.as_str()),
                ("project", self.project.as_str()),
                ("Entity Type", entity_type),
            ],
        );
        let url = self.http.resolve(&path)?;

        let mut items = Vec::new();
        let mut start_index = 0usize;

        loop {
            auth.ensure_session_active(cancel).await?;

            let mut request = self
                .http
                .request(Method::GET, url.clone())
                .header(ACCEPT, "application/xml")
                .query(&[
                    ("page-size", PAGE_SIZE.to_string()),
                    ("start-index", (start_index + 1).to_string()),
                ])
                .build()
                .map_err(|e| AlmError::Config(format!("Failed to build page request: {}", e)))?;
            auth.decorate(&mut request).await;

            tracing::debug!(entity_type, start_index = start_index + 1, "Fetching page");
            let response = self.http.send(request, cancel).await?;

            if !response.is_status(&[200]) {
                return Err(AlmError::RemoteOperationFailure {
                    status: response.status,
                    message: format!("Error in get {}", entity_type),
                    body: response.body,
                });
            }

            let page = EntityPage::from_xml(&response.body)?;
            let total = parse_total(page.total_results.as_deref(), entity_type);
            items.extend(page.entities);

            start_index += PAGE_SIZE;
            if start_index >= total {
                break;
            }
        }

        tracing::info!(entity_type, count = items.len(), "Read entity collection");
        Ok(items)
    }
}

/// `TotalResults` as a count; absent or unparsable means 0
fn parse_total(raw: Option<&str>, entity_type: &str) -> usize {
    match raw {
        Some(value) => match value.trim().parse::<usize>() {
            Ok(total) => total,
            Err(e) => {
                tracing::warn!(
                    entity_type,
                    value,
                    "Unparsable TotalResults ({}), results truncated to the first page",
                    e
                );
                0
            }
        },
        None => {
            tracing::warn!(
                entity_type,
                "Response has no TotalResults, results truncated to the first page"
            );
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_total() {
        assert_eq!(parse_total(Some("250"), "defects"), 250);
        assert_eq!(parse_total(Some(" 7 "), "defects"), 7);
        assert_eq!(parse_total(Some("many"), "defects"), 0);
        assert_eq!(parse_total(Some("-1"), "defects"), 0);
        assert_eq!(parse_total(None, "defects"), 0);
    }
}
