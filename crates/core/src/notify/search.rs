//! Search-index collaborator.
//!
//! Published proposals are indexed as one document per proposal, keyed by
//! the proposal id, using the Elasticsearch-style document API.

use reqwest::StatusCode;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::NotificationError;
use crate::models::{DbId, ProposalSnapshot};

use super::IDEMPOTENCY_HEADER;

pub struct SearchIndexClient {
    base_url: String,
    index: String,
    http: reqwest::Client,
}

impl SearchIndexClient {
    pub fn new(base_url: &str, index: &str, http: reqwest::Client) -> Self {
        info!(base_url, index, "initializing search index client");
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            index: index.to_string(),
            http,
        }
    }

    pub fn document_url(&self, proposal_id: DbId) -> String {
        format!("{}/{}/_doc/{}", self.base_url, self.index, proposal_id)
    }

    /// Create or replace the proposal's document.
    pub async fn upsert(
        &self,
        snapshot: &ProposalSnapshot,
        delivery_id: Uuid,
    ) -> Result<(), NotificationError> {
        let url = self.document_url(snapshot.proposal_id);
        debug!(%url, %delivery_id, "upserting search document");
        let resp = self
            .http
            .put(&url)
            .header(IDEMPOTENCY_HEADER, delivery_id.to_string())
            .json(snapshot)
            .send()
            .await?;
        check(resp).await
    }

    /// Remove the proposal's document. A missing document counts as removed.
    pub async fn delete(
        &self,
        proposal_id: DbId,
        delivery_id: Uuid,
    ) -> Result<(), NotificationError> {
        let url = self.document_url(proposal_id);
        debug!(%url, %delivery_id, "deleting search document");
        let resp = self
            .http
            .delete(&url)
            .header(IDEMPOTENCY_HEADER, delivery_id.to_string())
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check(resp).await
    }
}

async fn check(resp: reqwest::Response) -> Result<(), NotificationError> {
    if resp.status().is_success() {
        return Ok(());
    }
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    warn!(%status, %body, "search index returned error");
    Err(NotificationError::SearchIndexError(format!(
        "HTTP {status}: {body}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_url() {
        let client = SearchIndexClient::new(
            "http://localhost:9200/",
            "proposals",
            reqwest::Client::new(),
        );
        assert_eq!(
            client.document_url(12),
            "http://localhost:9200/proposals/_doc/12"
        );
    }
}
