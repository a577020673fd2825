//! Content-analysis collaborator.
//!
//! Each published snapshot is POSTed for scoring. The response body is not
//! read; the service reports results through its own channels.

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::NotificationError;
use crate::models::{DbId, ProposalSnapshot};

use super::IDEMPOTENCY_HEADER;

/// Body sent to the analysis endpoint.
#[derive(Debug, Serialize)]
struct AnalysisRequest<'a> {
    proposal_id: DbId,
    version: &'a str,
    title: &'a str,
    content: &'a str,
    fingerprint: &'a str,
}

pub struct AnalysisClient {
    url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl AnalysisClient {
    pub fn new(url: &str, token: Option<String>, http: reqwest::Client) -> Self {
        info!(url, authenticated = token.is_some(), "initializing analysis client");
        Self {
            url: url.to_string(),
            token,
            http,
        }
    }

    pub async fn submit(
        &self,
        snapshot: &ProposalSnapshot,
        delivery_id: Uuid,
    ) -> Result<(), NotificationError> {
        debug!(proposal_id = snapshot.proposal_id, %delivery_id, "submitting for analysis");
        let body = AnalysisRequest {
            proposal_id: snapshot.proposal_id,
            version: &snapshot.version,
            title: &snapshot.title,
            content: &snapshot.content,
            fingerprint: &snapshot.fingerprint,
        };
        let mut req = self
            .http
            .post(&self.url)
            .header(IDEMPOTENCY_HEADER, delivery_id.to_string())
            .json(&body);
        if let Some(ref token) = self.token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            warn!(%status, %body, "analysis service returned error");
            return Err(NotificationError::AnalysisError(format!(
                "HTTP {status}: {body}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_body_shape() {
        let body = AnalysisRequest {
            proposal_id: 2,
            version: "0.0.3",
            title: "t",
            content: "c",
            fingerprint: "ab",
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["proposal_id"], 2);
        assert_eq!(json["version"], "0.0.3");
        assert_eq!(json["fingerprint"], "ab");
    }
}
