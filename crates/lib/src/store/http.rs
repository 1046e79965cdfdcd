//! REST client for the message store and processing backend.

use super::types::{ProcessingRequest, RawMessage, SessionContext, StatusRecord};
use super::{MessageSource, StatusStore, StoreError};
use crate::message::MessageId;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:54321";

/// Header carrying the credential mode ("admin" or "tenant").
pub const MODE_HEADER: &str = "X-Autopilot-Mode";
/// Header carrying the tenant id in tenant mode.
pub const TENANT_HEADER: &str = "X-Autopilot-Tenant";

/// HTTP implementation of both collaborator traits.
#[derive(Clone)]
pub struct HttpBackend {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct UnseenResponse {
    #[serde(default)]
    messages: Vec<RawMessage>,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    #[serde(default)]
    status: Option<StatusRecord>,
}

impl HttpBackend {
    pub fn new(base_url: Option<String>, token: Option<String>) -> Self {
        let base_url = base_url
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self {
            base_url,
            token,
            client: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        self.authorize(self.client.request(method, &url))
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.token {
            Some(ref t) => req.bearer_auth(t),
            None => req,
        }
    }

    /// `{base}/process/{id}/status` with the id percent-encoded as one path segment.
    fn status_url(&self, id: &str) -> Result<reqwest::Url, StoreError> {
        let mut url = reqwest::Url::parse(&self.base_url)
            .map_err(|e| StoreError::Api(format!("invalid base url {}: {}", self.base_url, e)))?;
        url.path_segments_mut()
            .map_err(|_| StoreError::Api(format!("base url {} cannot carry a path", self.base_url)))?
            .pop_if_empty()
            .extend(["process", id, "status"]);
        Ok(url)
    }

    async fn expect_success(res: reqwest::Response, what: &str) -> Result<reqwest::Response, StoreError> {
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(StoreError::Api(format!("{} failed: {} {}", what, status, body)));
        }
        Ok(res)
    }
}

#[async_trait]
impl MessageSource for HttpBackend {
    /// GET /messages/unseen
    async fn discover_unseen(&self, ctx: &SessionContext) -> Result<Vec<RawMessage>, StoreError> {
        let mut req = self
            .request(reqwest::Method::GET, "/messages/unseen")
            .header(MODE_HEADER, ctx.mode.as_str());
        if let Some(ref tenant) = ctx.tenant_id {
            req = req.header(TENANT_HEADER, tenant);
        }
        let res = req.send().await?;
        let res = Self::expect_success(res, "discover").await?;
        let data: UnseenResponse = res.json().await?;
        Ok(data.messages)
    }

    /// POST /messages/viewed
    async fn claim_viewed(&self, ids: &[MessageId]) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        let body = serde_json::json!({ "ids": ids });
        let res = self
            .request(reqwest::Method::POST, "/messages/viewed")
            .json(&body)
            .send()
            .await?;
        Self::expect_success(res, "claim viewed").await?;
        Ok(())
    }
}

#[async_trait]
impl StatusStore for HttpBackend {
    /// POST /process (single) or /process/batch.
    async fn initiate_processing(&self, request: &ProcessingRequest) -> Result<(), StoreError> {
        let path = if request.is_batch() {
            "/process/batch"
        } else {
            "/process"
        };
        let res = self
            .request(reqwest::Method::POST, path)
            .json(request)
            .send()
            .await?;
        Self::expect_success(res, "initiate processing").await?;
        Ok(())
    }

    /// GET /process/{id}/status. 404 and `{"status": null}` both mean no record.
    async fn poll_status(&self, id: &str) -> Result<Option<StatusRecord>, StoreError> {
        let url = self.status_url(id)?;
        let res = self.authorize(self.client.get(url)).send().await?;
        if res.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let res = Self::expect_success(res, "poll status").await?;
        let data: StatusResponse = res.json().await?;
        Ok(data.status.filter(|s| !s.status.trim().is_empty()))
    }

    /// GET /health
    async fn check_health(&self) -> Result<(), StoreError> {
        let res = self
            .request(reqwest::Method::GET, "/health")
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        if !res.status().is_success() {
            return Err(StoreError::Unavailable(format!(
                "health check returned {}",
                res.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let b = HttpBackend::new(Some("http://example.test/api/".into()), None);
        assert_eq!(b.base_url(), "http://example.test/api");
        let d = HttpBackend::new(None, None);
        assert_eq!(d.base_url(), DEFAULT_BASE_URL);
    }

    #[test]
    fn status_url_encodes_id_as_one_segment() {
        let b = HttpBackend::new(Some("http://example.test/api/".into()), None);
        assert_eq!(
            b.status_url("m1").unwrap().as_str(),
            "http://example.test/api/process/m1/status"
        );
        assert_eq!(
            b.status_url("a/b?c#d").unwrap().as_str(),
            "http://example.test/api/process/a%2Fb%3Fc%23d/status"
        );
        let root = HttpBackend::new(Some("http://example.test".into()), None);
        assert_eq!(
            root.status_url("x y").unwrap().as_str(),
            "http://example.test/process/x%20y/status"
        );
    }

    #[test]
    fn status_envelope_null_is_empty() {
        let r: StatusResponse = serde_json::from_str(r#"{"status":null}"#).unwrap();
        assert!(r.status.is_none());
        let r: StatusResponse = serde_json::from_str(r#"{}"#).unwrap();
        assert!(r.status.is_none());
    }
}
