//! HTTP client for an upstream master instance.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;

use super::{ChunkCheckInfo, ManifestResponse, RemoteBackend, VersionList};
use crate::error::{Result, ServerError};

const INTERNAL_KEY_HEADER: &str = "x-internal-key";

pub struct HttpMasterClient {
    base: String,
    internal_key: String,
    client: reqwest::Client,
}

impl HttpMasterClient {
    /// Talks to the first configured master; the others are spares for the
    /// operator, not a failover pool.
    pub fn new(masters: &[String], internal_key: &str) -> Result<Self> {
        let base = masters
            .first()
            .ok_or_else(|| ServerError::Internal("no masters configured".to_string()))?
            .trim_end_matches('/')
            .to_string();
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| ServerError::Internal(format!("failed to build http client: {}", e)))?;
        Ok(Self {
            base,
            internal_key: internal_key.to_string(),
            client,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self.client.request(method, format!("{}{}", self.base, path));
        if !self.internal_key.is_empty() {
            req = req.header(INTERNAL_KEY_HEADER, &self.internal_key);
        }
        req
    }

    async fn send(&self, req: reqwest::RequestBuilder, what: &str) -> Result<reqwest::Response> {
        let resp = req
            .send()
            .await
            .map_err(|e| ServerError::Upstream(format!("master unreachable: {}", e)))?;
        match resp.status() {
            StatusCode::NOT_FOUND => Err(ServerError::NotFound(format!("{} (from master)", what))),
            s if s.is_success() => Ok(resp),
            s => Err(ServerError::Upstream(format!(
                "master returned {} for {}",
                s, what
            ))),
        }
    }
}

#[async_trait]
impl RemoteBackend for HttpMasterClient {
    async fn check_chunk(&self, hash: &str) -> Result<ChunkCheckInfo> {
        let resp = self
            .request(reqwest::Method::HEAD, &format!("/chunks/{}", hash))
            .send()
            .await
            .map_err(|e| ServerError::Upstream(format!("master unreachable: {}", e)))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(ChunkCheckInfo {
                hash: hash.to_string(),
                exists: false,
                size: 0,
            });
        }
        if !resp.status().is_success() {
            return Err(ServerError::Upstream(format!(
                "master returned {} for chunk check",
                resp.status()
            )));
        }
        let size = resp
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        Ok(ChunkCheckInfo {
            hash: hash.to_string(),
            exists: true,
            size,
        })
    }

    async fn download_chunk(&self, hash: &str) -> Result<Bytes> {
        let resp = self
            .send(
                self.request(reqwest::Method::GET, &format!("/chunks/{}", hash)),
                &format!("chunk {}", hash),
            )
            .await?;
        resp.bytes()
            .await
            .map_err(|e| ServerError::Upstream(format!("chunk body read failed: {}", e)))
    }

    async fn list_versions(&self, ty: &str, workspace: &str, name: &str) -> Result<VersionList> {
        let resp = self
            .send(
                self.request(
                    reqwest::Method::GET,
                    &format!("/{}/{}/{}/versions", ty, workspace, name),
                ),
                &format!("{} {}/{}", ty, workspace, name),
            )
            .await?;
        resp.json()
            .await
            .map_err(|e| ServerError::Upstream(format!("bad version list from master: {}", e)))
    }

    async fn get_manifest(
        &self,
        ty: &str,
        workspace: &str,
        name: &str,
        version: &str,
    ) -> Result<ManifestResponse> {
        let resp = self
            .send(
                self.request(
                    reqwest::Method::GET,
                    &format!("/{}/{}/{}/versions/{}/manifest", ty, workspace, name, version),
                ),
                &format!("{} {}/{}:{}", ty, workspace, name, version),
            )
            .await?;
        resp.json()
            .await
            .map_err(|e| ServerError::Upstream(format!("bad manifest from master: {}", e)))
    }
}
