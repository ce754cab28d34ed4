//! Client for the external permission service.
//!
//! The service owns workspaces and their grant lists; this side only asks
//! "may the caller read/manage this entity" and forwards the caller's
//! Authorization header.

use reqwest::StatusCode;
use serde::Deserialize;

use crate::error::{Result, ServerError};

const API_PREFIX: &str = "/api/v0.2";

#[derive(Clone, Debug, Deserialize)]
pub struct Workspace {
    pub name: String,
    #[serde(default)]
    pub can: Vec<String>,
}

pub struct DealerClient {
    base: String,
    client: reqwest::Client,
}

impl DealerClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| ServerError::Internal(format!("failed to build http client: {}", e)))?;
        Ok(Self {
            base: format!("{}{}", base_url.trim_end_matches('/'), API_PREFIX),
            client,
        })
    }

    pub async fn get_workspace(
        &self,
        workspace: &str,
        authorization: Option<&str>,
    ) -> Result<Workspace> {
        let mut req = self
            .client
            .get(format!("{}/workspace/{}", self.base, workspace));
        if let Some(auth) = authorization {
            req = req.header(reqwest::header::AUTHORIZATION, auth);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| ServerError::Upstream(format!("dealer unreachable: {}", e)))?;
        match resp.status() {
            StatusCode::NOT_FOUND => Err(ServerError::NotFound(format!(
                "Workspace {} not found",
                workspace
            ))),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ServerError::Permission(
                format!("no access to workspace {}", workspace),
            )),
            s if s.is_success() => resp
                .json()
                .await
                .map_err(|e| ServerError::Upstream(format!("bad workspace from dealer: {}", e))),
            s => Err(ServerError::Upstream(format!(
                "dealer returned {} for workspace {}",
                s, workspace
            ))),
        }
    }

    /// Verify the caller holds `<entity>.read` or `<entity>.manage` on the
    /// workspace.
    pub async fn check_entity_access(
        &self,
        ty: &str,
        workspace: &str,
        name: &str,
        write: bool,
        authorization: Option<&str>,
    ) -> Result<()> {
        let ws = self.get_workspace(workspace, authorization).await?;

        // Models are called "mlmodel" on the dealer side.
        let entity = if ty == "model" { "mlmodel" } else { ty };
        let modificator = if write { "manage" } else { "read" };
        let needed = format!("{}.{}", entity, modificator);

        if ws.can.iter().any(|perm| perm == &needed) {
            Ok(())
        } else {
            Err(ServerError::Permission(format!(
                "Failed to {} {} {}/{}",
                modificator, ty, workspace, name
            )))
        }
    }
}
