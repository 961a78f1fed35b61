use anyhow::{Context, Result, bail};
use serde::Deserialize;
use serde_json::json;

use crate::status::SystemStatus;

/// HTTP client for the submission API.
#[derive(Clone)]
pub struct ApiClient {
  base_url: String,
  http: reqwest::Client,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitResponse {
  pub message: String,
  pub assigned_to: Option<String>,
}

impl ApiClient {
  pub fn new(base_url: &str) -> Self {
    Self {
      base_url: base_url.trim_end_matches('/').to_string(),
      http: reqwest::Client::new(),
    }
  }

  pub async fn submit(&self, id: &str, payload: &str, kind: Option<&str>) -> Result<SubmitResponse> {
    let response = self
      .http
      .post(format!("{}/submit_task", self.base_url))
      .json(&json!({"task": {"id": id, "payload": payload, "kind": kind}}))
      .send()
      .await
      .with_context(|| format!("failed to reach {}", self.base_url))?;
    let status = response.status();
    let body: serde_json::Value = response.json().await.context("invalid response body")?;
    if !status.is_success() {
      bail!(
        "submission of task {id} rejected ({status}): {}",
        body.get("error").and_then(|e| e.as_str()).unwrap_or("unknown error")
      );
    }
    Ok(serde_json::from_value(body)?)
  }

  pub async fn system_status(&self) -> Result<SystemStatus> {
    let status = self
      .http
      .get(format!("{}/system_status", self.base_url))
      .send()
      .await?
      .error_for_status()?
      .json()
      .await?;
    Ok(status)
  }
}
