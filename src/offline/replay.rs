//! Re-issuing recorded mutations against the API.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::fmt;
use std::time::Duration;
use url::Url;

use super::QueuedOperation;

/// Why a replay did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayError {
  /// The request never got a response (still offline, timeout, DNS...)
  Network(String),
  /// The server answered with a non-success status
  Status(u16),
  /// The recorded operation cannot be turned into a request
  Encode(String),
}

impl fmt::Display for ReplayError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ReplayError::Network(reason) => write!(f, "network error: {}", reason),
      ReplayError::Status(status) => write!(f, "server responded with status {}", status),
      ReplayError::Encode(reason) => write!(f, "invalid request: {}", reason),
    }
  }
}

impl std::error::Error for ReplayError {}

/// Issues a queued operation.
#[async_trait]
pub trait Replayer: Send + Sync {
  async fn replay(&self, operation: &QueuedOperation) -> Result<(), ReplayError>;
}

/// Replays operations over HTTP. Relative URLs resolve against the API base.
#[derive(Clone)]
pub struct HttpReplayer {
  client: reqwest::Client,
  base_url: Url,
}

impl HttpReplayer {
  pub fn new(base_url: Url, timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base_url: with_trailing_slash(base_url),
    })
  }

  /// Absolute URL an operation targets.
  pub fn resolve(&self, url: &str) -> Result<Url, ReplayError> {
    if let Ok(absolute) = Url::parse(url) {
      return Ok(absolute);
    }
    self
      .base_url
      .join(url.trim_start_matches('/'))
      .map_err(|e| ReplayError::Encode(format!("bad url {}: {}", url, e)))
  }
}

#[async_trait]
impl Replayer for HttpReplayer {
  async fn replay(&self, operation: &QueuedOperation) -> Result<(), ReplayError> {
    let method = Method::from_bytes(operation.method.to_uppercase().as_bytes())
      .map_err(|_| ReplayError::Encode(format!("bad method {}", operation.method)))?;
    let url = self.resolve(&operation.url)?;

    let mut request = self.client.request(method, url);
    if let Some(body) = &operation.body {
      request = request.json(body);
    }

    let response = request
      .send()
      .await
      .map_err(|e| ReplayError::Network(e.to_string()))?;

    let status = response.status();
    if status.is_success() {
      Ok(())
    } else {
      Err(ReplayError::Status(status.as_u16()))
    }
  }
}

fn with_trailing_slash(mut url: Url) -> Url {
  if !url.path().ends_with('/') {
    let path = format!("{}/", url.path());
    url.set_path(&path);
  }
  url
}
