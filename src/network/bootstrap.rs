//! Remote bootstrap list
//!
//! One of the discovery sources: a list of `ip:port` entries fetched from
//! a configurable location.

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Unexpected status {0}")]
    Status(u16),
}

#[async_trait]
pub trait BootstrapSource: Send + Sync {
    /// Raw candidate addresses; validation happens at admission
    async fn fetch(&self) -> Result<Vec<String>, BootstrapError>;
}

/// Bootstrap list served over HTTP or HTTPS
#[derive(Debug, Clone)]
pub struct HttpBootstrap {
    client: Client,
    url: String,
}

impl HttpBootstrap {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, BootstrapError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .build()?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl BootstrapSource for HttpBootstrap {
    async fn fetch(&self) -> Result<Vec<String>, BootstrapError> {
        let response = self.client.get(&self.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(BootstrapError::Status(status.as_u16()));
        }
        let body = response.text().await?;
        Ok(parse_addr_list(&body))
    }
}

/// Fixed list
#[derive(Debug, Clone, Default)]
pub struct StaticBootstrap(pub Vec<String>);

#[async_trait]
impl BootstrapSource for StaticBootstrap {
    async fn fetch(&self) -> Result<Vec<String>, BootstrapError> {
        Ok(self.0.clone())
    }
}

/// Split a body on newlines, commas and whitespace; `#` starts a comment
pub fn parse_addr_list(body: &str) -> Vec<String> {
    body.lines()
        .map(|line| line.split('#').next().unwrap_or(""))
        .flat_map(|line| line.split(|c: char| c == ',' || c.is_whitespace()))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
