//! Gateway probing

use crate::errors::ProbeError;
use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Fetches a gateway's advertisement endpoint.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(
        &self,
        iface: &str,
        gateway_ip: &str,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<Vec<u8>, ProbeError>;
}

/// HTTP GET against `http://<gateway_ip>:<advert_port>/`.
pub struct HttpProber {
    http: reqwest::Client,
    advert_port: u16,
}

impl HttpProber {
    pub fn new(advert_port: u16) -> Self {
        Self {
            http: reqwest::Client::new(),
            advert_port,
        }
    }

    async fn fetch(&self, url: &str, timeout: Duration) -> Result<Vec<u8>, ProbeError> {
        let response = self
            .http
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProbeError::Timeout
                } else {
                    ProbeError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProbeError::Status(status.as_u16()));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| ProbeError::Transport(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(
        &self,
        iface: &str,
        gateway_ip: &str,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<Vec<u8>, ProbeError> {
        let url = format!("http://{gateway_ip}:{}/", self.advert_port);
        log::debug!("probing {url} via {iface}");

        tokio::select! {
            _ = cancel.cancelled() => Err(ProbeError::Cancelled),
            result = self.fetch(&url, timeout) => result,
        }
    }
}
