//! Health probing of the active target
//!
//! By default the probe goes through the proxy's local listen address, so a
//! passing check proves the whole tunnel works. `direct` mode talks HTTPS to
//! the target itself and only proves the target is up.

use crate::config::{HealthConfig, ProbeMode};
use crate::error::ProbeError;
use crate::target::Target;
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Decides whether the current target is healthy.
///
/// An `Err` is a failed probe, not a fatal condition; callers treat it
/// exactly like `Ok(false)`.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self, target: &Target) -> Result<bool, ProbeError>;
}

/// HTTP(S) GET probe with a fixed set of accepted status codes
pub struct HttpProbe {
    client: reqwest::Client,
    mode: ProbeMode,
    listen: String,
    path: String,
    accepted_statuses: Vec<u16>,
    timeout: Duration,
}

impl HttpProbe {
    /// Build a probe from configuration.
    ///
    /// `cacert` is trusted in addition to the system roots for direct probes.
    pub fn new(config: &HealthConfig, listen: &str, cacert: Option<&Path>) -> Result<Self, ProbeError> {
        let mut builder = reqwest::Client::builder()
            .timeout(config.timeout())
            .redirect(reqwest::redirect::Policy::none());

        if let (ProbeMode::Direct, Some(path)) = (config.mode, cacert) {
            let pem = std::fs::read(path).map_err(|e| {
                ProbeError::Setup(format!("cannot read CA file {}: {}", path.display(), e))
            })?;
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
        }

        let path = if config.path.starts_with('/') {
            config.path.clone()
        } else {
            format!("/{}", config.path)
        };

        Ok(Self {
            client: builder.build()?,
            mode: config.mode,
            listen: listen.to_string(),
            path,
            accepted_statuses: config.accepted_statuses.clone(),
            timeout: config.timeout(),
        })
    }

    /// URL probed for `target`
    pub fn url(&self, target: &Target) -> String {
        match self.mode {
            ProbeMode::Proxied => format!("http://{}{}", self.listen, self.path),
            ProbeMode::Direct => format!("https://{}{}", target, self.path),
        }
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn check(&self, target: &Target) -> Result<bool, ProbeError> {
        let url = self.url(target);
        let mut request = self.client.get(&url);
        if self.mode == ProbeMode::Proxied {
            // The tunnel is transparent, so present the target's name to it
            request = request.header(reqwest::header::HOST, target.host.as_str());
        }

        let response = tokio::time::timeout(self.timeout, request.send())
            .await
            .map_err(|_| ProbeError::Timeout(self.timeout))??;

        let status = response.status().as_u16();
        let healthy = self.accepted_statuses.contains(&status);
        debug!(upstream = %target, %url, status, healthy, "Health probe completed");
        Ok(healthy)
    }
}
