//! Application quiesce/resume.
//!
//! Draining is a scoped acquisition: `QuiesceController::quiesce` returns a
//! `QuiesceGuard` only once the application reports itself drained, and the
//! guard resumes the application when released or dropped.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ApplicationConfig;
use crate::error::{Error, Result};
use crate::retry::Backoff;

/// Drain/resume capability of the live application.
#[async_trait]
pub trait Application: Send + Sync {
    /// Ask the application to stop accepting writes.
    async fn drain(&self) -> Result<()>;

    /// Whether in-flight writes have finished.
    async fn is_drained(&self) -> Result<bool>;

    /// Resume normal traffic. Must be idempotent.
    async fn resume(&self) -> Result<()>;
}

/// Admin-API client for an application exposing maintenance endpoints.
pub struct HttpApplication {
    client: Client,
    base_url: String,
    drain_path: String,
    status_path: String,
    resume_path: String,
    token: Option<String>,
}

#[derive(Deserialize)]
struct StatusResponse {
    #[serde(default)]
    drained: Option<bool>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    in_flight_writes: Option<u64>,
}

impl StatusResponse {
    fn is_drained(&self) -> bool {
        if let Some(drained) = self.drained {
            return drained;
        }
        if let Some(status) = &self.status {
            return status.eq_ignore_ascii_case("drained");
        }
        self.in_flight_writes == Some(0)
    }
}

impl HttpApplication {
    pub fn from_config(config: &ApplicationConfig) -> Result<Self> {
        let base_url = config
            .base_url
            .as_ref()
            .ok_or_else(|| Error::Config("[application] base_url is required to quiesce".into()))?
            .trim_end_matches('/')
            .to_string();

        let token = match &config.auth_token_env {
            Some(var) => Some(std::env::var(var).map_err(|_| {
                Error::Config(format!("Application token env var {} is not set", var))
            })?),
            None => None,
        };

        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            client,
            base_url,
            drain_path: config.drain_path.clone(),
            status_path: config.status_path.clone(),
            resume_path: config.resume_path.clone(),
            token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let req = self.client.request(method, self.url(path));
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn post(&self, path: &str) -> Result<()> {
        let response = self.request(reqwest::Method::POST, path).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Quiesce(format!("POST {} failed ({}): {}", path, status, body)));
        }
        Ok(())
    }
}

#[async_trait]
impl Application for HttpApplication {
    async fn drain(&self) -> Result<()> {
        self.post(&self.drain_path).await
    }

    async fn is_drained(&self) -> Result<bool> {
        let response = self
            .request(reqwest::Method::GET, &self.status_path)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::Quiesce(format!(
                "GET {} failed ({})",
                self.status_path,
                response.status()
            )));
        }
        let status: StatusResponse = response.json().await?;
        Ok(status.is_drained())
    }

    async fn resume(&self) -> Result<()> {
        self.post(&self.resume_path).await
    }
}

/// Drains the application and hands out resume guards.
#[derive(Clone)]
pub struct QuiesceController {
    app: Arc<dyn Application>,
    drain_timeout: Duration,
    poll_interval: Duration,
    resume_attempts: u32,
}

/// Why `quiesce` failed, and whether the best-effort resume succeeded.
#[derive(Debug)]
pub struct QuiesceAborted {
    pub cause: Error,
    pub resumed: bool,
}

impl QuiesceController {
    pub fn new(app: Arc<dyn Application>, drain_timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            app,
            drain_timeout,
            poll_interval,
            resume_attempts: 5,
        }
    }

    pub fn from_config(app: Arc<dyn Application>, config: &ApplicationConfig) -> Self {
        Self {
            resume_attempts: config.resume_attempts.max(1),
            ..Self::new(app, config.drain_timeout(), config.poll_interval())
        }
    }

    pub fn application(&self) -> &Arc<dyn Application> {
        &self.app
    }

    /// Drain and wait. On timeout, error or cancellation the application is
    /// resumed before returning.
    pub async fn quiesce(
        &self,
        cancel: &CancellationToken,
    ) -> std::result::Result<QuiesceGuard, QuiesceAborted> {
        info!(timeout = ?self.drain_timeout, "Draining application");

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            r = tokio::time::timeout(self.drain_timeout, self.drain_and_wait()) => match r {
                Ok(inner) => inner,
                Err(_) => Err(Error::QuiesceTimeout(self.drain_timeout)),
            },
        };

        match outcome {
            Ok(()) => {
                let guard = QuiesceGuard {
                    app: Some(self.app.clone()),
                    opened_at: Utc::now(),
                    resume_attempts: self.resume_attempts,
                };
                info!("Application drained");
                Ok(guard)
            }
            Err(cause) => {
                warn!(error = %cause, "Quiesce failed, resuming application");
                let resumed = resume_with_retry(self.app.as_ref(), self.resume_attempts).await;
                Err(QuiesceAborted { cause, resumed })
            }
        }
    }

    async fn drain_and_wait(&self) -> Result<()> {
        self.app.drain().await?;
        loop {
            match self.app.is_drained().await {
                Ok(true) => return Ok(()),
                Ok(false) => debug!("Application still draining"),
                Err(e) => warn!(error = %e, "Drain status check failed"),
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

/// Held while the application is drained.
pub struct QuiesceGuard {
    app: Option<Arc<dyn Application>>,
    opened_at: DateTime<Utc>,
    resume_attempts: u32,
}

impl QuiesceGuard {
    /// Moment the application was confirmed drained.
    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    /// Re-check that the application is still drained.
    pub async fn still_drained(&self) -> Result<bool> {
        match &self.app {
            Some(app) => app.is_drained().await,
            None => Ok(false),
        }
    }

    /// Resume the application. Returns whether resume was confirmed.
    pub async fn release(mut self) -> bool {
        match self.app.take() {
            Some(app) => resume_with_retry(app.as_ref(), self.resume_attempts).await,
            None => true,
        }
    }
}

impl Drop for QuiesceGuard {
    fn drop(&mut self) {
        let Some(app) = self.app.take() else {
            return;
        };
        let attempts = self.resume_attempts;
        warn!("Quiesce guard dropped without release, resuming in background");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    resume_with_retry(app.as_ref(), attempts).await;
                });
            }
            Err(_) => error!("No runtime available to resume the application; resume it manually"),
        }
    }
}

async fn resume_with_retry(app: &dyn Application, attempts: u32) -> bool {
    let mut backoff = Backoff::new(Duration::from_millis(200), Duration::from_secs(5));
    for attempt in 1..=attempts.max(1) {
        match app.resume().await {
            Ok(()) => {
                info!(attempt, "Application resumed");
                return true;
            }
            Err(e) => {
                warn!(attempt, error = %e, "Resume failed");
                if attempt < attempts {
                    tokio::time::sleep(backoff.next_delay()).await;
                }
            }
        }
    }
    error!(attempts, "Application could not be resumed; manual intervention required");
    false
}
