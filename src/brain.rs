//! Client for the orchestration backend that decides what the agent does next.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::error::{BackendError, TransportError};
use crate::types::{Command, GeneratedAction, StateReport, VerificationResult};

#[async_trait]
pub trait Backend: Send + Sync {
    /// `POST /execution_web/init`
    async fn announce_start(&self) -> Result<(), TransportError>;

    /// `GET /command`, annotated with the current session count.
    async fn next_command(
        &self,
        browser_running: bool,
        browser_count: usize,
    ) -> Result<Command, BackendError>;

    /// `GET /action`. `Ok(None)` when the backend has no state yet or sent no action.
    async fn next_action(&self) -> Result<Option<GeneratedAction>, BackendError>;

    /// `POST /state`
    async fn report_state(&self, report: &StateReport) -> Result<(), TransportError>;

    /// `POST /verification`
    async fn report_verification(&self, result: &VerificationResult)
    -> Result<(), TransportError>;

    /// `POST /logout`, sent when the browser was closed under us.
    async fn report_logout(&self) -> Result<(), TransportError>;
}

pub struct HttpBackend {
    client: Client,
    base_url: String,
    short_timeout: Duration,
    poll_timeout: Duration,
    action_timeout: Duration,
    state_timeout: Duration,
}

impl HttpBackend {
    pub fn new(config: &AgentConfig) -> Result<Self, TransportError> {
        let client = Client::builder()
            .build()
            .map_err(|e| TransportError::Request(e.to_string()))?;
        Ok(Self {
            client,
            base_url: config.backend_url.trim_end_matches('/').to_string(),
            short_timeout: Duration::from_secs(config.short_timeout_secs),
            poll_timeout: Duration::from_secs(config.poll_timeout_secs),
            action_timeout: Duration::from_secs(config.action_timeout_secs),
            state_timeout: Duration::from_secs(config.state_timeout_secs),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post_json(
        &self,
        path: &str,
        body: &Value,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let response = self
            .client
            .post(self.url(path))
            .json(body)
            .timeout(timeout)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }
        Ok(())
    }

    async fn get_json(&self, url: &str, timeout: Duration) -> Result<Value, TransportError> {
        let response = self.client.get(url).timeout(timeout).send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(status_error(status, &text));
        }
        parse_body(&text)
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn announce_start(&self) -> Result<(), TransportError> {
        self.post_json(
            "/execution_web/init",
            &json!({"status": "started"}),
            self.short_timeout,
        )
        .await?;
        info!("backend acknowledged agent start");
        Ok(())
    }

    async fn next_command(
        &self,
        browser_running: bool,
        browser_count: usize,
    ) -> Result<Command, BackendError> {
        let url = format!(
            "{}?browser_running={}&browser_count={}",
            self.url("/command"),
            browser_running,
            browser_count
        );
        let body = self.get_json(&url, self.poll_timeout).await?;
        Ok(Command::from_value(body)?)
    }

    async fn next_action(&self) -> Result<Option<GeneratedAction>, BackendError> {
        let response = self
            .client
            .get(self.url("/action"))
            .timeout(self.action_timeout)
            .send()
            .await
            .map_err(TransportError::from)?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            warn!("backend has no action state yet");
            return Ok(None);
        }
        let text = response.text().await.map_err(TransportError::from)?;
        if !status.is_success() {
            return Err(status_error(status, &text).into());
        }

        let body = parse_body(&text)?;
        debug!(payload = %body, "action received");
        match body.get("generated_action") {
            None | Some(Value::Null) => {
                warn!("response carries no generated_action");
                Ok(None)
            }
            Some(generated) => Ok(Some(GeneratedAction::from_value(generated)?)),
        }
    }

    async fn report_state(&self, report: &StateReport) -> Result<(), TransportError> {
        let data = serde_json::to_value(report)
            .map_err(|e| TransportError::Malformed(e.to_string()))?;
        self.post_json("/state", &json!({ "data": data }), self.state_timeout)
            .await
    }

    async fn report_verification(
        &self,
        result: &VerificationResult,
    ) -> Result<(), TransportError> {
        let body = json!({"success": result.success, "message": result.message});
        self.post_json("/verification", &body, self.short_timeout)
            .await
    }

    async fn report_logout(&self) -> Result<(), TransportError> {
        self.post_json("/logout", &json!({}), self.short_timeout)
            .await
    }
}

fn status_error(status: StatusCode, body: &str) -> TransportError {
    TransportError::Status {
        status: status.as_u16(),
        body: body.chars().take(200).collect(),
    }
}

fn parse_body(text: &str) -> Result<Value, TransportError> {
    if text.trim().is_empty() {
        return Err(TransportError::EmptyBody);
    }
    serde_json::from_str(text).map_err(|e| {
        let preview: String = text.chars().take(200).collect();
        TransportError::Malformed(format!("{e} (body: {preview})"))
    })
}
