use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::driver::{Driver, Page, Session};
use crate::engine::run_step;
use crate::error::{DriverError, SessionError};
use crate::state::AgentState;
use crate::types::{LoginState, StateReport, Trajectory};

const USERNAME_PLACEHOLDER: &str = "${DG_USERNAME}";
const PASSWORD_PLACEHOLDER: &str = "${DG_PASSWORD}";
const UNKNOWN_MAIN_URL: &str = "main page";

/// Owns the lifecycle of the single browser session.
pub struct SessionManager {
    driver: Box<dyn Driver>,
    login_trajectory: PathBuf,
    success_marker: Option<String>,
    close_timeout: Duration,
}

impl SessionManager {
    pub fn new(driver: Box<dyn Driver>, config: &AgentConfig) -> Self {
        Self {
            driver,
            login_trajectory: config.login_trajectory.clone(),
            success_marker: config.login_success_marker.clone(),
            close_timeout: config.close_timeout(),
        }
    }

    /// Replaces any existing session with a freshly logged-in one and returns the
    /// report for the backend.
    pub async fn login(
        &self,
        state: &mut AgentState,
        student_id: &str,
        password: &str,
    ) -> StateReport {
        if state.session.is_some() {
            info!("closing previous browser session before login");
        }
        self.teardown(state).await;

        let trajectory = match Trajectory::from_file(&self.login_trajectory) {
            Ok(trajectory) => trajectory,
            Err(e) => {
                warn!("login trajectory unavailable: {}", e);
                return login_failed(e.to_string());
            }
        };

        info!(student_id, steps = trajectory.steps.len(), "starting login");
        let session = match self.driver.open().await {
            Ok(session) => session,
            Err(e) => {
                let err = SessionError::from(e);
                warn!("login failed: {}", err);
                return login_failed(err.login_message());
            }
        };

        match self
            .run_login(session.page.as_ref(), &trajectory, student_id, password)
            .await
        {
            Ok(last_url) => {
                info!(student_id, last_url = %last_url, "login succeeded");
                state.session = Some(session);
                state.login = LoginState {
                    logged_in: true,
                    student_id: Some(student_id.to_string()),
                    last_url: Some(last_url.clone()),
                };
                StateReport::Login {
                    login_success: true,
                    message: "login succeeded".to_string(),
                    student_id: Some(student_id.to_string()),
                    last_url: Some(last_url),
                }
            }
            Err(e) => {
                warn!("login failed: {}", e);
                self.close_session(session).await;
                state.login.reset();
                login_failed(e.login_message())
            }
        }
    }

    /// Best-effort close of the active session. Always leaves the slot empty and
    /// the login state reset, and is safe to call with no session.
    pub async fn teardown(&self, state: &mut AgentState) {
        match state.session.take() {
            Some(session) => {
                info!("closing browser session");
                self.close_session(session).await;
            }
            None => debug!("no browser session to close"),
        }
        state.login.reset();
    }

    async fn close_session(&self, session: Session) {
        close_quietly("page", session.page.close(), self.close_timeout).await;
        close_quietly("context", session.context.close(), self.close_timeout).await;
    }

    async fn run_login(
        &self,
        page: &dyn Page,
        trajectory: &Trajectory,
        student_id: &str,
        password: &str,
    ) -> Result<String, SessionError> {
        for step in &trajectory.steps {
            let mut step = step.clone();
            for value in step.args.values_mut() {
                substitute(value, student_id, password);
            }
            run_step(page, &step)
                .await
                .map_err(|source| SessionError::Step {
                    step: step.name.clone(),
                    source,
                })?;
        }

        let url = match page.url().await {
            Ok(url) => url,
            Err(e) => {
                debug!("could not read url after login: {}", e);
                return Ok(UNKNOWN_MAIN_URL.to_string());
            }
        };
        if let Some(marker) = &self.success_marker {
            if !url.contains(marker.as_str()) {
                return Err(SessionError::NotOnMainPage(url));
            }
        }
        Ok(url)
    }
}

async fn close_quietly<F>(what: &str, close: F, limit: Duration)
where
    F: Future<Output = Result<(), DriverError>>,
{
    match tokio::time::timeout(limit, close).await {
        Ok(Ok(())) => info!("{} closed", what),
        Ok(Err(DriverError::Cancelled)) => info!("{} close cancelled, treating as closed", what),
        Ok(Err(DriverError::Closed)) => debug!("{} was already closed", what),
        Ok(Err(e)) => warn!("failed to close {}: {}", what, e),
        Err(_) => info!("{} close timed out, treating as closed", what),
    }
}

fn login_failed(message: String) -> StateReport {
    StateReport::Login {
        login_success: false,
        message,
        student_id: None,
        last_url: None,
    }
}

fn substitute(value: &mut Value, student_id: &str, password: &str) {
    match value {
        Value::String(s) => {
            if s.contains(USERNAME_PLACEHOLDER) || s.contains(PASSWORD_PLACEHOLDER) {
                *s = s
                    .replace(USERNAME_PLACEHOLDER, student_id)
                    .replace(PASSWORD_PLACEHOLDER, password);
            }
        }
        Value::Array(items) => items
            .iter_mut()
            .for_each(|v| substitute(v, student_id, password)),
        Value::Object(map) => map
            .values_mut()
            .for_each(|v| substitute(v, student_id, password)),
        _ => {}
    }
}
