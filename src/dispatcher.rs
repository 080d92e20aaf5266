use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::brain::Backend;
use crate::config::AgentConfig;
use crate::dom::PageScanner;
use crate::driver::Driver;
use crate::engine::{ActionEngine, ActionOutcome};
use crate::error::BackendError;
use crate::session::SessionManager;
use crate::state::AgentState;
use crate::types::{Command, StateReport};

/// How a poll cycle ended, which decides how long to wait before the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// A command was handled; poll again right away.
    Handled,
    /// Nothing to do, or the cycle was skipped.
    Idle,
    /// The backend is unreachable.
    Backoff,
}

/// The top-level loop: fetch one command, handle it, repeat.
pub struct Dispatcher<B: Backend> {
    backend: B,
    sessions: SessionManager,
    engine: ActionEngine,
    scanner: PageScanner,
    state: AgentState,
    poll_interval: Duration,
    connect_backoff: Duration,
}

impl<B: Backend> Dispatcher<B> {
    pub fn new(config: &AgentConfig, backend: B, driver: Box<dyn Driver>) -> Self {
        let scanner = PageScanner::new(config.title_keywords.clone());
        Self {
            backend,
            sessions: SessionManager::new(driver, config),
            engine: ActionEngine::new(scanner.clone(), config),
            scanner,
            state: AgentState::default(),
            poll_interval: config.poll_interval(),
            connect_backoff: config.connect_backoff(),
        }
    }

    pub fn state(&self) -> &AgentState {
        &self.state
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Announces the agent to the backend. Failure is not fatal.
    pub async fn announce(&mut self) {
        self.state.login.reset();
        match self.backend.announce_start().await {
            Ok(()) => info!("backend initialised"),
            Err(e) => warn!("backend init signal failed: {}", e),
        }
    }

    /// Polls until `shutdown` resolves, then closes the browser session.
    pub async fn run<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        self.announce().await;
        tokio::pin!(shutdown);

        loop {
            let outcome = tokio::select! {
                outcome = self.run_cycle() => outcome,
                () = &mut shutdown => break,
            };
            let pause = self.pause_after(outcome);
            if pause.is_zero() {
                continue;
            }
            tokio::select! {
                () = tokio::time::sleep(pause) => {}
                () = &mut shutdown => break,
            }
        }

        info!("shutting down");
        self.sessions.teardown(&mut self.state).await;
    }

    fn pause_after(&self, outcome: CycleOutcome) -> Duration {
        match outcome {
            CycleOutcome::Handled => Duration::ZERO,
            CycleOutcome::Idle => self.poll_interval,
            CycleOutcome::Backoff => self.connect_backoff,
        }
    }

    /// One health check, fetch and dispatch.
    pub async fn run_cycle(&mut self) -> CycleOutcome {
        if self.session_lost().await {
            return CycleOutcome::Idle;
        }

        let count = self.state.session_count();
        let command = match self.backend.next_command(count > 0, count).await {
            Ok(command) => command,
            Err(BackendError::Transport(e)) if e.is_connect() => {
                error!("cannot reach backend, is it running? {}", e);
                return CycleOutcome::Backoff;
            }
            Err(e) => {
                warn!("skipping cycle: {}", e);
                return CycleOutcome::Idle;
            }
        };

        self.dispatch(command).await
    }

    /// Detects a browser window closed by hand and tells the backend.
    async fn session_lost(&mut self) -> bool {
        let Some(page) = self.state.page() else {
            return false;
        };
        if !page.is_closed().await {
            return false;
        }

        warn!("browser window was closed, cleaning up session");
        self.sessions.teardown(&mut self.state).await;
        match self.backend.report_logout().await {
            Ok(()) => info!("logout reported to backend"),
            Err(e) => warn!("logout report failed: {}", e),
        }
        true
    }

    pub async fn dispatch(&mut self, command: Command) -> CycleOutcome {
        match command {
            Command::None => {
                debug!("no task");
                return CycleOutcome::Idle;
            }
            Command::Login {
                student_id,
                password,
            } => {
                info!(student_id = %student_id, "login requested");
                let report = self
                    .sessions
                    .login(&mut self.state, &student_id, &password)
                    .await;
                self.report(&report).await;
            }
            Command::StatePrompt { text } => {
                info!(prompt = %text, "state requested");
                let report = self.ui_state_report(text).await;
                self.report(&report).await;
            }
            Command::Action => self.handle_action().await,
            Command::VerificationRequest => return self.deliver_verification().await,
            Command::Shutdown | Command::Logout => {
                info!(
                    sessions = self.state.session_count(),
                    "closing browser on request"
                );
                self.sessions.teardown(&mut self.state).await;
            }
            Command::Unknown { raw } => {
                warn!(command = %raw, "unknown command");
                return CycleOutcome::Idle;
            }
        }
        CycleOutcome::Handled
    }

    async fn ui_state_report(&self, prompt: String) -> StateReport {
        let Some(page) = self.state.page() else {
            warn!("no browser open");
            return StateReport::NeedsLogin {
                success: false,
                needs_login: true,
                message: "browser is closed".to_string(),
                prompt: Some(prompt),
            };
        };
        if !self.state.login.logged_in {
            warn!("not logged in");
            return StateReport::NeedsLogin {
                success: false,
                needs_login: true,
                message: "please log in first".to_string(),
                prompt: Some(prompt),
            };
        }

        let ui_state = self.scanner.scan_ui_state(page.as_ref()).await;
        StateReport::UiState {
            success: true,
            prompt,
            student_id: self.state.login.student_id.clone(),
            logged_in: self.state.login.logged_in,
            last_url: self.state.login.last_url.clone(),
            message: "UI state update".to_string(),
            ui_state: Some(ui_state),
        }
    }

    async fn handle_action(&mut self) {
        let action = match self.backend.next_action().await {
            Ok(Some(action)) => action,
            Ok(None) => return,
            Err(e) => {
                warn!("could not fetch action: {}", e);
                return;
            }
        };

        match self.engine.execute(&mut self.state, action).await {
            ActionOutcome::NeedsLogin {
                message,
                action_description,
            } => {
                let report = StateReport::ActionUnavailable {
                    action_success: false,
                    needs_login: true,
                    message,
                    action_description,
                };
                self.report(&report).await;
            }
            ActionOutcome::Rejected(reason) => warn!("action rejected: {}", reason),
            ActionOutcome::Unsupported(_) | ActionOutcome::NoFurtherSteps | ActionOutcome::Executed => {}
        }
    }

    /// Posts the pending verification result. It is only cleared once the backend
    /// accepted it, so a failed post can be retried by the next request.
    /// An empty mailbox makes the cycle idle.
    async fn deliver_verification(&mut self) -> CycleOutcome {
        let Some(result) = self.state.verification.peek().cloned() else {
            warn!("verification requested but no result is pending");
            return CycleOutcome::Idle;
        };
        match self.backend.report_verification(&result).await {
            Ok(()) => {
                info!(success = result.success, message = %result.message, "verification delivered");
                self.state.verification.consume();
            }
            Err(e) => warn!("verification delivery failed: {}", e),
        }
        CycleOutcome::Handled
    }

    async fn report(&self, report: &StateReport) {
        if let Err(e) = self.backend.report_state(report).await {
            warn!("state report failed: {}", e);
        }
    }
}
