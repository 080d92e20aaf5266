use regex::Regex;
use std::path::PathBuf;
use std::sync::LazyLock;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::dom::PageScanner;
use crate::driver::Page;
use crate::error::{DriverError, VerificationError};
use crate::state::AgentState;
use crate::types::{
    ActionStep, GeneratedAction, Trajectory, TrajectorySource, VerificationMailbox,
    VerificationResult,
};

const GRID_STATE: &str = "grid";
const CLICK: &str = "click";
const CLICK_GRID: &str = "click_grid";

static NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"name=['"]([^'"]+)['"]"#).expect("static regex"));
static TEXT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"text=([^\]]+)").expect("static regex"));

/// Operation actually sent to the driver. Clicks inside a grid need the grid variant.
pub fn dispatch_name(step: &ActionStep) -> &str {
    if step.state.as_deref() == Some(GRID_STATE) && step.name == CLICK {
        CLICK_GRID
    } else {
        &step.name
    }
}

/// Runs exactly one step against the page, args untouched.
pub async fn run_step(page: &dyn Page, step: &ActionStep) -> Result<(), DriverError> {
    let operation = dispatch_name(step);
    if operation != step.name {
        debug!(from = %step.name, to = operation, "grid context remap");
    }
    page.run(operation, &step.args).await
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub success_count: usize,
    pub fail_count: usize,
}

/// Runs every step in order. A failing step is counted and skipped, never fatal.
pub async fn run_batch(page: &dyn Page, steps: &[ActionStep]) -> BatchReport {
    let mut report = BatchReport::default();
    for (idx, step) in steps.iter().enumerate() {
        info!(
            step = idx + 1,
            total = steps.len(),
            name = %step.name,
            state = step.state.as_deref().unwrap_or(""),
            "running step"
        );
        match run_step(page, step).await {
            Ok(()) => report.success_count += 1,
            Err(e) => {
                warn!(step = idx + 1, "step failed: {}", e);
                report.fail_count += 1;
            }
        }
    }
    if report.fail_count > 0 {
        warn!(
            succeeded = report.success_count,
            failed = report.fail_count,
            "trajectory finished with failures"
        );
    } else {
        info!(succeeded = report.success_count, "trajectory finished");
    }
    report
}

/// Which selector pattern wins when a selector carries both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternOrder {
    /// `name='...'` then `text=...`; used for the terminal step of a single-step run.
    NameFirst,
    /// `text=...` then `name='...'`; used for full trajectories.
    TextFirst,
}

/// Page title a click selector points at.
pub fn title_from_selector(selector: &str, order: PatternOrder) -> Option<String> {
    let (first, second) = match order {
        PatternOrder::NameFirst => (&*NAME_PATTERN, &*TEXT_PATTERN),
        PatternOrder::TextFirst => (&*TEXT_PATTERN, &*NAME_PATTERN),
    };
    first
        .captures(selector)
        .or_else(|| second.captures(selector))
        .map(|c| c[1].trim().to_string())
        .filter(|t| !t.is_empty())
}

fn title_from_step(step: &ActionStep, order: PatternOrder) -> Option<String> {
    if step.name != CLICK {
        return None;
    }
    step.selector().and_then(|s| title_from_selector(s, order))
}

/// Title implied by the last click of a batch that names one.
pub fn last_click_title(steps: &[ActionStep]) -> Option<String> {
    steps
        .iter()
        .rev()
        .find_map(|step| title_from_step(step, PatternOrder::TextFirst))
}

/// Compares the expected title against what the page shows.
///
/// Containment is checked in both directions. With no expectation the run is
/// judged on its own step failures.
pub fn judge(expected: &str, actual: &str, step_failed: bool) -> VerificationResult {
    let expected = expected.trim();
    let actual = actual.trim();

    if expected.is_empty() {
        let success = !step_failed;
        let message = if success {
            "all actions executed"
        } else {
            "some actions failed"
        };
        return VerificationResult {
            success,
            message: message.to_string(),
        };
    }

    let success = !actual.is_empty() && (actual.contains(expected) || expected.contains(actual));
    VerificationResult {
        success,
        message: expected.to_string(),
    }
}

/// Result of handling one `action` command.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    /// The backend has nothing left to run.
    NoFurtherSteps,
    Executed,
    /// No usable session; the backend must log in again.
    NeedsLogin {
        message: String,
        action_description: Option<String>,
    },
    Unsupported(String),
    /// The action could not be started (e.g. its trajectory file is missing).
    Rejected(String),
}

pub struct ActionEngine {
    scanner: PageScanner,
    trajectory_dir: PathBuf,
}

impl ActionEngine {
    pub fn new(scanner: PageScanner, config: &AgentConfig) -> Self {
        Self {
            scanner,
            trajectory_dir: config.trajectory_dir.clone(),
        }
    }

    pub async fn execute(&self, state: &mut AgentState, action: GeneratedAction) -> ActionOutcome {
        match action {
            GeneratedAction::SingleStep {
                step,
                description,
                current_step,
                total_steps,
            } => {
                let Some(step) = step else {
                    info!(description = %description, "no further steps to run");
                    return ActionOutcome::NoFurtherSteps;
                };
                info!(current_step, total_steps, description = %description, "single step");
                self.execute_single(state, &step, &description).await
            }
            GeneratedAction::FullList {
                source,
                description,
            } => {
                let trajectory = match source {
                    TrajectorySource::Inline(trajectory) => trajectory,
                    TrajectorySource::File(path) => {
                        match Trajectory::from_file(&self.trajectory_dir.join(path)) {
                            Ok(trajectory) => trajectory,
                            Err(e) => {
                                warn!("{}", e);
                                return ActionOutcome::Rejected(e.to_string());
                            }
                        }
                    }
                };
                self.execute_full(state, trajectory, &description).await
            }
            GeneratedAction::Other { kind } => {
                info!(kind = %kind, "action type not supported");
                ActionOutcome::Unsupported(kind)
            }
        }
    }

    async fn execute_single(
        &self,
        state: &mut AgentState,
        step: &ActionStep,
        description: &str,
    ) -> ActionOutcome {
        let Some(page) = state.page() else {
            warn!("no open browser for action");
            return ActionOutcome::NeedsLogin {
                message: "browser is closed, please log in again".to_string(),
                action_description: None,
            };
        };

        let terminal = step.is_terminal();
        if terminal {
            info!("terminal step (status FINISH)");
        }

        let step_result = run_step(page.as_ref(), step).await;
        if let Err(e) = &step_result {
            warn!(name = %step.name, "step failed: {}", e);
        }

        if terminal {
            let expected = title_from_step(step, PatternOrder::NameFirst)
                .unwrap_or_else(|| description.to_string());
            self.verify(
                page.as_ref(),
                &expected,
                step_result.is_err(),
                &mut state.verification,
            )
            .await;
        } else if let Err(e) = step_result {
            state
                .verification
                .store(false, format!("action execution failed: {e}"));
        }
        ActionOutcome::Executed
    }

    async fn execute_full(
        &self,
        state: &mut AgentState,
        trajectory: Trajectory,
        description: &str,
    ) -> ActionOutcome {
        let purpose = last_click_title(&trajectory.steps).unwrap_or_else(|| description.to_string());

        let Some(page) = state.page() else {
            warn!("no open browser; login required before running trajectory");
            return ActionOutcome::NeedsLogin {
                message: "browser is closed, please log in again".to_string(),
                action_description: Some(purpose),
            };
        };
        if page.is_closed().await {
            warn!("page is closed; cannot run trajectory");
            return ActionOutcome::NeedsLogin {
                message: "page session has ended, please log in again".to_string(),
                action_description: Some(purpose),
            };
        }

        info!(purpose = %purpose, steps = trajectory.steps.len(), "running trajectory");
        let report = run_batch(page.as_ref(), &trajectory.steps).await;

        let expected = match &trajectory.verification {
            Some(descriptor) => descriptor.expected_text.clone(),
            None => purpose.clone(),
        };
        self.verify(
            page.as_ref(),
            &expected,
            report.fail_count > 0,
            &mut state.verification,
        )
        .await;
        ActionOutcome::Executed
    }

    /// Scans the page and stores the verdict in the mailbox. Never fails.
    pub async fn verify(
        &self,
        page: &dyn Page,
        expected: &str,
        step_failed: bool,
        mailbox: &mut VerificationMailbox,
    ) {
        let scanned = self
            .scanner
            .try_scan_current_page(page)
            .await
            .map_err(VerificationError::from);

        let result = match scanned {
            Ok(current) => {
                let result = judge(expected, &current.title, step_failed);
                info!(
                    expected = %expected.trim(),
                    actual = %current.title,
                    success = result.success,
                    "verification"
                );
                result
            }
            Err(e) => {
                warn!("verification failed: {}", e);
                VerificationResult {
                    success: false,
                    message: format!("verification error: {e}"),
                }
            }
        };
        mailbox.store(result.success, result.message);
    }
}
