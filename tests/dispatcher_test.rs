mod common;

use common::{EventLog, FakeDriver, FakeElement, MockBackend, config_in, events, step};
use execution_web_agent::dispatcher::{CycleOutcome, Dispatcher};
use execution_web_agent::error::{BackendError, ProtocolError, TransportError};
use execution_web_agent::types::{
    Command, GeneratedAction, StateReport, Trajectory, TrajectorySource,
};
use serde_json::json;
use std::path::Path;
use std::sync::atomic::Ordering;
use tempfile::TempDir;

const TAB_PANEL: &str = "[role=\"tabpanel\"]";
const HEADING: &str = "h1, h2, h3, [role=heading]";

fn login_command() -> Command {
    Command::Login {
        student_id: "2021123456".into(),
        password: "pw".into(),
    }
}

fn write_login_trajectory(dir: &Path) {
    std::fs::write(
        dir.join("login.json"),
        json!([{"name": "goto", "args": {"url": "https://portal.example/main.do"}}]).to_string(),
    )
    .unwrap();
}

fn setup(backend: MockBackend, driver: FakeDriver) -> (TempDir, Dispatcher<MockBackend>) {
    let dir = tempfile::tempdir().unwrap();
    write_login_trajectory(dir.path());
    let dispatcher = Dispatcher::new(&config_in(dir.path()), backend, Box::new(driver));
    (dir, dispatcher)
}

#[tokio::test]
async fn login_command_reports_and_annotates_later_polls() {
    let backend = MockBackend::with_commands(vec![login_command()]);
    let (_dir, mut dispatcher) = setup(backend, FakeDriver::new(EventLog::default()));

    assert_eq!(dispatcher.run_cycle().await, CycleOutcome::Handled);
    assert_eq!(dispatcher.run_cycle().await, CycleOutcome::Idle);

    let backend = dispatcher.backend();
    assert_eq!(backend.polls(), [(false, 0), (true, 1)]);
    assert!(matches!(
        backend.states().as_slice(),
        [StateReport::Login { login_success: true, .. }]
    ));
    assert!(dispatcher.state().login.logged_in);
}

#[tokio::test]
async fn closed_window_is_cleaned_up_before_polling() {
    let log = EventLog::default();
    let driver = FakeDriver::new(log.clone());
    let page = driver.queue(driver.page(1));
    let backend = MockBackend::with_commands(vec![login_command()]);
    let (_dir, mut dispatcher) = setup(backend, driver);

    dispatcher.run_cycle().await;
    page.close_externally();

    assert_eq!(dispatcher.run_cycle().await, CycleOutcome::Idle);

    let backend = dispatcher.backend();
    assert_eq!(backend.logouts.load(Ordering::SeqCst), 1);
    assert_eq!(backend.polls().len(), 1);
    assert!(dispatcher.state().session.is_none());
    assert!(!dispatcher.state().login.logged_in);
    assert_eq!(events(&log), ["open 1", "close page 1", "close context 1"]);

    // the next cycle polls again, reporting no browser
    dispatcher.run_cycle().await;
    assert_eq!(dispatcher.backend().polls().last(), Some(&(false, 0)));
}

#[tokio::test]
async fn unreachable_backend_backs_off_and_bad_payloads_skip() {
    let backend = MockBackend::default();
    backend.push_error(TransportError::Connect("refused".into()).into());
    backend.push_error(TransportError::Malformed("not json".into()).into());
    backend.push_error(BackendError::Protocol(ProtocolError::NotAnObject));
    let (_dir, mut dispatcher) = setup(backend, FakeDriver::new(EventLog::default()));

    assert_eq!(dispatcher.run_cycle().await, CycleOutcome::Backoff);
    assert_eq!(dispatcher.run_cycle().await, CycleOutcome::Idle);
    assert_eq!(dispatcher.run_cycle().await, CycleOutcome::Idle);
    assert!(dispatcher.backend().states().is_empty());
}

#[tokio::test]
async fn state_prompt_without_session_asks_for_login() {
    let backend = MockBackend::with_commands(vec![Command::StatePrompt {
        text: "성적 보여줘".into(),
    }]);
    let (_dir, mut dispatcher) = setup(backend, FakeDriver::new(EventLog::default()));

    dispatcher.run_cycle().await;

    assert_eq!(
        dispatcher.backend().states(),
        [StateReport::NeedsLogin {
            success: false,
            needs_login: true,
            message: "browser is closed".into(),
            prompt: Some("성적 보여줘".into()),
        }]
    );
}

#[tokio::test]
async fn state_prompt_reports_scanned_ui_state() {
    let driver = FakeDriver::new(EventLog::default());
    driver.queue(driver.page(1).with(
        TAB_PANEL,
        vec![FakeElement::text("성적조회").child(HEADING, FakeElement::text("성적조회"))],
    ));
    let backend = MockBackend::with_commands(vec![
        login_command(),
        Command::StatePrompt {
            text: "성적 보여줘".into(),
        },
    ]);
    let (_dir, mut dispatcher) = setup(backend, driver);

    dispatcher.run_cycle().await;
    dispatcher.run_cycle().await;

    let states = dispatcher.backend().states();
    let payload = serde_json::to_value(&states[1]).unwrap();
    assert_eq!(payload["success"], true);
    assert_eq!(payload["prompt"], "성적 보여줘");
    assert_eq!(payload["student_id"], "2021123456");
    assert_eq!(payload["ui_state"]["url"], "https://portal.example/main.do");
    assert_eq!(payload["ui_state"]["current_page"]["title"], "성적조회");
    assert_eq!(
        payload["ui_state"]["current_page"]["form_fields"],
        "none recognized"
    );
}

#[tokio::test]
async fn action_without_session_reports_needs_login() {
    let backend = MockBackend::with_commands(vec![Command::Action]);
    backend.push_action(GeneratedAction::FullList {
        source: TrajectorySource::Inline(Trajectory {
            steps: vec![step("click", json!({"selector": "text=성적조회"}))],
            verification: None,
        }),
        description: "성적 조회".into(),
    });
    let (_dir, mut dispatcher) = setup(backend, FakeDriver::new(EventLog::default()));

    dispatcher.run_cycle().await;

    assert_eq!(
        dispatcher.backend().states(),
        [StateReport::ActionUnavailable {
            action_success: false,
            needs_login: true,
            message: "browser is closed, please log in again".into(),
            action_description: Some("성적조회".into()),
        }]
    );
}

#[tokio::test]
async fn verification_result_is_delivered_once() {
    let driver = FakeDriver::new(EventLog::default());
    driver.queue(driver.page(1).with(
        TAB_PANEL,
        vec![FakeElement::text("x").child(HEADING, FakeElement::text("성적조회"))],
    ));
    let backend = MockBackend::with_commands(vec![
        login_command(),
        Command::Action,
        Command::VerificationRequest,
        Command::VerificationRequest,
    ]);
    backend.push_action(GeneratedAction::FullList {
        source: TrajectorySource::Inline(Trajectory {
            steps: vec![step("click", json!({"selector": "text=성적조회"}))],
            verification: None,
        }),
        description: String::new(),
    });
    let (_dir, mut dispatcher) = setup(backend, driver);

    for _ in 0..3 {
        dispatcher.run_cycle().await;
    }
    assert_eq!(dispatcher.run_cycle().await, CycleOutcome::Idle);

    let delivered = dispatcher.backend().verifications();
    assert_eq!(delivered.len(), 1);
    assert!(delivered[0].success);
    assert_eq!(delivered[0].message, "성적조회");
    assert!(!dispatcher.state().verification.has_result());
}

#[tokio::test]
async fn verification_request_with_empty_mailbox_is_idle() {
    let backend = MockBackend::with_commands(vec![Command::VerificationRequest]);
    let (_dir, mut dispatcher) = setup(backend, FakeDriver::new(EventLog::default()));

    assert_eq!(dispatcher.run_cycle().await, CycleOutcome::Idle);
    assert!(dispatcher.backend().verifications().is_empty());
}

#[tokio::test]
async fn failed_delivery_keeps_the_result_for_retry() {
    let backend = MockBackend::with_commands(vec![
        login_command(),
        Command::Action,
        Command::VerificationRequest,
        Command::VerificationRequest,
    ]);
    backend.push_action(GeneratedAction::SingleStep {
        step: Some(step("hover", json!({"selector": "#menu"}))),
        description: String::new(),
        current_step: 1,
        total_steps: 2,
    });
    backend.reject_verification.store(true, Ordering::SeqCst);
    let (_dir, mut dispatcher) = setup(backend, FakeDriver::new(EventLog::default()));

    for _ in 0..3 {
        dispatcher.run_cycle().await;
    }
    assert!(dispatcher.state().verification.has_result());

    dispatcher
        .backend()
        .reject_verification
        .store(false, Ordering::SeqCst);
    dispatcher.run_cycle().await;

    let delivered = dispatcher.backend().verifications();
    assert_eq!(delivered.len(), 1);
    assert!(!delivered[0].success);
    assert_eq!(delivered[0].message, "action execution failed: unknown operation 'hover'");
}

#[tokio::test]
async fn shutdown_and_logout_close_the_browser() {
    let log = EventLog::default();
    let backend = MockBackend::with_commands(vec![
        login_command(),
        Command::Shutdown,
        Command::Logout,
        Command::Unknown {
            raw: json!({"type": "dance"}),
        },
    ]);
    let (_dir, mut dispatcher) = setup(backend, FakeDriver::new(log.clone()));

    for _ in 0..3 {
        assert_eq!(dispatcher.run_cycle().await, CycleOutcome::Handled);
    }
    assert_eq!(dispatcher.run_cycle().await, CycleOutcome::Idle);

    assert_eq!(events(&log), ["open 1", "close page 1", "close context 1"]);
    assert_eq!(
        dispatcher.backend().polls(),
        [(false, 0), (true, 1), (false, 0), (false, 0)]
    );
}

#[tokio::test]
async fn run_announces_and_tears_down_on_shutdown() {
    let log = EventLog::default();
    let backend = MockBackend::default();
    let (_dir, mut dispatcher) = setup(backend, FakeDriver::new(log.clone()));
    dispatcher.dispatch(login_command()).await;

    dispatcher.run(std::future::ready(())).await;

    assert_eq!(dispatcher.backend().announced.load(Ordering::SeqCst), 1);
    assert!(dispatcher.state().session.is_none());
    assert_eq!(events(&log), ["open 1", "close page 1", "close context 1"]);
}
