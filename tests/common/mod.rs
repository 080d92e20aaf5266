#![allow(dead_code)]

use async_trait::async_trait;
use execution_web_agent::brain::Backend;
use execution_web_agent::config::AgentConfig;
use execution_web_agent::driver::{BrowsingContext, Driver, Element, Page, Session};
use execution_web_agent::error::{BackendError, DriverError, Result, TransportError};
use execution_web_agent::types::{
    ActionStep, Command, GeneratedAction, StateReport, StepArgs, VerificationResult,
};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub type EventLog = Arc<Mutex<Vec<String>>>;

pub fn events(log: &EventLog) -> Vec<String> {
    log.lock().unwrap().clone()
}

pub fn step(name: &str, args: Value) -> ActionStep {
    ActionStep::new(name, as_args(args))
}

pub fn as_args(value: Value) -> StepArgs {
    match value {
        Value::Object(map) => map,
        other => panic!("step args must be an object, got {other}"),
    }
}

pub fn config_in(dir: &Path) -> AgentConfig {
    AgentConfig {
        login_trajectory: dir.join("login.json"),
        trajectory_dir: dir.to_path_buf(),
        ..AgentConfig::default()
    }
}

#[derive(Clone, Default)]
pub struct FakeElement {
    pub text: String,
    pub hidden: bool,
    pub attributes: HashMap<String, String>,
    pub properties: HashMap<String, String>,
    pub label: Option<String>,
    pub children: HashMap<String, Vec<FakeElement>>,
    pub broken: bool,
}

impl FakeElement {
    pub fn text(text: &str) -> Self {
        Self {
            text: text.to_string(),
            ..Default::default()
        }
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    pub fn attr(mut self, name: &str, value: &str) -> Self {
        self.attributes.insert(name.to_string(), value.to_string());
        self
    }

    pub fn prop(mut self, name: &str, value: &str) -> Self {
        self.properties.insert(name.to_string(), value.to_string());
        self
    }

    pub fn labelled(mut self, label: &str) -> Self {
        self.label = Some(label.to_string());
        self
    }

    pub fn child(mut self, selector: &str, child: FakeElement) -> Self {
        self.children
            .entry(selector.to_string())
            .or_default()
            .push(child);
        self
    }

    /// Every read fails, like a handle that went stale mid-scan.
    pub fn broken(mut self) -> Self {
        self.broken = true;
        self
    }

    fn check(&self) -> Result<()> {
        if self.broken {
            Err(DriverError::ElementNotFound("stale".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Element for FakeElement {
    async fn is_visible(&self) -> Result<bool> {
        self.check()?;
        Ok(!self.hidden)
    }

    async fn inner_text(&self) -> Result<String> {
        self.check()?;
        Ok(self.text.clone())
    }

    async fn attribute(&self, name: &str) -> Result<Option<String>> {
        self.check()?;
        Ok(self.attributes.get(name).cloned())
    }

    async fn property(&self, name: &str) -> Result<Option<String>> {
        self.check()?;
        Ok(self.properties.get(name).cloned())
    }

    async fn label_text(&self) -> Result<Option<String>> {
        self.check()?;
        Ok(self.label.clone())
    }

    async fn locate_all(&self, selector: &str) -> Result<Vec<Box<dyn Element>>> {
        self.check()?;
        Ok(boxed(self.children.get(selector)))
    }
}

fn boxed(elements: Option<&Vec<FakeElement>>) -> Vec<Box<dyn Element>> {
    elements
        .map(|els| {
            els.iter()
                .cloned()
                .map(|e| Box::new(e) as Box<dyn Element>)
                .collect()
        })
        .unwrap_or_default()
}

/// How a fake page or context answers `close`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CloseBehavior {
    #[default]
    Succeed,
    Cancel,
    Fail,
    Hang,
}

impl CloseBehavior {
    async fn apply(self) -> Result<()> {
        match self {
            CloseBehavior::Succeed => Ok(()),
            CloseBehavior::Cancel => Err(DriverError::Cancelled),
            CloseBehavior::Fail => Err(DriverError::Script("target crashed".into())),
            CloseBehavior::Hang => std::future::pending().await,
        }
    }
}

/// An in-memory page. Selectors map straight to element lists.
pub struct FakePage {
    pub id: usize,
    url: Mutex<String>,
    elements: Mutex<HashMap<String, Vec<FakeElement>>>,
    failing_selectors: HashSet<String>,
    unreadable_selectors: HashSet<String>,
    closed: AtomicBool,
    on_close: CloseBehavior,
    calls: Mutex<Vec<(String, StepArgs)>>,
    log: EventLog,
}

impl FakePage {
    pub fn new(id: usize, log: EventLog) -> Self {
        Self {
            id,
            url: Mutex::new("about:blank".into()),
            elements: Mutex::new(HashMap::new()),
            failing_selectors: HashSet::new(),
            unreadable_selectors: HashSet::new(),
            closed: AtomicBool::new(false),
            on_close: CloseBehavior::Succeed,
            calls: Mutex::new(Vec::new()),
            log,
        }
    }

    pub fn standalone() -> Self {
        Self::new(0, EventLog::default())
    }

    pub fn with(self, selector: &str, elements: Vec<FakeElement>) -> Self {
        self.elements
            .lock()
            .unwrap()
            .insert(selector.to_string(), elements);
        self
    }

    /// Steps targeting this selector fail.
    pub fn failing(mut self, selector: &str) -> Self {
        self.failing_selectors.insert(selector.to_string());
        self
    }

    /// `locate_all` on this selector fails.
    pub fn unreadable(mut self, selector: &str) -> Self {
        self.unreadable_selectors.insert(selector.to_string());
        self
    }

    pub fn closing(mut self, behavior: CloseBehavior) -> Self {
        self.on_close = behavior;
        self
    }

    pub fn set_elements(&self, selector: &str, elements: Vec<FakeElement>) {
        self.elements
            .lock()
            .unwrap()
            .insert(selector.to_string(), elements);
    }

    /// Simulates the user closing the window.
    pub fn close_externally(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<(String, StepArgs)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn operations(&self) -> Vec<String> {
        self.calls().into_iter().map(|(op, _)| op).collect()
    }
}

#[async_trait]
impl Page for FakePage {
    async fn url(&self) -> Result<String> {
        if self.closed() {
            return Err(DriverError::Closed);
        }
        Ok(self.url.lock().unwrap().clone())
    }

    async fn is_closed(&self) -> bool {
        self.closed()
    }

    async fn locate_all(&self, selector: &str) -> Result<Vec<Box<dyn Element>>> {
        if self.closed() {
            return Err(DriverError::Closed);
        }
        if self.unreadable_selectors.contains(selector) {
            return Err(DriverError::Script(format!("cannot query {selector}")));
        }
        Ok(boxed(self.elements.lock().unwrap().get(selector)))
    }

    async fn run(&self, operation: &str, args: &StepArgs) -> Result<()> {
        if self.closed() {
            return Err(DriverError::Closed);
        }
        self.calls
            .lock()
            .unwrap()
            .push((operation.to_string(), args.clone()));

        let selector = args.get("selector").and_then(Value::as_str);
        if let Some(selector) = selector {
            if self.failing_selectors.contains(selector) {
                return Err(DriverError::Timeout(format!("selector '{selector}'")));
            }
        }
        match operation {
            "goto" => {
                let url = args.get("url").and_then(Value::as_str).unwrap_or_default();
                *self.url.lock().unwrap() = url.to_string();
                Ok(())
            }
            "click" | "click_grid" | "fill" | "press" | "select_option" | "wait_for_selector"
            | "wait_for_timeout" => Ok(()),
            other => Err(DriverError::UnknownOperation(other.to_string())),
        }
    }

    async fn close(&self) -> Result<()> {
        self.log.lock().unwrap().push(format!("close page {}", self.id));
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(DriverError::Closed);
        }
        self.on_close.apply().await
    }
}

pub struct FakeContext {
    id: usize,
    on_close: CloseBehavior,
    log: EventLog,
}

#[async_trait]
impl BrowsingContext for FakeContext {
    async fn close(&self) -> Result<()> {
        self.log
            .lock()
            .unwrap()
            .push(format!("close context {}", self.id));
        self.on_close.apply().await
    }
}

/// Hands out pre-built pages in order and records every open and close.
pub struct FakeDriver {
    pub log: EventLog,
    pages: Mutex<VecDeque<Arc<FakePage>>>,
    opened: AtomicUsize,
    pub fail_launch: bool,
    pub context_close: CloseBehavior,
}

impl FakeDriver {
    pub fn new(log: EventLog) -> Self {
        Self {
            log,
            pages: Mutex::new(VecDeque::new()),
            opened: AtomicUsize::new(0),
            fail_launch: false,
            context_close: CloseBehavior::Succeed,
        }
    }

    /// Queues a page for the next `open`. Returns a handle for assertions.
    pub fn queue(&self, page: FakePage) -> Arc<FakePage> {
        let page = Arc::new(page);
        self.pages.lock().unwrap().push_back(Arc::clone(&page));
        page
    }

    pub fn page(&self, id: usize) -> FakePage {
        FakePage::new(id, Arc::clone(&self.log))
    }
}

#[async_trait]
impl Driver for FakeDriver {
    async fn open(&self) -> Result<Session> {
        if self.fail_launch {
            return Err(DriverError::Launch("no chrome".into()));
        }
        let n = self.opened.fetch_add(1, Ordering::SeqCst) + 1;
        let page = self
            .pages
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Arc::new(FakePage::new(n, Arc::clone(&self.log))));
        self.log.lock().unwrap().push(format!("open {}", page.id));
        let context = Arc::new(FakeContext {
            id: page.id,
            on_close: self.context_close,
            log: Arc::clone(&self.log),
        });
        Ok(Session::new(page, context))
    }
}

/// Scripted backend that records everything posted to it.
#[derive(Default)]
pub struct MockBackend {
    pub commands: Mutex<VecDeque<std::result::Result<Command, BackendError>>>,
    pub actions: Mutex<VecDeque<Option<GeneratedAction>>>,
    pub states: Mutex<Vec<StateReport>>,
    pub verifications: Mutex<Vec<VerificationResult>>,
    pub polls: Mutex<Vec<(bool, usize)>>,
    pub logouts: AtomicUsize,
    pub announced: AtomicUsize,
    pub reject_verification: AtomicBool,
}

impl MockBackend {
    pub fn with_commands(commands: Vec<Command>) -> Self {
        let backend = Self::default();
        backend
            .commands
            .lock()
            .unwrap()
            .extend(commands.into_iter().map(Ok));
        backend
    }

    pub fn push_command(&self, command: Command) {
        self.commands.lock().unwrap().push_back(Ok(command));
    }

    pub fn push_error(&self, error: BackendError) {
        self.commands.lock().unwrap().push_back(Err(error));
    }

    pub fn push_action(&self, action: GeneratedAction) {
        self.actions.lock().unwrap().push_back(Some(action));
    }

    pub fn states(&self) -> Vec<StateReport> {
        self.states.lock().unwrap().clone()
    }

    pub fn verifications(&self) -> Vec<VerificationResult> {
        self.verifications.lock().unwrap().clone()
    }

    pub fn polls(&self) -> Vec<(bool, usize)> {
        self.polls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn announce_start(&self) -> std::result::Result<(), TransportError> {
        self.announced.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn next_command(
        &self,
        browser_running: bool,
        browser_count: usize,
    ) -> std::result::Result<Command, BackendError> {
        self.polls
            .lock()
            .unwrap()
            .push((browser_running, browser_count));
        self.commands
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(Command::None))
    }

    async fn next_action(&self) -> std::result::Result<Option<GeneratedAction>, BackendError> {
        Ok(self.actions.lock().unwrap().pop_front().flatten())
    }

    async fn report_state(&self, report: &StateReport) -> std::result::Result<(), TransportError> {
        self.states.lock().unwrap().push(report.clone());
        Ok(())
    }

    async fn report_verification(
        &self,
        result: &VerificationResult,
    ) -> std::result::Result<(), TransportError> {
        if self.reject_verification.load(Ordering::SeqCst) {
            return Err(TransportError::Status {
                status: 503,
                body: "busy".into(),
            });
        }
        self.verifications.lock().unwrap().push(result.clone());
        Ok(())
    }

    async fn report_logout(&self) -> std::result::Result<(), TransportError> {
        self.logouts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
