//! Headless Chrome implementation of the driver traits.
//!
//! `headless_chrome` is synchronous, so every call runs on the blocking pool.
//! Elements are addressed by a `data-agent-ref` attribute stamped onto them when
//! they are located; a handle is just that ref plus the tab it lives in.

use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use headless_chrome::{Browser, LaunchOptions, Tab};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::driver::{BrowsingContext, Driver, Element, Page, Session};
use crate::error::{DriverError, Result};
use crate::types::StepArgs;

const DEFAULT_WAIT: Duration = Duration::from_secs(30);
const POLL_STEP: Duration = Duration::from_millis(100);
// The agent sits idle between commands for long stretches.
const IDLE_BROWSER_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Selector engine shared by every lookup. Supports `text=...`,
/// `role=X[name='...']`, plain CSS, and `>>` chaining of the three.
const SELECTOR_PRELUDE: &str = r#"
function __agentQuery(root, part) {
  part = part.trim();
  if (part.startsWith('text=')) {
    const wanted = part.slice(5).trim().replace(/^["']|["']$/g, '');
    const hits = [...root.querySelectorAll('*')]
      .filter(e => (e.innerText || e.textContent || '').trim().includes(wanted));
    return hits.filter(e => ![...e.children].some(c => hits.includes(c)));
  }
  const role = part.match(/^role=([\w-]+)(?:\[name=['"](.+)['"]\])?$/);
  if (role) {
    const implicit = {
      button: 'button,input[type=button],input[type=submit]',
      link: 'a[href]',
      textbox: 'input:not([type]),input[type=text],input[type=password],textarea',
      checkbox: 'input[type=checkbox]',
      combobox: 'select',
      heading: 'h1,h2,h3,h4,h5,h6',
    };
    const css = '[role="' + role[1] + '"]' + (implicit[role[1]] ? ',' + implicit[role[1]] : '');
    return [...root.querySelectorAll(css)].filter(e => {
      if (!role[2]) return true;
      const name = (e.getAttribute('aria-label') || e.innerText || e.value || e.placeholder || '').trim();
      return name.includes(role[2]);
    });
  }
  return [...root.querySelectorAll(part)];
}
function __agentResolve(root, selector) {
  let scope = [root];
  for (const part of selector.split('>>')) {
    const next = [];
    for (const s of scope) for (const e of __agentQuery(s, part)) if (!next.includes(e)) next.push(e);
    scope = next;
  }
  return scope;
}
function __agentStamp(el) {
  if (!el.dataset.agentRef) {
    window.__agentRefSeq = (window.__agentRefSeq || 0) + 1;
    el.dataset.agentRef = 'r' + window.__agentRefSeq;
  }
  return el.dataset.agentRef;
}
function __agentVisible(el) {
  if (!el.getClientRects().length) return false;
  const s = getComputedStyle(el);
  return s.display !== 'none' && s.visibility !== 'hidden' && s.opacity !== '0';
}
"#;

/// Every script answers with `JSON.stringify` of this shape.
#[derive(Deserialize, Debug, Default)]
struct Reply {
    #[serde(default)]
    stale: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    value: Value,
}

/// Launches a Chrome with the agent's persistent profile for each session.
pub struct ChromeDriver {
    headless: bool,
    chrome_path: Option<PathBuf>,
    profile_dir: PathBuf,
}

impl ChromeDriver {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            headless: config.headless,
            chrome_path: config.chrome_path.clone(),
            profile_dir: config.profile_dir(),
        }
    }
}

#[async_trait]
impl Driver for ChromeDriver {
    async fn open(&self) -> Result<Session> {
        let headless = self.headless;
        let chrome_path = self.chrome_path.clone().or_else(find_chrome);
        let profile_dir = self.profile_dir.clone();

        let (browser, tab) = blocking(move || {
            std::fs::create_dir_all(&profile_dir)?;
            let options = LaunchOptions {
                headless,
                path: chrome_path,
                user_data_dir: Some(profile_dir),
                args: vec![
                    OsStr::new("--no-first-run"),
                    OsStr::new("--no-default-browser-check"),
                    OsStr::new("--disable-blink-features=AutomationControlled"),
                    OsStr::new("--disable-infobars"),
                    OsStr::new("--password-store=basic"),
                ],
                idle_browser_timeout: IDLE_BROWSER_TIMEOUT,
                ..Default::default()
            };
            let browser = Browser::new(options)?;
            let tab = browser.new_tab()?;
            tab.navigate_to("about:blank")?;
            Ok((browser, tab))
        })
        .await
        .map_err(|e| DriverError::Launch(e.to_string()))?;

        info!(headless, "chrome ready");
        let page = Arc::new(ChromePage::new(Arc::clone(&tab)));
        let context = Arc::new(ChromeContext {
            browser: Mutex::new(Some(browser)),
        });
        Ok(Session::new(page, context))
    }
}

/// Owns the browser process. Dropping the browser kills it.
pub struct ChromeContext {
    browser: Mutex<Option<Browser>>,
}

#[async_trait]
impl BrowsingContext for ChromeContext {
    async fn close(&self) -> Result<()> {
        let browser = self
            .browser
            .lock()
            .map_err(|_| DriverError::Operation("browser handle poisoned".into()))?
            .take()
            .ok_or(DriverError::Closed)?;

        blocking(move || {
            let tabs: Vec<Arc<Tab>> = match browser.get_tabs().lock() {
                Ok(tabs) => tabs.clone(),
                Err(_) => Vec::new(),
            };
            for tab in tabs {
                if let Err(e) = tab.close(false) {
                    debug!("tab close during shutdown: {}", e);
                }
            }
            drop(browser);
            Ok(())
        })
        .await
    }
}

pub struct ChromePage {
    tab: Arc<Tab>,
    closed: AtomicBool,
}

impl ChromePage {
    fn new(tab: Arc<Tab>) -> Self {
        Self {
            tab,
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(DriverError::Closed)
        } else {
            Ok(())
        }
    }

    /// Polls until `selector` matches a visible element and returns its ref.
    async fn wait_for(&self, selector: &str, limit: Duration) -> Result<String> {
        let deadline = Instant::now() + limit;
        let body = format!(
            "const hit = __agentResolve(document, {}).find(__agentVisible);\n\
             return JSON.stringify({{value: hit ? __agentStamp(hit) : null}});",
            js_string(selector)
        );
        loop {
            let reply = evaluate(&self.tab, &body).await?;
            if let Value::String(reference) = reply.value {
                return Ok(reference);
            }
            if Instant::now() >= deadline {
                return Err(DriverError::Timeout(format!("selector '{selector}'")));
            }
            tokio::time::sleep(POLL_STEP).await;
        }
    }

    /// Runs `body` with `el` bound to the element carrying `reference`.
    async fn on_element(&self, reference: &str, body: &str) -> Result<Value> {
        let script = format!(
            "const el = document.querySelector({});\n\
             if (!el) return JSON.stringify({{stale: true}});\n{}",
            js_string(&ref_selector(reference)),
            body
        );
        let reply = evaluate(&self.tab, &script).await?;
        if reply.stale {
            return Err(DriverError::ElementNotFound(reference.to_string()));
        }
        if let Some(error) = reply.error {
            return Err(DriverError::Operation(error));
        }
        Ok(reply.value)
    }

    async fn click(&self, selector: &str, limit: Duration) -> Result<()> {
        let reference = self.wait_for(selector, limit).await?;
        let tab = Arc::clone(&self.tab);
        blocking(move || {
            tab.find_element(&ref_selector(&reference))?.click()?;
            Ok(())
        })
        .await
    }

    /// Grid cells ignore synthetic `click()`; they need the full pointer sequence.
    async fn click_grid(&self, selector: &str, limit: Duration) -> Result<()> {
        let reference = self.wait_for(selector, limit).await?;
        self.on_element(
            &reference,
            r#"el.scrollIntoView({block: 'center'});
const r = el.getBoundingClientRect();
const init = {bubbles: true, cancelable: true, view: window,
  clientX: r.left + r.width / 2, clientY: r.top + r.height / 2};
el.dispatchEvent(new PointerEvent('pointerdown', init));
el.dispatchEvent(new MouseEvent('mousedown', init));
el.dispatchEvent(new PointerEvent('pointerup', init));
el.dispatchEvent(new MouseEvent('mouseup', init));
el.dispatchEvent(new MouseEvent('click', init));
return JSON.stringify({value: true});"#,
        )
        .await?;
        Ok(())
    }

    async fn fill(&self, selector: &str, value: &str, limit: Duration) -> Result<()> {
        let reference = self.wait_for(selector, limit).await?;
        let body = format!(
            "el.focus();\n\
             const proto = Object.getPrototypeOf(el);\n\
             const setter = Object.getOwnPropertyDescriptor(proto, 'value');\n\
             if (setter && setter.set) setter.set.call(el, {value}); else el.value = {value};\n\
             el.dispatchEvent(new Event('input', {{bubbles: true}}));\n\
             el.dispatchEvent(new Event('change', {{bubbles: true}}));\n\
             return JSON.stringify({{value: true}});",
            value = js_string(value)
        );
        self.on_element(&reference, &body).await?;
        Ok(())
    }

    async fn press(&self, selector: Option<&str>, key: &str, limit: Duration) -> Result<()> {
        if let Some(selector) = selector {
            let reference = self.wait_for(selector, limit).await?;
            self.on_element(&reference, "el.focus(); return JSON.stringify({value: true});")
                .await?;
        }
        let tab = Arc::clone(&self.tab);
        let key = key.to_string();
        blocking(move || {
            tab.press_key(&key)?;
            Ok(())
        })
        .await
    }

    async fn select_option(&self, selector: &str, wanted: &str, limit: Duration) -> Result<()> {
        let reference = self.wait_for(selector, limit).await?;
        let body = format!(
            "const wanted = {};\n\
             const opt = [...el.options].find(o => o.value === wanted || o.text.trim() === wanted);\n\
             if (!opt) return JSON.stringify({{error: 'no option ' + wanted}});\n\
             el.value = opt.value;\n\
             el.dispatchEvent(new Event('input', {{bubbles: true}}));\n\
             el.dispatchEvent(new Event('change', {{bubbles: true}}));\n\
             return JSON.stringify({{value: true}});",
            js_string(wanted)
        );
        self.on_element(&reference, &body).await?;
        Ok(())
    }

    async fn goto(&self, url: &str) -> Result<()> {
        let tab = Arc::clone(&self.tab);
        let url = url.to_string();
        blocking(move || {
            tab.navigate_to(&url)?.wait_until_navigated()?;
            Ok(())
        })
        .await
    }

    async fn locate(&self, root: Option<&str>, selector: &str) -> Result<Vec<Box<dyn Element>>> {
        let root_expr = match root {
            Some(reference) => format!("document.querySelector({})", js_string(&ref_selector(reference))),
            None => "document".to_string(),
        };
        let body = format!(
            "const root = {root_expr};\n\
             if (!root) return JSON.stringify({{stale: true}});\n\
             return JSON.stringify({{value: __agentResolve(root, {}).map(__agentStamp)}});",
            js_string(selector)
        );
        let reply = evaluate(&self.tab, &body).await?;
        if reply.stale {
            return Err(DriverError::ElementNotFound(root.unwrap_or_default().to_string()));
        }
        let refs: Vec<String> = serde_json::from_value(reply.value)?;
        Ok(refs
            .into_iter()
            .map(|reference| {
                Box::new(ChromeElement {
                    tab: Arc::clone(&self.tab),
                    reference,
                }) as Box<dyn Element>
            })
            .collect())
    }
}

#[async_trait]
impl Page for ChromePage {
    async fn url(&self) -> Result<String> {
        self.ensure_open()?;
        Ok(self.tab.get_url())
    }

    async fn is_closed(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return true;
        }
        let tab = Arc::clone(&self.tab);
        let check = blocking(move || {
            tab.evaluate("1", false)?;
            Ok(())
        })
        .await;
        check.is_err()
    }

    async fn locate_all(&self, selector: &str) -> Result<Vec<Box<dyn Element>>> {
        self.ensure_open()?;
        self.locate(None, selector).await
    }

    async fn run(&self, operation: &str, args: &StepArgs) -> Result<()> {
        self.ensure_open()?;
        let limit = wait_limit(args);
        match operation {
            "goto" | "navigate" => self.goto(required(operation, args, "url")?).await,
            "click" => self.click(required(operation, args, "selector")?, limit).await,
            "click_grid" => {
                self.click_grid(required(operation, args, "selector")?, limit)
                    .await
            }
            "fill" => {
                let selector = required(operation, args, "selector")?;
                let value = text_arg(args, &["value", "text"]).ok_or_else(|| {
                    DriverError::MissingArgument {
                        operation: operation.to_string(),
                        argument: "value",
                    }
                })?;
                self.fill(selector, &value, limit).await
            }
            "press" => {
                let key = required(operation, args, "key")?;
                self.press(str_arg(args, "selector"), key, limit).await
            }
            "select_option" => {
                let selector = required(operation, args, "selector")?;
                let wanted = text_arg(args, &["value", "label"]).ok_or_else(|| {
                    DriverError::MissingArgument {
                        operation: operation.to_string(),
                        argument: "value",
                    }
                })?;
                self.select_option(selector, &wanted, limit).await
            }
            "wait_for_selector" => {
                self.wait_for(required(operation, args, "selector")?, limit)
                    .await
                    .map(|_| ())
            }
            "wait" | "wait_for_timeout" => {
                let ms = ["timeout", "ms"]
                    .iter()
                    .find_map(|k| args.get(*k).and_then(Value::as_u64))
                    .ok_or_else(|| DriverError::MissingArgument {
                        operation: operation.to_string(),
                        argument: "timeout",
                    })?;
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(())
            }
            other => Err(DriverError::UnknownOperation(other.to_string())),
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(DriverError::Closed);
        }
        let tab = Arc::clone(&self.tab);
        blocking(move || {
            tab.close(true)?;
            Ok(())
        })
        .await
    }
}

pub struct ChromeElement {
    tab: Arc<Tab>,
    reference: String,
}

impl ChromeElement {
    async fn read(&self, expr: &str) -> Result<Value> {
        let script = format!(
            "const el = document.querySelector({});\n\
             if (!el) return JSON.stringify({{stale: true}});\n\
             return JSON.stringify({{value: {expr}}});",
            js_string(&ref_selector(&self.reference))
        );
        let reply = evaluate(&self.tab, &script).await?;
        if reply.stale {
            return Err(DriverError::ElementNotFound(self.reference.clone()));
        }
        Ok(reply.value)
    }

    async fn read_string(&self, expr: &str) -> Result<Option<String>> {
        Ok(match self.read(expr).await? {
            Value::Null => None,
            Value::String(s) => Some(s),
            other => Some(other.to_string()),
        })
    }
}

#[async_trait]
impl Element for ChromeElement {
    async fn is_visible(&self) -> Result<bool> {
        Ok(self.read("__agentVisible(el)").await?.as_bool().unwrap_or(false))
    }

    async fn inner_text(&self) -> Result<String> {
        Ok(self
            .read_string("el.innerText || el.textContent || ''")
            .await?
            .unwrap_or_default())
    }

    async fn attribute(&self, name: &str) -> Result<Option<String>> {
        self.read_string(&format!("el.getAttribute({})", js_string(name)))
            .await
    }

    async fn property(&self, name: &str) -> Result<Option<String>> {
        self.read_string(&format!(
            "(v => v === undefined || v === null ? null : String(v))(el[{}])",
            js_string(name)
        ))
        .await
    }

    async fn label_text(&self) -> Result<Option<String>> {
        self.read_string("el.labels && el.labels.length ? el.labels[0].innerText.trim() : null")
            .await
    }

    async fn locate_all(&self, selector: &str) -> Result<Vec<Box<dyn Element>>> {
        let page = ChromePage::new(Arc::clone(&self.tab));
        page.locate(Some(&self.reference), selector).await
    }
}

/// Runs a blocking `headless_chrome` call off the async runtime.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result.map_err(classify),
        Err(e) if e.is_cancelled() => Err(DriverError::Cancelled),
        Err(e) => Err(DriverError::Operation(format!("driver task failed: {e}"))),
    }
}

/// Evaluates `body` inside a function scope that has the selector prelude.
async fn evaluate(tab: &Arc<Tab>, body: &str) -> Result<Reply> {
    let script = format!("(() => {{\n{SELECTOR_PRELUDE}\n{body}\n}})()");
    let tab = Arc::clone(tab);
    let raw = blocking(move || {
        let result = tab.evaluate(&script, false)?;
        match result.value {
            Some(Value::String(s)) => Ok(s),
            other => anyhow::bail!("script returned {:?}", other),
        }
    })
    .await
    .map_err(|e| match e {
        DriverError::Operation(msg) => DriverError::Script(msg),
        other => other,
    })?;
    Ok(serde_json::from_str(&raw)?)
}

fn classify(e: anyhow::Error) -> DriverError {
    let message = format!("{e:#}");
    if message.contains("connection is closed") || message.contains("No target with given id") {
        DriverError::Closed
    } else if message.contains("timed out") || message.contains("Timeout") || message.contains("never came") {
        DriverError::Timeout(message)
    } else {
        DriverError::Operation(message)
    }
}

fn ref_selector(reference: &str) -> String {
    format!("[data-agent-ref=\"{reference}\"]")
}

/// A JSON string literal is a valid JS string literal.
fn js_string(s: &str) -> String {
    Value::String(s.to_string()).to_string()
}

fn str_arg<'a>(args: &'a StepArgs, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str)
}

fn text_arg(args: &StepArgs, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| match args.get(*k)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn required<'a>(operation: &str, args: &'a StepArgs, argument: &'static str) -> Result<&'a str> {
    str_arg(args, argument).ok_or_else(|| DriverError::MissingArgument {
        operation: operation.to_string(),
        argument,
    })
}

/// Per-step wait override in milliseconds.
fn wait_limit(args: &StepArgs) -> Duration {
    args.get("timeout")
        .and_then(Value::as_u64)
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_WAIT)
}

fn find_chrome() -> Option<PathBuf> {
    let mut candidates = vec![
        PathBuf::from(r"C:\Program Files\Google\Chrome\Application\chrome.exe"),
        PathBuf::from(r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe"),
        PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome"),
        PathBuf::from("/usr/bin/google-chrome"),
        PathBuf::from("/usr/bin/chromium"),
        PathBuf::from("/usr/bin/chromium-browser"),
    ];
    if let Some(local) = dirs::data_local_dir() {
        candidates.push(local.join(r"Google\Chrome\Application\chrome.exe"));
    }

    let found = candidates.into_iter().find(|p| p.exists());
    match &found {
        Some(path) => debug!(path = %path.display(), "using chrome"),
        None => warn!("no chrome found in the usual places, letting the driver search"),
    }
    found
}
