//! The seam between the agent and a browser-automation driver.
//!
//! The agent only ever talks to these traits. `hands` implements them on top of
//! headless Chrome; the tests implement them in memory.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::StepArgs;

/// A located element. Handles may go stale if the page re-renders.
#[async_trait]
pub trait Element: Send + Sync {
    async fn is_visible(&self) -> Result<bool>;

    async fn inner_text(&self) -> Result<String>;

    /// HTML attribute value, `None` when the attribute is absent.
    async fn attribute(&self, name: &str) -> Result<Option<String>>;

    /// DOM property (`tagName`, `type`, `value`, ...) stringified.
    async fn property(&self, name: &str) -> Result<Option<String>>;

    /// Text of the first `<label>` associated with a form control.
    async fn label_text(&self) -> Result<Option<String>>;

    /// Descendants matching `selector`, in document order.
    async fn locate_all(&self, selector: &str) -> Result<Vec<Box<dyn Element>>>;
}

/// A live page of the target web application.
#[async_trait]
pub trait Page: Send + Sync {
    async fn url(&self) -> Result<String>;

    async fn is_closed(&self) -> bool;

    /// Elements matching `selector` anywhere in the page, in document order.
    async fn locate_all(&self, selector: &str) -> Result<Vec<Box<dyn Element>>>;

    /// Runs one named automation operation. Names the driver does not know
    /// must fail with `DriverError::UnknownOperation`.
    async fn run(&self, operation: &str, args: &StepArgs) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// The browsing context a page lives in. Owns the browser process.
#[async_trait]
pub trait BrowsingContext: Send + Sync {
    async fn close(&self) -> Result<()>;
}

/// Opens fresh browser sessions.
#[async_trait]
pub trait Driver: Send + Sync {
    async fn open(&self) -> Result<Session>;
}

/// The live binding between the agent and one open browsing context.
pub struct Session {
    pub page: Arc<dyn Page>,
    pub context: Arc<dyn BrowsingContext>,
}

impl Session {
    pub fn new(page: Arc<dyn Page>, context: Arc<dyn BrowsingContext>) -> Self {
        Self { page, context }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session").finish_non_exhaustive()
    }
}
