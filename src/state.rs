use std::sync::Arc;

use crate::driver::{Page, Session};
use crate::types::{LoginState, VerificationMailbox};

/// Everything the agent remembers between poll cycles.
///
/// Owned by the dispatcher and lent to each component for the duration of a call.
#[derive(Debug, Default)]
pub struct AgentState {
    pub session: Option<Session>,
    pub login: LoginState,
    pub verification: VerificationMailbox,
}

impl AgentState {
    pub fn session_count(&self) -> usize {
        usize::from(self.session.is_some())
    }

    pub fn page(&self) -> Option<Arc<dyn Page>> {
        self.session.as_ref().map(|s| Arc::clone(&s.page))
    }
}
