use thiserror::Error;

/// Failures talking to the orchestration backend.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("cannot connect to backend: {0}")]
    Connect(String),

    #[error("backend request timed out: {0}")]
    Timeout(String),

    #[error("backend responded with HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("backend returned an empty body")]
    EmptyBody,

    #[error("malformed backend response: {0}")]
    Malformed(String),

    #[error("backend request failed: {0}")]
    Request(String),
}

impl TransportError {
    /// Connection failures get the extended backoff instead of the normal interval.
    pub fn is_connect(&self) -> bool {
        matches!(self, TransportError::Connect(_))
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            TransportError::Connect(e.to_string())
        } else if e.is_timeout() {
            TransportError::Timeout(e.to_string())
        } else if e.is_decode() {
            TransportError::Malformed(e.to_string())
        } else {
            TransportError::Request(e.to_string())
        }
    }
}

/// A backend payload that parsed as JSON but does not carry what its type promises.
#[derive(Error, Debug, PartialEq)]
pub enum ProtocolError {
    #[error("command is not a JSON object")]
    NotAnObject,

    #[error("'{command}' command is missing field '{field}'")]
    MissingField {
        command: &'static str,
        field: &'static str,
    },

    #[error("invalid field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },
}

#[derive(Error, Debug)]
pub enum BackendError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Errors raised by the browser driver. Every failed automation step surfaces as one of these.
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("browser launch failed: {0}")]
    Launch(String),

    #[error("page is closed")]
    Closed,

    #[error("operation cancelled")]
    Cancelled,

    #[error("unknown operation '{0}'")]
    UnknownOperation(String),

    #[error("'{operation}' requires argument '{argument}'")]
    MissingArgument {
        operation: String,
        argument: &'static str,
    },

    #[error("no element matches selector '{0}'")]
    ElementNotFound(String),

    #[error("timeout waiting for {0}")]
    Timeout(String),

    #[error("script evaluation failed: {0}")]
    Script(String),

    #[error("{0}")]
    Operation(String),
}

impl From<serde_json::Error> for DriverError {
    fn from(e: serde_json::Error) -> Self {
        DriverError::Script(e.to_string())
    }
}

#[derive(Error, Debug)]
pub enum TrajectoryError {
    #[error("trajectory file not found: {0}")]
    Missing(String),

    #[error("invalid trajectory {path}: {reason}")]
    Invalid { path: String, reason: String },
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Trajectory(#[from] TrajectoryError),

    #[error("did not reach the main page (current url: {0})")]
    NotOnMainPage(String),

    #[error("login step '{step}' failed: {source}")]
    Step {
        step: String,
        #[source]
        source: DriverError,
    },

    #[error(transparent)]
    Driver(#[from] DriverError),
}

impl SessionError {
    /// Failure text reported to the backend. Timeouts are usually bad credentials
    /// that never navigated, so they get a generic message.
    pub fn login_message(&self) -> String {
        let raw = self.to_string();
        if is_timeout_shaped(&raw) {
            "login failed: response latency or invalid credentials".to_string()
        } else {
            format!("login failed: {raw}")
        }
    }
}

fn is_timeout_shaped(message: &str) -> bool {
    message.contains("Timeout")
        || message.contains("timeout")
        || message.contains("timed out")
        || message.contains("waiting for")
}

#[derive(Error, Debug)]
pub enum VerificationError {
    #[error("page scan failed: {0}")]
    Scan(#[from] DriverError),
}

pub type Result<T, E = DriverError> = std::result::Result<T, E>;
