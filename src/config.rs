use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::dom::DEFAULT_TITLE_KEYWORDS;

pub const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:8000";
pub const DEFAULT_LOGIN_TRAJECTORY: &str = "trajectory_login_only.json";

/// Runtime settings. Every flag can also come from the environment (or `.env`).
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Polls the orchestration backend and drives the web application")]
pub struct AgentConfig {
    /// Base URL of the orchestration backend
    #[arg(long, env = "BACKEND_URL", default_value = DEFAULT_BACKEND_URL)]
    pub backend_url: String,

    /// Seconds between polls when there is nothing to do
    #[arg(long, env = "POLL_INTERVAL_SECS", default_value_t = 5)]
    pub poll_interval_secs: u64,

    /// Seconds to wait after the backend refused a connection
    #[arg(long, env = "CONNECT_BACKOFF_SECS", default_value_t = 10)]
    pub connect_backoff_secs: u64,

    /// Timeout for small requests (init, verification, logout)
    #[arg(long, env = "SHORT_TIMEOUT_SECS", default_value_t = 5)]
    pub short_timeout_secs: u64,

    /// Timeout for `GET /command`
    #[arg(long, env = "POLL_TIMEOUT_SECS", default_value_t = 10)]
    pub poll_timeout_secs: u64,

    /// Timeout for `GET /action`; action generation can be slow
    #[arg(long, env = "ACTION_TIMEOUT_SECS", default_value_t = 60)]
    pub action_timeout_secs: u64,

    /// Timeout for `POST /state`; the backend analyses the UI state before answering
    #[arg(long, env = "STATE_TIMEOUT_SECS", default_value_t = 120)]
    pub state_timeout_secs: u64,

    /// Upper bound for closing a page or context during teardown
    #[arg(long, env = "CLOSE_TIMEOUT_SECS", default_value_t = 10)]
    pub close_timeout_secs: u64,

    /// Trajectory run at login; `${DG_USERNAME}` and `${DG_PASSWORD}` are substituted
    #[arg(long, env = "LOGIN_TRAJECTORY", default_value = DEFAULT_LOGIN_TRAJECTORY)]
    pub login_trajectory: PathBuf,

    /// Directory that relative `actions_file` paths are resolved against
    #[arg(long, env = "TRAJECTORY_DIR", default_value = ".")]
    pub trajectory_dir: PathBuf,

    /// Login only counts as successful if the final URL contains this
    #[arg(long, env = "LOGIN_SUCCESS_MARKER")]
    pub login_success_marker: Option<String>,

    /// Chrome executable; auto-detected when omitted
    #[arg(long, env = "CHROME_PATH")]
    pub chrome_path: Option<PathBuf>,

    /// Persistent browser profile directory
    #[arg(long, env = "AGENT_PROFILE_DIR")]
    pub profile_dir: Option<PathBuf>,

    /// Run Chrome without a window
    #[arg(long, env = "HEADLESS", default_value_t = false)]
    pub headless: bool,

    /// Keywords that make a tab panel's first line usable as its title
    #[arg(long, env = "TITLE_KEYWORDS", value_delimiter = ',', default_values = DEFAULT_TITLE_KEYWORDS)]
    pub title_keywords: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            poll_interval_secs: 5,
            connect_backoff_secs: 10,
            short_timeout_secs: 5,
            poll_timeout_secs: 10,
            action_timeout_secs: 60,
            state_timeout_secs: 120,
            close_timeout_secs: 10,
            login_trajectory: PathBuf::from(DEFAULT_LOGIN_TRAJECTORY),
            trajectory_dir: PathBuf::from("."),
            login_success_marker: None,
            chrome_path: None,
            profile_dir: None,
            headless: false,
            title_keywords: DEFAULT_TITLE_KEYWORDS.iter().map(|k| k.to_string()).collect(),
        }
    }
}

impl AgentConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn connect_backoff(&self) -> Duration {
        Duration::from_secs(self.connect_backoff_secs)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_secs(self.close_timeout_secs)
    }

    /// Profile directory, defaulting to the user's local data dir so logins persist.
    pub fn profile_dir(&self) -> PathBuf {
        self.profile_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("execution-web-agent")
                .join("agent_profile")
        })
    }
}
