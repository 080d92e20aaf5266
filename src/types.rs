use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::path::Path;

use crate::error::{ProtocolError, TrajectoryError};

/// Step status value marking the last step of a single-step run.
pub const FINISH_STATUS: &str = "FINISH";

/// Sentinel reported instead of an empty form-field list.
pub const NO_FIELDS_SENTINEL: &str = "none recognized";

pub type StepArgs = Map<String, Value>;

/// What the agent knows about the current login.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LoginState {
    pub logged_in: bool,
    pub student_id: Option<String>,
    pub last_url: Option<String>,
}

impl LoginState {
    pub fn reset(&mut self) {
        *self = LoginState::default();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationResult {
    pub success: bool,
    pub message: String,
}

/// Single-slot holder for the latest verification outcome.
///
/// A write overwrites any unread value; `consume` hands the value out once.
#[derive(Debug, Default)]
pub struct VerificationMailbox {
    slot: Option<VerificationResult>,
}

impl VerificationMailbox {
    pub fn store(&mut self, success: bool, message: impl Into<String>) {
        self.slot = Some(VerificationResult {
            success,
            message: message.into(),
        });
    }

    pub fn has_result(&self) -> bool {
        self.slot.is_some()
    }

    pub fn peek(&self) -> Option<&VerificationResult> {
        self.slot.as_ref()
    }

    pub fn consume(&mut self) -> Option<VerificationResult> {
        self.slot.take()
    }
}

/// A command fetched from `GET /command`.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    None,
    Login { student_id: String, password: String },
    StatePrompt { text: String },
    Action,
    VerificationRequest,
    Shutdown,
    Logout,
    Unknown { raw: Value },
}

#[derive(Deserialize)]
struct RawCommand {
    #[serde(rename = "type")]
    kind: Option<String>,
    has_task: Option<bool>,
    #[serde(default, deserialize_with = "string_or_number")]
    student_id: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    password: Option<String>,
    prompt_text: Option<String>,
}

/// Student ids sometimes arrive as JSON numbers.
fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected a string or number, got {other}"
        ))),
    }
}

impl Command {
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        if !value.is_object() {
            return Err(ProtocolError::NotAnObject);
        }
        let raw: RawCommand =
            serde_json::from_value(value.clone()).map_err(|e| ProtocolError::InvalidField {
                field: "command",
                reason: e.to_string(),
            })?;

        if raw.has_task == Some(false) {
            return Ok(Command::None);
        }

        let command = match raw.kind.as_deref() {
            Some("none") => Command::None,
            Some("login") => Command::Login {
                student_id: raw.student_id.ok_or(ProtocolError::MissingField {
                    command: "login",
                    field: "student_id",
                })?,
                password: raw.password.ok_or(ProtocolError::MissingField {
                    command: "login",
                    field: "password",
                })?,
            },
            Some("state") => Command::StatePrompt {
                text: raw.prompt_text.unwrap_or_default(),
            },
            Some("action") => Command::Action,
            Some("verification") => Command::VerificationRequest,
            Some("shutdown") => Command::Shutdown,
            Some("logout") => Command::Logout,
            _ => Command::Unknown { raw: value },
        };
        Ok(command)
    }
}

/// One named automation operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionStep {
    pub name: String,
    #[serde(default)]
    pub args: StepArgs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl ActionStep {
    pub fn new(name: impl Into<String>, args: StepArgs) -> Self {
        Self {
            name: name.into(),
            args,
            state: None,
            status: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.as_deref() == Some(FINISH_STATUS)
    }

    pub fn selector(&self) -> Option<&str> {
        self.args.get("selector").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationDescriptor {
    #[serde(default)]
    pub expected_text: String,
}

/// Trajectory list entries come either wrapped as `{"action": {...}}` or bare.
#[derive(Deserialize)]
#[serde(untagged)]
enum StepEntry {
    Wrapped { action: ActionStep },
    Bare(ActionStep),
}

impl From<StepEntry> for ActionStep {
    fn from(entry: StepEntry) -> Self {
        match entry {
            StepEntry::Wrapped { action } => action,
            StepEntry::Bare(step) => step,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TrajectoryRepr {
    Structured {
        actions: Vec<StepEntry>,
        verification: Option<VerificationDescriptor>,
    },
    Bare(Vec<StepEntry>),
}

/// An ordered list of steps, optionally paired with a verification descriptor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Trajectory {
    pub steps: Vec<ActionStep>,
    pub verification: Option<VerificationDescriptor>,
}

impl<'de> Deserialize<'de> for Trajectory {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let trajectory = match TrajectoryRepr::deserialize(deserializer)? {
            TrajectoryRepr::Structured {
                actions,
                verification,
            } => Trajectory {
                steps: actions.into_iter().map(ActionStep::from).collect(),
                verification,
            },
            TrajectoryRepr::Bare(entries) => Trajectory {
                steps: entries.into_iter().map(ActionStep::from).collect(),
                verification: None,
            },
        };
        Ok(trajectory)
    }
}

impl Trajectory {
    pub fn from_file(path: &Path) -> Result<Self, TrajectoryError> {
        let text = std::fs::read_to_string(path)
            .map_err(|_| TrajectoryError::Missing(path.display().to_string()))?;
        serde_json::from_str(&text).map_err(|e| TrajectoryError::Invalid {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }
}

/// Where a full-list action keeps its steps.
#[derive(Debug, Clone, PartialEq)]
pub enum TrajectorySource {
    Inline(Trajectory),
    File(String),
}

/// The `generated_action` payload of `GET /action`.
#[derive(Debug, Clone, PartialEq)]
pub enum GeneratedAction {
    SingleStep {
        step: Option<ActionStep>,
        description: String,
        current_step: u64,
        total_steps: u64,
    },
    FullList {
        source: TrajectorySource,
        description: String,
    },
    Other {
        kind: String,
    },
}

impl GeneratedAction {
    pub fn from_value(value: &Value) -> Result<Self, ProtocolError> {
        let obj = value.as_object().ok_or(ProtocolError::NotAnObject)?;
        let kind = obj.get("type").and_then(Value::as_str).unwrap_or_default();
        if kind != "trajectory" {
            return Ok(GeneratedAction::Other {
                kind: kind.to_string(),
            });
        }

        let description = obj
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        match obj.get("actions_file") {
            Some(Value::String(path)) => {
                return Ok(GeneratedAction::FullList {
                    source: TrajectorySource::File(path.clone()),
                    description,
                });
            }
            Some(Value::Null) | None => {}
            Some(inline) => {
                let trajectory = Trajectory::deserialize(inline).map_err(|e| {
                    ProtocolError::InvalidField {
                        field: "actions_file",
                        reason: e.to_string(),
                    }
                })?;
                return Ok(GeneratedAction::FullList {
                    source: TrajectorySource::Inline(trajectory),
                    description,
                });
            }
        }

        let step = match obj.get("action") {
            None | Some(Value::Null) => None,
            Some(action) => Some(ActionStep::deserialize(action).map_err(|e| {
                ProtocolError::InvalidField {
                    field: "action",
                    reason: e.to_string(),
                }
            })?),
        };

        Ok(GeneratedAction::SingleStep {
            step,
            description,
            current_step: obj.get("current_step").and_then(Value::as_u64).unwrap_or(1),
            total_steps: obj.get("total_steps").and_then(Value::as_u64).unwrap_or(1),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SidebarNode {
    pub label: String,
    pub expanded: bool,
    pub checked: bool,
    pub sub_items: Vec<SidebarNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormField {
    pub id: String,
    pub label: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub input_type: String,
    pub value: String,
}

/// Form fields of the visible surface. An empty scan is reported as a sentinel
/// so the backend can tell "no fields" from "scan failed".
#[derive(Debug, Clone, PartialEq)]
pub enum FormFields {
    Recognized(Vec<FormField>),
    NoneRecognized,
}

impl FormFields {
    pub fn from_scan(fields: Vec<FormField>) -> Self {
        if fields.is_empty() {
            FormFields::NoneRecognized
        } else {
            FormFields::Recognized(fields)
        }
    }
}

impl Default for FormFields {
    fn default() -> Self {
        FormFields::Recognized(Vec::new())
    }
}

impl Serialize for FormFields {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            FormFields::Recognized(fields) => fields.serialize(serializer),
            FormFields::NoneRecognized => serializer.serialize_str(NO_FIELDS_SENTINEL),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PageState {
    pub title: String,
    pub detail_page: String,
    pub form_fields: FormFields,
}

impl PageState {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UiState {
    pub url: String,
    pub sidebar: Vec<SidebarNode>,
    pub current_page: PageState,
}

/// Payloads posted to `/state` as `{"data": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StateReport {
    Login {
        login_success: bool,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        student_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        last_url: Option<String>,
    },
    UiState {
        success: bool,
        prompt: String,
        student_id: Option<String>,
        logged_in: bool,
        last_url: Option<String>,
        message: String,
        ui_state: Option<UiState>,
    },
    NeedsLogin {
        success: bool,
        needs_login: bool,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        prompt: Option<String>,
    },
    ActionUnavailable {
        action_success: bool,
        needs_login: bool,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        action_description: Option<String>,
    },
}
