use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Canonical capability names. Legacy aliases from older planner prompts are
/// normalized before gating so policy decisions see one spelling.
pub const ACTION_LIST_DIR: &str = "list_dir";
pub const ACTION_READ_FILE: &str = "read_file";
pub const ACTION_WRITE_FILE: &str = "write_file";
pub const ACTION_DELETE_FILE: &str = "delete_file";
pub const ACTION_RUN_COMMAND: &str = "run_command";
pub const ACTION_RUN_CODE: &str = "run_code";
pub const ACTION_FETCH_URL: &str = "fetch_url";

pub fn normalize_action_name(name: &str) -> String {
    let raw = name.trim().to_ascii_lowercase();
    match raw.as_str() {
        "write_workspace_file" => ACTION_WRITE_FILE.to_string(),
        "run_safe_command" | "run_shell_command" => ACTION_RUN_COMMAND.to_string(),
        "run_python_code" => ACTION_RUN_CODE.to_string(),
        "web_fetch" => ACTION_FETCH_URL.to_string(),
        _ => raw,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub name: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl Action {
    pub fn new(name: impl Into<String>, params: Map<String, Value>) -> Self {
        Self {
            name: normalize_action_name(&name.into()),
            params,
        }
    }

    pub fn str_param(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    /// The filesystem parameter under either of its accepted spellings.
    pub fn path_param(&self) -> Option<&str> {
        self.str_param("path").or_else(|| self.str_param("file_path"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    CapabilityDenied,
    PathEscape,
    Timeout,
    MissingModule,
    MissingBinary,
    ExitNonzero,
    Network,
    InvalidParams,
    Io,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CapabilityDenied => "capability_denied",
            Self::PathEscape => "path_escape",
            Self::Timeout => "timeout",
            Self::MissingModule => "missing_module",
            Self::MissingBinary => "missing_binary",
            Self::ExitNonzero => "exit_nonzero",
            Self::Network => "network",
            Self::InvalidParams => "invalid_params",
            Self::Io => "io",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionError {
    pub kind: FailureKind,
    pub message: String,
}

impl ActionError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ActionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub name: String,
    pub ok: bool,
    pub output: String,
    #[serde(default)]
    pub error: Option<ActionError>,
    #[serde(default)]
    pub duration_ms: u64,
}

impl ActionResult {
    pub fn success(name: impl Into<String>, output: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            name: name.into(),
            ok: true,
            output: output.into(),
            error: None,
            duration_ms,
        }
    }

    pub fn failure(name: impl Into<String>, error: ActionError, duration_ms: u64) -> Self {
        Self::failure_with_output(name, String::new(), error, duration_ms)
    }

    pub fn failure_with_output(
        name: impl Into<String>,
        output: impl Into<String>,
        error: ActionError,
        duration_ms: u64,
    ) -> Self {
        Self {
            name: name.into(),
            ok: false,
            output: output.into(),
            error: Some(error),
            duration_ms,
        }
    }
}

/// One declarative objective check. The `check_type` drives interpretation;
/// unknown types are reported as unmet instead of failing the plan parse.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationCheck {
    #[serde(rename = "type")]
    pub check_type: String,
    #[serde(default)]
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contains: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl ValidationCheck {
    pub fn file_exists(path: impl Into<String>) -> Self {
        Self {
            check_type: "file_exists".to_string(),
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn file_absent(path: impl Into<String>) -> Self {
        Self {
            check_type: "file_absent".to_string(),
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn file_non_empty(path: impl Into<String>) -> Self {
        Self {
            check_type: "file_non_empty".to_string(),
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn text_in_file(path: impl Into<String>, contains: impl Into<String>) -> Self {
        Self {
            check_type: "text_in_file".to_string(),
            path: path.into(),
            contains: Some(contains.into()),
            ..Self::default()
        }
    }

    pub fn python_import(path: impl Into<String>, module: impl Into<String>) -> Self {
        Self {
            check_type: "python_import".to_string(),
            path: path.into(),
            module: Some(module.into()),
            ..Self::default()
        }
    }

    fn dedup_key(&self) -> (String, String, String, String, String, String) {
        (
            self.check_type.clone(),
            self.path.clone(),
            self.contains.clone().unwrap_or_default(),
            self.module.clone().unwrap_or_default(),
            self.key.clone().unwrap_or_default(),
            self.value.clone().unwrap_or_default(),
        )
    }
}

pub fn dedup_checks(checks: Vec<ValidationCheck>) -> Vec<ValidationCheck> {
    let mut seen = std::collections::BTreeSet::new();
    let mut uniq = Vec::new();
    for check in checks {
        if seen.insert(check.dedup_key()) {
            uniq.push(check);
        }
    }
    uniq
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub thought: String,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub final_output: String,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub validations: Vec<ValidationCheck>,
}

/// Parsing the oracle's free-form reply is a first-class outcome, not an
/// exceptional path: downstream logic pattern-matches on this variant.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedPlan {
    Plan(Plan),
    ParseError { reason: String, raw: String },
}

pub fn parse_plan(raw: &str) -> ParsedPlan {
    let trimmed = raw.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if let Some(plan) = plan_from_value(value) {
            return ParsedPlan::Plan(plan);
        }
        return ParsedPlan::ParseError {
            reason: "plan json root is not an object".to_string(),
            raw: raw.to_string(),
        };
    }

    // Models wrap JSON in prose or fences; retry on the outermost braces.
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if end > start {
            if let Ok(value) = serde_json::from_str::<Value>(&trimmed[start..=end]) {
                if let Some(plan) = plan_from_value(value) {
                    return ParsedPlan::Plan(plan);
                }
            }
        }
    }

    ParsedPlan::ParseError {
        reason: "planner reply is not valid json".to_string(),
        raw: raw.to_string(),
    }
}

fn plan_from_value(value: Value) -> Option<Plan> {
    let object = value.as_object()?;
    let thought = object
        .get("thought")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let done = object.get("done").and_then(Value::as_bool).unwrap_or(false);
    let final_output = object
        .get("final_output")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let mut actions = Vec::new();
    if let Some(items) = object.get("actions").and_then(Value::as_array) {
        for item in items {
            let Some(entry) = item.as_object() else {
                continue;
            };
            let Some(name) = entry.get("name").and_then(Value::as_str) else {
                continue;
            };
            let params = entry
                .get("params")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            actions.push(Action::new(name, params));
        }
    }

    let mut validations = Vec::new();
    if let Some(items) = object.get("validations").and_then(Value::as_array) {
        for item in items {
            if let Ok(check) = serde_json::from_value::<ValidationCheck>(item.clone()) {
                if !check.check_type.trim().is_empty() && !check.path.trim().is_empty() {
                    validations.push(check);
                }
            }
        }
    }

    Some(Plan {
        thought,
        done,
        final_output,
        actions,
        validations,
    })
}
