use crate::engine::plan::{
    Action, ActionError, FailureKind, ACTION_DELETE_FILE, ACTION_FETCH_URL, ACTION_LIST_DIR,
    ACTION_READ_FILE, ACTION_RUN_CODE, ACTION_RUN_COMMAND, ACTION_WRITE_FILE,
};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Component, Path, PathBuf};

/// Tokens denied even when nominally allow-listed: privilege escalation,
/// remote shells/copies, raw network fetch through the shell, and renames
/// that could move files out of the workspace. Deletion stays permitted but
/// only with workspace-confined targets.
const BLOCKED_COMMAND_TOKENS: [&str; 6] = ["sudo", "ssh", "scp", "curl", "wget", "mv"];

/// Pull-based provider for the externally managed tool allow-list. Consulted
/// fresh every iteration so policy edits take effect mid-run.
pub trait PolicySource: Send + Sync {
    /// `None` means the policy places no restriction on tool names.
    fn current_allowed_tools(&self) -> Option<BTreeSet<String>>;
}

/// Policy source with no restrictions.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenPolicy;

impl PolicySource for OpenPolicy {
    fn current_allowed_tools(&self) -> Option<BTreeSet<String>> {
        None
    }
}

/// Reads a YAML sequence of permitted tool names on every call. A missing or
/// unreadable file means "no restriction", matching the behavior of a policy
/// memory that has not been provisioned yet.
#[derive(Debug, Clone)]
pub struct FileBackedPolicy {
    path: PathBuf,
}

impl FileBackedPolicy {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl PolicySource for FileBackedPolicy {
    fn current_allowed_tools(&self) -> Option<BTreeSet<String>> {
        let raw = fs::read_to_string(&self.path).ok()?;
        let names: Vec<String> = serde_yaml::from_str(&raw).ok()?;
        Some(
            names
                .into_iter()
                .map(|name| name.trim().to_ascii_lowercase())
                .filter(|name| !name.is_empty())
                .collect(),
        )
    }
}

/// Evaluate one action against the gate. Pure: no side effects, and denial
/// is data (`ActionError`) rather than a run-level fault.
pub fn authorize_action(
    action: &Action,
    workspace_root: &Path,
    safe_commands: &[String],
    allowed_tools: Option<&BTreeSet<String>>,
) -> Result<(), ActionError> {
    if let Some(allowed) = allowed_tools {
        if !allowed.contains(action.name.as_str()) {
            return Err(ActionError::new(
                FailureKind::CapabilityDenied,
                format!("blocked by policy allow-list: {}", action.name),
            ));
        }
    }

    match action.name.as_str() {
        ACTION_LIST_DIR | ACTION_READ_FILE | ACTION_WRITE_FILE | ACTION_DELETE_FILE => {
            let raw = action.path_param().unwrap_or(".");
            resolve_workspace_path(workspace_root, raw)?;
            Ok(())
        }
        ACTION_RUN_COMMAND => authorize_command(action, workspace_root, safe_commands),
        ACTION_RUN_CODE => {
            if !safe_commands.iter().any(|cmd| cmd == "python") {
                return Err(ActionError::new(
                    FailureKind::CapabilityDenied,
                    "python is not in the command allow-list",
                ));
            }
            if let Some(raw) = action.path_param() {
                resolve_workspace_path(workspace_root, raw)?;
            }
            Ok(())
        }
        ACTION_FETCH_URL => Ok(()),
        other => Err(ActionError::new(
            FailureKind::CapabilityDenied,
            format!("action not allowed: {other}"),
        )),
    }
}

fn authorize_command(
    action: &Action,
    workspace_root: &Path,
    safe_commands: &[String],
) -> Result<(), ActionError> {
    let command = action.str_param("command").unwrap_or_default().trim();
    if command.is_empty() {
        return Err(ActionError::new(
            FailureKind::InvalidParams,
            "missing command",
        ));
    }
    let mut parts = split_command(command)
        .ok_or_else(|| ActionError::new(FailureKind::InvalidParams, "unbalanced command quoting"))?;
    if let Some(Value::Array(args)) = action.params.get("args") {
        parts.extend(args.iter().filter_map(Value::as_str).map(str::to_string));
    }
    let Some(program) = parts.first().cloned() else {
        return Err(ActionError::new(
            FailureKind::InvalidParams,
            "empty command",
        ));
    };

    if !safe_commands.iter().any(|cmd| cmd == &program) {
        return Err(ActionError::new(
            FailureKind::CapabilityDenied,
            format!("command is not allowlisted: {program}"),
        ));
    }
    for token in &parts {
        if BLOCKED_COMMAND_TOKENS.contains(&token.as_str()) {
            return Err(ActionError::new(
                FailureKind::CapabilityDenied,
                format!("command contains blocked token: {token}"),
            ));
        }
    }

    if program == "rm" {
        for target in rm_targets(&parts) {
            resolve_workspace_path(workspace_root, &target)?;
        }
    }
    Ok(())
}

/// Positional arguments of an `rm` invocation (flags skipped, `--` honored).
fn rm_targets(parts: &[String]) -> Vec<String> {
    let mut targets = Vec::new();
    let mut flags_done = false;
    for token in parts.iter().skip(1) {
        if token == "--" {
            flags_done = true;
            continue;
        }
        if !flags_done && token.starts_with('-') {
            continue;
        }
        targets.push(token.clone());
    }
    targets
}

/// Resolve a path parameter against the workspace root and require the
/// result to stay inside it. Symlinks are collapsed via canonicalization of
/// the deepest existing ancestor; `..` is folded lexically before the check.
pub fn resolve_workspace_path(workspace_root: &Path, value: &str) -> Result<PathBuf, ActionError> {
    let raw = Path::new(value.trim());
    let joined = if raw.is_absolute() {
        raw.to_path_buf()
    } else {
        workspace_root.join(raw)
    };

    let normalized = lexical_normalize(&joined).ok_or_else(|| {
        ActionError::new(
            FailureKind::PathEscape,
            format!("path escapes filesystem root: {value}"),
        )
    })?;
    let root = canonicalize_if_exists(workspace_root);
    let resolved = canonicalize_if_exists(&normalized);

    if resolved.starts_with(&root) {
        Ok(resolved)
    } else {
        Err(ActionError::new(
            FailureKind::PathEscape,
            format!("path escapes workspace: {value}"),
        ))
    }
}

fn canonicalize_if_exists(path: &Path) -> PathBuf {
    if let Ok(canonical) = fs::canonicalize(path) {
        return canonical;
    }
    // Canonicalize the deepest existing ancestor and re-attach the tail, so
    // not-yet-created output paths are still checked against symlink escapes.
    let mut existing = path.to_path_buf();
    let mut tail = Vec::new();
    while !existing.exists() {
        match existing.file_name() {
            Some(name) => {
                tail.push(name.to_os_string());
                if !existing.pop() {
                    return path.to_path_buf();
                }
            }
            None => return path.to_path_buf(),
        }
    }
    let mut resolved = fs::canonicalize(&existing).unwrap_or(existing);
    for part in tail.into_iter().rev() {
        resolved.push(part);
    }
    resolved
}

fn lexical_normalize(path: &Path) -> Option<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::RootDir | Component::Prefix(_) => {
                normalized.push(component.as_os_str());
            }
            Component::Normal(value) => normalized.push(value),
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    return None;
                }
            }
        }
    }
    Some(normalized)
}

/// Minimal shell-style splitter: whitespace separation with single/double
/// quote grouping. Returns `None` on unterminated quotes.
pub fn split_command(command: &str) -> Option<Vec<String>> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut has_token = false;

    for ch in command.chars() {
        match quote {
            Some(q) => {
                if ch == q {
                    quote = None;
                } else {
                    current.push(ch);
                }
            }
            None => match ch {
                '\'' | '"' => {
                    quote = Some(ch);
                    has_token = true;
                }
                c if c.is_whitespace() => {
                    if has_token {
                        parts.push(std::mem::take(&mut current));
                        has_token = false;
                    }
                }
                c => {
                    current.push(c);
                    has_token = true;
                }
            },
        }
    }
    if quote.is_some() {
        return None;
    }
    if has_token {
        parts.push(current);
    }
    Some(parts)
}
