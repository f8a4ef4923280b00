/// Derives the machine-checkable contract hiding inside a task's text:
/// which files the task is expected to produce, which files are inputs,
/// which must be gone afterwards, which libraries produced code must use,
/// and which text markers the output must carry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskContract {
    pub required_outputs: Vec<String>,
    pub source_inputs: Vec<String>,
    pub required_absent: Vec<String>,
    pub required_modules: Vec<String>,
    pub expected_text_markers: Vec<String>,
}

const OUTPUT_INTENT_KEYWORDS: [&str; 5] = ["write", "create", "generate", "save", "produce"];
const INPUT_REF_KEYWORDS: [&str; 6] = ["from", "read", "use", "using", "input", "source"];
const DELETE_KEYWORDS: [&str; 3] = ["delete", "remove", "rm "];
const MODULE_STOPWORDS: [&str; 5] = ["python", "pip", "script", "file", "version"];

const COMMON_OUTPUT_EXTENSIONS: [&str; 30] = [
    "txt", "md", "json", "csv", "html", "htm", "xml", "yaml", "yml", "log", "py", "js", "ts",
    "css", "sql", "sh", "ini", "cfg", "conf", "toml", "pdf", "docx", "xlsx", "pptx", "png", "jpg",
    "jpeg", "gif", "zip", "parquet",
];

const SOURCE_ONLY_EXTENSIONS: [&str; 10] = [
    "pdf", "doc", "docx", "xls", "xlsx", "ppt", "pptx", "png", "jpg", "jpeg",
];

const TEXT_OUTPUT_EXTENSIONS: [&str; 9] = [
    "txt", "md", "json", "csv", "html", "xml", "yaml", "yml", "log",
];

impl TaskContract {
    pub fn parse(task: &str) -> Self {
        let text = task.trim();
        if text.is_empty() {
            return Self::default();
        }
        let lowered = text.to_ascii_lowercase();
        let has_output_intent = OUTPUT_INTENT_KEYWORDS.iter().any(|k| lowered.contains(k));

        let candidates = extract_file_tokens(text);
        let source_refs = infer_source_inputs(&lowered, &candidates, has_output_intent);

        let mut outputs = Vec::new();
        for token in &candidates {
            let Some(normalized) = normalize_file_token(token) else {
                continue;
            };
            if source_refs.contains(&normalized) {
                continue;
            }
            if looks_like_code_member_call(text, &normalized) {
                continue;
            }
            if normalized.ends_with(".py") && looks_like_script_input_ref(text, &normalized) {
                continue;
            }
            if !looks_like_output_candidate(&normalized) {
                continue;
            }
            if has_output_intent {
                outputs.push(normalized);
            }
        }

        let required_absent = infer_required_absent(&lowered, &source_refs, &outputs);
        let required_modules = infer_required_modules(&lowered);
        let expected_text_markers = infer_text_markers(text, &lowered);

        Self {
            required_outputs: dedup(outputs),
            source_inputs: dedup(source_refs),
            required_absent: dedup(required_absent),
            required_modules: dedup(required_modules),
            expected_text_markers: dedup(expected_text_markers),
        }
    }
}

pub fn requires_non_empty_output(path: &str) -> bool {
    extension_of(path)
        .map(|ext| TEXT_OUTPUT_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

/// Tokens shaped like file references: path-safe characters with a dot and a
/// short alphanumeric extension.
fn extract_file_tokens(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for ch in text.chars().chain(std::iter::once(' ')) {
        if ch.is_ascii_alphanumeric() || matches!(ch, '_' | '.' | '/' | '-') {
            current.push(ch);
            continue;
        }
        if !current.is_empty() {
            let token = current.trim_matches('.').to_string();
            if is_file_like(&token) {
                tokens.push(token);
            }
            current.clear();
        }
    }
    tokens
}

fn is_file_like(token: &str) -> bool {
    if token.len() < 3 || !token.contains('.') {
        return false;
    }
    match extension_of(token) {
        Some(ext) => {
            !ext.is_empty() && ext.len() <= 8 && ext.chars().all(|c| c.is_ascii_alphanumeric())
        }
        None => false,
    }
}

fn extension_of(token: &str) -> Option<String> {
    let name = token.rsplit('/').next()?;
    let (_, ext) = name.rsplit_once('.')?;
    if ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

fn normalize_file_token(token: &str) -> Option<String> {
    let mut value = token.trim().replace('\\', "/");
    if value.is_empty() {
        return None;
    }
    if let Some(stripped) = value.strip_prefix("./") {
        value = stripped.to_string();
    }
    if value.starts_with('/') || value.contains("://") || value.starts_with("www.") {
        return None;
    }
    // `resend.api_key`-style identifiers: multiple dots without a directory.
    if value.matches('.').count() > 1 && !value.contains('/') {
        return None;
    }
    Some(value)
}

fn looks_like_output_candidate(token: &str) -> bool {
    let Some(ext) = extension_of(token) else {
        return false;
    };
    if token.contains('/') {
        return true;
    }
    COMMON_OUTPUT_EXTENSIONS.contains(&ext.as_str())
}

/// A bare `name.ext(` in the text is a code call, not a file reference.
fn looks_like_code_member_call(text: &str, token: &str) -> bool {
    if token.contains('/') {
        return false;
    }
    let mut search = text;
    while let Some(pos) = search.find(token) {
        let after = &search[pos + token.len()..];
        if after.trim_start().starts_with('(') {
            return true;
        }
        search = &search[pos + token.len()..];
    }
    false
}

/// `python script.py` invocations mark the script as an input, not an output.
fn looks_like_script_input_ref(text: &str, token: &str) -> bool {
    let lowered = text.to_ascii_lowercase();
    let needle = token.to_ascii_lowercase();
    for prefix in ["python ", "python3 "] {
        let mut search = lowered.as_str();
        while let Some(pos) = search.find(prefix) {
            let rest = search[pos + prefix.len()..].trim_start();
            if rest.starts_with(&needle) {
                return true;
            }
            search = &search[pos + prefix.len()..];
        }
    }
    false
}

fn infer_source_inputs(
    lowered: &str,
    candidates: &[String],
    has_output_intent: bool,
) -> Vec<String> {
    let words: Vec<&str> = lowered.split_whitespace().collect();
    let mut sources = Vec::new();
    for token in candidates {
        let Some(normalized) = normalize_file_token(token) else {
            continue;
        };
        let token_lower = normalized.to_ascii_lowercase();
        let preceded_by_input_keyword = words.windows(2).any(|pair| {
            let keyword = pair[0].trim_matches(|c: char| !c.is_ascii_alphanumeric());
            let value = pair[1].trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '.' && c != '/' && c != '_' && c != '-');
            INPUT_REF_KEYWORDS.contains(&keyword) && value == token_lower
        });
        if preceded_by_input_keyword {
            sources.push(normalized);
            continue;
        }
        if has_output_intent {
            if let Some(ext) = extension_of(&normalized) {
                if SOURCE_ONLY_EXTENSIONS.contains(&ext.as_str()) {
                    sources.push(normalized);
                }
            }
        }
    }
    sources
}

fn infer_required_absent(
    lowered: &str,
    source_inputs: &[String],
    outputs: &[String],
) -> Vec<String> {
    if !DELETE_KEYWORDS.iter().any(|k| lowered.contains(k)) {
        return Vec::new();
    }
    let mut rows: Vec<String> = source_inputs.to_vec();
    rows.extend(outputs.iter().cloned());
    rows
}

fn infer_required_modules(lowered: &str) -> Vec<String> {
    let words: Vec<&str> = lowered.split_whitespace().collect();
    let mut modules = Vec::new();
    for (index, word) in words.iter().enumerate() {
        let cleaned = word.trim_matches(|c: char| !c.is_ascii_alphanumeric());
        if (cleaned == "pip" || cleaned == "pip3")
            && words.get(index + 1).map(|w| *w == "install") == Some(true)
        {
            if let Some(module) = words.get(index + 2) {
                modules.push(clean_module_token(module));
            }
        }
        if cleaned == "import" {
            if let Some(module) = words.get(index + 1) {
                modules.push(clean_module_token(module));
            }
        }
    }
    modules
        .into_iter()
        .filter(|m| !m.is_empty() && !MODULE_STOPWORDS.contains(&m.as_str()))
        .collect()
}

fn clean_module_token(raw: &str) -> String {
    raw.trim_matches(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.'))
        .split('.')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase()
}

/// Quoted phrases following a "contains"-style keyword become text markers
/// the produced output must carry.
fn infer_text_markers(text: &str, lowered: &str) -> Vec<String> {
    const MARKER_KEYWORDS: [&str; 4] = ["containing", "contains", "must contain", "with the text"];
    let mut markers = Vec::new();
    for keyword in MARKER_KEYWORDS {
        let mut search_from = 0;
        while let Some(pos) = lowered[search_from..].find(keyword) {
            let absolute = search_from + pos + keyword.len();
            if let Some(marker) = first_quoted(&text[absolute..]) {
                markers.push(marker);
            }
            search_from = absolute;
        }
    }
    markers
}

fn first_quoted(text: &str) -> Option<String> {
    let bytes: Vec<char> = text.chars().collect();
    let open = bytes.iter().position(|c| *c == '"' || *c == '\'')?;
    let quote = bytes[open];
    let close = bytes[open + 1..].iter().position(|c| *c == quote)? + open + 1;
    let marker: String = bytes[open + 1..close].iter().collect();
    let trimmed = marker.trim();
    if trimmed.is_empty() || trimmed.len() > 120 {
        return None;
    }
    Some(trimmed.to_string())
}

fn dedup(rows: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::BTreeSet::new();
    let mut uniq = Vec::new();
    for row in rows {
        let value = row.trim().replace('\\', "/");
        if value.is_empty() || !seen.insert(value.clone()) {
            continue;
        }
        uniq.push(value);
    }
    uniq
}
