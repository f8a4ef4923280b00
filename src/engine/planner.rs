use serde::{Deserialize, Serialize};

/// Everything the oracle sees for one planning call. Memory/preference
/// resolution happens outside the engine; its output arrives here as the
/// opaque `injected_context` block, alongside the currently permitted tool
/// names from the policy source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanRequest {
    pub task: String,
    pub iteration: u32,
    pub max_iters: u32,
    #[serde(default)]
    pub previous_output: String,
    #[serde(default)]
    pub injected_context: String,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub recovery_directive: Option<String>,
    /// Set on retry attempts after a parse failure: contexts are trimmed so
    /// the oracle has less room to drift away from strict JSON.
    #[serde(default)]
    pub reduced: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannerReply {
    pub content: String,
}

#[derive(Debug, thiserror::Error)]
pub enum PlannerError {
    #[error("planner unavailable: {0}")]
    Unavailable(String),
}

/// The planning oracle, consumed as a black-box capability. The reply is raw
/// text; parsing it into a plan is the engine's job.
pub trait Planner: Send + Sync {
    fn plan(&self, request: &PlanRequest) -> Result<PlannerReply, PlannerError>;
}

/// Canonical rendering of a plan request, recorded verbatim in the iteration
/// log so every planning decision stays auditable.
pub fn render_plan_prompt(request: &PlanRequest) -> String {
    let mut lines = vec![
        format!("Task: {}", request.task),
        format!("Iteration: {}/{}", request.iteration, request.max_iters),
        format!(
            "Previous output: {}",
            if request.previous_output.is_empty() {
                "N/A"
            } else {
                request.previous_output.as_str()
            }
        ),
    ];
    if !request.injected_context.trim().is_empty() {
        lines.push(format!("Context:\n{}", request.injected_context.trim()));
    }
    if !request.allowed_tools.is_empty() {
        lines.push(format!("Allowed tools: {}", request.allowed_tools.join(",")));
    }
    if let Some(directive) = &request.recovery_directive {
        lines.push(format!("Guidance:\n{directive}"));
    }
    lines.push("Return JSON plan now.".to_string());
    lines.join("\n")
}

/// Retry variant of a request: drop the previous output and trim the
/// injected context to its first lines.
pub fn reduced_request(request: &PlanRequest) -> PlanRequest {
    let mut reduced = request.clone();
    reduced.previous_output = String::new();
    reduced.injected_context = head_lines(&request.injected_context, 8);
    reduced.reduced = true;
    reduced
}

fn head_lines(text: &str, max: usize) -> String {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .take(max)
        .collect::<Vec<_>>()
        .join("\n")
}
