//! JSON shapes of brain-produced decomposition plans.
//!
//! Phase A (goal -> team epics) and phase B (epic -> leaf tasks) each have
//! their own envelope. Brains sometimes wrap the JSON in a fenced code
//! block or prose; extraction tolerates both.

use serde::Deserialize;

use crate::error::CoreError;

/// Phase A: an ordered list of team epics.
#[derive(Debug, Clone, Deserialize)]
pub struct EpicPlan {
    pub epics: Vec<EpicSpec>,
}

/// One epic in a phase-A plan. The team is referenced by name and resolved
/// against the goal's organization.
#[derive(Debug, Clone, Deserialize)]
pub struct EpicSpec {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub team: String,
    #[serde(default = "default_priority")]
    pub priority: String,
}

/// Phase B: an ordered list of leaf subtasks.
#[derive(Debug, Clone, Deserialize)]
pub struct SubtaskPlan {
    pub subtasks: Vec<SubtaskSpec>,
}

/// One subtask in a phase-B plan. The assignee is referenced by name and
/// must be a member of the epic's team; dependencies reference other
/// subtasks in the same plan by title.
#[derive(Debug, Clone, Deserialize)]
pub struct SubtaskSpec {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub assignee: String,
    #[serde(default = "default_task_type")]
    pub task_type: String,
    #[serde(default = "default_priority")]
    pub priority: String,
    #[serde(default)]
    pub complexity: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub affected_files: Vec<String>,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
}

fn default_priority() -> String {
    "p3".to_string()
}

fn default_task_type() -> String {
    "implementation".to_string()
}

/// Extract and deserialize a JSON plan from raw brain output.
///
/// Accepts the object verbatim, inside a ```json fence, or embedded in
/// surrounding prose (first `{` to last `}`).
pub fn extract_plan<T: for<'de> Deserialize<'de>>(raw: &str) -> Result<T, CoreError> {
    let trimmed = raw.trim();

    if let Ok(plan) = serde_json::from_str::<T>(trimmed) {
        return Ok(plan);
    }

    if let Some(fenced) = extract_fenced(trimmed) {
        if let Ok(plan) = serde_json::from_str::<T>(fenced) {
            return Ok(plan);
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            if let Ok(plan) = serde_json::from_str::<T>(&trimmed[start..=end]) {
                return Ok(plan);
            }
        }
    }

    Err(CoreError::ParseError(
        "brain output does not contain a JSON plan".into(),
    ))
}

/// The body of the first ``` fence, tolerating a language tag.
fn extract_fenced(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after_fence = &text[start + 3..];
    let body_start = after_fence.find('\n')? + 1;
    let body = &after_fence[body_start..];
    let end = body.find("```")?;
    Some(body[..end].trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_epic_plan() {
        let raw = r#"{"epics": [{"title": "Build API", "team": "backend", "priority": "p2"}]}"#;
        let plan: EpicPlan = extract_plan(raw).unwrap();
        assert_eq!(plan.epics.len(), 1);
        assert_eq!(plan.epics[0].team, "backend");
        assert_eq!(plan.epics[0].priority, "p2");
    }

    #[test]
    fn parses_fenced_plan() {
        let raw = "Here is the plan:\n```json\n{\"epics\": [{\"title\": \"T\", \"team\": \"core\"}]}\n```\nDone.";
        let plan: EpicPlan = extract_plan(raw).unwrap();
        assert_eq!(plan.epics[0].title, "T");
        // Priority defaulted.
        assert_eq!(plan.epics[0].priority, "p3");
    }

    #[test]
    fn parses_embedded_object() {
        let raw = "Sure! {\"subtasks\": [{\"title\": \"a\", \"assignee\": \"dev-1\"}]} hope that helps";
        let plan: SubtaskPlan = extract_plan(raw).unwrap();
        assert_eq!(plan.subtasks[0].assignee, "dev-1");
        assert_eq!(plan.subtasks[0].task_type, "implementation");
        assert!(plan.subtasks[0].depends_on.is_empty());
    }

    #[test]
    fn rejects_no_json() {
        let err = extract_plan::<EpicPlan>("I could not produce a plan.").unwrap_err();
        assert!(matches!(err, CoreError::ParseError(_)));
    }

    #[test]
    fn rejects_wrong_shape() {
        let err = extract_plan::<EpicPlan>(r#"{"wrong": true}"#).unwrap_err();
        assert!(matches!(err, CoreError::ParseError(_)));
    }

    #[test]
    fn subtask_plan_full_fields() {
        let raw = r#"{"subtasks": [
            {"title": "write handler", "description": "d", "assignee": "dev-1",
             "task_type": "implementation", "priority": "p1", "complexity": "high",
             "depends_on": ["design schema"], "affected_files": ["src/api.rs"],
             "required_capabilities": ["Rust"],
             "acceptance_criteria": ["handler returns 200"]}
        ]}"#;
        let plan: SubtaskPlan = extract_plan(raw).unwrap();
        let spec = &plan.subtasks[0];
        assert_eq!(spec.complexity.as_deref(), Some("high"));
        assert_eq!(spec.depends_on, vec!["design schema"]);
        assert_eq!(spec.affected_files, vec!["src/api.rs"]);
    }
}
