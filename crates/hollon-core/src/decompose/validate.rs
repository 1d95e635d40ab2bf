//! Phase-B plan validation.
//!
//! A subtask plan is rejected wholesale -- never partially materialized --
//! when any of the following hold:
//!
//! - duplicate subtask titles;
//! - an assignee who is not a member of the target team;
//! - a dependency referencing a title not in the plan;
//! - a cycle in the title-level dependency graph;
//! - more than [`MAX_SUBTASKS`] subtasks;
//! - an unparseable type, priority, or complexity value.
//!
//! Cycle detection uses depth-first search with three-color marking: a
//! back-edge to a gray node is a cycle. Kahn's algorithm then produces the
//! materialization order so dependency rows always reference already
//! inserted tasks.

use std::collections::{HashMap, HashSet, VecDeque};

use thiserror::Error;

use hollon_db::models::{TaskComplexity, TaskPriority, TaskType};

use super::plan_format::{SubtaskPlan, SubtaskSpec};

/// Hard cap on subtasks in one plan.
pub const MAX_SUBTASKS: usize = 10;

/// Errors that reject a subtask plan.
#[derive(Debug, Error)]
pub enum PlanValidationError {
    #[error("plan contains no subtasks")]
    Empty,

    #[error("plan has {0} subtasks, more than the cap of {MAX_SUBTASKS}")]
    TooManySubtasks(usize),

    #[error("duplicate subtask title: {0:?}")]
    DuplicateTitle(String),

    #[error("subtask {task:?} is assigned to {assignee:?}, who is not on the team")]
    UnknownAssignee { task: String, assignee: String },

    #[error("subtask {task:?} depends on unknown title {dependency:?}")]
    UnknownDependency { task: String, dependency: String },

    #[error("dependency cycle detected involving: {0}")]
    CycleDetected(String),

    #[error("invalid {field} {value:?} on subtask {task:?}")]
    InvalidField {
        task: String,
        field: &'static str,
        value: String,
    },

    #[error("subtask {task:?} has type team_epic; epics cannot appear in a leaf plan")]
    NestedEpic { task: String },
}

/// A validated plan: specs with resolved enums, in materialization order.
#[derive(Debug, Clone)]
pub struct ValidatedPlan {
    /// Subtasks in a topological order of the dependency graph.
    pub ordered: Vec<ValidatedSubtask>,
}

/// One validated subtask with parsed enum fields.
#[derive(Debug, Clone)]
pub struct ValidatedSubtask {
    pub spec: SubtaskSpec,
    pub task_type: TaskType,
    pub priority: TaskPriority,
    pub complexity: Option<TaskComplexity>,
}

/// Validate a phase-B plan against the target team's member names
/// (case-insensitively).
pub fn validate_plan(
    plan: &SubtaskPlan,
    team_member_names: &[String],
) -> Result<ValidatedPlan, PlanValidationError> {
    if plan.subtasks.is_empty() {
        return Err(PlanValidationError::Empty);
    }
    if plan.subtasks.len() > MAX_SUBTASKS {
        return Err(PlanValidationError::TooManySubtasks(plan.subtasks.len()));
    }

    let members: HashSet<String> = team_member_names.iter().map(|n| n.to_lowercase()).collect();

    // Titles must be unique; they are the dependency namespace.
    let mut titles = HashSet::new();
    for spec in &plan.subtasks {
        if !titles.insert(spec.title.as_str()) {
            return Err(PlanValidationError::DuplicateTitle(spec.title.clone()));
        }
    }

    let mut validated = Vec::with_capacity(plan.subtasks.len());
    for spec in &plan.subtasks {
        if !members.contains(&spec.assignee.to_lowercase()) {
            return Err(PlanValidationError::UnknownAssignee {
                task: spec.title.clone(),
                assignee: spec.assignee.clone(),
            });
        }

        for dep in &spec.depends_on {
            if !titles.contains(dep.as_str()) {
                return Err(PlanValidationError::UnknownDependency {
                    task: spec.title.clone(),
                    dependency: dep.clone(),
                });
            }
        }

        let task_type: TaskType =
            spec.task_type
                .parse()
                .map_err(|_| PlanValidationError::InvalidField {
                    task: spec.title.clone(),
                    field: "task type",
                    value: spec.task_type.clone(),
                })?;
        if task_type == TaskType::TeamEpic {
            return Err(PlanValidationError::NestedEpic {
                task: spec.title.clone(),
            });
        }

        let priority: TaskPriority =
            spec.priority
                .parse()
                .map_err(|_| PlanValidationError::InvalidField {
                    task: spec.title.clone(),
                    field: "priority",
                    value: spec.priority.clone(),
                })?;

        let complexity = match &spec.complexity {
            None => None,
            Some(raw) => Some(raw.parse::<TaskComplexity>().map_err(|_| {
                PlanValidationError::InvalidField {
                    task: spec.title.clone(),
                    field: "complexity",
                    value: raw.clone(),
                }
            })?),
        };

        validated.push(ValidatedSubtask {
            spec: spec.clone(),
            task_type,
            priority,
            complexity,
        });
    }

    detect_cycle(plan)?;
    let order = topological_order(plan);

    let mut by_title: HashMap<String, ValidatedSubtask> = validated
        .into_iter()
        .map(|v| (v.spec.title.clone(), v))
        .collect();

    let ordered = order
        .into_iter()
        .filter_map(|title| by_title.remove(&title))
        .collect();

    Ok(ValidatedPlan { ordered })
}

/// Three-color DFS cycle detection over the title graph.
fn detect_cycle(plan: &SubtaskPlan) -> Result<(), PlanValidationError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    let index: HashMap<&str, usize> = plan
        .subtasks
        .iter()
        .enumerate()
        .map(|(i, s)| (s.title.as_str(), i))
        .collect();

    // Edge: task -> its dependency.
    let adj: Vec<Vec<usize>> = plan
        .subtasks
        .iter()
        .map(|s| s.depends_on.iter().map(|d| index[d.as_str()]).collect())
        .collect();

    let n = plan.subtasks.len();
    let mut colors = vec![Color::White; n];

    fn visit(
        node: usize,
        adj: &[Vec<usize>],
        colors: &mut [Color],
        plan: &SubtaskPlan,
    ) -> Result<(), PlanValidationError> {
        colors[node] = Color::Gray;
        for &next in &adj[node] {
            match colors[next] {
                // Back-edge to a gray node: cycle.
                Color::Gray => {
                    return Err(PlanValidationError::CycleDetected(format!(
                        "{:?} -> {:?}",
                        plan.subtasks[node].title, plan.subtasks[next].title
                    )));
                }
                Color::White => visit(next, adj, colors, plan)?,
                Color::Black => {}
            }
        }
        colors[node] = Color::Black;
        Ok(())
    }

    for node in 0..n {
        if colors[node] == Color::White {
            visit(node, &adj, &mut colors, plan)?;
        }
    }
    Ok(())
}

/// Kahn's algorithm: titles in an order where every dependency precedes its
/// dependents. Assumes [`detect_cycle`] already passed.
fn topological_order(plan: &SubtaskPlan) -> Vec<String> {
    let index: HashMap<&str, usize> = plan
        .subtasks
        .iter()
        .enumerate()
        .map(|(i, s)| (s.title.as_str(), i))
        .collect();

    let n = plan.subtasks.len();
    let mut in_degree = vec![0usize; n];
    let mut dependents: Vec<Vec<usize>> = vec![vec![]; n];

    for (i, spec) in plan.subtasks.iter().enumerate() {
        for dep in &spec.depends_on {
            let dep_idx = index[dep.as_str()];
            dependents[dep_idx].push(i);
            in_degree[i] += 1;
        }
    }

    let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);

    while let Some(node) = queue.pop_front() {
        order.push(plan.subtasks[node].title.clone());
        for &dependent in &dependents[node] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                queue.push_back(dependent);
            }
        }
    }

    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decompose::plan_format::extract_plan;

    fn members() -> Vec<String> {
        vec!["dev-1".to_string(), "dev-2".to_string()]
    }

    fn plan_from(raw: &str) -> SubtaskPlan {
        extract_plan(raw).expect("test plan should parse")
    }

    #[test]
    fn accepts_valid_plan_in_dependency_order() {
        let plan = plan_from(
            r#"{"subtasks": [
                {"title": "b", "assignee": "dev-2", "depends_on": ["a"]},
                {"title": "a", "assignee": "dev-1"},
                {"title": "c", "assignee": "dev-1", "depends_on": ["a", "b"]}
            ]}"#,
        );
        let validated = validate_plan(&plan, &members()).unwrap();
        let order: Vec<&str> = validated
            .ordered
            .iter()
            .map(|v| v.spec.title.as_str())
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn rejects_empty_plan() {
        let plan = plan_from(r#"{"subtasks": []}"#);
        assert!(matches!(
            validate_plan(&plan, &members()),
            Err(PlanValidationError::Empty)
        ));
    }

    #[test]
    fn rejects_more_than_ten_subtasks() {
        let subtasks: Vec<String> = (0..11)
            .map(|i| format!(r#"{{"title": "t{i}", "assignee": "dev-1"}}"#))
            .collect();
        let plan = plan_from(&format!(r#"{{"subtasks": [{}]}}"#, subtasks.join(",")));
        assert!(matches!(
            validate_plan(&plan, &members()),
            Err(PlanValidationError::TooManySubtasks(11))
        ));
    }

    #[test]
    fn rejects_duplicate_titles() {
        let plan = plan_from(
            r#"{"subtasks": [
                {"title": "a", "assignee": "dev-1"},
                {"title": "a", "assignee": "dev-2"}
            ]}"#,
        );
        assert!(matches!(
            validate_plan(&plan, &members()),
            Err(PlanValidationError::DuplicateTitle(_))
        ));
    }

    #[test]
    fn rejects_assignee_outside_team() {
        let plan = plan_from(r#"{"subtasks": [{"title": "a", "assignee": "stranger"}]}"#);
        assert!(matches!(
            validate_plan(&plan, &members()),
            Err(PlanValidationError::UnknownAssignee { .. })
        ));
    }

    #[test]
    fn assignee_match_is_case_insensitive() {
        let plan = plan_from(r#"{"subtasks": [{"title": "a", "assignee": "Dev-1"}]}"#);
        assert!(validate_plan(&plan, &members()).is_ok());
    }

    #[test]
    fn rejects_unknown_dependency_title() {
        let plan = plan_from(
            r#"{"subtasks": [{"title": "a", "assignee": "dev-1", "depends_on": ["ghost"]}]}"#,
        );
        assert!(matches!(
            validate_plan(&plan, &members()),
            Err(PlanValidationError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn rejects_direct_cycle() {
        let plan = plan_from(
            r#"{"subtasks": [
                {"title": "a", "assignee": "dev-1", "depends_on": ["b"]},
                {"title": "b", "assignee": "dev-1", "depends_on": ["a"]}
            ]}"#,
        );
        assert!(matches!(
            validate_plan(&plan, &members()),
            Err(PlanValidationError::CycleDetected(_))
        ));
    }

    #[test]
    fn rejects_transitive_cycle() {
        let plan = plan_from(
            r#"{"subtasks": [
                {"title": "a", "assignee": "dev-1", "depends_on": ["c"]},
                {"title": "b", "assignee": "dev-1", "depends_on": ["a"]},
                {"title": "c", "assignee": "dev-1", "depends_on": ["b"]}
            ]}"#,
        );
        assert!(matches!(
            validate_plan(&plan, &members()),
            Err(PlanValidationError::CycleDetected(_))
        ));
    }

    #[test]
    fn accepts_diamond_dag() {
        let plan = plan_from(
            r#"{"subtasks": [
                {"title": "a", "assignee": "dev-1"},
                {"title": "b", "assignee": "dev-1", "depends_on": ["a"]},
                {"title": "c", "assignee": "dev-2", "depends_on": ["a"]},
                {"title": "d", "assignee": "dev-2", "depends_on": ["b", "c"]}
            ]}"#,
        );
        let validated = validate_plan(&plan, &members()).unwrap();
        assert_eq!(validated.ordered.len(), 4);
        assert_eq!(validated.ordered[0].spec.title, "a");
        assert_eq!(validated.ordered[3].spec.title, "d");
    }

    #[test]
    fn rejects_invalid_priority_and_nested_epic() {
        let plan = plan_from(
            r#"{"subtasks": [{"title": "a", "assignee": "dev-1", "priority": "urgent"}]}"#,
        );
        assert!(matches!(
            validate_plan(&plan, &members()),
            Err(PlanValidationError::InvalidField { field: "priority", .. })
        ));

        let plan = plan_from(
            r#"{"subtasks": [{"title": "a", "assignee": "dev-1", "task_type": "team_epic"}]}"#,
        );
        assert!(matches!(
            validate_plan(&plan, &members()),
            Err(PlanValidationError::NestedEpic { .. })
        ));
    }
}
