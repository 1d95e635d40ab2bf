//! Prompt composer -- assembles the six-layer execution prompt.
//!
//! Layers, in fixed order, each under a delimited section header:
//!
//! 1. Organization context prompt.
//! 2. Team description prompts, root-first down the team tree.
//! 3. Role system prompt.
//! 4. Agent-custom prompt.
//! 5. Relevant prior knowledge (top-K artifacts above the score threshold,
//!    retrieved by embedding the task title + description).
//! 6. The task block: title, description, acceptance criteria, affected
//!    files, dependency titles, and -- on re-execution after a CI failure --
//!    the most recent CI feedback, verbatim.
//!
//! The composer is pure apart from entity loads; its only failure mode is a
//! missing referenced entity.

use std::fmt::Write as _;

use anyhow::Result;
use sqlx::PgPool;

use hollon_db::models::{Agent, Task};
use hollon_db::queries::{knowledge, orgs, roles, tasks, teams};

use crate::embedding::embed_text;
use crate::error::CoreError;

/// Retrieval knobs for the knowledge layer.
#[derive(Debug, Clone, Copy)]
pub struct KnowledgeRetrieval {
    pub top_k: usize,
    pub min_score: f32,
}

impl Default for KnowledgeRetrieval {
    fn default() -> Self {
        Self {
            top_k: 5,
            min_score: 0.70,
        }
    }
}

/// Composes execution prompts from layered context.
#[derive(Debug, Clone, Copy, Default)]
pub struct PromptComposer {
    pub retrieval: KnowledgeRetrieval,
}

impl PromptComposer {
    /// Build the full six-layer prompt for `agent` executing `task`.
    pub async fn compose(&self, pool: &PgPool, agent: &Agent, task: &Task) -> Result<String> {
        let org = orgs::get_organization(pool, agent.organization_id)
            .await?
            .ok_or_else(|| {
                CoreError::NotFound(format!("organization {}", agent.organization_id))
            })?;
        let team_chain = teams::team_chain_root_first(pool, agent.team_id).await?;
        let role = roles::get_role(pool, agent.role_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("role {}", agent.role_id)))?;

        let mut prompt = String::new();

        section(&mut prompt, "Organization Context", &org.context_prompt);

        let team_block = team_chain
            .iter()
            .map(|t| t.description_prompt.as_str())
            .filter(|p| !p.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        section(&mut prompt, "Team", &team_block);

        section(&mut prompt, "Role", &role.system_prompt);

        section(
            &mut prompt,
            "Agent Instructions",
            agent.custom_prompt.as_deref().unwrap_or(""),
        );

        let knowledge_block = self.knowledge_block(pool, agent, task).await?;
        section(&mut prompt, "Relevant Prior Knowledge", &knowledge_block);

        let task_block = self.task_block(pool, task).await?;
        section(&mut prompt, "Task", &task_block);

        Ok(prompt)
    }

    /// Layer 5: retrieved artifacts joined title-first, empty when nothing
    /// clears the score threshold.
    async fn knowledge_block(&self, pool: &PgPool, agent: &Agent, task: &Task) -> Result<String> {
        let query_text = format!("{}\n{}", task.title, task.description);
        let embedding = embed_text(&query_text);
        if embedding.iter().all(|x| *x == 0.0) {
            return Ok(String::new());
        }

        let artifacts = knowledge::find_similar_knowledge(
            pool,
            agent.organization_id,
            &embedding,
            self.retrieval.top_k,
            self.retrieval.min_score,
        )
        .await?;

        let mut block = String::new();
        for scored in &artifacts {
            let _ = writeln!(block, "### {}", scored.artifact.title);
            block.push_str(scored.artifact.content.trim());
            block.push_str("\n\n");
        }
        Ok(block.trim_end().to_string())
    }

    /// Layer 6: the task itself.
    async fn task_block(&self, pool: &PgPool, task: &Task) -> Result<String> {
        let mut block = String::new();

        let _ = writeln!(block, "Title: {}", task.title);
        let _ = writeln!(block, "Type: {}", task.task_type);
        let _ = writeln!(block, "Priority: {}", task.priority);
        block.push('\n');
        block.push_str("Description:\n");
        block.push_str(task.description.trim());
        block.push('\n');

        if !task.acceptance_criteria.is_empty() {
            block.push_str("\nAcceptance criteria:\n");
            for criterion in &task.acceptance_criteria {
                let _ = writeln!(block, "- {criterion}");
            }
        }

        if !task.affected_files.is_empty() {
            block.push_str("\nAffected files:\n");
            for file in &task.affected_files {
                let _ = writeln!(block, "- {file}");
            }
        }

        let dep_titles = tasks::dependency_titles(pool, task.id).await?;
        if !dep_titles.is_empty() {
            block.push_str("\nCompleted dependencies:\n");
            for title in &dep_titles {
                let _ = writeln!(block, "- {title}");
            }
        }

        if let Some(feedback) = &task.last_ci_feedback {
            block.push_str("\nThe previous attempt failed continuous integration. ");
            block.push_str("Address this feedback:\n");
            block.push_str(feedback);
            block.push('\n');
        }

        Ok(block)
    }
}

/// Append a delimited section. Empty bodies still get their header so the
/// layer order stays visible to the brain.
fn section(prompt: &mut String, title: &str, body: &str) {
    let _ = writeln!(prompt, "## {title}");
    let trimmed = body.trim();
    if !trimmed.is_empty() {
        prompt.push_str(trimmed);
        prompt.push('\n');
    }
    prompt.push('\n');
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sections_keep_fixed_order() {
        let mut p = String::new();
        section(&mut p, "First", "alpha");
        section(&mut p, "Second", "");
        section(&mut p, "Third", "gamma");

        let first = p.find("## First").unwrap();
        let second = p.find("## Second").unwrap();
        let third = p.find("## Third").unwrap();
        assert!(first < second && second < third);
        // Empty bodies keep their header.
        assert!(p.contains("## Second\n\n"));
    }
}
