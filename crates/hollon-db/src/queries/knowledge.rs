//! Database query functions for the `knowledge_artifacts` table.
//!
//! Retrieval is nearest-neighbor by cosine similarity. Candidates are
//! fetched org-scoped and scored in process; the embedding column is a
//! plain `real[]`, so any externally-computed vector of the same dimension
//! drops in unchanged.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::KnowledgeArtifact;

/// A retrieved artifact with its similarity score.
#[derive(Debug, Clone)]
pub struct ScoredArtifact {
    pub artifact: KnowledgeArtifact,
    pub score: f32,
}

/// Insert a new knowledge artifact.
pub async fn insert_artifact(
    pool: &PgPool,
    organization_id: Uuid,
    task_id: Option<Uuid>,
    title: &str,
    content: &str,
    embedding: &[f32],
) -> Result<KnowledgeArtifact> {
    let artifact = sqlx::query_as::<_, KnowledgeArtifact>(
        "INSERT INTO knowledge_artifacts (organization_id, task_id, title, content, embedding) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(organization_id)
    .bind(task_id)
    .bind(title)
    .bind(content)
    .bind(embedding)
    .fetch_one(pool)
    .await
    .context("failed to insert knowledge artifact")?;

    Ok(artifact)
}

/// Nearest-neighbor retrieval: the `top_k` artifacts in the organization
/// whose cosine similarity against `embedding` meets `min_score`, best
/// first.
pub async fn find_similar_knowledge(
    pool: &PgPool,
    organization_id: Uuid,
    embedding: &[f32],
    top_k: usize,
    min_score: f32,
) -> Result<Vec<ScoredArtifact>> {
    let candidates = sqlx::query_as::<_, KnowledgeArtifact>(
        "SELECT * FROM knowledge_artifacts WHERE organization_id = $1",
    )
    .bind(organization_id)
    .fetch_all(pool)
    .await
    .context("failed to fetch knowledge candidates")?;

    let mut scored: Vec<ScoredArtifact> = candidates
        .into_iter()
        .filter_map(|artifact| {
            let score = cosine_similarity(embedding, &artifact.embedding)?;
            (score >= min_score).then_some(ScoredArtifact { artifact, score })
        })
        .collect();

    scored.sort_by(|a, b| b.score.total_cmp(&a.score));
    scored.truncate(top_k);
    Ok(scored)
}

/// Cosine similarity between two vectors. `None` when the dimensions differ
/// or either vector has zero magnitude.
fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }
    Some(dot / (norm_a.sqrt() * norm_b.sqrt()))
}
