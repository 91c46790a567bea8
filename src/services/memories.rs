//! Memory CRUD with embedding and semantic dedup/retrieval.

use tracing::{debug, info};

use crate::cache::Memory;
use crate::embeddings::cosine_similarity;

use super::Services;

impl Services {
    pub fn get_memories(&self, user_id: i64) -> Vec<Memory> {
        self.cache.get_memories(user_id)
    }

    pub fn memory_count(&self, user_id: i64) -> usize {
        self.cache.get_memories(user_id).len()
    }

    /// Save a memory. When the embedding provider is configured the content
    /// is vectorised and at most one semantically-duplicate existing memory
    /// (similarity above the dedup threshold) is replaced.
    pub async fn add_memory(&self, user_id: i64, content: &str, source: &str) -> Memory {
        let content = content.trim();
        let embedding = match &self.embeddings {
            Some(client) => match client.embed(content).await {
                Ok(vector) => Some(vector),
                Err(e) => {
                    debug!(user_id, "embedding failed, saving memory without vector: {e}");
                    None
                }
            },
            None => None,
        };

        if let Some(vector) = &embedding {
            let existing = self.cache.get_memories(user_id);
            for (index, memory) in existing.iter().enumerate() {
                let Some(other) = &memory.embedding else { continue };
                let similarity = cosine_similarity(vector, other);
                if similarity > self.dedup_threshold {
                    info!(
                        user_id,
                        similarity, "replacing near-duplicate memory: '{}'", memory.content
                    );
                    self.cache.delete_memory(user_id, index);
                    break;
                }
            }
        }

        self.cache.add_memory(user_id, content, source, embedding)
    }

    /// Delete by 1-based index as shown to the user.
    pub fn delete_memory(&self, user_id: i64, index: usize) -> bool {
        if index == 0 {
            return false;
        }
        self.cache.delete_memory(user_id, index - 1)
    }

    /// Returns how many memories were removed.
    pub fn clear_memories(&self, user_id: i64) -> usize {
        self.cache.clear_memories(user_id)
    }

    /// Memories formatted for system-prompt injection.
    ///
    /// With a query and a configured embedding provider, only memories above
    /// the similarity threshold are kept (top-K, scored descending); memories
    /// without embeddings are always included. Otherwise all memories are
    /// returned.
    pub async fn format_memories_for_prompt(&self, user_id: i64, query: Option<&str>) -> Option<String> {
        let memories = self.cache.get_memories(user_id);
        if memories.is_empty() {
            return None;
        }

        if let (Some(query), Some(client)) = (query.filter(|q| !q.is_empty()), &self.embeddings) {
            if let Ok(query_embedding) = client.embed(query).await {
                let block = select_relevant(
                    &memories,
                    &query_embedding,
                    self.memory_top_k,
                    self.similarity_threshold,
                );
                debug!(user_id, found = block.is_some(), "memory vector search");
                return block;
            }
        }

        let mut lines = vec!["User memories (use these to personalize responses):".to_string()];
        for memory in &memories {
            lines.push(format!("- {}", memory.content));
        }
        Some(lines.join("\n"))
    }
}

/// Score embedded memories against the query, keep the top-K above the
/// threshold, and always append memories that never got a vector.
fn select_relevant(
    memories: &[Memory],
    query_embedding: &[f32],
    top_k: usize,
    threshold: f32,
) -> Option<String> {
    let mut scored: Vec<(f32, &Memory)> = Vec::new();
    let mut unembedded: Vec<&Memory> = Vec::new();
    for memory in memories {
        match &memory.embedding {
            Some(vector) => scored.push((cosine_similarity(query_embedding, vector), memory)),
            None => unembedded.push(memory),
        }
    }
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    let relevant: Vec<&Memory> = scored
        .iter()
        .take(top_k)
        .filter(|(score, _)| *score >= threshold)
        .map(|(_, memory)| *memory)
        .collect();

    if relevant.is_empty() && unembedded.is_empty() {
        return None;
    }
    let mut lines = vec!["User memories (relevant to current conversation):".to_string()];
    for memory in relevant.into_iter().chain(unembedded) {
        lines.push(format!("- {}", memory.content));
    }
    Some(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory(content: &str, embedding: Option<Vec<f32>>) -> Memory {
        Memory {
            id: 1,
            user_id: 1,
            content: content.to_string(),
            source: "user".to_string(),
            embedding,
        }
    }

    #[test]
    fn below_threshold_memories_are_excluded() {
        // Orthogonal to the query: similarity 0, below any threshold.
        let memories: Vec<Memory> = (0..20)
            .map(|i| memory(&format!("fact {i}"), Some(vec![0.0, 1.0])))
            .collect();
        assert_eq!(select_relevant(&memories, &[1.0, 0.0], 10, 0.35), None);
    }

    #[test]
    fn unembedded_memories_survive_irrelevant_queries() {
        let memories = vec![
            memory("irrelevant", Some(vec![0.0, 1.0])),
            memory("legacy note", None),
        ];
        let block = select_relevant(&memories, &[1.0, 0.0], 10, 0.35).unwrap();
        assert!(block.contains("legacy note"));
        assert!(!block.contains("irrelevant"));
    }

    #[test]
    fn top_k_caps_the_relevant_set() {
        let memories: Vec<Memory> = (0..15)
            .map(|i| memory(&format!("fact {i}"), Some(vec![1.0, 0.0])))
            .collect();
        let block = select_relevant(&memories, &[1.0, 0.0], 10, 0.35).unwrap();
        let count = block.lines().filter(|l| l.starts_with("- ")).count();
        assert_eq!(count, 10);
    }

    #[test]
    fn results_sort_by_similarity_descending() {
        let memories = vec![
            memory("weak match", Some(vec![0.6, 0.8])),
            memory("strong match", Some(vec![1.0, 0.0])),
        ];
        let block = select_relevant(&memories, &[1.0, 0.0], 10, 0.35).unwrap();
        let strong = block.find("strong match").unwrap();
        let weak = block.find("weak match").unwrap();
        assert!(strong < weak);
    }
}
