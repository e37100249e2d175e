//! On-demand TF-IDF similarity over chunk content.
//!
//! No index is persisted; every call re-tokenises the corpus (scoped to the
//! target's project when it has one) and ranks by cosine similarity. Fine
//! single-threaded at the corpus sizes this serves.

use std::collections::HashMap;

use serde::Serialize;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::store::Store;

/// Similarities at or below this are treated as noise.
const MIN_SIMILARITY: f64 = 0.01;

/// Number of shared terms reported per result.
const SHARED_TERM_COUNT: usize = 3;

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "are", "but", "not", "you", "all", "can", "had", "her", "was", "one",
    "our", "out", "day", "get", "has", "him", "his", "how", "man", "new", "now", "old", "see",
    "two", "way", "who", "with", "this", "that", "from", "they", "will", "would", "there",
    "their", "what", "about", "which", "when", "were", "your", "said", "each", "she", "them",
    "then", "than", "some", "into", "more", "other", "have", "been", "its", "also", "just",
    "should", "could", "these", "those", "over", "only", "very", "after", "before", "where",
    "while", "because", "does", "doing", "during", "until", "against", "between", "through",
];

/// A related chunk with its similarity score and the strongest terms the
/// two chunks share.
#[derive(Debug, Clone, Serialize)]
pub struct RelatedChunk {
    pub id: Uuid,
    pub similarity: f64,
    pub shared_terms: Vec<String>,
}

/// Lowercase, split on non-alphanumeric-underscore, drop short tokens and
/// stopwords.
fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| t.len() >= 3)
        .filter(|t| !STOPWORDS.contains(t))
        .map(|t| t.to_string())
        .collect()
}

fn term_frequencies(tokens: &[String]) -> HashMap<String, f64> {
    let mut tf = HashMap::new();
    for token in tokens {
        *tf.entry(token.clone()).or_insert(0.0) += 1.0;
    }
    tf
}

fn cosine(a: &HashMap<String, f64>, b: &HashMap<String, f64>) -> f64 {
    let dot: f64 = a
        .iter()
        .filter_map(|(term, weight)| b.get(term).map(|other| weight * other))
        .sum();
    let norm_a: f64 = a.values().map(|w| w * w).sum::<f64>().sqrt();
    let norm_b: f64 = b.values().map(|w| w * w).sum::<f64>().sqrt();
    let denom = norm_a * norm_b;
    if denom < f64::EPSILON {
        return 0.0;
    }
    dot / denom
}

/// Find the `top_k` chunks most similar to `target_id`.
///
/// Never returns the target itself; all similarities are in
/// (`MIN_SIMILARITY`, 1.0].
pub async fn find_related(
    store: &dyn Store,
    target_id: Uuid,
    top_k: usize,
) -> Result<Vec<RelatedChunk>> {
    let target = store.get_chunk(target_id).await?;
    let corpus = store.all_chunk_content(target.project_id).await?;

    let mut target_tf: Option<HashMap<String, f64>> = None;
    let mut docs: Vec<(Uuid, HashMap<String, f64>)> = Vec::new();
    let mut df: HashMap<String, f64> = HashMap::new();

    for (id, content) in &corpus {
        let tf = term_frequencies(&tokenize(content));
        for term in tf.keys() {
            *df.entry(term.clone()).or_insert(0.0) += 1.0;
        }
        if *id == target_id {
            target_tf = Some(tf);
        } else {
            docs.push((*id, tf));
        }
    }

    let target_tf = target_tf.ok_or_else(|| Error::not_found("chunk", target_id))?;
    let n = corpus.len() as f64;

    let weigh = |tf: &HashMap<String, f64>| -> HashMap<String, f64> {
        tf.iter()
            .map(|(term, freq)| {
                let idf = (n / (1.0 + df.get(term).copied().unwrap_or(0.0))).ln();
                (term.clone(), freq * idf)
            })
            .collect()
    };

    let target_vec = weigh(&target_tf);
    let mut scored: Vec<(Uuid, f64, HashMap<String, f64>)> = docs
        .into_iter()
        .map(|(id, tf)| {
            let vec = weigh(&tf);
            let sim = cosine(&target_vec, &vec);
            (id, sim, vec)
        })
        .filter(|(_, sim, _)| *sim > MIN_SIMILARITY)
        .collect();

    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(top_k);

    Ok(scored
        .into_iter()
        .map(|(id, similarity, vec)| {
            let mut shared: Vec<(String, f64)> = vec
                .iter()
                .filter_map(|(term, weight)| {
                    target_vec
                        .get(term)
                        .map(|target_weight| (term.clone(), weight + target_weight))
                })
                .collect();
            shared.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            shared.truncate(SHARED_TERM_COUNT);
            RelatedChunk {
                id,
                similarity: similarity.min(1.0),
                shared_terms: shared.into_iter().map(|(term, _)| term).collect(),
            }
        })
        .collect())
}
