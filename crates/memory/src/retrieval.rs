//! Semantic retrieval over the event graph.
//!
//! Embeds the query and every event's payload text through a pluggable
//! async embedding function, ranks by cosine similarity, and caches results
//! per `(query, k, graph-version)`.  Keying on the graph's mutation counter
//! makes stale hits structurally impossible: any append or link bumps the
//! version and misses the cache.

use std::future::Future;
use std::num::NonZeroUsize;
use std::pin::Pin;
use std::sync::Arc;

use lru::LruCache;
use tracing::debug;

use crate::graph::EventGraph;
use crate::schema::MemoryEvent;

/// An async function that maps a text string to an optional embedding
/// vector.  Stored as an `Arc` so it can be cloned across structs; `None`
/// signals an embedding failure, which degrades retrieval to an empty
/// result rather than failing the turn.
pub type EmbedFn =
    Arc<dyn Fn(String) -> Pin<Box<dyn Future<Output = Option<Vec<f32>>> + Send>> + Send + Sync>;

/// The text a semantic query is matched against: the event's `text` payload
/// field, or the whole payload serialized when no text field exists.
pub fn event_text(event: &MemoryEvent) -> String {
    match event.payload.get("text").and_then(|v| v.as_str()) {
        Some(text) => text.to_string(),
        None => serde_json::Value::Object(event.payload.clone()).to_string(),
    }
}

/// Cosine similarity with a zero-norm guard: if either vector has zero
/// norm the similarity is 0, never a division by zero.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm = |v: &[f32]| v.iter().map(|x| x * x).sum::<f32>().sqrt();
    let denom = norm(a) * norm(b);
    if denom == 0.0 { 0.0 } else { dot / denom }
}

type CacheKey = (String, usize, u64);

pub struct SemanticRetriever {
    embed: EmbedFn,
    cache: LruCache<CacheKey, Vec<MemoryEvent>>,
}

impl SemanticRetriever {
    /// `cache_size` is the number of distinct `(query, k)` results kept;
    /// entries are evicted least-recently-used once at capacity.
    pub fn new(embed: EmbedFn, cache_size: usize) -> Self {
        let cap = NonZeroUsize::new(cache_size.max(1)).expect("max(1) is non-zero");
        Self {
            embed,
            cache: LruCache::new(cap),
        }
    }

    /// Top-`k` events by descending cosine similarity to `query`.
    ///
    /// Ties keep the graph's insertion order (the sort is stable) — callers
    /// must not rely on any other ordering between equal scores.  An
    /// embedding failure on the query yields an empty result; a failure on
    /// a single event scores that event 0.
    pub async fn retrieve_semantic(
        &mut self,
        graph: &EventGraph,
        query: &str,
        k: usize,
    ) -> Vec<MemoryEvent> {
        let key = (query.to_string(), k, graph.version());
        if let Some(hit) = self.cache.get(&key) {
            return hit.clone();
        }

        let Some(query_vec) = (self.embed)(query.to_string()).await else {
            debug!(query, "query embedding failed; returning no memories");
            return Vec::new();
        };

        let mut scored: Vec<(f32, &MemoryEvent)> = Vec::with_capacity(graph.node_count());
        for event in graph.iter() {
            let score = match (self.embed)(event_text(event)).await {
                Some(vec) => cosine_similarity(&query_vec, &vec),
                None => 0.0,
            };
            scored.push((score, event));
        }
        // Stable sort: equal similarities preserve graph iteration order.
        scored.sort_by(|(a, _), (b, _)| b.total_cmp(a));

        let result: Vec<MemoryEvent> = scored
            .into_iter()
            .take(k)
            .map(|(_, event)| event.clone())
            .collect();
        self.cache.put(key, result.clone());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, FixedOffset, TimeZone};
    use serde_json::{Map, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Deterministic toy embedder: counts of 'a', 'b' and 'c'.  Returns
    /// `None` for text containing "fail" to simulate a backend outage.
    fn counting_embedder(calls: Arc<AtomicUsize>) -> EmbedFn {
        Arc::new(move |text: String| {
            calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if text.contains("fail") {
                    return None;
                }
                let count = |ch: char| text.chars().filter(|&c| c == ch).count() as f32;
                Some(vec![count('a'), count('b'), count('c')])
            })
        })
    }

    fn text_event(text: &str, minutes: i64) -> MemoryEvent {
        let ts = FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2025, 6, 1, 0, 0, 0)
            .unwrap()
            + Duration::minutes(minutes);
        let mut payload = Map::new();
        payload.insert("text".into(), Value::String(text.into()));
        MemoryEvent::new("user_input", payload, ts)
    }

    fn graph_with(texts: &[&str]) -> EventGraph {
        let mut graph = EventGraph::new();
        for (i, text) in texts.iter().enumerate() {
            graph.add_event(text_event(text, i as i64));
        }
        graph
    }

    #[test]
    fn cosine_zero_norm_is_zero_not_nan() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[0.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn event_text_falls_back_to_serialized_payload() {
        let mut payload = Map::new();
        payload.insert("valence".into(), Value::from(0.5));
        let ev = MemoryEvent::new(
            "sensor_reading",
            payload,
            FixedOffset::east_opt(0)
                .unwrap()
                .with_ymd_and_hms(2025, 6, 1, 0, 0, 0)
                .unwrap(),
        );
        assert_eq!(event_text(&ev), "{\"valence\":0.5}");
    }

    #[tokio::test]
    async fn returns_top_k_by_descending_similarity() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut retriever = SemanticRetriever::new(counting_embedder(calls), 8);
        let graph = graph_with(&["aaa", "abc", "zzz", "aab"]);

        let found = retriever.retrieve_semantic(&graph, "aa", 2).await;
        assert_eq!(found.len(), 2);
        assert_eq!(event_text(&found[0]), "aaa");
        assert_eq!(event_text(&found[1]), "aab");
    }

    #[tokio::test]
    async fn zero_embedding_scores_zero_without_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut retriever = SemanticRetriever::new(counting_embedder(calls), 8);
        // "zzz" embeds to the zero vector.
        let graph = graph_with(&["zzz"]);
        let found = retriever.retrieve_semantic(&graph, "aa", 5).await;
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn query_embedding_failure_degrades_to_empty() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut retriever = SemanticRetriever::new(counting_embedder(calls), 8);
        let graph = graph_with(&["aaa"]);
        let found = retriever.retrieve_semantic(&graph, "please fail", 3).await;
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn repeated_query_hits_cache_until_graph_mutates() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut retriever = SemanticRetriever::new(counting_embedder(calls.clone()), 8);
        let mut graph = graph_with(&["aaa", "abc"]);

        retriever.retrieve_semantic(&graph, "aa", 2).await;
        let after_first = calls.load(Ordering::SeqCst);
        retriever.retrieve_semantic(&graph, "aa", 2).await;
        assert_eq!(calls.load(Ordering::SeqCst), after_first, "second call must be cached");

        // Any mutation bumps the version and invalidates the cached entry.
        graph.add_event(text_event("aaaa", 99));
        let found = retriever.retrieve_semantic(&graph, "aa", 2).await;
        assert!(calls.load(Ordering::SeqCst) > after_first);
        assert_eq!(event_text(&found[0]), "aaaa");
    }

    #[tokio::test]
    async fn ties_keep_graph_insertion_order() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut retriever = SemanticRetriever::new(counting_embedder(calls), 8);
        // Both events embed identically; insertion order must win.
        let graph = graph_with(&["ab", "ab"]);
        let found = retriever.retrieve_semantic(&graph, "ab", 2).await;
        let order: Vec<_> = graph.iter().map(|e| e.id).collect();
        assert_eq!(found[0].id, order[0]);
        assert_eq!(found[1].id, order[1]);
    }
}
