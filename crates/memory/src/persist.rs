//! Structural graph persistence — node-link JSON with atomic replacement.
//!
//! Crash-safety guarantee: the snapshot is written to a `.tmp` sibling
//! file, `fsync`'d, then renamed over the original.  A crash before the
//! rename leaves the original untouched; a crash after leaves a consistent
//! new file.  The `.tmp` file is cleaned up on any error path.

use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::graph::EventGraph;
use crate::schema::MemoryEvent;

#[derive(Debug, Serialize, Deserialize)]
struct LinkRecord {
    source: Uuid,
    target: Uuid,
    relation: String,
}

/// Node-link form of a graph: full events plus labeled edges.
#[derive(Debug, Serialize, Deserialize)]
struct GraphSnapshot {
    nodes: Vec<MemoryEvent>,
    links: Vec<LinkRecord>,
}

/// Atomically write the graph to `path`.
pub async fn save_graph(graph: &EventGraph, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let snapshot = GraphSnapshot {
        nodes: graph.iter().cloned().collect(),
        links: graph
            .edge_triples()
            .into_iter()
            .map(|(source, target, relation)| LinkRecord {
                source,
                target,
                relation,
            })
            .collect(),
    };

    let tmp_path = {
        let filename = path
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_else(|| "graph.json".to_string());
        path.with_file_name(format!("{filename}.tmp"))
    };

    let write_result: Result<()> = async {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .await?;
        file.write_all(serde_json::to_vec_pretty(&snapshot)?.as_slice())
            .await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }
    .await;

    if let Err(err) = write_result {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(err);
    }

    if let Err(err) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(err.into());
    }

    Ok(())
}

/// Load a previously saved graph.  The result is observationally equal to
/// the graph that was saved: same node ids, payload values, edge set and
/// timestamp instants (offset included).
pub async fn load_graph(path: impl AsRef<Path>) -> Result<EventGraph> {
    let raw = tokio::fs::read(path.as_ref()).await?;
    let snapshot: GraphSnapshot = serde_json::from_slice(&raw)?;
    let edges = snapshot
        .links
        .into_iter()
        .map(|link| (link.source, link.target, link.relation))
        .collect();
    Ok(EventGraph::from_parts(snapshot.nodes, edges)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, TimeZone};
    use serde_json::{Map, Value};
    use tempfile::TempDir;

    fn sample_graph() -> EventGraph {
        let offset = FixedOffset::east_opt(-5 * 3600).unwrap();
        let base = offset.with_ymd_and_hms(2025, 2, 3, 9, 15, 0).unwrap();
        let mut graph = EventGraph::new();
        let mut ids = Vec::new();
        for i in 0..3 {
            let mut payload = Map::new();
            payload.insert("text".into(), Value::String(format!("event {i}")));
            payload.insert("valence".into(), Value::from(0.25 * i as f64));
            let ev = MemoryEvent::new(
                "user_input",
                payload,
                base + chrono::Duration::minutes(i),
            );
            ids.push(ev.id);
            graph.add_event(ev);
        }
        graph.link_events(ids[0], ids[2], "shared_anchor").unwrap();
        graph
    }

    #[tokio::test]
    async fn roundtrip_preserves_nodes_edges_and_instants() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("graph.json");

        let graph = sample_graph();
        save_graph(&graph, &path).await.unwrap();
        let loaded = load_graph(&path).await.unwrap();

        assert_eq!(loaded.node_count(), graph.node_count());
        assert_eq!(loaded.edge_count(), graph.edge_count());

        let mut original: Vec<_> = graph.iter().cloned().collect();
        let mut restored: Vec<_> = loaded.iter().cloned().collect();
        original.sort_by_key(|e| e.id);
        restored.sort_by_key(|e| e.id);
        assert_eq!(original, restored);
        for (a, b) in original.iter().zip(&restored) {
            assert_eq!(a.timestamp.offset(), b.timestamp.offset());
        }

        let mut saved_edges = graph.edge_triples();
        let mut loaded_edges = loaded.edge_triples();
        saved_edges.sort();
        loaded_edges.sort();
        assert_eq!(saved_edges, loaded_edges);
    }

    #[tokio::test]
    async fn loaded_graph_continues_temporal_linking() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("graph.json");
        let graph = sample_graph();
        let last_id = graph.iter().last().unwrap().id;
        save_graph(&graph, &path).await.unwrap();

        let mut loaded = load_graph(&path).await.unwrap();
        let edges_before = loaded.edge_count();
        let next = MemoryEvent::new(
            "user_input",
            Map::new(),
            FixedOffset::east_opt(0)
                .unwrap()
                .with_ymd_and_hms(2025, 2, 3, 18, 0, 0)
                .unwrap(),
        );
        let next_id = next.id;
        loaded.add_event(next);

        assert_eq!(loaded.edge_count(), edges_before + 1);
        assert!(
            loaded
                .edge_triples()
                .iter()
                .any(|(s, d, r)| *s == last_id && *d == next_id && r == "next_in_time")
        );
    }

    #[tokio::test]
    async fn save_creates_parent_directories_and_leaves_no_tmp() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/deep/graph.json");
        save_graph(&sample_graph(), &path).await.unwrap();
        assert!(path.exists());
        assert!(!path.with_file_name("graph.json.tmp").exists());
    }

    #[tokio::test]
    async fn corrupt_file_is_a_load_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("graph.json");
        tokio::fs::write(&path, b"{ not json").await.unwrap();
        assert!(load_graph(&path).await.is_err());
    }

    #[tokio::test]
    async fn empty_graph_roundtrips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("graph.json");
        save_graph(&EventGraph::new(), &path).await.unwrap();
        let loaded = load_graph(&path).await.unwrap();
        assert!(loaded.is_empty());
        assert_eq!(loaded.edge_count(), 0);
    }
}
