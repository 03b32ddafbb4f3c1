//! Per-user session: the first-class handle owning one user's field state
//! and event graph.
//!
//! All interactive and background mutation for a user flows through the
//! session's single `tokio::Mutex`, so concurrent turns serialize rather
//! than interleave.  Persistence is at-least-once: every turn attempts to
//! write both files, a failed write is logged and the in-memory state stays
//! authoritative until the next successful write.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, FixedOffset};
use serde_json::{Map, Value, json};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use cogfield_config::CoreConfig;
use cogfield_dynamics::{FieldState, PersistedField, TurnDynamics, advance};
use cogfield_memory::{
    Clock, EventGraph, MemoryEvent, SemanticRetriever, event_text, persist,
    retrieval::EmbedFn,
};

use crate::bus::EventBus;
use crate::reflect;

/// How many recent collapse indices are inspected for anchor promotion.
const COLLAPSE_HISTORY_LEN: usize = 8;
/// A collapse index recurring this often in the window becomes an anchor.
const ANCHOR_RECURRENCE: usize = 3;

/// A retrieved memory reduced to what prompt construction needs.
#[derive(Debug, Clone)]
pub struct RecalledMemory {
    pub text: String,
    pub timestamp: DateTime<FixedOffset>,
}

/// Structured result of one interactive turn, handed to the
/// response-generation collaborator.
#[derive(Debug)]
pub struct TurnOutcome {
    pub dynamics: TurnDynamics,
    pub memories: Vec<RecalledMemory>,
}

/// Everything guarded by the per-user lock.
pub struct SessionState {
    pub graph: EventGraph,
    pub field: FieldState,
    retriever: SemanticRetriever,
    collapse_history: VecDeque<usize>,
    session_anchors: HashSet<usize>,
}

pub struct Session {
    state: Arc<Mutex<SessionState>>,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    config: CoreConfig,
    state_path: PathBuf,
    graph_path: PathBuf,
}

impl Session {
    /// Open (or freshly create) the session for one user directory.
    ///
    /// A missing file means first use; an unreadable or malformed file is
    /// recovered locally by reinitialising that component and logging —
    /// never a fatal error.
    pub async fn open(
        user_dir: impl AsRef<Path>,
        config: CoreConfig,
        embed: EmbedFn,
        clock: Arc<dyn Clock>,
        bus: Arc<EventBus>,
    ) -> Self {
        let user_dir = user_dir.as_ref();
        let state_path = user_dir.join("field_state.json");
        let graph_path = user_dir.join("memory_graph.json");

        let field = load_field_or_default(&state_path, &config).await;
        let graph = load_graph_or_default(&graph_path).await;
        let retriever = SemanticRetriever::new(embed, config.retrieval.cache_size);

        Self {
            state: Arc::new(Mutex::new(SessionState {
                graph,
                field,
                retriever,
                collapse_history: VecDeque::with_capacity(COLLAPSE_HISTORY_LEN),
                session_anchors: HashSet::new(),
            })),
            bus,
            clock,
            config,
            state_path,
            graph_path,
        }
    }

    /// Shared handle for background schedulers.
    pub fn state_handle(&self) -> Arc<Mutex<SessionState>> {
        self.state.clone()
    }

    pub fn bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Advance the field from one user input, record what happened, fetch
    /// related memories, and persist.
    ///
    /// Numeric failures (dimension mismatch) are fatal to this turn only;
    /// persistence failures are logged and never block the turn.
    pub async fn process_turn(&self, text: &str) -> Result<TurnOutcome> {
        let now = self.clock.now();
        let mut guard = self.state.lock().await;
        let st = &mut *guard;

        let dynamics = advance(&mut st.field, now)?;

        // Retrieval runs against the graph as it stood before this turn;
        // a turn never recalls its own input.
        let SessionState {
            graph, retriever, ..
        } = st;
        let memories: Vec<RecalledMemory> = retriever
            .retrieve_semantic(graph, text, self.config.retrieval.top_k)
            .await
            .into_iter()
            .map(|event| RecalledMemory {
                text: event_text(&event),
                timestamp: event.timestamp,
            })
            .collect();

        let mut payload = Map::new();
        payload.insert("text".into(), Value::String(text.to_string()));
        payload.insert(
            "topic".into(),
            Value::String(reflect::extract_topic(text)),
        );
        payload.insert(
            "feeling".into(),
            Value::String(reflect::estimate_feeling(text).label().to_string()),
        );
        st.graph.add_event(MemoryEvent::new("user_input", payload, now));

        if let Some(record) = &dynamics.collapse {
            let payload = match serde_json::to_value(record)? {
                Value::Object(map) => map,
                _ => Map::new(),
            };
            st.graph.add_event(MemoryEvent::new("collapse", payload, now));
            self.track_anchor(st, record.collapsed_index, now);
        }

        if let Err(err) = write_field_state(&self.state_path, &st.field.to_persisted()).await {
            warn!(path = %self.state_path.display(), ?err, "field state write failed; in-memory state stays authoritative");
        }
        if let Err(err) = persist::save_graph(&st.graph, &self.graph_path).await {
            warn!(path = %self.graph_path.display(), ?err, "graph write failed; in-memory state stays authoritative");
        }
        drop(guard);

        self.bus.publish(
            "turn.completed",
            &json!({
                "entropy": dynamics.entropy,
                "resonance": dynamics.resonance,
                "collapsed": dynamics.collapsed,
            }),
        );
        if let Some(record) = &dynamics.collapse {
            self.bus.publish(
                "field.collapse",
                &json!({ "collapsed_index": record.collapsed_index }),
            );
        }

        Ok(TurnOutcome { dynamics, memories })
    }

    /// A collapse index recurring across recent turns is promoted to an
    /// anchor once per session and recorded as its own event.
    fn track_anchor(&self, st: &mut SessionState, index: usize, now: DateTime<FixedOffset>) {
        st.collapse_history.push_back(index);
        if st.collapse_history.len() > COLLAPSE_HISTORY_LEN {
            st.collapse_history.pop_front();
        }
        let recurrences = st.collapse_history.iter().filter(|&&i| i == index).count();
        if recurrences >= ANCHOR_RECURRENCE && st.session_anchors.insert(index) {
            info!(index, "recurring collapse index promoted to anchor");
            let mut payload = Map::new();
            payload.insert("index".into(), Value::from(index));
            st.graph
                .add_event(MemoryEvent::new("anchor_added", payload, now));
        }
    }

    /// Write both files now.  Used at shutdown; per-turn persistence already
    /// happens inside [`process_turn`].
    pub async fn flush(&self) -> Result<()> {
        let guard = self.state.lock().await;
        write_field_state(&self.state_path, &guard.field.to_persisted()).await?;
        persist::save_graph(&guard.graph, &self.graph_path).await?;
        Ok(())
    }
}

async fn load_field_or_default(path: &Path, config: &CoreConfig) -> FieldState {
    let fresh = || {
        FieldState::new_random(
            config.field.n,
            config.field.d,
            config.field.alpha,
            config.field.s_crit,
            config.field.lambda_gain,
            config.field.feedback_level,
        )
    };
    let raw = match tokio::fs::read(path).await {
        Ok(raw) => raw,
        Err(err) => {
            debug!(path = %path.display(), ?err, "no field state on disk; starting fresh");
            return fresh();
        }
    };
    let persisted: PersistedField = match serde_json::from_slice(&raw) {
        Ok(p) => p,
        Err(err) => {
            warn!(path = %path.display(), ?err, "corrupt field state; reinitialising");
            return fresh();
        }
    };
    let state = FieldState::from_persisted(
        persisted,
        config.field.alpha,
        config.field.s_crit,
        config.field.lambda_gain,
        config.field.feedback_level,
    );
    if state.validate().is_err() || state.n() != config.field.n || state.d() != config.field.d {
        warn!(path = %path.display(), "persisted field state has wrong shape; reinitialising");
        return fresh();
    }
    state
}

async fn load_graph_or_default(path: &Path) -> EventGraph {
    if !path.exists() {
        debug!(path = %path.display(), "no memory graph on disk; starting empty");
        return EventGraph::new();
    }
    match persist::load_graph(path).await {
        Ok(graph) => graph,
        Err(err) => {
            warn!(path = %path.display(), ?err, "corrupt memory graph; starting empty");
            EventGraph::new()
        }
    }
}

/// Atomic field-state write: tmp sibling, fsync, rename.
async fn write_field_state(path: &Path, persisted: &PersistedField) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp_path = {
        let filename = path
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_else(|| "field_state.json".to_string());
        path.with_file_name(format!("{filename}.tmp"))
    };

    let write_result: Result<()> = async {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .await?;
        file.write_all(serde_json::to_vec(persisted)?.as_slice())
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
