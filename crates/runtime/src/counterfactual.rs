//! Counterfactual branch simulation.
//!
//! Each branch clones the live graph, injects hypothetical anchor tweaks,
//! simulates one collapse, and scores the outcome.  The live graph is never
//! touched by a simulation; the caller appends a single result event
//! afterwards.  Full clones are acceptable here because per-user graphs are
//! bounded to thousands of nodes and batches run nightly.

use chrono::{DateTime, FixedOffset};
use serde::Serialize;
use serde_json::{Map, Value};

use cogfield_memory::{EventGraph, MemoryEvent};

/// One simulated branch: which modifiers were applied and how the branch
/// scored (mean `valence` across payloads that carry one).
#[derive(Debug, Clone, Serialize)]
pub struct BranchOutcome {
    pub timestamp: DateTime<FixedOffset>,
    pub modifiers: Vec<(String, f64)>,
    pub score: f64,
}

/// Run one branch against a detached copy of `graph`.
pub fn run_branch(
    graph: &EventGraph,
    modifiers: &[(String, f64)],
    now: DateTime<FixedOffset>,
) -> BranchOutcome {
    let mut branch = graph.clone();

    for (anchor, delta) in modifiers {
        let mut payload = Map::new();
        payload.insert("anchor".into(), Value::String(anchor.clone()));
        payload.insert("delta".into(), Value::from(*delta));
        branch.add_event(MemoryEvent::new("anchor_tweak", payload, now));
    }

    let mut payload = Map::new();
    payload.insert("counterfactual".into(), Value::Bool(true));
    branch.add_event(MemoryEvent::new("collapse", payload, now));

    let valences: Vec<f64> = branch
        .iter()
        .filter_map(|ev| ev.payload.get("valence").and_then(Value::as_f64))
        .collect();
    let score = if valences.is_empty() {
        0.0
    } else {
        valences.iter().sum::<f64>() / valences.len() as f64
    };

    BranchOutcome {
        timestamp: now,
        modifiers: modifiers.to_vec(),
        score,
    }
}

/// Run every modifier set in sequence against the same base snapshot.
pub fn run_batch(
    graph: &EventGraph,
    modifier_sets: &[Vec<(String, f64)>],
    now: DateTime<FixedOffset>,
) -> Vec<BranchOutcome> {
    modifier_sets
        .iter()
        .map(|mods| run_branch(graph, mods, now))
        .collect()
}
