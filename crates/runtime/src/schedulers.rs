//! Background schedulers.
//!
//! Each scheduler is an independent spawned task looping over
//! `tokio::select!` between its interval sleep and a shared `watch`
//! shutdown channel, so a stop request is honoured at the top of each
//! iteration and never mid-operation.  A failing tick is logged and the
//! loop continues on its next schedule; one scheduler's fault never stops
//! another's.  All graph mutation goes through the same per-user lock the
//! interactive path uses.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, FixedOffset, Timelike};
use rand::Rng;
use serde_json::{Map, Value, json};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use cogfield_config::SchedulerConfig;
use cogfield_memory::{Clock, MemoryEvent};

use crate::bus::EventBus;
use crate::counterfactual::run_batch;
use crate::reflect;
use crate::session::{Session, SessionState};

/// Hypothetical anchor adjustments explored by the nightly batch.
pub type ModifierSets = Vec<Vec<(String, f64)>>;

/// True when `now`'s hour falls inside `[start, end)`; the window may wrap
/// midnight (e.g. 22 → 6).
pub fn is_in_window(now: DateTime<FixedOffset>, start_hour: u8, end_hour: u8) -> bool {
    let hour = now.hour();
    let (start, end) = (u32::from(start_hour), u32::from(end_hour));
    if start <= end {
        hour >= start && hour < end
    } else {
        hour >= start || hour < end
    }
}

/// Spawn all four schedulers for a session with its configured cadences.
pub fn spawn_all(
    session: &Session,
    modifier_sets: ModifierSets,
    shutdown_tx: &watch::Sender<bool>,
) -> Vec<JoinHandle<()>> {
    let cfg = session.config().schedulers.clone();
    vec![
        spawn_sensor_sampler(
            session.state_handle(),
            session.clock(),
            Duration::from_secs(cfg.sensor_interval_secs),
            shutdown_tx,
        ),
        spawn_reflection_ticker(
            session.state_handle(),
            session.clock(),
            session.bus(),
            Duration::from_secs(cfg.reflection_interval_secs),
            shutdown_tx,
        ),
        spawn_counterfactual_batch(
            session.state_handle(),
            session.clock(),
            cfg.clone(),
            modifier_sets,
            shutdown_tx,
        ),
        spawn_weekly_rollup(
            session.state_handle(),
            session.clock(),
            session.bus(),
            cfg,
            shutdown_tx,
        ),
    ]
}

/// Synthetic sensor sampling: appends vision, audio and proprioception
/// readings every interval.
pub fn spawn_sensor_sampler(
    state: Arc<Mutex<SessionState>>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    shutdown_tx: &watch::Sender<bool>,
) -> JoinHandle<()> {
    let mut rx = shutdown_tx.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    sensor_tick(&state, clock.now()).await;
                }
                changed = rx.changed() => {
                    if changed.is_err() || *rx.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

async fn sensor_tick(state: &Mutex<SessionState>, now: DateTime<FixedOffset>) {
    const COLORS: [&str; 5] = ["red", "green", "blue", "yellow", "none"];
    // Draw outside the lock; thread_rng is not held across await points.
    let (color, energy, dx, dy) = {
        let mut rng = rand::thread_rng();
        (
            COLORS[rng.gen_range(0..COLORS.len())],
            (rng.gen::<f64>() * 1000.0).round() / 1000.0,
            (rng.gen_range(-1.0..1.0) * 1000.0f64).round() / 1000.0,
            (rng.gen_range(-1.0..1.0) * 1000.0f64).round() / 1000.0,
        )
    };

    let mut st = state.lock().await;
    for (sense, detail) in [
        ("vision", json!({ "pattern": format!("color_{color}") })),
        ("audio", json!({ "energy": energy })),
        ("proprioception", json!({ "movement": { "dx": dx, "dy": dy } })),
    ] {
        let mut payload = Map::new();
        payload.insert("sense".into(), Value::String(sense.to_string()));
        if let Value::Object(detail) = detail {
            payload.extend(detail);
        }
        st.graph
            .add_event(MemoryEvent::new("sensor_reading", payload, now));
    }
}

/// Periodic self-reflection: derives a feeling estimate from recent inputs
/// and appends an enriched `reflection` event.
pub fn spawn_reflection_ticker(
    state: Arc<Mutex<SessionState>>,
    clock: Arc<dyn Clock>,
    bus: Arc<EventBus>,
    interval: Duration,
    shutdown_tx: &watch::Sender<bool>,
) -> JoinHandle<()> {
    let mut rx = shutdown_tx.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    reflection_tick(&state, &bus, clock.now()).await;
                }
                changed = rx.changed() => {
                    if changed.is_err() || *rx.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

async fn reflection_tick(state: &Mutex<SessionState>, bus: &EventBus, now: DateTime<FixedOffset>) {
    let mut st = state.lock().await;
    let recent = st.graph.retrieve(|e| e.kind == "user_input", 5);
    let joined: String = recent
        .iter()
        .filter_map(|e| e.payload.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join(" ");
    let feeling = reflect::estimate_feeling(&joined);
    let topics: Vec<Value> = recent
        .iter()
        .filter_map(|e| e.payload.get("topic").cloned())
        .collect();

    let mut payload = Map::new();
    payload.insert(
        "question".into(),
        Value::String("How am I feeling now?".to_string()),
    );
    payload.insert(
        "feeling".into(),
        Value::String(feeling.label().to_string()),
    );
    payload.insert("topics".into(), Value::Array(topics));
    st.graph
        .add_event(MemoryEvent::new("reflection", payload, now));
    drop(st);

    bus.publish("reflection.tick", &json!({ "feeling": feeling.label() }));
}

/// Nightly counterfactual batches: inside the configured hour window, runs
/// every modifier set against a detached graph snapshot and appends one
/// result event to the live graph.
pub fn spawn_counterfactual_batch(
    state: Arc<Mutex<SessionState>>,
    clock: Arc<dyn Clock>,
    cfg: SchedulerConfig,
    modifier_sets: ModifierSets,
    shutdown_tx: &watch::Sender<bool>,
) -> JoinHandle<()> {
    let mut rx = shutdown_tx.subscribe();
    let interval = Duration::from_secs(cfg.counterfactual_interval_secs);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let now = clock.now();
                    if !is_in_window(now, cfg.counterfactual_start_hour, cfg.counterfactual_end_hour) {
                        continue;
                    }
                    if let Err(err) = counterfactual_tick(&state, &modifier_sets, now).await {
                        warn!(?err, "counterfactual batch failed; retrying next tick");
                    }
                }
                changed = rx.changed() => {
                    if changed.is_err() || *rx.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

async fn counterfactual_tick(
    state: &Mutex<SessionState>,
    modifier_sets: &[Vec<(String, f64)>],
    now: DateTime<FixedOffset>,
) -> Result<()> {
    // Snapshot under the lock, simulate on the detached copy.
    let snapshot = state.lock().await.graph.clone();
    let outcomes = run_batch(&snapshot, modifier_sets, now);
    info!(branches = outcomes.len(), "counterfactual batch complete");

    let mut payload = Map::new();
    payload.insert("outcomes".into(), serde_json::to_value(&outcomes)?);
    let mut st = state.lock().await;
    st.graph
        .add_event(MemoryEvent::new("counterfactual_result", payload, now));
    Ok(())
}

/// Weekly rollup: aggregates the trailing window into a summary event and
/// publishes it on the bus.
pub fn spawn_weekly_rollup(
    state: Arc<Mutex<SessionState>>,
    clock: Arc<dyn Clock>,
    bus: Arc<EventBus>,
    cfg: SchedulerConfig,
    shutdown_tx: &watch::Sender<bool>,
) -> JoinHandle<()> {
    let mut rx = shutdown_tx.subscribe();
    let interval = Duration::from_secs(cfg.rollup_interval_days * 24 * 3600);
    let window_days = cfg.rollup_interval_days;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    rollup_tick(&state, &bus, clock.now(), window_days).await;
                }
                changed = rx.changed() => {
                    if changed.is_err() || *rx.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

async fn rollup_tick(
    state: &Mutex<SessionState>,
    bus: &EventBus,
    now: DateTime<FixedOffset>,
    window_days: u64,
) {
    let since = now - chrono::Duration::days(window_days as i64);
    let mut st = state.lock().await;
    let interactions = st
        .graph
        .iter()
        .filter(|e| e.timestamp >= since && e.kind != "weekly_summary")
        .count();

    let mut payload = Map::new();
    payload.insert("interactions".into(), Value::from(interactions));
    payload.insert("since".into(), Value::String(since.to_rfc3339()));
    payload.insert("until".into(), Value::String(now.to_rfc3339()));
    st.graph
        .add_event(MemoryEvent::new("weekly_summary", payload, now));
    drop(st);

    bus.publish(
        "weekly_summary",
        &json!({ "interactions": interactions }),
    );
}
