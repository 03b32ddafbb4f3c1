use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

// ── Field config ─────────────────────────────────────────────────────────────

/// Parameters of the per-user field state.
///
/// `n` and `d` fix the dimensionality for the lifetime of a session; the
/// remaining scalars are session constants applied on every turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldConfig {
    /// Number of concept dimensions (length of the weight vector).
    pub n: usize,
    /// Dimension of the projected state (columns of the basis matrix).
    pub d: usize,
    /// Collapse learning rate in `[0, 1]`.
    pub alpha: f64,
    /// Entropy threshold above which a collapse fires (strict inequality).
    pub s_crit: f64,
    /// Uniform feedback gain applied to every dimension.
    pub lambda_gain: f64,
    /// Uniform feedback level applied to every dimension.
    pub feedback_level: f64,
}

impl Default for FieldConfig {
    fn default() -> Self {
        Self {
            n: 7,
            d: 3,
            alpha: 0.073,
            s_crit: 1.79,
            lambda_gain: 0.12,
            feedback_level: 0.17,
        }
    }
}

// ── Retrieval config ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Number of related memories fetched for each interactive turn.
    pub top_k: usize,
    /// Capacity of the semantic retrieval cache (distinct query/k pairs).
    pub cache_size: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 3,
            cache_size: 128,
        }
    }
}

// ── Scheduler config ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Interval between synthetic sensor samples.
    pub sensor_interval_secs: u64,
    /// Interval between self-reflection ticks.
    pub reflection_interval_secs: u64,
    /// Interval between counterfactual batch attempts.  Batches only run
    /// when the current hour falls inside the configured window.
    pub counterfactual_interval_secs: u64,
    /// Counterfactual window start hour in session-local time.
    pub counterfactual_start_hour: u8,
    /// Counterfactual window end hour in session-local time.  The window
    /// may wrap midnight (e.g. 22 → 6).
    pub counterfactual_end_hour: u8,
    /// Days between rollup summaries; also the width of the summarised window.
    pub rollup_interval_days: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sensor_interval_secs: 60,
            reflection_interval_secs: 3600,
            counterfactual_interval_secs: 3600,
            counterfactual_start_hour: 22,
            counterfactual_end_hour: 6,
            rollup_interval_days: 7,
        }
    }
}

// ── Top-level config ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CoreConfig {
    pub field: FieldConfig,
    pub retrieval: RetrievalConfig,
    pub schedulers: SchedulerConfig,
}

impl CoreConfig {
    /// Load from a TOML file, falling back to defaults for a missing file.
    /// A present-but-malformed file is an error; we never guess at intent.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(raw) => Ok(toml::from_str(&raw)?),
            Err(_) => Ok(Self::default()),
        }
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }
}
