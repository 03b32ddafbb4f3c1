//! Per-turn protocol over a [`FieldState`] snapshot.
//!
//! [`advance`] is the only entry point that mutates state, and only through
//! the explicit collapse step.  Recording the result and persisting the
//! state are the session's responsibility.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::math;
use crate::state::{DynamicsError, FieldState};

/// Structured record of a single collapse, embedded in the turn result and
/// appended to the event graph by the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollapseRecord {
    pub timestamp: DateTime<FixedOffset>,
    pub collapsed_index: usize,
    pub prev_weights: Vec<f64>,
    pub new_weights: Vec<f64>,
    pub entropy: f64,
    pub resonance: f64,
    pub feedback: f64,
    pub projected_state: Vec<f64>,
}

/// Everything a response-generation collaborator needs from one turn.
#[derive(Debug, Clone, Serialize)]
pub struct TurnDynamics {
    pub activation: Vec<f64>,
    pub entropy: f64,
    pub resonance: f64,
    pub projected_state: Vec<f64>,
    pub feedback: f64,
    pub softmax_activations: Vec<f64>,
    /// `argmax(activation)`; ties break to the lowest index.
    pub dominant_index: usize,
    pub dominant_activation: f64,
    pub collapsed: bool,
    pub collapse: Option<CollapseRecord>,
}

/// Advance the field by one turn.
///
/// Computes activation, entropy, resonance, projection, feedback and
/// softmax; if entropy strictly exceeds `s_crit`, snapshots the old
/// weights and applies the collapse update in place.
pub fn advance(
    state: &mut FieldState,
    now: DateTime<FixedOffset>,
) -> Result<TurnDynamics, DynamicsError> {
    state.validate()?;

    let a = math::activation(&state.w);
    let s = math::entropy(&a);
    let resonance = math::resonance(&a, &state.conn);
    let projected_state = math::project_state(&a, &state.psi);
    let feedback = math::feedback_modulation(&state.lambda, &state.feedback);
    let softmax_activations = math::softmax(&state.w);
    let dominant_index = math::argmax(&a);
    let dominant_activation = a[dominant_index];

    let collapse = if math::check_collapse(s, state.s_crit) {
        let prev_weights = state.w.clone();
        state.w = math::collapse_weights(&state.w, dominant_index, state.alpha);
        debug!(
            collapsed_index = dominant_index,
            entropy = s,
            "field collapse applied"
        );
        Some(CollapseRecord {
            timestamp: now,
            collapsed_index: dominant_index,
            prev_weights,
            new_weights: state.w.clone(),
            entropy: s,
            resonance,
            feedback,
            projected_state: projected_state.clone(),
        })
    } else {
        None
    };

    Ok(TurnDynamics {
        activation: a,
        entropy: s,
        resonance,
        projected_state,
        feedback,
        softmax_activations,
        dominant_index,
        dominant_activation,
        collapsed: collapse.is_some(),
        collapse,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn state_n3(s_crit: f64, alpha: f64) -> FieldState {
        FieldState {
            w: vec![0.0, 0.0, 0.0],
            psi: vec![vec![1.0, 0.0]; 3],
            conn: vec![vec![0.0; 3]; 3],
            lambda: vec![0.12; 3],
            feedback: vec![0.17; 3],
            alpha,
            s_crit,
        }
    }

    #[test]
    fn zero_weights_collapse_to_first_index_exactly() {
        // a = [0.5, 0.5, 0.5], S ≈ 1.0397 > 1.0; all activations tie, so
        // the collapse lands on index 0 and alpha = 0.5 gives w' = [0.5,0,0].
        let mut state = state_n3(1.0, 0.5);
        let turn = advance(&mut state, Utc::now().fixed_offset()).unwrap();

        for v in &turn.activation {
            assert!((v - 0.5).abs() < 1e-15);
        }
        assert!((turn.entropy - 1.0397207708399179).abs() < 1e-9);
        assert!(turn.collapsed);

        let record = turn.collapse.unwrap();
        assert_eq!(record.collapsed_index, 0);
        assert_eq!(record.prev_weights, vec![0.0, 0.0, 0.0]);
        assert_eq!(state.w, vec![0.5, 0.0, 0.0]);
        assert_eq!(record.new_weights, state.w);
    }

    #[test]
    fn entropy_at_threshold_does_not_collapse() {
        let mut state = state_n3(1.0, 0.5);
        // Pin the threshold to the exact entropy of the uniform activation.
        state.s_crit = crate::math::entropy(&[0.5, 0.5, 0.5]);
        let turn = advance(&mut state, Utc::now().fixed_offset()).unwrap();
        assert!(!turn.collapsed);
        assert!(turn.collapse.is_none());
        assert_eq!(state.w, vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn no_collapse_below_threshold_leaves_weights_untouched() {
        let mut state = state_n3(10.0, 0.5);
        let before = state.w.clone();
        let turn = advance(&mut state, Utc::now().fixed_offset()).unwrap();
        assert!(!turn.collapsed);
        assert_eq!(state.w, before);
        assert_eq!(turn.dominant_index, 0);
        assert!((turn.dominant_activation - 0.5).abs() < 1e-15);
    }

    #[test]
    fn dimension_mismatch_is_fatal_to_the_turn() {
        let mut state = state_n3(1.0, 0.5);
        state.lambda.pop();
        let err = advance(&mut state, Utc::now().fixed_offset()).unwrap_err();
        assert!(matches!(err, DynamicsError::DimensionMismatch { .. }));
        // The turn failed before any mutation.
        assert_eq!(state.w, vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn softmax_activations_sum_to_one() {
        let mut state = state_n3(10.0, 0.5);
        state.w = vec![1.0, -2.0, 0.5];
        let turn = advance(&mut state, Utc::now().fixed_offset()).unwrap();
        let sum: f64 = turn.softmax_activations.iter().sum();
        assert!((sum - 1.0).abs() < 1e-9);
    }
}
