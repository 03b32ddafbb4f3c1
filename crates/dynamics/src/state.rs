use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DynamicsError {
    #[error("dimension mismatch in {component}: expected {expected}, got {actual}")]
    DimensionMismatch {
        component: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("field state must have at least one dimension")]
    Empty,
}

/// The evolving per-user numeric state.
///
/// `w`, `psi` and `conn` evolve across turns (only `w` is mutated by the
/// engine today; the others are carried so persistence round-trips them);
/// `lambda`, `feedback`, `alpha` and `s_crit` are session constants fixed
/// at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldState {
    /// Weight vector, length N.
    pub w: Vec<f64>,
    /// Basis matrix, N rows of length D.
    pub psi: Vec<Vec<f64>>,
    /// Connectivity matrix, N rows of length N.
    pub conn: Vec<Vec<f64>>,
    /// Feedback gain vector, length N.
    pub lambda: Vec<f64>,
    /// Feedback vector, length N.
    pub feedback: Vec<f64>,
    /// Collapse learning rate.
    pub alpha: f64,
    /// Collapse entropy threshold.
    pub s_crit: f64,
}

/// The durable subset of [`FieldState`] — plain nested numeric arrays.
///
/// Session constants are supplied from config on restore, so only the
/// evolving components are written out.  The field names are the on-disk
/// contract; `W` is kept capitalised for compatibility with existing state
/// files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedField {
    pub w: Vec<f64>,
    pub psi: Vec<Vec<f64>>,
    #[serde(rename = "W")]
    pub conn: Vec<Vec<f64>>,
}

impl FieldState {
    /// Fresh pseudo-random state: `w`, `psi` and `conn` drawn uniformly from
    /// [-1, 1), feedback vectors filled with the configured constants.
    pub fn new_random(
        n: usize,
        d: usize,
        alpha: f64,
        s_crit: f64,
        lambda_gain: f64,
        feedback_level: f64,
    ) -> Self {
        let mut rng = StdRng::from_entropy();
        let vec_n = |rng: &mut StdRng| -> Vec<f64> {
            (0..n).map(|_| rng.gen_range(-1.0..1.0)).collect()
        };
        Self {
            w: vec_n(&mut rng),
            psi: (0..n)
                .map(|_| (0..d).map(|_| rng.gen_range(-1.0..1.0)).collect())
                .collect(),
            conn: (0..n).map(|_| vec_n(&mut rng)).collect(),
            lambda: vec![lambda_gain; n],
            feedback: vec![feedback_level; n],
            alpha,
            s_crit,
        }
    }

    /// Rebuild a full state from its persisted form plus session constants.
    ///
    /// Dimensions are taken from the persisted arrays themselves; the caller
    /// should [`validate`](Self::validate) afterwards (the session does, and
    /// falls back to a fresh state on failure).
    pub fn from_persisted(
        persisted: PersistedField,
        alpha: f64,
        s_crit: f64,
        lambda_gain: f64,
        feedback_level: f64,
    ) -> Self {
        let n = persisted.w.len();
        Self {
            w: persisted.w,
            psi: persisted.psi,
            conn: persisted.conn,
            lambda: vec![lambda_gain; n],
            feedback: vec![feedback_level; n],
            alpha,
            s_crit,
        }
    }

    pub fn to_persisted(&self) -> PersistedField {
        PersistedField {
            w: self.w.clone(),
            psi: self.psi.clone(),
            conn: self.conn.clone(),
        }
    }

    /// Number of concept dimensions.
    pub fn n(&self) -> usize {
        self.w.len()
    }

    /// Dimension of the projected state.
    pub fn d(&self) -> usize {
        self.psi.first().map_or(0, Vec::len)
    }

    /// Check shape agreement between all components.  Run once per turn
    /// before the math; a mismatch is fatal to that turn only, never
    /// silently coerced.
    pub fn validate(&self) -> Result<(), DynamicsError> {
        let n = self.w.len();
        if n == 0 {
            return Err(DynamicsError::Empty);
        }
        let check = |component: &'static str, actual: usize| {
            if actual == n {
                Ok(())
            } else {
                Err(DynamicsError::DimensionMismatch {
                    component,
                    expected: n,
                    actual,
                })
            }
        };
        check("psi rows", self.psi.len())?;
        check("conn rows", self.conn.len())?;
        check("lambda", self.lambda.len())?;
        check("feedback", self.feedback.len())?;

        let d = self.d();
        for row in &self.psi {
            if row.len() != d {
                return Err(DynamicsError::DimensionMismatch {
                    component: "psi columns",
                    expected: d,
                    actual: row.len(),
                });
            }
        }
        for row in &self.conn {
            check("conn columns", row.len())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_state() -> FieldState {
        FieldState::new_random(4, 2, 0.1, 1.5, 0.12, 0.17)
    }

    #[test]
    fn random_state_has_requested_shape_and_validates() {
        let state = small_state();
        assert_eq!(state.n(), 4);
        assert_eq!(state.d(), 2);
        assert_eq!(state.conn.len(), 4);
        assert!(state.conn.iter().all(|row| row.len() == 4));
        state.validate().unwrap();
    }

    #[test]
    fn persisted_roundtrip_preserves_evolving_components() {
        let state = small_state();
        let json = serde_json::to_string(&state.to_persisted()).unwrap();
        let back: PersistedField = serde_json::from_str(&json).unwrap();
        let restored = FieldState::from_persisted(back, state.alpha, state.s_crit, 0.12, 0.17);
        assert_eq!(restored.w, state.w);
        assert_eq!(restored.psi, state.psi);
        assert_eq!(restored.conn, state.conn);
        restored.validate().unwrap();
    }

    #[test]
    fn persisted_floats_restore_to_the_exact_bits() {
        // A weight whose shortest decimal rendering needs exact parsing to
        // come back bit-identical.
        let mut state = small_state();
        state.w[0] = 0.9032878829544048;
        let json = serde_json::to_string(&state.to_persisted()).unwrap();
        let back: PersistedField = serde_json::from_str(&json).unwrap();
        assert_eq!(back.w[0].to_bits(), state.w[0].to_bits());
    }

    #[test]
    fn persisted_form_uses_capital_w_key_for_connectivity() {
        let state = small_state();
        let json = serde_json::to_string(&state.to_persisted()).unwrap();
        assert!(json.contains("\"W\":"));
        assert!(json.contains("\"psi\":"));
    }

    #[test]
    fn mismatched_psi_rows_fail_validation() {
        let mut state = small_state();
        state.psi.pop();
        assert!(matches!(
            state.validate(),
            Err(DynamicsError::DimensionMismatch {
                component: "psi rows",
                ..
            })
        ));
    }

    #[test]
    fn ragged_conn_row_fails_validation() {
        let mut state = small_state();
        state.conn[1].push(0.0);
        assert!(state.validate().is_err());
    }
}
