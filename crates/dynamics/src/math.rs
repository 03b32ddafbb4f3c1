//! Pure field math.
//!
//! Every function here is a total transform over its inputs — no hidden
//! state, no side effects.  Shape agreement between vectors and matrices is
//! the caller's responsibility; [`crate::FieldState::validate`] checks it
//! once per turn before any of these run.

/// Numerical guard for `ln(0)` and empty softmax denominators.
pub const EPS: f64 = 1e-12;

/// Elementwise logistic squash: `a_i = 1 / (1 + exp(-w_i))`, clamped so
/// every component stays strictly inside (0, 1).
///
/// The raw logistic rounds to exactly 1.0 for inputs beyond ~37 and to
/// exactly 0.0 once `exp` overflows, hence the clamp.
pub fn activation(w: &[f64]) -> Vec<f64> {
    w.iter()
        .map(|&x| (1.0 / (1.0 + (-x).exp())).clamp(f64::EPSILON, 1.0 - f64::EPSILON))
        .collect()
}

/// Activation diffuseness: `S = -Σ a_i² · ln(a_i² + EPS)`, floored at 0.
///
/// The epsilon keeps `ln` finite at zero activation; a component close
/// enough to 1 pushes its term a hair below zero, so the sum is floored
/// to keep the result non-negative for all inputs.
pub fn entropy(a: &[f64]) -> f64 {
    let s = -a
        .iter()
        .map(|&x| {
            let p2 = x * x;
            p2 * (p2 + EPS).ln()
        })
        .sum::<f64>();
    s.max(0.0)
}

/// Resonance energy: the quadratic form `E = aᵀ · W · a`.  Can be negative.
pub fn resonance(a: &[f64], conn: &[Vec<f64>]) -> f64 {
    conn.iter()
        .zip(a)
        .map(|(row, &ai)| ai * row.iter().zip(a).map(|(&wij, &aj)| wij * aj).sum::<f64>())
        .sum()
}

/// Project the activation onto the basis: `p = Σ_i a_i · psi_i`, length D.
pub fn project_state(a: &[f64], psi: &[Vec<f64>]) -> Vec<f64> {
    let d = psi.first().map_or(0, Vec::len);
    let mut out = vec![0.0; d];
    for (&ai, row) in a.iter().zip(psi) {
        for (o, &pj) in out.iter_mut().zip(row) {
            *o += ai * pj;
        }
    }
    out
}

/// Feedback effect: the dot product `λ · F`.
pub fn feedback_modulation(lambda: &[f64], feedback: &[f64]) -> f64 {
    lambda.iter().zip(feedback).map(|(&l, &f)| l * f).sum()
}

/// Numerically stable softmax — subtracts the max before exponentiating.
/// The result sums to 1 (up to the epsilon in the denominator).
pub fn softmax(x: &[f64]) -> Vec<f64> {
    let max = x.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exp: Vec<f64> = x.iter().map(|&v| (v - max).exp()).collect();
    let sum: f64 = exp.iter().sum::<f64>() + EPS;
    exp.into_iter().map(|v| v / sum).collect()
}

/// Collapse fires iff `S > S_crit`, strictly.  Entropy exactly at the
/// threshold does not collapse.
pub fn check_collapse(s: f64, s_crit: f64) -> bool {
    s > s_crit
}

/// Collapse update: `w'_i = (1 - alpha) · w_i`, then `w'_idx += alpha`.
///
/// A convex blend toward a one-hot vector at `idx`.  The result is **not**
/// renormalised and is not a probability vector; repeated collapses may
/// drift the weight sum over long sessions (known behaviour, kept as-is).
pub fn collapse_weights(w: &[f64], idx: usize, alpha: f64) -> Vec<f64> {
    let mut out: Vec<f64> = w.iter().map(|&x| (1.0 - alpha) * x).collect();
    out[idx] += alpha;
    out
}

/// Index of the maximum component; ties break to the lowest index.
pub fn argmax(xs: &[f64]) -> usize {
    let mut best = 0;
    for (i, &x) in xs.iter().enumerate().skip(1) {
        if x > xs[best] {
            best = i;
        }
    }
    best
}
