//! Vig removal.
//!
//! Two-way markets use the multiplicative method. Three-way markets use
//! Shin's estimator, which models the overround as informed-trader exposure
//! and removes proportionally more vig from longshots; it falls back to
//! multiplicative whenever its parameter leaves (0, 1).

/// Multiplicative devig: normalise implied probabilities to sum to one.
/// Returns an empty vec when any odds are degenerate.
pub fn multiplicative(odds: &[f64]) -> Vec<f64> {
    if odds.iter().any(|&o| o <= 1.0) {
        return Vec::new();
    }
    let implied: Vec<f64> = odds.iter().map(|&o| 1.0 / o).collect();
    let sum: f64 = implied.iter().sum();
    if sum <= 0.0 {
        return Vec::new();
    }
    implied.iter().map(|p| p / sum).collect()
}

/// Shin devig for an n-way market (used here for 3-way).
///
/// `z = (sqrt(n^2 + 4(1-n)S^2) - n) / (2(S - n))` with `S` the booked sum of
/// implied probabilities. Outside its valid range the multiplicative method
/// takes over.
pub fn shin(odds: &[f64]) -> Vec<f64> {
    let implied: Vec<f64> = odds.iter().map(|&o| if o > 1.0 { 1.0 / o } else { 0.0 }).collect();
    if implied.iter().any(|&p| p <= 0.0) {
        return Vec::new();
    }
    let n = implied.len() as f64;
    let booked: f64 = implied.iter().sum();
    if (booked - n).abs() < 1e-12 {
        return multiplicative(odds);
    }

    let discriminant = n * n + 4.0 * (1.0 - n) * booked * booked;
    if discriminant < 0.0 {
        return multiplicative(odds);
    }
    let z = (discriminant.sqrt() - n) / (2.0 * (booked - n));
    if !(0.0..1.0).contains(&z) || !z.is_finite() {
        return multiplicative(odds);
    }

    // Invert Shin's pricing rule per outcome, then close the tiny residual
    // multiplicatively so the probabilities sum to one exactly.
    let raw: Vec<f64> = implied
        .iter()
        .map(|&pi| {
            let inner = z * z + 4.0 * (1.0 - z) * pi * pi / booked;
            (inner.sqrt() - z) / (2.0 * (1.0 - z))
        })
        .collect();
    let total: f64 = raw.iter().sum();
    if total <= 0.0 {
        return multiplicative(odds);
    }
    raw.iter().map(|p| p / total).collect()
}

/// Devig dispatch: Shin for 3-way, multiplicative otherwise.
pub fn devig(odds: &[f64]) -> Vec<f64> {
    if odds.len() == 3 {
        shin(odds)
    } else {
        multiplicative(odds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiplicative_sums_to_one() {
        let probs = multiplicative(&[1.90, 1.95]);
        assert_eq!(probs.len(), 2);
        assert!((probs.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!(probs[0] > probs[1]);
    }

    #[test]
    fn multiplicative_rejects_settled_odds() {
        assert!(multiplicative(&[1.0, 5.0]).is_empty());
    }

    #[test]
    fn shin_three_way_case() {
        // 2.10 / 3.40 / 3.80: booked sum ~1.0335, z ~0.59 by the quadratic.
        let probs = shin(&[2.10, 3.40, 3.80]);
        assert_eq!(probs.len(), 3);
        assert!((probs.iter().sum::<f64>() - 1.0).abs() < 1e-6);
        // Monotone in raw implied order.
        assert!(probs[0] > probs[1]);
        assert!(probs[1] > probs[2]);
        // The favourite keeps more of its implied probability than the
        // multiplicative split would give it.
        let mult = multiplicative(&[2.10, 3.40, 3.80]);
        assert!(probs[0] >= mult[0] - 1e-9);
    }

    #[test]
    fn shin_falls_back_on_extreme_overround() {
        // A book this wide drives the discriminant negative; the
        // multiplicative split takes over.
        let odds = [1.20, 1.50, 1.80];
        let probs = shin(&odds);
        let mult = multiplicative(&odds);
        assert_eq!(probs.len(), 3);
        for (a, b) in probs.iter().zip(mult.iter()) {
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn dispatch_by_outcome_count() {
        assert_eq!(devig(&[1.90, 1.95]).len(), 2);
        assert_eq!(devig(&[2.10, 3.40, 3.80]).len(), 3);
    }
}
