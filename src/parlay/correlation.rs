//! Leg correlation model.
//!
//! Legs from the same event are perfectly correlated and never combined;
//! same-league legs share schedule and officiating effects; cross-sport legs
//! are close to independent. The combined probability starts at the naive
//! product and pays a pairwise penalty proportional to the correlation.

/// Correlation coefficient between two legs.
pub fn correlation(
    event_a: &str,
    sport_a: &str,
    league_a: &str,
    event_b: &str,
    sport_b: &str,
    league_b: &str,
) -> f64 {
    if event_a == event_b {
        return 1.0;
    }
    if sport_a == sport_b && league_a == league_b {
        return match sport_a {
            "basketball" => 0.12,
            "americanfootball" => 0.08,
            "soccer" => 0.10,
            "mma" => 0.05,
            "baseball" => 0.06,
            "icehockey" => 0.10,
            _ => 0.08,
        };
    }
    if sport_a == sport_b {
        return match sport_a {
            "basketball" => 0.04,
            "soccer" => 0.03,
            _ => 0.03,
        };
    }
    0.01
}

/// Combined win probability of a leg set with the pairwise correlation
/// penalty applied, floored away from zero.
pub fn combined_probability(probs: &[f64], pairwise_rho: &[f64]) -> f64 {
    let mut combined: f64 = probs.iter().product();
    for (pair_index, rho) in pairwise_iter(probs.len()).zip(pairwise_rho.iter()) {
        let (i, j) = pair_index;
        let spread = (probs[i] * (1.0 - probs[i]) * probs[j] * (1.0 - probs[j])).sqrt();
        combined -= rho * 0.8 * spread;
    }
    combined.max(0.001)
}

/// Unordered index pairs in the order `pairwise_rho` is expected.
pub fn pairwise_iter(n: usize) -> impl Iterator<Item = (usize, usize)> {
    (0..n).flat_map(move |i| ((i + 1)..n).map(move |j| (i, j)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_event_is_forbidden_territory() {
        assert_eq!(correlation("e1", "basketball", "nba", "e1", "basketball", "nba"), 1.0);
    }

    #[test]
    fn tables_match_sport_and_league() {
        assert_eq!(correlation("a", "basketball", "nba", "b", "basketball", "nba"), 0.12);
        assert_eq!(correlation("a", "mma", "ufc", "b", "mma", "ufc"), 0.05);
        assert_eq!(correlation("a", "cricket", "ipl", "b", "cricket", "ipl"), 0.08);
        assert_eq!(correlation("a", "basketball", "nba", "b", "basketball", "euroleague"), 0.04);
        assert_eq!(correlation("a", "soccer", "epl", "b", "soccer", "laliga"), 0.03);
        assert_eq!(correlation("a", "basketball", "nba", "b", "icehockey", "nhl"), 0.01);
    }

    #[test]
    fn penalty_matches_hand_computation() {
        // Three legs at 0.56/0.55/0.50, same league rho 0.08 pairwise:
        // raw product 0.154, penalty ~0.0471, combined ~0.107.
        let probs = [0.56, 0.55, 0.50];
        let rho = [0.08, 0.08, 0.08];
        let combined = combined_probability(&probs, &rho);
        let raw: f64 = probs.iter().product();
        assert!((raw - 0.154).abs() < 1e-9);
        assert!((combined - 0.1064).abs() < 5e-4);
    }

    #[test]
    fn combined_probability_is_floored() {
        let probs = [0.2, 0.2, 0.2];
        let rho = [1.0, 1.0, 1.0];
        assert!(combined_probability(&probs, &rho) >= 0.001);
    }

    #[test]
    fn independent_legs_keep_the_product() {
        let probs = [0.5, 0.5];
        let combined = combined_probability(&probs, &[0.0]);
        assert!((combined - 0.25).abs() < 1e-12);
    }
}
