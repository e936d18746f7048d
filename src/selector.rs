//! Optimal-Relay Selection
//!
//! Pure minimax choice over two latency tables: the chosen relay minimizes
//! the *worse* of the two peer-to-relay delays, which is the figure a
//! real-time chat user actually perceives. Ties fall back to the smaller
//! combined delay, and remaining ties are broken uniformly at random so
//! repeated pairings don't herd onto one relay.
//!
//! Callers supply the inputs; the selector never touches the directory.

use std::collections::HashMap;

use rand::Rng;

/// Error type for relay selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectorError {
    /// The two latency tables share no relay.
    NoCommonRelay,
}

impl std::fmt::Display for SelectorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SelectorError::NoCommonRelay => write!(f, "no relay common to both latency tables"),
        }
    }
}

impl std::error::Error for SelectorError {}

/// Pick the relay minimizing `max(first[r], second[r])` over relays present
/// in **both** tables; among ties prefer the smaller `first[r] + second[r]`;
/// among remaining ties pick uniformly at random.
///
/// Delays are milliseconds; `f64::INFINITY` marks an unreachable relay and
/// participates in the ordering like any other value.
pub fn optimal_relay(
    first: &HashMap<String, f64>,
    second: &HashMap<String, f64>,
) -> Result<String, SelectorError> {
    let mut best: Vec<&str> = Vec::new();
    let mut best_worst = f64::INFINITY;
    let mut best_sum = f64::INFINITY;

    for (relay, &d1) in first {
        let Some(&d2) = second.get(relay) else { continue };
        let worst = d1.max(d2);
        let sum = d1 + d2;

        if best.is_empty() || worst < best_worst || (worst == best_worst && sum < best_sum) {
            best.clear();
            best.push(relay);
            best_worst = worst;
            best_sum = sum;
        } else if worst == best_worst && sum == best_sum {
            best.push(relay);
        }
    }

    if best.is_empty() {
        return Err(SelectorError::NoCommonRelay);
    }
    let pick = if best.len() == 1 { 0 } else { rand::thread_rng().gen_range(0..best.len()) };
    Ok(best[pick].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn table(entries: &[(&str, f64)]) -> HashMap<String, f64> {
        entries.iter().map(|(r, d)| (r.to_string(), *d)).collect()
    }

    #[test]
    fn minimax_prefers_the_better_worst_case() {
        // max over R1 is 70, over R2 is 80.
        let alice = table(&[("R1", 10.0), ("R2", 80.0)]);
        let bob = table(&[("R1", 70.0), ("R2", 20.0)]);
        assert_eq!(optimal_relay(&alice, &bob).unwrap(), "R1");
    }

    #[test]
    fn chosen_relay_is_always_minimax_optimal() {
        let l1 = table(&[("a", 5.0), ("b", 40.0), ("c", 12.0), ("d", 90.0)]);
        let l2 = table(&[("a", 55.0), ("b", 30.0), ("c", 31.0), ("d", 1.0)]);
        let common_best = l1
            .iter()
            .filter_map(|(r, d1)| l2.get(r).map(|d2| d1.max(*d2)))
            .fold(f64::INFINITY, f64::min);

        let pick = optimal_relay(&l1, &l2).unwrap();
        assert_eq!(l1[&pick].max(l2[&pick]), common_best);
    }

    #[test]
    fn sum_breaks_equal_worst_cases() {
        // Both relays have a worst case of 50; R2 wins on total.
        let l1 = table(&[("R1", 50.0), ("R2", 10.0)]);
        let l2 = table(&[("R1", 50.0), ("R2", 50.0)]);
        assert_eq!(optimal_relay(&l1, &l2).unwrap(), "R2");
    }

    #[test]
    fn full_ties_land_on_both_relays_across_runs() {
        let l1 = table(&[("R1", 50.0), ("R2", 50.0)]);
        let l2 = table(&[("R1", 50.0), ("R2", 50.0)]);

        let mut seen = HashSet::new();
        for _ in 0..200 {
            seen.insert(optimal_relay(&l1, &l2).unwrap());
        }
        assert_eq!(seen.len(), 2, "random tie-break never picked one of the relays");
    }

    #[test]
    fn relays_known_to_one_side_only_are_ignored() {
        let l1 = table(&[("R1", 1.0), ("R2", 2.0)]);
        let l2 = table(&[("R2", 3.0), ("R3", 0.5)]);
        assert_eq!(optimal_relay(&l1, &l2).unwrap(), "R2");
    }

    #[test]
    fn disjoint_tables_fail() {
        let l1 = table(&[("R1", 1.0)]);
        let l2 = table(&[("R2", 1.0)]);
        assert_eq!(optimal_relay(&l1, &l2), Err(SelectorError::NoCommonRelay));
        assert_eq!(optimal_relay(&table(&[]), &table(&[])), Err(SelectorError::NoCommonRelay));
    }

    #[test]
    fn unreachable_sentinel_loses_to_any_finite_relay() {
        let l1 = table(&[("R1", f64::INFINITY), ("R2", 400.0)]);
        let l2 = table(&[("R1", 1.0), ("R2", 400.0)]);
        assert_eq!(optimal_relay(&l1, &l2).unwrap(), "R2");
    }
}
