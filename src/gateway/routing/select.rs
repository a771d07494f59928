use std::sync::atomic::{AtomicU64, Ordering};

use super::policy::BackendRef;

/// Orders eligible backends for one request: a weighted-random primary, then the rest by
/// descending weight as failover candidates. Equal weights make the primary uniform.
pub fn order_candidates(eligible: &[&BackendRef], roll: u64) -> Vec<BackendRef> {
    if eligible.is_empty() {
        return Vec::new();
    }

    let total_weight: u64 = eligible.iter().map(|b| u64::from(b.weight)).sum();
    let selected_index = if total_weight == 0 {
        (roll % eligible.len() as u64) as usize
    } else {
        let mut pick = roll % total_weight;
        let mut selected = 0usize;
        for (idx, backend) in eligible.iter().enumerate() {
            let weight = u64::from(backend.weight);
            if pick < weight {
                selected = idx;
                break;
            }
            pick -= weight;
        }
        selected
    };

    let mut out = Vec::with_capacity(eligible.len());
    out.push(eligible[selected_index].clone());

    let mut rest: Vec<&BackendRef> = eligible
        .iter()
        .enumerate()
        .filter(|(idx, _)| *idx != selected_index)
        .map(|(_, backend)| *backend)
        .collect();
    // Stable sort keeps policy order among equal weights.
    rest.sort_by(|a, b| b.weight.cmp(&a.weight));
    out.extend(rest.into_iter().cloned());
    out
}

static ROLL_SEQ: AtomicU64 = AtomicU64::new(0);

/// Random roll for weighted selection, falling back to a hashed clock/counter when the OS
/// source is unavailable.
pub fn random_roll() -> u64 {
    let mut bytes = [0u8; 8];
    if getrandom::fill(&mut bytes).is_ok() {
        return u64::from_le_bytes(bytes);
    }
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let seq = ROLL_SEQ.fetch_add(1, Ordering::Relaxed);
    let mut seed = [0u8; 16];
    seed[..8].copy_from_slice(&nanos.to_le_bytes());
    seed[8..].copy_from_slice(&seq.to_le_bytes());
    hash64_fnv1a(&seed)
}

fn hash64_fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refs(entries: &[(&str, u32)]) -> Vec<BackendRef> {
        entries
            .iter()
            .map(|(name, weight)| BackendRef::new(*name, *weight))
            .collect()
    }

    fn names(out: &[BackendRef]) -> Vec<&str> {
        out.iter().map(|b| b.backend.as_str()).collect()
    }

    #[test]
    fn roll_maps_onto_cumulative_weights() {
        let backends = refs(&[("a", 1), ("b", 3)]);
        let eligible: Vec<&BackendRef> = backends.iter().collect();
        assert_eq!(names(&order_candidates(&eligible, 0)), vec!["a", "b"]);
        assert_eq!(names(&order_candidates(&eligible, 1)), vec!["b", "a"]);
        assert_eq!(names(&order_candidates(&eligible, 3)), vec!["b", "a"]);
        assert_eq!(names(&order_candidates(&eligible, 4)), vec!["a", "b"]);
    }

    #[test]
    fn failover_order_is_weight_descending() {
        let backends = refs(&[("a", 1), ("b", 5), ("c", 3), ("d", 5)]);
        let eligible: Vec<&BackendRef> = backends.iter().collect();
        let out = order_candidates(&eligible, 0);
        assert_eq!(names(&out), vec!["a", "b", "d", "c"]);
    }

    #[test]
    fn zero_weight_backends_are_failover_only() {
        let backends = refs(&[("standby", 0), ("main", 2)]);
        let eligible: Vec<&BackendRef> = backends.iter().collect();
        for roll in 0..10 {
            let out = order_candidates(&eligible, roll);
            assert_eq!(names(&out), vec!["main", "standby"]);
        }
    }

    #[test]
    fn equal_weights_spread_evenly() {
        let backends = refs(&[("a", 1), ("b", 1)]);
        let eligible: Vec<&BackendRef> = backends.iter().collect();
        let mut a = 0;
        for _ in 0..2_000 {
            if order_candidates(&eligible, random_roll())[0].backend == "a" {
                a += 1;
            }
        }
        assert!((800..=1_200).contains(&a), "a picked {a} times");
    }

    #[test]
    fn empty_input_yields_no_candidates() {
        assert!(order_candidates(&[], 7).is_empty());
    }
}
