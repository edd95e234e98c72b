//! Resolution of competing candidates.
//!
//! Overlapping lexical spans and repeated keyword hits are the same problem: order the
//! candidates by a rank key, then walk them keeping each one that does not conflict with
//! the last one kept. Ties keep the earlier candidate (the sort is stable).

/// Keep the best candidate among each group of conflicting neighbours.
///
/// `rank` orders candidates so that conflicting ones end up adjacent with the preferred
/// one first; `conflicts(kept, candidate)` decides whether `candidate` loses to `kept`.
pub fn resolve_competing<T, K, R, C>(mut candidates: Vec<T>, rank: R, conflicts: C) -> Vec<T>
where
    K: Ord,
    R: Fn(&T) -> K,
    C: Fn(&T, &T) -> bool,
{
    candidates.sort_by_key(|c| rank(c));

    let mut kept: Vec<T> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let loses = kept.last().map_or(false, |last| conflicts(last, &candidate));
        if !loses {
            kept.push(candidate);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Reverse;

    #[test]
    fn test_span_overlap_keeps_earliest_longest() {
        // (index, length)
        let spans = vec![(10, 4), (0, 12), (0, 5), (20, 3)];
        let kept = resolve_competing(
            spans,
            |&(index, len)| (index, Reverse(len)),
            |&(i, l), &(j, _)| j < i + l,
        );
        assert_eq!(kept, vec![(0, 12), (20, 3)]);
    }

    #[test]
    fn test_key_dedupe_keeps_first_occurrence() {
        let hits = vec![("payment", "venmo", 3), ("intent", "text me", 0), ("payment", "venmo", 40)];
        let kept = resolve_competing(
            hits,
            |&(category, keyword, _)| (category, keyword),
            |a, b| (a.0, a.1) == (b.0, b.1),
        );
        assert_eq!(kept, vec![("intent", "text me", 0), ("payment", "venmo", 3)]);
    }

    #[test]
    fn test_empty_input() {
        let kept: Vec<(usize, usize)> = resolve_competing(vec![], |c| *c, |_, _| true);
        assert!(kept.is_empty());
    }
}
