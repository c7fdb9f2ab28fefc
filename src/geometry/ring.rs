//! Endpoint chaining of relation member linestrings.
//!
//! Relation members arrive as arbitrary way fragments; rings are rebuilt by
//! repeatedly gluing fragments whose endpoints coincide. Coordinates are
//! already rounded to 7 decimals, so endpoint comparison is exact.

use geo::{Coord, LineString};

/// Merge line fragments into maximal chains, the `ST_LineMerge` equivalent.
///
/// Each input fragment is consumed exactly once. A fragment extends a chain
/// when one of its endpoints equals the chain's head or tail; fragments are
/// reversed as needed. The relative input order is kept for the chain seeds,
/// which makes the output deterministic.
pub fn merge_lines(lines: Vec<LineString<f64>>) -> Vec<LineString<f64>> {
    let mut pool: Vec<Vec<Coord<f64>>> =
        lines.into_iter().map(|line| line.0).filter(|coords| coords.len() >= 2).collect();
    let mut merged = Vec::new();

    while !pool.is_empty() {
        let mut chain = pool.remove(0);
        loop {
            let mut extended = false;
            let mut index = 0;
            while index < pool.len() {
                let candidate = &pool[index];
                let chain_start = chain[0];
                let chain_end = chain[chain.len() - 1];
                let cand_start = candidate[0];
                let cand_end = candidate[candidate.len() - 1];

                if cand_start == chain_end {
                    let candidate = pool.remove(index);
                    chain.extend(candidate.into_iter().skip(1));
                    extended = true;
                } else if cand_end == chain_end {
                    let mut candidate = pool.remove(index);
                    candidate.reverse();
                    chain.extend(candidate.into_iter().skip(1));
                    extended = true;
                } else if cand_end == chain_start {
                    let mut candidate = pool.remove(index);
                    candidate.pop();
                    candidate.extend(chain);
                    chain = candidate;
                    extended = true;
                } else if cand_start == chain_start {
                    let mut candidate = pool.remove(index);
                    candidate.reverse();
                    candidate.pop();
                    candidate.extend(chain);
                    chain = candidate;
                    extended = true;
                } else {
                    index += 1;
                    continue;
                }
                break;
            }
            if !extended {
                break;
            }
        }
        merged.push(LineString::from(chain));
    }

    merged
}

/// Whether a chain starts and ends on the same point.
pub fn is_closed(line: &LineString<f64>) -> bool {
    match (line.0.first(), line.0.last()) {
        (Some(first), Some(last)) => first == last,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::line_string;

    #[test]
    fn merges_fragments_into_a_ring() {
        let fragments = vec![
            line_string![(x: 0.0, y: 0.0), (x: 1.0, y: 0.0)],
            line_string![(x: 1.0, y: 0.0), (x: 1.0, y: 1.0)],
            line_string![(x: 1.0, y: 1.0), (x: 0.0, y: 1.0), (x: 0.0, y: 0.0)],
        ];
        let merged = merge_lines(fragments);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].0.len(), 5);
        assert!(is_closed(&merged[0]));
    }

    #[test]
    fn reverses_fragments_when_needed() {
        let fragments = vec![
            line_string![(x: 0.0, y: 0.0), (x: 1.0, y: 0.0)],
            // Oriented against the ring direction.
            line_string![(x: 1.0, y: 1.0), (x: 1.0, y: 0.0)],
            line_string![(x: 1.0, y: 1.0), (x: 0.0, y: 0.0)],
        ];
        let merged = merge_lines(fragments);
        assert_eq!(merged.len(), 1);
        assert!(is_closed(&merged[0]));
        assert_eq!(merged[0].0.len(), 4);
    }

    #[test]
    fn disjoint_fragments_stay_separate() {
        let fragments = vec![
            line_string![(x: 0.0, y: 0.0), (x: 1.0, y: 0.0)],
            line_string![(x: 5.0, y: 5.0), (x: 6.0, y: 5.0)],
        ];
        let merged = merge_lines(fragments);
        assert_eq!(merged.len(), 2);
        assert!(!is_closed(&merged[0]));
    }

    #[test]
    fn extends_at_the_chain_head() {
        let fragments = vec![
            line_string![(x: 1.0, y: 0.0), (x: 2.0, y: 0.0)],
            line_string![(x: 0.0, y: 0.0), (x: 1.0, y: 0.0)],
        ];
        let merged = merge_lines(fragments);
        assert_eq!(merged.len(), 1);
        assert_eq!(
            merged[0],
            line_string![(x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 2.0, y: 0.0)]
        );
    }
}
