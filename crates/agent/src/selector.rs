//! Stream selector (spec.md §4.C, component C): a pure function that picks
//! one video tier id given the full candidate set and a caller's request.
//! No I/O, no locks — callers (the ABR loop, explicit `signal/video`
//! handling) pass it a snapshot and get a decision back.
//!
//! Grounded in the original's `internal/capture/streamselector.go` and
//! `buckets.go` (`FindNearestStream`'s tie-break and the `streamDiff` sign
//! convention: positive when the candidate is cheaper than the target).

use crate::error::SelectorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Lower,
    Higher,
}

/// What the caller wants from the current set of tiers. `video_ids` (in
/// the request context) is the full, ascending-by-bitrate tier order.
#[derive(Debug, Clone, Default)]
pub struct SelectionRequest {
    pub video_id: Option<String>,
    pub direction: Option<Direction>,
    pub bitrate: Option<u64>,
}

/// A read-only snapshot of one candidate tier.
#[derive(Debug, Clone)]
pub struct SinkSnapshot {
    pub id: String,
    pub bitrate: u64,
}

/// `video_ids` must be given in ascending-bitrate order (spec.md §4.C); it
/// is also the fallback list when every candidate is excluded.
pub fn select(
    video_ids: &[String],
    sinks: &[SinkSnapshot],
    request: &SelectionRequest,
) -> Result<String, SelectorError> {
    let index_of = |id: &str| video_ids.iter().position(|v| v == id);

    // Priority 1: exact id + explicit direction — step one tier that way.
    if let (Some(id), Some(direction)) = (&request.video_id, request.direction) {
        if let Some(idx) = index_of(id) {
            let stepped = match direction {
                Direction::Lower => idx.checked_sub(1),
                Direction::Higher => {
                    let next = idx + 1;
                    (next < video_ids.len()).then_some(next)
                }
            };
            return match stepped {
                Some(stepped_idx) => Ok(video_ids[stepped_idx].clone()),
                // Already at the edge in the requested direction.
                None => Err(SelectorError::StreamNotFound),
            };
        }
    }

    // Priority 2: exact id alone.
    if let Some(id) = &request.video_id {
        if index_of(id).is_some() {
            return Ok(id.clone());
        }
    }

    // Priority 3: nearest bitrate among sinks that have ever published one.
    if let Some(target) = request.bitrate {
        let candidates: Vec<&SinkSnapshot> = sinks.iter().filter(|s| s.bitrate != 0).collect();
        if !candidates.is_empty() {
            if let Some(exact) = candidates.iter().find(|s| s.bitrate == target) {
                return Ok(exact.id.clone());
            }
            return Ok(find_nearest(&candidates, target).id.clone());
        }
    }

    if !video_ids.is_empty() {
        return Ok(video_ids[0].clone());
    }

    Err(SelectorError::StreamNotFound)
}

/// Tie-break (spec.md §4.C / original `streamDiff`): `diff = target -
/// sink.bitrate`. A non-negative diff means the sink's bitrate is at or
/// below the target; among those, the smallest diff (closest to target
/// from below) wins. If every sink overshoots the target, prefer the one
/// closest to zero (the smallest overshoot).
fn find_nearest<'a>(candidates: &[&'a SinkSnapshot], target: u64) -> &'a SinkSnapshot {
    let diff = |s: &SinkSnapshot| target as i64 - s.bitrate as i64;

    let mut best: Option<&SinkSnapshot> = None;
    let mut best_diff = i64::MAX;
    for &c in candidates {
        let d = diff(c);
        let comparable = if d >= 0 { d } else { i64::MAX / 2 - d };
        if comparable < best_diff {
            best_diff = comparable;
            best = Some(c);
        }
    }
    best.expect("candidates is non-empty")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn sink(id: &str, bitrate: u64) -> SinkSnapshot {
        SinkSnapshot {
            id: id.to_string(),
            bitrate,
        }
    }

    #[test]
    fn exact_id_and_direction_steps_up() {
        let video_ids = ids(&["lq", "mq", "hq", "hd"]);
        let req = SelectionRequest {
            video_id: Some("mq".to_string()),
            direction: Some(Direction::Higher),
            bitrate: None,
        };
        assert_eq!(select(&video_ids, &[], &req).unwrap(), "hq");
    }

    #[test]
    fn exact_id_and_direction_at_edge_is_stream_not_found() {
        let video_ids = ids(&["lq", "mq", "hq", "hd"]);
        let req = SelectionRequest {
            video_id: Some("hd".to_string()),
            direction: Some(Direction::Higher),
            bitrate: None,
        };
        assert!(matches!(
            select(&video_ids, &[], &req),
            Err(SelectorError::StreamNotFound)
        ));
    }

    #[test]
    fn exact_id_alone() {
        let video_ids = ids(&["lq", "mq", "hq"]);
        let req = SelectionRequest {
            video_id: Some("mq".to_string()),
            direction: None,
            bitrate: None,
        };
        assert_eq!(select(&video_ids, &[], &req).unwrap(), "mq");
    }

    #[test]
    fn nearest_bitrate_worked_example() {
        // From the concrete scenario: sinks {1:500, 2:750, 3:1000, 4:1250,
        // 5:1700}, a target of 800 resolves to sink 2 — the closest sink
        // at or below the target.
        let video_ids = ids(&["1", "2", "3", "4", "5"]);
        let sinks = vec![
            sink("1", 500),
            sink("2", 750),
            sink("3", 1000),
            sink("4", 1250),
            sink("5", 1700),
        ];
        let req = SelectionRequest {
            video_id: None,
            direction: None,
            bitrate: Some(800),
        };
        assert_eq!(select(&video_ids, &sinks, &req).unwrap(), "2");
    }

    #[test]
    fn nearest_bitrate_prefers_closest_negative_when_all_under_target() {
        let video_ids = ids(&["1", "2"]);
        let sinks = vec![sink("1", 300), sink("2", 500)];
        let req = SelectionRequest {
            video_id: None,
            direction: None,
            bitrate: Some(10_000),
        };
        assert_eq!(select(&video_ids, &sinks, &req).unwrap(), "2");
    }

    #[test]
    fn zero_bitrate_sinks_excluded_from_candidates() {
        let video_ids = ids(&["1", "2"]);
        let sinks = vec![sink("1", 0), sink("2", 500)];
        let req = SelectionRequest {
            video_id: None,
            direction: None,
            bitrate: Some(10),
        };
        assert_eq!(select(&video_ids, &sinks, &req).unwrap(), "2");
    }

    #[test]
    fn exact_bitrate_match_wins() {
        let video_ids = ids(&["1", "2"]);
        let sinks = vec![sink("1", 500), sink("2", 1000)];
        let req = SelectionRequest {
            video_id: None,
            direction: None,
            bitrate: Some(1000),
        };
        assert_eq!(select(&video_ids, &sinks, &req).unwrap(), "2");
    }

    #[test]
    fn falls_back_to_first_tier_when_no_candidates() {
        let video_ids = ids(&["lq", "hq"]);
        let req = SelectionRequest::default();
        assert_eq!(select(&video_ids, &[], &req).unwrap(), "lq");
    }

    #[test]
    fn empty_everything_is_stream_not_found() {
        let req = SelectionRequest::default();
        assert!(matches!(
            select(&[], &[], &req),
            Err(SelectorError::StreamNotFound)
        ));
    }
}
