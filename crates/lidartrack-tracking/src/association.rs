//! Track ↔ cluster association.
//!
//! Candidates are `(track, cluster, d²)` triples that already passed the
//! compatibility checks (same pose identifier, finite distance).  Greedy
//! assignment repeatedly commits the globally smallest remaining distance
//! under the gate and removes both sides, so every track and every cluster
//! is matched at most once per frame.
//!
//! Greedy matching is not optimal under dense, close-crossing traffic; only
//! the gate and mutual exclusivity are relied on by the tracker.

/// One gated association candidate.
#[derive(Clone, Debug, PartialEq)]
pub struct Candidate {
    pub track_idx: usize,
    pub cluster_idx: usize,
    /// Squared Mahalanobis distance.
    pub d2: f64,
}

/// Outcome of one association round.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Assignment {
    /// `(track_idx, cluster_idx)` pairs in commit order.
    pub matches: Vec<(usize, usize)>,
    pub unmatched_tracks: Vec<usize>,
    pub unmatched_clusters: Vec<usize>,
}

/// Greedy global-minimum assignment.
///
/// Ties are broken by track index, then cluster index, so the result is
/// deterministic for a given input.
pub fn greedy_assign(
    n_tracks: usize,
    n_clusters: usize,
    mut candidates: Vec<Candidate>,
    gate_d2: f64,
) -> Assignment {
    candidates.retain(|c| c.d2.is_finite() && c.d2 <= gate_d2);
    candidates.sort_by(|a, b| {
        a.d2.total_cmp(&b.d2)
            .then(a.track_idx.cmp(&b.track_idx))
            .then(a.cluster_idx.cmp(&b.cluster_idx))
    });

    let mut track_taken = vec![false; n_tracks];
    let mut cluster_taken = vec![false; n_clusters];
    let mut matches = Vec::new();

    for c in candidates {
        if track_taken[c.track_idx] || cluster_taken[c.cluster_idx] {
            continue;
        }
        track_taken[c.track_idx] = true;
        cluster_taken[c.cluster_idx] = true;
        matches.push((c.track_idx, c.cluster_idx));
    }

    Assignment {
        matches,
        unmatched_tracks: (0..n_tracks).filter(|&i| !track_taken[i]).collect(),
        unmatched_clusters: (0..n_clusters).filter(|&j| !cluster_taken[j]).collect(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
