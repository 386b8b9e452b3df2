//! Ranked in-memory index: player → score plus score → players buckets.
//!
//! Buckets live in a `BTreeMap` so ranked reads walk from the highest score
//! down. Players sharing a score are ordered by id ascending, which makes the
//! ranking independent of the order in which scores were added.

use std::collections::{BTreeMap, BTreeSet};

use pops_core::{LeaderboardEntry, PlayerId, PopError, PopResult};
use rustc_hash::FxHashMap;

#[derive(Debug, Default, Clone)]
pub struct RankedIndex {
    scores: FxHashMap<PlayerId, u64>,
    buckets: BTreeMap<u64, BTreeSet<PlayerId>>,
    total: u64,
}

impl RankedIndex {
    pub fn new() -> Self { Self::default() }

    /// Rebuild from persisted per-player scores. Zero scores are skipped.
    pub fn from_scores(scores: impl IntoIterator<Item = (PlayerId, u64)>) -> Self {
        let mut idx = Self::new();
        for (player, score) in scores {
            if score == 0 { continue; }
            idx.total = idx.total.saturating_add(score);
            if let Some(prev) = idx.scores.insert(player, score) {
                idx.unlink(player, prev);
            }
            idx.buckets.entry(score).or_default().insert(player);
        }
        idx
    }

    /// Warm-start rebuild; `None` when the stored total disagrees with the scores.
    pub fn from_checkpoint(total: u64, scores: impl IntoIterator<Item = (PlayerId, u64)>) -> Option<Self> {
        let idx = Self::from_scores(scores);
        (idx.total == total).then_some(idx)
    }

    /// Add a positive `delta` to the player's score and return the new score.
    pub fn add_score(&mut self, player: PlayerId, delta: u64) -> PopResult<u64> {
        if delta == 0 {
            return Err(PopError::Validation("score delta must be positive".into()));
        }
        let current = self.scores.get(&player).copied().unwrap_or(0);
        let next = current
            .checked_add(delta)
            .ok_or_else(|| PopError::Validation(format!("score overflow for {}", player)))?;
        let total = self
            .total
            .checked_add(delta)
            .ok_or_else(|| PopError::Validation("total score overflow".into()))?;
        if current > 0 {
            self.unlink(player, current);
        }
        self.scores.insert(player, next);
        self.buckets.entry(next).or_default().insert(player);
        self.total = total;
        Ok(next)
    }

    fn unlink(&mut self, player: PlayerId, score: u64) {
        if let Some(set) = self.buckets.get_mut(&score) {
            set.remove(&player);
            if set.is_empty() {
                self.buckets.remove(&score);
            }
        }
    }

    pub fn player_score(&self, player: &PlayerId) -> u64 {
        self.scores.get(player).copied().unwrap_or(0)
    }

    /// Highest scores first, at most `limit` entries; ties by player id ascending.
    pub fn top_scores(&self, limit: usize) -> Vec<LeaderboardEntry> {
        let mut out = Vec::with_capacity(limit.min(self.scores.len()));
        if limit == 0 { return out; }
        'walk: for (score, players) in self.buckets.iter().rev() {
            for player in players {
                out.push(LeaderboardEntry { player: *player, score: *score });
                if out.len() >= limit { break 'walk; }
            }
        }
        out
    }

    pub fn total_players(&self) -> usize { self.scores.len() }

    pub fn total_score(&self) -> u64 { self.total }

    /// All (player, score) pairs sorted by player, for checkpoints.
    pub fn scores(&self) -> Vec<(PlayerId, u64)> {
        let mut v: Vec<_> = self.scores.iter().map(|(p, s)| (*p, *s)).collect();
        v.sort_unstable();
        v
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        let mut seen = 0usize;
        for (score, players) in &self.buckets {
            assert!(!players.is_empty(), "empty bucket at {}", score);
            for p in players {
                assert_eq!(self.scores.get(p), Some(score), "{} filed under wrong bucket", p);
                seen += 1;
            }
        }
        assert_eq!(seen, self.scores.len(), "player present in more than one bucket");
        assert_eq!(self.total, self.scores.values().sum::<u64>());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> PlayerId { PlayerId::parse(s).unwrap() }

    #[test]
    fn delta_added_to_existing_score() {
        let mut idx = RankedIndex::new();
        assert_eq!(idx.add_score(p("6500000001"), 7).unwrap(), 7);
        assert_eq!(idx.add_score(p("6500000001"), 3).unwrap(), 10);
        assert_eq!(idx.add_score(p("6500000001"), 5).unwrap(), 15);
        assert_eq!(idx.player_score(&p("6500000001")), 15);
        assert_eq!(idx.total_score(), 15);
        assert_eq!(idx.total_players(), 1);
        idx.assert_consistent();
    }

    #[test]
    fn unknown_player_scores_zero() {
        let idx = RankedIndex::new();
        assert_eq!(idx.player_score(&p("6500000001")), 0);
        assert!(idx.top_scores(10).is_empty());
    }

    #[test]
    fn zero_delta_rejected_without_side_effects() {
        let mut idx = RankedIndex::new();
        idx.add_score(p("6500000001"), 2).unwrap();
        assert!(matches!(idx.add_score(p("6500000001"), 0), Err(PopError::Validation(_))));
        assert_eq!(idx.total_score(), 2);
        idx.assert_consistent();
    }

    #[test]
    fn ties_break_by_player_id() {
        let mut idx = RankedIndex::new();
        idx.add_score(p("6500000003"), 10).unwrap();
        idx.add_score(p("6500000001"), 5).unwrap();
        idx.add_score(p("6500000002"), 10).unwrap();
        let top2 = idx.top_scores(2);
        assert_eq!(
            top2,
            vec![
                LeaderboardEntry { player: p("6500000002"), score: 10 },
                LeaderboardEntry { player: p("6500000003"), score: 10 },
            ]
        );
        let top3 = idx.top_scores(3);
        assert_eq!(top3.len(), 3);
        assert_eq!(top3[2], LeaderboardEntry { player: p("6500000001"), score: 5 });
        assert_eq!(idx.top_scores(50).len(), 3);
        assert!(idx.top_scores(0).is_empty());
    }

    #[test]
    fn ranking_independent_of_insertion_order() {
        let adds = [
            ("6500000004", 3u64),
            ("6500000002", 6),
            ("6500000004", 3),
            ("6500000009", 1),
            ("6500000007", 6),
            ("6500000009", 5),
            ("6500000001", 2),
        ];
        let mut fwd = RankedIndex::new();
        for (who, d) in adds.iter() { fwd.add_score(p(who), *d).unwrap(); }
        let mut rev = RankedIndex::new();
        for (who, d) in adds.iter().rev() { rev.add_score(p(who), *d).unwrap(); }
        assert_eq!(fwd.top_scores(10), rev.top_scores(10));
        fwd.assert_consistent();
        rev.assert_consistent();

        let top = fwd.top_scores(10);
        for w in top.windows(2) {
            assert!(w[0].score > w[1].score || (w[0].score == w[1].score && w[0].player < w[1].player));
        }
    }

    #[test]
    fn moving_up_leaves_old_bucket() {
        let mut idx = RankedIndex::new();
        idx.add_score(p("6500000001"), 4).unwrap();
        idx.add_score(p("6500000002"), 4).unwrap();
        idx.add_score(p("6500000001"), 1).unwrap();
        idx.assert_consistent();
        assert_eq!(idx.top_scores(1)[0], LeaderboardEntry { player: p("6500000001"), score: 5 });
        assert_eq!(idx.top_scores(2)[1], LeaderboardEntry { player: p("6500000002"), score: 4 });
    }

    #[test]
    fn rebuild_from_scores_matches_incremental() {
        let mut idx = RankedIndex::new();
        idx.add_score(p("6500000001"), 4).unwrap();
        idx.add_score(p("6500000002"), 9).unwrap();
        idx.add_score(p("6500000001"), 2).unwrap();
        let back = RankedIndex::from_scores(idx.scores());
        back.assert_consistent();
        assert_eq!(back.total_score(), idx.total_score());
        assert_eq!(back.top_scores(10), idx.top_scores(10));
        assert!(RankedIndex::from_checkpoint(15, idx.scores()).is_some());
        assert!(RankedIndex::from_checkpoint(14, idx.scores()).is_none());
    }
}
