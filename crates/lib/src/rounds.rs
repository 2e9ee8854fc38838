//! Maps server iteration numbers onto per-turn round numbers.
//!
//! The server's iteration counter is global and keeps growing across turns.
//! The console shows each turn starting at round 1, so the first iteration
//! key seen in a turn becomes the base and everything else is an offset
//! from it. `reset` starts the next turn fresh.

use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct RoundMap {
    base: Option<u64>,
    memo: HashMap<u64, u64>,
}

impl RoundMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Display round for a server iteration key. Frames without a key belong
    /// to round 1. The same key always yields the same round for the life of
    /// the turn, even out of order.
    pub fn round_of(&mut self, iter: Option<u64>) -> u64 {
        let Some(key) = iter else {
            return 1;
        };
        if let Some(&round) = self.memo.get(&key) {
            return round;
        }
        let base = *self.base.get_or_insert(key);
        // Keys below the base (late frames from an earlier turn) clamp to 1;
        // the add saturates so a key at u64::MAX cannot wrap to 0.
        let round = key.saturating_sub(base).saturating_add(1);
        self.memo.insert(key, round);
        round
    }

    /// Forget the base and all assignments. The next key seen becomes round 1.
    pub fn reset(&mut self) {
        self.base = None;
        self.memo.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_key_becomes_round_one() {
        let mut map = RoundMap::new();
        assert_eq!(map.round_of(Some(40)), 1);
        assert_eq!(map.round_of(Some(41)), 2);
        assert_eq!(map.round_of(Some(44)), 5);
    }

    #[test]
    fn repeated_key_is_stable() {
        let mut map = RoundMap::new();
        assert_eq!(map.round_of(Some(7)), 1);
        assert_eq!(map.round_of(Some(9)), 3);
        assert_eq!(map.round_of(Some(7)), 1);
        assert_eq!(map.round_of(Some(9)), 3);
    }

    #[test]
    fn missing_key_is_round_one() {
        let mut map = RoundMap::new();
        assert_eq!(map.round_of(None), 1);
        assert_eq!(map.round_of(Some(12)), 1);
        assert_eq!(map.round_of(None), 1);
    }

    #[test]
    fn key_below_base_clamps_to_one() {
        let mut map = RoundMap::new();
        assert_eq!(map.round_of(Some(10)), 1);
        assert_eq!(map.round_of(Some(8)), 1);
    }

    #[test]
    fn key_at_u64_max_saturates() {
        let mut map = RoundMap::new();
        assert_eq!(map.round_of(Some(0)), 1);
        assert_eq!(map.round_of(Some(u64::MAX)), u64::MAX);
        assert_eq!(map.round_of(Some(u64::MAX)), u64::MAX);
    }

    #[test]
    fn reset_starts_a_new_base() {
        let mut map = RoundMap::new();
        assert_eq!(map.round_of(Some(3)), 1);
        assert_eq!(map.round_of(Some(4)), 2);
        map.reset();
        assert_eq!(map.round_of(Some(9)), 1);
        assert_eq!(map.round_of(Some(10)), 2);
    }
}
