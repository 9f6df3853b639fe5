//! Learned per-agent routing weights
//!
//! Each agent carries a weight in [0, 1], starting neutral at 0.5 and moved
//! towards the observed reward after every outcome. The weight shifts a
//! compatibility score by at most `cap` in either direction, so learning can
//! reorder close candidates but never lifts an agent far above its fit.

use super::slots::SlotMap;

const NEUTRAL_WEIGHT: f64 = 0.5;

#[derive(Debug)]
pub struct AdaptiveWeights {
    learning_rate: f64,
    cap: f64,
    weights: SlotMap<f64>,
}

impl AdaptiveWeights {
    pub fn new(learning_rate: f64, cap: f64) -> Self {
        Self {
            learning_rate: learning_rate.clamp(0.0, 1.0),
            cap: cap.clamp(0.0, 1.0),
            weights: SlotMap::default(),
        }
    }

    pub fn weight(&self, agent_id: &str) -> f64 {
        self.weights
            .get(agent_id)
            .map_or(NEUTRAL_WEIGHT, |slot| *slot.lock())
    }

    /// Move the weight towards `reward` (1 success, 0 failure or timeout)
    pub fn update(&self, agent_id: &str, reward: f64) -> f64 {
        let slot = self.weights.get_or_insert_with(agent_id, || NEUTRAL_WEIGHT);
        let mut weight = slot.lock();
        *weight += self.learning_rate * (reward.clamp(0.0, 1.0) - *weight);
        *weight = weight.clamp(0.0, 1.0);
        *weight
    }

    /// Blend a compatibility score with the agent's learned weight
    pub fn adjust(&self, agent_id: &str, score: f64) -> f64 {
        blend(score, self.weight(agent_id), self.cap)
    }

    pub fn remove_agent(&self, agent_id: &str) {
        self.weights.retain(|key| key != agent_id);
    }
}

pub(crate) fn blend(score: f64, weight: f64, cap: f64) -> f64 {
    (score + cap * (2.0 * weight - 1.0)).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_neutral_weight_leaves_score() {
        let weights = AdaptiveWeights::new(0.1, 0.1);
        assert_eq!(weights.weight("a1"), 0.5);
        assert!((weights.adjust("a1", 0.8) - 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_update_moves_towards_reward() {
        let weights = AdaptiveWeights::new(0.1, 0.1);
        let after_success = weights.update("a1", 1.0);
        assert!((after_success - 0.55).abs() < 1e-12);

        let after_failure = weights.update("a1", 0.0);
        assert!((after_failure - 0.495).abs() < 1e-12);
    }

    #[test]
    fn test_learning_reorders_close_candidates() {
        let weights = AdaptiveWeights::new(0.5, 0.1);
        for _ in 0..10 {
            weights.update("reliable", 1.0);
            weights.update("flaky", 0.0);
        }
        // flaky starts slightly ahead on compatibility
        assert!(weights.adjust("reliable", 0.80) > weights.adjust("flaky", 0.85));
    }

    proptest! {
        #[test]
        fn blend_stays_bounded_and_capped(
            score in 0.0f64..=1.0,
            weight in 0.0f64..=1.0,
            cap in 0.0f64..=1.0,
        ) {
            let adjusted = blend(score, weight, cap);
            prop_assert!((0.0..=1.0).contains(&adjusted));
            prop_assert!((adjusted - score).abs() <= cap + 1e-12);
        }

        #[test]
        fn blend_is_monotonic_in_weight(
            score in 0.0f64..=1.0,
            w1 in 0.0f64..=1.0,
            w2 in 0.0f64..=1.0,
            cap in 0.0f64..=1.0,
        ) {
            let (lo, hi) = if w1 <= w2 { (w1, w2) } else { (w2, w1) };
            prop_assert!(blend(score, lo, cap) <= blend(score, hi, cap));
        }

        #[test]
        fn learned_weight_cannot_overcome_a_gap_wider_than_twice_the_cap(
            updates in 0usize..200,
            lr in 0.01f64..=1.0,
            cap in 0.0f64..=0.2,
        ) {
            let weights = AdaptiveWeights::new(lr, cap);
            for _ in 0..updates {
                weights.update("favoured", 1.0);
                weights.update("penalised", 0.0);
            }
            // base gap strictly larger than the maximum learned swing
            let strong = 0.95;
            let weak = strong - 2.0 * cap - 0.01;
            prop_assume!(weak >= 0.0);
            prop_assert!(weights.adjust("penalised", strong) > weights.adjust("favoured", weak));
        }

        #[test]
        fn weight_stays_in_unit_interval(
            rewards in prop::collection::vec(prop::bool::ANY, 0..100),
            lr in 0.01f64..=1.0,
        ) {
            let weights = AdaptiveWeights::new(lr, 0.1);
            for success in rewards {
                let w = weights.update("a", if success { 1.0 } else { 0.0 });
                prop_assert!((0.0..=1.0).contains(&w));
            }
        }
    }
}
