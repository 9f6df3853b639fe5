//! Candidate ordering for each routing strategy

use super::adaptive::AdaptiveWeights;
use crate::config::RoutingStrategy;
use crate::registry::ScoredAgent;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

/// Round-robin positions kept before the least recently served is dropped
pub const MAX_CURSORS: usize = 1024;

fn by_f64(a: f64, b: f64) -> Ordering {
    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
}

#[derive(Debug)]
struct Cursor {
    last_served: String,
    touched: u64,
}

#[derive(Debug, Default)]
struct Cursors {
    by_requirement: HashMap<String, Cursor>,
    clock: u64,
}

/// Orders candidates by preference; keeps the round-robin cursors
#[derive(Debug, Default)]
pub struct StrategySelector {
    /// Agent last served per required capability set
    cursors: Mutex<Cursors>,
}

impl StrategySelector {
    pub fn new() -> Self {
        Self::default()
    }

    fn cursor_key(required: &BTreeSet<String>) -> String {
        required.iter().map(String::as_str).collect::<Vec<_>>().join(",")
    }

    /// Record that `agent_id` was dispatched a task for `required`
    ///
    /// Only round-robin keeps a position. Orderings that never end in a
    /// dispatch leave the cycle untouched.
    pub fn served(&self, strategy: RoutingStrategy, required: &BTreeSet<String>, agent_id: &str) {
        if strategy != RoutingStrategy::RoundRobin {
            return;
        }
        let mut cursors = self.cursors.lock();
        cursors.clock += 1;
        let touched = cursors.clock;
        let key = Self::cursor_key(required);

        if !cursors.by_requirement.contains_key(&key)
            && cursors.by_requirement.len() >= MAX_CURSORS
        {
            let stalest = cursors
                .by_requirement
                .iter()
                .min_by_key(|(_, cursor)| cursor.touched)
                .map(|(key, _)| key.clone());
            if let Some(stalest) = stalest {
                cursors.by_requirement.remove(&stalest);
            }
        }
        cursors.by_requirement.insert(
            key,
            Cursor {
                last_served: agent_id.to_string(),
                touched,
            },
        );
    }

    /// Number of requirement sets with a round-robin position
    pub fn cursor_count(&self) -> usize {
        self.cursors.lock().by_requirement.len()
    }

    /// Reorder `candidates` most preferred first
    ///
    /// `in_use` reports leased pool connections per agent. Adaptive weights,
    /// when given, only bias `capability-match`.
    pub fn order<F>(
        &self,
        strategy: RoutingStrategy,
        required: &BTreeSet<String>,
        mut candidates: Vec<ScoredAgent>,
        in_use: F,
        adaptive: Option<&AdaptiveWeights>,
    ) -> Vec<ScoredAgent>
    where
        F: Fn(&str) -> usize,
    {
        if candidates.is_empty() {
            return candidates;
        }

        match strategy {
            RoutingStrategy::CapabilityMatch => {
                if let Some(weights) = adaptive {
                    for candidate in candidates.iter_mut() {
                        candidate.score = weights.adjust(candidate.id(), candidate.score);
                    }
                }
                candidates.sort_by(crate::registry::scoring::rank);
            }
            RoutingStrategy::RoundRobin => {
                candidates.sort_by(|a, b| a.id().cmp(b.id()));
                let cursors = self.cursors.lock();
                let start = cursors
                    .by_requirement
                    .get(&Self::cursor_key(required))
                    .and_then(|cursor| {
                        candidates
                            .iter()
                            .position(|c| c.id() > cursor.last_served.as_str())
                    })
                    .unwrap_or(0);
                drop(cursors);
                candidates.rotate_left(start);
            }
            RoutingStrategy::LeastConnections => {
                let mut keyed: Vec<(usize, ScoredAgent)> = candidates
                    .into_iter()
                    .map(|c| (in_use(c.id()), c))
                    .collect();
                keyed.sort_by(|(la, a), (lb, b)| {
                    la.cmp(lb)
                        .then_with(|| crate::registry::scoring::rank(a, b))
                });
                candidates = keyed.into_iter().map(|(_, c)| c).collect();
            }
            RoutingStrategy::ResponseTime => {
                candidates.sort_by(|a, b| {
                    by_f64(a.average_latency_ms(), b.average_latency_ms())
                        .then_with(|| a.id().cmp(b.id()))
                });
            }
        }
        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Agent, AgentMetadata, AgentOrigin};

    fn scored(id: &str, score: f64, latency: f64) -> ScoredAgent {
        let metadata = AgentMetadata::new(id, "http://localhost:9000")
            .with_id(id)
            .with_capability("x");
        let parsed = metadata.parse().unwrap();
        let mut agent = Agent::from_metadata(metadata, parsed, AgentOrigin::Manual);
        agent.performance.average_latency_ms = latency;
        ScoredAgent::new(&agent, score)
    }

    fn ids(agents: &[ScoredAgent]) -> Vec<&str> {
        agents.iter().map(ScoredAgent::id).collect()
    }

    fn required() -> BTreeSet<String> {
        ["x".to_string()].into()
    }

    fn fleet() -> Vec<ScoredAgent> {
        vec![
            scored("c", 0.9, 300.0),
            scored("a", 0.7, 100.0),
            scored("b", 0.8, 200.0),
        ]
    }

    #[test]
    fn test_capability_match_orders_by_score() {
        let selector = StrategySelector::new();
        let ordered = selector.order(
            RoutingStrategy::CapabilityMatch,
            &required(),
            fleet(),
            |_| 0,
            None,
        );
        assert_eq!(ids(&ordered), vec!["c", "b", "a"]);
    }

    fn round_robin_pick(selector: &StrategySelector, required: &BTreeSet<String>) -> String {
        let ordered = selector.order(RoutingStrategy::RoundRobin, required, fleet(), |_| 0, None);
        let id = ordered[0].id().to_string();
        selector.served(RoutingStrategy::RoundRobin, required, &id);
        id
    }

    #[test]
    fn test_round_robin_cycles_in_id_order() {
        let selector = StrategySelector::new();
        let picks: Vec<String> = (0..6).map(|_| round_robin_pick(&selector, &required())).collect();
        assert_eq!(picks, vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn test_round_robin_only_advances_on_dispatch() {
        let selector = StrategySelector::new();
        assert_eq!(round_robin_pick(&selector, &required()), "a");

        // repeated orderings that never dispatch keep the position
        for _ in 0..5 {
            let ordered =
                selector.order(RoutingStrategy::RoundRobin, &required(), fleet(), |_| 0, None);
            assert_eq!(ordered[0].id(), "b");
        }

        // serving a later candidate continues the cycle after it
        selector.served(RoutingStrategy::RoundRobin, &required(), "c");
        assert_eq!(round_robin_pick(&selector, &required()), "a");
    }

    #[test]
    fn test_round_robin_survives_removed_agent() {
        let selector = StrategySelector::new();
        selector.served(RoutingStrategy::RoundRobin, &required(), "bb");
        assert_eq!(round_robin_pick(&selector, &required()), "c");
    }

    #[test]
    fn test_round_robin_cursor_per_requirement() {
        let selector = StrategySelector::new();
        let other: BTreeSet<String> = ["y".to_string()].into();
        round_robin_pick(&selector, &required());
        assert_eq!(round_robin_pick(&selector, &other), "a");
    }

    #[test]
    fn test_cursor_map_is_bounded() {
        let selector = StrategySelector::new();
        for i in 0..MAX_CURSORS + 10 {
            let required: BTreeSet<String> = [format!("cap{i}")].into();
            selector.served(RoutingStrategy::RoundRobin, &required, "a");
        }
        assert_eq!(selector.cursor_count(), MAX_CURSORS);

        // the most recent requirement keeps its position
        let latest: BTreeSet<String> = [format!("cap{}", MAX_CURSORS + 9)].into();
        assert_eq!(round_robin_pick(&selector, &latest), "b");

        // other strategies never create positions
        selector.served(RoutingStrategy::CapabilityMatch, &["z".to_string()].into(), "a");
        assert_eq!(selector.cursor_count(), MAX_CURSORS);
    }

    #[test]
    fn test_least_connections() {
        let selector = StrategySelector::new();
        let load = |id: &str| match id {
            "c" => 3,
            "b" => 0,
            _ => 1,
        };
        let ordered = selector.order(
            RoutingStrategy::LeastConnections,
            &required(),
            fleet(),
            load,
            None,
        );
        assert_eq!(ids(&ordered), vec!["b", "a", "c"]);
    }

    #[test]
    fn test_response_time() {
        let selector = StrategySelector::new();
        let ordered = selector.order(
            RoutingStrategy::ResponseTime,
            &required(),
            fleet(),
            |_| 0,
            None,
        );
        assert_eq!(ids(&ordered), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_adaptive_bias_only_for_capability_match() {
        let selector = StrategySelector::new();
        let weights = AdaptiveWeights::new(1.0, 0.1);
        weights.update("b", 1.0);
        weights.update("c", 0.0);

        let ordered = selector.order(
            RoutingStrategy::CapabilityMatch,
            &required(),
            fleet(),
            |_| 0,
            Some(&weights),
        );
        assert_eq!(ids(&ordered), vec!["b", "c", "a"]);

        let ordered = selector.order(
            RoutingStrategy::ResponseTime,
            &required(),
            fleet(),
            |_| 0,
            Some(&weights),
        );
        assert_eq!(ids(&ordered), vec!["a", "b", "c"]);
    }
}
