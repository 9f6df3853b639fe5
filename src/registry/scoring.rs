//! Compatibility scoring between agents and capability requirements

use super::agent::{Agent, AgentPerformance, HealthStatus};
use std::cmp::Ordering;
use std::collections::BTreeSet;

const BASE_SCORE: f64 = 0.5;
const EXACT_MATCH_BONUS: f64 = 0.2;
const SUCCESS_WEIGHT: f64 = 0.2;
const LATENCY_WEIGHT: f64 = 0.1;
/// Latency at which the inverse-latency term reaches zero
const LATENCY_CEILING_MS: f64 = 5000.0;

/// Score an agent against a requirement, `None` when it cannot serve it
///
/// An agent qualifies only when its capability names are a superset of a
/// non-empty requirement.
pub fn compatibility_score(agent: &Agent, required: &BTreeSet<String>) -> Option<f64> {
    if required.is_empty() {
        return None;
    }

    let names = agent.capability_names();
    if !required.iter().all(|r| names.contains(r.as_str())) {
        return None;
    }

    let exact = names.len() == required.len();
    Some(score_components(exact, &agent.performance))
}

fn score_components(exact: bool, performance: &AgentPerformance) -> f64 {
    let mut score = BASE_SCORE;
    if exact {
        score += EXACT_MATCH_BONUS;
    }
    score += SUCCESS_WEIGHT * performance.success_score.clamp(0.0, 1.0);
    score += LATENCY_WEIGHT * (1.0 - performance.average_latency_ms / LATENCY_CEILING_MS).max(0.0);
    score.clamp(0.0, 1.0)
}

/// Ranking inputs of one agent paired with its compatibility score
///
/// Only what ordering needs is copied out of the registry; the full record
/// is fetched for the agent finally chosen.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredAgent {
    pub id: String,
    pub score: f64,
    pub average_latency_ms: f64,
    pub status: HealthStatus,
}

impl ScoredAgent {
    pub fn new(agent: &Agent, score: f64) -> Self {
        Self {
            id: agent.id.clone(),
            score,
            average_latency_ms: agent.performance.average_latency_ms,
            status: agent.health.status,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn average_latency_ms(&self) -> f64 {
        self.average_latency_ms
    }
}

/// Ranking used by capability matching: score desc, latency asc, id asc
pub(crate) fn rank(a: &ScoredAgent, b: &ScoredAgent) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| {
            a.average_latency_ms()
                .partial_cmp(&b.average_latency_ms())
                .unwrap_or(Ordering::Equal)
        })
        .then_with(|| a.id().cmp(b.id()))
}

/// Agents able to serve a requirement, best first
///
/// Iteration is finite and can be restarted any number of times.
#[derive(Debug, Clone, Default)]
pub struct CapableAgents {
    required: BTreeSet<String>,
    agents: Vec<ScoredAgent>,
}

impl CapableAgents {
    pub(crate) fn new(required: BTreeSet<String>, mut agents: Vec<ScoredAgent>) -> Self {
        agents.sort_by(rank);
        Self { required, agents }
    }

    pub fn required(&self) -> &BTreeSet<String> {
        &self.required
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ScoredAgent> {
        self.agents.iter()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.agents.iter().map(ScoredAgent::id).collect()
    }

    pub fn into_vec(self) -> Vec<ScoredAgent> {
        self.agents
    }
}

impl<'a> IntoIterator for &'a CapableAgents {
    type Item = &'a ScoredAgent;
    type IntoIter = std::slice::Iter<'a, ScoredAgent>;

    fn into_iter(self) -> Self::IntoIter {
        self.agents.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::agent::{AgentMetadata, AgentOrigin};
    use proptest::prelude::*;

    fn agent(id: &str, caps: &[&str]) -> Agent {
        let metadata = AgentMetadata::new(id, "http://localhost:9000")
            .with_id(id)
            .with_capabilities(caps.iter().copied());
        let parsed = metadata.parse().unwrap();
        Agent::from_metadata(metadata, parsed, AgentOrigin::Manual)
    }

    fn required(caps: &[&str]) -> BTreeSet<String> {
        caps.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn test_exact_match_outscores_broad_agent() {
        let a1 = agent("a1", &["x@1.0"]);
        let a2 = agent("a2", &["x@1.0", "y@1.0"]);
        let req = required(&["x"]);

        let s1 = compatibility_score(&a1, &req).unwrap();
        let s2 = compatibility_score(&a2, &req).unwrap();
        assert!(s1 > s2);
        assert!((s1 - s2 - EXACT_MATCH_BONUS).abs() < 1e-9);
    }

    #[test]
    fn test_perfect_agent_scores_one() {
        let a = agent("a", &["x"]);
        assert_eq!(compatibility_score(&a, &required(&["x"])), Some(1.0));
    }

    #[test]
    fn test_success_score_raises_ranking() {
        let strong = agent("strong", &["x"]);
        let mut weak = agent("weak", &["x"]);
        weak.performance.success_score = 0.5;

        let req = required(&["x"]);
        assert!(compatibility_score(&strong, &req).unwrap() > compatibility_score(&weak, &req).unwrap());
    }

    #[test]
    fn test_latency_term_floors_at_zero() {
        let mut slow = agent("slow", &["x"]);
        slow.performance.average_latency_ms = 12_000.0;
        let score = compatibility_score(&slow, &required(&["x"])).unwrap();
        assert!((score - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_missing_capability_excluded() {
        let a = agent("a", &["x", "y"]);
        assert_eq!(compatibility_score(&a, &required(&["x", "z"])), None);
        assert_eq!(compatibility_score(&a, &required(&[])), None);
    }

    #[test]
    fn test_version_does_not_affect_matching() {
        let a = agent("a", &["x@2.0"]);
        assert!(compatibility_score(&a, &required(&["x"])).is_some());
    }

    #[test]
    fn test_ranking_tie_breaks() {
        let mut fast = agent("b-fast", &["x"]);
        fast.performance.average_latency_ms = 0.0;
        let mut slow = agent("a-slow", &["x"]);
        slow.performance.average_latency_ms = 0.0;
        slow.performance.success_score = 1.0;

        let capable = CapableAgents::new(
            required(&["x"]),
            vec![
                ScoredAgent::new(&fast, 0.8),
                ScoredAgent::new(&slow, 0.8),
            ],
        );
        assert_eq!(capable.ids(), vec!["a-slow", "b-fast"]);

        // restartable
        assert_eq!(capable.iter().count(), 2);
        assert_eq!((&capable).into_iter().count(), 2);
    }

    fn capability_names() -> impl Strategy<Value = BTreeSet<String>> {
        prop::collection::btree_set(prop::sample::select(vec!["a", "b", "c", "d", "e"]), 0..5)
            .prop_map(|set| set.into_iter().map(String::from).collect())
    }

    proptest! {
        #[test]
        fn score_is_bounded_and_deterministic(
            caps in capability_names(),
            req in capability_names(),
            success in 0.0f64..=1.0,
            latency in 0.0f64..20_000.0,
        ) {
            prop_assume!(!caps.is_empty());
            let names: Vec<&str> = caps.iter().map(String::as_str).collect();
            let mut a = agent("p", &names);
            a.performance.success_score = success;
            a.performance.average_latency_ms = latency;

            let first = compatibility_score(&a, &req);
            let second = compatibility_score(&a, &req);
            prop_assert_eq!(first, second);

            let superset = !req.is_empty() && req.is_subset(&caps);
            prop_assert_eq!(first.is_some(), superset);
            if let Some(score) = first {
                let view = ScoredAgent::new(&a, score);
                prop_assert_eq!(view.id(), "p");
                prop_assert_eq!(view.average_latency_ms(), latency);
            }
            if let Some(score) = first {
                prop_assert!((0.0..=1.0).contains(&score));
            }
        }
    }
}
