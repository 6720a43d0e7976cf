//! Agent selection for a single task.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use hive_state::AgentProfile;

/// |required ∩ held| / |held|. An agent advertising nothing scores 1.0.
pub fn capability_match_ratio(required: &BTreeSet<String>, held: &BTreeSet<String>) -> f64 {
    if held.is_empty() {
        return 1.0;
    }
    let overlap = required.intersection(held).count();
    overlap as f64 / held.len() as f64
}

fn preference(required: &BTreeSet<String>, a: &AgentProfile, b: &AgentProfile) -> Ordering {
    a.workload
        .total_cmp(&b.workload)
        .then_with(|| {
            capability_match_ratio(required, &b.capabilities)
                .total_cmp(&capability_match_ratio(required, &a.capabilities))
        })
        .then_with(|| a.agent_id.cmp(&b.agent_id))
}

/// Pick the agent for a task needing `required`.
///
/// Only agents holding every required capability qualify. Among those the
/// least loaded wins, then the most specialised (highest match ratio), then
/// the lowest id so the choice is stable.
pub fn find_best_agent<'a>(agents: &'a [AgentProfile], required: &BTreeSet<String>) -> Option<&'a AgentProfile> {
    agents
        .iter()
        .filter(|a| required.is_subset(&a.capabilities))
        .min_by(|a, b| preference(required, a, b))
}

/// Every eligible agent, best first.
pub fn rank_agents<'a>(agents: &'a [AgentProfile], required: &BTreeSet<String>) -> Vec<&'a AgentProfile> {
    let mut eligible: Vec<&AgentProfile> = agents
        .iter()
        .filter(|a| required.is_subset(&a.capabilities))
        .collect();
    eligible.sort_by(|a, b| preference(required, a, b));
    eligible
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_protocol::AgentId;

    fn caps(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn profile(id: &str, held: &[&str], workload: f64) -> AgentProfile {
        AgentProfile::new(AgentId::from(id), held.iter().copied()).with_workload(workload)
    }

    #[test]
    fn test_requires_superset() {
        let agents = vec![profile("a", &["rust"], 0.0), profile("b", &["rust", "sql"], 0.5)];
        let best = find_best_agent(&agents, &caps(&["rust", "sql"])).unwrap();
        assert_eq!(best.agent_id, AgentId::from("b"));
        assert!(find_best_agent(&agents, &caps(&["go"])).is_none());
    }

    #[test]
    fn test_lower_workload_beats_better_match() {
        let agents = vec![
            profile("specialist", &["rust"], 0.6),
            profile("generalist", &["rust", "sql", "go", "js"], 0.2),
        ];
        let best = find_best_agent(&agents, &caps(&["rust"])).unwrap();
        assert_eq!(best.agent_id, AgentId::from("generalist"));
    }

    #[test]
    fn test_match_ratio_breaks_workload_tie() {
        let agents = vec![
            profile("generalist", &["rust", "sql", "go", "js"], 0.3),
            profile("specialist", &["rust", "sql"], 0.3),
        ];
        let best = find_best_agent(&agents, &caps(&["rust"])).unwrap();
        assert_eq!(best.agent_id, AgentId::from("specialist"));
        let ranked: Vec<&str> = rank_agents(&agents, &caps(&["rust"]))
            .iter()
            .map(|a| a.agent_id.as_str())
            .collect();
        assert_eq!(ranked, vec!["specialist", "generalist"]);
    }

    #[test]
    fn test_empty_requirement_accepts_anyone() {
        let agents = vec![profile("busy", &["x"], 0.9), profile("idle", &[], 0.1)];
        assert_eq!(
            find_best_agent(&agents, &BTreeSet::new()).unwrap().agent_id,
            AgentId::from("idle")
        );
        assert_eq!(capability_match_ratio(&BTreeSet::new(), &BTreeSet::new()), 1.0);
    }
}
