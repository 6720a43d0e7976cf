//! Vote-tally consensus.
//!
//! The coordinator asks every participant for a ballot with one
//! CONSENSUS_REQUEST each and tallies whatever came back once all of them
//! replied or the deadline passed. The denominator is always the number of
//! distinct participants, so silence counts against the proposal.

use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use hive_agent::{
    AgentEndpoint, AgentError, AuditKind, GenerationOptions, HandlerResult, PerformativeHandler,
    ResponseGenerator, SendOptions,
};
use hive_protocol::*;
use serde::{Deserialize, Serialize};

use crate::ConsensusError;

/// Apply the decision rule of `consensus_type`.
///
/// `total` is the number of participants asked, not the number that
/// answered. Returns whether consensus was achieved and the decision.
pub fn tally(consensus_type: ConsensusType, total: usize, ballots: &[ConsensusBallot]) -> (bool, Decision) {
    let approvals = ballots.iter().filter(|b| b.vote == Vote::Approve).count();
    let achieved = match consensus_type {
        ConsensusType::Unanimous => total > 0 && approvals == total,
        ConsensusType::Majority => approvals * 2 > total,
        ConsensusType::Supermajority => total > 0 && approvals * 3 >= total * 2,
    };
    let decision = if achieved {
        Decision::Approve
    } else if ballots.is_empty() {
        Decision::Unknown
    } else {
        Decision::Reject
    };
    (achieved, decision)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusOutcome {
    pub consensus_id: String,
    pub consensus_type: ConsensusType,
    pub achieved: bool,
    pub decision: Decision,
    pub approvals: usize,
    pub rejections: usize,
    pub total_participants: usize,
    pub ballots: Vec<ConsensusBallot>,
    /// Participants that did not return a valid ballot in time.
    pub missing: Vec<AgentId>,
}

/// Runs consensus rounds from one endpoint.
#[derive(Clone)]
pub struct ConsensusCoordinator {
    endpoint: AgentEndpoint,
}

impl ConsensusCoordinator {
    pub fn new(endpoint: AgentEndpoint) -> Self {
        Self { endpoint }
    }

    /// Ask `participants` to vote on `proposal` and tally the ballots.
    ///
    /// Finishes as soon as every participant replied, otherwise after
    /// `timeout`. The coordinator never votes; listing it as a participant
    /// counts as a non-approving seat.
    pub async fn reach_consensus(
        &self,
        proposal: serde_json::Value,
        participants: &[AgentId],
        consensus_type: ConsensusType,
        timeout: Duration,
    ) -> Result<ConsensusOutcome, ConsensusError> {
        let seats: BTreeSet<AgentId> = participants.iter().cloned().collect();
        if seats.is_empty() {
            return Err(ConsensusError::NoParticipants);
        }

        let consensus_id = uuid::Uuid::new_v4().to_string();
        let deadline = Utc::now()
            + chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::days(1));
        let params = ConsensusRequestParams {
            consensus_id: consensus_id.clone(),
            proposal,
            consensus_type,
            deadline,
        };
        let payload = serde_json::to_value(&params).map_err(ProtocolError::from)?;

        tracing::info!(
            consensus_id = %consensus_id,
            consensus_type = ?consensus_type,
            participants = seats.len(),
            "consensus round opened"
        );

        let me = self.endpoint.agent_id();
        let requests = seats.iter().filter(|p| *p != me).map(|participant| {
            let payload = payload.clone();
            async move {
                let reply = self
                    .endpoint
                    .request(
                        participant.clone(),
                        Performative::ConsensusRequest,
                        payload,
                        SendOptions::with_ttl(timeout),
                    )
                    .await;
                (participant, reply)
            }
        });
        let replies = join_all(requests).await;

        let mut ballots = Vec::new();
        for (participant, reply) in replies {
            match reply {
                Ok(message) => match valid_ballot(&consensus_id, participant, &message) {
                    Some(ballot) => ballots.push(ballot),
                    None => tracing::warn!(
                        consensus_id = %consensus_id,
                        from = %message.from,
                        performative = %message.performative,
                        "discarding invalid ballot"
                    ),
                },
                Err(AgentError::ResponseTimeout { .. }) => {
                    tracing::debug!(consensus_id = %consensus_id, participant = %participant, "no ballot before deadline");
                }
                Err(e) => {
                    tracing::warn!(consensus_id = %consensus_id, participant = %participant, error = %e, "ballot request failed");
                }
            }
        }

        let voted: BTreeSet<&AgentId> = ballots.iter().map(|b| &b.from_agent).collect();
        let missing: Vec<AgentId> = seats.iter().filter(|p| !voted.contains(p)).cloned().collect();
        let (achieved, decision) = tally(consensus_type, seats.len(), &ballots);
        let approvals = ballots.iter().filter(|b| b.vote == Vote::Approve).count();

        let outcome = ConsensusOutcome {
            consensus_id: consensus_id.clone(),
            consensus_type,
            achieved,
            decision,
            approvals,
            rejections: ballots.len() - approvals,
            total_participants: seats.len(),
            ballots,
            missing,
        };

        tracing::info!(
            consensus_id = %consensus_id,
            achieved,
            decision = ?decision,
            approvals,
            total = outcome.total_participants,
            "consensus round closed"
        );
        self.endpoint.audit(
            AuditKind::ConsensusReached,
            &consensus_id,
            serde_json::json!({
                "achieved": achieved,
                "decision": decision,
                "approvals": approvals,
                "total": outcome.total_participants,
            }),
        );
        Ok(outcome)
    }
}

fn valid_ballot(consensus_id: &str, participant: &AgentId, reply: &Message) -> Option<ConsensusBallot> {
    if reply.performative != Performative::ConsensusResponse {
        return None;
    }
    let ballot: ConsensusBallot = reply.payload_as().ok()?;
    (ballot.consensus_id == consensus_id
        && ballot.from_agent == reply.from
        && &ballot.from_agent == participant)
        .then_some(ballot)
}

// ── Voter side ──

/// Decides how this agent votes on a proposal.
pub trait VotePolicy: Send + Sync {
    fn vote<'a>(
        &'a self,
        request: &'a ConsensusRequestParams,
    ) -> Pin<Box<dyn Future<Output = (Vote, Option<String>)> + Send + 'a>>;
}

/// Always casts the same vote.
pub struct FixedVote(pub Vote);

impl VotePolicy for FixedVote {
    fn vote<'a>(
        &'a self,
        _request: &'a ConsensusRequestParams,
    ) -> Pin<Box<dyn Future<Output = (Vote, Option<String>)> + Send + 'a>> {
        let vote = self.0;
        Box::pin(async move { (vote, None) })
    }
}

/// Asks the generator; an answer starting with "approve" or "yes" approves.
/// A generator failure is a reject.
pub struct GeneratorVoter {
    generator: Arc<dyn ResponseGenerator>,
    options: GenerationOptions,
}

impl GeneratorVoter {
    pub fn new(generator: Arc<dyn ResponseGenerator>) -> Self {
        Self {
            generator,
            options: GenerationOptions {
                system: Some("Answer APPROVE or REJECT, then one sentence of rationale.".into()),
                max_tokens: Some(64),
                temperature: Some(0.0),
            },
        }
    }
}

impl VotePolicy for GeneratorVoter {
    fn vote<'a>(
        &'a self,
        request: &'a ConsensusRequestParams,
    ) -> Pin<Box<dyn Future<Output = (Vote, Option<String>)> + Send + 'a>> {
        Box::pin(async move {
            let prompt = format!("Vote on the following proposal:\n{}", request.proposal);
            match self.generator.generate(&prompt, &self.options).await {
                Ok(generation) => {
                    let answer = generation.content.trim().to_ascii_lowercase();
                    let vote = if answer.starts_with("approve") || answer.starts_with("yes") {
                        Vote::Approve
                    } else {
                        Vote::Reject
                    };
                    (vote, Some(generation.content))
                }
                Err(e) => {
                    tracing::warn!(consensus_id = %request.consensus_id, error = %e, "generator failed, voting reject");
                    (Vote::Reject, Some("generator_unavailable".into()))
                }
            }
        })
    }
}

/// Answers CONSENSUS_REQUEST messages on an endpoint.
pub struct ConsensusParticipant;

impl ConsensusParticipant {
    pub fn install(endpoint: &AgentEndpoint, policy: Arc<dyn VotePolicy>) {
        endpoint.register_handler(Performative::ConsensusRequest, Arc::new(BallotResponder { policy }));
    }
}

struct BallotResponder {
    policy: Arc<dyn VotePolicy>,
}

impl PerformativeHandler for BallotResponder {
    fn handle<'a>(&'a self, endpoint: &'a AgentEndpoint, message: &'a Message) -> HandlerResult<'a> {
        Box::pin(async move {
            let request: ConsensusRequestParams = message.payload_as()?;
            if Utc::now() > request.deadline {
                tracing::debug!(consensus_id = %request.consensus_id, "consensus deadline passed, not voting");
                return Ok(());
            }
            // Policies may consult a generator; vote from a task so the
            // dispatch loop keeps correlating this agent's own replies.
            let policy = self.policy.clone();
            let endpoint = endpoint.clone();
            let message = message.clone();
            tokio::spawn(async move {
                let (vote, rationale) = policy.vote(&request).await;
                let ballot = ConsensusBallot {
                    consensus_id: request.consensus_id.clone(),
                    from_agent: endpoint.agent_id().clone(),
                    vote,
                    rationale,
                };
                tracing::debug!(consensus_id = %request.consensus_id, vote = ?vote, "casting ballot");
                if let Err(e) = cast_ballot(&endpoint, &message, &ballot).await {
                    tracing::warn!(consensus_id = %request.consensus_id, error = %e, "failed to cast ballot");
                }
            });
            Ok(())
        })
    }
}

async fn cast_ballot(endpoint: &AgentEndpoint, request: &Message, ballot: &ConsensusBallot) -> Result<(), AgentError> {
    let payload = serde_json::to_value(ballot).map_err(ProtocolError::from)?;
    endpoint
        .reply(request, Performative::ConsensusResponse, payload)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ballots(approve: usize, reject: usize) -> Vec<ConsensusBallot> {
        (0..approve + reject)
            .map(|i| ConsensusBallot {
                consensus_id: "c".into(),
                from_agent: AgentId::new(format!("agent-{i}")),
                vote: if i < approve { Vote::Approve } else { Vote::Reject },
                rationale: None,
            })
            .collect()
    }

    #[test]
    fn test_three_of_five() {
        let b = ballots(3, 2);
        assert_eq!(tally(ConsensusType::Majority, 5, &b), (true, Decision::Approve));
        assert_eq!(tally(ConsensusType::Supermajority, 5, &b), (false, Decision::Reject));
        assert_eq!(tally(ConsensusType::Unanimous, 5, &b), (false, Decision::Reject));
    }

    #[test]
    fn test_non_responders_count_against() {
        // 3 approvals out of 7 seats is not a majority even with no rejections.
        let b = ballots(3, 0);
        assert_eq!(tally(ConsensusType::Majority, 7, &b), (false, Decision::Reject));
        assert_eq!(tally(ConsensusType::Majority, 3, &b), (true, Decision::Approve));
    }

    #[test]
    fn test_exact_half_is_not_majority() {
        assert!(!tally(ConsensusType::Majority, 4, &ballots(2, 2)).0);
    }

    #[test]
    fn test_supermajority_boundary() {
        assert!(tally(ConsensusType::Supermajority, 3, &ballots(2, 1)).0);
        assert!(tally(ConsensusType::Supermajority, 6, &ballots(4, 2)).0);
        assert!(!tally(ConsensusType::Supermajority, 7, &ballots(4, 3)).0);
    }

    #[test]
    fn test_no_ballots_is_unknown() {
        assert_eq!(tally(ConsensusType::Majority, 4, &[]), (false, Decision::Unknown));
        assert_eq!(tally(ConsensusType::Unanimous, 0, &[]), (false, Decision::Unknown));
    }

    #[test]
    fn test_unanimous_requires_every_seat() {
        assert!(tally(ConsensusType::Unanimous, 3, &ballots(3, 0)).0);
        assert!(!tally(ConsensusType::Unanimous, 4, &ballots(3, 0)).0);
    }
}
