mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use hive_agent::{
    AgentEndpoint, AuditKind, HandlerResult, MemoryAuditLog, MockGenerator, PerformativeHandler, SendOptions,
};
use hive_consensus::*;
use hive_network::InMemoryChannel;
use hive_protocol::*;

use common::{agent, audited_agent};

async fn voters(channel: &Arc<InMemoryChannel>, votes: &[(&str, Vote)]) -> Vec<AgentId> {
    let mut ids = Vec::new();
    for (id, vote) in votes {
        let endpoint = agent(channel, id, &[]).await;
        ConsensusParticipant::install(&endpoint, Arc::new(FixedVote(*vote)));
        ids.push(endpoint.agent_id().clone());
    }
    ids
}

/// Answers every QUERY at once.
struct Pong;

impl PerformativeHandler for Pong {
    fn handle<'a>(&'a self, endpoint: &'a AgentEndpoint, message: &'a Message) -> HandlerResult<'a> {
        Box::pin(async move {
            endpoint
                .reply(message, Performative::Inform, serde_json::json!({"pong": true}))
                .await?;
            Ok(())
        })
    }
}

fn three_of_five() -> Vec<(&'static str, Vote)> {
    vec![
        ("v1", Vote::Approve),
        ("v2", Vote::Approve),
        ("v3", Vote::Approve),
        ("v4", Vote::Reject),
        ("v5", Vote::Reject),
    ]
}

#[tokio::test]
async fn test_majority_reached_with_three_of_five() {
    let channel = Arc::new(InMemoryChannel::new());
    let audit = Arc::new(MemoryAuditLog::new());
    let coordinator = ConsensusCoordinator::new(audited_agent(&channel, "chair", audit.clone()).await);
    let participants = voters(&channel, &three_of_five()).await;

    let outcome = coordinator
        .reach_consensus(
            serde_json::json!({"action": "deploy"}),
            &participants,
            ConsensusType::Majority,
            Duration::from_secs(2),
        )
        .await
        .unwrap();

    assert!(outcome.achieved);
    assert_eq!(outcome.decision, Decision::Approve);
    assert_eq!(outcome.approvals, 3);
    assert_eq!(outcome.rejections, 2);
    assert_eq!(outcome.total_participants, 5);
    assert!(outcome.missing.is_empty());
    assert_eq!(audit.count(AuditKind::ConsensusReached), 1);
}

#[tokio::test]
async fn test_supermajority_not_reached_with_three_of_five() {
    let channel = Arc::new(InMemoryChannel::new());
    let coordinator = ConsensusCoordinator::new(agent(&channel, "chair", &[]).await);
    let participants = voters(&channel, &three_of_five()).await;

    let outcome = coordinator
        .reach_consensus(
            serde_json::json!("raise the budget"),
            &participants,
            ConsensusType::Supermajority,
            Duration::from_secs(2),
        )
        .await
        .unwrap();

    assert!(!outcome.achieved);
    assert_eq!(outcome.decision, Decision::Reject);
}

#[tokio::test]
async fn test_silent_participants_count_in_denominator() {
    let channel = Arc::new(InMemoryChannel::new());
    let coordinator = ConsensusCoordinator::new(agent(&channel, "chair", &[]).await);
    let mut participants = voters(&channel, &[("v1", Vote::Approve), ("v2", Vote::Approve)]).await;
    // Started but never votes.
    for id in ["mute-a", "mute-b"] {
        participants.push(agent(&channel, id, &[]).await.agent_id().clone());
    }

    let outcome = coordinator
        .reach_consensus(
            serde_json::json!("merge"),
            &participants,
            ConsensusType::Majority,
            Duration::from_millis(200),
        )
        .await
        .unwrap();

    // 2 of 4 is not more than half, though every respondent approved.
    assert!(!outcome.achieved);
    assert_eq!(outcome.decision, Decision::Reject);
    assert_eq!(outcome.total_participants, 4);
    assert_eq!(
        outcome.missing,
        vec![AgentId::from("mute-a"), AgentId::from("mute-b")]
    );
}

#[tokio::test]
async fn test_nobody_answers_gives_unknown() {
    let channel = Arc::new(InMemoryChannel::new());
    let chair = agent(&channel, "chair", &[]).await;
    let coordinator = ConsensusCoordinator::new(chair.clone());
    agent(&channel, "mute", &[]).await;

    let outcome = coordinator
        .reach_consensus(
            serde_json::json!("anything"),
            &[AgentId::from("mute")],
            ConsensusType::Unanimous,
            Duration::from_millis(100),
        )
        .await
        .unwrap();

    assert!(!outcome.achieved);
    assert_eq!(outcome.decision, Decision::Unknown);
    assert!(chair.pending_requests().await.is_empty(), "timed-out requests are cleaned up");
    assert_eq!(chair.pending_stats().expired, 1);
}

#[tokio::test]
async fn test_finishes_early_when_everyone_voted() {
    let channel = Arc::new(InMemoryChannel::new());
    let coordinator = ConsensusCoordinator::new(agent(&channel, "chair", &[]).await);
    let participants = voters(&channel, &[("v1", Vote::Approve), ("v2", Vote::Approve)]).await;

    let started = Instant::now();
    let outcome = coordinator
        .reach_consensus(
            serde_json::json!("ship it"),
            &participants,
            ConsensusType::Unanimous,
            Duration::from_secs(10),
        )
        .await
        .unwrap();

    assert!(outcome.achieved);
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_duplicate_participants_counted_once() {
    let channel = Arc::new(InMemoryChannel::new());
    let coordinator = ConsensusCoordinator::new(agent(&channel, "chair", &[]).await);
    let participants = voters(&channel, &[("v1", Vote::Approve)]).await;
    let doubled = vec![participants[0].clone(), participants[0].clone()];

    let outcome = coordinator
        .reach_consensus(serde_json::json!(1), &doubled, ConsensusType::Unanimous, Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(outcome.total_participants, 1);
    assert!(outcome.achieved);
}

#[tokio::test]
async fn test_coordinator_seat_counts_as_non_approving() {
    let channel = Arc::new(InMemoryChannel::new());
    let chair = agent(&channel, "chair", &[]).await;
    let coordinator = ConsensusCoordinator::new(chair.clone());
    let mut participants = voters(&channel, &[("v1", Vote::Approve)]).await;
    participants.push(chair.agent_id().clone());

    let outcome = coordinator
        .reach_consensus(serde_json::json!(1), &participants, ConsensusType::Majority, Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(outcome.total_participants, 2);
    assert!(!outcome.achieved);
    assert_eq!(outcome.missing, vec![AgentId::from("chair")]);
}

#[tokio::test]
async fn test_empty_participant_list_rejected() {
    let channel = Arc::new(InMemoryChannel::new());
    let coordinator = ConsensusCoordinator::new(agent(&channel, "chair", &[]).await);
    let result = coordinator
        .reach_consensus(serde_json::json!(1), &[], ConsensusType::Majority, Duration::from_secs(1))
        .await;
    assert!(matches!(result, Err(ConsensusError::NoParticipants)));
}

#[tokio::test]
async fn test_generator_backed_votes() {
    let channel = Arc::new(InMemoryChannel::new());
    let coordinator = ConsensusCoordinator::new(agent(&channel, "chair", &[]).await);

    let yes = agent(&channel, "optimist", &[]).await;
    ConsensusParticipant::install(
        &yes,
        Arc::new(GeneratorVoter::new(Arc::new(MockGenerator::new().with_response("APPROVE, low risk")))),
    );
    let broken = agent(&channel, "offline", &[]).await;
    ConsensusParticipant::install(
        &broken,
        Arc::new(GeneratorVoter::new(Arc::new(MockGenerator::new().failing("backend down")))),
    );

    let outcome = coordinator
        .reach_consensus(
            serde_json::json!("adopt the new schema"),
            &[yes.agent_id().clone(), broken.agent_id().clone()],
            ConsensusType::Unanimous,
            Duration::from_secs(2),
        )
        .await
        .unwrap();

    assert_eq!(outcome.approvals, 1);
    assert_eq!(outcome.rejections, 1, "generator failure votes reject");
    assert!(outcome.missing.is_empty());
    assert!(!outcome.achieved);
}

#[tokio::test]
async fn test_voter_keeps_correlating_replies_while_deliberating() {
    let channel = Arc::new(InMemoryChannel::new());
    let coordinator = ConsensusCoordinator::new(agent(&channel, "chair", &[]).await);
    let voter = agent(&channel, "slow-voter", &[]).await;
    let generator = Arc::new(
        MockGenerator::new()
            .with_response("approve")
            .with_delay(Duration::from_millis(500)),
    );
    ConsensusParticipant::install(&voter, Arc::new(GeneratorVoter::new(generator.clone())));
    let peer = agent(&channel, "peer", &[]).await;
    peer.register_handler(Performative::Query, Arc::new(Pong));

    let participants = vec![voter.agent_id().clone()];
    let round = tokio::spawn(async move {
        coordinator
            .reach_consensus(
                serde_json::json!({"action": "ship"}),
                &participants,
                ConsensusType::Unanimous,
                Duration::from_secs(3),
            )
            .await
    });
    for _ in 0..100 {
        if generator.calls() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(generator.calls(), 1);

    let reply = voter
        .request(
            AgentId::from("peer"),
            Performative::Query,
            serde_json::json!({}),
            SendOptions::with_ttl(Duration::from_millis(200)),
        )
        .await
        .unwrap();
    assert_eq!(reply.payload, serde_json::json!({"pong": true}));

    let outcome = round.await.unwrap().unwrap();
    assert!(outcome.achieved);
    assert_eq!(outcome.decision, Decision::Approve);
}
