#[macro_use]
mod common;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use common::{agent, agent_with};
use hive_agent::*;
use hive_network::InMemoryChannel;
use hive_protocol::{
    AgentId, CollaborationMode, Performative, TaskAssignmentParams, TaskResultParams, TaskSpec,
    Urgency,
};

#[tokio::test]
async fn test_collaboration_fans_out_and_waits_for_all() {
    let channel = Arc::new(InMemoryChannel::new());
    let lead = agent_with(
        &channel,
        "lead",
        EndpointConfig {
            collaboration_ttl: Duration::from_millis(200),
            ..EndpointConfig::default()
        },
    )
    .await;
    let _able = agent(&channel, "able", &["research"]).await;
    let _unable = agent(&channel, "unable", &["cooking"]).await;

    let targets = vec![
        AgentId::from("able"),
        AgentId::from("unable"),
        AgentId::from("ghost"),
    ];
    let task = TaskSpec::new("survey the literature").with_capabilities(["research"]);
    let outcome = lead
        .request_collaboration(&targets, task, CollaborationMode::Sequential)
        .await
        .unwrap();

    let outcomes: Vec<_> = outcome.replies.iter().map(|r| (r.agent.as_str(), r.outcome.clone())).collect();
    assert_eq!(
        outcomes,
        vec![
            ("able", ParticipantOutcome::Accepted),
            ("unable", ParticipantOutcome::Rejected("missing_capabilities".into())),
            ("ghost", ParticipantOutcome::TimedOut),
        ]
    );
    assert_eq!(outcome.accepted(), vec![AgentId::from("able")]);
    assert!(lead.workload().await > 0.0);
    assert!(lead.complete_collaboration(&outcome.collaboration_id).await);
}

#[tokio::test]
async fn test_shared_knowledge_is_stored_and_verified() {
    let channel = Arc::new(InMemoryChannel::new());
    let a = agent(&channel, "a", &[]).await;
    let b = agent(&channel, "b", &[]).await;

    let id = a
        .share_knowledge(Some(AgentId::from("b")), "pricing", serde_json::json!({"unit": 4}), 1.7)
        .await
        .unwrap();
    eventually!(b.knowledge().await.len() == 1);

    let entry = &b.knowledge().await[0];
    assert_eq!(entry.knowledge_id, id);
    assert_eq!(entry.confidence, 1.0);
    assert_eq!(entry.verified, None);

    let before = b.trust_score(&AgentId::from("a")).await.unwrap();
    let after = b.verify_knowledge(&id, false).await.unwrap();
    assert!((before - after - 0.10).abs() < 1e-9);
    assert_eq!(b.knowledge().await[0].verified, Some(false));

    assert!(matches!(
        b.verify_knowledge("missing", true).await,
        Err(AgentError::UnknownKnowledge(_))
    ));
}

#[tokio::test]
async fn test_help_request_answered_by_capable_peer() {
    let channel = Arc::new(InMemoryChannel::new());
    let asker = agent(&channel, "asker", &[]).await;
    let _helper = agent(&channel, "helper", &["sql", "python"]).await;
    let _bystander = agent(&channel, "bystander", &["python"]).await;

    let needed: BTreeSet<String> = ["sql".to_string()].into_iter().collect();
    let offer = asker
        .request_help("query is slow", needed, Urgency::High)
        .await
        .unwrap();

    assert_eq!(offer.from, AgentId::from("helper"));
    assert_eq!(offer.capabilities, vec!["sql".to_string()]);
    assert!(asker
        .peer_capabilities(&AgentId::from("helper"))
        .await
        .unwrap()
        .contains("sql"));
    assert_eq!(asker.peers_with_capability("sql").await, vec![AgentId::from("helper")]);
}

#[tokio::test]
async fn test_capability_offer_updates_directory() {
    let channel = Arc::new(InMemoryChannel::new());
    let a = agent(&channel, "a", &["graphs"]).await;
    let b = agent(&channel, "b", &[]).await;

    a.offer_capability(None, "graph analysis").await.unwrap();
    eventually!(b.peer_capabilities(&AgentId::from("a")).await.is_some());

    // Message observed (+0.01) and capability offered (+0.02).
    let score = b.trust_score(&AgentId::from("a")).await.unwrap();
    assert!((score - 0.53).abs() < 1e-9);
}

#[tokio::test]
async fn test_assignment_executed_with_generator() {
    let channel = Arc::new(InMemoryChannel::new());
    let boss = agent(&channel, "boss", &[]).await;
    let worker = AgentEndpoint::builder(channel.clone())
        .agent_id("worker")
        .capabilities(["writing"])
        .generator(Arc::new(MockGenerator::new()))
        .build();
    worker.start().await.unwrap();

    let assignment = TaskAssignmentParams {
        plan_id: None,
        task: TaskSpec::new("Draft the intro").with_capabilities(["writing"]),
        inputs: Default::default(),
    };
    let reply = boss
        .request(
            AgentId::from("worker"),
            Performative::TaskAssignment,
            serde_json::to_value(&assignment).unwrap(),
            SendOptions::with_ttl(Duration::from_secs(2)),
        )
        .await
        .unwrap();

    assert_eq!(reply.performative, Performative::TaskResult);
    let result: TaskResultParams = reply.payload_as().unwrap();
    assert!(result.success);
    assert_eq!(result.task_id, assignment.task.task_id);
    assert_eq!(result.output["content"], "Completed: Draft the intro");
    assert_eq!(worker.workload().await, 0.0);
}

#[tokio::test]
async fn test_assignment_without_generator_is_rejected() {
    let channel = Arc::new(InMemoryChannel::new());
    let boss = agent(&channel, "boss", &[]).await;
    let _worker = agent(&channel, "worker", &["writing"]).await;

    let assignment = TaskAssignmentParams {
        plan_id: None,
        task: TaskSpec::new("Draft").with_capabilities(["writing"]),
        inputs: Default::default(),
    };
    let reply = boss
        .request(
            AgentId::from("worker"),
            Performative::TaskAssignment,
            serde_json::to_value(&assignment).unwrap(),
            SendOptions::with_ttl(Duration::from_secs(2)),
        )
        .await
        .unwrap();

    assert_eq!(reply.performative, Performative::Reject);
    let result: TaskResultParams = reply.payload_as().unwrap();
    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("no_executor"));
}
