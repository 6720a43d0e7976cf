#[macro_use]
mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{agent, agent_with, Echo};
use hive_agent::*;
use hive_network::InMemoryChannel;
use hive_protocol::{AgentId, Performative, TaskSpec, Terms, TrustLevel};

fn terms_in(secs: i64) -> Terms {
    Terms::with_deadline(Utc::now() + chrono::Duration::seconds(secs))
}

#[tokio::test]
async fn test_negotiation_accepted_when_task_fits() {
    let channel = Arc::new(InMemoryChannel::new());
    let coordinator = agent(&channel, "coordinator", &[]).await;
    let worker = agent(&channel, "worker", &["translation", "summarization"]).await;

    let task = TaskSpec::new("translate the report").with_capabilities(["translation"]);
    let negotiation = coordinator
        .negotiate_task(AgentId::from("worker"), task.clone(), terms_in(600), None)
        .await
        .unwrap();

    assert_eq!(negotiation.status, NegotiationStatus::Accepted);
    assert_eq!(negotiation.direction, NegotiationDirection::Outbound);
    assert!(negotiation.resolved_at.is_some());

    let inbound = worker.negotiation(&negotiation.id).await.unwrap();
    assert_eq!(inbound.direction, NegotiationDirection::Inbound);
    assert_eq!(inbound.status, NegotiationStatus::Accepted);
    assert!(worker.workload().await > 0.0);

    // Reply observed (+0.01) and task accepted (+0.03).
    let score = coordinator.trust_score(&AgentId::from("worker")).await.unwrap();
    assert!((score - 0.54).abs() < 1e-9);

    assert!(worker.complete_task(&task.task_id).await);
    assert_eq!(worker.workload().await, 0.0);
}

#[tokio::test]
async fn test_negotiation_rejected_for_missing_capability() {
    let channel = Arc::new(InMemoryChannel::new());
    let coordinator = agent(&channel, "coordinator", &[]).await;
    let _worker = agent(&channel, "worker", &["translation"]).await;

    let task = TaskSpec::new("write code").with_capabilities(["translation", "rust"]);
    let negotiation = coordinator
        .negotiate_task(AgentId::from("worker"), task, terms_in(600), None)
        .await
        .unwrap();

    assert_eq!(negotiation.status, NegotiationStatus::Rejected);
    assert_eq!(negotiation.reason.as_deref(), Some("missing_capabilities"));
}

#[tokio::test]
async fn test_negotiation_rejected_for_close_deadline() {
    let channel = Arc::new(InMemoryChannel::new());
    let coordinator = agent(&channel, "coordinator", &[]).await;
    let _worker = agent(&channel, "worker", &["translation"]).await;

    let task = TaskSpec::new("translate").with_capabilities(["translation"]);
    let negotiation = coordinator
        .negotiate_task(AgentId::from("worker"), task, terms_in(30), None)
        .await
        .unwrap();

    assert_eq!(negotiation.status, NegotiationStatus::Rejected);
    assert_eq!(negotiation.reason.as_deref(), Some("deadline_too_soon"));
}

#[tokio::test]
async fn test_negotiation_rejected_when_overloaded() {
    let channel = Arc::new(InMemoryChannel::new());
    let coordinator = agent(&channel, "coordinator", &[]).await;
    let _worker = agent_with(
        &channel,
        "worker",
        EndpointConfig {
            workload_capacity: 1,
            ..EndpointConfig::default().with_capabilities(["translation"])
        },
    )
    .await;

    let first = coordinator
        .negotiate_task(
            AgentId::from("worker"),
            TaskSpec::new("first").with_capabilities(["translation"]),
            terms_in(600),
            None,
        )
        .await
        .unwrap();
    assert_eq!(first.status, NegotiationStatus::Accepted);

    let second = coordinator
        .negotiate_task(
            AgentId::from("worker"),
            TaskSpec::new("second").with_capabilities(["translation"]),
            terms_in(600),
            None,
        )
        .await
        .unwrap();
    assert_eq!(second.status, NegotiationStatus::Rejected);
    assert_eq!(second.reason.as_deref(), Some("workload_exceeded"));
}

#[tokio::test]
async fn test_negotiation_timeout_rejects_and_surfaces_error() {
    let channel = Arc::new(InMemoryChannel::new());
    let coordinator = agent_with(
        &channel,
        "coordinator",
        EndpointConfig {
            negotiation_ttl: Duration::from_millis(100),
            ..EndpointConfig::default()
        },
    )
    .await;

    let err = coordinator
        .negotiate_task(AgentId::from("ghost"), TaskSpec::new("anything"), terms_in(600), None)
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::ResponseTimeout { .. }));

    let negotiations = coordinator.negotiations().await;
    assert_eq!(negotiations.len(), 1);
    assert_eq!(negotiations[0].status, NegotiationStatus::Rejected);
    assert_eq!(negotiations[0].reason.as_deref(), Some("response_timeout"));
    assert_eq!(coordinator.workload().await, 0.0);
}

#[tokio::test]
async fn test_capability_request_answers() {
    let channel = Arc::new(InMemoryChannel::new());
    let requester = agent(&channel, "requester", &[]).await;
    let _provider = agent(&channel, "provider", &["vision"]).await;

    let yes = requester
        .request_capability(AgentId::from("provider"), "vision", serde_json::json!({}))
        .await
        .unwrap();
    assert!(yes.accepted);
    // The provider has now seen one message from the requester.
    assert_eq!(yes.trust_level, TrustLevel::Low);

    let no = requester
        .request_capability(AgentId::from("provider"), "audio", serde_json::json!({}))
        .await
        .unwrap();
    assert!(!no.accepted);
    assert_eq!(no.reason.as_deref(), Some("capability_not_held"));
}

#[tokio::test]
async fn test_capability_request_declined_by_evaluator() {
    let channel = Arc::new(InMemoryChannel::new());
    let requester = agent(&channel, "requester", &[]).await;
    let screen = Arc::new(MockGenerator::new().with_response("NO, busy"));
    let provider = AgentEndpoint::builder(channel.clone())
        .agent_id("provider")
        .capabilities(["vision"])
        .evaluator(Arc::new(GeneratorEvaluator::new(screen.clone())))
        .build();
    provider.start().await.unwrap();

    let answer = requester
        .request_capability(AgentId::from("provider"), "vision", serde_json::json!({"image": "cat.png"}))
        .await
        .unwrap();
    assert!(!answer.accepted);
    assert_eq!(answer.reason.as_deref(), Some("evaluation_declined"));
    assert_eq!(screen.calls(), 1);
}

#[tokio::test]
async fn test_provider_keeps_correlating_replies_while_evaluating() {
    let channel = Arc::new(InMemoryChannel::new());
    let requester = agent(&channel, "requester", &[]).await;
    let peer = agent(&channel, "peer", &[]).await;
    peer.register_handler(Performative::Query, Arc::new(Echo));
    let screen = Arc::new(
        MockGenerator::new()
            .with_response("yes")
            .with_delay(Duration::from_millis(500)),
    );
    let provider = AgentEndpoint::builder(channel.clone())
        .agent_id("provider")
        .capabilities(["vision"])
        .evaluator(Arc::new(GeneratorEvaluator::new(screen.clone())))
        .build();
    provider.start().await.unwrap();

    let screening = tokio::spawn(async move {
        requester
            .request_capability(AgentId::from("provider"), "vision", serde_json::json!({}))
            .await
    });
    eventually!(screen.calls() == 1);

    // A short request of the provider's own, answered while the screen runs.
    let reply = provider
        .request(
            AgentId::from("peer"),
            Performative::Query,
            serde_json::json!({"ping": true}),
            SendOptions::with_ttl(Duration::from_millis(200)),
        )
        .await
        .unwrap();
    assert_eq!(reply.payload, serde_json::json!({"ping": true}));

    let answer = screening.await.unwrap().unwrap();
    assert!(answer.accepted);
}

#[tokio::test]
async fn test_failing_evaluator_declines_without_crashing() {
    let channel = Arc::new(InMemoryChannel::new());
    let requester = agent(&channel, "requester", &[]).await;
    let provider = AgentEndpoint::builder(channel.clone())
        .agent_id("provider")
        .capabilities(["vision"])
        .evaluator(Arc::new(GeneratorEvaluator::new(Arc::new(
            MockGenerator::new().failing("model offline"),
        ))))
        .build();
    provider.start().await.unwrap();

    let answer = requester
        .request_capability(AgentId::from("provider"), "vision", serde_json::json!({}))
        .await
        .unwrap();
    assert!(!answer.accepted);

    // The endpoint keeps serving afterwards.
    let again = requester
        .request_capability(AgentId::from("provider"), "audio", serde_json::json!({}))
        .await
        .unwrap();
    assert_eq!(again.reason.as_deref(), Some("capability_not_held"));
}

#[tokio::test]
async fn test_negotiations_are_audited() {
    let channel = Arc::new(InMemoryChannel::new());
    let log = Arc::new(MemoryAuditLog::new());
    let coordinator = AgentEndpoint::builder(channel.clone())
        .agent_id("coordinator")
        .audit(log.clone())
        .build();
    coordinator.start().await.unwrap();
    let _worker = agent(&channel, "worker", &["x"]).await;

    coordinator
        .negotiate_task(
            AgentId::from("worker"),
            TaskSpec::new("t").with_capabilities(["x"]),
            terms_in(600),
            None,
        )
        .await
        .unwrap();
    coordinator
        .negotiate_task(
            AgentId::from("worker"),
            TaskSpec::new("t").with_capabilities(["y"]),
            terms_in(600),
            None,
        )
        .await
        .unwrap();

    assert_eq!(log.count(AuditKind::NegotiationAccepted), 1);
    assert_eq!(log.count(AuditKind::NegotiationRejected), 1);
}
