mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use hive_agent::{AuditKind, MemoryAuditLog, SendOptions};
use hive_consensus::*;
use hive_network::InMemoryChannel;
use hive_protocol::*;

use common::{agent, audited_agent};

fn quote(cost: f64, estimated_time_ms: u64, quality_level: f64) -> BidQuote {
    BidQuote { cost, estimated_time_ms, quality_level }
}

fn soon(ms: i64) -> chrono::DateTime<Utc> {
    Utc::now() + chrono::Duration::milliseconds(ms)
}

#[tokio::test]
async fn test_full_round_awards_best_bid() {
    let channel = Arc::new(InMemoryChannel::new());
    let audit = Arc::new(MemoryAuditLog::new());
    let manager = audited_agent(&channel, "manager", audit.clone()).await;
    let coordinator = ContractNetCoordinator::install(manager, ContractNetConfig::default());

    let config = ContractNetConfig::default();
    let mut bidders = Vec::new();
    for (id, q) in [
        ("bidder-1", quote(100.0, 1_000, 0.9)),
        ("bidder-2", quote(50.0, 5_000, 0.5)),
        ("bidder-3", quote(80.0, 2_000, 0.7)),
    ] {
        let endpoint = agent(&channel, id, &["python"]).await;
        bidders.push(Bidder::install(endpoint, Arc::new(FixedQuote(q)), &config));
    }

    let deadline = soon(300);
    let task = TaskSpec::new("port the parser").with_capabilities(["python"]);
    let cfp_id = coordinator
        .call_for_proposals(
            task.clone(),
            Requirements::new(vec![Criterion::Capability("python".into())]),
            deadline,
        )
        .await
        .unwrap();

    let selection = coordinator.wait_for_bids_and_select(&cfp_id, deadline).await.unwrap();
    assert_eq!(selection.ranked.len(), 3);
    let winner = selection.winner.clone().unwrap();
    assert_eq!(winner.bid.from_agent, AgentId::from("bidder-1"));
    let order: Vec<&str> = selection.ranked.iter().map(|s| s.bid.from_agent.as_str()).collect();
    assert_eq!(order, vec!["bidder-1", "bidder-3", "bidder-2"]);

    coordinator.award(&selection).await.unwrap();
    for bidder in &bidders {
        let mut notices = Vec::new();
        for _ in 0..100 {
            notices = bidder.awards().await;
            if !notices.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].cfp_id, cfp_id);
        assert_eq!(notices[0].task_id, task.task_id);
    }
    assert!(bidders[0].awards().await[0].awarded);
    assert!(!bidders[1].awards().await[0].awarded);
    assert!(!bidders[2].awards().await[0].awarded);
    assert_eq!(audit.count(AuditKind::BidAwarded), 1);
}

#[tokio::test]
async fn test_unqualified_agents_do_not_bid() {
    let channel = Arc::new(InMemoryChannel::new());
    let coordinator =
        ContractNetCoordinator::install(agent(&channel, "manager", &[]).await, ContractNetConfig::default());
    let config = ContractNetConfig::default();

    let rust_only = Bidder::install(agent(&channel, "rustacean", &["rust"]).await, Arc::new(FixedQuote(quote(10.0, 100, 0.9))), &config);
    let too_pricey = Bidder::install(agent(&channel, "pricey", &["python"]).await, Arc::new(FixedQuote(quote(500.0, 100, 0.9))), &config);
    let good = Bidder::install(agent(&channel, "good", &["python"]).await, Arc::new(FixedQuote(quote(90.0, 100, 0.6))), &config);

    let deadline = soon(250);
    let cfp_id = coordinator
        .call_for_proposals(
            TaskSpec::new("script"),
            Requirements::new(vec![
                Criterion::Capability("python".into()),
                Criterion::MaxCost(100.0),
            ]),
            deadline,
        )
        .await
        .unwrap();
    let selection = coordinator.wait_for_bids_and_select(&cfp_id, deadline).await.unwrap();

    assert_eq!(selection.ranked.len(), 1);
    assert_eq!(selection.winner.unwrap().bid.from_agent, AgentId::from("good"));
    assert!(rust_only.submitted_bids().await.is_empty());
    assert!(too_pricey.submitted_bids().await.is_empty());
    assert_eq!(good.submitted_bids().await.len(), 1);
}

#[tokio::test]
async fn test_round_without_bids_has_no_winner() {
    let channel = Arc::new(InMemoryChannel::new());
    let coordinator =
        ContractNetCoordinator::install(agent(&channel, "manager", &[]).await, ContractNetConfig::default());

    let deadline = soon(100);
    let cfp_id = coordinator
        .call_for_proposals(TaskSpec::new("nobody wants this"), Requirements::default(), deadline)
        .await
        .unwrap();
    let selection = coordinator.wait_for_bids_and_select(&cfp_id, deadline).await.unwrap();

    assert!(selection.winner.is_none());
    assert!(selection.ranked.is_empty());
    assert!(coordinator.award(&selection).await.is_ok());
}

#[tokio::test]
async fn test_round_is_closed_exactly_once() {
    let channel = Arc::new(InMemoryChannel::new());
    let coordinator =
        ContractNetCoordinator::install(agent(&channel, "manager", &[]).await, ContractNetConfig::default());

    let deadline = soon(50);
    let cfp_id = coordinator
        .call_for_proposals(TaskSpec::new("t"), Requirements::default(), deadline)
        .await
        .unwrap();
    assert_eq!(coordinator.open_rounds().await, 1);

    coordinator.wait_for_bids_and_select(&cfp_id, deadline).await.unwrap();
    assert_eq!(coordinator.open_rounds().await, 0);

    let again = coordinator.wait_for_bids_and_select(&cfp_id, deadline).await;
    assert!(matches!(again, Err(ConsensusError::UnknownRound(id)) if id == cfp_id));
    assert_eq!(coordinator.reap_expired(Utc::now() + chrono::Duration::hours(1)).await, 0);
}

#[tokio::test]
async fn test_reaper_drops_uncollected_rounds_once() {
    let channel = Arc::new(InMemoryChannel::new());
    let config = ContractNetConfig {
        reap_grace: Duration::from_secs(5),
        ..ContractNetConfig::default()
    };
    let coordinator = ContractNetCoordinator::install(agent(&channel, "manager", &[]).await, config);

    let deadline = soon(50);
    let cfp_id = coordinator
        .call_for_proposals(TaskSpec::new("t"), Requirements::default(), deadline)
        .await
        .unwrap();

    // Still inside the grace period.
    assert_eq!(coordinator.reap_expired(deadline + chrono::Duration::seconds(1)).await, 0);
    assert_eq!(coordinator.reap_expired(deadline + chrono::Duration::seconds(6)).await, 1);
    assert_eq!(coordinator.reap_expired(deadline + chrono::Duration::seconds(7)).await, 0);

    let late = coordinator.wait_for_bids_and_select(&cfp_id, deadline).await;
    assert!(matches!(late, Err(ConsensusError::UnknownRound(_))));
}

#[tokio::test]
async fn test_deadline_in_past_rejected() {
    let channel = Arc::new(InMemoryChannel::new());
    let coordinator =
        ContractNetCoordinator::install(agent(&channel, "manager", &[]).await, ContractNetConfig::default());
    let result = coordinator
        .call_for_proposals(TaskSpec::new("t"), Requirements::default(), soon(-1_000))
        .await;
    assert!(matches!(result, Err(ConsensusError::DeadlineInPast(_))));
    assert_eq!(coordinator.open_rounds().await, 0);
}

#[tokio::test]
async fn test_forged_and_repeated_bids_ignored() {
    let channel = Arc::new(InMemoryChannel::new());
    let coordinator =
        ContractNetCoordinator::install(agent(&channel, "manager", &[]).await, ContractNetConfig::default());
    let sneaky = agent(&channel, "sneaky", &[]).await;

    let deadline = soon(300);
    let cfp_id = coordinator
        .call_for_proposals(TaskSpec::new("t"), Requirements::default(), deadline)
        .await
        .unwrap();

    let bid = |from: &str, cost: f64| Bid {
        bid_id: uuid::Uuid::new_v4().to_string(),
        cfp_id: cfp_id.clone(),
        from_agent: AgentId::from(from),
        cost,
        estimated_time_ms: 1_000,
        quality_level: 0.5,
        valid_until: Utc::now() + chrono::Duration::minutes(5),
    };
    for payload in [bid("someone-else", 1.0), bid("sneaky", 100.0), bid("sneaky", 1.0)] {
        sneaky
            .send(
                AgentId::from("manager"),
                Performative::Bid,
                serde_json::to_value(&payload).unwrap(),
                SendOptions::default(),
            )
            .await
            .unwrap();
    }

    let selection = coordinator.wait_for_bids_and_select(&cfp_id, deadline).await.unwrap();
    assert_eq!(selection.ranked.len(), 1, "one bid per genuine sender");
    assert_eq!(selection.winner.unwrap().bid.cost, 100.0);
}

#[tokio::test]
async fn test_stale_bids_dropped_at_selection() {
    let channel = Arc::new(InMemoryChannel::new());
    let coordinator =
        ContractNetCoordinator::install(agent(&channel, "manager", &[]).await, ContractNetConfig::default());
    let config = ContractNetConfig {
        bid_validity: Duration::from_millis(10),
        ..ContractNetConfig::default()
    };
    Bidder::install(agent(&channel, "hasty", &[]).await, Arc::new(FixedQuote(quote(1.0, 1, 1.0))), &config);

    let deadline = soon(200);
    let cfp_id = coordinator
        .call_for_proposals(TaskSpec::new("t"), Requirements::default(), deadline)
        .await
        .unwrap();
    let selection = coordinator.wait_for_bids_and_select(&cfp_id, deadline).await.unwrap();

    assert!(selection.winner.is_none());
    assert_eq!(selection.expired_bids, 1);
}
