//! Contract-net task allocation.
//!
//! Lifecycle of one round:
//! 1. `call_for_proposals()` broadcasts a CFP and opens the round
//! 2. peers running a `Bidder` check the requirements and answer with a BID
//! 3. `wait_for_bids_and_select()` sleeps until the deadline, closes the
//!    round and ranks the bids
//! 4. `award()` tells the winner and the losers
//!
//! A round is removed from the coordinator exactly once: either by the
//! selection call or, if nobody collects it, by the reaper after a grace
//! period.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hive_agent::{AgentEndpoint, AuditKind, HandlerResult, PerformativeHandler, SendOptions};
use hive_protocol::*;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::ConsensusError;

/// Cost normaliser used by the scoring function.
const COST_SCALE: f64 = 10_000.0;
/// One day in milliseconds, normaliser for the estimated time.
const TIME_SCALE_MS: f64 = 86_400_000.0;

/// Score of a bid; higher is better.
///
/// `(10000 - cost)/10000 + (86400000 - estimated_time_ms)/86400000 + quality_level`
pub fn score_bid(bid: &Bid) -> f64 {
    (COST_SCALE - bid.cost) / COST_SCALE
        + (TIME_SCALE_MS - bid.estimated_time_ms as f64) / TIME_SCALE_MS
        + bid.quality_level
}

/// A bid as recorded by the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedBid {
    pub bid: Bid,
    pub received_at: DateTime<Utc>,
    /// Arrival order within the coordinator; breaks score ties.
    pub sequence: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredBid {
    pub bid: Bid,
    pub score: f64,
    pub sequence: u64,
}

/// Rank `bids` best first. Equal scores keep arrival order.
pub fn rank_bids(bids: &[ReceivedBid]) -> Vec<ScoredBid> {
    let mut scored: Vec<ScoredBid> = bids
        .iter()
        .map(|b| ScoredBid {
            bid: b.bid.clone(),
            score: score_bid(&b.bid),
            sequence: b.sequence,
        })
        .collect();
    scored.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.sequence.cmp(&b.sequence))
    });
    scored
}

/// Best bid, or `None` when there are no bids.
pub fn select_winner(bids: &[ReceivedBid]) -> Option<ScoredBid> {
    rank_bids(bids).into_iter().next()
}

/// Outcome of closing a round. `winner` is `None` when no valid bid arrived.
#[derive(Debug, Clone)]
pub struct Selection {
    pub cfp_id: String,
    pub task: TaskSpec,
    pub winner: Option<ScoredBid>,
    /// All valid bids, best first.
    pub ranked: Vec<ScoredBid>,
    /// Bids dropped because they were no longer valid at selection time.
    pub expired_bids: usize,
}

/// Award decision sent to each bidder after selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwardNotice {
    pub cfp_id: String,
    pub bid_id: String,
    pub task_id: String,
    pub awarded: bool,
}

#[derive(Debug, Clone)]
pub struct ContractNetConfig {
    /// How long an uncollected round lingers past its deadline before the
    /// reaper drops it.
    pub reap_grace: Duration,
    /// Interval of the background reaper.
    pub reap_interval: Duration,
    /// Validity window attached to bids by `Bidder`.
    pub bid_validity: Duration,
}

impl Default for ContractNetConfig {
    fn default() -> Self {
        Self {
            reap_grace: Duration::from_secs(30),
            reap_interval: Duration::from_secs(10),
            bid_validity: Duration::from_secs(300),
        }
    }
}

struct CfpRound {
    task: TaskSpec,
    deadline: DateTime<Utc>,
    bids: Vec<ReceivedBid>,
}

#[derive(Default)]
struct Rounds {
    open: Mutex<HashMap<String, CfpRound>>,
    sequence: AtomicU64,
}

/// Initiator side of the contract net.
#[derive(Clone)]
pub struct ContractNetCoordinator {
    endpoint: AgentEndpoint,
    rounds: Arc<Rounds>,
    config: ContractNetConfig,
}

impl ContractNetCoordinator {
    /// Attach to `endpoint` and start collecting BID messages.
    pub fn install(endpoint: AgentEndpoint, config: ContractNetConfig) -> Self {
        let rounds = Arc::new(Rounds::default());
        endpoint.register_handler(
            Performative::Bid,
            Arc::new(BidCollector {
                rounds: rounds.clone(),
            }),
        );
        Self {
            endpoint,
            rounds,
            config,
        }
    }

    /// Broadcast a CFP for `task` and open a round accepting bids until `deadline`.
    pub async fn call_for_proposals(
        &self,
        task: TaskSpec,
        requirements: Requirements,
        deadline: DateTime<Utc>,
    ) -> Result<String, ConsensusError> {
        let now = Utc::now();
        let ttl = (deadline - now)
            .to_std()
            .map_err(|_| ConsensusError::DeadlineInPast(deadline))?;

        let cfp_id = uuid::Uuid::new_v4().to_string();
        let params = CfpParams {
            cfp_id: cfp_id.clone(),
            task: task.clone(),
            requirements,
            deadline,
        };
        let payload = serde_json::to_value(&params).map_err(ProtocolError::from)?;

        self.rounds.open.lock().await.insert(
            cfp_id.clone(),
            CfpRound {
                task,
                deadline,
                bids: Vec::new(),
            },
        );

        let options = SendOptions::with_ttl(ttl).in_conversation(cfp_id.clone());
        if let Err(e) = self
            .endpoint
            .broadcast(Performative::Cfp, payload, options)
            .await
        {
            self.rounds.open.lock().await.remove(&cfp_id);
            return Err(e.into());
        }

        tracing::info!(
            cfp_id = %cfp_id,
            task_id = %params.task.task_id,
            deadline = %deadline,
            "call for proposals opened"
        );
        Ok(cfp_id)
    }

    /// Wait until `deadline`, close the round and rank the bids that are
    /// still valid. An empty round yields a selection without a winner.
    pub async fn wait_for_bids_and_select(
        &self,
        cfp_id: &str,
        deadline: DateTime<Utc>,
    ) -> Result<Selection, ConsensusError> {
        if !self.rounds.open.lock().await.contains_key(cfp_id) {
            return Err(ConsensusError::UnknownRound(cfp_id.to_string()));
        }
        if let Ok(remaining) = (deadline - Utc::now()).to_std() {
            tokio::time::sleep(remaining).await;
        }

        let round = self
            .rounds
            .open
            .lock()
            .await
            .remove(cfp_id)
            .ok_or_else(|| ConsensusError::UnknownRound(cfp_id.to_string()))?;

        let now = Utc::now();
        let (valid, expired): (Vec<ReceivedBid>, Vec<ReceivedBid>) = round
            .bids
            .into_iter()
            .partition(|b| b.bid.valid_until >= now);
        let ranked = rank_bids(&valid);
        let winner = ranked.first().cloned();

        match &winner {
            Some(w) => tracing::info!(
                cfp_id = %cfp_id,
                winner = %w.bid.from_agent,
                score = w.score,
                bids = ranked.len(),
                "contract net winner selected"
            ),
            None => tracing::info!(cfp_id = %cfp_id, "contract net closed without bids"),
        }

        Ok(Selection {
            cfp_id: cfp_id.to_string(),
            task: round.task,
            winner,
            ranked,
            expired_bids: expired.len(),
        })
    }

    /// Notify the winner with ACCEPT and every other bidder with REJECT.
    pub async fn award(&self, selection: &Selection) -> Result<(), ConsensusError> {
        let Some(winner) = &selection.winner else {
            return Ok(());
        };
        for scored in &selection.ranked {
            let awarded = scored.bid.bid_id == winner.bid.bid_id;
            let notice = AwardNotice {
                cfp_id: selection.cfp_id.clone(),
                bid_id: scored.bid.bid_id.clone(),
                task_id: selection.task.task_id.clone(),
                awarded,
            };
            let performative = if awarded {
                Performative::Accept
            } else {
                Performative::Reject
            };
            self.endpoint
                .send(
                    scored.bid.from_agent.clone(),
                    performative,
                    serde_json::to_value(&notice).map_err(ProtocolError::from)?,
                    SendOptions::default().in_conversation(selection.cfp_id.clone()),
                )
                .await?;
        }
        self.endpoint.audit(
            AuditKind::BidAwarded,
            &selection.cfp_id,
            serde_json::json!({
                "winner": winner.bid.from_agent,
                "bid_id": winner.bid.bid_id,
                "score": winner.score,
            }),
        );
        Ok(())
    }

    /// Rounds that have not been selected or reaped yet.
    pub async fn open_rounds(&self) -> usize {
        self.rounds.open.lock().await.len()
    }

    /// Drop rounds whose deadline plus the grace period has passed.
    pub async fn reap_expired(&self, now: DateTime<Utc>) -> usize {
        let grace = chrono::Duration::from_std(self.config.reap_grace)
            .unwrap_or(chrono::Duration::MAX);
        let mut open = self.rounds.open.lock().await;
        let before = open.len();
        open.retain(|cfp_id, round| {
            let keep = round
                .deadline
                .checked_add_signed(grace)
                .map_or(true, |cutoff| now <= cutoff);
            if !keep {
                tracing::debug!(cfp_id = %cfp_id, bids = round.bids.len(), "reaped uncollected round");
            }
            keep
        });
        before - open.len()
    }

    /// Run `reap_expired` periodically until the handle is aborted.
    pub fn spawn_reaper(&self) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(this.config.reap_interval);
            loop {
                tick.tick().await;
                this.reap_expired(Utc::now()).await;
            }
        })
    }
}

/// Records BID messages against their open round.
struct BidCollector {
    rounds: Arc<Rounds>,
}

impl PerformativeHandler for BidCollector {
    fn handle<'a>(&'a self, _endpoint: &'a AgentEndpoint, message: &'a Message) -> HandlerResult<'a> {
        Box::pin(async move {
            let bid: Bid = message.payload_as()?;
            if bid.from_agent != message.from {
                tracing::warn!(
                    cfp_id = %bid.cfp_id,
                    claimed = %bid.from_agent,
                    sender = %message.from,
                    "bid sender mismatch, ignoring"
                );
                return Ok(());
            }

            let now = Utc::now();
            let mut open = self.rounds.open.lock().await;
            let Some(round) = open.get_mut(&bid.cfp_id) else {
                tracing::debug!(cfp_id = %bid.cfp_id, from = %message.from, "bid for unknown round");
                return Ok(());
            };
            if now > round.deadline {
                tracing::debug!(cfp_id = %bid.cfp_id, from = %message.from, "late bid ignored");
                return Ok(());
            }
            if round.bids.iter().any(|b| b.bid.from_agent == bid.from_agent) {
                tracing::debug!(cfp_id = %bid.cfp_id, from = %message.from, "repeat bid ignored");
                return Ok(());
            }

            let sequence = self.rounds.sequence.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                cfp_id = %bid.cfp_id,
                from = %bid.from_agent,
                cost = bid.cost,
                estimated_time_ms = bid.estimated_time_ms,
                quality_level = bid.quality_level,
                "bid received"
            );
            round.bids.push(ReceivedBid {
                bid,
                received_at: now,
                sequence,
            });
            Ok(())
        })
    }
}

// ── Bidder side ──

/// Decides whether and what to bid on a CFP.
pub trait BidPolicy: Send + Sync {
    fn quote(&self, cfp: &CfpParams) -> Option<BidQuote>;
}

/// Bids the same quote on every CFP it qualifies for.
pub struct FixedQuote(pub BidQuote);

impl BidPolicy for FixedQuote {
    fn quote(&self, _cfp: &CfpParams) -> Option<BidQuote> {
        Some(self.0.clone())
    }
}

#[derive(Default)]
struct BidderShared {
    awards: Mutex<Vec<AwardNotice>>,
    submitted: Mutex<Vec<Bid>>,
}

/// Participant side of the contract net.
#[derive(Clone)]
pub struct Bidder {
    endpoint: AgentEndpoint,
    shared: Arc<BidderShared>,
    bid_validity: Duration,
}

impl Bidder {
    /// Answer CFPs on `endpoint` according to `policy` and record award notices.
    pub fn install(endpoint: AgentEndpoint, policy: Arc<dyn BidPolicy>, config: &ContractNetConfig) -> Self {
        let shared = Arc::new(BidderShared::default());
        endpoint.register_handler(
            Performative::Cfp,
            Arc::new(CfpResponder {
                policy,
                shared: shared.clone(),
                bid_validity: config.bid_validity,
            }),
        );
        let awards = Arc::new(AwardListener {
            shared: shared.clone(),
        });
        endpoint.register_handler(Performative::Accept, awards.clone());
        endpoint.register_handler(Performative::Reject, awards);
        Self {
            endpoint,
            shared,
            bid_validity: config.bid_validity,
        }
    }

    /// Answer the CFP carried by `cfp` with `quote`.
    pub async fn submit_bid(&self, cfp: &Message, quote: BidQuote) -> Result<Bid, ConsensusError> {
        let params: CfpParams = cfp.payload_as()?;
        let bid = submit(&self.endpoint, cfp, &params, quote, self.bid_validity).await?;
        self.shared.submitted.lock().await.push(bid.clone());
        Ok(bid)
    }

    pub async fn awards(&self) -> Vec<AwardNotice> {
        self.shared.awards.lock().await.clone()
    }

    pub async fn submitted_bids(&self) -> Vec<Bid> {
        self.shared.submitted.lock().await.clone()
    }
}

async fn submit(
    endpoint: &AgentEndpoint,
    cfp: &Message,
    params: &CfpParams,
    quote: BidQuote,
    validity: Duration,
) -> Result<Bid, ConsensusError> {
    if !(0.0..=1.0).contains(&quote.quality_level) || quote.cost < 0.0 {
        return Err(ConsensusError::InvalidBid(format!(
            "cost {} / quality {} out of range",
            quote.cost, quote.quality_level
        )));
    }
    let now = Utc::now();
    if now > params.deadline {
        return Err(ConsensusError::RoundClosed(params.cfp_id.clone()));
    }
    let validity = chrono::Duration::from_std(validity).unwrap_or(chrono::Duration::MAX);
    let bid = Bid {
        bid_id: uuid::Uuid::new_v4().to_string(),
        cfp_id: params.cfp_id.clone(),
        from_agent: endpoint.agent_id().clone(),
        cost: quote.cost,
        estimated_time_ms: quote.estimated_time_ms,
        quality_level: quote.quality_level,
        valid_until: now.checked_add_signed(validity).unwrap_or(DateTime::<Utc>::MAX_UTC),
    };
    let payload = serde_json::to_value(&bid).map_err(ProtocolError::from)?;
    endpoint.reply(cfp, Performative::Bid, payload).await?;
    Ok(bid)
}

struct CfpResponder {
    policy: Arc<dyn BidPolicy>,
    shared: Arc<BidderShared>,
    bid_validity: Duration,
}

impl PerformativeHandler for CfpResponder {
    fn handle<'a>(&'a self, endpoint: &'a AgentEndpoint, message: &'a Message) -> HandlerResult<'a> {
        Box::pin(async move {
            let params: CfpParams = message.payload_as()?;
            let Some(quote) = self.policy.quote(&params) else {
                tracing::debug!(cfp_id = %params.cfp_id, "policy declined to bid");
                return Ok(());
            };
            if !params
                .requirements
                .is_satisfied_by(endpoint.capabilities(), &quote)
            {
                tracing::debug!(cfp_id = %params.cfp_id, "requirements not met, not bidding");
                return Ok(());
            }
            match submit(endpoint, message, &params, quote, self.bid_validity).await {
                Ok(bid) => {
                    tracing::debug!(cfp_id = %params.cfp_id, bid_id = %bid.bid_id, "bid submitted");
                    self.shared.submitted.lock().await.push(bid);
                }
                Err(e) => {
                    tracing::debug!(cfp_id = %params.cfp_id, error = %e, "bid not submitted");
                }
            }
            Ok(())
        })
    }
}

/// Records ACCEPT/REJECT award notices. Other payloads are ignored.
struct AwardListener {
    shared: Arc<BidderShared>,
}

impl PerformativeHandler for AwardListener {
    fn handle<'a>(&'a self, _endpoint: &'a AgentEndpoint, message: &'a Message) -> HandlerResult<'a> {
        Box::pin(async move {
            let Ok(notice) = message.payload_as::<AwardNotice>() else {
                return Ok(());
            };
            tracing::info!(
                cfp_id = %notice.cfp_id,
                awarded = notice.awarded,
                task_id = %notice.task_id,
                "award notice received"
            );
            self.shared.awards.lock().await.push(notice);
            Ok(())
        })
    }
}
