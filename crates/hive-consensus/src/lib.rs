//! Hive group decision mechanisms
//!
//! - `contract_net`: call for proposals, bid collection and winner selection
//! - `consensus`: vote collection with unanimous, majority and supermajority rules
//!
//! Both run on top of an `AgentEndpoint` and keep their round state local
//! to the coordinator instance that opened the round.

pub mod consensus;
pub mod contract_net;

pub use consensus::{
    tally, ConsensusCoordinator, ConsensusOutcome, ConsensusParticipant, FixedVote,
    GeneratorVoter, VotePolicy,
};
pub use contract_net::{
    rank_bids, score_bid, select_winner, AwardNotice, BidPolicy, Bidder, ContractNetConfig,
    ContractNetCoordinator, FixedQuote, ReceivedBid, ScoredBid, Selection,
};

use hive_agent::AgentError;
use hive_protocol::ProtocolError;

/// Errors raised by contract-net and consensus rounds.
#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    #[error("unknown or already closed round: {0}")]
    UnknownRound(String),

    #[error("round {0} is closed")]
    RoundClosed(String),

    #[error("invalid bid: {0}")]
    InvalidBid(String),

    #[error("deadline {0} is already in the past")]
    DeadlineInPast(chrono::DateTime<chrono::Utc>),

    #[error("no participants given")]
    NoParticipants,

    #[error("agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}
