use hive_protocol::AgentId;

/// Topic names used by agents on a shared channel.
pub struct Topics;

impl Topics {
    const PREFIX: &'static str = "/hive/1.0.0";

    /// Topic every agent listens on for broadcast traffic.
    pub fn broadcast() -> String {
        format!("{}/broadcast", Self::PREFIX)
    }

    /// Direct inbox of a single agent.
    pub fn inbox(agent: &AgentId) -> String {
        format!("{}/agent/{}", Self::PREFIX, agent)
    }

    /// Topic a message addressed to `to` is published on.
    pub fn for_recipient(to: &AgentId) -> String {
        if to.is_broadcast() {
            Self::broadcast()
        } else {
            Self::inbox(to)
        }
    }
}
