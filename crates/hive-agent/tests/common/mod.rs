#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use hive_agent::{AgentEndpoint, EndpointConfig, HandlerResult, PerformativeHandler};
use hive_network::InMemoryChannel;
use hive_protocol::Message;

/// Poll an async condition until it holds, failing the test after ~2s.
macro_rules! eventually {
    ($cond:expr) => {{
        let mut held = false;
        for _ in 0..100 {
            if $cond {
                held = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(held, "condition never held: {}", stringify!($cond));
    }};
}

pub async fn agent(channel: &Arc<InMemoryChannel>, id: &str, capabilities: &[&str]) -> AgentEndpoint {
    agent_with(channel, id, EndpointConfig::default().with_capabilities(capabilities.iter().copied())).await
}

pub async fn agent_with(channel: &Arc<InMemoryChannel>, id: &str, config: EndpointConfig) -> AgentEndpoint {
    let endpoint = AgentEndpoint::builder(channel.clone())
        .agent_id(id)
        .config(config)
        .build();
    endpoint.start().await.unwrap();
    endpoint
}

/// Counts every message it is handed.
#[derive(Default)]
pub struct Counter {
    pub hits: AtomicUsize,
}

impl Counter {
    pub fn count(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

impl PerformativeHandler for Counter {
    fn handle<'a>(&'a self, _endpoint: &'a AgentEndpoint, _message: &'a Message) -> HandlerResult<'a> {
        Box::pin(async move {
            self.hits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

/// Replies INFORM echoing the request payload.
pub struct Echo;

impl PerformativeHandler for Echo {
    fn handle<'a>(&'a self, endpoint: &'a AgentEndpoint, message: &'a Message) -> HandlerResult<'a> {
        Box::pin(async move {
            endpoint
                .reply(message, hive_protocol::Performative::Inform, message.payload.clone())
                .await?;
            Ok(())
        })
    }
}
