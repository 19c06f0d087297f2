#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use mnema::event::{Event, EventType};
use mnema::graph::GraphStore;
use mnema::oracle::Oracle;

/// Scripted Oracle: pops queued responses in call order, then degrades to
/// the transport-failure contract (`"{}"`) once the script runs out.
pub struct MockOracle {
    responses: Mutex<VecDeque<String>>,
}

impl MockOracle {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
        }
    }

    pub fn scripted(responses: &[&str]) -> Self {
        Self {
            responses: Mutex::new(responses.iter().map(|s| s.to_string()).collect()),
        }
    }

    pub fn push(&self, response: &str) {
        self.responses.lock().unwrap().push_back(response.to_string());
    }
}

#[async_trait]
impl Oracle for MockOracle {
    async fn generate(
        &self,
        _prompt: &str,
        _system_prompt: Option<&str>,
        _json_mode: bool,
    ) -> String {
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| "{}".to_string())
    }
}

/// Oracle that is permanently unreachable.
pub struct DeadOracle;

#[async_trait]
impl Oracle for DeadOracle {
    async fn generate(
        &self,
        _prompt: &str,
        _system_prompt: Option<&str>,
        _json_mode: bool,
    ) -> String {
        "{}".to_string()
    }
}

/// Fresh graph store backed by a tempdir. Returns the dir so it outlives
/// the store.
pub fn temp_graph() -> (tempfile::TempDir, GraphStore) {
    let dir = tempfile::tempdir().unwrap();
    let graph = GraphStore::open(dir.path().join("graph.json"));
    (dir, graph)
}

/// A TEXT event with a fixed timestamp, for temporal assertions.
pub fn event_at(content: &str, timestamp: DateTime<Utc>) -> Event {
    let mut event = Event::new(EventType::Text, content, "test");
    event.timestamp = timestamp;
    event
}

/// Routing response sending the event down the deep-structuring path.
pub const ROUTE_NORMALIZE: &str = r#"{"action": "NORMALIZE"}"#;

/// Routing response flagging the event as passthrough noise.
pub const ROUTE_SKIP: &str = r#"{"action": "SKIP"}"#;
