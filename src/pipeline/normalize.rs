//! Normalization stage — turns raw text into a structured description.
//!
//! The Oracle is asked for a summary, a primary entity, and a bucketed
//! entity extraction. Its output is defensively parsed: malformed responses
//! synthesize a minimal fallback structure so Linking always receives a
//! well-formed event, and the original raw content is force-injected into
//! the structure afterwards to preserve ground truth over any
//! hallucination.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::event::{Event, EventType, Normalized};
use crate::oracle::{strip_code_fences, Oracle};
use crate::trace::TraceLogger;

use super::StageRunner;

const SYSTEM_PROMPT: &str = "You are a data normalizer for a personal memory system. \
    Given raw captured content, produce VALID JSON ONLY with this shape: \
    {\"content_summary\": \"one or two sentences\", \
     \"primary_entity\": \"the single most central person/project/thing\", \
     \"entities\": {\"people\": [], \"organizations\": [], \"projects\": [], \
      \"locations\": [], \"technologies\": [], \"documents\": [], \"dates\": [], \
      \"amounts\": [], \"urls\": [], \"other\": []}}. \
    Preserve names exactly as written. Do not invent entities.";

pub struct NormalizeStage {
    rx: Option<mpsc::Receiver<Event>>,
    tx: mpsc::Sender<Event>,
    oracle: Arc<dyn Oracle>,
    trace: Arc<TraceLogger>,
    runner: StageRunner,
}

impl NormalizeStage {
    pub fn new(
        rx: mpsc::Receiver<Event>,
        tx: mpsc::Sender<Event>,
        oracle: Arc<dyn Oracle>,
        trace: Arc<TraceLogger>,
    ) -> Self {
        Self {
            rx: Some(rx),
            tx,
            oracle,
            trace,
            runner: StageRunner::new("normalize"),
        }
    }

    pub fn start(&mut self) {
        if self.runner.is_running() {
            return;
        }
        let Some(mut rx) = self.rx.take() else {
            return;
        };
        let mut stop = self.runner.stop_signal();
        let tx = self.tx.clone();
        let oracle = self.oracle.clone();
        let trace = self.trace.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    maybe = rx.recv() => {
                        let Some(event) = maybe else { break };
                        let event = normalize(event, oracle.as_ref(), &trace).await;
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    _ = stop.changed() => {
                        if *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            rx
        });
        self.runner.started(task);
    }

    pub async fn stop(&mut self) {
        if let Some(rx) = self.runner.stop().await {
            self.rx = Some(rx);
        }
    }
}

/// Structure one event. Never drops it: skip-flagged events pass through
/// untouched, malformed Oracle output falls back to a minimal structure.
async fn normalize(mut event: Event, oracle: &dyn Oracle, trace: &TraceLogger) -> Event {
    if event.skip_normalization() {
        debug!(id = %event.id, "router skip, passing raw event to linker");
        return event;
    }

    debug!(id = %event.id, event_type = %event.event_type, "structuring");

    let prompt = format!(
        "Source: {}\nTimestamp: {}\nFULL_CONTENT_DO_NOT_SUMMARIZE:\n{}",
        event.source,
        event.timestamp.to_rfc3339(),
        event.content,
    );
    let response = oracle.generate(&prompt, Some(SYSTEM_PROMPT), true).await;

    let mut normalized = match serde_json::from_str::<Normalized>(strip_code_fences(&response)) {
        Ok(normalized) => normalized,
        Err(err) => {
            warn!(id = %event.id, error = %err, "oracle output malformed, using fallback");
            fallback_structure(&event)
        }
    };

    // Ground truth always wins over whatever the Oracle claimed.
    normalized.deep_metadata.raw_text = event.content.clone();
    if matches!(event.event_type, EventType::Screenshot | EventType::Audio) {
        let path = event
            .metadata
            .get("file_path")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| event.content.clone());
        normalized.deep_metadata.file_path = Some(path);
    }

    trace.log(
        "Normalizer",
        "normalized",
        serde_json::json!({
            "id": event.id,
            "primary_entity": normalized.primary_entity,
            "summary": normalized.content_summary,
            "fallback": normalized.deep_metadata.confidence.as_deref() == Some("low"),
        }),
    );

    event.normalized = Some(normalized);
    event
}

/// Minimal well-formed structure for when the Oracle returns junk, so the
/// event still reaches the graph instead of being dropped.
fn fallback_structure(event: &Event) -> Normalized {
    let mut normalized = Normalized {
        content_summary: event.content.chars().take(100).collect(),
        primary_entity: "Unprocessed Event".into(),
        ..Default::default()
    };
    normalized.entities.other.push("Fallback Entity".into());
    normalized.deep_metadata.confidence = Some("low".into());
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;

    #[test]
    fn fallback_is_well_formed() {
        let event = Event::new(EventType::Text, "x".repeat(300), "test");
        let normalized = fallback_structure(&event);
        assert_eq!(normalized.content_summary.len(), 100);
        assert_eq!(normalized.primary_entity, "Unprocessed Event");
        assert_eq!(normalized.entities.other, vec!["Fallback Entity"]);
        assert_eq!(normalized.deep_metadata.confidence.as_deref(), Some("low"));
    }
}
