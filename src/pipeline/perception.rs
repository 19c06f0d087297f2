//! Perception stage — derives a text signal from each raw event and routes
//! it toward deep structuring or cheap passthrough.
//!
//! Transcription and OCR belong to an external collaborator behind the
//! [`Recognizer`] trait; this stage only decides what happens to the text.
//! The routing question goes to the Oracle, and the answer is treated as
//! untrusted: anything other than a clean `SKIP` falls open to the deep
//! path so informative content is never silently discarded.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::event::{Event, EventType};
use crate::oracle::{strip_code_fences, Oracle};
use crate::trace::TraceLogger;

use super::StageRunner;

/// External recognition collaborator: speech-to-text and OCR.
///
/// Capture mechanics are out of scope for the core; the default
/// [`NoopRecognizer`] extracts nothing, so path-only events are dropped.
pub trait Recognizer: Send + Sync {
    /// Transcribe an audio file. `None` when unavailable.
    fn transcribe(&self, path: &str) -> Option<String>;
    /// Extract text from an image. `None` when unavailable.
    fn recognize_text(&self, path: &str) -> Option<String>;
}

/// Recognizer that recognizes nothing.
pub struct NoopRecognizer;

impl Recognizer for NoopRecognizer {
    fn transcribe(&self, _path: &str) -> Option<String> {
        None
    }
    fn recognize_text(&self, _path: &str) -> Option<String> {
        None
    }
}

pub struct PerceptionStage {
    rx: Option<mpsc::Receiver<Event>>,
    tx: mpsc::Sender<Event>,
    oracle: Arc<dyn Oracle>,
    recognizer: Arc<dyn Recognizer>,
    trace: Arc<TraceLogger>,
    runner: StageRunner,
}

impl PerceptionStage {
    pub fn new(
        rx: mpsc::Receiver<Event>,
        tx: mpsc::Sender<Event>,
        oracle: Arc<dyn Oracle>,
        recognizer: Arc<dyn Recognizer>,
        trace: Arc<TraceLogger>,
    ) -> Self {
        Self {
            rx: Some(rx),
            tx,
            oracle,
            recognizer,
            trace,
            runner: StageRunner::new("perception"),
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
        let recognizer = self.recognizer.clone();
        let trace = self.trace.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    maybe = rx.recv() => {
                        let Some(event) = maybe else { break };
                        debug!(event_type = %event.event_type, "analyzing");
                        if let Some(event) =
                            perceive(event, oracle.as_ref(), recognizer.as_ref(), &trace).await
                        {
                            if tx.send(event).await.is_err() {
                                break;
                            }
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

/// Derive text and route the event. Returns `None` to drop it (no
/// extractable text).
async fn perceive(
    mut event: Event,
    oracle: &dyn Oracle,
    recognizer: &dyn Recognizer,
    trace: &TraceLogger,
) -> Option<Event> {
    let (text, context_type) = extract_text(&mut event, recognizer);

    if text.is_empty() {
        info!(id = %event.id, "no extractable text, dropping");
        trace.log(
            "Perception",
            "dropped",
            serde_json::json!({ "id": event.id, "event_type": event.event_type.as_str() }),
        );
        return None;
    }

    let route = route_content(&text, context_type, oracle).await;
    trace.log(
        "Perception",
        "routed",
        serde_json::json!({ "id": event.id, "action": route }),
    );

    if route == "SKIP" {
        event.set_skip_normalization();
    }
    event.content = text;
    Some(event)
}

/// Pull the text signal out of the event according to its modality,
/// recording derived artifacts in the event metadata.
fn extract_text(event: &mut Event, recognizer: &dyn Recognizer) -> (String, &'static str) {
    match event.event_type {
        EventType::Audio => {
            let text = if event.content.ends_with(".wav") {
                event.metadata.insert(
                    "file_path".into(),
                    serde_json::Value::String(event.content.clone()),
                );
                recognizer.transcribe(&event.content).unwrap_or_default()
            } else {
                event.content.clone()
            };
            event
                .metadata
                .insert("transcript".into(), serde_json::Value::String(text.clone()));
            (text, "Audio Transcript")
        }
        EventType::Screenshot => {
            let text = if event.content.ends_with(".png") {
                event.metadata.insert(
                    "file_path".into(),
                    serde_json::Value::String(event.content.clone()),
                );
                recognizer.recognize_text(&event.content).unwrap_or_default()
            } else {
                event.content.clone()
            };
            event
                .metadata
                .insert("ocr_text".into(), serde_json::Value::String(text.clone()));
            (text, "Screen OCR")
        }
        EventType::Email | EventType::Calendar | EventType::Web | EventType::Text => {
            (event.content.clone(), "Text Item")
        }
    }
}

/// Ask the Oracle whether the content warrants deep structuring.
/// Any failure or unparsable answer defaults to `NORMALIZE` — fail open.
async fn route_content(text: &str, context_type: &str, oracle: &dyn Oracle) -> &'static str {
    let excerpt: String = text.chars().take(500).collect();
    let prompt = format!(
        "Act as a data router.\n\
         Input type: {context_type}\n\
         Content: \"{excerpt}\"\n\n\
         Task: Does this content contain valuable information (names, dates, \
         projects, financials) that should be universally indexed? Or is it \
         noise/menu text?\n\n\
         Respond VALID JSON ONLY: {{\"action\": \"NORMALIZE\" | \"SKIP\"}}"
    );

    let response = oracle.generate(&prompt, None, true).await;
    let action = serde_json::from_str::<serde_json::Value>(strip_code_fences(&response))
        .ok()
        .and_then(|v| v.get("action").and_then(|a| a.as_str()).map(str::to_string));

    match action.as_deref() {
        Some("SKIP") => "SKIP",
        Some("NORMALIZE") => "NORMALIZE",
        _ => {
            warn!("router response unusable, defaulting to NORMALIZE");
            "NORMALIZE"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_events_pass_content_through() {
        let mut event = Event::new(EventType::Text, "quarterly planning notes", "test");
        let (text, kind) = extract_text(&mut event, &NoopRecognizer);
        assert_eq!(text, "quarterly planning notes");
        assert_eq!(kind, "Text Item");
    }

    #[test]
    fn audio_path_without_recognizer_yields_empty() {
        let mut event = Event::new(EventType::Audio, "/tmp/clip.wav", "Microphone");
        let (text, _) = extract_text(&mut event, &NoopRecognizer);
        assert!(text.is_empty());
        assert_eq!(
            event.metadata.get("file_path").and_then(|v| v.as_str()),
            Some("/tmp/clip.wav")
        );
    }

    #[test]
    fn inline_audio_text_is_kept() {
        let mut event = Event::new(EventType::Audio, "we agreed to ship Friday", "Microphone");
        let (text, _) = extract_text(&mut event, &NoopRecognizer);
        assert_eq!(text, "we agreed to ship Friday");
        assert_eq!(
            event.metadata.get("transcript").and_then(|v| v.as_str()),
            Some("we agreed to ship Friday")
        );
    }
}
