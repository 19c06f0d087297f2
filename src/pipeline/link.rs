//! Linking stage — the only writer to the graph.
//!
//! For each normalized event: insert the event node, create/reuse entity
//! nodes with `MENTIONS` edges, then retrieve likely-related prior events
//! and let the Oracle judge whether a typed relationship exists. A full
//! snapshot is persisted after every event, and all writes are mirrored
//! best-effort to the secondary graph when one is configured.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::event::Event;
use crate::graph::{EntityLabel, GraphStore};
use crate::mirror::MirrorClient;
use crate::oracle::{strip_code_fences, Oracle};
use crate::retrieval::{retrieve_relevant_candidates, Candidate};
use crate::trace::TraceLogger;

use super::StageRunner;

/// Fixed vocabulary for Oracle-classified relationships.
const RELATION_TYPES: &[&str] = &[
    "CAUSED_BY",
    "FOLLOWS_UP",
    "DISCUSSES",
    "REFERENCES",
    "PART_OF",
    "RELATED_TO",
];

pub struct LinkStage {
    rx: Option<mpsc::Receiver<Event>>,
    graph: Arc<RwLock<GraphStore>>,
    oracle: Arc<dyn Oracle>,
    trace: Arc<TraceLogger>,
    mirror: Option<Arc<MirrorClient>>,
    max_candidates: usize,
    runner: StageRunner,
}

impl LinkStage {
    pub fn new(
        rx: mpsc::Receiver<Event>,
        graph: Arc<RwLock<GraphStore>>,
        oracle: Arc<dyn Oracle>,
        trace: Arc<TraceLogger>,
        mirror: Option<Arc<MirrorClient>>,
        max_candidates: usize,
    ) -> Self {
        Self {
            rx: Some(rx),
            graph,
            oracle,
            trace,
            mirror,
            max_candidates,
            runner: StageRunner::new("link"),
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
        let graph = self.graph.clone();
        let oracle = self.oracle.clone();
        let trace = self.trace.clone();
        let mirror = self.mirror.clone();
        let max_candidates = self.max_candidates;

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    maybe = rx.recv() => {
                        let Some(event) = maybe else { break };
                        link_event(
                            &event,
                            &graph,
                            oracle.as_ref(),
                            &trace,
                            mirror.as_deref(),
                            max_candidates,
                        )
                        .await;
                    }
                    _ = stop.changed() => {
                        if *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            // Final flush so a clean shutdown loses nothing.
            save_snapshot(&graph);
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

fn read(graph: &RwLock<GraphStore>) -> RwLockReadGuard<'_, GraphStore> {
    graph.read().unwrap_or_else(PoisonError::into_inner)
}

fn write(graph: &RwLock<GraphStore>) -> RwLockWriteGuard<'_, GraphStore> {
    graph.write().unwrap_or_else(PoisonError::into_inner)
}

fn save_snapshot(graph: &RwLock<GraphStore>) {
    if let Err(err) = read(graph).save() {
        warn!(error = %err, "graph snapshot save failed");
    }
}

/// Process one event end to end. Every failure mode is local: a mirror or
/// Oracle problem degrades that step, never the event.
async fn link_event(
    event: &Event,
    graph: &RwLock<GraphStore>,
    oracle: &dyn Oracle,
    trace: &TraceLogger,
    mirror: Option<&MirrorClient>,
    max_candidates: usize,
) {
    debug!(id = %event.id, "linking event");

    let event_node_id = write(graph).add_event_node(event);
    if let Some(mirror) = mirror {
        if let Err(err) = mirror.add_event(event).await {
            warn!(id = %event.id, error = %err, "mirror event push failed");
        }
    }

    let entity_count = link_entities(event, &event_node_id, graph, mirror).await;
    if entity_count > 0 {
        debug!(id = %event.id, entities = entity_count, "explicit entity links added");
    }

    let mut smart_links = 0usize;
    if let Some(summary) = event
        .normalized
        .as_ref()
        .map(|n| n.content_summary.as_str())
        .filter(|s| !s.is_empty())
    {
        smart_links =
            semantic_linking(event, &event_node_id, summary, graph, oracle, mirror, max_candidates)
                .await;
    }

    save_snapshot(graph);

    trace.log(
        "Linker",
        "linked",
        serde_json::json!({
            "id": event.id,
            "entities": entity_count,
            "inferred_relations": smart_links,
        }),
    );
}

/// Idempotently create entity nodes and `MENTIONS` edges for every
/// extracted entity, in every category. Unconditional — this is the
/// structural backbone semantic linking builds on.
async fn link_entities(
    event: &Event,
    event_node_id: &str,
    graph: &RwLock<GraphStore>,
    mirror: Option<&MirrorClient>,
) -> usize {
    let Some(normalized) = &event.normalized else {
        return 0;
    };
    let pairs: Vec<(EntityLabel, String)> = normalized
        .entities
        .labeled()
        .map(|(label, name)| (label, name.to_string()))
        .collect();

    let mut linked = Vec::new();
    {
        let mut g = write(graph);
        for (label, name) in &pairs {
            let entity_id = g.add_entity_node(name, *label);
            if let Err(err) = g.add_relation(event_node_id, &entity_id, "MENTIONS") {
                warn!(error = %err, "mention edge dropped");
                continue;
            }
            linked.push((*label, name.clone(), entity_id));
        }
    }

    if let Some(mirror) = mirror {
        for (label, name, entity_id) in &linked {
            if let Err(err) = mirror.add_entity(name, *label).await {
                warn!(entity = %entity_id, error = %err, "mirror entity push failed");
                continue;
            }
            if let Err(err) = mirror.add_relation(event_node_id, entity_id, "MENTIONS").await {
                warn!(entity = %entity_id, error = %err, "mirror relation push failed");
            }
        }
    }

    linked.len()
}

/// Retrieve candidate prior events and ask the Oracle to judge each pair.
/// An edge is added only for a related verdict with at least medium
/// confidence. Returns the number of edges added.
async fn semantic_linking(
    event: &Event,
    event_node_id: &str,
    summary: &str,
    graph: &RwLock<GraphStore>,
    oracle: &dyn Oracle,
    mirror: Option<&MirrorClient>,
    max_candidates: usize,
) -> usize {
    let entities = event
        .normalized
        .as_ref()
        .map(|n| n.entities.clone())
        .unwrap_or_default();

    let candidates = retrieve_relevant_candidates(
        &read(graph),
        summary,
        &entities,
        event.timestamp,
        event_node_id,
        max_candidates,
    );
    if candidates.is_empty() {
        debug!(id = %event.id, "no relevant prior events");
        return 0;
    }
    debug!(id = %event.id, candidates = candidates.len(), "evaluating candidate relationships");

    let mut added = 0usize;
    for candidate in &candidates {
        // Explicitly connected pairs need no second judgement.
        if read(graph).has_edge(event_node_id, &candidate.id) {
            continue;
        }
        let Some((relation, reason)) = judge_relationship(event, summary, candidate, oracle).await
        else {
            continue;
        };

        let result = write(graph).add_relation(event_node_id, &candidate.id, &relation);
        if let Err(err) = result {
            warn!(error = %err, "inferred edge dropped");
            continue;
        }
        info!(id = %event.id, relation = %relation, reason = %reason, "smart link added");
        added += 1;

        if let Some(mirror) = mirror {
            if let Err(err) = mirror.add_relation(event_node_id, &candidate.id, &relation).await {
                warn!(error = %err, "mirror relation push failed");
            }
        }
    }
    added
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct Judgement {
    related: bool,
    relationship_type: String,
    confidence: String,
    reason: String,
}

/// Ask the Oracle whether two events are related and how. Returns the
/// validated relation label and the stated reason, or `None` for unrelated
/// pairs, low confidence, or unusable output.
async fn judge_relationship(
    event: &Event,
    summary: &str,
    candidate: &Candidate,
    oracle: &dyn Oracle,
) -> Option<(String, String)> {
    let prompt = format!(
        "Analyze the relationship between two events in a knowledge graph:\n\n\
         NEW EVENT:\n- Type: {}\n- Summary: {}\n\n\
         EXISTING EVENT:\n- Type: {}\n- Summary: {}\n- Why retrieved: {}\n\n\
         Task: Determine if these events are meaningfully related. If yes, \
         classify the relationship.\n\n\
         Respond as JSON:\n\
         {{\"related\": true/false, \
         \"relationship_type\": \"CAUSED_BY | FOLLOWS_UP | DISCUSSES | REFERENCES | PART_OF | RELATED_TO\", \
         \"confidence\": \"high | medium | low\", \
         \"reason\": \"brief explanation (max 15 words)\"}}",
        event.event_type,
        summary,
        candidate.event_type,
        if candidate.summary.is_empty() { "No summary" } else { &candidate.summary },
        candidate.reasons,
    );

    let response = oracle.generate(&prompt, None, true).await;
    let judgement: Judgement = serde_json::from_str(strip_code_fences(&response)).ok()?;

    if !judgement.related || !matches!(judgement.confidence.as_str(), "high" | "medium") {
        return None;
    }
    let relation = if RELATION_TYPES.contains(&judgement.relationship_type.as_str()) {
        judgement.relationship_type
    } else {
        "RELATED_TO".to_string()
    };
    Some((relation, judgement.reason))
}
