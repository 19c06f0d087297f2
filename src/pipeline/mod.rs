//! Concurrent staged pipeline: Perception → Normalization → Linking.
//!
//! Each stage is a long-lived tokio task consuming one mpsc channel and
//! producing into the next. Shutdown is signal-driven: every worker selects
//! over its work channel and a watch-based stop signal, so a stop request
//! is observed at the next idle point and any in-flight item always
//! finishes. Stages are independently start/stoppable and `start` is
//! idempotent.
//!
//! Sensors (out of scope here) push raw [`Event`]s into the ingest channel;
//! the Linking stage is the only writer to the shared [`GraphStore`].

pub mod link;
pub mod normalize;
pub mod perception;

use std::sync::{Arc, RwLock};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::MnemaConfig;
use crate::event::Event;
use crate::graph::GraphStore;
use crate::mirror::MirrorClient;
use crate::oracle::Oracle;
use crate::trace::TraceLogger;

use link::LinkStage;
use normalize::NormalizeStage;
use perception::{PerceptionStage, Recognizer};

/// Running-task bookkeeping shared by every stage.
///
/// `STOPPED → RUNNING` on [`StageRunner::start`] (no-op when already
/// running); `RUNNING → STOPPED` on [`StageRunner::stop`], which lets the
/// in-flight item finish before the worker exits. The worker hands its
/// receiver back on exit so a later start respawns on the same channel.
pub(crate) struct StageRunner {
    name: &'static str,
    stop_tx: watch::Sender<bool>,
    task: Option<JoinHandle<mpsc::Receiver<Event>>>,
}

impl StageRunner {
    pub(crate) fn new(name: &'static str) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            name,
            stop_tx,
            task: None,
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.task.is_some()
    }

    pub(crate) fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    pub(crate) fn started(&mut self, task: JoinHandle<mpsc::Receiver<Event>>) {
        info!(stage = self.name, "stage running");
        self.task = Some(task);
    }

    /// Stop the worker and reclaim its receiver for the next start.
    pub(crate) async fn stop(&mut self) -> Option<mpsc::Receiver<Event>> {
        let Some(task) = self.task.take() else {
            debug!(stage = self.name, "stop on stopped stage, ignoring");
            return None;
        };
        let _ = self.stop_tx.send(true);
        let reclaimed = task.await.ok();
        // Rearm so a later start gets a fresh signal.
        let _ = self.stop_tx.send(false);
        info!(stage = self.name, "stage stopped");
        reclaimed
    }
}

/// The assembled three-stage pipeline plus its entry channel.
pub struct Pipeline {
    ingest_tx: mpsc::Sender<Event>,
    perception: PerceptionStage,
    normalize: NormalizeStage,
    link: LinkStage,
}

impl Pipeline {
    /// Wire up channels and stages. Nothing runs until [`Pipeline::start`].
    pub fn new(
        config: &MnemaConfig,
        graph: Arc<RwLock<GraphStore>>,
        oracle: Arc<dyn Oracle>,
        recognizer: Arc<dyn Recognizer>,
        trace: Arc<TraceLogger>,
        mirror: Option<Arc<MirrorClient>>,
    ) -> Self {
        let capacity = config.linking.queue_capacity;
        let (ingest_tx, ingest_rx) = mpsc::channel(capacity);
        let (normalize_tx, normalize_rx) = mpsc::channel(capacity);
        let (link_tx, link_rx) = mpsc::channel(capacity);

        let perception = PerceptionStage::new(
            ingest_rx,
            normalize_tx,
            oracle.clone(),
            recognizer,
            trace.clone(),
        );
        let normalize = NormalizeStage::new(normalize_rx, link_tx, oracle.clone(), trace.clone());
        let link = LinkStage::new(
            link_rx,
            graph,
            oracle,
            trace,
            mirror,
            config.linking.max_candidates,
        );

        Self {
            ingest_tx,
            perception,
            normalize,
            link,
        }
    }

    /// Sender for the entry queue — hand this to sensors.
    pub fn ingest_sender(&self) -> mpsc::Sender<Event> {
        self.ingest_tx.clone()
    }

    /// Start all three stage workers. Idempotent per stage.
    pub fn start(&mut self) {
        self.perception.start();
        self.normalize.start();
        self.link.start();
    }

    /// Stop stages upstream-first so queued work drains, then flush the
    /// final graph snapshot (done by the Linking stage on exit).
    pub async fn stop(&mut self) {
        self.perception.stop().await;
        self.normalize.stop().await;
        self.link.stop().await;
    }
}
