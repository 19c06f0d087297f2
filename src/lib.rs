//! Personal memory engine: heterogeneous life events woven into a
//! persistent knowledge graph.
//!
//! Events (captured text, transcripts, messages) flow through a concurrent
//! three-stage pipeline of Perception (routing), Normalization
//! (structuring), and Linking (graph mutation) into a single in-memory
//! graph of Event and Entity nodes with typed directed edges, snapshotted
//! to JSON after every write. A pull-based query service searches and
//! traverses the graph to answer free-form questions.
//!
//! All natural-language reasoning is delegated to an external [`oracle`]
//! call, treated as untrusted and fallible throughout: every consumer
//! parses defensively and degrades to a defined fallback.
//!
//! # Modules
//!
//! - [`config`] — Configuration loading from TOML files and environment variables
//! - [`event`] — The event envelope and normalized-structure types
//! - [`oracle`] — The reasoning Oracle seam and its HTTP implementation
//! - [`graph`] — The authoritative graph store with snapshot persistence
//! - [`retrieval`] — Read-only search, traversal, and candidate scoring
//! - [`pipeline`] — The concurrent staged pipeline
//! - [`query`] — The question-answering query service
//! - [`trace`] — The append-only audit log
//! - [`mirror`] — Optional best-effort replication to a secondary graph

pub mod config;
pub mod event;
pub mod graph;
pub mod mirror;
pub mod oracle;
pub mod pipeline;
pub mod query;
pub mod retrieval;
pub mod trace;
