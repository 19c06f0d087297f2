//! Event envelope and normalized-structure types.
//!
//! Defines [`Event`] (the immutable record flowing through every pipeline
//! stage), [`EventType`] (the sensor modality), and [`Normalized`] (the
//! structured description attached by the Normalization stage).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sensor modality of a captured event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Screenshot,
    Audio,
    Calendar,
    Email,
    Text,
    Web,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Screenshot => "SCREENSHOT",
            Self::Audio => "AUDIO",
            Self::Calendar => "CALENDAR",
            Self::Email => "EMAIL",
            Self::Text => "TEXT",
            Self::Web => "WEB",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SCREENSHOT" => Ok(Self::Screenshot),
            "AUDIO" => Ok(Self::Audio),
            "CALENDAR" => Ok(Self::Calendar),
            "EMAIL" => Ok(Self::Email),
            "TEXT" => Ok(Self::Text),
            "WEB" => Ok(Self::Web),
            _ => Err(format!("unknown event type: {s}")),
        }
    }
}

/// Standard envelope for all data flowing through the pipeline.
///
/// An `Event` is owned by exactly one stage at a time and handed off by
/// value through a channel, so stages never race on the same instance.
/// `metadata` collects derived artifacts (transcript text, routing flags);
/// `normalized` is set by the Normalization stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// UUID v7 (time-sortable), assigned at creation, never reused.
    pub id: String,
    pub event_type: EventType,
    /// Raw payload — text, or a file path depending on `event_type`.
    pub content: String,
    /// Free-text provenance tag (e.g. `"Microphone"`, `"Outlook"`).
    pub source: String,
    pub timestamp: DateTime<Utc>,
    /// Open mapping for stage-attached artifacts.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Structured description produced by Normalization, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalized: Option<Normalized>,
}

impl Event {
    pub fn new(
        event_type: EventType,
        content: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            event_type,
            content: content.into(),
            source: source.into(),
            timestamp: Utc::now(),
            metadata: BTreeMap::new(),
            normalized: None,
        }
    }

    /// Routing flag set by Perception when the Oracle classifies the
    /// content as not worth deep structuring.
    pub fn skip_normalization(&self) -> bool {
        self.metadata
            .get("skip_normalization")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    pub fn set_skip_normalization(&mut self) {
        self.metadata
            .insert("skip_normalization".into(), serde_json::Value::Bool(true));
    }
}

/// Structured description of an event, produced by the Normalization stage.
///
/// All fields default so a partially valid Oracle response still
/// deserializes; the stage fills the gaps afterwards.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Normalized {
    pub content_summary: String,
    pub primary_entity: String,
    pub entities: EntityBuckets,
    pub deep_metadata: DeepMetadata,
}

/// Typed entity extraction bucketed by category.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityBuckets {
    pub people: Vec<String>,
    pub organizations: Vec<String>,
    pub projects: Vec<String>,
    pub locations: Vec<String>,
    pub technologies: Vec<String>,
    pub documents: Vec<String>,
    pub dates: Vec<String>,
    pub amounts: Vec<String>,
    pub urls: Vec<String>,
    pub other: Vec<String>,
}

impl EntityBuckets {
    /// Iterate `(label, name)` pairs across every category, skipping empty
    /// names and the `"N/A"` placeholder some models emit.
    pub fn labeled(&self) -> impl Iterator<Item = (crate::graph::EntityLabel, &str)> {
        use crate::graph::EntityLabel as L;
        let buckets: [(L, &Vec<String>); 10] = [
            (L::Person, &self.people),
            (L::Organization, &self.organizations),
            (L::Project, &self.projects),
            (L::Location, &self.locations),
            (L::Technology, &self.technologies),
            (L::Document, &self.documents),
            (L::Date, &self.dates),
            (L::Amount, &self.amounts),
            (L::Url, &self.urls),
            (L::Entity, &self.other),
        ];
        buckets
            .into_iter()
            .flat_map(|(label, names)| names.iter().map(move |n| (label, n.as_str())))
            .filter(|(_, n)| !n.is_empty() && *n != "N/A")
    }
}

/// Ground-truth metadata carried alongside the Oracle's structured output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeepMetadata {
    /// Original raw content — always force-set from the event, never
    /// trusted from the Oracle.
    pub raw_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    /// `"low"` when the structure is a synthesized fallback.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<String>,
}
