//! Optional secondary graph mirror.
//!
//! Best-effort, fire-and-forget replication of node and edge writes to an
//! external Neo4j instance over the HTTP transactional Cypher endpoint.
//! Every operation returns a `Result` so the caller (the Linking stage)
//! can log failures explicitly; nothing here may ever block or roll back a
//! primary-store write.

use serde::Deserialize;
use thiserror::Error;

use crate::config::MirrorConfig;
use crate::event::Event;
use crate::graph::EntityLabel;

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("mirror transport failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("mirror rejected statement: {0}")]
    Rejected(String),
}

/// Client for the Neo4j HTTP transactional Cypher API.
pub struct MirrorClient {
    client: reqwest::Client,
    endpoint: String,
    user: String,
    password: String,
}

#[derive(Deserialize)]
struct CypherResponse {
    #[serde(default)]
    errors: Vec<CypherError>,
}

#[derive(Deserialize)]
struct CypherError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

impl MirrorClient {
    /// Build a client from config. Returns `None` when the mirror is
    /// disabled — absence of configuration fully disables replication.
    pub fn from_config(config: &MirrorConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }
        Some(Self {
            client: reqwest::Client::new(),
            endpoint: format!("{}/db/neo4j/tx/commit", config.url.trim_end_matches('/')),
            user: config.user.clone(),
            password: config.password.clone(),
        })
    }

    async fn run(&self, statement: String, parameters: serde_json::Value) -> Result<(), MirrorError> {
        let body = serde_json::json!({
            "statements": [{ "statement": statement, "parameters": parameters }]
        });
        let response = self
            .client
            .post(&self.endpoint)
            .basic_auth(&self.user, Some(&self.password))
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json::<CypherResponse>()
            .await?;
        if let Some(err) = response.errors.first() {
            return Err(MirrorError::Rejected(format!("{}: {}", err.code, err.message)));
        }
        Ok(())
    }

    /// Replicate an event node (MERGE on id).
    pub async fn add_event(&self, event: &Event) -> Result<(), MirrorError> {
        let (summary, file_path) = match &event.normalized {
            Some(n) => (
                n.content_summary.clone(),
                n.deep_metadata.file_path.clone().unwrap_or_default(),
            ),
            None => (String::new(), String::new()),
        };
        // Cap content so oversized captures don't bloat the replica.
        let content: String = event.content.chars().take(5000).collect();

        let statement = "MERGE (e:Event {id: $id}) \
             SET e.event_type = $event_type, e.timestamp = $timestamp, \
                 e.source = $source, e.layer = 'QUICK', e.summary = $summary, \
                 e.file_path = $file_path, e.content = $content"
            .to_string();
        let parameters = serde_json::json!({
            "id": event.id,
            "event_type": event.event_type.as_str(),
            "timestamp": event.timestamp.to_rfc3339(),
            "source": event.source,
            "summary": summary,
            "file_path": file_path,
            "content": content,
        });
        self.run(statement, parameters).await
    }

    /// Replicate an entity node (MERGE on label + name).
    pub async fn add_entity(&self, name: &str, label: EntityLabel) -> Result<(), MirrorError> {
        let statement = format!(
            "MERGE (n:`{}` {{name: $name}}) SET n.layer = 'CORE'",
            sanitize_label(label.as_str())
        );
        self.run(statement, serde_json::json!({ "name": name })).await
    }

    /// Replicate a directed relation. Endpoint ids follow the primary
    /// store's convention: entity ids are `"LABEL:Name"`, event ids are
    /// UUIDs.
    pub async fn add_relation(
        &self,
        source_id: &str,
        target_id: &str,
        relation: &str,
    ) -> Result<(), MirrorError> {
        let mut parameters = serde_json::Map::new();
        let source_match = match_clause("a", source_id, "src", &mut parameters);
        let target_match = match_clause("b", target_id, "tgt", &mut parameters);
        let statement = format!(
            "{source_match} {target_match} MERGE (a)-[r:`{}`]->(b)",
            sanitize_relation(relation)
        );
        self.run(statement, serde_json::Value::Object(parameters)).await
    }
}

/// Build a MATCH clause for one endpoint, splitting `"LABEL:Name"` entity
/// ids from plain event UUIDs.
fn match_clause(
    var: &str,
    node_id: &str,
    param_prefix: &str,
    parameters: &mut serde_json::Map<String, serde_json::Value>,
) -> String {
    match split_entity_id(node_id) {
        Some((label, name)) => {
            let key = format!("{param_prefix}_name");
            parameters.insert(key.clone(), serde_json::Value::String(name.to_string()));
            format!("MATCH ({var}:`{}` {{name: ${key}}})", sanitize_label(label))
        }
        None => {
            let key = format!("{param_prefix}_id");
            parameters.insert(key.clone(), serde_json::Value::String(node_id.to_string()));
            format!("MATCH ({var}:Event {{id: ${key}}})")
        }
    }
}

/// `"PERSON:Sarah"` → `Some(("PERSON", "Sarah"))`; UUIDs return `None`.
fn split_entity_id(node_id: &str) -> Option<(&str, &str)> {
    let (label, name) = node_id.split_once(':')?;
    (!label.is_empty() && label.chars().all(|c| c.is_ascii_uppercase())).then_some((label, name))
}

fn sanitize_label(label: &str) -> String {
    let clean: String = label.chars().filter(|c| c.is_alphanumeric()).collect();
    if clean.is_empty() {
        "ENTITY".to_string()
    } else {
        clean
    }
}

fn sanitize_relation(relation: &str) -> String {
    let clean: String = relation
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_')
        .collect::<String>()
        .to_uppercase();
    if clean.is_empty() {
        "RELATED_TO".to_string()
    } else {
        clean
    }
}
