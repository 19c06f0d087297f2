//! Read-only retrieval algorithms over the graph.
//!
//! Keyword search, bounded breadth-first traversal, and the multi-factor
//! candidate scoring the Linking stage uses to find likely-related prior
//! events without an O(n²) comparison against the whole graph.

use std::collections::{BTreeMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::event::EntityBuckets;
use crate::graph::{Edge, GraphStore, Node};

/// A scored keyword-search hit.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub id: String,
    pub score: i64,
}

/// Subgraph returned by [`get_traversal`].
#[derive(Debug, Serialize)]
pub struct Traversal {
    pub nodes: BTreeMap<String, Node>,
    pub edges: Vec<Edge>,
}

/// A candidate prior event for relationship linking.
#[derive(Debug, Clone, Serialize)]
pub struct Candidate {
    pub id: String,
    pub score: i64,
    pub summary: String,
    pub event_type: String,
    /// Human-readable breakdown of which factors fired. Used for audit and
    /// Oracle prompting, never for ranking.
    pub reasons: String,
}

const STOPWORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by",
    "from", "as", "is", "was", "are", "were", "been", "be", "have", "has", "had", "do", "does",
    "did", "will", "would", "should", "could", "may", "might", "must", "this", "that", "these",
    "those",
];

/// Keyword search over every node.
///
/// Each query term is whitespace-tokenized and lowercased; tokens of length
/// ≤ 2 are dropped. A token scores +3 as a substring of the node id or
/// entity name, +1 as a substring of the node's concatenated text fields.
/// Zero-score nodes are excluded; results are ordered by descending score,
/// ties broken by graph iteration order.
pub fn search_nodes(graph: &GraphStore, terms: &[String]) -> Vec<SearchHit> {
    let tokens: Vec<String> = terms
        .iter()
        .flat_map(|t| t.split_whitespace())
        .map(|t| t.to_lowercase())
        .filter(|t| t.len() > 2)
        .collect();
    if tokens.is_empty() {
        return Vec::new();
    }

    let mut hits = Vec::new();
    for (id, node) in graph.nodes() {
        let id_lower = id.to_lowercase();
        let name_lower = node.name().map(str::to_lowercase);
        let text = node.searchable_text();

        let mut score = 0i64;
        for token in &tokens {
            if id_lower.contains(token.as_str())
                || name_lower
                    .as_deref()
                    .is_some_and(|n| n.contains(token.as_str()))
            {
                score += 3;
            }
            if text.contains(token.as_str()) {
                score += 1;
            }
        }
        if score > 0 {
            hits.push(SearchHit {
                id: id.to_string(),
                score,
            });
        }
    }

    // Stable sort preserves graph iteration order for equal scores.
    hits.sort_by_key(|h| std::cmp::Reverse(h.score));
    hits
}

/// Breadth-first expansion from `start_ids`, following edges in both
/// directions, up to `depth` hops. Each node is visited at most once, so
/// cyclic graphs terminate. `depth = 0` returns only the start nodes.
pub fn get_traversal(graph: &GraphStore, start_ids: &[String], depth: usize) -> Traversal {
    let mut nodes = BTreeMap::new();
    let mut edges = Vec::new();
    let mut seen_edges: HashSet<(String, String, String)> = HashSet::new();
    let mut visited: HashSet<String> = HashSet::new();
    let mut frontier: VecDeque<(String, usize)> = VecDeque::new();

    for id in start_ids {
        if let Some(node) = graph.node(id) {
            if visited.insert(id.clone()) {
                nodes.insert(id.clone(), node.clone());
                frontier.push_back((id.clone(), 0));
            }
        }
    }

    while let Some((id, hops)) = frontier.pop_front() {
        if hops >= depth {
            continue;
        }
        let neighbors = graph
            .out_edges(&id)
            .map(|e| (e.clone(), e.target.clone()))
            .chain(graph.in_edges(&id).map(|e| (e.clone(), e.source.clone())));
        for (edge, neighbor) in neighbors {
            let key = (
                edge.source.clone(),
                edge.target.clone(),
                edge.relation.clone(),
            );
            if seen_edges.insert(key) {
                edges.push(edge);
            }
            if !visited.contains(&neighbor) {
                if let Some(node) = graph.node(&neighbor) {
                    visited.insert(neighbor.clone());
                    nodes.insert(neighbor.clone(), node.clone());
                    frontier.push_back((neighbor, hops + 1));
                }
            }
        }
    }

    Traversal { nodes, edges }
}

/// Stopword-filtered keywords from `text`: tokens of length > 3, first 15
/// distinct by order of first appearance.
pub fn extract_keywords(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut keywords = Vec::new();
    for word in text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 3 && !STOPWORDS.contains(w))
    {
        if seen.insert(word.to_string()) {
            keywords.push(word.to_string());
            if keywords.len() == 15 {
                break;
            }
        }
    }
    keywords
}

/// Multi-factor retrieval of likely-related prior events.
///
/// Restricted to event nodes, excluding `exclude_id`. Additive score:
/// shared outgoing entity neighbors ×5 (the dominant signal), summary
/// keyword hits ×2, temporal proximity +3 within one hour or +1 within a
/// day. Zero-score candidates are discarded; at most `max_results` are
/// returned, best first.
pub fn retrieve_relevant_candidates(
    graph: &GraphStore,
    content_summary: &str,
    event_entities: &EntityBuckets,
    timestamp: DateTime<Utc>,
    exclude_id: &str,
    max_results: usize,
) -> Vec<Candidate> {
    let keywords = extract_keywords(content_summary);

    // Entity neighbors of the new event: its outgoing MENTIONS links plus
    // the ids its extracted entities would map to. The union covers the
    // window between node insertion and entity linking.
    let mut new_entity_ids: HashSet<String> = entity_neighbors(graph, exclude_id);
    for (label, name) in event_entities.labeled() {
        new_entity_ids.insert(format!("{label}:{name}"));
    }

    let mut candidates = Vec::new();
    for (id, node) in graph.nodes() {
        let event_node = match node {
            Node::Event(n) => n,
            Node::Entity(_) => continue,
        };
        if id == exclude_id {
            continue;
        }

        let mut score = 0i64;
        let mut reasons = Vec::new();

        // Factor 1: shared entity mentions (strongest signal).
        let candidate_entities = entity_neighbors(graph, id);
        let shared: Vec<&String> = candidate_entities.intersection(&new_entity_ids).collect();
        if !shared.is_empty() {
            score += shared.len() as i64 * 5;
            let names: Vec<&str> = shared
                .iter()
                .take(3)
                .filter_map(|ent_id| graph.node(ent_id).and_then(Node::name))
                .collect();
            if !names.is_empty() {
                reasons.push(format!("shared: {}", names.join(", ")));
            }
        }

        // Factor 2: keyword overlap in the stored summary.
        if let Some(summary) = &event_node.summary {
            let summary_lower = summary.to_lowercase();
            let matches = keywords
                .iter()
                .filter(|k| summary_lower.contains(k.as_str()))
                .count();
            if matches > 0 {
                score += matches as i64 * 2;
                reasons.push(format!("{matches} keyword matches"));
            }
        }

        // Factor 3: temporal proximity, evaluated once.
        if let Ok(node_time) = DateTime::parse_from_rfc3339(&event_node.timestamp) {
            let diff_hours =
                (node_time.with_timezone(&Utc) - timestamp).num_seconds().abs() as f64 / 3600.0;
            if diff_hours < 1.0 {
                score += 3;
                reasons.push("within 1 hour".into());
            } else if diff_hours < 24.0 {
                score += 1;
                reasons.push("same day".into());
            }
        }

        if score > 0 {
            candidates.push(Candidate {
                id: id.to_string(),
                score,
                summary: event_node.summary.clone().unwrap_or_default(),
                event_type: event_node.event_type.clone(),
                reasons: reasons.join(" | "),
            });
        }
    }

    candidates.sort_by_key(|c| std::cmp::Reverse(c.score));
    candidates.truncate(max_results);
    candidates
}

/// Outgoing neighbors of `id` that are entity nodes.
fn entity_neighbors(graph: &GraphStore, id: &str) -> HashSet<String> {
    graph
        .successors(id)
        .filter(|n| graph.node(n).is_some_and(|node| !node.is_event()))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keywords_filter_stopwords_and_short_words() {
        let keywords = extract_keywords("The launch of the Apollo project was delayed by API bugs");
        assert!(keywords.contains(&"launch".to_string()));
        assert!(keywords.contains(&"apollo".to_string()));
        assert!(keywords.contains(&"project".to_string()));
        assert!(keywords.contains(&"delayed".to_string()));
        // stopwords and short tokens dropped
        assert!(!keywords.contains(&"the".to_string()));
        assert!(!keywords.contains(&"was".to_string()));
        assert!(!keywords.contains(&"api".to_string()));
    }

    #[test]
    fn keywords_deduplicate_and_cap_at_fifteen() {
        let text = "apollo apollo apollo ".repeat(10)
            + "alpha bravo charlie delta echo foxtrot golf hotel india juliett kilo lima mike november oscar papa";
        let keywords = extract_keywords(&text);
        assert_eq!(keywords.len(), 15);
        assert_eq!(keywords[0], "apollo");
        assert_eq!(keywords.iter().filter(|k| *k == "apollo").count(), 1);
    }
}
