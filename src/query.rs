//! Pull-based query service.
//!
//! Given free text, extracts search terms (Oracle first, rule-based
//! fallback), searches the graph, expands the top hits one hop for
//! context, and asks the Oracle to synthesize a grounded answer. Always
//! returns some text — internal failures degrade to an honest "nothing
//! found" style message, never an error.

use std::sync::{Arc, PoisonError, RwLock};

use serde::Deserialize;
use tracing::{debug, info};

use crate::config::QueryConfig;
use crate::graph::{GraphStore, Node};
use crate::oracle::{strip_code_fences, Oracle};
use crate::retrieval::{get_traversal, search_nodes, Traversal};

const SYNTHESIS_SYSTEM_PROMPT: &str = "You are an assistant with access to the user's \
    personal knowledge graph. Answer the user's question using ONLY the provided context. \
    If the answer is not in the context, say you don't know based on current memories. \
    Cite specific events or entities when possible.";

const QUERY_STOPWORDS: &[&str] = &[
    "what", "where", "when", "who", "why", "how", "is", "are", "the", "a", "an", "in", "on",
    "at", "for", "to", "of", "about",
];

pub struct QueryService {
    graph: Arc<RwLock<GraphStore>>,
    oracle: Arc<dyn Oracle>,
    config: QueryConfig,
}

impl QueryService {
    pub fn new(graph: Arc<RwLock<GraphStore>>, oracle: Arc<dyn Oracle>, config: QueryConfig) -> Self {
        Self {
            graph,
            oracle,
            config,
        }
    }

    /// Answer a free-form question from the graph. Synchronous from the
    /// caller's point of view; may take several seconds (Oracle-bound).
    pub async fn query(&self, user_query: &str) -> String {
        let terms = self.extract_search_terms(user_query).await;
        debug!(?terms, "extracted search terms");
        if terms.is_empty() {
            return "I couldn't identify specific topics to search for in your memory.".into();
        }

        let subgraph = {
            let graph = self.graph.read().unwrap_or_else(PoisonError::into_inner);
            let hits = search_nodes(&graph, &terms);
            if hits.is_empty() {
                return format!(
                    "I couldn't find any information about {} in your graph.",
                    terms.join(", ")
                );
            }
            let seeds: Vec<String> = hits
                .iter()
                .take(self.config.max_seeds)
                .map(|h| h.id.clone())
                .collect();
            get_traversal(&graph, &seeds, self.config.traversal_depth)
        };
        info!(
            nodes = subgraph.nodes.len(),
            edges = subgraph.edges.len(),
            "retrieved context subgraph"
        );

        let context = format_context(&subgraph);
        let prompt = format!("User query: {user_query}\n\n{context}\n\nAnswer:");
        self.oracle
            .generate(&prompt, Some(SYNTHESIS_SYSTEM_PROMPT), false)
            .await
    }

    /// Oracle-based term extraction with a rule-based fallback, so a dead
    /// Oracle still lets keyword search run.
    async fn extract_search_terms(&self, query: &str) -> Vec<String> {
        #[derive(Deserialize, Default)]
        #[serde(default)]
        struct Terms {
            terms: Vec<serde_json::Value>,
        }

        let prompt = format!(
            "Analyze this query and extract key search terms.\n\
             Query: \"{query}\"\n\n\
             Return a JSON object with a single key \"terms\" containing a list \
             of strings. Extract people, projects, technologies, key concepts. \
             Split compound terms.\n\n\
             Example: {{\"terms\": [\"Marcus Johnson\", \"launch\", \"delay\", \"API\"]}}\n\
             JSON ONLY. NO MARKDOWN. NO TEXT."
        );
        let response = self.oracle.generate(&prompt, None, true).await;
        let terms: Vec<String> = serde_json::from_str::<Terms>(strip_code_fences(&response))
            .map(|t| {
                t.terms
                    .into_iter()
                    .filter_map(|v| v.as_str().map(str::trim).map(str::to_string))
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        if !terms.is_empty() {
            return terms;
        }
        debug!("oracle term extraction failed, using rule-based fallback");
        fallback_terms(query)
    }
}

/// Rule-based extraction: strip punctuation and stopwords, keep words that
/// are capitalized (likely names) or longer than three characters.
fn fallback_terms(query: &str) -> Vec<String> {
    query
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
        .filter(|w| !w.is_empty())
        .filter(|w| !QUERY_STOPWORDS.contains(&w.to_lowercase().as_str()))
        .filter(|w| w.len() > 3 || w.chars().next().is_some_and(char::is_uppercase))
        .map(str::to_string)
        .collect()
}

/// Render the subgraph as readable context for the synthesis prompt:
/// a node listing followed by relationship lines.
fn format_context(subgraph: &Traversal) -> String {
    let display_name = |id: &str| -> String {
        match subgraph.nodes.get(id) {
            Some(Node::Entity(n)) => n.name.clone(),
            Some(Node::Event(n)) => n
                .primary_entity
                .clone()
                .unwrap_or_else(|| id.to_string()),
            None => id.to_string(),
        }
    };

    let mut context = String::from("### KNOWLEDGE GRAPH CONTEXT ###\n\n[ENTITIES & EVENTS]\n");
    for (id, node) in &subgraph.nodes {
        match node {
            Node::Entity(n) => {
                context.push_str(&format!("- ENTITY [{id}]: {} ({})\n", n.name, n.label));
            }
            Node::Event(n) => {
                let name = n.primary_entity.as_deref().unwrap_or(id);
                let details = n
                    .summary
                    .clone()
                    .unwrap_or_else(|| format!("Timestamp: {}", n.timestamp));
                context.push_str(&format!("- EVENT [{id}]: {name} | {details}\n"));
            }
        }
    }

    context.push_str("\n[RELATIONSHIPS]\n");
    for edge in &subgraph.edges {
        context.push_str(&format!(
            "- {} --[{}]--> {}\n",
            display_name(&edge.source),
            edge.relation,
            display_name(&edge.target)
        ));
    }
    context
}
