//! Graph context expansion for extracted entity mentions.

use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::backends::graph::is_embedding_property;
use crate::backends::{GraphClient, Params, Row};
use crate::config::{Config, LookupRoute, MatchMode};
use crate::metrics;
use crate::models::{Connection, Direction, EntityMention, EntityMentions, GraphContextRecord};

const MATCH_CONTAINS: &str = "toLower(toString(n[prop])) CONTAINS toLower($term)";
const MATCH_EXACT: &str = "toLower(toString(n[prop])) = toLower($term)";

/// Lookup statement: first matching node plus up to `$max_conn` relationships
fn lookup_statement(mode: MatchMode) -> String {
    let predicate = match mode {
        MatchMode::Contains => MATCH_CONTAINS,
        MatchMode::Exact => MATCH_EXACT,
    };
    format!(
        "MATCH (n) \
         WHERE (size($labels) = 0 OR any(l IN labels(n) WHERE l IN $labels)) \
           AND any(prop IN $props WHERE n[prop] IS NOT NULL AND {predicate}) \
         WITH n LIMIT 1 \
         OPTIONAL MATCH (n)-[r]-(m) \
         WITH n, r, m LIMIT $max_conn \
         RETURN labels(n)[0] AS entity_type, \
                coalesce(n.name, n.title, n.id, $term) AS entity_name, \
                properties(n) AS data, \
                collect(CASE WHEN r IS NULL THEN NULL ELSE {{ \
                    relationship: type(r), \
                    outgoing: startNode(r) = n, \
                    related_entity: toString(coalesce(m.name, m.title, m.id, '')), \
                    related_type: coalesce(labels(m)[0], '') \
                }} END) AS connections"
    )
}

/// Result of one expansion pass
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GraphExpansion {
    pub records: Vec<GraphContextRecord>,
    /// Lookups issued
    pub lookups: usize,
    /// Lookups that failed and were skipped
    pub failures: usize,
    /// Mentions dropped by the lookup cap
    pub dropped: usize,
}

/// Expands entity mentions into graph neighborhood summaries
pub struct GraphExpander {
    graph: Arc<GraphClient>,
    routes: BTreeMap<String, LookupRoute>,
}

impl GraphExpander {
    pub fn new(graph: Arc<GraphClient>, config: &Config) -> Self {
        Self {
            graph,
            routes: config.graphrag.lookup_routes.clone(),
        }
    }

    fn route(&self, category: &str) -> LookupRoute {
        self.routes
            .get(category)
            .or_else(|| self.routes.get("default"))
            .cloned()
            .unwrap_or_default()
    }

    fn params(route: &LookupRoute, term: &str, max_connections: usize) -> Params {
        let mut params = Params::new();
        params.insert("labels".into(), json!(route.labels));
        params.insert("props".into(), json!(route.match_properties));
        params.insert("term".into(), json!(term));
        // LIMIT 0 would drop the node row itself; truncate afterwards instead
        params.insert("max_conn".into(), json!(max_connections.max(1)));
        params
    }

    /// Look up at most `max_lookups` mentions, each summarized with at most
    /// `max_connections` relationships. Misses and failures are skipped.
    pub async fn expand(
        &self,
        mentions: &EntityMentions,
        max_lookups: usize,
        max_connections: usize,
    ) -> GraphExpansion {
        let all = mentions.mentions();
        let dropped = all.len().saturating_sub(max_lookups);
        if dropped > 0 {
            debug!(dropped, max_lookups, "Entity mentions over lookup cap");
        }

        let mut expansion = GraphExpansion {
            dropped,
            ..Default::default()
        };

        for mention in all.into_iter().take(max_lookups) {
            expansion.lookups += 1;
            match self.lookup(&mention, max_connections).await {
                Ok(Some(record)) => {
                    metrics::record_lookup("hit");
                    let duplicate = expansion.records.iter().any(|r| {
                        r.entity_type == record.entity_type && r.entity_name == record.entity_name
                    });
                    if !duplicate {
                        expansion.records.push(record);
                    }
                }
                Ok(None) => {
                    metrics::record_lookup("miss");
                    debug!(category = %mention.category, pattern = %mention.pattern, "No graph node for mention");
                }
                Err(err) => {
                    metrics::record_lookup("error");
                    expansion.failures += 1;
                    warn!(
                        category = %mention.category,
                        pattern = %mention.pattern,
                        "Graph lookup failed, skipping: {}",
                        err
                    );
                }
            }
        }

        info!(
            lookups = expansion.lookups,
            records = expansion.records.len(),
            failures = expansion.failures,
            "Graph expansion complete"
        );
        expansion
    }

    async fn lookup(
        &self,
        mention: &EntityMention,
        max_connections: usize,
    ) -> Result<Option<GraphContextRecord>, crate::backends::BackendError> {
        let route = self.route(&mention.category);
        let statement = lookup_statement(route.match_mode);
        let params = Self::params(&route, &mention.pattern, max_connections);

        let rows = self.graph.run(&statement, &params).await?;
        Ok(rows
            .first()
            .and_then(|row| parse_record(row, &mention.category, max_connections)))
    }
}

fn value_to_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Build a record from a lookup row, dropping embedding properties
pub fn parse_record(row: &Row, category: &str, max_connections: usize) -> Option<GraphContextRecord> {
    let entity_name = value_to_string(row.get("entity_name"))?;
    let entity_type = value_to_string(row.get("entity_type")).unwrap_or_else(|| category.to_string());

    let data: Map<String, Value> = row
        .get("data")
        .and_then(Value::as_object)
        .map(|props| {
            props
                .iter()
                .filter(|(k, _)| !is_embedding_property(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })
        .unwrap_or_default();

    let connections = row
        .get("connections")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let relationship = value_to_string(item.get("relationship"))?;
                    let outgoing = item.get("outgoing").and_then(Value::as_bool).unwrap_or(true);
                    Some(Connection {
                        relationship,
                        direction: if outgoing {
                            Direction::Outgoing
                        } else {
                            Direction::Incoming
                        },
                        related_entity: value_to_string(item.get("related_entity")).unwrap_or_default(),
                        related_type: value_to_string(item.get("related_type")).unwrap_or_default(),
                    })
                })
                .take(max_connections)
                .collect()
        })
        .unwrap_or_default();

    Some(GraphContextRecord {
        entity_type,
        entity_name,
        data,
        connections,
    })
}
