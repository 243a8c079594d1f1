//! `schema`, `cypher` and `query`: graph store inspection

use anyhow::Context;
use serde_json::json;

use crate::backends::{GraphClient, Params, Row, ValidatedStatement};

pub async fn schema(graph: &GraphClient) -> anyhow::Result<String> {
    let schema = graph.schema().await?;
    Ok(serde_json::to_string_pretty(&schema)?)
}

fn parse_params(raw: Option<&str>) -> anyhow::Result<Params> {
    match raw {
        Some(raw) => serde_json::from_str(raw)
            .with_context(|| format!("Params must be a JSON object: {}", raw)),
        None => Ok(Params::new()),
    }
}

fn render(validated: ValidatedStatement, rows: Vec<Row>) -> anyhow::Result<String> {
    Ok(serde_json::to_string_pretty(&json!({
        "statement": validated.statement,
        "warnings": validated.warnings,
        "rows": rows,
    }))?)
}

/// Run an ad-hoc read statement with JSON parameters
pub async fn cypher(graph: &GraphClient, statement: &str, params: Option<&str>) -> anyhow::Result<String> {
    let params = parse_params(params)?;
    let (validated, rows) = graph.query(statement, &params).await?;
    render(validated, rows)
}

/// Run a configured query by name, or list the configured queries when no
/// name is given
pub async fn named(graph: &GraphClient, name: Option<&str>, params: Option<&str>) -> anyhow::Result<String> {
    let Some(name) = name else {
        let listing: Vec<_> = graph
            .named_queries()
            .iter()
            .map(|(name, query)| {
                json!({
                    "name": name,
                    "description": query.description,
                    "parameters": query.parameters,
                })
            })
            .collect();
        return Ok(serde_json::to_string_pretty(&listing)?);
    };

    let params = parse_params(params)?;
    let (validated, rows) = graph.run_named(name, &params).await?;
    render(validated, rows)
}
