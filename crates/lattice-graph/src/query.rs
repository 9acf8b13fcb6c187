//! Read-only Cypher subset executed against the in-memory graph.
//!
//! Supported: one `MATCH` of a single node or a single hop, inline property
//! maps, `WHERE` comparisons (`=`, `<>`, `CONTAINS`, `STARTS WITH`,
//! `ENDS WITH`, optionally through `toLower`/`toUpper`) joined by `AND`,
//! `RETURN [DISTINCT]` of variables, properties and `type(r)` with aliases,
//! and `LIMIT`. Anything else is reported as a query execution error.

use std::collections::{BTreeMap, HashSet};

use serde_json::Value;
use uuid::Uuid;

use chumsky::prelude::*;

use lattice_core::cypher::{digits, format_errors, ident, kw, number, string_literal, Extra};
use lattice_core::entity::{GraphEdge, GraphNode, SourcedValue};
use lattice_core::error::{LatticeError, Result};
use lattice_core::graph::ResultRow;

/// Label every entity node carries.
pub(crate) const ENTITY_LABEL: &str = "__Entity__";

#[derive(Debug, Clone)]
struct NodePattern {
    var: Option<String>,
    labels: Vec<String>,
    props: Vec<(String, Value)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Out,
    In,
    Both,
}

#[derive(Debug, Clone)]
struct RelPattern {
    var: Option<String>,
    types: Vec<String>,
    props: Vec<(String, Value)>,
    direction: Direction,
}

#[derive(Debug, Clone)]
enum Operand {
    Property(String, String),
    Literal(Value),
    Lower(Box<Operand>),
    Upper(Box<Operand>),
}

#[derive(Debug, Clone, Copy)]
enum Comparison {
    Eq,
    Ne,
    Contains,
    StartsWith,
    EndsWith,
}

#[derive(Debug, Clone)]
struct Condition {
    left: Operand,
    op: Comparison,
    right: Operand,
}

#[derive(Debug, Clone)]
enum Projection {
    Variable(String),
    Property(String, String),
    RelationType(String),
}

#[derive(Debug, Clone)]
struct ReturnItem {
    projection: Projection,
    column: String,
}

#[derive(Debug, Clone)]
struct MatchQuery {
    start: NodePattern,
    hop: Option<(RelPattern, NodePattern)>,
    conditions: Vec<Condition>,
    distinct: bool,
    items: Vec<ReturnItem>,
    limit: Option<usize>,
}

#[derive(Clone, Copy)]
enum Bound<'a> {
    Node(&'a GraphNode),
    Edge(&'a GraphEdge),
}

type Binding<'a> = BTreeMap<&'a str, Bound<'a>>;

fn unsupported(message: impl Into<String>) -> LatticeError {
    LatticeError::QueryExecution(message.into())
}

// ============================================================================
// Parsing
// ============================================================================

fn literal<'src>() -> impl Parser<'src, &'src str, Value, Extra<'src>> + Clone {
    let numeric = just('-')
        .or_not()
        .then(number())
        .map(|(sign, n)| number_value(if sign.is_some() { -n } else { n }));

    choice((
        string_literal().map(Value::String),
        numeric,
        kw("true").to(Value::Bool(true)),
        kw("false").to(Value::Bool(false)),
        kw("null").to(Value::Null),
    ))
    .padded()
    .labelled("literal value")
}

/// Inline property map: `{name: 'Acme', founded: 1999}`
fn property_map<'src>() -> impl Parser<'src, &'src str, Vec<(String, Value)>, Extra<'src>> + Clone {
    ident()
        .padded()
        .then_ignore(just(':'))
        .then(literal())
        .separated_by(just(',').padded())
        .collect::<Vec<_>>()
        .delimited_by(just('{').padded(), just('}').padded())
        .or_not()
        .map(Option::unwrap_or_default)
}

/// Node pattern: `(p:Person {name: 'Alice'})`
fn node_pattern<'src>() -> impl Parser<'src, &'src str, NodePattern, Extra<'src>> + Clone {
    let labels = just(':')
        .padded()
        .ignore_then(ident())
        .repeated()
        .collect::<Vec<_>>();

    ident()
        .padded()
        .or_not()
        .then(labels)
        .then(property_map())
        .delimited_by(just('(').padded(), just(')').padded())
        .map(|((var, labels), props)| NodePattern { var, labels, props })
        .labelled("node pattern like (p:Person)")
}

/// Relationship pattern: `-[r:FOUNDED]->`, `<-[:WORKS_FOR]-`, `-[]-` or `--`
fn rel_pattern<'src>() -> impl Parser<'src, &'src str, RelPattern, Extra<'src>> + Clone {
    let types = just(':')
        .padded()
        .ignore_then(
            ident()
                .separated_by(just('|').then(just(':').or_not()).padded())
                .at_least(1)
                .collect::<Vec<_>>(),
        )
        .or_not()
        .map(Option::unwrap_or_default);

    let detail = ident()
        .padded()
        .or_not()
        .then(types)
        .then(property_map())
        .delimited_by(just('['), just(']').labelled("]"))
        .or_not()
        .map(Option::unwrap_or_default);

    let incoming = just("<-")
        .ignore_then(detail.clone())
        .then_ignore(just('-'))
        .map(|d| (d, Direction::In));
    let outgoing = just('-')
        .ignore_then(detail.clone())
        .then_ignore(just("->"))
        .map(|d| (d, Direction::Out));
    let undirected = just('-')
        .ignore_then(detail)
        .then_ignore(just('-'))
        .map(|d| (d, Direction::Both));

    choice((incoming, outgoing, undirected))
        .padded()
        .map(|(((var, types), props), direction)| RelPattern {
            var,
            types,
            props,
            direction,
        })
        .labelled("relationship like -[:FOUNDED]->")
}

fn operand<'src>() -> impl Parser<'src, &'src str, Operand, Extra<'src>> + Clone {
    recursive(|operand| {
        let call = ident()
            .then(operand.delimited_by(just('(').padded(), just(')').padded()))
            .try_map(|(name, inner): (String, Operand), span| {
                match name.to_ascii_lowercase().as_str() {
                    "tolower" => Ok(Operand::Lower(Box::new(inner))),
                    "toupper" => Ok(Operand::Upper(Box::new(inner))),
                    _ => Err(Rich::custom(span, format!("function '{name}' is not supported"))),
                }
            });
        let property = ident()
            .then_ignore(just('.'))
            .then(ident())
            .map(|(var, key)| Operand::Property(var, key));

        choice((call, property, literal().map(Operand::Literal))).padded()
    })
}

fn condition<'src>() -> impl Parser<'src, &'src str, Condition, Extra<'src>> + Clone {
    let comparison = choice((
        just("<>").to(Comparison::Ne),
        just('=').to(Comparison::Eq),
        kw("CONTAINS").to(Comparison::Contains),
        kw("STARTS").then(kw("WITH")).to(Comparison::StartsWith),
        kw("ENDS").then(kw("WITH")).to(Comparison::EndsWith),
    ))
    .padded()
    .labelled("comparison");

    operand()
        .then(comparison)
        .then(operand())
        .map(|((left, op), right)| Condition { left, op, right })
}

fn return_item<'src>() -> impl Parser<'src, &'src str, ReturnItem, Extra<'src>> + Clone {
    let type_of = kw("type")
        .ignore_then(ident().padded().delimited_by(just('('), just(')')))
        .map(|var| {
            let column = format!("type({var})");
            (Projection::RelationType(var), column)
        });
    let property = ident()
        .then_ignore(just('.'))
        .then(ident())
        .map(|(var, key)| {
            let column = format!("{var}.{key}");
            (Projection::Property(var, key), column)
        });
    let variable = ident().map(|var| (Projection::Variable(var.clone()), var));

    choice((type_of, property, variable))
        .padded()
        .then(kw("AS").ignore_then(ident().padded()).or_not())
        .map(|((projection, default_column), alias)| ReturnItem {
            projection,
            column: alias.unwrap_or(default_column),
        })
}

/// `MATCH pattern [WHERE cond AND ...] RETURN [DISTINCT] items [LIMIT n]`
fn match_query<'src>() -> impl Parser<'src, &'src str, MatchQuery, Extra<'src>> {
    let hop = rel_pattern().then(node_pattern()).or_not();
    let conditions = kw("WHERE")
        .ignore_then(condition().separated_by(kw("AND")).at_least(1).collect::<Vec<_>>())
        .or_not()
        .map(Option::unwrap_or_default);
    let items = return_item()
        .separated_by(just(',').padded())
        .at_least(1)
        .collect::<Vec<_>>();
    let limit = kw("LIMIT")
        .ignore_then(digits().padded())
        .try_map(|n: &str, span| {
            n.parse::<usize>()
                .map_err(|_| Rich::custom(span, "LIMIT is out of range"))
        })
        .or_not();

    kw("MATCH")
        .ignore_then(node_pattern())
        .then(hop)
        .then(conditions)
        .then_ignore(kw("RETURN"))
        .then(kw("DISTINCT").or_not().map(|d| d.is_some()))
        .then(items)
        .then(limit)
        .then_ignore(just(';').padded().or_not())
        .then_ignore(end())
        .map(
            |(((((start, hop), conditions), distinct), items), limit)| MatchQuery {
                start,
                hop,
                conditions,
                distinct,
                items,
                limit,
            },
        )
}

fn parse(text: &str) -> Result<MatchQuery> {
    match_query()
        .parse(text)
        .into_result()
        .map_err(|errs| unsupported(format_errors(&errs, text)))
}

fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

// ============================================================================
// Evaluation
// ============================================================================

fn json_string<T: serde::Serialize>(value: &T) -> Value {
    Value::String(serde_json::to_string(value).unwrap_or_default())
}

fn plain(properties: &BTreeMap<String, SourcedValue>) -> BTreeMap<&str, Value> {
    properties
        .iter()
        .map(|(k, v)| (k.as_str(), v.value.to_json()))
        .collect()
}

/// Property as exposed to queries; matches the Neo4j node layout.
pub(crate) fn node_property(node: &GraphNode, key: &str) -> Value {
    match key {
        "id" => Value::String(node.id.to_string()),
        "name" => Value::String(node.canonical_label.clone()),
        "entity_type" => Value::String(node.node_type.clone()),
        "canonical_key" => Value::String(node.canonical_key.clone()),
        "properties" => json_string(&plain(&node.properties)),
        "provenance" => json_string(&node.provenance),
        _ => Value::Null,
    }
}

fn edge_property(edge: &GraphEdge, key: &str) -> Value {
    match key {
        "id" => Value::String(edge.id.to_string()),
        "properties" => json_string(&plain(&edge.properties)),
        "provenance" => json_string(&edge.provenance),
        _ => Value::Null,
    }
}

fn node_value(node: &GraphNode) -> Value {
    let mut map = serde_json::Map::new();
    for key in ["id", "name", "entity_type", "canonical_key", "properties", "provenance"] {
        map.insert(key.to_string(), node_property(node, key));
    }
    Value::Object(map)
}

fn edge_value(edge: &GraphEdge) -> Value {
    let mut map = serde_json::Map::new();
    for key in ["id", "properties", "provenance"] {
        map.insert(key.to_string(), edge_property(edge, key));
    }
    map.insert("type".into(), Value::String(edge.relation_type.clone()));
    Value::Object(map)
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn node_matches(node: &GraphNode, pattern: &NodePattern) -> bool {
    pattern
        .labels
        .iter()
        .all(|l| l == ENTITY_LABEL || *l == node.node_type)
        && pattern
            .props
            .iter()
            .all(|(k, v)| values_equal(&node_property(node, k), v))
}

fn edge_matches(edge: &GraphEdge, pattern: &RelPattern) -> bool {
    (pattern.types.is_empty() || pattern.types.iter().any(|t| *t == edge.relation_type))
        && pattern
            .props
            .iter()
            .all(|(k, v)| values_equal(&edge_property(edge, k), v))
}

fn resolve(binding: &Binding<'_>, operand: &Operand) -> Result<Value> {
    match operand {
        Operand::Literal(v) => Ok(v.clone()),
        Operand::Property(var, key) => match binding.get(var.as_str()) {
            Some(Bound::Node(n)) => Ok(node_property(n, key)),
            Some(Bound::Edge(e)) => Ok(edge_property(e, key)),
            None => Err(unsupported(format!("variable '{var}' is not defined"))),
        },
        Operand::Lower(inner) => Ok(match resolve(binding, inner)? {
            Value::String(s) => Value::String(s.to_lowercase()),
            other => other,
        }),
        Operand::Upper(inner) => Ok(match resolve(binding, inner)? {
            Value::String(s) => Value::String(s.to_uppercase()),
            other => other,
        }),
    }
}

fn holds(binding: &Binding<'_>, condition: &Condition) -> Result<bool> {
    let left = resolve(binding, &condition.left)?;
    let right = resolve(binding, &condition.right)?;
    if left.is_null() || right.is_null() {
        return Ok(false);
    }
    Ok(match condition.op {
        Comparison::Eq => values_equal(&left, &right),
        Comparison::Ne => !values_equal(&left, &right),
        Comparison::Contains | Comparison::StartsWith | Comparison::EndsWith => {
            match (left.as_str(), right.as_str()) {
                (Some(l), Some(r)) => match condition.op {
                    Comparison::Contains => l.contains(r),
                    Comparison::StartsWith => l.starts_with(r),
                    _ => l.ends_with(r),
                },
                _ => false,
            }
        }
    })
}

fn project(binding: &Binding<'_>, item: &ReturnItem) -> Result<Value> {
    match &item.projection {
        Projection::Variable(var) => match binding.get(var.as_str()) {
            Some(Bound::Node(n)) => Ok(node_value(n)),
            Some(Bound::Edge(e)) => Ok(edge_value(e)),
            None => Err(unsupported(format!("variable '{var}' is not defined"))),
        },
        Projection::Property(var, key) => {
            resolve(binding, &Operand::Property(var.clone(), key.clone()))
        }
        Projection::RelationType(var) => match binding.get(var.as_str()) {
            Some(Bound::Edge(e)) => Ok(Value::String(e.relation_type.clone())),
            Some(Bound::Node(_)) => Err(unsupported(format!("type() needs a relationship, '{var}' is a node"))),
            None => Err(unsupported(format!("variable '{var}' is not defined"))),
        },
    }
}

fn bind<'a>(binding: &mut Binding<'a>, var: &'a Option<String>, value: Bound<'a>) {
    if let Some(name) = var {
        binding.insert(name.as_str(), value);
    }
}

fn bindings<'a>(
    query: &'a MatchQuery,
    nodes: &'a BTreeMap<Uuid, GraphNode>,
    edges: &'a BTreeMap<Uuid, GraphEdge>,
) -> Vec<Binding<'a>> {
    let mut out = Vec::new();
    let Some((rel, end)) = &query.hop else {
        for node in nodes.values().filter(|n| node_matches(n, &query.start)) {
            let mut binding = Binding::new();
            bind(&mut binding, &query.start.var, Bound::Node(node));
            out.push(binding);
        }
        return out;
    };

    for edge in edges.values().filter(|e| edge_matches(e, rel)) {
        let (Some(source), Some(target)) = (nodes.get(&edge.source_node_id), nodes.get(&edge.target_node_id)) else {
            continue;
        };
        let mut orientations = Vec::with_capacity(2);
        match rel.direction {
            Direction::Out => orientations.push((source, target)),
            Direction::In => orientations.push((target, source)),
            Direction::Both => {
                orientations.push((source, target));
                if source.id != target.id {
                    orientations.push((target, source));
                }
            }
        }
        for (left, right) in orientations {
            if !node_matches(left, &query.start) || !node_matches(right, end) {
                continue;
            }
            let mut binding = Binding::new();
            bind(&mut binding, &query.start.var, Bound::Node(left));
            bind(&mut binding, &rel.var, Bound::Edge(edge));
            bind(&mut binding, &end.var, Bound::Node(right));
            out.push(binding);
        }
    }
    out
}

fn operand_vars<'a>(operand: &'a Operand, out: &mut Vec<&'a str>) {
    match operand {
        Operand::Property(var, _) => out.push(var),
        Operand::Lower(inner) | Operand::Upper(inner) => operand_vars(inner, out),
        Operand::Literal(_) => {}
    }
}

/// Every referenced variable must come from the pattern, and `type()` only
/// applies to the relationship variable.
fn check_variables(query: &MatchQuery) -> Result<()> {
    let rel_var = query.hop.as_ref().and_then(|(rel, _)| rel.var.as_deref());
    let defined: Vec<&str> = [
        query.start.var.as_deref(),
        rel_var,
        query.hop.as_ref().and_then(|(_, end)| end.var.as_deref()),
    ]
    .into_iter()
    .flatten()
    .collect();

    let mut used = Vec::new();
    for condition in &query.conditions {
        operand_vars(&condition.left, &mut used);
        operand_vars(&condition.right, &mut used);
    }
    for item in &query.items {
        match &item.projection {
            Projection::Variable(var) | Projection::Property(var, _) => used.push(var),
            Projection::RelationType(var) => {
                if rel_var != Some(var.as_str()) {
                    return Err(unsupported(format!("type() needs a relationship variable, got '{var}'")));
                }
            }
        }
    }
    match used.into_iter().find(|var| !defined.contains(var)) {
        Some(var) => Err(unsupported(format!("variable '{var}' is not defined"))),
        None => Ok(()),
    }
}

/// Run `text` against the given nodes and edges.
pub(crate) fn execute(
    text: &str,
    nodes: &BTreeMap<Uuid, GraphNode>,
    edges: &BTreeMap<Uuid, GraphEdge>,
) -> Result<Vec<ResultRow>> {
    let query = parse(text)?;
    check_variables(&query)?;

    let mut rows = Vec::new();
    let mut seen = HashSet::new();
    for binding in bindings(&query, nodes, edges) {
        let mut keep = true;
        for condition in &query.conditions {
            if !holds(&binding, condition)? {
                keep = false;
                break;
            }
        }
        if !keep {
            continue;
        }

        let mut row = ResultRow::new();
        for item in &query.items {
            row = row.with(item.column.clone(), project(&binding, item)?);
        }
        if query.distinct && !seen.insert(serde_json::to_string(&row).unwrap_or_default()) {
            continue;
        }
        rows.push(row);
        if query.limit.is_some_and(|limit| rows.len() >= limit) {
            break;
        }
    }

    if query.limit == Some(0) {
        rows.clear();
    }
    Ok(rows)
}
