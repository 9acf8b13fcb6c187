//! Identity resolution and property merging shared by every store.
//!
//! A value proposed by an earlier chunk beats one from a later chunk (chunk
//! ids sort in reading order); ties between chunks fall back to value order.
//! Each losing value is recorded once, against the earliest chunk that
//! proposed it. The resulting graph is the same whatever order chunks are
//! merged in, and merging a chunk twice changes nothing.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use lattice_core::entity::{
    edge_id_for, node_id_for_key, normalize_relation_type, ChunkExtraction, ExtractedEdge,
    ExtractedNode, GraphEdge, GraphNode, MergeConflict, NodeRef, Properties, PropertyValue,
    SourcedValue,
};
use lattice_core::error::{LatticeError, Result};
use lattice_core::graph::UpsertResult;

/// Conflict name for competing label spellings.
pub const LABEL_PROPERTY: &str = "@label";
/// Conflict name for competing type spellings.
pub const TYPE_PROPERTY: &str = "@type";

fn tidy(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn as_text(value: PropertyValue) -> String {
    match value {
        PropertyValue::String(s) => s,
        other => other.to_string(),
    }
}

fn take_conflict(
    conflicts: &mut BTreeSet<MergeConflict>,
    property: &str,
    value: &PropertyValue,
) -> Option<Uuid> {
    let found = conflicts
        .iter()
        .find(|c| c.property == property && &c.rejected == value)
        .cloned()?;
    conflicts.remove(&found);
    Some(found.chunk_id)
}

fn record_conflict(
    conflicts: &mut BTreeSet<MergeConflict>,
    property: &str,
    rejected: PropertyValue,
    chunk_id: Uuid,
) {
    let chunk_id = match take_conflict(conflicts, property, &rejected) {
        Some(previous) => previous.min(chunk_id),
        None => chunk_id,
    };
    conflicts.insert(MergeConflict {
        property: property.to_string(),
        rejected,
        chunk_id,
    });
}

fn merge_value(
    current: &mut SourcedValue,
    conflicts: &mut BTreeSet<MergeConflict>,
    property: &str,
    incoming: SourcedValue,
) {
    if incoming.value == current.value {
        current.chunk_id = current.chunk_id.min(incoming.chunk_id);
        return;
    }
    if (incoming.chunk_id, &incoming.value) < (current.chunk_id, &current.value) {
        let mut winner = incoming;
        if let Some(previous) = take_conflict(conflicts, property, &winner.value) {
            winner.chunk_id = winner.chunk_id.min(previous);
        }
        let loser = std::mem::replace(current, winner);
        record_conflict(conflicts, property, loser.value, loser.chunk_id);
    } else {
        record_conflict(conflicts, property, incoming.value, incoming.chunk_id);
    }
}

fn merge_properties(
    target: &mut BTreeMap<String, SourcedValue>,
    conflicts: &mut BTreeSet<MergeConflict>,
    incoming: &Properties,
    chunk_id: Uuid,
) {
    for (key, value) in incoming {
        let sourced = SourcedValue {
            value: value.clone(),
            chunk_id,
        };
        match target.get_mut(key) {
            Some(current) => merge_value(current, conflicts, key, sourced),
            None => {
                target.insert(key.clone(), sourced);
            }
        }
    }
}

fn sourced(properties: &Properties, chunk_id: Uuid) -> BTreeMap<String, SourcedValue> {
    properties
        .iter()
        .map(|(k, v)| {
            (
                k.clone(),
                SourcedValue {
                    value: v.clone(),
                    chunk_id,
                },
            )
        })
        .collect()
}

/// Merge one extracted node into the stored node with the same key.
/// Returns the merged node and whether it was newly created.
pub fn merge_node(existing: Option<GraphNode>, incoming: &ExtractedNode) -> Result<(GraphNode, bool)> {
    let label = tidy(&incoming.label);
    let node_type = tidy(&incoming.node_type);
    if label.is_empty() || node_type.is_empty() {
        return Err(LatticeError::Graph(format!(
            "node with empty label or type from chunk {}",
            incoming.source_chunk_id
        )));
    }
    let chunk_id = incoming.source_chunk_id;

    let Some(mut node) = existing else {
        let canonical_key = incoming.canonical_key();
        return Ok((
            GraphNode {
                id: node_id_for_key(&canonical_key),
                canonical_key,
                node_type,
                canonical_label: label,
                origin_chunk_id: chunk_id,
                properties: sourced(&incoming.properties, chunk_id),
                provenance: BTreeSet::from([chunk_id]),
                conflicts: BTreeSet::new(),
            },
            true,
        ));
    };

    let origin = node.origin_chunk_id;
    let mut stored_label = SourcedValue {
        value: PropertyValue::String(std::mem::take(&mut node.canonical_label)),
        chunk_id: origin,
    };
    merge_value(
        &mut stored_label,
        &mut node.conflicts,
        LABEL_PROPERTY,
        SourcedValue {
            value: PropertyValue::String(label),
            chunk_id,
        },
    );
    let mut stored_type = SourcedValue {
        value: PropertyValue::String(std::mem::take(&mut node.node_type)),
        chunk_id: origin,
    };
    merge_value(
        &mut stored_type,
        &mut node.conflicts,
        TYPE_PROPERTY,
        SourcedValue {
            value: PropertyValue::String(node_type),
            chunk_id,
        },
    );
    node.canonical_label = as_text(stored_label.value);
    node.node_type = as_text(stored_type.value);
    node.origin_chunk_id = origin.min(chunk_id);

    merge_properties(&mut node.properties, &mut node.conflicts, &incoming.properties, chunk_id);
    node.provenance.insert(chunk_id);
    Ok((node, false))
}

/// Merge one extracted edge into the stored edge keyed by
/// `(source, relation_type, target)`.
pub fn merge_edge(
    existing: Option<GraphEdge>,
    source_node_id: Uuid,
    target_node_id: Uuid,
    relation_type: &str,
    incoming: &ExtractedEdge,
) -> (GraphEdge, bool) {
    let chunk_id = incoming.source_chunk_id;
    match existing {
        Some(mut edge) => {
            merge_properties(&mut edge.properties, &mut edge.conflicts, &incoming.properties, chunk_id);
            edge.provenance.insert(chunk_id);
            (edge, false)
        }
        None => (
            GraphEdge {
                id: edge_id_for(source_node_id, relation_type, target_node_id),
                source_node_id,
                target_node_id,
                relation_type: relation_type.to_string(),
                properties: sourced(&incoming.properties, chunk_id),
                provenance: BTreeSet::from([chunk_id]),
                conflicts: BTreeSet::new(),
            },
            true,
        ),
    }
}

/// Storage seen from inside one atomic unit of work.
#[async_trait]
pub trait MergeTarget: Send {
    async fn load_node(&mut self, id: Uuid) -> Result<Option<GraphNode>>;

    /// `previous_type` is the stored type before this merge, if any.
    async fn save_node(&mut self, node: &GraphNode, previous_type: Option<&str>) -> Result<()>;

    async fn load_edge(&mut self, id: Uuid) -> Result<Option<GraphEdge>>;

    async fn save_edge(&mut self, edge: &GraphEdge) -> Result<()>;
}

/// Apply a chunk's extraction: nodes first, then edges with their endpoints.
/// Any error leaves the caller to discard the unit of work.
pub async fn apply_extraction<T>(target: &mut T, extraction: &ChunkExtraction) -> Result<UpsertResult>
where
    T: MergeTarget + ?Sized,
{
    let mut result = UpsertResult {
        nodes_dropped: extraction.nodes_dropped(),
        edges_dropped: extraction.edges_dropped(),
        ..Default::default()
    };

    for node in &extraction.nodes {
        let id = node_id_for_key(&node.canonical_key());
        let previous = target.load_node(id).await?;
        let previous_type = previous.as_ref().map(|n| n.node_type.clone());
        let (merged, created) = merge_node(previous, node)?;
        target.save_node(&merged, previous_type.as_deref()).await?;
        if created {
            result.nodes_created += 1;
        } else {
            result.nodes_merged += 1;
        }
    }

    for edge in &extraction.edges {
        let relation_type = normalize_relation_type(&edge.relation_type);
        if relation_type.is_empty() {
            return Err(LatticeError::Graph(format!(
                "edge with empty relation type from chunk {}",
                edge.source_chunk_id
            )));
        }
        let source_id = resolve_endpoint(target, &edge.source, edge.source_chunk_id, &mut result).await?;
        let target_id = resolve_endpoint(target, &edge.target, edge.source_chunk_id, &mut result).await?;

        let id = edge_id_for(source_id, &relation_type, target_id);
        let existing = target.load_edge(id).await?;
        let (merged, created) = merge_edge(existing, source_id, target_id, &relation_type, edge);
        target.save_edge(&merged).await?;
        if created {
            result.edges_created += 1;
        } else {
            result.edges_merged += 1;
        }
    }

    debug!(
        chunk_id = %extraction.chunk_id,
        nodes_created = result.nodes_created,
        nodes_merged = result.nodes_merged,
        edges_created = result.edges_created,
        edges_merged = result.edges_merged,
        "Applied chunk extraction"
    );
    Ok(result)
}

/// Endpoint id for an edge. The reference merges into the node like any other
/// mention, so its chunk joins the provenance and its spelling competes.
async fn resolve_endpoint<T>(
    target: &mut T,
    node_ref: &NodeRef,
    chunk_id: Uuid,
    result: &mut UpsertResult,
) -> Result<Uuid>
where
    T: MergeTarget + ?Sized,
{
    let id = node_id_for_key(&node_ref.canonical_key());
    let previous = target.load_node(id).await?;
    let previous_type = previous.as_ref().map(|n| n.node_type.clone());
    let mention = ExtractedNode::new(node_ref.label.clone(), node_ref.node_type.clone(), chunk_id);
    let (node, created) = merge_node(previous, &mention)?;
    target.save_node(&node, previous_type.as_deref()).await?;
    if created {
        result.nodes_created += 1;
    }
    Ok(id)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn chunk(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    fn fold(nodes: &[ExtractedNode]) -> GraphNode {
        let mut acc = None;
        for node in nodes {
            acc = Some(merge_node(acc, node).unwrap().0);
        }
        acc.unwrap()
    }

    #[test]
    fn first_write_wins_by_chunk_order() {
        let early = ExtractedNode::new("Acme", "Organization", chunk(1)).with_property("city", "Paris");
        let late = ExtractedNode::new("Acme", "Organization", chunk(2)).with_property("city", "Berlin");

        let node = fold(&[late.clone(), early.clone()]);
        assert_eq!(node.properties["city"].value, PropertyValue::from("Paris"));
        assert_eq!(node.properties["city"].chunk_id, chunk(1));
        assert_eq!(
            node.conflicts.iter().collect::<Vec<_>>(),
            vec![&MergeConflict {
                property: "city".into(),
                rejected: PropertyValue::from("Berlin"),
                chunk_id: chunk(2),
            }]
        );
        assert_eq!(node, fold(&[early, late]));
    }

    #[test]
    fn spelling_variants_merge_and_record_conflicts() {
        let a = ExtractedNode::new("Acme  Corp", "Organization", chunk(1));
        let b = ExtractedNode::new("ACME corp", "organization", chunk(2));
        let node = fold(&[b, a]);

        assert_eq!(node.canonical_label, "Acme Corp");
        assert_eq!(node.node_type, "Organization");
        assert_eq!(node.origin_chunk_id, chunk(1));
        assert!(node.conflicts.iter().any(|c| c.property == TYPE_PROPERTY
            && c.rejected == PropertyValue::from("organization")));
        assert!(node.conflicts.iter().any(|c| c.property == LABEL_PROPERTY));
        assert_eq!(node.provenance.len(), 2);
    }

    #[test]
    fn new_properties_are_added_without_conflict() {
        let a = ExtractedNode::new("Alice", "Person", chunk(1)).with_property("age", 30.0);
        let b = ExtractedNode::new("Alice", "Person", chunk(2)).with_property("city", "Paris");
        let node = fold(&[a, b]);
        assert_eq!(node.properties.len(), 2);
        assert!(node.conflicts.is_empty());
    }

    #[test]
    fn empty_label_is_rejected() {
        let bad = ExtractedNode::new("  ", "Person", chunk(1));
        assert!(matches!(merge_node(None, &bad), Err(LatticeError::Graph(_))));
    }

    #[test]
    fn edges_union_provenance() {
        let src = ExtractedNode::new("Alice", "Person", chunk(1)).node_ref();
        let tgt = ExtractedNode::new("Acme", "Organization", chunk(1)).node_ref();
        let s = node_id_for_key(&src.canonical_key());
        let t = node_id_for_key(&tgt.canonical_key());
        let e1 = ExtractedEdge::new(src.clone(), tgt.clone(), "FOUNDED", chunk(1));
        let e2 = ExtractedEdge::new(src, tgt, "FOUNDED", chunk(2));

        let (edge, created) = merge_edge(None, s, t, "FOUNDED", &e1);
        assert!(created);
        let (edge, created) = merge_edge(Some(edge), s, t, "FOUNDED", &e2);
        assert!(!created);
        assert_eq!(edge.provenance.len(), 2);
        assert_eq!(edge.id, edge_id_for(s, "FOUNDED", t));
    }

    fn contribution() -> impl Strategy<Value = ExtractedNode> {
        (
            1u128..5,
            prop::sample::select(vec!["Acme", "ACME", "acme"]),
            prop::sample::select(vec!["Organization", "organization"]),
            prop::collection::btree_map(
                prop::sample::select(vec!["city", "founded", "size"]),
                prop::sample::select(vec!["Paris", "Berlin", "1999"]),
                0..3,
            ),
        )
            .prop_map(|(c, label, node_type, props)| {
                props
                    .into_iter()
                    .fold(ExtractedNode::new(label, node_type, chunk(c)), |n, (k, v)| {
                        n.with_property(k, v)
                    })
            })
    }

    proptest! {
        #[test]
        fn node_merge_is_commutative(
            (nodes, shuffled) in prop::collection::vec(contribution(), 1..8)
                .prop_flat_map(|v| (Just(v.clone()), Just(v).prop_shuffle()))
        ) {
            prop_assert_eq!(fold(&nodes), fold(&shuffled));
        }

        #[test]
        fn node_merge_is_idempotent(nodes in prop::collection::vec(contribution(), 1..6)) {
            let once = fold(&nodes);
            let twice: Vec<ExtractedNode> = nodes.iter().chain(nodes.iter()).cloned().collect();
            prop_assert_eq!(once, fold(&twice));
        }
    }
}
