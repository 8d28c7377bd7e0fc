//! Query planning.
//!
//! The planner reduces a query to the cheapest access path the map's
//! indexes support:
//!
//! 1. equality on the entry key -> point lookup (multi-point for `in`)
//! 2. a standing query index registered for this exact query
//! 3. a compound index fully covered by equality predicates
//! 4. a single-field index on any equality predicate, residual filtered
//! 5. full scan, residual filtered
//!
//! The residual filter is always applied by the executor; plans only
//! narrow the candidate key set, so an over-broad plan is a performance
//! bug, never a correctness bug.

use std::collections::BTreeMap;

use lattice_core::query::{PredicateOp, KEY_ATTRIBUTES};
use lattice_core::types::Value;
use lattice_core::{PredicateNode, Query};

use super::index::{IndexKey, MapIndexes};

/// Chosen access path.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryPlan {
    /// Fetch exactly these keys.
    PointLookup {
        /// Keys pinned by the filter.
        keys: Vec<String>,
    },
    /// Read the maintained result set of a standing query.
    StandingQuery {
        /// Fingerprint of the registered query.
        fingerprint: u64,
    },
    /// Probe a compound index with a full equality tuple.
    CompoundIndexScan {
        /// Index fields, in index order.
        fields: Vec<String>,
        /// Equality values, aligned with `fields`.
        values: Vec<IndexKey>,
    },
    /// Probe a single-field index, then filter residual predicates.
    IndexScan {
        /// Indexed field.
        field: String,
        /// Equality value probed.
        value: Value,
    },
    /// Walk every entry, filtering.
    FullScan,
}

impl QueryPlan {
    /// Relative cost estimate used for logging and plan assertions.
    #[must_use]
    pub fn cost(&self, map_len: usize) -> u64 {
        match self {
            QueryPlan::PointLookup { keys } => keys.len().max(1) as u64,
            QueryPlan::StandingQuery { .. } => 10,
            QueryPlan::CompoundIndexScan { .. } => 20,
            QueryPlan::IndexScan { .. } => 40,
            QueryPlan::FullScan => map_len.max(1) as u64,
        }
    }
}

/// Chooses the access path for a query against a map's indexes.
#[must_use]
pub fn plan(query: &Query, indexes: Option<&MapIndexes>) -> QueryPlan {
    if let Some(keys) = query.key_values() {
        return QueryPlan::PointLookup { keys };
    }

    let Some(indexes) = indexes else {
        return QueryPlan::FullScan;
    };

    let fingerprint = query.fingerprint();
    if indexes.has_standing(fingerprint) {
        return QueryPlan::StandingQuery { fingerprint };
    }

    let eq_fields = equality_fields(query);
    if !eq_fields.is_empty() {
        let field_names: Vec<&str> = eq_fields.keys().map(String::as_str).collect();
        if let Some(fields) = indexes.compound_covered_by(&field_names) {
            if let Some(values) = fields
                .iter()
                .map(|f| eq_fields.get(f).and_then(|v| IndexKey::from_value(v)))
                .collect::<Option<Vec<_>>>()
            {
                return QueryPlan::CompoundIndexScan {
                    fields: fields.clone(),
                    values,
                };
            }
        }

        for (field, value) in &eq_fields {
            if indexes.has_single(field) && IndexKey::from_value(value).is_some() {
                return QueryPlan::IndexScan {
                    field: field.clone(),
                    value: value.clone(),
                };
            }
        }
    }

    QueryPlan::FullScan
}

/// Field -> value for every equality constraint that must hold for all
/// matches: the `where` sugar plus `eq` leaves of a top-level `and` (or a
/// bare `eq` root). Disjunctions contribute nothing.
fn equality_fields(query: &Query) -> BTreeMap<String, Value> {
    let mut fields = BTreeMap::new();

    if let Some(clause) = &query.where_clause {
        for (field, value) in clause {
            if !KEY_ATTRIBUTES.contains(&field.as_str()) {
                fields.insert(field.clone(), value.clone());
            }
        }
    }

    if let Some(predicate) = &query.predicate {
        collect_eq_leaves(predicate, &mut fields);
    }
    fields
}

fn collect_eq_leaves(node: &PredicateNode, out: &mut BTreeMap<String, Value>) {
    match node.op {
        PredicateOp::Eq => {
            if let (Some(attribute), Some(value)) = (&node.attribute, &node.value) {
                if !KEY_ATTRIBUTES.contains(&attribute.as_str()) {
                    out.insert(attribute.clone(), value.clone());
                }
            }
        }
        PredicateOp::And => {
            for child in node.children.as_deref().unwrap_or_default() {
                collect_eq_leaves(child, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use lattice_core::query::PredicateOp;

    use super::super::index::IndexSpec;
    use super::*;

    fn indexed() -> MapIndexes {
        MapIndexes::new(&IndexSpec {
            single: vec!["status".to_string(), "age".to_string()],
            compound: vec![vec!["country".to_string(), "city".to_string()]],
        })
    }

    fn eq(field: &str, value: &str) -> PredicateNode {
        PredicateNode::eq(field, Value::String(value.to_string()))
    }

    #[test]
    fn key_equality_plans_point_lookup() {
        let query = Query {
            predicate: Some(eq("_key", "users/1")),
            ..Query::default()
        };
        let plan = plan(&query, Some(&indexed()));
        assert_eq!(
            plan,
            QueryPlan::PointLookup {
                keys: vec!["users/1".to_string()]
            }
        );
        assert_eq!(plan.cost(1_000_000), 1);
    }

    #[test]
    fn key_in_plans_multi_point_with_cost_n() {
        let query = Query {
            predicate: Some(PredicateNode::is_in(
                "id",
                vec![
                    Value::String("a".to_string()),
                    Value::String("b".to_string()),
                    Value::String("c".to_string()),
                ],
            )),
            ..Query::default()
        };
        let plan = plan(&query, Some(&indexed()));
        match &plan {
            QueryPlan::PointLookup { keys } => assert_eq!(keys.len(), 3),
            other => panic!("expected point lookup, got {other:?}"),
        }
        assert_eq!(plan.cost(1_000_000), 3);
    }

    #[test]
    fn point_lookup_beats_standing_query() {
        let mut indexes = indexed();
        let query = Query {
            predicate: Some(eq("_key", "users/1")),
            ..Query::default()
        };
        indexes.register_standing(query.clone());
        assert!(matches!(
            plan(&query, Some(&indexes)),
            QueryPlan::PointLookup { .. }
        ));
    }

    #[test]
    fn standing_query_chosen_for_registered_fingerprint() {
        let mut indexes = indexed();
        let query = Query {
            predicate: Some(eq("status", "active")),
            ..Query::default()
        };
        indexes.register_standing(query.clone());
        assert_eq!(
            plan(&query, Some(&indexes)),
            QueryPlan::StandingQuery {
                fingerprint: query.fingerprint()
            }
        );

        // A different predicate does not hit the standing index.
        let other = Query {
            predicate: Some(eq("status", "idle")),
            ..Query::default()
        };
        assert!(matches!(
            plan(&other, Some(&indexes)),
            QueryPlan::IndexScan { .. }
        ));
    }

    #[test]
    fn covered_and_of_eqs_uses_the_compound_index() {
        let query = Query {
            predicate: Some(PredicateNode::and(vec![
                eq("country", "NO"),
                eq("city", "Oslo"),
            ])),
            ..Query::default()
        };
        match plan(&query, Some(&indexed())) {
            QueryPlan::CompoundIndexScan { fields, values } => {
                assert_eq!(fields, vec!["country", "city"]);
                assert_eq!(values.len(), 2);
            }
            other => panic!("expected compound scan, got {other:?}"),
        }
    }

    #[test]
    fn partial_compound_coverage_falls_back_to_single_index() {
        let query = Query {
            predicate: Some(PredicateNode::and(vec![
                eq("country", "NO"),
                eq("status", "active"),
            ])),
            ..Query::default()
        };
        // No compound covers {country,status}; status has a single index.
        assert_eq!(
            plan(&query, Some(&indexed())),
            QueryPlan::IndexScan {
                field: "status".to_string(),
                value: Value::String("active".to_string()),
            }
        );
    }

    #[test]
    fn where_sugar_feeds_the_planner() {
        let query = Query {
            where_clause: Some(
                [(
                    "status".to_string(),
                    Value::String("active".to_string()),
                )]
                .into_iter()
                .collect(),
            ),
            ..Query::default()
        };
        assert!(matches!(
            plan(&query, Some(&indexed())),
            QueryPlan::IndexScan { .. }
        ));
    }

    #[test]
    fn unindexed_or_disjunctive_queries_full_scan() {
        let range = Query {
            predicate: Some(PredicateNode::leaf(
                PredicateOp::Gt,
                "age",
                Value::Int(18),
            )),
            ..Query::default()
        };
        assert_eq!(plan(&range, Some(&indexed())), QueryPlan::FullScan);

        let disjunction = Query {
            predicate: Some(PredicateNode::or(vec![
                eq("status", "active"),
                eq("status", "idle"),
            ])),
            ..Query::default()
        };
        assert_eq!(plan(&disjunction, Some(&indexed())), QueryPlan::FullScan);

        let no_indexes = Query {
            predicate: Some(eq("status", "active")),
            ..Query::default()
        };
        assert_eq!(plan(&no_indexes, None), QueryPlan::FullScan);
        assert_eq!(QueryPlan::FullScan.cost(500), 500);
    }
}
