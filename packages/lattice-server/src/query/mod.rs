//! Query execution.
//!
//! The engine snapshots the target map, narrows candidates through the
//! planner, filters residually on the tasklet scheduler (large scans
//! never monopolize the runtime), sorts stably with the entry key as the
//! final tie-break, and pages through an opaque cursor. A cursor from a
//! query with a different fingerprint is ignored and iteration restarts.

mod cursor;
mod index;
mod planner;

pub use cursor::{Cursor, Direction};
pub use index::{compound_tuple, IndexKey, IndexRegistry, IndexSpec, MapIndexes};
pub use planner::{plan, QueryPlan};

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use lattice_core::messages::{QueryResultPayload, QueryRow};
use lattice_core::query::{SortDirection, SortSpec};
use lattice_core::types::Value;
use lattice_core::Query;

use crate::config::QueryConfig;
use crate::error::ServerError;
use crate::maps::{MapRegistry, MapState};
use crate::scheduler::{ReduceTasklet, TaskletScheduler};

/// Executes queries against the map registry.
pub struct QueryEngine {
    maps: Arc<MapRegistry>,
    indexes: Arc<IndexRegistry>,
    scheduler: TaskletScheduler,
    config: QueryConfig,
}

impl QueryEngine {
    /// Creates an engine over the node's maps and indexes.
    #[must_use]
    pub fn new(
        maps: Arc<MapRegistry>,
        indexes: Arc<IndexRegistry>,
        scheduler: TaskletScheduler,
        config: QueryConfig,
    ) -> Self {
        Self {
            maps,
            indexes,
            scheduler,
            config,
        }
    }

    /// Runs one query page.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Cancelled`] when the filtering tasklet is
    /// cancelled (shutdown).
    pub async fn run(
        &self,
        query_id: &str,
        map_name: &str,
        query: &Query,
    ) -> Result<QueryResultPayload, ServerError> {
        let snapshot = self.snapshot(map_name);

        let index_handle = self.indexes.get(map_name);
        let plan = {
            let guard = index_handle.as_ref().map(|h| h.read());
            planner::plan(query, guard.as_deref())
        };
        metrics::histogram!("lattice_query_plan_cost").record(plan.cost(snapshot.len()) as f64);

        let candidates = self.candidates(&plan, &snapshot, index_handle.as_deref());
        let matched = self.filter(candidates, query.clone()).await?;

        let fingerprint = query.fingerprint();
        let specs = query.sort.clone().unwrap_or_default();
        let mut rows = matched;
        rows.sort_by(|a, b| cmp_rows(a, b, &specs));

        // Resume after the cursor position when the cursor is still valid.
        let resume = query
            .cursor
            .as_deref()
            .and_then(Cursor::decode)
            .filter(|c| c.fingerprint == fingerprint);
        if let Some(cursor) = &resume {
            rows.retain(|(key, value)| {
                cmp_tuples(
                    &sort_values(value, &specs),
                    key,
                    &cursor.last_sort_values,
                    &cursor.last_key,
                    &specs,
                ) == Ordering::Greater
            });
        }

        let limit = query
            .limit
            .unwrap_or(self.config.default_limit)
            .min(self.config.max_limit) as usize;
        let has_more = rows.len() > limit;
        rows.truncate(limit);

        let next_cursor = if has_more {
            rows.last().map(|(key, value)| {
                Cursor {
                    fingerprint,
                    last_sort_values: sort_values(value, &specs),
                    last_key: key.clone(),
                    direction: direction_of(&specs),
                }
                .encode()
            })
        } else {
            None
        };

        Ok(QueryResultPayload {
            query_id: query_id.to_string(),
            rows: rows
                .into_iter()
                .map(|(key, value)| QueryRow { key, value })
                .collect(),
            cursor: next_cursor,
            has_more,
        })
    }

    /// Snapshots the live entries of a map as `(key, value)` pairs.
    ///
    /// OR-map keys surface as an array of their active values.
    fn snapshot(&self, map_name: &str) -> HashMap<String, Value> {
        let Some(map) = self.maps.get(map_name) else {
            return HashMap::new();
        };
        match map.state() {
            MapState::Lww(lww) => lww
                .read()
                .entries()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            MapState::Or(or_map) => {
                let guard = or_map.read();
                guard
                    .all_keys()
                    .into_iter()
                    .map(|k| {
                        let values = guard.get(k).into_iter().cloned().collect();
                        (k.clone(), Value::Array(values))
                    })
                    .collect()
            }
        }
    }

    fn candidates(
        &self,
        plan: &QueryPlan,
        snapshot: &HashMap<String, Value>,
        indexes: Option<&parking_lot::RwLock<MapIndexes>>,
    ) -> Vec<(String, Value)> {
        let take = |keys: Vec<String>| -> Vec<(String, Value)> {
            keys.into_iter()
                .filter_map(|k| snapshot.get(&k).map(|v| (k, v.clone())))
                .collect()
        };

        match plan {
            QueryPlan::PointLookup { keys } => take(keys.clone()),
            QueryPlan::StandingQuery { fingerprint } => {
                let keys = indexes
                    .map(|i| i.read().standing_keys(*fingerprint))
                    .unwrap_or_default();
                take(keys)
            }
            QueryPlan::CompoundIndexScan { fields, values } => {
                let keys = indexes
                    .map(|i| i.read().lookup_compound(fields, values))
                    .unwrap_or_default();
                take(keys)
            }
            QueryPlan::IndexScan { field, value } => {
                let keys = indexes
                    .map(|i| i.read().lookup_single(field, value))
                    .unwrap_or_default();
                take(keys)
            }
            QueryPlan::FullScan => snapshot
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// Residual filtering: inline for small candidate sets, on the
    /// scheduler for anything larger.
    async fn filter(
        &self,
        candidates: Vec<(String, Value)>,
        query: Query,
    ) -> Result<Vec<(String, Value)>, ServerError> {
        let per_slice = self.scheduler.items_per_slice();
        let fold = move |mut acc: Vec<(String, Value)>, (key, value): (String, Value)| {
            if query.matches(&key, &value) {
                acc.push((key, value));
            }
            acc
        };

        if candidates.len() <= per_slice {
            // Small work: no reason to pay a tick of latency.
            return Ok(candidates
                .into_iter()
                .fold(Vec::new(), fold));
        }

        let (tasklet, rx) =
            ReduceTasklet::new(candidates.into_iter(), per_slice, Vec::new(), fold);
        let _handle = self.scheduler.schedule(Box::new(tasklet));
        rx.await.map_err(|_| ServerError::Cancelled)
    }
}

/// Sort key values of a row; `Null` stands in for missing fields.
fn sort_values(value: &Value, specs: &[SortSpec]) -> Vec<Value> {
    specs
        .iter()
        .map(|spec| value.get_path(&spec.field).cloned().unwrap_or(Value::Null))
        .collect()
}

fn direction_of(specs: &[SortSpec]) -> Direction {
    match specs.first().map(|s| s.direction) {
        Some(SortDirection::Desc) => Direction::Backward,
        _ => Direction::Forward,
    }
}

fn cmp_rows(a: &(String, Value), b: &(String, Value), specs: &[SortSpec]) -> Ordering {
    cmp_tuples(
        &sort_values(&a.1, specs),
        &a.0,
        &sort_values(&b.1, specs),
        &b.0,
        specs,
    )
}

/// Compares `(sort values, key)` tuples under the sort specs.
///
/// Missing/null sort values collate last in both directions; the key is
/// the ascending final tie-break, which makes the order total and the
/// pagination stable.
fn cmp_tuples(
    a_values: &[Value],
    a_key: &str,
    b_values: &[Value],
    b_key: &str,
    specs: &[SortSpec],
) -> Ordering {
    for (index, spec) in specs.iter().enumerate() {
        let a = a_values.get(index).filter(|v| !matches!(v, Value::Null));
        let b = b_values.get(index).filter(|v| !matches!(v, Value::Null));
        let ordering = match (a, b) {
            (None, None) => Ordering::Equal,
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some(a), Some(b)) => {
                let raw = a.compare(b).unwrap_or(Ordering::Equal);
                match spec.direction {
                    SortDirection::Asc => raw,
                    SortDirection::Desc => raw.reverse(),
                }
            }
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    a_key.cmp(b_key)
}
