//! Query model: predicate tree, sort spec, and partition pruning.
//!
//! A query carries an optional predicate tree, an optional `where` sugar
//! map (field -> expected value, conjunctive equality), a sort list, a
//! limit, and an opaque cursor. Predicate evaluation lives here so that
//! the server-side planner, the live-query matcher, and tests all share
//! one semantics.
//!
//! Key-equality extraction ([`Query::key_values`]) feeds two consumers:
//! the planner's point-lookup detection and partition pruning
//! ([`relevant_partitions`]), which lets a node fan a query out to only
//! the partitions that can hold matching keys.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::hash::{canonical_json, fnv1a_64};
use crate::partition::partition_for_key;
use crate::types::Value;

/// Attribute names that address the entry key rather than a value field.
pub const KEY_ATTRIBUTES: &[&str] = &["_key", "key", "id", "_id"];

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    /// Ascending.
    Asc,
    /// Descending.
    Desc,
}

/// One sort criterion; criteria apply in list order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SortSpec {
    /// Dot-separated field path to sort by.
    pub field: String,
    /// Direction for this criterion.
    pub direction: SortDirection,
}

/// Predicate operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PredicateOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Regex,
    Match,
    MatchPhrase,
    MatchPrefix,
    And,
    Or,
    Not,
}

/// A node of the predicate tree.
///
/// Leaf operators use `attribute` plus `value` (or `values` for `in`);
/// `and`/`or`/`not` use `children`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredicateNode {
    /// Operator.
    pub op: PredicateOp,
    /// Field path for leaf operators; [`KEY_ATTRIBUTES`] address the key.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub attribute: Option<String>,
    /// Comparison operand for unary leaf operators.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub value: Option<Value>,
    /// Operand list for `in`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub values: Option<Vec<Value>>,
    /// Sub-predicates for `and`/`or`/`not`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub children: Option<Vec<PredicateNode>>,
}

/// What an attribute resolved to on a concrete entry.
enum Resolved<'a> {
    /// The attribute addressed the entry key.
    Key(&'a str),
    /// The attribute addressed a value field.
    Field(&'a Value),
    /// The field path does not exist on this entry.
    Missing,
}

impl PredicateNode {
    /// Leaf equality predicate.
    #[must_use]
    pub fn eq(attribute: impl Into<String>, value: Value) -> Self {
        Self::leaf(PredicateOp::Eq, attribute, value)
    }

    /// Leaf comparison predicate.
    #[must_use]
    pub fn leaf(op: PredicateOp, attribute: impl Into<String>, value: Value) -> Self {
        Self {
            op,
            attribute: Some(attribute.into()),
            value: Some(value),
            values: None,
            children: None,
        }
    }

    /// Membership predicate.
    #[must_use]
    pub fn is_in(attribute: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            op: PredicateOp::In,
            attribute: Some(attribute.into()),
            value: None,
            values: Some(values),
            children: None,
        }
    }

    /// Conjunction of sub-predicates.
    #[must_use]
    pub fn and(children: Vec<PredicateNode>) -> Self {
        Self::branch(PredicateOp::And, children)
    }

    /// Disjunction of sub-predicates.
    #[must_use]
    pub fn or(children: Vec<PredicateNode>) -> Self {
        Self::branch(PredicateOp::Or, children)
    }

    /// Negation of a sub-predicate.
    #[must_use]
    pub fn not(child: PredicateNode) -> Self {
        Self::branch(PredicateOp::Not, vec![child])
    }

    fn branch(op: PredicateOp, children: Vec<PredicateNode>) -> Self {
        Self {
            op,
            attribute: None,
            value: None,
            values: None,
            children: Some(children),
        }
    }

    /// Evaluates the predicate against one entry.
    ///
    /// Missing attributes never match (for any operator, `ne` included),
    /// so a filter cannot accidentally select entries that lack the field
    /// entirely. Invalid regex patterns match nothing.
    #[must_use]
    pub fn matches(&self, key: &str, value: &Value) -> bool {
        match self.op {
            PredicateOp::And => self
                .children
                .as_deref()
                .is_some_and(|cs| !cs.is_empty() && cs.iter().all(|c| c.matches(key, value))),
            PredicateOp::Or => self
                .children
                .as_deref()
                .is_some_and(|cs| cs.iter().any(|c| c.matches(key, value))),
            PredicateOp::Not => self
                .children
                .as_deref()
                .and_then(<[PredicateNode]>::first)
                .is_some_and(|c| !c.matches(key, value)),
            _ => self.matches_leaf(key, value),
        }
    }

    fn matches_leaf(&self, key: &str, value: &Value) -> bool {
        let Some(attribute) = self.attribute.as_deref() else {
            return false;
        };
        let resolved = resolve(attribute, key, value);
        if matches!(resolved, Resolved::Missing) {
            return false;
        }

        match self.op {
            PredicateOp::Eq => self
                .value
                .as_ref()
                .is_some_and(|expected| equals(&resolved, expected)),
            PredicateOp::Ne => self
                .value
                .as_ref()
                .is_some_and(|expected| !equals(&resolved, expected)),
            PredicateOp::Gt | PredicateOp::Gte | PredicateOp::Lt | PredicateOp::Lte => {
                let Some(expected) = self.value.as_ref() else {
                    return false;
                };
                let Some(ordering) = compare(&resolved, expected) else {
                    return false;
                };
                match self.op {
                    PredicateOp::Gt => ordering.is_gt(),
                    PredicateOp::Gte => ordering.is_ge(),
                    PredicateOp::Lt => ordering.is_lt(),
                    PredicateOp::Lte => ordering.is_le(),
                    _ => unreachable!(),
                }
            }
            PredicateOp::In => self
                .values
                .as_deref()
                .is_some_and(|vs| vs.iter().any(|expected| equals(&resolved, expected))),
            PredicateOp::Regex => {
                let (Some(pattern), Some(text)) = (self.pattern(), text_of(&resolved)) else {
                    return false;
                };
                regex::Regex::new(pattern).is_ok_and(|re| re.is_match(text))
            }
            PredicateOp::Match => {
                let (Some(needle), Some(text)) = (self.pattern(), text_of(&resolved)) else {
                    return false;
                };
                let haystack = text.to_lowercase();
                needle
                    .split_whitespace()
                    .all(|term| haystack.contains(&term.to_lowercase()))
            }
            PredicateOp::MatchPhrase => {
                let (Some(needle), Some(text)) = (self.pattern(), text_of(&resolved)) else {
                    return false;
                };
                text.to_lowercase().contains(&needle.to_lowercase())
            }
            PredicateOp::MatchPrefix => {
                let (Some(needle), Some(text)) = (self.pattern(), text_of(&resolved)) else {
                    return false;
                };
                let prefix = needle.to_lowercase();
                text.split_whitespace()
                    .any(|token| token.to_lowercase().starts_with(&prefix))
            }
            PredicateOp::And | PredicateOp::Or | PredicateOp::Not => false,
        }
    }

    fn pattern(&self) -> Option<&str> {
        self.value.as_ref().and_then(Value::as_str)
    }

    /// Exact key values this predicate pins down, if any.
    ///
    /// `eq`/`in` on a key attribute yield keys; `and` unions its
    /// children's keys; `or`/`not` and everything else yield `None`
    /// (the predicate cannot be reduced to a key set).
    #[must_use]
    pub fn key_values(&self) -> Option<Vec<String>> {
        match self.op {
            PredicateOp::Eq => {
                if !self.targets_key() {
                    return None;
                }
                self.value.as_ref().and_then(key_string).map(|k| vec![k])
            }
            PredicateOp::In => {
                if !self.targets_key() {
                    return None;
                }
                let keys: Vec<String> = self
                    .values
                    .as_deref()?
                    .iter()
                    .filter_map(key_string)
                    .collect();
                (!keys.is_empty()).then_some(keys)
            }
            PredicateOp::And => {
                let keys: Vec<String> = self
                    .children
                    .as_deref()?
                    .iter()
                    .filter_map(PredicateNode::key_values)
                    .flatten()
                    .collect();
                (!keys.is_empty()).then_some(keys)
            }
            _ => None,
        }
    }

    fn targets_key(&self) -> bool {
        self.attribute
            .as_deref()
            .is_some_and(|a| KEY_ATTRIBUTES.contains(&a))
    }
}

/// A complete query: filter, order, page.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    /// Conjunctive equality sugar: every `field == value` must hold.
    #[serde(rename = "where")]
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub where_clause: Option<BTreeMap<String, Value>>,
    /// Full predicate tree, combined with the sugar conjunctively.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub predicate: Option<PredicateNode>,
    /// Sort criteria in priority order.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sort: Option<Vec<SortSpec>>,
    /// Maximum rows per page.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub limit: Option<u32>,
    /// Opaque continuation token from a previous page.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cursor: Option<String>,
}

impl Query {
    /// Evaluates the filter portion against one entry.
    #[must_use]
    pub fn matches(&self, key: &str, value: &Value) -> bool {
        if let Some(clause) = &self.where_clause {
            let all_eq = clause.iter().all(|(field, expected)| {
                let resolved = resolve(field, key, value);
                !matches!(resolved, Resolved::Missing) && equals(&resolved, expected)
            });
            if !all_eq {
                return false;
            }
        }
        self.predicate
            .as_ref()
            .is_none_or(|p| p.matches(key, value))
    }

    /// Exact key values the filter pins down (see
    /// [`PredicateNode::key_values`]); the `where` sugar participates.
    #[must_use]
    pub fn key_values(&self) -> Option<Vec<String>> {
        if let Some(clause) = &self.where_clause {
            for attr in KEY_ATTRIBUTES {
                if let Some(expected) = clause.get(*attr) {
                    let keys = match expected {
                        Value::Array(items) => items.iter().filter_map(key_string).collect(),
                        other => key_string(other).into_iter().collect::<Vec<_>>(),
                    };
                    if !keys.is_empty() {
                        return Some(keys);
                    }
                }
            }
        }
        self.predicate.as_ref().and_then(PredicateNode::key_values)
    }

    /// Stable fingerprint over the semantic parts of the query (filter
    /// and sort). Cursors embed it; a page request whose fingerprint
    /// differs from the cursor's restarts from the beginning.
    #[must_use]
    pub fn fingerprint(&self) -> u64 {
        let semantic = (
            &self.where_clause,
            &self.predicate,
            &self.sort,
        );
        fnv1a_64(&canonical_json(&semantic))
    }
}

/// Partition ids a query can touch, or `None` when it cannot be pruned
/// and must fan out to every partition.
#[must_use]
pub fn relevant_partitions(query: &Query) -> Option<Vec<u32>> {
    let keys = query.key_values()?;
    let mut pids: Vec<u32> = keys.iter().map(|k| partition_for_key(k)).collect();
    pids.sort_unstable();
    pids.dedup();
    Some(pids)
}

fn resolve<'a>(attribute: &str, key: &'a str, value: &'a Value) -> Resolved<'a> {
    if KEY_ATTRIBUTES.contains(&attribute) {
        return Resolved::Key(key);
    }
    match value.get_path(attribute) {
        Some(v) => Resolved::Field(v),
        None => Resolved::Missing,
    }
}

fn equals(resolved: &Resolved<'_>, expected: &Value) -> bool {
    match resolved {
        Resolved::Key(key) => key_string(expected).is_some_and(|s| s == *key),
        Resolved::Field(actual) => {
            *actual == expected
                || actual.compare(expected) == Some(std::cmp::Ordering::Equal)
        }
        Resolved::Missing => false,
    }
}

fn compare(resolved: &Resolved<'_>, expected: &Value) -> Option<std::cmp::Ordering> {
    match resolved {
        Resolved::Key(key) => expected.as_str().map(|s| (*key).cmp(s)),
        Resolved::Field(actual) => actual.compare(expected),
        Resolved::Missing => None,
    }
}

fn text_of<'a>(resolved: &Resolved<'a>) -> Option<&'a str> {
    match resolved {
        Resolved::Key(key) => Some(key),
        Resolved::Field(value) => value.as_str(),
        Resolved::Missing => None,
    }
}

/// A key value usable for routing: strings directly, integers stringified.
fn key_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Int(i) => Some(i.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(pairs: &[(&str, Value)]) -> Value {
        Value::Map(
            pairs
                .iter()
                .map(|(k, v)| ((*k).to_string(), v.clone()))
                .collect(),
        )
    }

    fn user() -> Value {
        doc(&[
            ("name", Value::String("Alice Author".to_string())),
            ("age", Value::Int(30)),
            ("bio", Value::String("Writes distributed systems".to_string())),
            (
                "address",
                doc(&[("city", Value::String("Oslo".to_string()))]),
            ),
        ])
    }

    // ---- leaf operators ----

    #[test]
    fn eq_on_field_and_nested_field() {
        assert!(PredicateNode::eq("age", Value::Int(30)).matches("k", &user()));
        assert!(
            PredicateNode::eq("address.city", Value::String("Oslo".to_string()))
                .matches("k", &user())
        );
        assert!(!PredicateNode::eq("age", Value::Int(31)).matches("k", &user()));
    }

    #[test]
    fn eq_numeric_across_int_and_float() {
        assert!(PredicateNode::eq("age", Value::Float(30.0)).matches("k", &user()));
    }

    #[test]
    fn eq_on_key_attribute() {
        for attr in KEY_ATTRIBUTES {
            assert!(
                PredicateNode::eq(*attr, Value::String("users/1".to_string()))
                    .matches("users/1", &user()),
                "attribute {attr}"
            );
        }
        assert!(!PredicateNode::eq("_key", Value::String("other".to_string()))
            .matches("users/1", &user()));
    }

    #[test]
    fn missing_attribute_never_matches() {
        let value = user();
        for node in [
            PredicateNode::eq("absent", Value::Int(1)),
            PredicateNode::leaf(PredicateOp::Ne, "absent", Value::Int(1)),
            PredicateNode::leaf(PredicateOp::Gt, "absent", Value::Int(1)),
            PredicateNode::is_in("absent", vec![Value::Int(1)]),
        ] {
            assert!(!node.matches("k", &value), "{:?}", node.op);
        }
    }

    #[test]
    fn range_operators() {
        let value = user();
        assert!(PredicateNode::leaf(PredicateOp::Gt, "age", Value::Int(29)).matches("k", &value));
        assert!(PredicateNode::leaf(PredicateOp::Gte, "age", Value::Int(30)).matches("k", &value));
        assert!(PredicateNode::leaf(PredicateOp::Lt, "age", Value::Int(31)).matches("k", &value));
        assert!(PredicateNode::leaf(PredicateOp::Lte, "age", Value::Int(30)).matches("k", &value));
        assert!(!PredicateNode::leaf(PredicateOp::Gt, "age", Value::Int(30)).matches("k", &value));
        // Type mismatch: no ordering, no match.
        assert!(!PredicateNode::leaf(PredicateOp::Gt, "name", Value::Int(1)).matches("k", &value));
    }

    #[test]
    fn in_operator() {
        let node = PredicateNode::is_in(
            "age",
            vec![Value::Int(29), Value::Int(30), Value::Int(31)],
        );
        assert!(node.matches("k", &user()));
        let node = PredicateNode::is_in("age", vec![Value::Int(1)]);
        assert!(!node.matches("k", &user()));
    }

    #[test]
    fn regex_operator() {
        let node = PredicateNode::leaf(
            PredicateOp::Regex,
            "name",
            Value::String("^Alice .*$".to_string()),
        );
        assert!(node.matches("k", &user()));

        // Invalid pattern matches nothing rather than erroring the query.
        let bad = PredicateNode::leaf(
            PredicateOp::Regex,
            "name",
            Value::String("(unclosed".to_string()),
        );
        assert!(!bad.matches("k", &user()));
    }

    #[test]
    fn text_match_operators() {
        let value = user();
        // match: all terms, any position, case-insensitive.
        assert!(PredicateNode::leaf(
            PredicateOp::Match,
            "bio",
            Value::String("SYSTEMS writes".to_string())
        )
        .matches("k", &value));
        assert!(!PredicateNode::leaf(
            PredicateOp::Match,
            "bio",
            Value::String("writes embedded".to_string())
        )
        .matches("k", &value));

        // matchPhrase: contiguous, case-insensitive.
        assert!(PredicateNode::leaf(
            PredicateOp::MatchPhrase,
            "bio",
            Value::String("distributed systems".to_string())
        )
        .matches("k", &value));
        assert!(!PredicateNode::leaf(
            PredicateOp::MatchPhrase,
            "bio",
            Value::String("systems distributed".to_string())
        )
        .matches("k", &value));

        // matchPrefix: any token prefix.
        assert!(PredicateNode::leaf(
            PredicateOp::MatchPrefix,
            "bio",
            Value::String("distr".to_string())
        )
        .matches("k", &value));
        assert!(!PredicateNode::leaf(
            PredicateOp::MatchPrefix,
            "bio",
            Value::String("istrib".to_string())
        )
        .matches("k", &value));
    }

    // ---- boolean combinators ----

    #[test]
    fn and_or_not() {
        let value = user();
        let age_ok = PredicateNode::leaf(PredicateOp::Gte, "age", Value::Int(18));
        let wrong_city =
            PredicateNode::eq("address.city", Value::String("Berlin".to_string()));

        assert!(PredicateNode::and(vec![age_ok.clone()]).matches("k", &value));
        assert!(!PredicateNode::and(vec![age_ok.clone(), wrong_city.clone()])
            .matches("k", &value));
        assert!(PredicateNode::or(vec![wrong_city.clone(), age_ok.clone()])
            .matches("k", &value));
        assert!(PredicateNode::not(wrong_city).matches("k", &value));
        assert!(!PredicateNode::not(age_ok).matches("k", &value));
        // Empty conjunction is vacuous in neither direction: no children, no match.
        assert!(!PredicateNode::and(vec![]).matches("k", &value));
    }

    // ---- Query ----

    #[test]
    fn where_sugar_is_conjunctive_equality() {
        let mut clause = BTreeMap::new();
        clause.insert("age".to_string(), Value::Int(30));
        clause.insert(
            "address.city".to_string(),
            Value::String("Oslo".to_string()),
        );
        let query = Query {
            where_clause: Some(clause),
            ..Query::default()
        };
        assert!(query.matches("k", &user()));

        let mut wrong = BTreeMap::new();
        wrong.insert("age".to_string(), Value::Int(31));
        let query = Query {
            where_clause: Some(wrong),
            ..Query::default()
        };
        assert!(!query.matches("k", &user()));
    }

    #[test]
    fn where_and_predicate_combine_conjunctively() {
        let mut clause = BTreeMap::new();
        clause.insert("age".to_string(), Value::Int(30));
        let query = Query {
            where_clause: Some(clause),
            predicate: Some(PredicateNode::eq(
                "address.city",
                Value::String("Berlin".to_string()),
            )),
            ..Query::default()
        };
        assert!(!query.matches("k", &user()));
    }

    #[test]
    fn empty_query_matches_everything() {
        assert!(Query::default().matches("k", &user()));
    }

    // ---- key extraction and pruning ----

    #[test]
    fn key_values_from_predicate_eq_and_in() {
        let query = Query {
            predicate: Some(PredicateNode::eq(
                "_key",
                Value::String("hello".to_string()),
            )),
            ..Query::default()
        };
        assert_eq!(query.key_values(), Some(vec!["hello".to_string()]));

        let query = Query {
            predicate: Some(PredicateNode::is_in(
                "id",
                vec![Value::String("a".to_string()), Value::Int(42)],
            )),
            ..Query::default()
        };
        assert_eq!(
            query.key_values(),
            Some(vec!["a".to_string(), "42".to_string()])
        );
    }

    #[test]
    fn key_values_through_and_but_not_or() {
        let eq_key = PredicateNode::eq("_key", Value::String("hello".to_string()));
        let age = PredicateNode::leaf(PredicateOp::Gt, "age", Value::Int(18));

        let query = Query {
            predicate: Some(PredicateNode::and(vec![eq_key.clone(), age])),
            ..Query::default()
        };
        assert_eq!(query.key_values(), Some(vec!["hello".to_string()]));

        let query = Query {
            predicate: Some(PredicateNode::or(vec![eq_key.clone(), eq_key])),
            ..Query::default()
        };
        assert_eq!(query.key_values(), None);
    }

    #[test]
    fn key_values_from_where_clause() {
        let mut clause = BTreeMap::new();
        clause.insert(
            "_key".to_string(),
            Value::Array(vec![
                Value::String("a".to_string()),
                Value::String("b".to_string()),
            ]),
        );
        let query = Query {
            where_clause: Some(clause),
            ..Query::default()
        };
        assert_eq!(
            query.key_values(),
            Some(vec!["a".to_string(), "b".to_string()])
        );
    }

    #[test]
    fn relevant_partitions_sorted_and_deduped() {
        let query = Query {
            predicate: Some(PredicateNode::is_in(
                "_key",
                vec![
                    Value::String("a".to_string()),
                    Value::String("b".to_string()),
                    Value::String("a".to_string()),
                ],
            )),
            ..Query::default()
        };
        let pids = relevant_partitions(&query).unwrap();
        assert_eq!(pids.len(), 2);
        assert!(pids.windows(2).all(|w| w[0] < w[1]));
        assert!(pids.contains(&partition_for_key("a")));
        assert!(pids.contains(&partition_for_key("b")));
    }

    #[test]
    fn unprunable_queries_return_none() {
        assert_eq!(relevant_partitions(&Query::default()), None);
        let query = Query {
            predicate: Some(PredicateNode::leaf(
                PredicateOp::Gt,
                "age",
                Value::Int(1),
            )),
            ..Query::default()
        };
        assert_eq!(relevant_partitions(&query), None);
    }

    // ---- fingerprint ----

    #[test]
    fn fingerprint_ignores_pagination_but_not_filter_or_sort() {
        let base = Query {
            predicate: Some(PredicateNode::eq("age", Value::Int(30))),
            sort: Some(vec![SortSpec {
                field: "name".to_string(),
                direction: SortDirection::Asc,
            }]),
            limit: Some(10),
            ..Query::default()
        };

        let mut paged = base.clone();
        paged.limit = Some(25);
        paged.cursor = Some("token".to_string());
        assert_eq!(base.fingerprint(), paged.fingerprint());

        let mut refiltered = base.clone();
        refiltered.predicate = Some(PredicateNode::eq("age", Value::Int(31)));
        assert_ne!(base.fingerprint(), refiltered.fingerprint());

        let mut resorted = base.clone();
        resorted.sort = Some(vec![SortSpec {
            field: "name".to_string(),
            direction: SortDirection::Desc,
        }]);
        assert_ne!(base.fingerprint(), resorted.fingerprint());
    }

    #[test]
    fn serde_roundtrip_with_wire_names() {
        let query = Query {
            where_clause: Some(
                [("status".to_string(), Value::String("active".to_string()))]
                    .into_iter()
                    .collect(),
            ),
            predicate: Some(PredicateNode::leaf(
                PredicateOp::MatchPrefix,
                "name",
                Value::String("Al".to_string()),
            )),
            sort: Some(vec![SortSpec {
                field: "age".to_string(),
                direction: SortDirection::Desc,
            }]),
            limit: Some(50),
            cursor: Some("abc".to_string()),
        };
        let bytes = rmp_serde::to_vec_named(&query).unwrap();
        let decoded: Query = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(decoded, query);

        // Wire names: `where` and lowercase/camelCase operators.
        let val: rmpv::Value = rmp_serde::from_slice(&bytes).unwrap();
        let keys: Vec<&str> = val
            .as_map()
            .unwrap()
            .iter()
            .filter_map(|(k, _)| k.as_str())
            .collect();
        assert!(keys.contains(&"where"));

        let op_bytes = rmp_serde::to_vec_named(&PredicateOp::MatchPrefix).unwrap();
        let s: String = rmp_serde::from_slice(&op_bytes).unwrap();
        assert_eq!(s, "matchPrefix");
    }
}
