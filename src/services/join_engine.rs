use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crate::error::EtlError;
use crate::models::{KeyValue, Relation, RowRef, Value};

/// Arbitrary join condition over a (left row, right row) pair
pub type JoinPredicate = Arc<dyn Fn(&RowRef<'_>, &RowRef<'_>) -> bool + Send + Sync>;

/// How two relations are matched
#[derive(Clone)]
pub enum JoinKey {
    /// Equality on (left column, right column) pairs; all pairs must match
    Columns(Vec<(String, String)>),
    Predicate(JoinPredicate),
}

impl JoinKey {
    /// Single-pair equality key
    pub fn on(left: &str, right: &str) -> Self {
        JoinKey::Columns(vec![(left.to_string(), right.to_string())])
    }

    pub fn on_all(pairs: &[(&str, &str)]) -> Self {
        JoinKey::Columns(
            pairs
                .iter()
                .map(|(l, r)| (l.to_string(), r.to_string()))
                .collect(),
        )
    }

    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&RowRef<'_>, &RowRef<'_>) -> bool + Send + Sync + 'static,
    {
        JoinKey::Predicate(Arc::new(f))
    }

    fn is_single_equality(&self) -> bool {
        matches!(self, JoinKey::Columns(pairs) if pairs.len() == 1)
    }
}

impl fmt::Debug for JoinKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinKey::Columns(pairs) => f.debug_tuple("Columns").field(pairs).finish(),
            JoinKey::Predicate(_) => f.write_str("Predicate(<fn>)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinStrategy {
    #[default]
    Auto,
    HashEquiJoin,
    NestedLoopJoin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinSide {
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JoinConfig {
    /// When > 0, an equality join with either input below this many rows
    /// runs as a nested loop
    #[serde(default)]
    pub nested_loop_threshold: usize,
    /// Treat an empty input as an error instead of yielding an empty result
    #[serde(default)]
    pub fail_on_empty: bool,
}

/// Inner join engine choosing between a hash equi-join and a nested loop
#[derive(Debug, Clone, Default)]
pub struct HybridJoinEngine {
    config: JoinConfig,
}

/// Column layout of a join result: left columns in order, then right-only
/// columns. A right column whose name collides with a left column replaces
/// the left value in place.
struct OutputLayout {
    columns: Vec<String>,
    overrides: Vec<(usize, usize)>,
    appended: Vec<usize>,
}

impl OutputLayout {
    fn new(left: &Relation, right: &Relation) -> Self {
        let mut columns = left.columns().to_vec();
        let mut overrides = Vec::new();
        let mut appended = Vec::new();

        for (right_idx, name) in right.columns().iter().enumerate() {
            match left.columns().iter().position(|c| c == name) {
                Some(left_idx) => overrides.push((left_idx, right_idx)),
                None => {
                    columns.push(name.clone());
                    appended.push(right_idx);
                }
            }
        }

        Self {
            columns,
            overrides,
            appended,
        }
    }

    fn combine(&self, left: &[Value], right: &[Value]) -> Vec<Value> {
        let mut row = Vec::with_capacity(self.columns.len());
        row.extend_from_slice(left);
        for &(left_idx, right_idx) in &self.overrides {
            row[left_idx] = right[right_idx].clone();
        }
        row.extend(self.appended.iter().map(|&i| right[i].clone()));
        row
    }
}

impl HybridJoinEngine {
    pub fn new(config: JoinConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &JoinConfig {
        &self.config
    }

    /// The side a hash join indexes: the smaller input, left on ties
    pub fn build_side(left_len: usize, right_len: usize) -> JoinSide {
        if left_len <= right_len {
            JoinSide::Left
        } else {
            JoinSide::Right
        }
    }

    /// Decide which algorithm a request runs with
    pub fn resolve_strategy(
        &self,
        left: &Relation,
        right: &Relation,
        key: &JoinKey,
        strategy: JoinStrategy,
    ) -> Result<JoinStrategy, EtlError> {
        match (strategy, key) {
            (JoinStrategy::HashEquiJoin, JoinKey::Predicate(_)) => Err(EtlError::InvalidConfiguration(
                "Hash join requires column equality keys, not a predicate".to_string(),
            )),
            (JoinStrategy::Auto, key) if key.is_single_equality() => {
                let smaller = left.len().min(right.len());
                let threshold = self.config.nested_loop_threshold;
                if threshold > 0 && smaller < threshold {
                    Ok(JoinStrategy::NestedLoopJoin)
                } else {
                    Ok(JoinStrategy::HashEquiJoin)
                }
            }
            (JoinStrategy::Auto, _) => Ok(JoinStrategy::NestedLoopJoin),
            (explicit, _) => Ok(explicit),
        }
    }

    /// Inner-join `left` and `right`. Pure: inputs are never modified.
    pub fn join(
        &self,
        left: &Relation,
        right: &Relation,
        key: &JoinKey,
        strategy: JoinStrategy,
    ) -> Result<Relation, EtlError> {
        let key_indices = match key {
            JoinKey::Columns(pairs) => Some(Self::resolve_key_columns(left, right, pairs)?),
            JoinKey::Predicate(_) => None,
        };

        if self.config.fail_on_empty && (left.is_empty() || right.is_empty()) {
            return Err(EtlError::EmptyInput(format!(
                "Join input is empty (left: {} rows, right: {} rows)",
                left.len(),
                right.len()
            )));
        }

        let resolved = self.resolve_strategy(left, right, key, strategy)?;
        let layout = OutputLayout::new(left, right);
        let started = Instant::now();

        let rows = match (resolved, key, key_indices) {
            (JoinStrategy::HashEquiJoin, _, Some(indices)) => {
                Self::hash_join(left, right, &indices, &layout)
            }
            (_, JoinKey::Predicate(predicate), _) => {
                Self::nested_loop_join(left, right, &layout, |l, r| predicate(l, r))
            }
            (_, _, Some(indices)) => Self::nested_loop_join(left, right, &layout, |l, r| {
                indices
                    .iter()
                    .all(|&(li, ri)| l.value(li).join_eq(r.value(ri)))
            }),
            (_, JoinKey::Columns(_), None) => {
                return Err(EtlError::Internal("Join key columns were not resolved".to_string()))
            }
        };

        tracing::info!(
            "{:?} joined {} x {} rows into {} rows in {}ms",
            resolved,
            left.len(),
            right.len(),
            rows.len(),
            started.elapsed().as_millis()
        );

        Relation::new(layout.columns, rows)
    }

    fn resolve_key_columns(
        left: &Relation,
        right: &Relation,
        pairs: &[(String, String)],
    ) -> Result<Vec<(usize, usize)>, EtlError> {
        if pairs.is_empty() {
            return Err(EtlError::InvalidConfiguration(
                "Join key has no column pairs".to_string(),
            ));
        }
        pairs
            .iter()
            .map(|(l, r)| Ok((left.column_index(l)?, right.column_index(r)?)))
            .collect()
    }

    fn composite_key(values: &[Value], indices: impl Iterator<Item = usize>) -> Option<Vec<KeyValue>> {
        indices.map(|i| values[i].key()).collect()
    }

    /// Index the smaller side, probe with the larger. Output follows probe
    /// order; matches for one probe row follow build-side order.
    fn hash_join(
        left: &Relation,
        right: &Relation,
        indices: &[(usize, usize)],
        layout: &OutputLayout,
    ) -> Vec<Vec<Value>> {
        let side = Self::build_side(left.len(), right.len());
        let (build, probe) = match side {
            JoinSide::Left => (left, right),
            JoinSide::Right => (right, left),
        };
        let build_cols: Vec<usize> = indices
            .iter()
            .map(|&(l, r)| if side == JoinSide::Left { l } else { r })
            .collect();
        let probe_cols: Vec<usize> = indices
            .iter()
            .map(|&(l, r)| if side == JoinSide::Left { r } else { l })
            .collect();

        let mut index: HashMap<Vec<KeyValue>, Vec<usize>> = HashMap::with_capacity(build.len());
        for (row_idx, row) in build.rows().iter().enumerate() {
            // null keys never match
            if let Some(key) = Self::composite_key(row, build_cols.iter().copied()) {
                index.entry(key).or_default().push(row_idx);
            }
        }

        tracing::debug!(
            "Hash join build side {:?}: {} rows, {} distinct keys",
            side,
            build.len(),
            index.len()
        );

        let mut output = Vec::new();
        for probe_row in probe.rows() {
            let Some(key) = Self::composite_key(probe_row, probe_cols.iter().copied()) else {
                continue;
            };
            if let Some(matches) = index.get(&key) {
                for &build_idx in matches {
                    let build_row = &build.rows()[build_idx];
                    let joined = match side {
                        JoinSide::Left => layout.combine(build_row, probe_row),
                        JoinSide::Right => layout.combine(probe_row, build_row),
                    };
                    output.push(joined);
                }
            }
        }
        output
    }

    fn nested_loop_join<F>(
        left: &Relation,
        right: &Relation,
        layout: &OutputLayout,
        matches: F,
    ) -> Vec<Vec<Value>>
    where
        F: Fn(&RowRef<'_>, &RowRef<'_>) -> bool,
    {
        let mut output = Vec::new();
        for l in left.iter() {
            for r in right.iter() {
                if matches(&l, &r) {
                    output.push(layout.combine(l.values(), r.values()));
                }
            }
        }
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn products() -> Relation {
        Relation::from_rows(
            &["Product_ID", "Price"],
            vec![vec!["P1".into(), 10.0.into()]],
        )
        .unwrap()
    }

    fn transactions() -> Relation {
        Relation::from_rows(
            &["orderID", "Product_ID", "quantity"],
            vec![
                vec![1i64.into(), "P1".into(), 2i64.into()],
                vec![2i64.into(), "P1".into(), 1i64.into()],
                vec![3i64.into(), "P2".into(), 5i64.into()],
            ],
        )
        .unwrap()
    }

    fn sorted_rows(rel: &Relation, columns: &[&str]) -> Vec<String> {
        let projected = rel.project(columns).unwrap();
        let mut rows: Vec<String> = projected.rows().iter().map(|r| format!("{:?}", r)).collect();
        rows.sort();
        rows
    }

    #[test]
    fn test_hash_join_drops_unmatched_probe_rows() {
        let engine = HybridJoinEngine::default();
        let joined = engine
            .join(&transactions(), &products(), &JoinKey::on("Product_ID", "Product_ID"), JoinStrategy::Auto)
            .unwrap();

        assert_eq!(joined.len(), 2);
        assert_eq!(joined.columns(), &["orderID", "Product_ID", "quantity", "Price"]);
        // probe side is the transactions relation, so its order is kept
        assert_eq!(joined.rows()[0][0], Value::Integer(1));
        assert_eq!(joined.rows()[1][0], Value::Integer(2));
        assert!(joined.iter().all(|r| r.get("Product_ID") == Some(&Value::text("P1"))));
    }

    #[test]
    fn test_hash_and_nested_loop_agree() {
        let engine = HybridJoinEngine::default();
        let key = JoinKey::on("Product_ID", "Product_ID");
        let hash = engine
            .join(&transactions(), &products(), &key, JoinStrategy::HashEquiJoin)
            .unwrap();
        let nested = engine
            .join(&transactions(), &products(), &key, JoinStrategy::NestedLoopJoin)
            .unwrap();
        let predicate = engine
            .join(
                &transactions(),
                &products(),
                &JoinKey::predicate(|l, r| {
                    l.get("Product_ID")
                        .zip(r.get("Product_ID"))
                        .map_or(false, |(a, b)| a.join_eq(b))
                }),
                JoinStrategy::Auto,
            )
            .unwrap();

        let cols = ["orderID", "Product_ID", "quantity", "Price"];
        assert_eq!(sorted_rows(&hash, &cols), sorted_rows(&nested, &cols));
        assert_eq!(sorted_rows(&hash, &cols), sorted_rows(&predicate, &cols));
    }

    #[test]
    fn test_swapping_inputs_keeps_multiset() {
        let engine = HybridJoinEngine::default();
        let key = JoinKey::on("Product_ID", "Product_ID");
        let a = engine.join(&transactions(), &products(), &key, JoinStrategy::HashEquiJoin).unwrap();
        let b = engine.join(&products(), &transactions(), &key, JoinStrategy::HashEquiJoin).unwrap();

        let cols = ["orderID", "Product_ID", "quantity", "Price"];
        assert_eq!(sorted_rows(&a, &cols), sorted_rows(&b, &cols));
    }

    #[test]
    fn test_build_side_is_smaller_input() {
        assert_eq!(HybridJoinEngine::build_side(1, 3), JoinSide::Left);
        assert_eq!(HybridJoinEngine::build_side(3, 1), JoinSide::Right);
        assert_eq!(HybridJoinEngine::build_side(2, 2), JoinSide::Left);
    }

    #[test]
    fn test_right_columns_win_on_collision() {
        let left = Relation::from_rows(&["id", "name"], vec![vec![1i64.into(), "old".into()]]).unwrap();
        let right = Relation::from_rows(&["id", "name"], vec![vec![1i64.into(), "new".into()]]).unwrap();
        let joined = HybridJoinEngine::default()
            .join(&left, &right, &JoinKey::on("id", "id"), JoinStrategy::Auto)
            .unwrap();
        assert_eq!(joined.columns(), &["id", "name"]);
        assert_eq!(joined.rows()[0][1], Value::text("new"));
    }

    #[test]
    fn test_null_keys_never_match() {
        let left = Relation::from_rows(&["k"], vec![vec![Value::Null], vec!["a".into()]]).unwrap();
        let right = Relation::from_rows(&["k", "v"], vec![vec![Value::Null, 1i64.into()]]).unwrap();
        let engine = HybridJoinEngine::default();
        for strategy in [JoinStrategy::HashEquiJoin, JoinStrategy::NestedLoopJoin] {
            let joined = engine.join(&left, &right, &JoinKey::on("k", "k"), strategy).unwrap();
            assert!(joined.is_empty());
        }
    }

    #[test]
    fn test_auto_strategy_resolution() {
        let small = products();
        let large = transactions();
        let default_engine = HybridJoinEngine::default();
        let eq = JoinKey::on("Product_ID", "Product_ID");

        assert_eq!(
            default_engine.resolve_strategy(&large, &small, &eq, JoinStrategy::Auto).unwrap(),
            JoinStrategy::HashEquiJoin
        );
        assert_eq!(
            default_engine
                .resolve_strategy(&large, &small, &JoinKey::on_all(&[("a", "b"), ("c", "d")]), JoinStrategy::Auto)
                .unwrap(),
            JoinStrategy::NestedLoopJoin
        );

        let thresholded = HybridJoinEngine::new(JoinConfig {
            nested_loop_threshold: 2,
            fail_on_empty: false,
        });
        assert_eq!(
            thresholded.resolve_strategy(&large, &small, &eq, JoinStrategy::Auto).unwrap(),
            JoinStrategy::NestedLoopJoin
        );

        let err = default_engine
            .resolve_strategy(&large, &small, &JoinKey::predicate(|_, _| true), JoinStrategy::HashEquiJoin)
            .unwrap_err();
        assert!(matches!(err, EtlError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_missing_join_column_is_schema_mismatch() {
        let err = HybridJoinEngine::default()
            .join(&transactions(), &products(), &JoinKey::on("Product", "Product_ID"), JoinStrategy::Auto)
            .unwrap_err();
        assert!(matches!(err, EtlError::SchemaMismatch(_)));
    }

    #[test]
    fn test_empty_input_handling() {
        let empty = Relation::empty(vec!["Product_ID".to_string()]);
        let key = JoinKey::on("Product_ID", "Product_ID");

        let joined = HybridJoinEngine::default()
            .join(&transactions(), &empty, &key, JoinStrategy::Auto)
            .unwrap();
        assert!(joined.is_empty());

        let strict = HybridJoinEngine::new(JoinConfig {
            nested_loop_threshold: 0,
            fail_on_empty: true,
        });
        let err = strict.join(&transactions(), &empty, &key, JoinStrategy::Auto).unwrap_err();
        assert!(matches!(err, EtlError::EmptyInput(_)));
    }

    #[test]
    fn test_composite_hash_join() {
        let left = Relation::from_rows(
            &["a", "b"],
            vec![vec![1i64.into(), "x".into()], vec![1i64.into(), "y".into()]],
        )
        .unwrap();
        let right = Relation::from_rows(
            &["a2", "b2", "v"],
            vec![vec![1i64.into(), "y".into(), 9i64.into()]],
        )
        .unwrap();
        let joined = HybridJoinEngine::default()
            .join(&left, &right, &JoinKey::on_all(&[("a", "a2"), ("b", "b2")]), JoinStrategy::HashEquiJoin)
            .unwrap();
        assert_eq!(joined.len(), 1);
        assert_eq!(joined.row(0).unwrap().get("b"), Some(&Value::text("y")));
    }
}
