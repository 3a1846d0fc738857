//! The typed command surface consumed by the executor.
//!
//! The tokenizer/parser lives outside this crate; it produces these shapes
//! and hands them to [`crate::SawitDB::query`]. Criteria trees arrive with
//! precedence already applied (AND binds tighter than OR), so evaluation
//! here is a plain recursive fold.

use crate::record::{Record, Value};
use regex::RegexBuilder;

#[derive(Debug, Clone, PartialEq)]
/// A parsed statement ready for execution.
pub enum Command {
    CreateTable {
        table: String,
    },
    ShowTables,
    ShowIndexes {
        table: Option<String>,
    },
    Insert {
        table: String,
        rows: Vec<Record>,
    },
    Select {
        table: String,
        cols: Vec<String>,
        criteria: Option<Criteria>,
        sort: Option<SortSpec>,
        limit: Option<usize>,
        offset: Option<usize>,
        joins: Vec<JoinClause>,
        distinct: bool,
    },
    Delete {
        table: String,
        criteria: Option<Criteria>,
    },
    Update {
        table: String,
        updates: Record,
        criteria: Option<Criteria>,
    },
    DropTable {
        table: String,
    },
    CreateIndex {
        table: String,
        field: String,
    },
    Aggregate {
        table: String,
        func: AggregateFunc,
        field: Option<String>,
        criteria: Option<Criteria>,
        group_by: Option<String>,
        having: Option<Having>,
    },
    Explain(Box<Command>),
    /// Parser-side failure carried through so the executor can surface it.
    Error {
        message: String,
    },
}

impl Command {
    /// Table the command primarily targets, when it has one.
    pub fn table(&self) -> Option<&str> {
        match self {
            Command::CreateTable { table }
            | Command::Insert { table, .. }
            | Command::Select { table, .. }
            | Command::Delete { table, .. }
            | Command::Update { table, .. }
            | Command::DropTable { table }
            | Command::CreateIndex { table, .. }
            | Command::Aggregate { table, .. } => Some(table),
            Command::ShowIndexes { table } => table.as_deref(),
            Command::Explain(inner) => inner.table(),
            Command::ShowTables | Command::Error { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Comparison operator on a criteria leaf.
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
    Like,
    Between,
    IsNull,
    IsNotNull,
}

#[derive(Debug, Clone, PartialEq)]
/// Right-hand side of a comparison. `IS NULL`/`IS NOT NULL` carry no
/// operand, `IN`/`NOT IN` carry a list, `BETWEEN` a closed range.
pub enum Operand {
    None,
    One(Value),
    Many(Vec<Value>),
    Range(Value, Value),
}

#[derive(Debug, Clone, PartialEq)]
/// A single `{key, op, val}` comparison.
pub struct Condition {
    pub key: String,
    pub op: CmpOp,
    pub val: Operand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Logic {
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
/// A predicate tree: either one comparison or an AND/OR list of subtrees.
pub enum Criteria {
    Cmp(Condition),
    Compound {
        logic: Logic,
        conditions: Vec<Criteria>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDir {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortSpec {
    pub key: String,
    pub dir: SortDir,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Full,
    Cross,
}

impl JoinType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JoinType::Inner => "INNER",
            JoinType::Left => "LEFT",
            JoinType::Right => "RIGHT",
            JoinType::Full => "FULL",
            JoinType::Cross => "CROSS",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
/// Join condition: two column references and a comparison operator.
pub struct OnClause {
    pub left: String,
    pub op: CmpOp,
    pub right: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinClause {
    pub table: String,
    pub join_type: JoinType,
    /// Absent for CROSS joins.
    pub on: Option<OnClause>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateFunc {
    /// Column name the result is reported under.
    pub fn column(&self) -> &'static str {
        match self {
            AggregateFunc::Count => "count",
            AggregateFunc::Sum => "sum",
            AggregateFunc::Avg => "avg",
            AggregateFunc::Min => "min",
            AggregateFunc::Max => "max",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateFunc::Count => "COUNT",
            AggregateFunc::Sum => "SUM",
            AggregateFunc::Avg => "AVG",
            AggregateFunc::Min => "MIN",
            AggregateFunc::Max => "MAX",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
/// A single comparison on an aggregated column (`count`, `sum`, `avg`,
/// `min`, `max`).
pub struct Having {
    pub key: String,
    pub op: CmpOp,
    pub val: Value,
}

impl Criteria {
    /// Evaluate the predicate tree against a record.
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Criteria::Cmp(cond) => cond.matches(record),
            Criteria::Compound { logic, conditions } => match logic {
                Logic::And => conditions.iter().all(|c| c.matches(record)),
                Logic::Or => conditions.iter().any(|c| c.matches(record)),
            },
        }
    }

    /// The single top-level equality comparison, if the tree is exactly
    /// that. This is the shape the executor can satisfy from an index.
    pub fn as_equality(&self) -> Option<(&str, &Value)> {
        match self {
            Criteria::Cmp(Condition {
                key,
                op: CmpOp::Eq,
                val: Operand::One(value),
            }) => Some((key.as_str(), value)),
            _ => None,
        }
    }
}

impl Condition {
    /// Evaluate one comparison against a record. A missing field behaves as
    /// null: it satisfies `IS NULL` and fails every other operator.
    pub fn matches(&self, record: &Record) -> bool {
        let field = record.get(&self.key);
        match self.op {
            CmpOp::IsNull => matches!(field, None | Some(Value::Null)),
            CmpOp::IsNotNull => matches!(field, Some(v) if *v != Value::Null),
            _ => {
                let Some(actual) = field else { return false };
                self.compare(actual)
            }
        }
    }

    fn compare(&self, actual: &Value) -> bool {
        match (self.op, &self.val) {
            (CmpOp::Eq, Operand::One(expected)) => actual.loose_eq(expected),
            (CmpOp::Ne, Operand::One(expected)) => !actual.loose_eq(expected),
            (CmpOp::Lt, Operand::One(expected)) => ordered_cmp(actual, expected)
                .map(|o| o == std::cmp::Ordering::Less)
                .unwrap_or(false),
            (CmpOp::Le, Operand::One(expected)) => ordered_cmp(actual, expected)
                .map(|o| o != std::cmp::Ordering::Greater)
                .unwrap_or(false),
            (CmpOp::Gt, Operand::One(expected)) => ordered_cmp(actual, expected)
                .map(|o| o == std::cmp::Ordering::Greater)
                .unwrap_or(false),
            (CmpOp::Ge, Operand::One(expected)) => ordered_cmp(actual, expected)
                .map(|o| o != std::cmp::Ordering::Less)
                .unwrap_or(false),
            (CmpOp::In, Operand::Many(values)) => values.iter().any(|v| actual.loose_eq(v)),
            (CmpOp::NotIn, Operand::Many(values)) => !values.iter().any(|v| actual.loose_eq(v)),
            (CmpOp::Between, Operand::Range(low, high)) => {
                let ge_low = ordered_cmp(actual, low)
                    .map(|o| o != std::cmp::Ordering::Less)
                    .unwrap_or(false);
                let le_high = ordered_cmp(actual, high)
                    .map(|o| o != std::cmp::Ordering::Greater)
                    .unwrap_or(false);
                ge_low && le_high
            }
            (CmpOp::Like, Operand::One(Value::Str(pattern))) => match actual {
                Value::Str(text) => like_match(pattern, text),
                other => like_match(pattern, &other.to_string()),
            },
            _ => false,
        }
    }
}

/// Scalar comparison shared by join ON clauses and HAVING: equality is
/// numeric-coercing, orderings follow the same coercion rules as criteria
/// leaves. Non-scalar operators return false.
pub fn compare_op(op: CmpOp, left: &Value, right: &Value) -> bool {
    use std::cmp::Ordering;
    match op {
        CmpOp::Eq => left.loose_eq(right),
        CmpOp::Ne => !left.loose_eq(right),
        CmpOp::Lt => ordered_cmp(left, right) == Some(Ordering::Less),
        CmpOp::Le => matches!(
            ordered_cmp(left, right),
            Some(Ordering::Less) | Some(Ordering::Equal)
        ),
        CmpOp::Gt => ordered_cmp(left, right) == Some(Ordering::Greater),
        CmpOp::Ge => matches!(
            ordered_cmp(left, right),
            Some(Ordering::Greater) | Some(Ordering::Equal)
        ),
        _ => false,
    }
}

/// Ordering comparison with numeric coercion: when either side is numeric
/// both sides must coerce; otherwise only same-type comparisons order.
fn ordered_cmp(left: &Value, right: &Value) -> Option<std::cmp::Ordering> {
    if left.is_numeric() || right.is_numeric() {
        let a = left.as_number()?;
        let b = right.as_number()?;
        return a.partial_cmp(&b);
    }
    match (left, right) {
        (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// SQL LIKE: `%` matches any run, `_` any single character, everything else
/// is literal. Case-insensitive.
pub fn like_match(pattern: &str, text: &str) -> bool {
    let mut translated = String::with_capacity(pattern.len() + 8);
    translated.push('^');
    for ch in pattern.chars() {
        match ch {
            '%' => translated.push_str(".*"),
            '_' => translated.push('.'),
            other => translated.push_str(&regex::escape(&other.to_string())),
        }
    }
    translated.push('$');
    RegexBuilder::new(&translated)
        .case_insensitive(true)
        .build()
        .map(|re| re.is_match(text))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(pairs: &[(&str, Value)]) -> Record {
        Record::from_pairs(pairs.iter().map(|(k, v)| (k.to_string(), v.clone())))
    }

    fn eq(key: &str, val: Value) -> Criteria {
        Criteria::Cmp(Condition {
            key: key.to_string(),
            op: CmpOp::Eq,
            val: Operand::One(val),
        })
    }

    #[test]
    fn like_translates_sql_wildcards() {
        assert!(like_match("T%", "Tempo"));
        assert!(like_match("t%", "Tempo"));
        assert!(!like_match("T%", "Stereo"));
        assert!(like_match("_at", "cat"));
        assert!(!like_match("_at", "chat"));
        assert!(like_match("%middle%", "in the middle of it"));
        // regex metacharacters in the pattern stay literal
        assert!(like_match("a.b", "a.b"));
        assert!(!like_match("a.b", "axb"));
    }

    #[test]
    fn compound_tree_folds_without_short_circuit_bugs() {
        // b='D' OR (b='P' AND l='B'), the parse of `b='D' OR b='P' AND l='B'`
        let tree = Criteria::Compound {
            logic: Logic::Or,
            conditions: vec![
                eq("b", Value::Str("D".into())),
                Criteria::Compound {
                    logic: Logic::And,
                    conditions: vec![eq("b", Value::Str("P".into())), eq("l", Value::Str("B".into()))],
                },
            ],
        };
        assert!(tree.matches(&rec(&[("b", Value::Str("D".into())), ("l", Value::Str("A".into()))])));
        assert!(tree.matches(&rec(&[("b", Value::Str("P".into())), ("l", Value::Str("B".into()))])));
        assert!(!tree.matches(&rec(&[("b", Value::Str("T".into())), ("l", Value::Str("B".into()))])));
    }

    #[test]
    fn between_is_inclusive_both_ends() {
        let cond = Condition {
            key: "n".into(),
            op: CmpOp::Between,
            val: Operand::Range(Value::Int(2), Value::Int(4)),
        };
        assert!(cond.matches(&rec(&[("n", Value::Int(2))])));
        assert!(cond.matches(&rec(&[("n", Value::Int(4))])));
        assert!(!cond.matches(&rec(&[("n", Value::Int(5))])));
    }

    #[test]
    fn missing_field_is_null_for_is_null_only() {
        let record = rec(&[("a", Value::Int(1))]);
        let is_null = Condition {
            key: "b".into(),
            op: CmpOp::IsNull,
            val: Operand::None,
        };
        let gt = Condition {
            key: "b".into(),
            op: CmpOp::Gt,
            val: Operand::One(Value::Int(0)),
        };
        assert!(is_null.matches(&record));
        assert!(!gt.matches(&record));
    }

    #[test]
    fn in_and_not_in_use_loose_equality() {
        let cond = Condition {
            key: "id".into(),
            op: CmpOp::In,
            val: Operand::Many(vec![Value::Float(1.0), Value::Int(3)]),
        };
        assert!(cond.matches(&rec(&[("id", Value::Int(1))])));
        assert!(!cond.matches(&rec(&[("id", Value::Int(2))])));
    }
}
