//! Predicate and assignment expressions over a target row and a source row.
//!
//! Evaluation follows SQL three-valued logic: comparisons involving null
//! yield null, and a condition only *holds* when it evaluates to `true`.
use std::fmt;

use crate::{data::Row, data::Value, schema::LogicalSchema};

/// Which side of the merge a column reference reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The table being merged into.
    Target,
    /// The incoming rows.
    Source,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Target => f.write_str("target"),
            Side::Source => f.write_str("source"),
        }
    }
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    /// `=`
    Eq,
    /// `<>`
    NotEq,
    /// `<`
    Lt,
    /// `<=`
    LtEq,
    /// `>`
    Gt,
    /// `>=`
    GtEq,
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompareOp::Eq => "=",
            CompareOp::NotEq => "<>",
            CompareOp::Lt => "<",
            CompareOp::LtEq => "<=",
            CompareOp::Gt => ">",
            CompareOp::GtEq => ">=",
        };
        f.write_str(s)
    }
}

/// An expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Column of the target or source row.
    Column {
        /// Row the column belongs to.
        side: Side,
        /// Column name.
        name: String,
    },
    /// Constant value.
    Literal(Value),
    /// Binary comparison.
    Compare {
        /// Operator.
        op: CompareOp,
        /// Left operand.
        left: Box<Expr>,
        /// Right operand.
        right: Box<Expr>,
    },
    /// Logical conjunction.
    And(Box<Expr>, Box<Expr>),
    /// Logical disjunction.
    Or(Box<Expr>, Box<Expr>),
    /// Logical negation.
    Not(Box<Expr>),
    /// `IS NULL` test; never null itself.
    IsNull(Box<Expr>),
}

/// The rows an expression is evaluated against.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvalRow<'a> {
    /// Target row, absent for not-matched clauses.
    pub target: Option<&'a Row>,
    /// Source row.
    pub source: Option<&'a Row>,
}

impl Expr {
    /// Reference a target column.
    pub fn target(name: impl Into<String>) -> Self {
        Expr::Column {
            side: Side::Target,
            name: name.into(),
        }
    }

    /// Reference a source column.
    pub fn source(name: impl Into<String>) -> Self {
        Expr::Column {
            side: Side::Source,
            name: name.into(),
        }
    }

    /// A literal value.
    pub fn lit(value: Value) -> Self {
        Expr::Literal(value)
    }

    fn compare(self, op: CompareOp, other: Expr) -> Self {
        Expr::Compare {
            op,
            left: Box::new(self),
            right: Box::new(other),
        }
    }

    /// `self = other`
    pub fn eq(self, other: Expr) -> Self {
        self.compare(CompareOp::Eq, other)
    }

    /// `self <> other`
    pub fn not_eq(self, other: Expr) -> Self {
        self.compare(CompareOp::NotEq, other)
    }

    /// `self < other`
    pub fn lt(self, other: Expr) -> Self {
        self.compare(CompareOp::Lt, other)
    }

    /// `self <= other`
    pub fn lt_eq(self, other: Expr) -> Self {
        self.compare(CompareOp::LtEq, other)
    }

    /// `self > other`
    pub fn gt(self, other: Expr) -> Self {
        self.compare(CompareOp::Gt, other)
    }

    /// `self >= other`
    pub fn gt_eq(self, other: Expr) -> Self {
        self.compare(CompareOp::GtEq, other)
    }

    /// `self AND other`
    pub fn and(self, other: Expr) -> Self {
        Expr::And(Box::new(self), Box::new(other))
    }

    /// `self OR other`
    pub fn or(self, other: Expr) -> Self {
        Expr::Or(Box::new(self), Box::new(other))
    }

    /// `NOT self`
    pub fn negate(self) -> Self {
        Expr::Not(Box::new(self))
    }

    /// `self IS NULL`
    pub fn is_null(self) -> Self {
        Expr::IsNull(Box::new(self))
    }

    /// `target.c = source.c` for every listed column, joined with `AND`.
    ///
    /// Returns `None` for an empty column list.
    pub fn join_on<S: AsRef<str>>(columns: &[S]) -> Option<Self> {
        columns
            .iter()
            .map(|c| Expr::target(c.as_ref()).eq(Expr::source(c.as_ref())))
            .reduce(Expr::and)
    }

    /// Evaluate to a value. Logical operators yield `Bool` or `Null`.
    pub fn eval(&self, row: EvalRow<'_>) -> Value {
        match self {
            Expr::Column { side, name } => {
                let r = match side {
                    Side::Target => row.target,
                    Side::Source => row.source,
                };
                r.map_or(Value::Null, |r| r.value(name).clone())
            }
            Expr::Literal(v) => v.clone(),
            Expr::Compare { op, left, right } => {
                let (l, r) = (left.eval(row), right.eval(row));
                match l.compare(&r) {
                    Some(ord) => Value::Bool(match op {
                        CompareOp::Eq => ord.is_eq(),
                        CompareOp::NotEq => ord.is_ne(),
                        CompareOp::Lt => ord.is_lt(),
                        CompareOp::LtEq => ord.is_le(),
                        CompareOp::Gt => ord.is_gt(),
                        CompareOp::GtEq => ord.is_ge(),
                    }),
                    None => Value::Null,
                }
            }
            Expr::And(a, b) => match (truth(&a.eval(row)), truth(&b.eval(row))) {
                (Some(false), _) | (_, Some(false)) => Value::Bool(false),
                (Some(true), Some(true)) => Value::Bool(true),
                _ => Value::Null,
            },
            Expr::Or(a, b) => match (truth(&a.eval(row)), truth(&b.eval(row))) {
                (Some(true), _) | (_, Some(true)) => Value::Bool(true),
                (Some(false), Some(false)) => Value::Bool(false),
                _ => Value::Null,
            },
            Expr::Not(e) => truth(&e.eval(row)).map_or(Value::Null, |b| Value::Bool(!b)),
            Expr::IsNull(e) => Value::Bool(e.eval(row).is_null()),
        }
    }

    /// True only when the expression evaluates to `true`.
    pub fn holds(&self, row: EvalRow<'_>) -> bool {
        truth(&self.eval(row)) == Some(true)
    }

    /// Every column reference, in tree order.
    pub fn columns(&self) -> Vec<(Side, &str)> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<(Side, &'a str)>) {
        match self {
            Expr::Column { side, name } => out.push((*side, name)),
            Expr::Literal(_) => {}
            Expr::Compare { left, right, .. } => {
                left.collect_columns(out);
                right.collect_columns(out);
            }
            Expr::And(a, b) | Expr::Or(a, b) => {
                a.collect_columns(out);
                b.collect_columns(out);
            }
            Expr::Not(e) | Expr::IsNull(e) => e.collect_columns(out),
        }
    }

    /// Check every column reference against the schemas of the sides that
    /// are available. `target` is `None` where target columns are not in
    /// scope, such as not-matched clauses.
    pub fn check_columns(
        &self,
        target: Option<&LogicalSchema>,
        source: &LogicalSchema,
    ) -> Result<(), String> {
        for (side, name) in self.columns() {
            let schema = match side {
                Side::Target => target.ok_or_else(|| {
                    format!("target.{name} cannot be referenced where no target row exists")
                })?,
                Side::Source => source,
            };
            if !schema.contains(name) {
                return Err(format!("{side}.{name} does not exist"));
            }
        }
        Ok(())
    }

    /// Top-level `target.a = source.b` conjuncts as `(a, b)` pairs, usable
    /// as hash-join keys.
    pub fn equi_join_keys(&self) -> Vec<(&str, &str)> {
        let mut keys = Vec::new();
        self.collect_equi_keys(&mut keys);
        keys
    }

    fn collect_equi_keys<'a>(&'a self, out: &mut Vec<(&'a str, &'a str)>) {
        match self {
            Expr::And(a, b) => {
                a.collect_equi_keys(out);
                b.collect_equi_keys(out);
            }
            Expr::Compare {
                op: CompareOp::Eq,
                left,
                right,
            } => match (left.as_ref(), right.as_ref()) {
                (
                    Expr::Column {
                        side: Side::Target,
                        name: t,
                    },
                    Expr::Column {
                        side: Side::Source,
                        name: s,
                    },
                )
                | (
                    Expr::Column {
                        side: Side::Source,
                        name: s,
                    },
                    Expr::Column {
                        side: Side::Target,
                        name: t,
                    },
                ) => out.push((t, s)),
                _ => {}
            },
            _ => {}
        }
    }
}

fn truth(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        _ => None,
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Column { side, name } => write!(f, "{side}.{name}"),
            Expr::Literal(Value::Utf8(s)) => write!(f, "'{}'", s.replace('\'', "''")),
            Expr::Literal(v) => write!(f, "{v}"),
            Expr::Compare { op, left, right } => write!(f, "{left} {op} {right}"),
            Expr::And(a, b) => write!(f, "({a} AND {b})"),
            Expr::Or(a, b) => write!(f, "({a} OR {b})"),
            Expr::Not(e) => write!(f, "NOT {e}"),
            Expr::IsNull(e) => write!(f, "{e} IS NULL"),
        }
    }
}
