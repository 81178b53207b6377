// Workflow Conditions - boolean expressions over documents
//
// Aggregation-style operator trees used for trigger `dataFilter` and step
// `conditions`. Operands: "$a.b" reads a field of the document, "$$this" or
// "$$this.x" reads the element bound by `$find`, operator objects are
// evaluated, anything else is a literal.

use serde_json::{Map, Value};
use std::cmp::Ordering;
use thiserror::Error;
use tracing::warn;

use super::template::lookup;

#[derive(Error, Debug, PartialEq)]
pub enum ConditionError {
    #[error("unknown operator `{0}`")]
    UnknownOperator(String),
    #[error("`{op}` expects {expected}")]
    Arity { op: String, expected: &'static str },
    #[error("unknown variable `{0}`")]
    UnknownVariable(String),
    #[error("malformed expression: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl CompareOp {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "$eq" => Self::Eq,
            "$ne" => Self::Ne,
            "$gt" => Self::Gt,
            "$gte" => Self::Gte,
            "$lt" => Self::Lt,
            "$lte" => Self::Lte,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Field(String),
    /// Element bound by the enclosing `$find`; empty path is the element itself
    This(String),
    Literal(Value),
    Array(Vec<Operand>),
    Nested(Box<Expression>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Compare(CompareOp, Operand, Operand),
    Membership {
        negated: bool,
        needle: Operand,
        haystack: Operand,
    },
    All(Vec<Expression>),
    Any(Vec<Expression>),
    Not(Box<Expression>),
    Find {
        input: Operand,
        cond: Box<Expression>,
    },
    Exists {
        operand: Operand,
        expected: bool,
    },
    Truthy(Operand),
}

fn is_operator_object(map: &Map<String, Value>) -> bool {
    map.len() == 1 && map.keys().all(|k| k.starts_with('$'))
}

fn pair<'a>(op: &str, args: &'a Value) -> Result<(&'a Value, &'a Value), ConditionError> {
    match args.as_array().map(Vec::as_slice) {
        Some([left, right]) => Ok((left, right)),
        _ => Err(ConditionError::Arity {
            op: op.to_string(),
            expected: "a two-element array",
        }),
    }
}

impl Operand {
    pub fn parse(value: &Value) -> Result<Self, ConditionError> {
        match value {
            Value::String(s) if s.starts_with("$$") => {
                let (var, rest) = s[2..].split_once('.').unwrap_or((&s[2..], ""));
                if var == "this" {
                    Ok(Self::This(rest.to_string()))
                } else {
                    Err(ConditionError::UnknownVariable(s.clone()))
                }
            }
            Value::String(s) if s.len() > 1 && s.starts_with('$') => {
                Ok(Self::Field(s[1..].to_string()))
            }
            Value::Array(items) => items
                .iter()
                .map(Operand::parse)
                .collect::<Result<_, _>>()
                .map(Self::Array),
            Value::Object(map) if map.len() == 1 && map.contains_key("$literal") => {
                Ok(Self::Literal(map["$literal"].clone()))
            }
            Value::Object(map) if is_operator_object(map) => {
                Ok(Self::Nested(Box::new(Expression::parse(value)?)))
            }
            other => Ok(Self::Literal(other.clone())),
        }
    }

    fn resolve(&self, doc: &Value, this: Option<&Value>) -> Value {
        match self {
            Self::Field(path) => lookup(doc, path).cloned().unwrap_or(Value::Null),
            Self::This(path) => match this {
                Some(element) if path.is_empty() => element.clone(),
                Some(element) => lookup(element, path).cloned().unwrap_or(Value::Null),
                None => Value::Null,
            },
            Self::Literal(value) => value.clone(),
            Self::Array(items) => {
                Value::Array(items.iter().map(|item| item.resolve(doc, this)).collect())
            }
            Self::Nested(expr) => Value::Bool(expr.eval(doc, this)),
        }
    }

    fn is_present(&self, doc: &Value, this: Option<&Value>) -> bool {
        match self {
            Self::Field(path) => lookup(doc, path).is_some(),
            Self::This(path) if path.is_empty() => this.is_some(),
            Self::This(path) => this.and_then(|element| lookup(element, path)).is_some(),
            _ => true,
        }
    }
}

impl Expression {
    pub fn parse(value: &Value) -> Result<Self, ConditionError> {
        match value {
            Value::Object(map) if map.is_empty() => Ok(Self::All(Vec::new())),
            Value::Object(map) if map.len() == 1 && map.contains_key("$literal") => {
                Ok(Self::Truthy(Operand::parse(value)?))
            }
            Value::Object(map) => {
                let mut clauses = map
                    .iter()
                    .map(|(key, args)| {
                        if key.starts_with('$') {
                            Self::parse_operator(key, args)
                        } else {
                            Self::parse_field_clause(key, args)
                        }
                    })
                    .collect::<Result<Vec<_>, _>>()?;

                if clauses.len() == 1 {
                    Ok(clauses.remove(0))
                } else {
                    Ok(Self::All(clauses))
                }
            }
            other => Ok(Self::Truthy(Operand::parse(other)?)),
        }
    }

    fn parse_list(op: &str, args: &Value) -> Result<Vec<Self>, ConditionError> {
        args.as_array()
            .ok_or_else(|| ConditionError::Arity {
                op: op.to_string(),
                expected: "an array of expressions",
            })?
            .iter()
            .map(Self::parse)
            .collect()
    }

    fn parse_operator(op: &str, args: &Value) -> Result<Self, ConditionError> {
        if let Some(cmp) = CompareOp::from_name(op) {
            let (left, right) = pair(op, args)?;
            return Ok(Self::Compare(cmp, Operand::parse(left)?, Operand::parse(right)?));
        }

        match op {
            "$in" | "$nin" => {
                let (needle, haystack) = pair(op, args)?;
                Ok(Self::Membership {
                    negated: op == "$nin",
                    needle: Operand::parse(needle)?,
                    haystack: Operand::parse(haystack)?,
                })
            }
            "$and" => Ok(Self::All(Self::parse_list(op, args)?)),
            "$or" => Ok(Self::Any(Self::parse_list(op, args)?)),
            "$not" => {
                let inner = match args {
                    Value::Array(items) if items.len() == 1 => &items[0],
                    Value::Array(_) => {
                        return Err(ConditionError::Arity {
                            op: op.to_string(),
                            expected: "exactly one expression",
                        })
                    }
                    other => other,
                };
                Ok(Self::Not(Box::new(Self::parse(inner)?)))
            }
            "$find" => {
                let (input, cond) = match args {
                    Value::Object(map) => match (map.get("input"), map.get("cond")) {
                        (Some(input), Some(cond)) => (input, cond),
                        _ => {
                            return Err(ConditionError::Arity {
                                op: op.to_string(),
                                expected: "`input` and `cond`",
                            })
                        }
                    },
                    _ => pair(op, args)?,
                };
                Ok(Self::Find {
                    input: Operand::parse(input)?,
                    cond: Box::new(Self::parse(cond)?),
                })
            }
            "$exists" => {
                let (operand, expected) = pair(op, args)?;
                let expected = expected.as_bool().ok_or_else(|| ConditionError::Arity {
                    op: op.to_string(),
                    expected: "[path, bool]",
                })?;
                Ok(Self::Exists {
                    operand: Operand::parse(operand)?,
                    expected,
                })
            }
            other => Err(ConditionError::UnknownOperator(other.to_string())),
        }
    }

    /// `{"field": value}` or `{"field": {"$op": value}}`
    fn parse_field_clause(field: &str, args: &Value) -> Result<Self, ConditionError> {
        let subject = Operand::Field(field.to_string());

        let Value::Object(ops) = args else {
            return Ok(Self::Compare(CompareOp::Eq, subject, Operand::parse(args)?));
        };
        if ops.is_empty() || !ops.keys().all(|k| k.starts_with('$')) || ops.contains_key("$literal") {
            return Ok(Self::Compare(CompareOp::Eq, subject, Operand::parse(args)?));
        }

        let mut clauses = Vec::with_capacity(ops.len());
        for (op, value) in ops {
            let clause = if let Some(cmp) = CompareOp::from_name(op) {
                Self::Compare(cmp, subject.clone(), Operand::parse(value)?)
            } else {
                match op.as_str() {
                    "$in" | "$nin" => Self::Membership {
                        negated: op == "$nin",
                        needle: subject.clone(),
                        haystack: Operand::parse(value)?,
                    },
                    "$exists" => Self::Exists {
                        operand: subject.clone(),
                        expected: value.as_bool().ok_or_else(|| {
                            ConditionError::Malformed(format!("`$exists` on `{}` needs a bool", field))
                        })?,
                    },
                    "$not" => Self::Not(Box::new(Self::parse_field_clause(field, value)?)),
                    other => return Err(ConditionError::UnknownOperator(other.to_string())),
                }
            };
            clauses.push(clause);
        }

        if clauses.len() == 1 {
            Ok(clauses.remove(0))
        } else {
            Ok(Self::All(clauses))
        }
    }

    pub fn eval(&self, doc: &Value, this: Option<&Value>) -> bool {
        match self {
            Self::Compare(op, left, right) => {
                compare(*op, &left.resolve(doc, this), &right.resolve(doc, this))
            }
            Self::Membership {
                negated,
                needle,
                haystack,
            } => match haystack.resolve(doc, this) {
                Value::Array(items) => {
                    let needle = needle.resolve(doc, this);
                    items.iter().any(|item| values_equal(&needle, item)) != *negated
                }
                _ => false,
            },
            Self::All(items) => items.iter().all(|expr| expr.eval(doc, this)),
            Self::Any(items) => items.iter().any(|expr| expr.eval(doc, this)),
            Self::Not(inner) => !inner.eval(doc, this),
            Self::Find { input, cond } => match input.resolve(doc, this) {
                Value::Array(items) => items.iter().any(|item| cond.eval(doc, Some(item))),
                _ => false,
            },
            Self::Exists { operand, expected } => operand.is_present(doc, this) == *expected,
            Self::Truthy(operand) => truthy(&operand.resolve(doc, this)),
        }
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        _ => true,
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

fn ordering(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn compare(op: CompareOp, left: &Value, right: &Value) -> bool {
    match op {
        CompareOp::Eq => values_equal(left, right),
        CompareOp::Ne => !values_equal(left, right),
        CompareOp::Gt => ordering(left, right) == Some(Ordering::Greater),
        CompareOp::Gte => matches!(ordering(left, right), Some(Ordering::Greater | Ordering::Equal)),
        CompareOp::Lt => ordering(left, right) == Some(Ordering::Less),
        CompareOp::Lte => matches!(ordering(left, right), Some(Ordering::Less | Ordering::Equal)),
    }
}

/// Evaluate an expression against `doc`. Malformed expressions are false.
pub fn evaluate(expr: &Value, doc: &Value) -> bool {
    match Expression::parse(expr) {
        Ok(parsed) => parsed.eval(doc, None),
        Err(e) => {
            warn!("Condition rejected, evaluating as false: {}", e);
            false
        }
    }
}

/// An absent, null or empty filter matches every document.
pub fn matches_filter(filter: Option<&Value>, doc: &Value) -> bool {
    match filter {
        None | Some(Value::Null) => true,
        Some(Value::Object(map)) if map.is_empty() => true,
        Some(expr) => evaluate(expr, doc),
    }
}
