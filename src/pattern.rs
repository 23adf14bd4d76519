//! Structural pattern matching, shared by declarations, function and
//! generator calls, `for` binders, `match` arms and `catch` cases.
//!
//! Matching is pure: a pattern and a value either produce the bindings the
//! pattern introduces or `None`. A name used twice in one pattern must bind
//! equal values both times.

use crate::node::{BinaryOp, Node, NodeKind, UnaryOp};
use crate::value::{MapValue, Value};
use std::collections::HashMap;

pub type Bindings = HashMap<String, Value>;

/// Matches a single pattern against a value.
pub fn match_pattern(pattern: &Node, value: &Value) -> Option<Bindings> {
    bind(pattern, value, Bindings::new())
}

/// Matches a case's parameter list against call arguments. The arity must be
/// exact unless the last pattern is a spread, which collects the rest.
pub fn match_patterns(patterns: &[Node], values: &[Value]) -> Option<Bindings> {
    bind_sequence(patterns, values, Bindings::new(), true)
}

fn bind_name(name: &str, value: &Value, mut bindings: Bindings) -> Option<Bindings> {
    match bindings.get(name) {
        Some(existing) if existing != value => None,
        Some(_) => Some(bindings),
        None => {
            bindings.insert(name.to_string(), value.clone());
            Some(bindings)
        }
    }
}

fn bind(pattern: &Node, value: &Value, bindings: Bindings) -> Option<Bindings> {
    match &pattern.kind {
        NodeKind::Identifier(name) => bind_name(name, value, bindings),
        NodeKind::ElsePattern => Some(bindings),
        NodeKind::Spread(inner) => bind(inner, value, bindings),
        NodeKind::List(elements) => match value {
            Value::List(items) => bind_sequence(elements, items, bindings, false),
            _ => None,
        },
        NodeKind::Map(pairs) => match value {
            Value::Map(map) => bind_map(pairs, map, bindings),
            _ => None,
        },
        NodeKind::RangePattern { start, end } => {
            let low = start.as_deref().map(literal_number);
            let high = end.as_deref().map(literal_number);
            in_range(value, low, high).then_some(bindings)
        }
        NodeKind::Binary {
            op: BinaryOp::Range,
            left,
            right,
        } => in_range(value, Some(literal_number(left)), Some(literal_number(right)))
            .then_some(bindings),
        _ => {
            let expected = literal_value(pattern)?;
            (expected == *value).then_some(bindings)
        }
    }
}

/// Positional matching. Argument lists need an exact arity, list patterns
/// match a prefix of the list.
fn bind_sequence(
    patterns: &[Node],
    values: &[Value],
    mut bindings: Bindings,
    exact: bool,
) -> Option<Bindings> {
    let (fixed, rest) = match patterns.split_last() {
        Some((
            Node {
                kind: NodeKind::Spread(name),
                ..
            },
            fixed,
        )) => (fixed, Some(name)),
        _ => (patterns, None),
    };
    if values.len() < fixed.len() || (exact && rest.is_none() && values.len() != fixed.len()) {
        return None;
    }
    for (pattern, value) in fixed.iter().zip(values) {
        bindings = bind(pattern, value, bindings)?;
    }
    match rest {
        Some(name) => bind(name, &Value::list(values[fixed.len()..].to_vec()), bindings),
        None => Some(bindings),
    }
}

fn bind_map(pairs: &[Node], map: &MapValue, mut bindings: Bindings) -> Option<Bindings> {
    let mut matched = Vec::new();
    let mut rest = None;
    for pair in pairs {
        match &pair.kind {
            NodeKind::Pair { key, value } => {
                let key = literal_value(key)?;
                let entry = map.get(&key)?;
                bindings = match (value, &key) {
                    (Some(pattern), _) => bind(pattern, entry, bindings)?,
                    (None, Value::String(name)) => bind_name(name, entry, bindings)?,
                    (None, _) => return None,
                };
                matched.push(key);
            }
            NodeKind::Spread(name) => rest = Some(name),
            _ => return None,
        }
    }
    match rest {
        Some(name) => {
            let remaining: MapValue = map
                .iter()
                .filter(|(key, _)| !matched.contains(key))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            bind(name, &Value::map(remaining), bindings)
        }
        None => Some(bindings),
    }
}

/// The value of a literal pattern, including negated number literals.
fn literal_value(pattern: &Node) -> Option<Value> {
    match &pattern.kind {
        NodeKind::Number(n) => Some(Value::Number(*n)),
        NodeKind::String(s) => Some(Value::string(s.clone())),
        NodeKind::Boolean(b) => Some(Value::Boolean(*b)),
        NodeKind::Nothing => Some(Value::Nothing),
        NodeKind::Unary {
            op: UnaryOp::Neg,
            operand,
        } => match literal_value(operand)? {
            Value::Number(n) => Some(Value::Number(-n)),
            _ => None,
        },
        _ => None,
    }
}

fn literal_number(bound: &Node) -> Option<f64> {
    match literal_value(bound)? {
        Value::Number(n) => Some(n),
        _ => None,
    }
}

// A bound that is present but not a number never matches.
fn in_range(value: &Value, low: Option<Option<f64>>, high: Option<Option<f64>>) -> bool {
    let Value::Number(n) = value else {
        return false;
    };
    let above = match low {
        Some(Some(low)) => *n >= low,
        Some(None) => false,
        None => true,
    };
    let below = match high {
        Some(Some(high)) => *n < high,
        Some(None) => false,
        None => true,
    };
    above && below
}
