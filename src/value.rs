use crate::environment::{Env, Environment};
use crate::evaluator::Coroutine;
use crate::node::{Node, format_number};
use crate::source::Meta;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

pub type BuiltinFunc = fn(Vec<Value>) -> Result<Value, String>;

#[derive(Clone, Copy)]
pub struct Builtin {
    pub name: &'static str,
    pub func: BuiltinFunc,
}

/// The cases of a function, generator or class together with the scope it
/// was defined in.
pub struct Closure {
    pub cases: Rc<Vec<Node>>,
    pub env: Env,
}

/// The error value the evaluator throws for its own failures.
#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub message: String,
    /// Call sites active when the error was raised, outermost first,
    /// followed by the node that raised it.
    pub stack: Vec<Meta>,
}

/// An insertion-ordered map accepting any value as key.
#[derive(Clone, Default)]
pub struct MapValue {
    entries: Vec<(Value, Value)>,
}

impl MapValue {
    pub fn new() -> Self {
        MapValue::default()
    }

    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &Value) -> bool {
        self.get(key).is_some()
    }

    /// Inserts or replaces, keeping the original position of a replaced key.
    pub fn insert(&mut self, key: Value, value: Value) {
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &Value> {
        self.entries.iter().map(|(k, _)| k)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Value, &Value)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(Value, Value)> for MapValue {
    fn from_iter<I: IntoIterator<Item = (Value, Value)>>(iter: I) -> Self {
        let mut map = MapValue::new();
        for (key, value) in iter {
            map.insert(key, value);
        }
        map
    }
}

#[derive(Clone)]
pub enum Value {
    Nothing,
    Boolean(bool),
    Number(f64),
    String(String),
    List(Rc<Vec<Value>>),
    Map(Rc<MapValue>),
    Function(Rc<Closure>),
    Generator(Rc<Closure>),
    Coroutine(Rc<RefCell<Coroutine>>),
    Class(Rc<Closure>),
    /// A constructed class object: a live view of its construction scope.
    Instance(Env),
    Builtin(Builtin),
    Error(Rc<RuntimeError>),
}

impl Value {
    pub fn string(s: impl Into<String>) -> Value {
        Value::String(s.into())
    }

    pub fn list(items: Vec<Value>) -> Value {
        Value::List(Rc::new(items))
    }

    pub fn map(map: MapValue) -> Value {
        Value::Map(Rc::new(map))
    }

    pub fn error(message: impl Into<String>, stack: Vec<Meta>) -> Value {
        Value::Error(Rc::new(RuntimeError {
            message: message.into(),
            stack,
        }))
    }

    /// Only `False` and `Nothing` are falsy.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nothing | Value::Boolean(false))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nothing => "Nothing",
            Value::Boolean(_) => "Boolean",
            Value::Number(_) => "Number",
            Value::String(_) => "String",
            Value::List(_) => "List",
            Value::Map(_) => "Map",
            Value::Function(_) => "Function",
            Value::Generator(_) => "Generator",
            Value::Coroutine(_) => "Coroutine",
            Value::Class(_) => "Class",
            Value::Instance(_) => "Instance",
            Value::Builtin(_) => "Builtin",
            Value::Error(_) => "Error",
        }
    }

    /// `is`: equality for scalars, identity for everything on the heap.
    pub fn is_identical(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b),
            (Value::Map(a), Value::Map(b)) => Rc::ptr_eq(a, b),
            _ => self == other,
        }
    }
}

/// Structural equality; callables, coroutines, instances and errors compare
/// by identity.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nothing, Value::Nothing) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => {
                a.len() == b.len() && a.iter().all(|(k, v)| b.get(k) == Some(v))
            }
            (Value::Function(a), Value::Function(b))
            | (Value::Generator(a), Value::Generator(b))
            | (Value::Class(a), Value::Class(b)) => Rc::ptr_eq(a, b),
            (Value::Coroutine(a), Value::Coroutine(b)) => Rc::ptr_eq(a, b),
            (Value::Instance(a), Value::Instance(b)) => Rc::ptr_eq(a, b),
            (Value::Builtin(a), Value::Builtin(b)) => a.name == b.name,
            (Value::Error(a), Value::Error(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.describe(f, &mut Vec::new())
    }
}

impl Value {
    // `seen` holds the instances being described further up, so a cycle back
    // into one of them prints as `Instance [..]`.
    fn describe(
        &self,
        f: &mut fmt::Formatter<'_>,
        seen: &mut Vec<*const RefCell<Environment>>,
    ) -> fmt::Result {
        match self {
            Value::Nothing => write!(f, "Nothing"),
            Value::Boolean(b) => write!(f, "{}", if *b { "True" } else { "False" }),
            Value::Number(n) => write!(f, "{}", format_number(*n)),
            Value::String(s) => write!(f, "{:?}", s),
            Value::List(items) if items.is_empty() => write!(f, "List []"),
            Value::List(items) => {
                write!(f, "List [ ")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    item.describe(f, seen)?;
                }
                write!(f, " ]")
            }
            Value::Map(map) if map.is_empty() => write!(f, "Map []"),
            Value::Map(map) => {
                write!(f, "Map [ ")?;
                for (i, (key, value)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    key.describe(f, seen)?;
                    write!(f, ": ")?;
                    value.describe(f, seen)?;
                }
                write!(f, " ]")
            }
            Value::Function(_) => write!(f, "<function>"),
            Value::Generator(_) => write!(f, "<generator>"),
            Value::Coroutine(_) => write!(f, "<coroutine>"),
            Value::Class(_) => write!(f, "<class>"),
            Value::Instance(env) => {
                let id = Rc::as_ptr(env);
                if seen.contains(&id) {
                    return write!(f, "Instance [..]");
                }
                let fields: Vec<(String, Value)> = {
                    let env = env.borrow();
                    env.local_names()
                        .into_iter()
                        .filter_map(|name| env.get_local(&name).map(|value| (name, value)))
                        .collect()
                };
                if fields.is_empty() {
                    return write!(f, "Instance []");
                }
                seen.push(id);
                write!(f, "Instance [ ")?;
                for (i, (name, value)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: ", name)?;
                    value.describe(f, seen)?;
                }
                seen.pop();
                write!(f, " ]")
            }
            Value::Builtin(builtin) => write!(f, "<builtin {}>", builtin.name),
            Value::Error(error) => write!(f, "Error: {}", error.message),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn num(n: f64) -> Value {
        Value::Number(n)
    }

    #[test]
    fn test_truthiness() {
        assert!(num(0.0).is_truthy());
        assert!(Value::string("").is_truthy());
        assert!(Value::list(vec![]).is_truthy());
        assert!(Value::Boolean(true).is_truthy());
        assert!(!Value::Boolean(false).is_truthy());
        assert!(!Value::Nothing.is_truthy());
    }

    #[test]
    fn test_structural_equality() {
        assert_eq!(
            Value::list(vec![num(1.0), Value::string("a")]),
            Value::list(vec![num(1.0), Value::string("a")])
        );
        let a: MapValue = [(Value::string("x"), num(1.0)), (num(2.0), Value::Nothing)]
            .into_iter()
            .collect();
        let b: MapValue = [(num(2.0), Value::Nothing), (Value::string("x"), num(1.0))]
            .into_iter()
            .collect();
        assert_eq!(Value::map(a), Value::map(b));
        assert_ne!(num(1.0), Value::string("1"));
    }

    #[test]
    fn test_identity() {
        let list = Value::list(vec![num(1.0)]);
        assert!(list.is_identical(&list.clone()));
        assert!(!list.is_identical(&Value::list(vec![num(1.0)])));
        assert!(num(3.0).is_identical(&num(3.0)));
    }

    #[test]
    fn test_map_insert_keeps_order() {
        let mut map = MapValue::new();
        map.insert(Value::string("b"), num(1.0));
        map.insert(Value::string("a"), num(2.0));
        map.insert(Value::string("b"), num(3.0));
        assert_eq!(map.len(), 2);
        assert_eq!(
            Value::map(map).to_string(),
            r#"Map [ "b": 3, "a": 2 ]"#
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::Nothing.to_string(), "Nothing");
        assert_eq!(Value::Boolean(false).to_string(), "False");
        assert_eq!(num(7.0).to_string(), "7");
        assert_eq!(num(2.5).to_string(), "2.5");
        assert_eq!(num(f64::NEG_INFINITY).to_string(), "-Infinity");
        assert_eq!(Value::string("a\"b\n").to_string(), r#""a\"b\n""#);
        assert_eq!(Value::list(vec![]).to_string(), "List []");
        assert_eq!(
            Value::list(vec![num(1.0), Value::list(vec![num(2.0)])]).to_string(),
            "List [ 1, List [ 2 ] ]"
        );
        assert_eq!(Value::map(MapValue::new()).to_string(), "Map []");
        assert_eq!(Value::error("boom", vec![]).to_string(), "Error: boom");
    }

    #[test]
    fn test_display_instance() {
        let env = Environment::new();
        env.borrow_mut().define("y", num(2.0));
        env.borrow_mut().define("x", num(1.0));
        assert_eq!(Value::Instance(env).to_string(), "Instance [ x: 1, y: 2 ]");
    }

    #[test]
    fn test_display_cyclic_instance() {
        let env = Environment::new();
        let instance = Value::Instance(env.clone());
        env.borrow_mut().define("others", Value::list(vec![instance.clone()]));
        let map: MapValue = [(Value::string("me"), instance.clone())].into_iter().collect();
        env.borrow_mut().define("self", Value::map(map));
        assert_eq!(
            instance.to_string(),
            r#"Instance [ others: List [ Instance [..] ], self: Map [ "me": Instance [..] ] ]"#
        );
    }

    #[test]
    fn test_display_nested_instance() {
        let inner = Environment::new();
        inner.borrow_mut().define("x", num(1.0));
        let outer = Environment::new();
        outer.borrow_mut().define("inner", Value::Instance(inner.clone()));
        outer.borrow_mut().define("again", Value::Instance(inner));
        assert_eq!(
            Value::Instance(outer).to_string(),
            "Instance [ again: Instance [ x: 1 ], inner: Instance [ x: 1 ] ]"
        );
    }

    #[test]
    fn test_identity_of_map_entries() {
        let key = Value::list(vec![num(1.0)]);
        let entry = Value::map(MapValue::new());
        let map: MapValue = [(key.clone(), entry.clone())].into_iter().collect();
        let (stored_key, stored_entry) = map.iter().next().unwrap();
        assert!(stored_key.is_identical(&key));
        assert!(stored_entry.is_identical(&entry));
        assert!(!entry.is_identical(&Value::map(MapValue::new())));
        assert_eq!(map.get(&Value::list(vec![num(1.0)])), Some(&entry));
    }
}
