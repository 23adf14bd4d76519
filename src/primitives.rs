use crate::value::{BuiltinFunc, Value};

/// The builtins every global scope starts with.
pub const PRELUDE: &[(&str, BuiltinFunc)] = &[
    ("print", prim_print),
    ("length", prim_length),
    ("keys", prim_keys),
    ("nothing?", prim_is_nothing),
    ("boolean?", prim_is_boolean),
    ("number?", prim_is_number),
    ("string?", prim_is_string),
    ("list?", prim_is_list),
    ("map?", prim_is_map),
    ("function?", prim_is_function),
];

// Checks the number of arguments
macro_rules! check_arity {
    ($args:expr, $expected:expr, $name:expr) => {
        if $args.len() != $expected {
            return Err(format!(
                "Primitive '{}' expects exactly {} argument(s), got {}",
                $name,
                $expected,
                $args.len()
            ));
        }
    };
}

// Defines a one-argument type predicate.
macro_rules! predicate {
    ($func:ident, $name:expr, $pattern:pat) => {
        fn $func(args: Vec<Value>) -> Result<Value, String> {
            check_arity!(args, 1, $name);
            Ok(Value::Boolean(matches!(args[0], $pattern)))
        }
    };
}

/// Writes its arguments separated by spaces. Strings are written without
/// quotes.
fn prim_print(args: Vec<Value>) -> Result<Value, String> {
    let line: Vec<String> = args
        .iter()
        .map(|arg| match arg {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect();
    println!("{}", line.join(" "));
    Ok(Value::Nothing)
}

fn prim_length(args: Vec<Value>) -> Result<Value, String> {
    check_arity!(args, 1, "length");
    let length = match &args[0] {
        Value::List(items) => items.len(),
        Value::String(s) => s.chars().count(),
        Value::Map(map) => map.len(),
        other => {
            return Err(format!(
                "Primitive 'length' expects a list, string or map, got {}",
                other.type_name()
            ));
        }
    };
    Ok(Value::Number(length as f64))
}

fn prim_keys(args: Vec<Value>) -> Result<Value, String> {
    check_arity!(args, 1, "keys");
    match &args[0] {
        Value::Map(map) => Ok(Value::list(map.keys().cloned().collect())),
        Value::Instance(env) => {
            let names = env.borrow().local_names();
            Ok(Value::list(names.into_iter().map(Value::String).collect()))
        }
        other => Err(format!(
            "Primitive 'keys' expects a map or instance, got {}",
            other.type_name()
        )),
    }
}

predicate!(prim_is_nothing, "nothing?", Value::Nothing);
predicate!(prim_is_boolean, "boolean?", Value::Boolean(_));
predicate!(prim_is_number, "number?", Value::Number(_));
predicate!(prim_is_string, "string?", Value::String(_));
predicate!(prim_is_list, "list?", Value::List(_));
predicate!(prim_is_map, "map?", Value::Map(_));
predicate!(prim_is_function, "function?", Value::Function(_) | Value::Builtin(_));
