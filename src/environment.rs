use crate::value::{Builtin, BuiltinFunc, Value};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EnvError {
    #[error("Unbound variable: '{0}'")]
    UnboundVariable(String),
}

/// A shared handle to one scope. Closures, instances and coroutines keep
/// their defining scope alive through it.
pub type Env = Rc<RefCell<Environment>>;

// --- Environment Definition ---

#[derive(Default)]
pub struct Environment {
    outer: Option<Env>,
    bindings: HashMap<String, Value>,
    docs: HashMap<String, String>,
}

impl Environment {
    /// Creates a new, top-level environment.
    pub fn new() -> Env {
        Rc::new(RefCell::new(Environment::default()))
    }

    /// A top-level environment holding the builtin prelude.
    pub fn new_global_populated() -> Env {
        let env_ptr = Environment::new();
        {
            let mut env = env_ptr.borrow_mut();
            for &(name, func) in crate::primitives::PRELUDE {
                env.add_builtin(name, func);
            }
        }
        env_ptr
    }

    /// Creates a new environment enclosed within an outer one.
    pub fn new_enclosed(outer_env: Env) -> Env {
        Rc::new(RefCell::new(Environment {
            outer: Some(outer_env),
            ..Environment::default()
        }))
    }

    /// Defines a variable in the *current* scope, shadowing any outer
    /// binding of the same name. A redefinition drops the old doc comment.
    pub fn define(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        self.docs.remove(&name);
        self.bindings.insert(name, value);
    }

    /// Defines every binding in the current scope.
    pub fn merge(&mut self, bindings: impl IntoIterator<Item = (String, Value)>) {
        for (name, value) in bindings {
            self.define(name, value);
        }
    }

    /// Looks a name up in this scope, then outwards.
    pub fn get(&self, name: &str) -> Result<Value, EnvError> {
        if let Some(value) = self.bindings.get(name) {
            return Ok(value.clone());
        }
        match &self.outer {
            Some(outer_env_ptr) => outer_env_ptr.borrow().get(name),
            None => Err(EnvError::UnboundVariable(name.to_string())),
        }
    }

    /// Looks a name up in this scope only.
    pub fn get_local(&self, name: &str) -> Option<Value> {
        self.bindings.get(name).cloned()
    }

    /// Updates the nearest scope that declares `name`. Never declares.
    pub fn assign(&mut self, name: &str, value: Value) -> Result<(), EnvError> {
        if let Some(slot) = self.bindings.get_mut(name) {
            *slot = value;
            return Ok(());
        }
        match &self.outer {
            Some(outer_env_ptr) => outer_env_ptr.borrow_mut().assign(name, value),
            None => Err(EnvError::UnboundVariable(name.to_string())),
        }
    }

    /// Records the doc comment of a declared name in the current scope.
    pub fn document(&mut self, name: impl Into<String>, doc: impl Into<String>) {
        self.docs.insert(name.into(), doc.into());
    }

    /// The doc comment of the nearest declaration of `name`, if it had one.
    pub fn doc(&self, name: &str) -> Option<String> {
        if self.bindings.contains_key(name) {
            return self.docs.get(name).cloned();
        }
        self.outer.as_ref()?.borrow().doc(name)
    }

    fn add_builtin(&mut self, name: &'static str, func: BuiltinFunc) {
        self.define(name, Value::Builtin(Builtin { name, func }));
    }

    /// The names bound in this scope only, sorted.
    pub fn local_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.bindings.keys().cloned().collect();
        names.sort();
        names
    }

    /// Gets all identifiers visible from this scope.
    pub fn get_identifiers(&self) -> HashSet<String> {
        let mut identifiers: HashSet<String> = self.bindings.keys().cloned().collect();
        if let Some(outer_env_ptr) = &self.outer {
            identifiers.extend(outer_env_ptr.borrow().get_identifiers());
        }
        identifiers
    }
}

// --- Unit Tests ---
#[cfg(test)]
mod tests {
    use super::*;

    fn num(n: f64) -> Value {
        Value::Number(n)
    }

    #[test]
    fn test_define_and_get_global() {
        let env = Environment::new();
        env.borrow_mut().define("x", num(10.0));
        assert_eq!(env.borrow().get("x"), Ok(num(10.0)));
    }

    #[test]
    fn test_get_unbound() {
        let env = Environment::new();
        let local_env = Environment::new_enclosed(env);
        assert_eq!(
            local_env.borrow().get("z"),
            Err(EnvError::UnboundVariable("z".to_string()))
        );
    }

    #[test]
    fn test_shadowing() {
        let global_env = Environment::new();
        global_env.borrow_mut().define("x", num(10.0));

        let local_env = Environment::new_enclosed(global_env.clone());
        local_env.borrow_mut().define("x", num(50.0));

        let inner_local_env = Environment::new_enclosed(local_env.clone());
        inner_local_env.borrow_mut().define("y", num(1.0));

        assert_eq!(inner_local_env.borrow().get("x"), Ok(num(50.0)));
        assert_eq!(inner_local_env.borrow().get("y"), Ok(num(1.0)));
        assert_eq!(local_env.borrow().get("x"), Ok(num(50.0)));
        assert_eq!(global_env.borrow().get("x"), Ok(num(10.0)));
    }

    #[test]
    fn test_assign_updates_nearest_declaring_scope() {
        let global_env = Environment::new();
        global_env.borrow_mut().define("x", num(1.0));
        let local_env = Environment::new_enclosed(global_env.clone());

        local_env.borrow_mut().assign("x", num(2.0)).unwrap();
        assert_eq!(global_env.borrow().get("x"), Ok(num(2.0)));
        assert_eq!(local_env.borrow().get_local("x"), None);
    }

    #[test]
    fn test_assign_never_declares() {
        let env = Environment::new();
        assert_eq!(
            env.borrow_mut().assign("x", num(2.0)),
            Err(EnvError::UnboundVariable("x".to_string()))
        );
        assert!(env.borrow().get("x").is_err());
    }

    #[test]
    fn test_merge_and_identifiers() {
        let global_env = Environment::new();
        global_env.borrow_mut().define("a", num(1.0));
        let local_env = Environment::new_enclosed(global_env);
        local_env
            .borrow_mut()
            .merge([("b".to_string(), num(2.0)), ("c".to_string(), num(3.0))]);

        let identifiers = local_env.borrow().get_identifiers();
        assert_eq!(identifiers.len(), 3);
        assert!(identifiers.contains("a"));
        assert_eq!(local_env.borrow().local_names(), vec!["b", "c"]);
    }

    #[test]
    fn test_docs_follow_the_binding() {
        let global_env = Environment::new();
        global_env.borrow_mut().define("f", num(1.0));
        global_env.borrow_mut().document("f", "adds things");
        let local_env = Environment::new_enclosed(global_env);
        assert_eq!(local_env.borrow().doc("f"), Some("adds things".to_string()));

        // A shadowing declaration without a doc hides the outer one.
        local_env.borrow_mut().define("f", num(2.0));
        assert_eq!(local_env.borrow().doc("f"), None);
    }

    #[test]
    fn test_redefinition_drops_doc() {
        let env = Environment::new();
        env.borrow_mut().define("f", num(1.0));
        env.borrow_mut().document("f", "old");
        env.borrow_mut().define("f", num(2.0));
        assert_eq!(env.borrow().doc("f"), None);
    }

    #[test]
    fn test_global_prelude() {
        let env = Environment::new_global_populated();
        assert!(matches!(env.borrow().get("print"), Ok(Value::Builtin(_))));
        assert!(matches!(env.borrow().get("length"), Ok(Value::Builtin(_))));
    }
}
