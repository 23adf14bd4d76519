use crate::environment::{Env, Environment};
use crate::node::{BinaryOp, Node, NodeKind, UnaryOp, format_number};
use crate::pattern::{Bindings, match_pattern, match_patterns};
use crate::source::Meta;
use crate::value::{Closure, MapValue, Value};
use std::cell::RefCell;
use std::rc::Rc;
use thiserror::Error;

// --- Evaluation Error ---

/// Failures that escape a whole module evaluation.
#[derive(Debug, Clone, Error)]
pub enum EvalError {
    #[error("Uncaught error: {message}")]
    Uncaught {
        value: Value,
        message: String,
        /// Call sites and the raising node, outermost first.
        stack: Vec<Meta>,
    },
    #[error("'yield' used outside of a generator")]
    YieldOutsideGenerator,
    #[error("'return' used outside of a function")]
    ReturnOutsideFunction,
}

// --- Control flow ---

/// The result of evaluating one node. Anything but `Normal` stops every
/// enclosing sequence and is passed up unchanged.
#[derive(Debug, Clone)]
pub enum Flow {
    Normal(Value),
    Returning(Value),
    Throwing(Value),
    Yielding(Value),
}

// Unwraps a `Result<Value, Flow>` inside a function returning `Flow`.
macro_rules! try_flow {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(flow) => return flow,
        }
    };
}

// Continues with a `Normal` value, passes every other flow up.
macro_rules! normal {
    ($flow:expr) => {
        match $flow {
            Flow::Normal(value) => value,
            other => return other,
        }
    };
}

fn flow(result: Result<Value, Flow>) -> Flow {
    match result {
        Ok(value) => Flow::Normal(value),
        Err(flow) => flow,
    }
}

/// How deeply evaluations may nest, counting every node being evaluated.
const MAX_DEPTH: usize = 256;

const MAX_LENGTH: f64 = 10_000_000.0;

// --- Generators ---

/// Where a suspended coroutine continues. Frames are pushed innermost first
/// while a yield unwinds and popped outermost first when it resumes.
enum Frame {
    Yielded,
    Block { index: usize, env: Env },
    If { then: bool },
    While { last: Value },
    For {
        source: Iteration,
        results: Vec<Value>,
        env: Env,
    },
    Case { index: usize, env: Env },
    Try(TryStage),
}

enum TryStage {
    Body,
    Catch { index: usize, env: Env },
    Finally(Flow),
}

enum CoroutineState {
    Fresh,
    Suspended(Vec<Frame>),
    Running,
    Finished,
}

/// A live generator instance: the selected case, its scope and how far the
/// body has run.
pub struct Coroutine {
    cases: Rc<Vec<Node>>,
    case: usize,
    env: Env,
    state: CoroutineState,
}

enum Iteration {
    Values(std::vec::IntoIter<Value>),
    Coroutine(Rc<RefCell<Coroutine>>),
}

impl Iteration {
    fn new(value: Value) -> Result<Iteration, String> {
        let items = match value {
            Value::List(items) => items.as_ref().clone(),
            Value::String(s) => s.chars().map(|c| Value::string(c.to_string())).collect(),
            Value::Map(map) => map.keys().cloned().collect(),
            Value::Instance(env) => {
                let names = env.borrow().local_names();
                names.into_iter().map(Value::String).collect()
            }
            Value::Coroutine(coroutine) => return Ok(Iteration::Coroutine(coroutine)),
            other => return Err(format!("Cannot iterate over a {}", other.type_name())),
        };
        Ok(Iteration::Values(items.into_iter()))
    }

    fn next(&mut self, ctx: &EvalContext) -> Result<Option<Value>, Flow> {
        match self {
            Iteration::Values(items) => Ok(items.next()),
            Iteration::Coroutine(coroutine) => resume(coroutine, ctx),
        }
    }
}

// --- Context ---

#[derive(Default)]
struct Trace {
    calls: Vec<Meta>,
    /// Where the most recent `throw` happened.
    thrown: Vec<Meta>,
    depth: usize,
}

// One level of evaluation nesting, released on drop.
struct Depth(Rc<RefCell<Trace>>);

impl Drop for Depth {
    fn drop(&mut self) {
        self.0.borrow_mut().depth -= 1;
    }
}

/// Everything a node is evaluated against: the current scope, the shared
/// call trace and, inside a generator body, the frames of its suspension.
#[derive(Clone)]
pub struct EvalContext {
    env: Env,
    trace: Rc<RefCell<Trace>>,
    frames: Option<Rc<RefCell<Vec<Frame>>>>,
}

impl EvalContext {
    pub fn new(env: Env) -> Self {
        EvalContext {
            env,
            trace: Rc::default(),
            frames: None,
        }
    }

    fn with_env(&self, env: Env) -> Self {
        EvalContext {
            env,
            trace: self.trace.clone(),
            frames: self.frames.clone(),
        }
    }

    // Function and class bodies never suspend the caller's generator.
    fn enter(&self, env: Env) -> Self {
        EvalContext {
            env,
            trace: self.trace.clone(),
            frames: None,
        }
    }

    fn descend(&self) -> Option<Depth> {
        let mut trace = self.trace.borrow_mut();
        if trace.depth >= MAX_DEPTH {
            return None;
        }
        trace.depth += 1;
        Some(Depth(self.trace.clone()))
    }

    fn take_frame(&self) -> Option<Frame> {
        self.frames.as_ref()?.borrow_mut().pop()
    }

    fn suspend(&self, frame: Frame) {
        if let Some(frames) = &self.frames {
            frames.borrow_mut().push(frame);
        }
    }

    fn discard_frames(&self) {
        if let Some(frames) = &self.frames {
            frames.borrow_mut().clear();
        }
    }

    fn snapshot(&self, node: &Node) -> Vec<Meta> {
        let mut stack = self.trace.borrow().calls.clone();
        stack.extend(node.meta.clone());
        stack
    }

    /// Throws a runtime error raised at `node`.
    fn raise(&self, message: impl Into<String>, node: &Node) -> Flow {
        let stack = self.snapshot(node);
        self.trace.borrow_mut().thrown = stack.clone();
        Flow::Throwing(Value::error(message, stack))
    }

    fn uncaught(&self, value: Value) -> EvalError {
        let (message, stack) = match &value {
            Value::Error(error) => (error.message.clone(), error.stack.clone()),
            _ => (value.to_string(), self.trace.borrow().thrown.clone()),
        };
        EvalError::Uncaught {
            value,
            message,
            stack,
        }
    }
}

// --- Evaluate Function ---

/// Evaluates a module's statements directly in `env`, so definitions stay
/// visible to later evaluations against the same scope. Returns the value of
/// the last statement.
pub fn evaluate(module: &Node, env: Env) -> Result<Value, EvalError> {
    let ctx = EvalContext::new(env.clone());
    let result = match &module.kind {
        NodeKind::Module(statements) => run_statements(statements, 0, env, &ctx),
        _ => eval(module, &ctx),
    };
    match result {
        Flow::Normal(value) => Ok(value),
        Flow::Throwing(value) => Err(ctx.uncaught(value)),
        Flow::Returning(_) => Err(EvalError::ReturnOutsideFunction),
        Flow::Yielding(_) => Err(EvalError::YieldOutsideGenerator),
    }
}

/// Evaluates one node. Nesting deeper than `MAX_DEPTH` throws.
pub fn eval(node: &Node, ctx: &EvalContext) -> Flow {
    let Some(_depth) = ctx.descend() else {
        return ctx.raise("Maximum depth exceeded", node);
    };
    dispatch(node, ctx)
}

fn dispatch(node: &Node, ctx: &EvalContext) -> Flow {
    match &node.kind {
        NodeKind::Number(n) => Flow::Normal(Value::Number(*n)),
        NodeKind::String(s) => Flow::Normal(Value::string(s.clone())),
        NodeKind::Boolean(b) => Flow::Normal(Value::Boolean(*b)),
        NodeKind::Nothing => Flow::Normal(Value::Nothing),
        NodeKind::Identifier(name) => lookup(name, node, ctx),

        NodeKind::Module(statements) => run_statements(statements, 0, ctx.env.clone(), ctx),
        NodeKind::Block(statements) => evaluate_block(statements, ctx),
        NodeKind::Declare {
            pattern,
            value,
            doc,
        } => evaluate_declare(pattern, value, doc.as_deref(), node, ctx),
        NodeKind::Assign { target, value } => evaluate_assign(target, value, ctx),
        NodeKind::Return(value) => Flow::Returning(normal!(eval(value, ctx))),
        NodeKind::Throw(value) => {
            let thrown = normal!(eval(value, ctx));
            let stack = ctx.snapshot(node);
            ctx.trace.borrow_mut().thrown = stack;
            Flow::Throwing(thrown)
        }
        NodeKind::Yield(value) => evaluate_yield(value, ctx),
        NodeKind::Extend(value) => evaluate_extend(value, ctx),

        NodeKind::List(elements) => flow(evaluate_list(elements, ctx)),
        NodeKind::Map(pairs) => flow(evaluate_map(pairs, ctx)),
        NodeKind::Function(cases) => Flow::Normal(Value::Function(closure(cases, ctx))),
        NodeKind::Generator(cases) => Flow::Normal(Value::Generator(closure(cases, ctx))),
        NodeKind::Class(cases) => Flow::Normal(Value::Class(closure(cases, ctx))),

        NodeKind::If {
            condition,
            then,
            otherwise,
        } => evaluate_if(condition, then, otherwise.as_deref(), ctx),
        NodeKind::While { condition, body } => evaluate_while(condition, body, ctx),
        NodeKind::For {
            pattern,
            iterable,
            guard,
            while_guard,
            body,
        } => evaluate_for(
            pattern,
            iterable,
            guard.as_deref(),
            while_guard.as_deref(),
            body,
            ctx,
        ),
        NodeKind::Match { subject, cases } => evaluate_match(subject, cases, node, ctx),
        NodeKind::Try {
            body,
            catch,
            finally,
        } => evaluate_try(body, catch, finally.as_deref(), ctx),

        NodeKind::Binary { op, left, right } => {
            flow(evaluate_binary(*op, left, right, node, ctx))
        }
        NodeKind::Unary { op, operand } => flow(evaluate_unary(*op, operand, node, ctx)),
        NodeKind::Call { callee, arguments } => {
            flow(evaluate_call(callee, arguments, node, ctx))
        }
        NodeKind::Access { target, key } => flow(evaluate_access(target, key, node, ctx)),
        NodeKind::Spread(_) => ctx.raise(
            "Spread is only allowed in lists, maps and call arguments",
            node,
        ),

        NodeKind::Pair { .. }
        | NodeKind::Case { .. }
        | NodeKind::RangePattern { .. }
        | NodeKind::ElsePattern
        | NodeKind::Terminator(_)
        | NodeKind::Doc(_)
        | NodeKind::Punctuation(_)
        | NodeKind::Operator(_)
        | NodeKind::Keyword(_)
        | NodeKind::Eof => ctx.raise(format!("Cannot evaluate {}", node.kind.describe()), node),
    }
}

/// Evaluates a node whose value is needed right away. A yield cannot
/// suspend from here.
fn operand(node: &Node, ctx: &EvalContext) -> Result<Value, Flow> {
    match eval(node, ctx) {
        Flow::Normal(value) => Ok(value),
        Flow::Yielding(_) => {
            ctx.discard_frames();
            Err(ctx.raise("Cannot yield from inside an expression", node))
        }
        other => Err(other),
    }
}

fn lookup(name: &str, node: &Node, ctx: &EvalContext) -> Flow {
    let found = ctx.env.borrow().get(name);
    match found {
        Ok(value) => Flow::Normal(value),
        Err(e) => ctx.raise(e.to_string(), node),
    }
}

fn closure(cases: &Rc<Vec<Node>>, ctx: &EvalContext) -> Rc<Closure> {
    Rc::new(Closure {
        cases: cases.clone(),
        env: ctx.env.clone(),
    })
}

// --- Statements ---

fn evaluate_block(statements: &[Node], ctx: &EvalContext) -> Flow {
    let (start, env) = match ctx.take_frame() {
        Some(Frame::Block { index, env }) => (index, env),
        _ => (0, Environment::new_enclosed(ctx.env.clone())),
    };
    run_statements(statements, start, env, ctx)
}

fn run_statements(statements: &[Node], start: usize, env: Env, ctx: &EvalContext) -> Flow {
    let inner = ctx.with_env(env.clone());
    let mut last = Value::Nothing;
    for (index, statement) in statements.iter().enumerate().skip(start) {
        match eval(statement, &inner) {
            Flow::Normal(value) => last = value,
            Flow::Yielding(value) => {
                ctx.suspend(Frame::Block { index, env });
                return Flow::Yielding(value);
            }
            other => return other,
        }
    }
    Flow::Normal(last)
}

fn evaluate_declare(
    pattern: &Node,
    value: &Node,
    doc: Option<&str>,
    node: &Node,
    ctx: &EvalContext,
) -> Flow {
    let value = normal!(eval(value, ctx));
    let Some(bindings) = match_pattern(pattern, &value) else {
        return ctx.raise(format!("Cannot match declaration against {}", value), node);
    };
    let mut env = ctx.env.borrow_mut();
    for (name, bound) in bindings {
        if let Some(doc) = doc {
            env.define(name.clone(), bound);
            env.document(name, doc);
        } else {
            env.define(name, bound);
        }
    }
    Flow::Normal(value)
}

fn evaluate_assign(target: &Node, value: &Node, ctx: &EvalContext) -> Flow {
    let NodeKind::Identifier(name) = &target.kind else {
        return ctx.raise("Only names can be assigned to", target);
    };
    let value = normal!(eval(value, ctx));
    let assigned = ctx.env.borrow_mut().assign(name, value.clone());
    match assigned {
        Ok(()) => Flow::Normal(value),
        Err(e) => ctx.raise(e.to_string(), target),
    }
}

fn evaluate_yield(value: &Node, ctx: &EvalContext) -> Flow {
    if let Some(Frame::Yielded) = ctx.take_frame() {
        return Flow::Normal(Value::Nothing);
    }
    let value = try_flow!(operand(value, ctx));
    ctx.suspend(Frame::Yielded);
    Flow::Yielding(value)
}

// `extend` declares every string key of a map, or every field of an
// instance, in the current scope.
fn evaluate_extend(value: &Node, ctx: &EvalContext) -> Flow {
    let extension = normal!(eval(value, ctx));
    let bindings: Vec<(String, Value)> = match &extension {
        Value::Map(map) => map
            .iter()
            .filter_map(|(key, value)| match key {
                Value::String(name) => Some((name.clone(), value.clone())),
                _ => None,
            })
            .collect(),
        Value::Instance(env) => {
            let env = env.borrow();
            env.local_names()
                .into_iter()
                .filter_map(|name| env.get_local(&name).map(|value| (name, value)))
                .collect()
        }
        other => return ctx.raise(format!("Cannot extend with a {}", other.type_name()), value),
    };
    ctx.env.borrow_mut().merge(bindings);
    Flow::Normal(extension)
}

// --- Aggregates ---

fn spread_into(
    items: &mut Vec<Value>,
    value: Value,
    node: &Node,
    ctx: &EvalContext,
) -> Result<(), Flow> {
    match value {
        Value::List(list) => items.extend(list.iter().cloned()),
        Value::Coroutine(coroutine) => {
            while let Some(item) = resume(&coroutine, ctx)? {
                items.push(item);
            }
        }
        other => return Err(ctx.raise(format!("Cannot spread a {}", other.type_name()), node)),
    }
    Ok(())
}

/// Evaluates list elements or call arguments, splicing spread operands.
fn evaluate_sequence(elements: &[Node], ctx: &EvalContext) -> Result<Vec<Value>, Flow> {
    let mut items = Vec::with_capacity(elements.len());
    for element in elements {
        match &element.kind {
            NodeKind::Spread(inner) => {
                let value = operand(inner, ctx)?;
                spread_into(&mut items, value, element, ctx)?;
            }
            _ => items.push(operand(element, ctx)?),
        }
    }
    Ok(items)
}

fn evaluate_list(elements: &[Node], ctx: &EvalContext) -> Result<Value, Flow> {
    Ok(Value::list(evaluate_sequence(elements, ctx)?))
}

fn evaluate_map(pairs: &[Node], ctx: &EvalContext) -> Result<Value, Flow> {
    let mut map = MapValue::new();
    for pair in pairs {
        match &pair.kind {
            NodeKind::Pair { key, value } => {
                let key_value = operand(key, ctx)?;
                let mapped = match (value, &key_value) {
                    (Some(value), _) => operand(value, ctx)?,
                    // Shorthand `name` maps "name" to the variable's value.
                    (None, Value::String(name)) => match lookup(name, key, ctx) {
                        Flow::Normal(value) => value,
                        other => return Err(other),
                    },
                    (None, _) => return Err(ctx.raise("Map entries need a value", pair)),
                };
                map.insert(key_value, mapped);
            }
            NodeKind::Spread(inner) => match operand(inner, ctx)? {
                Value::Map(other) => {
                    for (key, value) in other.iter() {
                        map.insert(key.clone(), value.clone());
                    }
                }
                Value::Instance(env) => {
                    let env = env.borrow();
                    for name in env.local_names() {
                        if let Some(value) = env.get_local(&name) {
                            map.insert(Value::String(name), value);
                        }
                    }
                }
                other => {
                    return Err(ctx.raise(
                        format!("Cannot spread a {} into a map", other.type_name()),
                        pair,
                    ));
                }
            },
            _ => map.insert(operand(pair, ctx)?, Value::Nothing),
        }
    }
    Ok(Value::map(map))
}

// --- Control expressions ---

fn suspending(result: Flow, ctx: &EvalContext, frame: impl FnOnce() -> Frame) -> Flow {
    if let Flow::Yielding(_) = result {
        ctx.suspend(frame());
    }
    result
}

fn evaluate_if(condition: &Node, then: &Node, otherwise: Option<&Node>, ctx: &EvalContext) -> Flow {
    let branch = match ctx.take_frame() {
        Some(Frame::If { then }) => then,
        _ => try_flow!(operand(condition, ctx)).is_truthy(),
    };
    let taken = if branch { Some(then) } else { otherwise };
    match taken {
        Some(node) => suspending(eval(node, ctx), ctx, || Frame::If { then: branch }),
        None => Flow::Normal(Value::Nothing),
    }
}

fn evaluate_while(condition: &Node, body: &Node, ctx: &EvalContext) -> Flow {
    let (mut resuming, mut last) = match ctx.take_frame() {
        Some(Frame::While { last }) => (true, last),
        _ => (false, Value::Nothing),
    };
    loop {
        if !resuming && !try_flow!(operand(condition, ctx)).is_truthy() {
            break;
        }
        resuming = false;
        match eval(body, ctx) {
            Flow::Normal(value) => last = value,
            Flow::Yielding(value) => {
                ctx.suspend(Frame::While { last });
                return Flow::Yielding(value);
            }
            other => return other,
        }
    }
    Flow::Normal(last)
}

fn evaluate_for(
    pattern: &Node,
    iterable: &Node,
    guard: Option<&Node>,
    while_guard: Option<&Node>,
    body: &Node,
    ctx: &EvalContext,
) -> Flow {
    let (mut source, mut results, mut resumed) = match ctx.take_frame() {
        Some(Frame::For {
            source,
            results,
            env,
        }) => (source, results, Some(env)),
        _ => {
            let value = try_flow!(operand(iterable, ctx));
            match Iteration::new(value) {
                Ok(source) => (source, Vec::new(), None),
                Err(message) => return ctx.raise(message, iterable),
            }
        }
    };
    loop {
        let env = match resumed.take() {
            Some(env) => env,
            None => {
                let Some(item) = try_flow!(source.next(ctx)) else {
                    break;
                };
                let Some(bindings) = match_pattern(pattern, &item) else {
                    let message = format!("Cannot match loop pattern against {}", item);
                    return ctx.raise(message, pattern);
                };
                let env = Environment::new_enclosed(ctx.env.clone());
                env.borrow_mut().merge(bindings);
                let inner = ctx.with_env(env.clone());
                if let Some(guard) = guard
                    && !try_flow!(operand(guard, &inner)).is_truthy()
                {
                    continue;
                }
                if let Some(while_guard) = while_guard
                    && !try_flow!(operand(while_guard, &inner)).is_truthy()
                {
                    break;
                }
                env
            }
        };
        match eval(body, &ctx.with_env(env.clone())) {
            Flow::Normal(value) => results.push(value),
            Flow::Yielding(value) => {
                ctx.suspend(Frame::For {
                    source,
                    results,
                    env,
                });
                return Flow::Yielding(value);
            }
            other => return other,
        }
    }
    Flow::Normal(Value::list(results))
}

/// The patterns, guard and body of a case node.
fn case_parts(case: &Node) -> (&[Node], Option<&Node>, &Node) {
    match &case.kind {
        NodeKind::Case {
            patterns,
            guard,
            body,
        } => (patterns.as_deref().unwrap_or(&[]), guard.as_deref(), body.as_ref()),
        _ => (&[][..], None, case),
    }
}

/// Finds the first case whose patterns match `arguments` and whose guard
/// holds. The winning case's bindings live in a new scope inside `outer`.
/// With `bare_matches_any`, a case without patterns accepts any arguments.
fn select_case(
    cases: &[Node],
    arguments: &[Value],
    outer: &Env,
    bare_matches_any: bool,
    ctx: &EvalContext,
) -> Result<Option<(usize, Env)>, Flow> {
    for (index, case) in cases.iter().enumerate() {
        let (patterns, guard, _) = case_parts(case);
        let matched = if bare_matches_any && patterns.is_empty() {
            Some(Bindings::new())
        } else {
            match_patterns(patterns, arguments)
        };
        let Some(bindings) = matched else {
            continue;
        };
        let env = Environment::new_enclosed(outer.clone());
        env.borrow_mut().merge(bindings);
        if let Some(guard) = guard
            && !operand(guard, &ctx.with_env(env.clone()))?.is_truthy()
        {
            continue;
        }
        return Ok(Some((index, env)));
    }
    Ok(None)
}

fn evaluate_match(subject: &Node, cases: &[Node], node: &Node, ctx: &EvalContext) -> Flow {
    let (index, env) = match ctx.take_frame() {
        Some(Frame::Case { index, env }) => (index, env),
        _ => {
            let value = try_flow!(operand(subject, ctx));
            match try_flow!(select_case(cases, &[value.clone()], &ctx.env, false, ctx)) {
                Some(selected) => selected,
                None => return ctx.raise(format!("Failed to match {}", value), node),
            }
        }
    };
    let (_, _, body) = case_parts(&cases[index]);
    let result = eval(body, &ctx.with_env(env.clone()));
    suspending(result, ctx, || Frame::Case { index, env })
}

fn evaluate_try(body: &Node, catch: &[Node], finally: Option<&Node>, ctx: &EvalContext) -> Flow {
    let stage = match ctx.take_frame() {
        Some(Frame::Try(stage)) => stage,
        _ => TryStage::Body,
    };
    let outcome = match stage {
        TryStage::Body => match eval(body, ctx) {
            Flow::Yielding(value) => {
                ctx.suspend(Frame::Try(TryStage::Body));
                return Flow::Yielding(value);
            }
            Flow::Throwing(thrown) => {
                match try_flow!(select_case(catch, &[thrown.clone()], &ctx.env, true, ctx)) {
                    Some((index, env)) => {
                        match run_catch(catch, index, env, ctx) {
                            Flow::Yielding(value) => return Flow::Yielding(value),
                            other => other,
                        }
                    }
                    None => Flow::Throwing(thrown),
                }
            }
            other => other,
        },
        TryStage::Catch { index, env } => match run_catch(catch, index, env, ctx) {
            Flow::Yielding(value) => return Flow::Yielding(value),
            other => other,
        },
        TryStage::Finally(pending) => pending,
    };
    let Some(finally) = finally else {
        return outcome;
    };
    match eval(finally, ctx) {
        Flow::Normal(_) => outcome,
        Flow::Yielding(value) => {
            ctx.suspend(Frame::Try(TryStage::Finally(outcome)));
            Flow::Yielding(value)
        }
        overriding => overriding,
    }
}

fn run_catch(catch: &[Node], index: usize, env: Env, ctx: &EvalContext) -> Flow {
    let (_, _, body) = case_parts(&catch[index]);
    let result = eval(body, &ctx.with_env(env.clone()));
    suspending(result, ctx, || Frame::Try(TryStage::Catch { index, env }))
}

// --- Operators ---

fn evaluate_binary(
    op: BinaryOp,
    left: &Node,
    right: &Node,
    node: &Node,
    ctx: &EvalContext,
) -> Result<Value, Flow> {
    let lhs = operand(left, ctx)?;
    // `and` and `or` short-circuit and produce an operand.
    match op {
        BinaryOp::And if !lhs.is_truthy() => return Ok(lhs),
        BinaryOp::Or if lhs.is_truthy() => return Ok(lhs),
        BinaryOp::And | BinaryOp::Or => return operand(right, ctx),
        _ => {}
    }
    let rhs = operand(right, ctx)?;
    binary(op, &lhs, &rhs).map_err(|message| ctx.raise(message, node))
}

fn binary(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value, String> {
    use Value::{Boolean, List, Number};
    let mismatch = || {
        format!(
            "Unsupported operand types for '{}': {} and {}",
            op.tag(),
            lhs.type_name(),
            rhs.type_name()
        )
    };
    let value = match (op, lhs, rhs) {
        (BinaryOp::Eq, _, _) => Boolean(lhs == rhs),
        (BinaryOp::Neq, _, _) => Boolean(lhs != rhs),
        (BinaryOp::Is, _, _) => Boolean(lhs.is_identical(rhs)),
        (BinaryOp::IsNot, _, _) => Boolean(!lhs.is_identical(rhs)),
        (BinaryOp::Lt | BinaryOp::Lte | BinaryOp::Gt | BinaryOp::Gte, _, _) => {
            let ordering = match (lhs, rhs) {
                (Number(a), Number(b)) => a.partial_cmp(b),
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => return Err(mismatch()),
            };
            Boolean(match ordering {
                Some(ordering) => match op {
                    BinaryOp::Lt => ordering.is_lt(),
                    BinaryOp::Lte => ordering.is_le(),
                    BinaryOp::Gt => ordering.is_gt(),
                    _ => ordering.is_ge(),
                },
                None => false,
            })
        }
        (BinaryOp::In, _, _) => Boolean(contains(rhs, lhs)?),
        (BinaryOp::NotIn, _, _) => Boolean(!contains(rhs, lhs)?),
        (BinaryOp::Add, Number(a), Number(b)) => Number(a + b),
        (BinaryOp::Add, Value::String(a), Value::String(b)) => Value::string(format!("{a}{b}")),
        (BinaryOp::Add, List(a), List(b)) => {
            Value::list(a.iter().chain(b.iter()).cloned().collect())
        }
        (BinaryOp::Sub, Number(a), Number(b)) => Number(a - b),
        (BinaryOp::Mul, Number(a), Number(b)) => Number(a * b),
        (BinaryOp::Mul, Value::String(s), Number(n))
        | (BinaryOp::Mul, Number(n), Value::String(s)) => {
            Value::string(s.repeat(repetitions(*n, s.len())?))
        }
        (BinaryOp::Mul, List(items), Number(n)) | (BinaryOp::Mul, Number(n), List(items)) => {
            let count = repetitions(*n, items.len())?;
            Value::list(items.iter().cloned().cycle().take(items.len() * count).collect())
        }
        (BinaryOp::Div, Number(_), Number(b)) if *b == 0.0 => {
            return Err("Division by zero".to_string());
        }
        (BinaryOp::Div, Number(a), Number(b)) => Number(a / b),
        (BinaryOp::Pow, Number(a), Number(b)) => Number(a.powf(*b)),
        (BinaryOp::Range, Number(a), Number(b)) => range(*a, *b)?,
        _ => return Err(mismatch()),
    };
    Ok(value)
}

// A repeat count for a sequence of `len` elements, capped at `MAX_LENGTH`
// elements in the result.
fn repetitions(n: f64, len: usize) -> Result<usize, String> {
    if n.fract() != 0.0 || n < 0.0 || !n.is_finite() {
        return Err(format!("Cannot repeat {} times", format_number(n)));
    }
    if len as f64 * n > MAX_LENGTH {
        return Err("Repetition is too large".to_string());
    }
    Ok(n as usize)
}

/// `a..b`: the integers from `a` up to but excluding `b`.
fn range(start: f64, end: f64) -> Result<Value, String> {
    if start.fract() != 0.0 || end.fract() != 0.0 {
        return Err(format!(
            "Range bounds must be integers, got {} and {}",
            format_number(start),
            format_number(end)
        ));
    }
    if end - start > MAX_LENGTH {
        return Err("Range is too large".to_string());
    }
    let (start, end) = (start as i64, end as i64);
    Ok(Value::list((start..end).map(|n| Value::Number(n as f64)).collect()))
}

fn contains(container: &Value, item: &Value) -> Result<bool, String> {
    match (container, item) {
        (Value::List(items), _) => Ok(items.contains(item)),
        (Value::String(haystack), Value::String(needle)) => Ok(haystack.contains(needle.as_str())),
        (Value::Map(map), _) => Ok(map.contains_key(item)),
        (Value::Instance(env), Value::String(name)) => Ok(env.borrow().get_local(name).is_some()),
        _ => Err(format!(
            "Cannot look for a {} in a {}",
            item.type_name(),
            container.type_name()
        )),
    }
}

fn evaluate_unary(
    op: UnaryOp,
    operand_node: &Node,
    node: &Node,
    ctx: &EvalContext,
) -> Result<Value, Flow> {
    let value = operand(operand_node, ctx)?;
    match (op, &value) {
        (UnaryOp::Not, _) => Ok(Value::Boolean(!value.is_truthy())),
        (UnaryOp::Pos, Value::Number(n)) => Ok(Value::Number(*n)),
        (UnaryOp::Neg, Value::Number(n)) => Ok(Value::Number(-n)),
        _ => Err(ctx.raise(
            format!("Unsupported operand type for '{}': {}", op.tag(), value.type_name()),
            node,
        )),
    }
}

// --- Access ---

fn evaluate_access(
    target: &Node,
    key: &Node,
    node: &Node,
    ctx: &EvalContext,
) -> Result<Value, Flow> {
    let target = operand(target, ctx)?;
    let result = match &key.kind {
        NodeKind::RangePattern { start, end } => {
            let start = start.as_deref().map(|n| operand(n, ctx)).transpose()?;
            let end = end.as_deref().map(|n| operand(n, ctx)).transpose()?;
            slice(&target, start.as_ref(), end.as_ref())
        }
        NodeKind::Binary {
            op: BinaryOp::Range,
            left,
            right,
        } => {
            let start = operand(left, ctx)?;
            let end = operand(right, ctx)?;
            slice(&target, Some(&start), Some(&end))
        }
        _ => {
            let key = operand(key, ctx)?;
            index(&target, &key)
        }
    };
    result.map_err(|message| ctx.raise(message, node))
}

fn position(index: f64, len: usize) -> Option<usize> {
    if index.fract() != 0.0 || !index.is_finite() {
        return None;
    }
    let index = if index < 0.0 { len as f64 + index } else { index };
    (index >= 0.0 && index < len as f64).then_some(index as usize)
}

fn index(target: &Value, key: &Value) -> Result<Value, String> {
    match (target, key) {
        (Value::List(items), Value::Number(n)) => position(*n, items.len())
            .map(|i| items[i].clone())
            .ok_or_else(|| format!("List index {} out of range", format_number(*n))),
        (Value::String(s), Value::Number(n)) => {
            let chars: Vec<char> = s.chars().collect();
            position(*n, chars.len())
                .map(|i| Value::string(chars[i].to_string()))
                .ok_or_else(|| format!("String index {} out of range", format_number(*n)))
        }
        (Value::Map(map), _) => map
            .get(key)
            .cloned()
            .ok_or_else(|| format!("Key {} not found", key)),
        (Value::Instance(env), Value::String(name)) => env
            .borrow()
            .get_local(name)
            .ok_or_else(|| format!("Instance has no field '{}'", name)),
        (Value::Error(error), Value::String(name)) if name == "message" => {
            Ok(Value::string(error.message.clone()))
        }
        (Value::Error(error), Value::String(name)) if name == "stack" => Ok(Value::list(
            error
                .stack
                .iter()
                .map(|meta| Value::string(meta.matched()))
                .collect(),
        )),
        _ => Err(format!(
            "Cannot index a {} with a {}",
            target.type_name(),
            key.type_name()
        )),
    }
}

// Open bounds default to the ends; negative bounds count from the end.
fn slice(target: &Value, start: Option<&Value>, end: Option<&Value>) -> Result<Value, String> {
    let bound = |value: Option<&Value>, default: usize, len: usize| -> Result<usize, String> {
        match value {
            None => Ok(default),
            Some(Value::Number(n)) if n.fract() == 0.0 => {
                let n = if *n < 0.0 { len as f64 + n } else { *n };
                Ok(n.clamp(0.0, len as f64) as usize)
            }
            Some(other) => Err(format!("Cannot slice with a {}", other.type_name())),
        }
    };
    match target {
        Value::List(items) => {
            let from = bound(start, 0, items.len())?;
            let to = bound(end, items.len(), items.len())?;
            Ok(Value::list(items.get(from..to.max(from)).unwrap_or(&[]).to_vec()))
        }
        Value::String(s) => {
            let chars: Vec<char> = s.chars().collect();
            let from = bound(start, 0, chars.len())?;
            let to = bound(end, chars.len(), chars.len())?;
            let sliced: String = chars.get(from..to.max(from)).unwrap_or(&[]).iter().collect();
            Ok(Value::string(sliced))
        }
        other => Err(format!("Cannot slice a {}", other.type_name())),
    }
}

// --- Calls ---

fn evaluate_call(
    callee: &Node,
    arguments: &[Node],
    node: &Node,
    ctx: &EvalContext,
) -> Result<Value, Flow> {
    let function = operand(callee, ctx)?;
    let arguments = evaluate_sequence(arguments, ctx)?;
    let site = node.meta.clone();
    if let Some(site) = &site {
        ctx.trace.borrow_mut().calls.push(site.clone());
    }
    let result = apply(&function, arguments, node, ctx);
    if site.is_some() {
        ctx.trace.borrow_mut().calls.pop();
    }
    result
}

/// Calls any callable value with already evaluated arguments.
fn apply(
    function: &Value,
    arguments: Vec<Value>,
    node: &Node,
    ctx: &EvalContext,
) -> Result<Value, Flow> {
    match function {
        Value::Function(closure) => {
            let (index, env) = select(closure, &arguments, node, ctx)?;
            let (_, _, body) = case_parts(&closure.cases[index]);
            match eval(body, &ctx.enter(env)) {
                Flow::Normal(value) | Flow::Returning(value) => Ok(value),
                Flow::Yielding(_) => Err(ctx.raise("Cannot yield from a function", node)),
                thrown => Err(thrown),
            }
        }
        Value::Generator(closure) => {
            let (index, env) = select(closure, &arguments, node, ctx)?;
            Ok(Value::Coroutine(Rc::new(RefCell::new(Coroutine {
                cases: closure.cases.clone(),
                case: index,
                env,
                state: CoroutineState::Fresh,
            }))))
        }
        Value::Coroutine(coroutine) => Ok(resume(coroutine, ctx)?.unwrap_or(Value::Nothing)),
        Value::Class(closure) => {
            let (index, env) = select(closure, &arguments, node, ctx)?;
            let (_, _, body) = case_parts(&closure.cases[index]);
            let statements = match &body.kind {
                NodeKind::Block(statements) => statements.as_slice(),
                _ => std::slice::from_ref(body),
            };
            match run_statements(statements, 0, env.clone(), &ctx.enter(env.clone())) {
                Flow::Normal(_) => Ok(Value::Instance(env)),
                Flow::Returning(value) => Ok(value),
                Flow::Yielding(_) => Err(ctx.raise("Cannot yield from a class body", node)),
                thrown => Err(thrown),
            }
        }
        Value::Builtin(builtin) => {
            (builtin.func)(arguments).map_err(|message| ctx.raise(message, node))
        }
        other => Err(ctx.raise(format!("A {} is not callable", other.type_name()), node)),
    }
}

fn select(
    closure: &Closure,
    arguments: &[Value],
    node: &Node,
    ctx: &EvalContext,
) -> Result<(usize, Env), Flow> {
    match select_case(&closure.cases, arguments, &closure.env, false, ctx)? {
        Some(selected) => Ok(selected),
        None => {
            let shown: Vec<String> = arguments.iter().map(|a| a.to_string()).collect();
            Err(ctx.raise(
                format!("Failed to match arguments ({})", shown.join(", ")),
                node,
            ))
        }
    }
}

/// Runs a coroutine up to its next `yield`. `Ok(None)` once it has finished.
fn resume(coroutine: &Rc<RefCell<Coroutine>>, ctx: &EvalContext) -> Result<Option<Value>, Flow> {
    let (cases, case, env, frames) = {
        let mut co = coroutine.borrow_mut();
        let frames = match std::mem::replace(&mut co.state, CoroutineState::Running) {
            CoroutineState::Fresh => Vec::new(),
            CoroutineState::Suspended(frames) => frames,
            CoroutineState::Finished => {
                co.state = CoroutineState::Finished;
                return Ok(None);
            }
            CoroutineState::Running => {
                let stack = ctx.trace.borrow().calls.clone();
                return Err(Flow::Throwing(Value::error("Coroutine is already running", stack)));
            }
        };
        (co.cases.clone(), co.case, co.env.clone(), frames)
    };
    let frames = Rc::new(RefCell::new(frames));
    let inner = EvalContext {
        env,
        trace: ctx.trace.clone(),
        frames: Some(frames.clone()),
    };
    let (_, _, body) = case_parts(&cases[case]);
    let result = eval(body, &inner);
    let mut co = coroutine.borrow_mut();
    match result {
        Flow::Yielding(value) => {
            co.state = CoroutineState::Suspended(frames.take());
            Ok(Some(value))
        }
        Flow::Normal(_) | Flow::Returning(_) => {
            co.state = CoroutineState::Finished;
            Ok(None)
        }
        thrown => {
            co.state = CoroutineState::Finished;
            Err(thrown)
        }
    }
}

// --- Unit Tests ---
#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_str;

    fn run(input: &str) -> Result<Value, EvalError> {
        let module =
            parse_str(input).unwrap_or_else(|e| panic!("Parse failed for '{}': {}", input, e));
        evaluate(&module, Environment::new_global_populated())
    }

    // Evaluates `input` in a fresh global scope and compares the displayed value.
    fn assert_eval(input: &str, expected: &str) {
        match run(input) {
            Ok(value) => assert_eq!(value.to_string(), expected, "Input: '{}'", input),
            Err(e) => panic!("Eval failed for '{}': {}", input, e),
        }
    }

    // Expects an uncaught error whose message contains `fragment`.
    fn assert_throws(input: &str, fragment: &str) {
        match run(input) {
            Ok(value) => panic!("Expected '{}' to throw, got {}", input, value),
            Err(EvalError::Uncaught { message, .. }) => assert!(
                message.contains(fragment),
                "Input: '{}', message: '{}'",
                input,
                message
            ),
            Err(e) => panic!("Expected an uncaught error for '{}', got {:?}", input, e),
        }
    }

    #[test]
    fn test_eval_literals() {
        assert_eval("1", "1");
        assert_eval("\"a\"", "\"a\"");
        assert_eval("True", "True");
        assert_eval("Nothing", "Nothing");
        assert_eval("", "Nothing");
    }

    #[test]
    fn test_eval_arithmetic() {
        assert_eval("1 + 2 * 3", "7");
        assert_eval("10 - 4 - 3", "3");
        assert_eval("2 ^ 3 ^ 2", "512");
        assert_eval("7 / 2", "3.5");
        assert_eval("-(2 + 3)", "-5");
        assert_eval("\"ab\" + \"cd\"", "\"abcd\"");
        assert_eval("\"ab\" * 2", "\"abab\"");
        assert_eval("List [1] + List [2]", "List [ 1, 2 ]");
        assert_eval("List [0] * 3", "List [ 0, 0, 0 ]");
        assert_throws("\"ab\" * 1e18", "Repetition is too large");
        assert_throws("List [1, 2] * 1e17", "Repetition is too large");
        assert_throws("List [1, 2] * 6000000", "Repetition is too large");
        assert_throws("1 / 0", "Division by zero");
        assert_throws("1 + \"a\"", "Unsupported operand types");
    }

    #[test]
    fn test_eval_comparison() {
        assert_eval("1 < 2", "True");
        assert_eval("2 <= 1", "False");
        assert_eval("\"a\" < \"b\"", "True");
        assert_eval("List [1, 2] == List [1, 2]", "True");
        assert_eval("List [1, 2] is List [1, 2]", "False");
        assert_eval("var xs = List [1]; xs is xs", "True");
        assert_eval("var k = List [1]; var m = Map [a: k]; m.a is k", "True");
        assert_eval("var m = Map [a: List [1]]; m.a is List [1]", "False");
        assert_eval("var m = Map [a: 1]; List [m is m, m is Map [a: 1]]", "List [ True, False ]");
        assert_eval("1 /= 2", "True");
        assert_eval("3 is not 3", "False");
        assert_throws("1 < \"a\"", "Unsupported operand types");
    }

    #[test]
    fn test_eval_membership() {
        assert_eval("2 in List [1, 2]", "True");
        assert_eval("\"ell\" in \"hello\"", "True");
        assert_eval("\"k\" not in Map [k: 1]", "False");
    }

    #[test]
    fn test_logical_operators_return_operands() {
        assert_eval("Nothing or 5", "5");
        assert_eval("0 or 5", "0");
        assert_eval("False and undefined", "False");
        assert_eval("1 and 2", "2");
        assert_eval("not Nothing", "True");
        assert_eval("not 0", "False");
    }

    #[test]
    fn test_truthiness() {
        assert_eval("if 0 then { 1 } else { 2 }", "1");
        assert_eval("if \"\" then { 1 } else { 2 }", "1");
        assert_eval("if List [] then { 1 } else { 2 }", "1");
        assert_eval("if False then { 1 } else { 2 }", "2");
        assert_eval("if Nothing then { 1 } else { 2 }", "2");
        assert_eval("if False then { 1 }", "Nothing");
    }

    #[test]
    fn test_declaration_and_assignment() {
        assert_eval("var x = 4\nx = x + 1\nx", "5");
        assert_eval("var List [a, b] = List [1, 2]; a + b", "3");
        assert_throws("y = 1", "Unbound variable: 'y'");
        assert_throws("var List [a] = 1", "Cannot match declaration");
        assert_throws("undefined", "Unbound variable");
    }

    #[test]
    fn test_assignment_updates_the_declaring_scope() {
        assert_eval("var x = 1; do { x = 2 }; x", "2");
        assert_eval("var x = 1; do { var x = 5; x = 6 }; x", "1");
    }

    #[test]
    fn test_documented_declaration() {
        let env = Environment::new_global_populated();
        let module =
            parse_str("-- doubles a number\nvar double = Function { x -> x * 2 }").unwrap();
        evaluate(&module, env.clone()).unwrap();
        assert_eq!(env.borrow().doc("double"), Some(" doubles a number".to_string()));
    }

    #[test]
    fn test_blocks_create_scopes() {
        assert_throws("do { var inner = 1 }; inner", "Unbound variable: 'inner'");
        assert_eval("var x = 1; do { var x = 2; x }", "2");
    }

    #[test]
    fn test_eval_ranges() {
        assert_eval("1..4", "List [ 1, 2, 3 ]");
        assert_eval("3..3", "List []");
        assert_throws("1.5..3", "Range bounds must be integers");
    }

    #[test]
    fn test_eval_access() {
        assert_eval("List [1, 2, 3][0]", "1");
        assert_eval("List [1, 2, 3][-1]", "3");
        assert_eval("List [1, 2, 3, 4][1..3]", "List [ 2, 3 ]");
        assert_eval("List [1, 2, 3, 4][2..]", "List [ 3, 4 ]");
        assert_eval("\"hello\"[1]", "\"e\"");
        assert_eval("\"hello\"[..2]", "\"he\"");
        assert_eval("Map [a: 1].a", "1");
        assert_eval("Map [[1 + 1]: \"two\"][2]", "\"two\"");
        assert_throws("List [1][5]", "out of range");
        assert_throws("Map [a: 1].b", "not found");
    }

    #[test]
    fn test_eval_map_literals() {
        assert_eval("var a = 1; Map [a, b: 2]", "Map [ \"a\": 1, \"b\": 2 ]");
        assert_eval(
            "var m = Map [a: 1]; Map [...m, b: 2]",
            "Map [ \"a\": 1, \"b\": 2 ]",
        );
    }

    #[test]
    fn test_eval_spread() {
        assert_eval("var xs = List [2, 3]; List [1, ...xs, 4]", "List [ 1, 2, 3, 4 ]");
        assert_eval(
            "var add = Function { a, b, c -> a + b + c }; add(...List [1, 2, 3])",
            "6",
        );
        assert_throws("...List [1]", "Spread is only allowed");
        assert_throws("List [...1]", "Cannot spread");
    }

    #[test]
    fn test_extend() {
        assert_eval("extend Map [a: 1, b: 2]; a + b", "3");
    }

    #[test]
    fn test_eval_functions() {
        assert_eval("var f = Function { x -> x + 1 }; f(1)", "2");
        assert_eval("Function { x -> x * 2 }(4)", "8");
        assert_eval("var f = Function { return 3; 4 }; f()", "3");
        assert_eval(
            "var f = Function { x if x < 0 => 0, x => x }\nf(-5)",
            "0",
        );
        assert_eval(
            "var f = Function { x if x < 0 => 0, x => x }\nf(5)",
            "5",
        );
        assert_throws("var f = Function { 1 => 1 }; f(2)", "Failed to match arguments (2)");
        assert_throws("1(2)", "not callable");
    }

    #[test]
    fn test_case_ordering() {
        assert_eval("var f = Function { x => 1, 1 => 2 }; f(1)", "1");
        assert_eval("var f = Function { 1 => 2, x => 1 }; f(1)", "2");
    }

    #[test]
    fn test_non_linear_parameters() {
        assert_eval("var same = Function { a, a => True, a, b => False }; same(1, 1)", "True");
        assert_eval("var same = Function { a, a => True, a, b => False }; same(1, 2)", "False");
    }

    #[test]
    fn test_closures_are_lexical() {
        assert_eval(
            "var make = Function { n -> Function { x -> x + n } }\nvar add2 = make(2)\nvar n = 100\nadd2(1)",
            "3",
        );
        assert_eval(
            "var counter = Function { var count = 0; Function { count = count + 1 } }\nvar next = counter()\nnext(); next()",
            "2",
        );
    }

    #[test]
    fn test_recursion() {
        assert_eval(
            "var fact = Function { 0 => 1, n => n * fact(n - 1) }; fact(5)",
            "120",
        );
    }

    #[test]
    fn test_depth_limit_throws() {
        assert_throws(
            "var f = Function { 0 => 0, n => 1 + f(n - 1) }; f(195)",
            "Maximum depth exceeded",
        );
        assert_eval(
            "var f = Function { 0 => 0, n => 1 + f(n - 1) }; f(20)",
            "20",
        );
    }

    #[test]
    fn test_depth_limit_is_catchable() {
        assert_eval(
            "var f = Function { n -> 1 + f(n + 1) }\ntry { f(0) } catch { e => e.message }",
            "\"Maximum depth exceeded\"",
        );
    }

    #[test]
    fn test_depth_limit_counts_nested_constructs() {
        let source = "
var f = Function { 0 => 0, n =>
    if True then {
        match n with {
            m => try { do { for x in List [m] do { return f(x - 1) } } } catch { e => throw e }
        }
    }
}
f(1000)";
        assert_throws(source, "Maximum depth exceeded");
        assert_throws(
            "var g = Function { n => while True do { return g(n + 1) } }; g(0)",
            "Maximum depth exceeded",
        );
    }

    #[test]
    fn test_return_outside_function() {
        assert!(matches!(run("return 1"), Err(EvalError::ReturnOutsideFunction)));
    }

    #[test]
    fn test_eval_while() {
        assert_eval("var i = 0; while i < 3 do { i = i + 1 }", "3");
        assert_eval("var i = 0; while i < 3 do { i = i + 1 }; i", "3");
        assert_eval("while False do { 1 }", "Nothing");
    }

    #[test]
    fn test_eval_for() {
        assert_eval("for x in List [1, 2, 3] do { x * 2 }", "List [ 2, 4, 6 ]");
        assert_eval("for x in 0..6 if x / 2 == 1 do { x }", "List [ 2 ]");
        assert_eval("for x in 0..10 while x < 3 do { x }", "List [ 0, 1, 2 ]");
        assert_eval("for c in \"ab\" do { c }", "List [ \"a\", \"b\" ]");
        assert_eval("for k in Map [a: 1, b: 2] do { k }", "List [ \"a\", \"b\" ]");
        assert_eval(
            "for List [a, b] in List [List [1, 2], List [3, 4]] do { a + b }",
            "List [ 3, 7 ]",
        );
        assert_throws("for x in 5 do { x }", "Cannot iterate");
    }

    #[test]
    fn test_eval_match() {
        assert_eval("match 2 with { 1 => \"one\", 2 => \"two\" }", "\"two\"");
        assert_eval("match 15 with { 0..10 => \"low\", else => \"high\" }", "\"high\"");
        assert_eval(
            "match List [1, 2, 3] with { List [head, ...tail] => tail }",
            "List [ 2, 3 ]",
        );
        assert_eval("match Map [x: 1, y: 2] with { Map [x, y] => x + y }", "3");
        assert_throws("match 3 with { 1 => 1 }", "Failed to match 3");
    }

    #[test]
    fn test_eval_try() {
        assert_eval("try { throw 99 } catch { e => e + 1 }", "100");
        assert_eval("try { 1 } catch { e => 2 }", "1");
        assert_eval("try { 1 / 0 } catch { e => e.message }", "\"Division by zero\"");
        assert_throws("try { throw 1 } catch { throw 2 }", "2");
    }

    #[test]
    fn test_try_rethrows_and_finally() {
        assert_throws("try { throw \"boom\" } catch { 1 => 1 }", "\"boom\"");
        assert_eval(
            "var log = List []\ntry { throw 1 } catch { e => e } finally { log = log + List [\"done\"] }\nlog",
            "List [ \"done\" ]",
        );
        assert_eval(
            "var f = Function { try { return 1 } catch { e => e } finally { return 2 } }; f()",
            "2",
        );
    }

    #[test]
    fn test_throw_crosses_function_boundaries() {
        assert_eval(
            "var fail = Function { throw \"deep\" }\ntry { fail() } catch { e => e }",
            "\"deep\"",
        );
    }

    #[test]
    fn test_uncaught_error_carries_call_stack() {
        let err = run("var f = Function { x -> x / 0 }\nf(1)").unwrap_err();
        match err {
            EvalError::Uncaught { message, stack, .. } => {
                assert_eq!(message, "Division by zero");
                let sites: Vec<&str> = stack.iter().map(|meta| meta.matched()).collect();
                assert_eq!(sites, vec!["f(1)", "x / 0"]);
            }
            other => panic!("Expected an uncaught error, got {:?}", other),
        }
    }

    #[test]
    fn test_generators() {
        assert_eval(
            "var count = Generator { n -> var i = 0; while i < n do { yield i; i = i + 1 } }\nvar c = count(3)\nList [c(), c(), c(), c()]",
            "List [ 0, 1, 2, Nothing ]",
        );
        assert_eval(
            "var g = Generator { yield 1; yield 2 }\nfor x in g() do { x * 10 }",
            "List [ 10, 20 ]",
        );
        assert_eval(
            "var g = Generator { for x in List [1, 2] do { yield x; yield x } }\nList [...g()]",
            "List [ 1, 1, 2, 2 ]",
        );
    }

    #[test]
    fn test_generator_resumes_inside_nested_constructs() {
        assert_eval(
            "var g = Generator { x -> if x then { yield 1; yield 2 } else { yield 3 }; yield 4 }\nList [...g(True)]",
            "List [ 1, 2, 4 ]",
        );
        assert_eval(
            "var g = Generator { match 1 with { 1 => yield \"one\" }; try { yield \"body\"; throw 0 } catch { e => yield \"caught\" } }\nList [...g()]",
            "List [ \"one\", \"body\", \"caught\" ]",
        );
    }

    #[test]
    fn test_coroutines_are_not_restartable() {
        assert_eval(
            "var g = Generator { yield 1 }\nvar c = g()\nc(); List [c(), c()]",
            "List [ Nothing, Nothing ]",
        );
        assert_eval(
            "var g = Generator { yield 1 }\nList [g()(), g()()]",
            "List [ 1, 1 ]",
        );
    }

    #[test]
    fn test_yield_outside_generator() {
        assert!(matches!(run("yield 1"), Err(EvalError::YieldOutsideGenerator)));
        assert_throws("var f = Function { yield 1 }; f()", "Cannot yield from a function");
    }

    #[test]
    fn test_classes() {
        assert_eval(
            "var Point = Class { x, y -> var norm = Function { x * x + y * y } }\nvar p = Point(3, 4)\np.norm()",
            "25",
        );
        assert_eval(
            "var Counter = Class { var count = 0; var bump = Function { count = count + 1 } }\nvar c = Counter()\nc.bump(); c.bump(); c.count",
            "2",
        );
        assert_eval("var P = Class { x -> var y = x }; P(1)", "Instance [ x: 1, y: 1 ]");
        assert_eval("var P = Class { return 7 }; P()", "7");
    }
}
