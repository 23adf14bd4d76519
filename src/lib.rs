// Declare modules publicly so they are part of the library interface
pub mod environment;
pub mod evaluator;
pub mod lexer;
pub mod node;
pub mod parser;
pub mod parsing;
pub mod pattern;
pub mod pretty_print;
pub mod primitives;
pub mod source;
pub mod value;

pub use environment::{Env, EnvError, Environment};
pub use evaluator::{EvalError, evaluate};
pub use lexer::{LexError, LexErrorKind, tokenize};
pub use node::{Node, NodeKind};
pub use parser::{parse, parse_str};
pub use parsing::ParseError;
pub use source::{Meta, Span};
pub use value::Value;

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Eval(#[from] EvalError),
}

/// Parses and evaluates `source` against `env`.
pub fn run(source: &str, env: Env) -> Result<Value, Error> {
    let module = parse_str(source)?;
    Ok(evaluate(&module, env)?)
}
