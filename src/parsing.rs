use crate::lexer::LexError;
use crate::node::{BinaryOp, Node, NodeKind};
use crate::source::{Meta, Span};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("Lexer error: {0}")]
    Lex(#[from] LexError),
    #[error("Expected {expected}, found {found} at {span}")]
    Expected {
        expected: String,
        found: String,
        span: Span,
    },
    #[error("Unexpected {found} at {span}")]
    Incomplete { found: String, span: Span },
    #[error("Nesting deeper than {max} levels at {span}", max = MAX_NESTING)]
    TooDeep { span: Span },
}

/// How many expressions may nest inside each other.
pub const MAX_NESTING: usize = 64;

/// `Ok(None)` means the rule did not apply and the caller may try something
/// else; `Err` aborts the whole parse.
pub type Parsed<T> = Result<Option<T>, ParseError>;

pub type Rule = fn(&mut Stream) -> Parsed<Node>;

/// Which layout tokens a rule looks past before matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Skip {
    pub newlines: bool,
    pub docs: bool,
}

impl Skip {
    pub const ALL: Skip = Skip {
        newlines: true,
        docs: true,
    };
    /// Newlines are significant, docs are not.
    pub const DOCS: Skip = Skip {
        newlines: false,
        docs: true,
    };
    /// Docs are significant, newlines are not.
    pub const NEWLINES: Skip = Skip {
        newlines: true,
        docs: false,
    };

    fn skips(self, kind: &NodeKind) -> bool {
        match kind {
            NodeKind::Terminator("\n") => self.newlines,
            NodeKind::Doc(_) => self.docs,
            _ => false,
        }
    }
}

/// Cursor over an immutable token vector. The last token is always `Eof` and
/// the cursor never moves past it.
pub struct Stream {
    tokens: Vec<Node>,
    position: usize,
    depth: usize,
}

impl Stream {
    pub fn new(mut tokens: Vec<Node>) -> Self {
        if !matches!(tokens.last(), Some(Node { kind: NodeKind::Eof, .. })) {
            tokens.push(Node::new(NodeKind::Eof));
        }
        Stream {
            tokens,
            position: 0,
            depth: 0,
        }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn reset(&mut self, checkpoint: usize) {
        self.position = checkpoint;
    }

    fn last_index(&self) -> usize {
        self.tokens.len() - 1
    }

    fn index_after(&self, skip: Skip) -> usize {
        let mut index = self.position;
        while index < self.last_index() && skip.skips(&self.tokens[index].kind) {
            index += 1;
        }
        index
    }

    /// The next token that `skip` does not look past.
    pub fn peek(&self, skip: Skip) -> &Node {
        &self.tokens[self.index_after(skip)]
    }

    /// Consumes and returns the next token that `skip` does not look past.
    pub fn advance(&mut self, skip: Skip) -> Node {
        let index = self.index_after(skip);
        self.position = (index + 1).min(self.last_index());
        self.tokens[index].clone()
    }

    /// Metadata covering every significant token consumed since `start`.
    pub fn meta_since(&self, start: usize) -> Option<Meta> {
        let consumed = self.tokens.get(start..self.position)?;
        let significant = |node: &&Node| !Skip::ALL.skips(&node.kind);
        let first = consumed.iter().find(significant)?.meta.as_ref()?;
        let last = consumed.iter().rev().find(significant)?.meta.as_ref()?;
        Some(first.merge(last))
    }

    /// Builds a node spanning the tokens consumed since `start`.
    pub fn node(&self, start: usize, kind: NodeKind) -> Node {
        Node {
            kind,
            meta: self.meta_since(start),
        }
    }

    pub fn expected(&self, expected: &str) -> ParseError {
        let found = self.peek(Skip::ALL);
        ParseError::Expected {
            expected: expected.to_string(),
            found: found.kind.describe(),
            span: found.meta.as_ref().map(|m| m.span).unwrap_or_default(),
        }
    }

    fn too_deep(&self) -> ParseError {
        let found = self.peek(Skip::ALL);
        ParseError::TooDeep {
            span: found.meta.as_ref().map(|m| m.span).unwrap_or_default(),
        }
    }

    pub fn incomplete(&self) -> ParseError {
        let found = self.peek(Skip::ALL);
        ParseError::Incomplete {
            found: found.kind.describe(),
            span: found.meta.as_ref().map(|m| m.span).unwrap_or_default(),
        }
    }
}

/// Runs `rule`, rolling the cursor back if it does not apply.
pub fn attempt<T>(stream: &mut Stream, rule: impl FnOnce(&mut Stream) -> Parsed<T>) -> Parsed<T> {
    let checkpoint = stream.position();
    let result = rule(stream)?;
    if result.is_none() {
        stream.reset(checkpoint);
    }
    Ok(result)
}

/// Runs `rule` one nesting level deeper. Past `MAX_NESTING` levels the
/// parse fails.
pub fn nested<T>(stream: &mut Stream, rule: impl FnOnce(&mut Stream) -> Parsed<T>) -> Parsed<T> {
    if stream.depth >= MAX_NESTING {
        return Err(stream.too_deep());
    }
    stream.depth += 1;
    let result = rule(stream);
    stream.depth -= 1;
    result
}

/// Matches the next token by kind.
pub fn kind(
    stream: &mut Stream,
    skip: Skip,
    predicate: impl Fn(&NodeKind) -> bool,
) -> Parsed<Node> {
    if predicate(&stream.peek(skip).kind) {
        Ok(Some(stream.advance(skip)))
    } else {
        Ok(None)
    }
}

/// Matches a punctuation, operator or keyword token by its text.
pub fn value(stream: &mut Stream, text: &str) -> Parsed<Node> {
    value_with(stream, Skip::ALL, text)
}

pub fn value_with(stream: &mut Stream, skip: Skip, text: &str) -> Parsed<Node> {
    kind(stream, skip, |kind| kind.token_text() == Some(text))
}

pub fn peek_value(stream: &Stream, text: &str) -> bool {
    stream.peek(Skip::ALL).token_text() == Some(text)
}

pub fn many<T>(
    stream: &mut Stream,
    mut rule: impl FnMut(&mut Stream) -> Parsed<T>,
) -> Result<Vec<T>, ParseError> {
    let mut items = Vec::new();
    loop {
        let before = stream.position();
        match attempt(stream, &mut rule)? {
            Some(item) => items.push(item),
            None => break,
        }
        if stream.position() == before {
            break;
        }
    }
    Ok(items)
}

/// Zero or more `rule`s separated by `separator`; a trailing separator is
/// consumed.
pub fn many_separated_by<T>(
    stream: &mut Stream,
    mut rule: impl FnMut(&mut Stream) -> Parsed<T>,
    separator: &str,
) -> Result<Vec<T>, ParseError> {
    let mut items = Vec::new();
    while let Some(item) = attempt(stream, &mut rule)? {
        items.push(item);
        if value(stream, separator)?.is_none() {
            break;
        }
    }
    Ok(items)
}

/// Ordered choice: the first rule that applies wins.
pub fn choice(stream: &mut Stream, rules: &[Rule]) -> Parsed<Node> {
    for rule in rules {
        if let Some(node) = attempt(stream, rule)? {
            return Ok(Some(node));
        }
    }
    Ok(None)
}

/// Commit point: a rule that does not apply becomes a fatal error.
pub fn must<T>(
    stream: &mut Stream,
    expected: &str,
    rule: impl FnOnce(&mut Stream) -> Parsed<T>,
) -> Result<T, ParseError> {
    match attempt(stream, rule)? {
        Some(item) => Ok(item),
        None => Err(stream.expected(expected)),
    }
}

/// Left fold of `left (operator right)*`. An operator without a right operand
/// makes the whole fold not apply.
pub fn binary_operator(
    stream: &mut Stream,
    left: Rule,
    operator: impl Fn(&mut Stream) -> Parsed<BinaryOp>,
    right: Rule,
) -> Parsed<Node> {
    attempt(stream, |stream| {
        let start = stream.position();
        let Some(mut node) = left(stream)? else {
            return Ok(None);
        };
        while let Some(op) = operator(stream)? {
            let Some(rhs) = right(stream)? else {
                return Ok(None);
            };
            node = stream.node(
                start,
                NodeKind::Binary {
                    op,
                    left: node.boxed(),
                    right: rhs.boxed(),
                },
            );
        }
        Ok(Some(node))
    })
}

/// Matches one of `operators` and maps it to its `BinaryOp`.
pub fn operator(stream: &mut Stream, operators: &[&str]) -> Parsed<BinaryOp> {
    let Some(text) = stream.peek(Skip::ALL).token_text() else {
        return Ok(None);
    };
    if !matches!(stream.peek(Skip::ALL).kind, NodeKind::Operator(_)) || !operators.contains(&text) {
        return Ok(None);
    }
    stream.advance(Skip::ALL);
    Ok(BinaryOp::from_operator(text))
}
