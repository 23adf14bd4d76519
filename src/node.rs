use crate::source::Meta;
use std::fmt; // For custom display formatting
use std::rc::Rc;

/// A single tree element, used both for lexical tokens and for parsed
/// expressions and statements.
///
/// Equality only looks at `kind`: two trees parsed from different sources (or
/// built by hand in a test) compare equal when their structure does.
#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeKind,
    pub meta: Option<Meta>,
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
    }
}

impl Node {
    pub fn new(kind: NodeKind) -> Self {
        Node { kind, meta: None }
    }

    pub fn with_meta(kind: NodeKind, meta: Meta) -> Self {
        Node {
            kind,
            meta: Some(meta),
        }
    }

    pub fn identifier(name: &str) -> Self {
        Node::new(NodeKind::Identifier(name.to_string()))
    }

    pub fn number(n: f64) -> Self {
        Node::new(NodeKind::Number(n))
    }

    pub fn string(s: &str) -> Self {
        Node::new(NodeKind::String(s.to_string()))
    }

    pub fn boxed(self) -> Box<Node> {
        Box::new(self)
    }

    /// The source text this node was built from, if it carries metadata.
    pub fn matched(&self) -> Option<&str> {
        self.meta.as_ref().map(|meta| meta.matched())
    }

    pub fn token_text(&self) -> Option<&'static str> {
        self.kind.token_text()
    }

    pub fn is_newline(&self) -> bool {
        matches!(self.kind, NodeKind::Terminator("\n"))
    }

    /// Canonical indented bracket notation, including source positions.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        self.write_dump(&mut out, 0);
        out
    }

    /// Single-line bracket notation without any source metadata.
    pub fn simplified(&self) -> String {
        let mut out = String::new();
        self.write_simplified(&mut out);
        out
    }

    fn write_dump(&self, out: &mut String, level: usize) {
        let indent = "  ".repeat(level);
        out.push_str(&indent);
        out.push('[');
        out.push_str(&self.kind.label());
        if let Some(meta) = &self.meta {
            out.push_str(&format!(" @{}", meta.span));
        }
        let children = self.kind.children();
        if children.is_empty() {
            out.push(']');
            return;
        }
        for child in children {
            out.push('\n');
            match child {
                Child::Node(node) => node.write_dump(out, level + 1),
                Child::Absent => {
                    out.push_str(&indent);
                    out.push_str("  None");
                }
                Child::Leaf(text) => {
                    out.push_str(&indent);
                    out.push_str("  ");
                    out.push_str(&text);
                }
                Child::Group(tag, nodes) => {
                    out.push_str(&indent);
                    out.push_str("  [");
                    out.push_str(tag);
                    for node in nodes {
                        out.push('\n');
                        node.write_dump(out, level + 2);
                    }
                    out.push('\n');
                    out.push_str(&indent);
                    out.push_str("  ]");
                }
            }
        }
        out.push('\n');
        out.push_str(&indent);
        out.push(']');
    }

    fn write_simplified(&self, out: &mut String) {
        out.push('[');
        out.push_str(&self.kind.label());
        for child in self.kind.children() {
            out.push(' ');
            match child {
                Child::Node(node) => node.write_simplified(out),
                Child::Absent => out.push_str("None"),
                Child::Leaf(text) => out.push_str(&text),
                Child::Group(tag, nodes) => {
                    out.push('[');
                    out.push_str(tag);
                    for node in nodes {
                        out.push(' ');
                        node.write_simplified(out);
                    }
                    out.push(']');
                }
            }
        }
        out.push(']');
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.simplified())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Neq,
    Eq,
    Is,
    IsNot,
    Lt,
    Lte,
    Gt,
    Gte,
    In,
    NotIn,
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Range,
}

impl BinaryOp {
    pub fn from_operator(text: &str) -> Option<BinaryOp> {
        Some(match text {
            "or" => BinaryOp::Or,
            "and" => BinaryOp::And,
            "/=" => BinaryOp::Neq,
            "==" => BinaryOp::Eq,
            "is" => BinaryOp::Is,
            "is not" => BinaryOp::IsNot,
            "<" => BinaryOp::Lt,
            "<=" => BinaryOp::Lte,
            ">" => BinaryOp::Gt,
            ">=" => BinaryOp::Gte,
            "in" => BinaryOp::In,
            "not in" => BinaryOp::NotIn,
            "+" => BinaryOp::Add,
            "-" => BinaryOp::Sub,
            "*" => BinaryOp::Mul,
            "/" => BinaryOp::Div,
            "^" => BinaryOp::Pow,
            ".." => BinaryOp::Range,
            _ => return None,
        })
    }

    pub fn tag(self) -> &'static str {
        match self {
            BinaryOp::Or => "or",
            BinaryOp::And => "and",
            BinaryOp::Neq => "neq",
            BinaryOp::Eq => "eq",
            BinaryOp::Is => "is",
            BinaryOp::IsNot => "isnot",
            BinaryOp::Lt => "lt",
            BinaryOp::Lte => "lte",
            BinaryOp::Gt => "gt",
            BinaryOp::Gte => "gte",
            BinaryOp::In => "in",
            BinaryOp::NotIn => "notin",
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::Pow => "pow",
            BinaryOp::Range => "range",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Pos,
    Neg,
}

impl UnaryOp {
    pub fn from_operator(text: &str) -> Option<UnaryOp> {
        match text {
            "not" => Some(UnaryOp::Not),
            "+" => Some(UnaryOp::Pos),
            "-" => Some(UnaryOp::Neg),
            _ => None,
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            UnaryOp::Not => "not",
            UnaryOp::Pos => "pos",
            UnaryOp::Neg => "neg",
        }
    }
}

/// The closed set of node kinds. The first group only ever appears in token
/// streams; literals and identifiers appear in both; the rest are built by the
/// grammar.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    // --- Tokens ---
    Terminator(&'static str), // "\n" or ";"
    Doc(String),
    Punctuation(&'static str),
    Operator(&'static str),
    Keyword(&'static str),
    Eof,

    // --- Terminals ---
    Identifier(String),
    Number(f64),
    String(String),
    Boolean(bool),
    Nothing,

    // --- Statements ---
    Module(Vec<Node>),
    Declare {
        pattern: Box<Node>,
        value: Box<Node>,
        doc: Option<String>,
    },
    Assign {
        target: Box<Node>,
        value: Box<Node>,
    },
    Return(Box<Node>),
    Yield(Box<Node>),
    Extend(Box<Node>),
    Throw(Box<Node>),

    // --- Expressions ---
    Spread(Box<Node>),
    List(Vec<Node>),
    Map(Vec<Node>),
    Pair {
        key: Box<Node>,
        value: Option<Box<Node>>,
    },
    Access {
        target: Box<Node>,
        key: Box<Node>,
    },
    Call {
        callee: Box<Node>,
        arguments: Vec<Node>,
    },
    Block(Vec<Node>),
    Function(Rc<Vec<Node>>),
    Generator(Rc<Vec<Node>>),
    Class(Rc<Vec<Node>>),
    Case {
        patterns: Option<Vec<Node>>,
        guard: Option<Box<Node>>,
        body: Box<Node>,
    },
    If {
        condition: Box<Node>,
        then: Box<Node>,
        otherwise: Option<Box<Node>>,
    },
    While {
        condition: Box<Node>,
        body: Box<Node>,
    },
    Match {
        subject: Box<Node>,
        cases: Vec<Node>,
    },
    For {
        pattern: Box<Node>,
        iterable: Box<Node>,
        guard: Option<Box<Node>>,
        while_guard: Option<Box<Node>>,
        body: Box<Node>,
    },
    Try {
        body: Box<Node>,
        catch: Vec<Node>,
        finally: Option<Box<Node>>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Node>,
        right: Box<Node>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Node>,
    },

    // --- Pattern-only ---
    RangePattern {
        start: Option<Box<Node>>,
        end: Option<Box<Node>>,
    },
    ElsePattern,
}

enum Child<'a> {
    Node(&'a Node),
    Absent,
    Leaf(String),
    Group(&'static str, &'a [Node]),
}

fn optional(node: &Option<Box<Node>>) -> Child<'_> {
    match node {
        Some(node) => Child::Node(node),
        None => Child::Absent,
    }
}

impl NodeKind {
    /// Text of a punctuation, operator, keyword or terminator token.
    pub fn token_text(&self) -> Option<&'static str> {
        match *self {
            NodeKind::Punctuation(text)
            | NodeKind::Operator(text)
            | NodeKind::Keyword(text)
            | NodeKind::Terminator(text) => Some(text),
            _ => None,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            NodeKind::Terminator(_) => "terminator",
            NodeKind::Doc(_) => "doc",
            NodeKind::Punctuation(_) => "punctuation",
            NodeKind::Operator(_) => "operator",
            NodeKind::Keyword(_) => "keyword",
            NodeKind::Eof => "eof",
            NodeKind::Identifier(_) => "ident",
            NodeKind::Number(_) => "number",
            NodeKind::String(_) => "string",
            NodeKind::Boolean(_) => "boolean",
            NodeKind::Nothing => "nothing",
            NodeKind::Module(_) => "module",
            NodeKind::Declare { .. } => "var",
            NodeKind::Assign { .. } => "assign",
            NodeKind::Return(_) => "return",
            NodeKind::Yield(_) => "yield",
            NodeKind::Extend(_) => "extend",
            NodeKind::Throw(_) => "throw",
            NodeKind::Spread(_) => "spread",
            NodeKind::List(_) => "list",
            NodeKind::Map(_) => "map",
            NodeKind::Pair { .. } => "pair",
            NodeKind::Access { .. } => "access",
            NodeKind::Call { .. } => "call",
            NodeKind::Block(_) => "block",
            NodeKind::Function(_) => "function",
            NodeKind::Generator(_) => "generator",
            NodeKind::Class(_) => "class",
            NodeKind::Case { .. } => "case",
            NodeKind::If { .. } => "if",
            NodeKind::While { .. } => "while",
            NodeKind::Match { .. } => "match",
            NodeKind::For { .. } => "for",
            NodeKind::Try { .. } => "try",
            NodeKind::Binary { op, .. } => op.tag(),
            NodeKind::Unary { op, .. } => op.tag(),
            NodeKind::RangePattern { .. } => "rangepat",
            NodeKind::ElsePattern => "else",
        }
    }

    /// Tag plus the inline payload of terminal kinds.
    fn label(&self) -> String {
        let tag = self.tag();
        match self {
            NodeKind::Terminator(text) => format!("{} {:?}", tag, text),
            NodeKind::Doc(text) | NodeKind::String(text) => format!("{} {:?}", tag, text),
            NodeKind::Punctuation(text) | NodeKind::Operator(text) | NodeKind::Keyword(text) => {
                format!("{} {}", tag, text)
            }
            NodeKind::Identifier(name) => format!("{} {}", tag, name),
            NodeKind::Number(n) => format!("{} {}", tag, format_number(*n)),
            NodeKind::Boolean(b) => format!("{} {}", tag, if *b { "True" } else { "False" }),
            _ => tag.to_string(),
        }
    }

    fn children(&self) -> Vec<Child<'_>> {
        match self {
            NodeKind::Terminator(_)
            | NodeKind::Doc(_)
            | NodeKind::Punctuation(_)
            | NodeKind::Operator(_)
            | NodeKind::Keyword(_)
            | NodeKind::Eof
            | NodeKind::Identifier(_)
            | NodeKind::Number(_)
            | NodeKind::String(_)
            | NodeKind::Boolean(_)
            | NodeKind::Nothing
            | NodeKind::ElsePattern => vec![],
            NodeKind::Module(nodes)
            | NodeKind::List(nodes)
            | NodeKind::Map(nodes)
            | NodeKind::Block(nodes) => {
                nodes.iter().map(Child::Node).collect()
            }
            NodeKind::Function(cases) | NodeKind::Generator(cases) | NodeKind::Class(cases) => {
                cases.iter().map(Child::Node).collect()
            }
            NodeKind::Declare {
                pattern,
                value,
                doc,
            } => vec![
                Child::Node(pattern),
                Child::Node(value),
                match doc {
                    Some(doc) => Child::Leaf(format!("[doc {:?}]", doc)),
                    None => Child::Absent,
                },
            ],
            NodeKind::Assign { target, value } => vec![Child::Node(target), Child::Node(value)],
            NodeKind::Return(node)
            | NodeKind::Yield(node)
            | NodeKind::Extend(node)
            | NodeKind::Throw(node)
            | NodeKind::Spread(node) => vec![Child::Node(node)],
            NodeKind::Pair { key, value } => vec![Child::Node(key), optional(value)],
            NodeKind::Access { target, key } => vec![Child::Node(target), Child::Node(key)],
            NodeKind::Call { callee, arguments } => std::iter::once(Child::Node(&**callee))
                .chain(arguments.iter().map(Child::Node))
                .collect(),
            NodeKind::Case {
                patterns,
                guard,
                body,
            } => vec![
                match patterns {
                    Some(patterns) => Child::Group("patterns", patterns),
                    None => Child::Absent,
                },
                optional(guard),
                Child::Node(body),
            ],
            NodeKind::If {
                condition,
                then,
                otherwise,
            } => vec![Child::Node(condition), Child::Node(then), optional(otherwise)],
            NodeKind::While { condition, body } => vec![Child::Node(condition), Child::Node(body)],
            NodeKind::Match { subject, cases } => std::iter::once(Child::Node(&**subject))
                .chain(cases.iter().map(Child::Node))
                .collect(),
            NodeKind::For {
                pattern,
                iterable,
                guard,
                while_guard,
                body,
            } => vec![
                Child::Node(pattern),
                Child::Node(iterable),
                optional(guard),
                optional(while_guard),
                Child::Node(body),
            ],
            NodeKind::Try {
                body,
                catch,
                finally,
            } => vec![
                Child::Node(body),
                Child::Group("catch", catch),
                optional(finally),
            ],
            NodeKind::Binary { left, right, .. } => vec![Child::Node(left), Child::Node(right)],
            NodeKind::Unary { operand, .. } => vec![Child::Node(operand)],
            NodeKind::RangePattern { start, end } => vec![optional(start), optional(end)],
        }
    }

    /// Human readable description of a token, for error messages.
    pub fn describe(&self) -> String {
        match self {
            NodeKind::Terminator("\n") => "newline".to_string(),
            NodeKind::Terminator(text) => format!("terminator '{}'", text),
            NodeKind::Doc(_) => "doc comment".to_string(),
            NodeKind::Punctuation(text) => format!("'{}'", text),
            NodeKind::Operator(text) => format!("operator '{}'", text),
            NodeKind::Keyword(text) => format!("keyword '{}'", text),
            NodeKind::Eof => "end of input".to_string(),
            NodeKind::Identifier(name) => format!("identifier '{}'", name),
            NodeKind::Number(n) => format!("number {}", format_number(*n)),
            NodeKind::String(s) => format!("string {:?}", s),
            NodeKind::Boolean(b) => (if *b { "True" } else { "False" }).to_string(),
            NodeKind::Nothing => "Nothing".to_string(),
            other => other.tag().to_string(),
        }
    }
}

/// Integral numbers print without a fraction, the special floats by name.
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else if n.fract() == 0.0 && n.abs() < 1e16 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Span;

    fn sample() -> Node {
        Node::new(NodeKind::Binary {
            op: BinaryOp::Add,
            left: Node::number(1.0).boxed(),
            right: Node::new(NodeKind::Binary {
                op: BinaryOp::Mul,
                left: Node::number(2.0).boxed(),
                right: Node::number(3.5).boxed(),
            })
            .boxed(),
        })
    }

    #[test]
    fn test_equality_ignores_meta() {
        let source: Rc<str> = Rc::from("x");
        let with = Node::with_meta(
            NodeKind::Identifier("x".to_string()),
            Meta::new(source, Span::new(0, 1)),
        );
        assert_eq!(with, Node::identifier("x"));
        assert_ne!(with, Node::identifier("y"));
    }

    #[test]
    fn test_simplified() {
        assert_eq!(
            sample().simplified(),
            "[add [number 1] [mul [number 2] [number 3.5]]]"
        );
        let case = Node::new(NodeKind::Case {
            patterns: Some(vec![Node::identifier("a")]),
            guard: None,
            body: Node::new(NodeKind::Block(vec![])).boxed(),
        });
        assert_eq!(case.simplified(), "[case [patterns [ident a]] None [block]]");
    }

    #[test]
    fn test_dump_indents_and_shows_positions() {
        let source: Rc<str> = Rc::from("a");
        let module = Node::new(NodeKind::Module(vec![Node::with_meta(
            NodeKind::Identifier("a".to_string()),
            Meta::new(source, Span::new(0, 1)),
        )]));
        assert_eq!(module.dump(), "[module\n  [ident a @0..1]\n]");
        assert_eq!(
            sample().dump(),
            "[add\n  [number 1]\n  [mul\n    [number 2]\n    [number 3.5]\n  ]\n]"
        );
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(7.0), "7");
        assert_eq!(format_number(-0.25), "-0.25");
        assert_eq!(format_number(f64::INFINITY), "Infinity");
        assert_eq!(format_number(f64::NAN), "NaN");
    }
}
