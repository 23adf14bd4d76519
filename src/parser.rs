use crate::lexer::tokenize;
use crate::node::{BinaryOp, Node, NodeKind, UnaryOp};
use crate::parsing::{
    ParseError, Parsed, Rule, Skip, Stream, attempt, binary_operator, choice, kind,
    many_separated_by, must, nested, operator, peek_value, value, value_with,
};
use std::rc::Rc;

/// Parses a full token vector into a `Module` node. Every token up to `Eof`
/// must be consumed.
pub fn parse(tokens: Vec<Node>) -> Result<Node, ParseError> {
    let mut stream = Stream::new(tokens);
    module(&mut stream)
}

/// Helper to lex and parse source text in one go.
pub fn parse_str(source: &str) -> Result<Node, ParseError> {
    parse(tokenize(source)?)
}

// --- Statements ---

fn module(stream: &mut Stream) -> Result<Node, ParseError> {
    let start = stream.position();
    let body = statements(stream)?;
    if kind(stream, Skip::ALL, |k| matches!(k, NodeKind::Eof))?.is_none() {
        return Err(stream.incomplete());
    }
    Ok(stream.node(start, NodeKind::Module(body)))
}

fn statements(stream: &mut Stream) -> Result<Vec<Node>, ParseError> {
    let mut nodes = Vec::new();
    while let Some(node) = attempt(stream, statement)? {
        nodes.push(node);
        must(stream, "end of statement", statement_end)?;
    }
    Ok(nodes)
}

// A terminator, or the end of the enclosing block or module.
fn statement_end(stream: &mut Stream) -> Parsed<()> {
    if kind(stream, Skip::DOCS, |k| matches!(k, NodeKind::Terminator(_)))?.is_some() {
        return Ok(Some(()));
    }
    let next = stream.peek(Skip::DOCS);
    if matches!(next.kind, NodeKind::Eof) || peek_value(stream, "}") {
        Ok(Some(()))
    } else {
        Ok(None)
    }
}

fn statement(stream: &mut Stream) -> Parsed<Node> {
    choice(
        stream,
        &[
            declaration,
            return_statement,
            yield_statement,
            extend_statement,
            throw_statement,
            assignment,
            expression,
        ],
    )
}

fn declaration(stream: &mut Stream) -> Parsed<Node> {
    let start = stream.position();
    let doc = kind(stream, Skip::NEWLINES, |k| matches!(k, NodeKind::Doc(_)))?;
    if value(stream, "var")?.is_none() {
        return Ok(None);
    }
    let target = must(stream, "pattern", pattern)?;
    must(stream, "'='", |s| value(s, "="))?;
    let init = must(stream, "expression", expression)?;
    let doc = doc.and_then(|node| match node.kind {
        NodeKind::Doc(text) => Some(text),
        _ => None,
    });
    Ok(Some(stream.node(
        start,
        NodeKind::Declare {
            pattern: target.boxed(),
            value: init.boxed(),
            doc,
        },
    )))
}

fn keyword_statement(
    stream: &mut Stream,
    keyword: &str,
    build: fn(Box<Node>) -> NodeKind,
) -> Parsed<Node> {
    let start = stream.position();
    if value(stream, keyword)?.is_none() {
        return Ok(None);
    }
    let operand = must(stream, "expression", expression)?;
    Ok(Some(stream.node(start, build(operand.boxed()))))
}

fn return_statement(stream: &mut Stream) -> Parsed<Node> {
    keyword_statement(stream, "return", NodeKind::Return)
}

fn yield_statement(stream: &mut Stream) -> Parsed<Node> {
    keyword_statement(stream, "yield", NodeKind::Yield)
}

fn extend_statement(stream: &mut Stream) -> Parsed<Node> {
    keyword_statement(stream, "extend", NodeKind::Extend)
}

fn throw_statement(stream: &mut Stream) -> Parsed<Node> {
    keyword_statement(stream, "throw", NodeKind::Throw)
}

fn assignment(stream: &mut Stream) -> Parsed<Node> {
    let start = stream.position();
    let Some(target) = identifier(stream)? else {
        return Ok(None);
    };
    if value(stream, "=")?.is_none() {
        return Ok(None);
    }
    let assigned = must(stream, "expression", expression)?;
    Ok(Some(stream.node(
        start,
        NodeKind::Assign {
            target: target.boxed(),
            value: assigned.boxed(),
        },
    )))
}

// --- Control expressions ---

fn expression(stream: &mut Stream) -> Parsed<Node> {
    nested(stream, |stream| choice(stream, &[control_expression, primary]))
}

fn control_expression(stream: &mut Stream) -> Parsed<Node> {
    choice(
        stream,
        &[
            if_expression,
            do_expression,
            while_expression,
            match_expression,
            for_expression,
            class_expression,
            try_expression,
        ],
    )
}

fn if_expression(stream: &mut Stream) -> Parsed<Node> {
    let start = stream.position();
    if value(stream, "if")?.is_none() {
        return Ok(None);
    }
    let condition = must(stream, "condition", primary)?;
    must(stream, "'then'", |s| value(s, "then"))?;
    let then = must(stream, "block", block)?;
    let otherwise = match value(stream, "else")? {
        Some(_) => {
            let otherwise = must(stream, "block or 'if'", |s| {
                choice(s, &[block, if_expression])
            })?;
            Some(otherwise.boxed())
        }
        None => None,
    };
    Ok(Some(stream.node(
        start,
        NodeKind::If {
            condition: condition.boxed(),
            then: then.boxed(),
            otherwise,
        },
    )))
}

// `do` only introduces a block; the block itself is the result.
fn do_expression(stream: &mut Stream) -> Parsed<Node> {
    if value(stream, "do")?.is_none() {
        return Ok(None);
    }
    must(stream, "block", block).map(Some)
}

fn while_expression(stream: &mut Stream) -> Parsed<Node> {
    let start = stream.position();
    if value(stream, "while")?.is_none() {
        return Ok(None);
    }
    let condition = must(stream, "condition", primary)?;
    must(stream, "'do'", |s| value(s, "do"))?;
    let body = must(stream, "block", block)?;
    Ok(Some(stream.node(
        start,
        NodeKind::While {
            condition: condition.boxed(),
            body: body.boxed(),
        },
    )))
}

fn match_expression(stream: &mut Stream) -> Parsed<Node> {
    let start = stream.position();
    if value(stream, "match")?.is_none() {
        return Ok(None);
    }
    let subject = must(stream, "expression", primary)?;
    must(stream, "'with'", |s| value(s, "with"))?;
    let cases = must(stream, "cases", |s| cases_block(s, true))?;
    Ok(Some(stream.node(
        start,
        NodeKind::Match {
            subject: subject.boxed(),
            cases,
        },
    )))
}

fn for_expression(stream: &mut Stream) -> Parsed<Node> {
    let start = stream.position();
    if value(stream, "for")?.is_none() {
        return Ok(None);
    }
    let binder = must(stream, "pattern", pattern)?;
    must(stream, "'in'", |s| value(s, "in"))?;
    let iterable = must(stream, "expression", primary)?;
    let guard = attempt(stream, |s| guard_clause(s, "if"))?;
    let while_guard = attempt(stream, |s| guard_clause(s, "while"))?;
    must(stream, "'do'", |s| value(s, "do"))?;
    let body = must(stream, "block", block)?;
    Ok(Some(stream.node(
        start,
        NodeKind::For {
            pattern: binder.boxed(),
            iterable: iterable.boxed(),
            guard: guard.map(Node::boxed),
            while_guard: while_guard.map(Node::boxed),
            body: body.boxed(),
        },
    )))
}

fn class_expression(stream: &mut Stream) -> Parsed<Node> {
    cases_literal(stream, "Class", NodeKind::Class)
}

fn try_expression(stream: &mut Stream) -> Parsed<Node> {
    let start = stream.position();
    if value(stream, "try")?.is_none() {
        return Ok(None);
    }
    let body = must(stream, "block", block)?;
    must(stream, "'catch'", |s| value(s, "catch"))?;
    let catch = must(stream, "catch cases", function_body)?;
    let finally = match value(stream, "finally")? {
        Some(_) => Some(must(stream, "block", block)?.boxed()),
        None => None,
    };
    Ok(Some(stream.node(
        start,
        NodeKind::Try {
            body: body.boxed(),
            catch,
            finally,
        },
    )))
}

fn guard_clause(stream: &mut Stream, keyword: &str) -> Parsed<Node> {
    if value(stream, keyword)?.is_none() {
        return Ok(None);
    }
    must(stream, "condition", primary).map(Some)
}

// --- Blocks and cases ---

fn block(stream: &mut Stream) -> Parsed<Node> {
    let start = stream.position();
    if value(stream, "{")?.is_none() {
        return Ok(None);
    }
    let body = statements(stream)?;
    must(stream, "'}'", |s| value(s, "}"))?;
    Ok(Some(stream.node(start, NodeKind::Block(body))))
}

/// `{ cases }`, `{ patterns -> statements }` or a bare block, which is a
/// single case without patterns.
fn function_body(stream: &mut Stream) -> Parsed<Vec<Node>> {
    if let Some(cases) = attempt(stream, |s| cases_block(s, false))? {
        return Ok(Some(cases));
    }
    if let Some(case) = attempt(stream, arrow_case_block)? {
        return Ok(Some(vec![case]));
    }
    let start = stream.position();
    let Some(body) = block(stream)? else {
        return Ok(None);
    };
    let case = stream.node(
        start,
        NodeKind::Case {
            patterns: None,
            guard: None,
            body: body.boxed(),
        },
    );
    Ok(Some(vec![case]))
}

fn cases_block(stream: &mut Stream, allow_empty: bool) -> Parsed<Vec<Node>> {
    if value(stream, "{")?.is_none() {
        return Ok(None);
    }
    let cases = many_separated_by(stream, case, ",")?;
    if cases.is_empty() {
        if !allow_empty || value(stream, "}")?.is_none() {
            return Ok(None);
        }
        return Ok(Some(cases));
    }
    must(stream, "'}'", |s| value(s, "}"))?;
    Ok(Some(cases))
}

fn case(stream: &mut Stream) -> Parsed<Node> {
    let start = stream.position();
    let patterns = many_separated_by(stream, pattern, ",")?;
    let guard = attempt(stream, |s| guard_clause(s, "if"))?;
    if value(stream, "=>")?.is_none() {
        return Ok(None);
    }
    let body_start = stream.position();
    let statement = must(stream, "statement", statement)?;
    let body = stream.node(body_start, NodeKind::Block(vec![statement]));
    Ok(Some(stream.node(
        start,
        NodeKind::Case {
            patterns: Some(patterns),
            guard: guard.map(Node::boxed),
            body: body.boxed(),
        },
    )))
}

fn arrow_case_block(stream: &mut Stream) -> Parsed<Node> {
    let start = stream.position();
    if value(stream, "{")?.is_none() {
        return Ok(None);
    }
    let patterns = many_separated_by(stream, pattern, ",")?;
    if value(stream, "->")?.is_none() {
        return Ok(None);
    }
    let body_start = stream.position();
    let body = statements(stream)?;
    let body = stream.node(body_start, NodeKind::Block(body));
    must(stream, "'}'", |s| value(s, "}"))?;
    Ok(Some(stream.node(
        start,
        NodeKind::Case {
            patterns: Some(patterns),
            guard: None,
            body: body.boxed(),
        },
    )))
}

// --- Operator levels ---

fn primary(stream: &mut Stream) -> Parsed<Node> {
    or_expression(stream)
}

fn or_expression(stream: &mut Stream) -> Parsed<Node> {
    binary_operator(stream, and_expression, |s| operator(s, &["or"]), and_expression)
}

fn and_expression(stream: &mut Stream) -> Parsed<Node> {
    binary_operator(
        stream,
        relational_expression,
        |s| operator(s, &["and"]),
        relational_expression,
    )
}

const RELATIONAL: &[&str] = &[
    "/=", "==", "is not", "is", "<", "<=", ">", ">=", "not in", "in",
];

fn relational_expression(stream: &mut Stream) -> Parsed<Node> {
    binary_operator(
        stream,
        additive_expression,
        |s| operator(s, RELATIONAL),
        additive_expression,
    )
}

fn additive_expression(stream: &mut Stream) -> Parsed<Node> {
    binary_operator(
        stream,
        multiplicative_expression,
        |s| operator(s, &["+", "-"]),
        multiplicative_expression,
    )
}

fn multiplicative_expression(stream: &mut Stream) -> Parsed<Node> {
    binary_operator(
        stream,
        exponential_expression,
        |s| operator(s, &["*", "/"]),
        exponential_expression,
    )
}

// `^` is right associative. The right side of `..` is parsed one level
// tighter, so `a..b..c` leaves `..c` unconsumed.
fn exponential_expression(stream: &mut Stream) -> Parsed<Node> {
    attempt(stream, |stream| {
        let start = stream.position();
        let Some(base) = unary_expression(stream)? else {
            return Ok(None);
        };
        let (op, rhs) = match operator(stream, &["^", ".."])? {
            Some(BinaryOp::Pow) => (BinaryOp::Pow, nested(stream, exponential_expression)?),
            Some(op) => (op, power_expression(stream)?),
            None => return Ok(Some(base)),
        };
        let Some(rhs) = rhs else {
            return Ok(None);
        };
        Ok(Some(stream.node(
            start,
            NodeKind::Binary {
                op,
                left: base.boxed(),
                right: rhs.boxed(),
            },
        )))
    })
}

fn power_expression(stream: &mut Stream) -> Parsed<Node> {
    nested(stream, |stream| {
        binary_operator(
            stream,
            unary_expression,
            |s| operator(s, &["^"]),
            power_expression,
        )
    })
}

fn unary_expression(stream: &mut Stream) -> Parsed<Node> {
    attempt(stream, |stream| {
        let start = stream.position();
        let prefix = stream.peek(Skip::ALL);
        let Some(text @ ("not" | "+" | "-" | "...")) = prefix.token_text() else {
            return postfix_expression(stream);
        };
        if !matches!(prefix.kind, NodeKind::Operator(_)) {
            return postfix_expression(stream);
        }
        stream.advance(Skip::ALL);
        let Some(operand) = nested(stream, unary_expression)? else {
            return Ok(None);
        };
        let kind = match UnaryOp::from_operator(text) {
            Some(op) => NodeKind::Unary {
                op,
                operand: operand.boxed(),
            },
            None => NodeKind::Spread(operand.boxed()),
        };
        Ok(Some(stream.node(start, kind)))
    })
}

// --- Postfix and simple expressions ---

fn postfix_expression(stream: &mut Stream) -> Parsed<Node> {
    let start = stream.position();
    let Some(mut node) = simple_expression(stream)? else {
        return Ok(None);
    };
    loop {
        if let Some(arguments) = attempt(stream, call)? {
            node = stream.node(
                start,
                NodeKind::Call {
                    callee: node.boxed(),
                    arguments,
                },
            );
        } else if let Some(key) = attempt(stream, access)? {
            node = stream.node(
                start,
                NodeKind::Access {
                    target: node.boxed(),
                    key: key.boxed(),
                },
            );
        } else {
            return Ok(Some(node));
        }
    }
}

// Calls and accesses must start on the same line as their target.
fn call(stream: &mut Stream) -> Parsed<Vec<Node>> {
    if value_with(stream, Skip::DOCS, "(")?.is_none() {
        return Ok(None);
    }
    let arguments = many_separated_by(stream, expression, ",")?;
    must(stream, "')'", |s| value(s, ")"))?;
    Ok(Some(arguments))
}

fn access(stream: &mut Stream) -> Parsed<Node> {
    if value_with(stream, Skip::DOCS, ".")?.is_some() {
        let name = must(stream, "field name", identifier)?;
        return Ok(Some(name_key(name)));
    }
    if value_with(stream, Skip::DOCS, "[")?.is_none() {
        return Ok(None);
    }
    let key = attempt(stream, |s| {
        let Some(key) = expression(s)? else {
            return Ok(None);
        };
        Ok(value(s, "]")?.map(|_| key))
    })?;
    if let Some(key) = key {
        return Ok(Some(key));
    }
    let key = must(stream, "index", pattern)?;
    must(stream, "']'", |s| value(s, "]"))?;
    Ok(Some(key))
}

// Field names and named map keys are stored as string literals.
fn name_key(name: Node) -> Node {
    match name.kind {
        NodeKind::Identifier(text) => Node {
            kind: NodeKind::String(text),
            meta: name.meta,
        },
        _ => name,
    }
}

fn simple_expression(stream: &mut Stream) -> Parsed<Node> {
    choice(
        stream,
        &[
            parenthesized,
            function_literal,
            generator_literal,
            list_literal,
            map_literal,
            literal,
            identifier,
        ],
    )
}

fn parenthesized(stream: &mut Stream) -> Parsed<Node> {
    if value(stream, "(")?.is_none() {
        return Ok(None);
    }
    let inner = must(stream, "expression", expression)?;
    must(stream, "')'", |s| value(s, ")"))?;
    Ok(Some(inner))
}

fn cases_literal(
    stream: &mut Stream,
    keyword: &str,
    build: fn(Rc<Vec<Node>>) -> NodeKind,
) -> Parsed<Node> {
    let start = stream.position();
    if value(stream, keyword)?.is_none() {
        return Ok(None);
    }
    let cases = must(stream, "function body", function_body)?;
    Ok(Some(stream.node(start, build(Rc::new(cases)))))
}

fn function_literal(stream: &mut Stream) -> Parsed<Node> {
    cases_literal(stream, "Function", NodeKind::Function)
}

fn generator_literal(stream: &mut Stream) -> Parsed<Node> {
    cases_literal(stream, "Generator", NodeKind::Generator)
}

fn list_literal(stream: &mut Stream) -> Parsed<Node> {
    let start = stream.position();
    if value(stream, "List")?.is_none() {
        return Ok(None);
    }
    must(stream, "'['", |s| value(s, "["))?;
    let elements = many_separated_by(stream, expression, ",")?;
    must(stream, "']'", |s| value(s, "]"))?;
    Ok(Some(stream.node(start, NodeKind::List(elements))))
}

fn map_literal(stream: &mut Stream) -> Parsed<Node> {
    let start = stream.position();
    if value(stream, "Map")?.is_none() {
        return Ok(None);
    }
    must(stream, "'['", |s| value(s, "["))?;
    let pairs = many_separated_by(stream, pair, ",")?;
    must(stream, "']'", |s| value(s, "]"))?;
    Ok(Some(stream.node(start, NodeKind::Map(pairs))))
}

fn pair(stream: &mut Stream) -> Parsed<Node> {
    let start = stream.position();
    if value(stream, "...")?.is_some() {
        let operand = must(stream, "expression", simple_expression)?;
        return Ok(Some(stream.node(start, NodeKind::Spread(operand.boxed()))));
    }
    let key = if let Some(name) = identifier(stream)? {
        let key = name_key(name);
        if value(stream, ":")?.is_none() {
            return Ok(Some(stream.node(
                start,
                NodeKind::Pair {
                    key: key.boxed(),
                    value: None,
                },
            )));
        }
        key
    } else if let Some(key) = literal(stream)? {
        must(stream, "':'", |s| value(s, ":"))?;
        key
    } else if value(stream, "[")?.is_some() {
        let key = must(stream, "key expression", expression)?;
        must(stream, "']'", |s| value(s, "]"))?;
        must(stream, "':'", |s| value(s, ":"))?;
        key
    } else {
        return Ok(None);
    };
    let mapped = must(stream, "expression", expression)?;
    Ok(Some(stream.node(
        start,
        NodeKind::Pair {
            key: key.boxed(),
            value: Some(mapped.boxed()),
        },
    )))
}

fn literal(stream: &mut Stream) -> Parsed<Node> {
    kind(stream, Skip::ALL, |k| {
        matches!(
            k,
            NodeKind::Number(_) | NodeKind::String(_) | NodeKind::Boolean(_) | NodeKind::Nothing
        )
    })
}

fn identifier(stream: &mut Stream) -> Parsed<Node> {
    kind(stream, Skip::ALL, |k| matches!(k, NodeKind::Identifier(_)))
}

// --- Patterns ---

fn pattern(stream: &mut Stream) -> Parsed<Node> {
    const PATTERNS: &[Rule] = &[
        range_pattern,
        spread_pattern,
        else_pattern,
        list_literal,
        map_literal,
        literal_pattern,
        identifier,
    ];
    choice(stream, PATTERNS)
}

// Numbers in patterns may carry a sign.
fn signed_number(stream: &mut Stream) -> Parsed<Node> {
    let start = stream.position();
    let negative = value(stream, "-")?.is_some();
    let Some(number) = kind(stream, Skip::ALL, |k| matches!(k, NodeKind::Number(_)))? else {
        return Ok(None);
    };
    match number.kind {
        NodeKind::Number(n) if negative => Ok(Some(stream.node(start, NodeKind::Number(-n)))),
        _ => Ok(Some(number)),
    }
}

fn literal_pattern(stream: &mut Stream) -> Parsed<Node> {
    choice(stream, &[signed_number, literal])
}

fn range_pattern(stream: &mut Stream) -> Parsed<Node> {
    let start = stream.position();
    let low = attempt(stream, signed_number)?;
    if value(stream, "..")?.is_none() {
        return Ok(None);
    }
    let high = attempt(stream, signed_number)?;
    if low.is_none() && high.is_none() {
        return Ok(None);
    }
    Ok(Some(stream.node(
        start,
        NodeKind::RangePattern {
            start: low.map(Node::boxed),
            end: high.map(Node::boxed),
        },
    )))
}

fn spread_pattern(stream: &mut Stream) -> Parsed<Node> {
    let start = stream.position();
    if value(stream, "...")?.is_none() {
        return Ok(None);
    }
    let Some(name) = identifier(stream)? else {
        return Ok(None);
    };
    Ok(Some(stream.node(start, NodeKind::Spread(name.boxed()))))
}

fn else_pattern(stream: &mut Stream) -> Parsed<Node> {
    let start = stream.position();
    if value(stream, "else")?.is_none() {
        return Ok(None);
    }
    Ok(Some(stream.node(start, NodeKind::ElsePattern)))
}
