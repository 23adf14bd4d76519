use logos::{Lexer, Logos};
use std::rc::Rc;
use thiserror::Error;

use crate::node::{Node, NodeKind};
use crate::source::{Meta, Span};

#[derive(Default, Debug, Clone, PartialEq, Error)]
pub enum LexErrorKind {
    #[error("Unterminated string literal")]
    UnterminatedString,
    #[error("Unterminated block comment")]
    UnterminatedComment,
    #[error("Unknown escape sequence: '\\{0}'")]
    UnknownEscapeSequence(char),
    #[error("Invalid number format: '{0}'")]
    InvalidNumberFormat(String),
    #[default]
    #[error("Invalid token")]
    InvalidToken,
}

/// A lexing failure: what went wrong, where, and the unconsumed input from
/// that offset on.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind} at {span}")]
pub struct LexError {
    pub kind: LexErrorKind,
    pub span: Span,
    pub remaining: String,
}

// Alias keeps the logos derive from rewriting `'static` into its source lifetime.
type StaticStr = &'static str;
type LexResult<T> = Result<T, LexErrorKind>;

// Raw scanner output. Comments are kept so the fusing pass can turn the ones
// in front of a declaration into doc tokens.
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\f]+")] // Skip whitespace other than newline
#[logos(skip r"#[^\n]*")] // Skip hash comments
#[logos(error = LexErrorKind)]
enum RawToken {
    #[regex(r"--([^-\n][^\n]*)?", |lex| lex.slice()[2..].to_string())]
    LineComment(String),
    #[token("---", block_comment)]
    BlockComment(String),

    #[token("\n", |_| "\n")]
    #[token(";", |_| ";")]
    Terminator(StaticStr),

    #[token(":", |_| ":")]
    #[token(",", |_| ",")]
    #[token("(", |_| "(")]
    #[token(")", |_| ")")]
    #[token("[", |_| "[")]
    #[token("]", |_| "]")]
    #[token("{", |_| "{")]
    #[token("}", |_| "}")]
    Punctuation(StaticStr),

    #[token("==", |_| "==")]
    #[token("/=", |_| "/=")]
    #[token("=>", |_| "=>")]
    #[token("->", |_| "->")]
    #[token("=", |_| "=")]
    #[token("<=", |_| "<=")]
    #[token("<", |_| "<")]
    #[token(">=", |_| ">=")]
    #[token(">", |_| ">")]
    #[token("+", |_| "+")]
    #[token("-", |_| "-")]
    #[token("*", |_| "*")]
    #[token("/", |_| "/")]
    #[token("^", |_| "^")]
    #[token("...", |_| "...")]
    #[token("..", |_| "..")]
    #[token(".", |_| ".")]
    #[token("and", |_| "and")]
    #[token("or", |_| "or")]
    #[token("not", |_| "not")]
    #[token("is", |_| "is")]
    #[token("in", |_| "in")]
    Operator(StaticStr),

    #[regex(r"0[bB][01][01_]*", |lex| radix(lex.slice(), 2))]
    #[regex(r"0[oO][0-7][0-7_]*", |lex| radix(lex.slice(), 8))]
    #[regex(r"0[xX][0-9a-fA-F][0-9a-fA-F_]*", |lex| radix(lex.slice(), 16))]
    #[regex(r"[0-9][0-9_]*", |lex| decimal(lex.slice()))]
    #[regex(r"([0-9][0-9_]*)?\.[0-9][0-9_]*([eE][-+]?[0-9][0-9_]*)?", |lex| decimal(lex.slice()))]
    #[regex(r"[0-9][0-9_]*[eE][-+]?[0-9][0-9_]*", |lex| decimal(lex.slice()))]
    #[token("Infinity", |_| f64::INFINITY)]
    #[token("NaN", |_| f64::NAN)]
    Number(f64),

    #[token("\"\"\"", |lex| long_string(lex, "\"\"\"", true))]
    #[token("'''", |lex| long_string(lex, "'''", false))]
    #[regex(r#""(\\.|[^\\"])*""#, |lex| {
        let slice = lex.slice();
        unescape::unescape(&slice[1..slice.len() - 1])
    })]
    #[regex(r"'(\\.|[^\\'])*'", |lex| {
        let slice = lex.slice();
        unescape::raw(&slice[1..slice.len() - 1])
    })]
    String(String),

    #[token("Nothing")]
    Nothing,
    #[token("True", |_| true)]
    #[token("False", |_| false)]
    Boolean(bool),

    #[token("if", |_| "if")]
    #[token("then", |_| "then")]
    #[token("else", |_| "else")]
    #[token("do", |_| "do")]
    #[token("while", |_| "while")]
    #[token("for", |_| "for")]
    #[token("match", |_| "match")]
    #[token("with", |_| "with")]
    #[token("return", |_| "return")]
    #[token("yield", |_| "yield")]
    #[token("throw", |_| "throw")]
    #[token("extend", |_| "extend")]
    #[token("try", |_| "try")]
    #[token("catch", |_| "catch")]
    #[token("finally", |_| "finally")]
    #[token("var", |_| "var")]
    #[token("Function", |_| "Function")]
    #[token("Generator", |_| "Generator")]
    #[token("Class", |_| "Class")]
    #[token("List", |_| "List")]
    #[token("Map", |_| "Map")]
    Keyword(StaticStr),

    #[regex(r"[_\p{L}][_\p{L}\p{N}]*\??", |lex| lex.slice().to_string())]
    Identifier(String),
}

fn block_comment(lex: &mut Lexer<RawToken>) -> LexResult<String> {
    let remainder = lex.remainder();
    match remainder.find("---") {
        Some(end) => {
            lex.bump(end + 3);
            Ok(remainder[..end].to_string())
        }
        None => {
            lex.bump(remainder.len());
            Err(LexErrorKind::UnterminatedComment)
        }
    }
}

// Triple quoted strings run to the next closing delimiter, newlines included.
fn long_string(lex: &mut Lexer<RawToken>, delimiter: &str, escaped: bool) -> LexResult<String> {
    let remainder = lex.remainder();
    let Some(end) = remainder.find(delimiter) else {
        lex.bump(remainder.len());
        return Err(LexErrorKind::UnterminatedString);
    };
    lex.bump(end + delimiter.len());
    let body = &remainder[..end];
    if escaped {
        unescape::unescape(body)
    } else {
        unescape::raw(body)
    }
}

fn radix(slice: &str, radix: u32) -> LexResult<f64> {
    let digits: String = slice[2..].chars().filter(|c| *c != '_').collect();
    u64::from_str_radix(&digits, radix)
        .map(|n| n as f64)
        .map_err(|_| LexErrorKind::InvalidNumberFormat(slice.to_string()))
}

fn decimal(slice: &str) -> LexResult<f64> {
    let digits: String = slice.chars().filter(|c| *c != '_').collect();
    digits
        .parse::<f64>()
        .map_err(|_| LexErrorKind::InvalidNumberFormat(slice.to_string()))
}

mod unescape {
    use super::{LexErrorKind, LexResult};

    pub fn unescape(s: &str) -> LexResult<String> {
        // un-escaping should only ever reduce the length of the string.
        let mut result = String::with_capacity(s.len());
        let mut chars = s.chars();
        while let Some(c) = chars.next() {
            if c != '\\' {
                result.push(c);
                continue;
            }
            match chars.next() {
                Some('n') => result.push('\n'),
                Some('r') => result.push('\r'),
                Some('t') => result.push('\t'),
                Some('0') => result.push('\0'),
                Some('\\') => result.push('\\'),
                Some('"') => result.push('"'),
                Some('\'') => result.push('\''),
                Some('x') => {
                    let hex: String = chars.by_ref().take(2).collect();
                    result.push(code_point(&hex, 'x')?);
                }
                Some('u') => {
                    if chars.next() != Some('{') {
                        return Err(LexErrorKind::UnknownEscapeSequence('u'));
                    }
                    let hex: String = chars.by_ref().take_while(|c| *c != '}').collect();
                    result.push(code_point(&hex, 'u')?);
                }
                Some(c) => return Err(LexErrorKind::UnknownEscapeSequence(c)),
                None => return Err(LexErrorKind::UnterminatedString),
            }
        }
        Ok(result)
    }

    fn code_point(hex: &str, escape: char) -> LexResult<char> {
        u32::from_str_radix(hex, 16)
            .ok()
            .and_then(char::from_u32)
            .ok_or(LexErrorKind::UnknownEscapeSequence(escape))
    }

    /// Raw strings only collapse escaped quotes and backslashes.
    pub fn raw(s: &str) -> LexResult<String> {
        let mut result = String::with_capacity(s.len());
        let mut chars = s.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '\\'
                && let Some(&next) = chars.peek()
                && matches!(next, '\'' | '"' | '\\')
            {
                result.push(next);
                chars.next();
            } else {
                result.push(c);
            }
        }
        Ok(result)
    }
}

/// Lexes `input` into a token vector ending with an `Eof` sentinel.
///
/// Comments immediately in front of a `var` keyword (newlines aside) become
/// `Doc` tokens, every other comment is dropped. `is not` and `not in` are
/// fused into single operator tokens.
pub fn tokenize(input: &str) -> Result<Vec<Node>, LexError> {
    let source: Rc<str> = Rc::from(input);
    let mut scanned = Vec::new();
    let mut lexer = RawToken::lexer(input);
    while let Some(result) = lexer.next() {
        let range = lexer.span();
        let span = Span::new(range.start, range.end);
        match result {
            Ok(token) => scanned.push((token, span)),
            Err(kind) => {
                let kind = match kind {
                    // A quote that starts no complete string literal.
                    LexErrorKind::InvalidToken if lexer.slice().starts_with(['"', '\'']) => {
                        LexErrorKind::UnterminatedString
                    }
                    kind => kind,
                };
                return Err(LexError {
                    kind,
                    span,
                    remaining: input[span.start..].to_string(),
                });
            }
        }
    }

    let mut tokens = Vec::with_capacity(scanned.len() + 1);
    let mut iter = scanned.into_iter().peekable();
    while let Some((token, span)) = iter.next() {
        let kind = match token {
            RawToken::LineComment(text) | RawToken::BlockComment(text) => {
                if precedes_declaration(iter.clone()) {
                    NodeKind::Doc(text)
                } else {
                    continue;
                }
            }
            RawToken::Operator(first @ ("is" | "not")) => {
                let fused = match (first, iter.peek()) {
                    ("is", Some((RawToken::Operator("not"), _))) => Some("is not"),
                    ("not", Some((RawToken::Operator("in"), _))) => Some("not in"),
                    _ => None,
                };
                if let Some(text) = fused
                    && let Some((_, next_span)) = iter.next()
                {
                    tokens.push(token_node(
                        NodeKind::Operator(text),
                        span.merge(next_span),
                        &source,
                    ));
                    continue;
                }
                NodeKind::Operator(first)
            }
            RawToken::Terminator(text) => NodeKind::Terminator(text),
            RawToken::Punctuation(text) => NodeKind::Punctuation(text),
            RawToken::Operator(text) => NodeKind::Operator(text),
            RawToken::Keyword(text) => NodeKind::Keyword(text),
            RawToken::Number(n) => NodeKind::Number(n),
            RawToken::String(s) => NodeKind::String(s),
            RawToken::Nothing => NodeKind::Nothing,
            RawToken::Boolean(b) => NodeKind::Boolean(b),
            RawToken::Identifier(name) => NodeKind::Identifier(name),
        };
        tokens.push(token_node(kind, span, &source));
    }
    tokens.push(token_node(
        NodeKind::Eof,
        Span::new(input.len(), input.len()),
        &source,
    ));
    Ok(tokens)
}

fn precedes_declaration<I>(rest: I) -> bool
where
    I: Iterator<Item = (RawToken, Span)>,
{
    rest.map(|(token, _)| token)
        .find(|token| *token != RawToken::Terminator("\n"))
        .is_some_and(|token| token == RawToken::Keyword("var"))
}

fn token_node(kind: NodeKind, span: Span, source: &Rc<str>) -> Node {
    Node::with_meta(kind, Meta::new(source.clone(), span))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<NodeKind> {
        match tokenize(input) {
            Ok(tokens) => tokens.into_iter().map(|t| t.kind).collect(),
            Err(e) => panic!("Lexing failed for input '{}': {}", input, e),
        }
    }

    // Helper to simplify testing token sequences; the trailing Eof is implied.
    fn assert_tokens(input: &str, mut expected: Vec<NodeKind>) {
        expected.push(NodeKind::Eof);
        assert_eq!(kinds(input), expected, "Input: '{}'", input);
    }

    fn assert_lexer_error(input: &str, expected_error_variant: LexErrorKind) {
        match tokenize(input) {
            Ok(tokens) => panic!(
                "Expected lexing to fail for input '{}', but got tokens: {:?}",
                input, tokens
            ),
            Err(e) => {
                assert_eq!(
                    std::mem::discriminant(&e.kind),
                    std::mem::discriminant(&expected_error_variant),
                    "Input: '{}', Expected error variant like {:?}, got: {:?}",
                    input,
                    expected_error_variant,
                    e
                );
            }
        }
    }

    fn op(text: &'static str) -> NodeKind {
        NodeKind::Operator(text)
    }

    fn ident(name: &str) -> NodeKind {
        NodeKind::Identifier(name.to_string())
    }

    #[test]
    fn test_empty_input() {
        assert_tokens("", vec![]);
    }

    #[test]
    fn test_tokenize_metadata() {
        let source = "var x";
        let tokens = tokenize(source).expect("Should tokenize successfully");
        assert_eq!(tokens.len(), 3);

        let var = tokens[0].meta.as_ref().unwrap();
        assert_eq!(var.position(), 0);
        assert_eq!(var.matched(), "var");
        assert_eq!(&*var.source, source);

        let x = tokens[1].meta.as_ref().unwrap();
        assert_eq!(x.position(), 4);
        assert_eq!(x.matched(), "x");

        let eof = tokens[2].meta.as_ref().unwrap();
        assert_eq!(eof.span, Span::new(5, 5));
        assert_eq!(eof.matched(), "");
    }

    #[test]
    fn test_doc_comments() {
        assert_tokens(
            "--- a doc comment ---\nvar",
            vec![
                NodeKind::Doc(" a doc comment ".to_string()),
                NodeKind::Terminator("\n"),
                NodeKind::Keyword("var"),
            ],
        );
        assert_tokens(
            "--comment\nvar",
            vec![
                NodeKind::Doc("comment".to_string()),
                NodeKind::Terminator("\n"),
                NodeKind::Keyword("var"),
            ],
        );
    }

    #[test]
    fn test_comments() {
        assert_tokens(
            "-- a comment\n---\na multiline comment\n---",
            vec![NodeKind::Terminator("\n")],
        );
        assert_tokens("x # hash comment", vec![ident("x")]);
        assert_tokens(
            "a -- not documentation\nb",
            vec![ident("a"), NodeKind::Terminator("\n"), ident("b")],
        );
    }

    #[test]
    fn test_whitespace() {
        assert_tokens(
            "\t  \n\n",
            vec![NodeKind::Terminator("\n"), NodeKind::Terminator("\n")],
        );
        assert_tokens(
            "a;b",
            vec![ident("a"), NodeKind::Terminator(";"), ident("b")],
        );
    }

    #[test]
    fn test_punctuation() {
        assert_tokens(
            ",:()[]{}",
            [",", ":", "(", ")", "[", "]", "{", "}"]
                .into_iter()
                .map(NodeKind::Punctuation)
                .collect(),
        );
    }

    #[test]
    fn test_symbolic_operators() {
        let operators = [
            "==", "/=", "=>", "->", "=", "<=", "<", ">=", ">", "+", "-", "*", "/", "^", "...",
            "..", ".",
        ];
        assert_tokens(
            "== /= => -> = <= < >= > + - * / ^ ... .. .",
            operators.into_iter().map(op).collect(),
        );
    }

    #[test]
    fn test_word_operators() {
        assert_tokens(
            "not in is not not is in",
            vec![op("not in"), op("is not"), op("not"), op("is"), op("in")],
        );
        assert_tokens(
            "a and b or c",
            vec![ident("a"), op("and"), ident("b"), op("or"), ident("c")],
        );
        // Only the exact words are operators.
        assert_tokens("island notion", vec![ident("island"), ident("notion")]);
    }

    #[test]
    fn test_fused_operator_spans() {
        let tokens = tokenize("a is  not b").expect("Should tokenize successfully");
        assert_eq!(tokens[1].kind, op("is not"));
        assert_eq!(tokens[1].meta.as_ref().unwrap().span, Span::new(2, 9));
    }

    #[test]
    fn test_integers() {
        assert_tokens(
            "0b101011 0B11_01",
            vec![NodeKind::Number(43.0), NodeKind::Number(13.0)],
        );
        assert_tokens(
            "0o77623 0O5_51",
            vec![NodeKind::Number(32659.0), NodeKind::Number(361.0)],
        );
        assert_tokens(
            "0xff45A 0XA90_FF2",
            vec![NodeKind::Number(1045594.0), NodeKind::Number(11079666.0)],
        );
        assert_tokens(
            "4310 123_543_999",
            vec![NodeKind::Number(4310.0), NodeKind::Number(123543999.0)],
        );
    }

    #[test]
    fn test_floats() {
        let kinds = kinds("3.14 1.1e-4 12E4_5 0.1_e+1_ .5 Infinity NaN");
        assert_eq!(
            &kinds[..6],
            &[
                NodeKind::Number(3.14),
                NodeKind::Number(1.1e-4),
                NodeKind::Number(12e45),
                NodeKind::Number(0.1e1),
                NodeKind::Number(0.5),
                NodeKind::Number(f64::INFINITY),
            ]
        );
        assert!(matches!(kinds[6], NodeKind::Number(n) if n.is_nan()));
        assert_eq!(kinds[7], NodeKind::Eof);
    }

    #[test]
    fn test_range_is_not_a_float() {
        assert_tokens(
            "1..2",
            vec![NodeKind::Number(1.0), op(".."), NodeKind::Number(2.0)],
        );
    }

    #[test]
    fn test_strings() {
        assert_tokens(
            r#""string\n""#,
            vec![NodeKind::String("string\n".to_string())],
        );
        assert_tokens(
            "\"\"\"\nmulti\\tline\\tstring\n\"\"\"",
            vec![NodeKind::String("\nmulti\tline\tstring\n".to_string())],
        );
        assert_tokens(
            r#""esc \" \' \\ \x41 \u{3bb}""#,
            vec![NodeKind::String("esc \" ' \\ A λ".to_string())],
        );
        assert_tokens(r#""""#, vec![NodeKind::String(String::new())]);
    }

    #[test]
    fn test_raw_strings() {
        assert_tokens(
            "'raw string\\t'",
            vec![NodeKind::String("raw string\\t".to_string())],
        );
        assert_tokens(
            "'''\nraw string\\t'''",
            vec![NodeKind::String("\nraw string\\t".to_string())],
        );
        assert_tokens(
            r"'it\'s'",
            vec![NodeKind::String("it's".to_string())],
        );
    }

    #[test]
    fn test_literals() {
        assert_tokens(
            "Nothing True False",
            vec![
                NodeKind::Nothing,
                NodeKind::Boolean(true),
                NodeKind::Boolean(false),
            ],
        );
    }

    #[test]
    fn test_keywords() {
        let keywords = [
            "if", "then", "else", "do", "while", "for", "match", "with", "return", "yield",
            "throw", "extend", "try", "catch", "finally", "var", "Function", "Generator", "Class",
            "List", "Map",
        ];
        assert_tokens(
            &keywords.join(" "),
            keywords.into_iter().map(NodeKind::Keyword).collect(),
        );
    }

    #[test]
    fn test_identifiers() {
        assert_tokens(
            "i variable_snake_case camelCase _ π2 λ βeta_version even?",
            vec![
                ident("i"),
                ident("variable_snake_case"),
                ident("camelCase"),
                ident("_"),
                ident("π2"),
                ident("λ"),
                ident("βeta_version"),
                ident("even?"),
            ],
        );
        assert_tokens("format", vec![ident("format")]);
        assert_tokens("Lists", vec![ident("Lists")]);
    }

    #[test]
    fn test_program() {
        let input = "var add = Function { a, b -> a + b }\nadd(1, 2.5)";
        assert_tokens(
            input,
            vec![
                NodeKind::Keyword("var"),
                ident("add"),
                op("="),
                NodeKind::Keyword("Function"),
                NodeKind::Punctuation("{"),
                ident("a"),
                NodeKind::Punctuation(","),
                ident("b"),
                op("->"),
                ident("a"),
                op("+"),
                ident("b"),
                NodeKind::Punctuation("}"),
                NodeKind::Terminator("\n"),
                ident("add"),
                NodeKind::Punctuation("("),
                NodeKind::Number(1.0),
                NodeKind::Punctuation(","),
                NodeKind::Number(2.5),
                NodeKind::Punctuation(")"),
            ],
        );
    }

    // --- Error Condition Tests ---

    #[test]
    fn test_unterminated_string() {
        assert_lexer_error(r#""hello"#, LexErrorKind::UnterminatedString);
        assert_lexer_error(r#""hello\""#, LexErrorKind::UnterminatedString);
        assert_lexer_error(r#"""#, LexErrorKind::UnterminatedString);
        assert_lexer_error("'raw", LexErrorKind::UnterminatedString);
        assert_lexer_error("\"\"\"never closed", LexErrorKind::UnterminatedString);
    }

    #[test]
    fn test_unterminated_comment() {
        assert_lexer_error("--- open", LexErrorKind::UnterminatedComment);
    }

    #[test]
    fn test_invalid_escape() {
        assert_lexer_error(r#""hello \a""#, LexErrorKind::UnknownEscapeSequence('a'));
        assert_lexer_error(r#""\xZZ""#, LexErrorKind::UnknownEscapeSequence('x'));
    }

    #[test]
    fn test_invalid_token_reports_remaining_input() {
        let error = tokenize("a $ b").expect_err("Expected lexing to fail");
        assert_eq!(error.kind, LexErrorKind::InvalidToken);
        assert_eq!(error.span.start, 2);
        assert_eq!(error.remaining, "$ b");
    }

    #[test]
    fn test_number_overflow() {
        assert_lexer_error(
            "0xFFFFFFFFFFFFFFFFFFFF",
            LexErrorKind::InvalidNumberFormat(String::new()),
        );
    }
}
