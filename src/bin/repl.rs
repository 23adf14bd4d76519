use std::borrow::Cow;

use eazy::{Env, Environment, NodeKind, run, tokenize};
use rustyline::error::ReadlineError;
use rustyline::highlight::{CmdKind, Highlighter};
use rustyline::validate::{ValidationContext, ValidationResult, Validator};
use rustyline::{
    Cmd, Completer, Context, EditMode, Editor, EventHandler, KeyCode, KeyEvent, Modifiers,
};
use rustyline::{Helper, Highlighter, Hinter, Validator};

const KEYWORDS: &[&str] = &[
    "if", "then", "else", "do", "while", "for", "match", "with", "return", "yield", "throw",
    "extend", "try", "catch", "finally", "var", "Function", "Generator", "Class", "List", "Map",
    "Nothing", "True", "False",
];

/// Settings read from the environment: `EAZY_EDIT_MODE` (`vi` or `emacs`)
/// and `EAZY_HISTORY` (path of the history file).
struct ReplConfig {
    edit_mode: EditMode,
    history_file: String,
}

impl ReplConfig {
    fn from_env() -> Self {
        let edit_mode = match std::env::var("EAZY_EDIT_MODE") {
            Ok(mode) if mode.eq_ignore_ascii_case("vi") => EditMode::Vi,
            _ => EditMode::Emacs,
        };
        let history_file =
            std::env::var("EAZY_HISTORY").unwrap_or_else(|_| "eazy_history.txt".to_string());
        ReplConfig {
            edit_mode,
            history_file,
        }
    }
}

struct EazyCompleter {
    env: Env,
}

impl EazyCompleter {
    fn new(env: Env) -> Self {
        EazyCompleter { env }
    }
}

impl rustyline::completion::Completer for EazyCompleter {
    type Candidate = String;
    fn complete(
        &self,
        line: &str,
        pos: usize,
        _ctx: &Context<'_>,
    ) -> rustyline::Result<(usize, Vec<String>)> {
        let Ok(tokens) = tokenize(&line[..pos]) else {
            return Ok((pos, vec![]));
        };
        // Only complete a name that ends right at the cursor.
        let prefix = tokens.iter().rev().find_map(|token| match (&token.kind, &token.meta) {
            (NodeKind::Identifier(name), Some(meta)) if meta.span.end == pos => Some(name.clone()),
            (NodeKind::Keyword(name), Some(meta)) if meta.span.end == pos => Some(name.to_string()),
            _ => None,
        });
        let Some(prefix) = prefix else {
            return Ok((pos, vec![]));
        };
        let mut candidates: Vec<String> = self
            .env
            .borrow()
            .get_identifiers()
            .into_iter()
            .chain(KEYWORDS.iter().map(|k| k.to_string()))
            .filter(|id| id.starts_with(&prefix) && id.len() > prefix.len())
            .map(|id| id[prefix.len()..].to_string())
            .collect();
        candidates.sort();
        candidates.dedup();
        Ok((pos, candidates))
    }
}

#[derive(Completer, Helper, Highlighter, Hinter, Validator)]
struct InputValidator {
    #[rustyline(Validator)]
    validator: EazyValidator,
    #[rustyline(Highlighter)]
    highlighter: EazyHighlighter,
    #[rustyline(Completer)]
    completer: EazyCompleter,
}

fn closes(opening: char, closing: char) -> bool {
    matches!((opening, closing), ('(', ')') | ('[', ']') | ('{', '}'))
}

// Tracks whether the scanner is inside a string or a line comment.
#[derive(Default)]
struct Scanner {
    quote: Option<char>,
    escape: bool,
    comment: bool,
}

impl Scanner {
    /// Feeds one character; returns true when it is plain code.
    fn code(&mut self, c: char, next: Option<char>) -> bool {
        if self.comment {
            self.comment = c != '\n';
            return false;
        }
        if let Some(quote) = self.quote {
            if self.escape {
                self.escape = false;
            } else if c == '\\' {
                self.escape = true;
            } else if c == quote {
                self.quote = None;
            }
            return false;
        }
        match c {
            '"' | '\'' => {
                self.quote = Some(c);
                false
            }
            '#' => {
                self.comment = true;
                false
            }
            '-' if next == Some('-') => {
                self.comment = true;
                false
            }
            _ => true,
        }
    }
}

struct EazyValidator;

impl Validator for EazyValidator {
    fn validate(&self, ctx: &mut ValidationContext) -> rustyline::Result<ValidationResult> {
        let input = ctx.input();
        let mut stack = Vec::new();
        let mut scanner = Scanner::default();
        let mut chars = input.char_indices().peekable();

        while let Some((i, c)) = chars.next() {
            let next = chars.peek().map(|&(_, c)| c);
            if !scanner.code(c, next) {
                continue;
            }
            match c {
                '(' | '[' | '{' => stack.push(c),
                ')' | ']' | '}' => match stack.pop() {
                    Some(opening) if closes(opening, c) => {}
                    _ => {
                        return Ok(ValidationResult::Invalid(Some(format!(
                            "  - Unmatched '{}' at position {}",
                            c, i
                        ))));
                    }
                },
                _ => {}
            }
        }

        if scanner.quote.is_some() || !stack.is_empty() {
            Ok(ValidationResult::Incomplete)
        } else {
            Ok(ValidationResult::Valid(None))
        }
    }
}

struct EazyHighlighter;

impl Highlighter for EazyHighlighter {
    fn highlight<'l>(&self, line: &'l str, pos: usize) -> Cow<'l, str> {
        // Byte offsets of the bracket pair touching the cursor, if any.
        let mut stack: Vec<(char, usize)> = Vec::new();
        let mut pairs: Vec<(usize, usize)> = Vec::new();
        let mut unmatched: Vec<usize> = Vec::new();
        let mut strings: Vec<usize> = Vec::new();
        let mut scanner = Scanner::default();
        let mut chars = line.char_indices().peekable();

        while let Some((i, c)) = chars.next() {
            let next = chars.peek().map(|&(_, c)| c);
            if !scanner.code(c, next) {
                if scanner.quote.is_some() || c == '"' || c == '\'' {
                    strings.push(i);
                }
                continue;
            }
            match c {
                '(' | '[' | '{' => stack.push((c, i)),
                ')' | ']' | '}' => match stack.pop() {
                    Some((opening, at)) if closes(opening, c) => pairs.push((at, i)),
                    Some((_, at)) => unmatched.extend([at, i]),
                    None => unmatched.push(i),
                },
                _ => {}
            }
        }

        let cursor = pos.checked_sub(1);
        let active = pairs
            .iter()
            .find(|&&(open, close)| Some(open) == cursor || Some(close) == cursor || open == pos);
        let mut highlighted = String::with_capacity(line.len());
        for (i, c) in line.char_indices() {
            if unmatched.contains(&i) {
                highlighted.push_str(&format!("\x1b[1;31m{}\x1b[0m", c)); // Red for unmatched brackets
            } else if active.is_some_and(|&(open, close)| open == i || close == i) {
                highlighted.push_str(&format!("\x1b[1;34m{}\x1b[0m", c)); // Blue for the matching pair
            } else if strings.contains(&i) {
                highlighted.push_str(&format!("\x1b[32m{}\x1b[0m", c)); // Green for strings
            } else {
                highlighted.push(c);
            }
        }

        Cow::Owned(highlighted)
    }

    fn highlight_char(&self, _line: &str, _pos: usize, _kind: CmdKind) -> bool {
        true
    }
}

fn show_doc(env: &Env, name: &str) {
    let env = env.borrow();
    match (env.get(name), env.doc(name)) {
        (Ok(_), Some(doc)) => println!("{}:{}", name, doc),
        (Ok(value), None) => println!("{}: no documentation ({})", name, value.type_name()),
        (Err(e), _) => eprintln!("{}", e),
    }
}

fn main() -> rustyline::Result<()> {
    println!("eazy REPL v{}", env!("CARGO_PKG_VERSION"));
    println!("Type 'exit' or press Ctrl-D to quit, ':doc NAME' to read a doc comment.");

    let repl_config = ReplConfig::from_env();
    let global_env = Environment::new_global_populated();
    let h = InputValidator {
        highlighter: EazyHighlighter,
        validator: EazyValidator,
        completer: EazyCompleter::new(global_env.clone()),
    };
    let config = rustyline::config::Config::builder()
        .edit_mode(repl_config.edit_mode)
        .auto_add_history(true)
        .build();
    let mut rl = Editor::with_config(config)?;
    rl.set_helper(Some(h));
    rl.bind_sequence(
        KeyEvent(KeyCode::Char('s'), Modifiers::CTRL),
        EventHandler::Simple(Cmd::Newline),
    );
    if rl.load_history(&repl_config.history_file).is_err() {
        println!("No previous history.");
    }

    loop {
        match rl.readline("eazy> ") {
            Ok(line) => {
                let input = line.trim();
                if input.is_empty() {
                    continue;
                }
                if input.eq_ignore_ascii_case("exit") {
                    break;
                }
                if let Some(name) = input.strip_prefix(":doc") {
                    show_doc(&global_env, name.trim());
                    continue;
                }

                match run(input, global_env.clone()) {
                    Ok(value) => println!("{}", value),
                    Err(e) => e.pretty_print(input),
                }
            }
            Err(ReadlineError::Interrupted) => {
                // Ctrl-C
                println!("Interrupted. Type 'exit' or Ctrl-D to quit.");
            }
            Err(ReadlineError::Eof) => {
                // Ctrl-D
                println!("\nExiting.");
                break;
            }
            Err(err) => {
                eprintln!("Readline Error: {:?}", err);
                break;
            }
        }
    }
    rl.save_history(&repl_config.history_file)
}
