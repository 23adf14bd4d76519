use crate::Error;
use crate::evaluator::EvalError;
use crate::lexer::LexError;
use crate::parsing::ParseError;
use crate::source::Meta;
use ariadne::{Cache, Color, Label, Report, ReportKind};
use std::ops::Range;
use std::rc::Rc;

const SOURCE_ID: &str = "input";

type Diagnostic = Report<'static, (String, Range<usize>)>;

/// The texts one diagnostic points into. Spans from the input being run are
/// labelled `input`. Values defined by earlier runs carry their own source,
/// numbered in order of appearance.
struct Sources<'a> {
    input: &'a str,
    earlier: Vec<Rc<str>>,
}

impl<'a> Sources<'a> {
    fn new(input: &'a str) -> Self {
        Sources {
            input,
            earlier: Vec::new(),
        }
    }

    fn input_span(&self, range: Range<usize>) -> (String, Range<usize>) {
        (SOURCE_ID.to_string(), range)
    }

    fn span(&mut self, meta: &Meta) -> (String, Range<usize>) {
        if *meta.source == *self.input {
            return self.input_span(meta.span.to_range());
        }
        let index = match self.earlier.iter().position(|source| **source == *meta.source) {
            Some(index) => index,
            None => {
                self.earlier.push(meta.source.clone());
                self.earlier.len() - 1
            }
        };
        (earlier_id(index), meta.span.to_range())
    }

    fn cache(&self) -> impl Cache<String> + use<> {
        let mut entries = vec![(SOURCE_ID.to_string(), self.input.to_string())];
        for (index, source) in self.earlier.iter().enumerate() {
            entries.push((earlier_id(index), source.to_string()));
        }
        ariadne::sources(entries)
    }

    fn emit(&self, report: Diagnostic) {
        if let Err(e) = report.eprint(self.cache()) {
            eprintln!("Failed to render diagnostic: {}", e);
        }
    }
}

fn earlier_id(index: usize) -> String {
    format!("earlier input {}", index + 1)
}

impl LexError {
    fn report(&self, sources: &mut Sources) -> Diagnostic {
        let range = self.span.to_range();
        Report::build(ReportKind::Error, sources.input_span(range.clone()))
            .with_message("Lexer error")
            .with_label(
                Label::new(sources.input_span(range))
                    .with_message(self.kind.to_string())
                    .with_color(Color::Red),
            )
            .finish()
    }

    pub fn pretty_print(&self, input: &str) {
        let mut sources = Sources::new(input);
        let report = self.report(&mut sources);
        sources.emit(report);
    }
}

impl ParseError {
    fn report(&self, sources: &mut Sources) -> Diagnostic {
        let (message, span, label) = match self {
            ParseError::Lex(lex_error) => return lex_error.report(sources),
            ParseError::Expected {
                expected,
                found,
                span,
            } => (
                format!("Unexpected {}", found),
                span,
                format!("Expected {}", expected),
            ),
            ParseError::Incomplete { found, span } => (
                format!("Unexpected {}", found),
                span,
                "Expected end of input".to_string(),
            ),
            ParseError::TooDeep { span } => (
                "Expressions nested too deeply".to_string(),
                span,
                "Expected fewer nested expressions".to_string(),
            ),
        };
        Report::build(ReportKind::Error, sources.input_span(span.to_range()))
            .with_message(message)
            .with_label(
                Label::new(sources.input_span(span.to_range()))
                    .with_message(label)
                    .with_color(Color::Red),
            )
            .finish()
    }

    pub fn pretty_print(&self, input: &str) {
        let mut sources = Sources::new(input);
        let report = self.report(&mut sources);
        sources.emit(report);
    }
}

impl EvalError {
    fn report(&self, sources: &mut Sources) -> Diagnostic {
        match self {
            EvalError::Uncaught { message, stack, .. } => {
                let at = match stack.last() {
                    Some(meta) => sources.span(meta),
                    None => sources.input_span(0..0),
                };
                let mut report = Report::build(ReportKind::Error, at)
                    .with_message(format!("Uncaught error: {}", message));
                // The last entry is where the error was raised, the rest are
                // the calls leading to it.
                if let Some((raised, calls)) = stack.split_last() {
                    report = report.with_label(
                        Label::new(sources.span(raised))
                            .with_message("raised here")
                            .with_color(Color::Red)
                            .with_order(0),
                    );
                    for (depth, call) in calls.iter().rev().enumerate() {
                        report = report.with_label(
                            Label::new(sources.span(call))
                                .with_message("called from here")
                                .with_color(Color::Yellow)
                                .with_order(depth as i32 + 1),
                        );
                    }
                }
                report.finish()
            }
            EvalError::YieldOutsideGenerator | EvalError::ReturnOutsideFunction => {
                Report::build(ReportKind::Error, sources.input_span(0..0))
                    .with_message(self.to_string())
                    .finish()
            }
        }
    }

    pub fn pretty_print(&self, input: &str) {
        let mut sources = Sources::new(input);
        let report = self.report(&mut sources);
        sources.emit(report);
    }
}

impl Error {
    fn report(&self, sources: &mut Sources) -> Diagnostic {
        match self {
            Error::Parse(e) => e.report(sources),
            Error::Eval(e) => e.report(sources),
        }
    }

    pub fn pretty_print(&self, input: &str) {
        let mut sources = Sources::new(input);
        let report = self.report(&mut sources);
        sources.emit(report);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Environment, run};

    fn render(error: &Error, input: &str) -> String {
        let mut sources = Sources::new(input);
        let report = error.report(&mut sources);
        let mut out = Vec::new();
        report.write(sources.cache(), &mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_labels_point_into_their_own_source() {
        let env = Environment::new_global_populated();
        run("var f = Function { x -> x / 0 }", env.clone()).unwrap();
        let input = "f(1)";
        let error = run(input, env).unwrap_err();

        let rendered = render(&error, input);
        assert!(rendered.contains("Division by zero"), "{}", rendered);
        assert!(rendered.contains("raised here"), "{}", rendered);
        assert!(rendered.contains("called from here"), "{}", rendered);
        assert!(rendered.contains("earlier input 1"), "{}", rendered);
        assert!(!rendered.contains("?:?"), "{}", rendered);
    }

    #[test]
    fn test_parse_errors_point_into_the_input() {
        let input = "var = 4";
        let error = run(input, Environment::new_global_populated()).unwrap_err();
        let rendered = render(&error, input);
        assert!(rendered.contains("Expected pattern"), "{}", rendered);
        assert!(!rendered.contains("earlier input"), "{}", rendered);
        assert!(!rendered.contains("?:?"), "{}", rendered);
    }
}
