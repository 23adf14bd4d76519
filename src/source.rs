use std::fmt;
use std::ops::Range;
use std::rc::Rc;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)] // Default for convenience
pub struct Span {
    pub start: usize, // Byte offset
    pub end: usize,   // Byte offset (exclusive)
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Span { start, end }
    }

    // Helper to merge two spans (e.g., for a node built from several tokens)
    pub fn merge(self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    pub fn to_range(self) -> Range<usize> {
        self.start..self.end
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// Where a node came from: the whole source text and the byte span it was
/// matched from. `matched()` reconstructs the exact slice.
#[derive(Debug, Clone)]
pub struct Meta {
    pub source: Rc<str>,
    pub span: Span,
}

impl Meta {
    pub fn new(source: Rc<str>, span: Span) -> Self {
        Meta { source, span }
    }

    pub fn position(&self) -> usize {
        self.span.start
    }

    pub fn matched(&self) -> &str {
        self.source.get(self.span.to_range()).unwrap_or("")
    }

    /// Metadata covering both `self` and `other`, which must share a source.
    pub fn merge(&self, other: &Meta) -> Meta {
        Meta {
            source: self.source.clone(),
            span: self.span.merge(other.span),
        }
    }
}
