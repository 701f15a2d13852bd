use std::fmt;

/// Failure categories for the whole-module passes. `Internal` marks IR shapes
/// that earlier compiler stages must never produce; those messages point at a
/// compiler bug rather than user code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PassErrorKind {
    InvalidOperand,
    UnresolvedInterrupt,
    MalformedDescriptor,
    Redeclaration,
    Internal,
}

#[derive(Clone, Debug)]
pub struct PassError {
    pub kind: PassErrorKind,
    pub message: String,
    pub symbol: Option<String>,
}

impl PassError {
    pub fn new(kind: PassErrorKind, message: impl Into<String>) -> Self {
        let message = match kind {
            PassErrorKind::Internal => format!("internal error: {}", message.into()),
            _ => message.into(),
        };
        Self {
            kind,
            message,
            symbol: None,
        }
    }

    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    pub fn is_internal(&self) -> bool {
        self.kind == PassErrorKind::Internal
    }
}

impl fmt::Display for PassError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.symbol {
            Some(symbol) => write!(f, "{} (at `{}`)", self.message, symbol),
            None => write!(f, "{}", self.message),
        }
    }
}
