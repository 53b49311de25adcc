//! Compile error type
//!
//! The compiler is fail-fast: the first error aborts the translation unit.
//! Every error carries the taxonomy kind plus the source location of the
//! token that triggered it, so the driver can print `file:line: message`
//! diagnostics before exiting.

use crate::token::Token;

/// Classification of a compile error.
///
/// The kinds are grouped into lexical, syntactic, semantic, unsupported,
/// overflow and internal families. Internal errors indicate invariant
/// violations in the compiler itself and are never expected on valid or
/// invalid input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    // Lexical
    UnexpectedChar,
    UnclosedString,
    UnclosedChar,
    EmptyChar,
    UnsupportedEscape,
    DirectiveMidLine,
    MalformedNumber,

    // Syntactic
    ExpectedToken,
    ExpectedDeclarator,
    InvalidTypeSpecifierCombo,
    RedundantSpecifier,

    // Semantic
    UnknownName,
    KindMismatch,
    TypeMismatch,
    ArityMismatch,
    IncompleteType,
    NonLvalueAssignment,
    NonAddressable,
    DuplicateMember,
    DuplicateSymbol,
    InvalidInitializer,
    ConstantExpressionRequired,

    // Other
    UnsupportedFeature,
    NumericLiteralOverflow,
    /// A warning elevated to an error by the warning configuration.
    ElevatedWarning,
    Io,
    Internal,
}

/// A fatal compile error with an optional source location.
#[derive(Debug, Clone)]
pub struct CompileError {
    pub kind: ErrorKind,
    pub message: String,
    pub filename: Option<String>,
    pub line: u32,
}

impl CompileError {
    /// Create an error with no source location (driver and I/O failures).
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        CompileError {
            kind,
            message: message.into(),
            filename: None,
            line: 0,
        }
    }

    /// Create an error located at the given token.
    pub fn at(kind: ErrorKind, token: &Token, message: impl Into<String>) -> Self {
        CompileError {
            kind,
            message: message.into(),
            filename: Some(token.filename.to_string()),
            line: token.line,
        }
    }

    /// Create an error located at an explicit file and line (used by the
    /// lexer before a token exists).
    pub fn at_location(
        kind: ErrorKind,
        filename: &str,
        line: u32,
        message: impl Into<String>,
    ) -> Self {
        CompileError {
            kind,
            message: message.into(),
            filename: Some(filename.to_string()),
            line,
        }
    }

    /// Shorthand for internal invariant violations.
    pub fn internal(message: impl Into<String>) -> Self {
        CompileError::new(ErrorKind::Internal, message)
    }
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.filename {
            Some(name) => write!(f, "{}:{}: {}", name, self.line, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for CompileError {}

/// Result alias used throughout the compiler.
pub type Result<T> = std::result::Result<T, CompileError>;

/// Convenience constructor returning `Err` directly.
pub fn err<T>(kind: ErrorKind, token: &Token, message: impl Into<String>) -> Result<T> {
    Err(CompileError::at(kind, token, message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::{Token, TokenKind};
    use std::rc::Rc;

    #[test]
    fn test_display_with_location() {
        let token = Token {
            kind: TokenKind::Alphanumeric,
            value: Rc::from("foo"),
            filename: Rc::from("test.i"),
            line: 12,
        };
        let e = CompileError::at(ErrorKind::UnknownName, &token, "No such variable: foo");
        assert_eq!(format!("{}", e), "test.i:12: No such variable: foo");
    }

    #[test]
    fn test_display_without_location() {
        let e = CompileError::new(ErrorKind::Io, "Failed to open input file");
        assert_eq!(format!("{}", e), "Failed to open input file");
    }
}
