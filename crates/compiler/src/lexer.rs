//! Lexer
//!
//! Tokenises a preprocessed C translation unit. The input has already been
//! through the preprocessor: comments and line continuations are gone and
//! the only directives left are `#line` and `#pragma`.
//!
//! The lexer keeps one current token available at all times and supports a
//! single token of push-back for the places where the parser needs to
//! reconsider (declarator lookahead).

use std::rc::Rc;

use crate::errors::{CompileError, ErrorKind, Result};
use crate::strings::Interner;
use crate::token::{Token, TokenKind, TokenRef};

/// Characters that can start a punctuation token.
const PUNCTUATION_CHARS: &str = "+-*/%&|^!~<>=()[]{}.?:,;";

#[derive(Debug)]
pub struct Lexer {
    source: Vec<u8>,
    pos: usize,

    /// The next character, not yet part of any token. -1 at end of input.
    ch: i32,

    /// Token bytes are accumulated here while scanning.
    buffer: Vec<u8>,

    pub interner: Interner,
    pub filename: Rc<str>,
    pub line: u32,

    /// The current token. Always valid after construction.
    pub token: TokenRef,

    /// A single pushed-back token, consumed before reading more input.
    queued: Option<TokenRef>,
}

fn is_ident_char(c: i32, first: bool) -> bool {
    if c < 0 {
        return false;
    }
    let c = c as u8;
    if first && c.is_ascii_digit() {
        return false;
    }
    // $ is accepted as an extension for compatibility with GNU C.
    c.is_ascii_alphanumeric() || c == b'_' || c == b'$'
}

fn is_end_of_line(c: i32) -> bool {
    c == i32::from(b'\n') || c == i32::from(b'\r') || c == -1
}

impl Lexer {
    pub fn new(source: Vec<u8>, filename: &str) -> Result<Self> {
        let mut interner = Interner::new();
        let filename = interner.intern(filename);
        let end = Token::new(TokenKind::End, interner.intern(""), filename.clone(), 1);
        let mut lexer = Lexer {
            source,
            pos: 0,
            // Prime the current char with a newline so the first line can be
            // a #line directive or #pragma.
            ch: i32::from(b'\n'),
            buffer: Vec::new(),
            interner,
            filename,
            line: 1,
            token: end,
            queued: None,
        };
        lexer.consume()?;
        Ok(lexer)
    }

    fn error<T>(&self, kind: ErrorKind, message: impl Into<String>) -> Result<T> {
        Err(CompileError::at_location(
            kind,
            &self.filename,
            self.line,
            message,
        ))
    }

    fn read_char(&mut self) -> i32 {
        self.ch = match self.source.get(self.pos) {
            Some(&b) => {
                self.pos += 1;
                i32::from(b)
            }
            None => -1,
        };
        self.ch
    }

    fn consume_escape_sequence(&mut self) -> Result<u8> {
        let c = self.read_char();
        match c {
            c if c == i32::from(b'a') => Ok(0x07),
            c if c == i32::from(b'b') => Ok(0x08),
            c if c == i32::from(b't') => Ok(b'\t'),
            c if c == i32::from(b'n') => Ok(b'\n'),
            c if c == i32::from(b'v') => Ok(0x0b),
            c if c == i32::from(b'f') => Ok(0x0c),
            c if c == i32::from(b'r') => Ok(b'\r'),
            // escape (extension, not standard C)
            c if c == i32::from(b'e') => Ok(0x1b),
            c if c == i32::from(b'"') => Ok(b'"'),
            c if c == i32::from(b'\'') => Ok(b'\''),
            c if c == i32::from(b'?') => Ok(b'?'),
            c if c == i32::from(b'\\') => Ok(b'\\'),
            c if c == i32::from(b'0') => Ok(0),
            c if c == i32::from(b'x') || c == i32::from(b'X') => self.error(
                ErrorKind::UnsupportedEscape,
                "Hexadecimal escape sequences are not supported.",
            ),
            c if c == i32::from(b'u') || c == i32::from(b'U') => self.error(
                ErrorKind::UnsupportedEscape,
                "Unicode escape sequences are not supported.",
            ),
            _ => self.error(ErrorKind::UnsupportedEscape, "Unrecognized escape sequence."),
        }
    }

    fn consume_string_literal(&mut self) -> Result<()> {
        debug_assert_eq!(self.ch, i32::from(b'"'));
        self.buffer.clear();

        loop {
            let c = self.read_char();
            if c == i32::from(b'"') {
                self.read_char();
                return Ok(());
            }
            if is_end_of_line(c) {
                return self.error(ErrorKind::UnclosedString, "Unclosed string literal.");
            }
            let byte = if c == i32::from(b'\\') {
                self.consume_escape_sequence()?
            } else {
                c as u8
            };
            self.buffer.push(byte);
        }
    }

    fn consume_char_literal(&mut self) -> Result<()> {
        debug_assert_eq!(self.ch, i32::from(b'\''));

        let c = self.read_char();
        if c == i32::from(b'\'') {
            return self.error(ErrorKind::EmptyChar, "Empty char literal is not allowed.");
        }
        if is_end_of_line(c) {
            return self.error(ErrorKind::UnclosedChar, "Unclosed character literal.");
        }
        let byte = if c == i32::from(b'\\') {
            self.consume_escape_sequence()?
        } else {
            c as u8
        };

        self.buffer.clear();
        self.buffer.push(byte);

        let c = self.read_char();
        if is_end_of_line(c) {
            return self.error(ErrorKind::UnclosedChar, "Unclosed character literal.");
        }
        if c != i32::from(b'\'') {
            return self.error(
                ErrorKind::UnclosedChar,
                "Only a single character is supported in a char literal.",
            );
        }
        self.read_char();
        Ok(())
    }

    fn consume_optional_horizontal_whitespace(&mut self) {
        while self.ch == i32::from(b' ') || self.ch == i32::from(b'\t') {
            self.read_char();
        }
    }

    fn consume_horizontal_whitespace(&mut self) -> Result<()> {
        if self.ch != i32::from(b' ') && self.ch != i32::from(b'\t') {
            return self.error(ErrorKind::ExpectedToken, "Expected horizontal whitespace.");
        }
        self.consume_optional_horizontal_whitespace();
        Ok(())
    }

    fn consume_until_newline(&mut self) {
        while !is_end_of_line(self.ch) {
            self.read_char();
        }
    }

    fn handle_line_directive(&mut self) -> Result<()> {
        self.consume_horizontal_whitespace()?;

        // The line number is always decimal, even with leading zeroes.
        if self.ch < 0 || !(self.ch as u8).is_ascii_digit() {
            return self.error(ErrorKind::ExpectedToken, "Expected line number after #line.");
        }
        let mut line: u32 = 0;
        while self.ch >= 0 && (self.ch as u8).is_ascii_digit() {
            line = line
                .wrapping_mul(10)
                .wrapping_add((self.ch as u8 - b'0') as u32);
            self.read_char();
        }

        // Off by 1 because the end of the #line directive will increment it.
        self.line = line.wrapping_sub(1);

        if is_end_of_line(self.ch) {
            return Ok(());
        }
        self.consume_horizontal_whitespace()?;
        if is_end_of_line(self.ch) {
            return Ok(());
        }

        // A filename, double-quoted with string literal syntax.
        if self.ch != i32::from(b'"') {
            return self.error(
                ErrorKind::ExpectedToken,
                "Filename in #line directive must be double-quoted.",
            );
        }
        self.consume_string_literal()?;
        let name = String::from_utf8_lossy(&self.buffer).into_owned();
        self.filename = self.interner.intern(&name);

        self.consume_optional_horizontal_whitespace();
        if !is_end_of_line(self.ch) {
            return self.error(
                ErrorKind::ExpectedToken,
                "Expected end of line after filename in #line directive.",
            );
        }
        Ok(())
    }

    fn parse_directive(&mut self) -> Result<()> {
        debug_assert_eq!(self.ch, i32::from(b'#'));
        self.read_char();
        self.consume_optional_horizontal_whitespace();

        self.buffer.clear();
        while self.ch >= 0 && (self.ch as u8).is_ascii_alphabetic() {
            self.buffer.push(self.ch as u8);
            self.read_char();
        }

        if self.buffer == b"line" {
            return self.handle_line_directive();
        }

        // #pragma is reserved; everything else is skipped to end of line.
        self.consume_until_newline();
        Ok(())
    }

    fn consume_end_of_line(&mut self) -> Result<()> {
        match self.ch {
            c if c == i32::from(b'\n') => {
                self.line = self.line.wrapping_add(1);
                self.read_char();
                Ok(())
            }
            c if c == i32::from(b'\r') => {
                self.line = self.line.wrapping_add(1);
                if self.read_char() == i32::from(b'\n') {
                    self.read_char();
                }
                Ok(())
            }
            -1 => Ok(()),
            _ => self.error(ErrorKind::UnexpectedChar, "Expected end of line."),
        }
    }

    /// Consumes whitespace, returning true if a newline was found.
    fn consume_whitespace(&mut self) -> Result<bool> {
        let mut found_newline = false;
        loop {
            match self.ch {
                c if c == i32::from(b'\n') || c == i32::from(b'\r') => {
                    found_newline = true;
                    self.consume_end_of_line()?;
                }
                c if c == i32::from(b' ')
                    || c == i32::from(b'\t')
                    || c == i32::from(0x0b)
                    || c == i32::from(0x0c) =>
                {
                    self.read_char();
                }
                _ => return Ok(found_newline),
            }
        }
    }

    fn consume_whitespace_and_directives(&mut self) -> Result<()> {
        loop {
            let found_newline = self.consume_whitespace()?;
            if self.ch != i32::from(b'#') {
                return Ok(());
            }
            if !found_newline {
                return self.error(
                    ErrorKind::DirectiveMidLine,
                    "A `#` preprocessor directive can only appear at the start of a line.",
                );
            }
            self.parse_directive()?;
        }
    }

    fn make_token(&mut self, kind: TokenKind, line: u32) -> TokenRef {
        let value = String::from_utf8_lossy(&self.buffer).into_owned();
        let value = self.interner.intern(&value);
        Token::new(kind, value, self.filename.clone(), line)
    }

    /// Advances to the next token.
    pub fn consume(&mut self) -> Result<()> {
        if let Some(queued) = self.queued.take() {
            self.token = queued;
            return Ok(());
        }

        self.consume_whitespace_and_directives()?;

        // The token's line is where it starts.
        let line = self.line;

        if self.ch == -1 {
            self.buffer.clear();
            self.token = self.make_token(TokenKind::End, line);
            return Ok(());
        }

        self.buffer.clear();
        let c = self.ch;

        // Keyword, identifier or type name
        if is_ident_char(c, true) {
            while is_ident_char(self.ch, false) {
                self.buffer.push(self.ch as u8);
                self.read_char();
            }
            if self.ch == i32::from(b'"') || self.ch == i32::from(b'\'') {
                return self.error(
                    ErrorKind::UnsupportedEscape,
                    "String and character literal prefixes are not supported.",
                );
            }
            self.token = self.make_token(TokenKind::Alphanumeric, line);
            return Ok(());
        }

        // String literal
        if c == i32::from(b'"') {
            self.consume_string_literal()?;
            self.token = self.make_token(TokenKind::String, line);
            return Ok(());
        }

        // Character literal
        if c == i32::from(b'\'') {
            self.consume_char_literal()?;
            self.token = self.make_token(TokenKind::Character, line);
            return Ok(());
        }

        // Number. All alphanumeric characters, dots and digit separators
        // are globbed; classification happens at parse time.
        if (c as u8).is_ascii_digit() {
            loop {
                let cur = self.ch;
                let continues = cur >= 0
                    && ((cur as u8).is_ascii_alphanumeric()
                        || cur as u8 == b'.'
                        || cur as u8 == b'\'');
                if !continues {
                    break;
                }
                self.buffer.push(cur as u8);
                self.read_char();
            }
            self.token = self.make_token(TokenKind::Number, line);
            return Ok(());
        }

        // Punctuation, greedy longest match
        if PUNCTUATION_CHARS.contains(c as u8 as char) {
            let c0 = c as u8;
            self.buffer.push(c0);
            let c1 = self.read_char();

            let is_assign = c1 == i32::from(b'=') && "+-*/%&|^!<>=".contains(c0 as char);
            let is_double = c1 == i32::from(c0) && "+-&|<>".contains(c0 as char);
            let is_pointer = c0 == b'-' && c1 == i32::from(b'>');
            let is_variadic = c0 == b'.' && c1 == i32::from(b'.');
            if is_assign || is_double || is_pointer || is_variadic {
                self.buffer.push(c1 as u8);
                let c2 = self.read_char();

                // Three-character operators: <<= >>= ...
                let shift_assign = c2 == i32::from(b'=')
                    && (c1 == i32::from(b'<') || c1 == i32::from(b'>'))
                    && c0 == c1 as u8;
                let ellipsis = c2 == i32::from(b'.') && c0 == b'.';
                if shift_assign || ellipsis {
                    self.buffer.push(c2 as u8);
                    self.read_char();
                }

                if self.buffer.len() == 2 && c0 == b'.' {
                    return self.error(ErrorKind::UnexpectedChar, "`..` is not a valid token.");
                }
            }

            self.token = self.make_token(TokenKind::Punctuation, line);
            return Ok(());
        }

        self.error(
            ErrorKind::UnexpectedChar,
            format!("Unexpected character: {}", c as u8 as char),
        )
    }

    /// Returns the current token and advances past it.
    pub fn take(&mut self) -> Result<TokenRef> {
        let token = self.token.clone();
        self.consume()?;
        Ok(token)
    }

    /// Pushes a token back. At most one token can be queued.
    pub fn push(&mut self, token: TokenRef) {
        debug_assert!(self.queued.is_none(), "at most one token can be queued");
        self.queued = Some(std::mem::replace(&mut self.token, token));
    }

    /// True if the current token is the given alphanumeric or punctuation.
    pub fn is(&self, text: &str) -> bool {
        self.token.is(text)
    }

    /// Consumes the current token if it matches, returning whether it did.
    pub fn accept(&mut self, text: &str) -> Result<bool> {
        if !self.is(text) {
            return Ok(false);
        }
        self.consume()?;
        Ok(true)
    }

    /// Consumes the current token, failing if it does not match.
    pub fn expect(&mut self, text: &str, message: &str) -> Result<()> {
        if !self.is(text) {
            return Err(CompileError::at(
                ErrorKind::ExpectedToken,
                &self.token,
                format!("{} (got `{}`)", message, self.token.value),
            ));
        }
        self.consume()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex_kinds(source: &str) -> Vec<(TokenKind, String)> {
        let mut lexer = Lexer::new(source.as_bytes().to_vec(), "test.i").unwrap();
        let mut out = Vec::new();
        while lexer.token.kind != TokenKind::End {
            out.push((lexer.token.kind, lexer.token.value.to_string()));
            lexer.consume().unwrap();
        }
        out
    }

    #[test]
    fn test_identifiers_and_numbers() {
        let tokens = lex_kinds("int x$2 = 0x1F;");
        assert_eq!(
            tokens,
            vec![
                (TokenKind::Alphanumeric, "int".to_string()),
                (TokenKind::Alphanumeric, "x$2".to_string()),
                (TokenKind::Punctuation, "=".to_string()),
                (TokenKind::Number, "0x1F".to_string()),
                (TokenKind::Punctuation, ";".to_string()),
            ]
        );
    }

    #[test]
    fn test_greedy_punctuation() {
        let tokens = lex_kinds("a <<= b >>= c ... d -> e ++ -- && ||");
        let punct: Vec<String> = tokens
            .into_iter()
            .filter(|(k, _)| *k == TokenKind::Punctuation)
            .map(|(_, v)| v)
            .collect();
        assert_eq!(punct, vec!["<<=", ">>=", "...", "->", "++", "--", "&&", "||"]);
    }

    #[test]
    fn test_double_dot_is_invalid() {
        let mut lexer = Lexer::new(b"a .. b".to_vec(), "test.i").unwrap();
        let err = loop {
            match lexer.consume() {
                Ok(()) => continue,
                Err(e) => break e,
            }
        };
        assert_eq!(err.kind, ErrorKind::UnexpectedChar);
    }

    #[test]
    fn test_string_escapes() {
        let tokens = lex_kinds(r#""a\tb\n\e\0""#);
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].1.as_bytes(), b"a\tb\n\x1b\0");
    }

    #[test]
    fn test_hex_escape_unsupported() {
        let err = Lexer::new(br#""\x41""#.to_vec(), "test.i").unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnsupportedEscape);
    }

    #[test]
    fn test_char_literal() {
        let tokens = lex_kinds("'a'");
        assert_eq!(tokens, vec![(TokenKind::Character, "a".to_string())]);
    }

    #[test]
    fn test_empty_char_fails() {
        let err = Lexer::new(b"''".to_vec(), "test.i").unwrap_err();
        assert_eq!(err.kind, ErrorKind::EmptyChar);
    }

    #[test]
    fn test_unclosed_string_fails() {
        let err = Lexer::new(b"\"abc".to_vec(), "test.i").unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnclosedString);
    }

    #[test]
    fn test_line_directive() {
        let source = b"#line 42 \"other.c\"\nx".to_vec();
        let lexer = Lexer::new(source, "test.i").unwrap();
        assert_eq!(&*lexer.token.value, "x");
        assert_eq!(&*lexer.token.filename, "other.c");
        assert_eq!(lexer.token.line, 42);
    }

    #[test]
    fn test_pragma_ignored() {
        let tokens = lex_kinds("#pragma once\nint");
        assert_eq!(tokens, vec![(TokenKind::Alphanumeric, "int".to_string())]);
    }

    #[test]
    fn test_directive_mid_line_fails() {
        let err = Lexer::new(b"int x; #line 3\n".to_vec(), "test.i")
            .and_then(|mut l| {
                while l.token.kind != TokenKind::End {
                    l.consume()?;
                }
                Ok(())
            })
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::DirectiveMidLine);
    }

    #[test]
    fn test_crlf_counts_one_line() {
        let source = b"a\r\nb\rc\nd".to_vec();
        let mut lexer = Lexer::new(source, "test.i").unwrap();
        let mut lines = Vec::new();
        while lexer.token.kind != TokenKind::End {
            lines.push(lexer.token.line);
            lexer.consume().unwrap();
        }
        assert_eq!(lines, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_push_back() {
        let mut lexer = Lexer::new(b"a b c".to_vec(), "test.i").unwrap();
        let a = lexer.take().unwrap();
        assert!(lexer.is("b"));
        lexer.push(a);
        assert!(lexer.is("a"));
        lexer.consume().unwrap();
        assert!(lexer.is("b"));
    }

    #[test]
    fn test_digit_separator_globbed() {
        let tokens = lex_kinds("1'000'000 + 2");
        assert_eq!(tokens[0], (TokenKind::Number, "1'000'000".to_string()));
    }
}
