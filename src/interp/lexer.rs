//! Indentation-aware tokenizer for the Python-subset language.
//!
//! Produces a flat token stream with synthetic `Newline`, `Indent`, and
//! `Dedent` tokens. Newlines and indentation are suppressed inside
//! brackets, and an explicit `\` at end of line continues the logical
//! line, matching Python's lexical rules.

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Structure
    Newline,
    Indent,
    Dedent,
    EndOfFile,

    // Atoms
    Ident(String),
    Int(i64),
    Float(f64),
    Str {
        value: String,
        /// `f"..."` prefix - parsed into interpolation parts later.
        fstring: bool,
        /// `b"..."` prefix.
        bytes: bool,
    },

    // Keywords
    KwFalse,
    KwNone,
    KwTrue,
    KwAnd,
    KwAs,
    KwAssert,
    KwAsync,
    KwAwait,
    KwBreak,
    KwContinue,
    KwDef,
    KwElif,
    KwElse,
    KwExcept,
    KwFinally,
    KwFor,
    KwFrom,
    KwGlobal,
    KwIf,
    KwImport,
    KwIn,
    KwIs,
    KwLambda,
    KwNonlocal,
    KwNot,
    KwOr,
    KwPass,
    KwRaise,
    KwReturn,
    KwTry,
    KwWhile,
    KwWith,
    KwYield,

    // Punctuation and operators
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Semicolon,
    Dot,
    Arrow,
    Assign,
    Plus,
    Minus,
    Star,
    DoubleStar,
    Slash,
    DoubleSlash,
    Percent,
    At,
    Amp,
    Pipe,
    Caret,
    Tilde,
    LShift,
    RShift,
    Lt,
    Gt,
    LtE,
    GtE,
    EqEq,
    NotEq,
    PlusAssign,
    MinusAssign,
    StarAssign,
    SlashAssign,
    DoubleSlashAssign,
    PercentAssign,
    DoubleStarAssign,
    AmpAssign,
    PipeAssign,
    CaretAssign,
    LShiftAssign,
    RShiftAssign,
}

/// A token plus the 1-based source line it started on, for error messages.
#[derive(Debug, Clone)]
pub struct Spanned {
    pub token: Token,
    pub line: usize,
}

pub struct Lexer<'a> {
    source: &'a [u8],
    pos: usize,
    line: usize,
    /// Indentation stack; starts with a zero level.
    indents: Vec<usize>,
    /// Nesting depth of (), [], {} - newlines are plain whitespace inside.
    bracket_depth: usize,
    tokens: Vec<Spanned>,
    /// True at a physical line start, before indentation is measured.
    at_line_start: bool,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        Self {
            source: source.as_bytes(),
            pos: 0,
            line: 1,
            indents: vec![0],
            bracket_depth: 0,
            tokens: Vec::new(),
            at_line_start: true,
        }
    }

    /// Tokenize the whole input.
    pub fn tokenize(mut self) -> Result<Vec<Spanned>> {
        while self.pos < self.source.len() {
            if self.at_line_start && self.bracket_depth == 0 {
                self.handle_indentation()?;
                if self.pos >= self.source.len() {
                    break;
                }
            }
            self.at_line_start = false;

            let c = self.peek();
            match c {
                b' ' | b'\t' => {
                    self.pos += 1;
                }
                b'\r' => {
                    self.pos += 1;
                }
                b'\n' => {
                    self.pos += 1;
                    self.line += 1;
                    if self.bracket_depth == 0 {
                        // Collapse runs of newlines into one Newline token.
                        if !matches!(
                            self.tokens.last().map(|t| &t.token),
                            Some(Token::Newline) | Some(Token::Indent) | None
                        ) {
                            self.push(Token::Newline);
                        }
                        self.at_line_start = true;
                    }
                }
                b'#' => {
                    while self.pos < self.source.len() && self.peek() != b'\n' {
                        self.pos += 1;
                    }
                }
                b'\\' if self.peek_at(1) == Some(b'\n') => {
                    // Explicit line continuation.
                    self.pos += 2;
                    self.line += 1;
                }
                b'0'..=b'9' => self.lex_number()?,
                b'"' | b'\'' => self.lex_string(false, false)?,
                c if c.is_ascii_alphabetic() || c == b'_' => self.lex_ident_or_keyword()?,
                _ => self.lex_operator()?,
            }
        }

        // Close any open line and unwind the indent stack.
        if !matches!(
            self.tokens.last().map(|t| &t.token),
            Some(Token::Newline) | None
        ) {
            self.push(Token::Newline);
        }
        while self.indents.len() > 1 {
            self.indents.pop();
            self.push(Token::Dedent);
        }
        self.push(Token::EndOfFile);
        Ok(self.tokens)
    }

    fn peek(&self) -> u8 {
        self.source[self.pos]
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.source.get(self.pos + offset).copied()
    }

    fn push(&mut self, token: Token) {
        self.tokens.push(Spanned {
            token,
            line: self.line,
        });
    }

    /// Measure leading whitespace and emit Indent/Dedent tokens. Tabs count
    /// as 8 columns. Blank and comment-only lines are skipped entirely.
    fn handle_indentation(&mut self) -> Result<()> {
        loop {
            let mut width = 0usize;
            let mut scan = self.pos;
            while scan < self.source.len() {
                match self.source[scan] {
                    b' ' => width += 1,
                    b'\t' => width += 8 - (width % 8),
                    _ => break,
                }
                scan += 1;
            }

            match self.source.get(scan) {
                // Blank line or comment-only line: consume and retry.
                Some(b'\n') => {
                    self.pos = scan + 1;
                    self.line += 1;
                    continue;
                }
                Some(b'\r') => {
                    self.pos = scan + 1;
                    continue;
                }
                Some(b'#') => {
                    let mut end = scan;
                    while end < self.source.len() && self.source[end] != b'\n' {
                        end += 1;
                    }
                    self.pos = (end + 1).min(self.source.len());
                    if end < self.source.len() {
                        self.line += 1;
                    }
                    continue;
                }
                None => {
                    self.pos = scan;
                    return Ok(());
                }
                Some(_) => {
                    self.pos = scan;
                    let current = *self.indents.last().unwrap_or(&0);
                    if width > current {
                        self.indents.push(width);
                        self.push(Token::Indent);
                    } else if width < current {
                        while *self.indents.last().unwrap_or(&0) > width {
                            self.indents.pop();
                            self.push(Token::Dedent);
                        }
                        if *self.indents.last().unwrap_or(&0) != width {
                            return Err(Error::parse(format!(
                                "line {}: unindent does not match any outer indentation level",
                                self.line
                            )));
                        }
                    }
                    return Ok(());
                }
            }
        }
    }

    fn lex_number(&mut self) -> Result<()> {
        let start = self.pos;

        // Hex / octal / binary literals.
        if self.peek() == b'0' {
            if let Some(marker) = self.peek_at(1) {
                let radix = match marker {
                    b'x' | b'X' => Some(16),
                    b'o' | b'O' => Some(8),
                    b'b' | b'B' => Some(2),
                    _ => None,
                };
                if let Some(radix) = radix {
                    self.pos += 2;
                    let digits_start = self.pos;
                    while self.pos < self.source.len()
                        && (self.peek().is_ascii_alphanumeric() || self.peek() == b'_')
                    {
                        self.pos += 1;
                    }
                    let text: String = std::str::from_utf8(&self.source[digits_start..self.pos])
                        .unwrap_or("")
                        .replace('_', "");
                    let value = i64::from_str_radix(&text, radix).map_err(|_| {
                        Error::parse(format!("line {}: invalid numeric literal", self.line))
                    })?;
                    self.push(Token::Int(value));
                    return Ok(());
                }
            }
        }

        let mut is_float = false;
        while self.pos < self.source.len() {
            match self.peek() {
                b'0'..=b'9' | b'_' => self.pos += 1,
                b'.' if !is_float && self.peek_at(1).is_none_or(|c| c != b'.') => {
                    is_float = true;
                    self.pos += 1;
                }
                b'e' | b'E' => {
                    is_float = true;
                    self.pos += 1;
                    if matches!(self.peek_at(0), Some(b'+') | Some(b'-')) {
                        self.pos += 1;
                    }
                }
                _ => break,
            }
        }

        let text: String = std::str::from_utf8(&self.source[start..self.pos])
            .unwrap_or("")
            .replace('_', "");
        if is_float {
            let value: f64 = text
                .parse()
                .map_err(|_| Error::parse(format!("line {}: invalid float literal", self.line)))?;
            self.push(Token::Float(value));
        } else {
            let value: i64 = text
                .parse()
                .map_err(|_| Error::parse(format!("line {}: integer literal too large", self.line)))?;
            self.push(Token::Int(value));
        }
        Ok(())
    }

    fn lex_ident_or_keyword(&mut self) -> Result<()> {
        let start = self.pos;
        while self.pos < self.source.len()
            && (self.peek().is_ascii_alphanumeric() || self.peek() == b'_')
        {
            self.pos += 1;
        }
        let word = std::str::from_utf8(&self.source[start..self.pos])
            .map_err(|_| Error::parse("non-UTF8 identifier"))?
            .to_string();

        // String prefixes: r"", f"", b"", rb"", fr"" etc.
        if matches!(self.peek_at(0), Some(b'"') | Some(b'\'')) && word.len() <= 2 {
            let lower = word.to_ascii_lowercase();
            if lower.chars().all(|c| matches!(c, 'r' | 'f' | 'b')) {
                let raw = lower.contains('r');
                let fstring = lower.contains('f');
                let bytes = lower.contains('b');
                return self.lex_string_with(raw, fstring, bytes);
            }
        }

        let token = match word.as_str() {
            "False" => Token::KwFalse,
            "None" => Token::KwNone,
            "True" => Token::KwTrue,
            "and" => Token::KwAnd,
            "as" => Token::KwAs,
            "assert" => Token::KwAssert,
            "async" => Token::KwAsync,
            "await" => Token::KwAwait,
            "break" => Token::KwBreak,
            "continue" => Token::KwContinue,
            "def" => Token::KwDef,
            "elif" => Token::KwElif,
            "else" => Token::KwElse,
            "except" => Token::KwExcept,
            "finally" => Token::KwFinally,
            "for" => Token::KwFor,
            "from" => Token::KwFrom,
            "global" => Token::KwGlobal,
            "if" => Token::KwIf,
            "import" => Token::KwImport,
            "in" => Token::KwIn,
            "is" => Token::KwIs,
            "lambda" => Token::KwLambda,
            "nonlocal" => Token::KwNonlocal,
            "not" => Token::KwNot,
            "or" => Token::KwOr,
            "pass" => Token::KwPass,
            "raise" => Token::KwRaise,
            "return" => Token::KwReturn,
            "try" => Token::KwTry,
            "while" => Token::KwWhile,
            "with" => Token::KwWith,
            "yield" => Token::KwYield,
            _ => Token::Ident(word),
        };
        self.push(token);
        Ok(())
    }

    fn lex_string(&mut self, fstring: bool, bytes: bool) -> Result<()> {
        self.lex_string_with(false, fstring, bytes)
    }

    fn lex_string_with(&mut self, raw: bool, fstring: bool, bytes: bool) -> Result<()> {
        let quote = self.peek();
        let triple = self.peek_at(1) == Some(quote) && self.peek_at(2) == Some(quote);
        self.pos += if triple { 3 } else { 1 };

        let mut value = String::new();
        loop {
            if self.pos >= self.source.len() {
                return Err(Error::parse(format!(
                    "line {}: unterminated string literal",
                    self.line
                )));
            }
            let c = self.peek();
            if triple {
                if c == quote && self.peek_at(1) == Some(quote) && self.peek_at(2) == Some(quote) {
                    self.pos += 3;
                    break;
                }
            } else if c == quote {
                self.pos += 1;
                break;
            } else if c == b'\n' {
                return Err(Error::parse(format!(
                    "line {}: newline in string literal",
                    self.line
                )));
            }

            if c == b'\n' {
                self.line += 1;
                value.push('\n');
                self.pos += 1;
                continue;
            }

            if c == b'\\' && !raw {
                let escaped = self.peek_at(1).ok_or_else(|| {
                    Error::parse(format!("line {}: dangling escape", self.line))
                })?;
                self.pos += 2;
                match escaped {
                    b'n' => value.push('\n'),
                    b't' => value.push('\t'),
                    b'r' => value.push('\r'),
                    b'0' => value.push('\0'),
                    b'\\' => value.push('\\'),
                    b'\'' => value.push('\''),
                    b'"' => value.push('"'),
                    b'\n' => {
                        self.line += 1;
                    }
                    b'x' => {
                        let hex: String = (0..2)
                            .filter_map(|i| self.peek_at(i).map(|b| b as char))
                            .collect();
                        self.pos += 2;
                        let code = u8::from_str_radix(&hex, 16).map_err(|_| {
                            Error::parse(format!("line {}: invalid \\x escape", self.line))
                        })?;
                        value.push(code as char);
                    }
                    b'u' => {
                        let hex: String = (0..4)
                            .filter_map(|i| self.peek_at(i).map(|b| b as char))
                            .collect();
                        self.pos += 4;
                        let code = u32::from_str_radix(&hex, 16).map_err(|_| {
                            Error::parse(format!("line {}: invalid \\u escape", self.line))
                        })?;
                        value.push(char::from_u32(code).unwrap_or('\u{FFFD}'));
                    }
                    other => {
                        // Unknown escape: keep both characters, like Python.
                        value.push('\\');
                        value.push(other as char);
                    }
                }
                continue;
            }

            // Copy a full UTF-8 code point.
            let char_len = utf8_len(c);
            let end = (self.pos + char_len).min(self.source.len());
            value.push_str(std::str::from_utf8(&self.source[self.pos..end]).unwrap_or("\u{FFFD}"));
            self.pos = end;
        }

        self.push(Token::Str {
            value,
            fstring,
            bytes,
        });
        Ok(())
    }

    fn lex_operator(&mut self) -> Result<()> {
        macro_rules! two {
            ($second:literal, $double:expr, $single:expr) => {{
                if self.peek_at(1) == Some($second) {
                    self.pos += 2;
                    $double
                } else {
                    self.pos += 1;
                    $single
                }
            }};
        }

        let token = match self.peek() {
            b'(' => {
                self.bracket_depth += 1;
                self.pos += 1;
                Token::LParen
            }
            b')' => {
                self.bracket_depth = self.bracket_depth.saturating_sub(1);
                self.pos += 1;
                Token::RParen
            }
            b'[' => {
                self.bracket_depth += 1;
                self.pos += 1;
                Token::LBracket
            }
            b']' => {
                self.bracket_depth = self.bracket_depth.saturating_sub(1);
                self.pos += 1;
                Token::RBracket
            }
            b'{' => {
                self.bracket_depth += 1;
                self.pos += 1;
                Token::LBrace
            }
            b'}' => {
                self.bracket_depth = self.bracket_depth.saturating_sub(1);
                self.pos += 1;
                Token::RBrace
            }
            b',' => {
                self.pos += 1;
                Token::Comma
            }
            b':' => {
                self.pos += 1;
                Token::Colon
            }
            b';' => {
                self.pos += 1;
                Token::Semicolon
            }
            b'.' => {
                self.pos += 1;
                Token::Dot
            }
            b'@' => {
                self.pos += 1;
                Token::At
            }
            b'~' => {
                self.pos += 1;
                Token::Tilde
            }
            b'+' => two!(b'=', Token::PlusAssign, Token::Plus),
            b'-' => {
                if self.peek_at(1) == Some(b'>') {
                    self.pos += 2;
                    Token::Arrow
                } else {
                    two!(b'=', Token::MinusAssign, Token::Minus)
                }
            }
            b'*' => {
                if self.peek_at(1) == Some(b'*') {
                    if self.peek_at(2) == Some(b'=') {
                        self.pos += 3;
                        Token::DoubleStarAssign
                    } else {
                        self.pos += 2;
                        Token::DoubleStar
                    }
                } else {
                    two!(b'=', Token::StarAssign, Token::Star)
                }
            }
            b'/' => {
                if self.peek_at(1) == Some(b'/') {
                    if self.peek_at(2) == Some(b'=') {
                        self.pos += 3;
                        Token::DoubleSlashAssign
                    } else {
                        self.pos += 2;
                        Token::DoubleSlash
                    }
                } else {
                    two!(b'=', Token::SlashAssign, Token::Slash)
                }
            }
            b'%' => two!(b'=', Token::PercentAssign, Token::Percent),
            b'&' => two!(b'=', Token::AmpAssign, Token::Amp),
            b'|' => two!(b'=', Token::PipeAssign, Token::Pipe),
            b'^' => two!(b'=', Token::CaretAssign, Token::Caret),
            b'<' => {
                if self.peek_at(1) == Some(b'<') {
                    if self.peek_at(2) == Some(b'=') {
                        self.pos += 3;
                        Token::LShiftAssign
                    } else {
                        self.pos += 2;
                        Token::LShift
                    }
                } else {
                    two!(b'=', Token::LtE, Token::Lt)
                }
            }
            b'>' => {
                if self.peek_at(1) == Some(b'>') {
                    if self.peek_at(2) == Some(b'=') {
                        self.pos += 3;
                        Token::RShiftAssign
                    } else {
                        self.pos += 2;
                        Token::RShift
                    }
                } else {
                    two!(b'=', Token::GtE, Token::Gt)
                }
            }
            b'=' => two!(b'=', Token::EqEq, Token::Assign),
            b'!' => {
                if self.peek_at(1) == Some(b'=') {
                    self.pos += 2;
                    Token::NotEq
                } else {
                    return Err(Error::parse(format!(
                        "line {}: unexpected character '!'",
                        self.line
                    )));
                }
            }
            other => {
                return Err(Error::parse(format!(
                    "line {}: unexpected character '{}'",
                    self.line, other as char
                )));
            }
        };
        self.push(token);
        Ok(())
    }
}

fn utf8_len(first_byte: u8) -> usize {
    match first_byte {
        0x00..=0x7F => 1,
        0xC0..=0xDF => 2,
        0xE0..=0xEF => 3,
        _ => 4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<Token> {
        Lexer::new(source)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.token)
            .collect()
    }

    #[test]
    fn test_simple_expression() {
        let tokens = kinds("x = 1 + 2\n");
        assert_eq!(
            tokens,
            vec![
                Token::Ident("x".into()),
                Token::Assign,
                Token::Int(1),
                Token::Plus,
                Token::Int(2),
                Token::Newline,
                Token::EndOfFile,
            ]
        );
    }

    #[test]
    fn test_indentation_tokens() {
        let tokens = kinds("if x:\n    y = 1\nz = 2\n");
        assert!(tokens.contains(&Token::Indent));
        assert!(tokens.contains(&Token::Dedent));
    }

    #[test]
    fn test_newlines_suppressed_in_brackets() {
        let tokens = kinds("xs = [1,\n      2,\n      3]\n");
        let newline_count = tokens.iter().filter(|t| **t == Token::Newline).count();
        assert_eq!(newline_count, 1);
        assert!(!tokens.contains(&Token::Indent));
    }

    #[test]
    fn test_string_prefixes() {
        let tokens = kinds("f'{x}' b'ab' r'\\d+'\n");
        assert!(matches!(
            &tokens[0],
            Token::Str { fstring: true, .. }
        ));
        assert!(matches!(&tokens[1], Token::Str { bytes: true, .. }));
        match &tokens[2] {
            Token::Str { value, .. } => assert_eq!(value, "\\d+"),
            other => panic!("expected raw string, got {other:?}"),
        }
    }

    #[test]
    fn test_numeric_literals() {
        let tokens = kinds("0xff 1_000 2.5 1e3\n");
        assert_eq!(tokens[0], Token::Int(255));
        assert_eq!(tokens[1], Token::Int(1000));
        assert_eq!(tokens[2], Token::Float(2.5));
        assert_eq!(tokens[3], Token::Float(1000.0));
    }

    #[test]
    fn test_comment_only_lines_are_skipped() {
        let tokens = kinds("# header\nx = 1\n# trailing\n");
        assert_eq!(tokens[0], Token::Ident("x".into()));
    }

    #[test]
    fn test_bad_dedent_is_rejected() {
        let result = Lexer::new("if x:\n        a = 1\n   b = 2\n").tokenize();
        assert!(result.is_err());
    }

    #[test]
    fn test_triple_quoted_string() {
        let tokens = kinds("s = \"\"\"line one\nline two\"\"\"\n");
        match &tokens[2] {
            Token::Str { value, .. } => assert_eq!(value, "line one\nline two"),
            other => panic!("expected string, got {other:?}"),
        }
    }
}
