//! Lexer for flow source text.
//!
//! The lexer is a lazy iterator. It never fails: characters it cannot make
//! sense of become `Illegal` tokens and scanning continues after them. The
//! stream always ends with exactly one `Eof` token.

use std::iter::Peekable;
use std::str::CharIndices;

use super::token::{Token, TokenKind};

pub struct Lexer<'a> {
    source: &'a str,
    chars: Peekable<CharIndices<'a>>,
    line: usize,
    column: usize,
    finished: bool,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        Self {
            source,
            chars: source.char_indices().peekable(),
            line: 1,
            column: 1,
            finished: false,
        }
    }

    /// Restart scanning from the beginning of the source.
    pub fn reset(&mut self) {
        self.chars = self.source.char_indices().peekable();
        self.line = 1;
        self.column = 1;
        self.finished = false;
    }

    pub fn source(&self) -> &'a str {
        self.source
    }

    /// Scan the next token. Returns `Eof` repeatedly once input is exhausted.
    pub fn next_token(&mut self) -> Token {
        self.skip_trivia();

        let (line, column) = (self.line, self.column);
        let Some((start, ch)) = self.bump() else {
            return Token::new(TokenKind::Eof, "", line, column);
        };

        let punct = match ch {
            '{' => Some(TokenKind::LBrace),
            '}' => Some(TokenKind::RBrace),
            '[' => Some(TokenKind::LBracket),
            ']' => Some(TokenKind::RBracket),
            ':' => Some(TokenKind::Colon),
            ',' => Some(TokenKind::Comma),
            _ => None,
        };
        if let Some(kind) = punct {
            return Token::new(kind, ch.to_string(), line, column);
        }

        match ch {
            '"' => self.read_string(line, column),
            '-' if self.peek_char().is_some_and(|c| c.is_ascii_digit()) => {
                self.read_number(start, line, column)
            }
            c if c.is_ascii_digit() => self.read_number(start, line, column),
            c if c.is_alphabetic() || c == '_' => self.read_ident(start, line, column),
            other => Token::new(TokenKind::Illegal, other.to_string(), line, column),
        }
    }

    fn bump(&mut self) -> Option<(usize, char)> {
        let (idx, ch) = self.chars.next()?;
        if ch == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some((idx, ch))
    }

    fn peek_char(&mut self) -> Option<char> {
        self.chars.peek().map(|&(_, c)| c)
    }

    fn peek_second(&self) -> Option<char> {
        let mut ahead = self.chars.clone();
        ahead.next();
        ahead.next().map(|(_, c)| c)
    }

    fn offset(&mut self) -> usize {
        self.chars
            .peek()
            .map(|&(idx, _)| idx)
            .unwrap_or(self.source.len())
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.peek_char() {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('#') => self.skip_line(),
                Some('/') if self.peek_second() == Some('/') => self.skip_line(),
                _ => return,
            }
        }
    }

    fn skip_line(&mut self) {
        while let Some(c) = self.peek_char() {
            if c == '\n' {
                break;
            }
            self.bump();
        }
    }

    fn read_ident(&mut self, start: usize, line: usize, column: usize) -> Token {
        while let Some(c) = self.peek_char() {
            if c.is_alphanumeric() || matches!(c, '_' | '-' | '.') {
                self.bump();
            } else {
                break;
            }
        }
        let end = self.offset();
        let text = &self.source[start..end];
        let kind = TokenKind::keyword(text).unwrap_or(TokenKind::Ident);
        Token::new(kind, text, line, column)
    }

    fn read_number(&mut self, start: usize, line: usize, column: usize) -> Token {
        self.eat_digits();
        if self.peek_char() == Some('.') && self.peek_second().is_some_and(|c| c.is_ascii_digit())
        {
            self.bump();
            self.eat_digits();
        }
        let end = self.offset();
        Token::new(TokenKind::Number, &self.source[start..end], line, column)
    }

    fn eat_digits(&mut self) {
        while self.peek_char().is_some_and(|c| c.is_ascii_digit()) {
            self.bump();
        }
    }

    /// Reads a string body after the opening quote. Unterminated strings stop
    /// at the end of the line so the rest of the file still lexes normally.
    fn read_string(&mut self, line: usize, column: usize) -> Token {
        let mut value = String::new();
        let mut raw = String::from("\"");
        let mut bad_escape = false;

        loop {
            match self.peek_char() {
                None | Some('\n') => {
                    return Token::new(TokenKind::Illegal, raw, line, column);
                }
                Some('"') => {
                    self.bump();
                    raw.push('"');
                    break;
                }
                Some('\\') => {
                    self.bump();
                    raw.push('\\');
                    match self.peek_char() {
                        None | Some('\n') => {
                            return Token::new(TokenKind::Illegal, raw, line, column);
                        }
                        Some(esc) => {
                            self.bump();
                            raw.push(esc);
                            match esc {
                                '"' => value.push('"'),
                                '\\' => value.push('\\'),
                                'n' => value.push('\n'),
                                't' => value.push('\t'),
                                'r' => value.push('\r'),
                                _ => bad_escape = true,
                            }
                        }
                    }
                }
                Some(c) => {
                    self.bump();
                    raw.push(c);
                    value.push(c);
                }
            }
        }

        if bad_escape {
            Token::new(TokenKind::Illegal, raw, line, column)
        } else {
            Token::new(TokenKind::String, value, line, column)
        }
    }
}

impl Iterator for Lexer<'_> {
    type Item = Token;

    fn next(&mut self) -> Option<Token> {
        if self.finished {
            return None;
        }
        let token = self.next_token();
        if token.is(TokenKind::Eof) {
            self.finished = true;
        }
        Some(token)
    }
}

/// Tokenize a whole source string, including the trailing `Eof`.
pub fn tokenize(source: &str) -> Vec<Token> {
    Lexer::new(source).collect()
}
