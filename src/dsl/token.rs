//! Token kinds produced by the lexer.

use std::fmt;

use serde::Serialize;

/// Kind of a lexical token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    // Keywords
    Flow,
    Config,
    Node,
    Inputs,
    Outputs,
    Type,
    From,
    To,

    // Literals
    Ident,
    String,
    Number,

    // Punctuation
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Colon,
    Comma,

    Illegal,
    Eof,
}

impl TokenKind {
    /// Map an identifier spelling to its keyword kind, if it is one.
    pub fn keyword(ident: &str) -> Option<TokenKind> {
        let kind = match ident {
            "flow" => TokenKind::Flow,
            "config" => TokenKind::Config,
            "node" => TokenKind::Node,
            "inputs" => TokenKind::Inputs,
            "outputs" => TokenKind::Outputs,
            "type" => TokenKind::Type,
            "from" => TokenKind::From,
            "to" => TokenKind::To,
            _ => return None,
        };
        Some(kind)
    }

    /// Keywords that open a statement inside a block.
    pub fn starts_statement(&self) -> bool {
        matches!(
            self,
            TokenKind::Config | TokenKind::Node | TokenKind::Inputs | TokenKind::Outputs
        )
    }

    /// Human-readable description used in diagnostics.
    pub fn describe(&self) -> &'static str {
        match self {
            TokenKind::Flow => "'flow'",
            TokenKind::Config => "'config'",
            TokenKind::Node => "'node'",
            TokenKind::Inputs => "'inputs'",
            TokenKind::Outputs => "'outputs'",
            TokenKind::Type => "'type'",
            TokenKind::From => "'from'",
            TokenKind::To => "'to'",
            TokenKind::Ident => "identifier",
            TokenKind::String => "string",
            TokenKind::Number => "number",
            TokenKind::LBrace => "'{'",
            TokenKind::RBrace => "'}'",
            TokenKind::LBracket => "'['",
            TokenKind::RBracket => "']'",
            TokenKind::Colon => "':'",
            TokenKind::Comma => "','",
            TokenKind::Illegal => "illegal token",
            TokenKind::Eof => "end of input",
        }
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// A lexical token with its 1-based source position.
///
/// For string tokens `literal` holds the unescaped contents; for illegal
/// tokens it holds the offending text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Token {
    pub kind: TokenKind,
    pub literal: String,
    pub line: usize,
    pub column: usize,
}

impl Token {
    pub fn new(kind: TokenKind, literal: impl Into<String>, line: usize, column: usize) -> Self {
        Self {
            kind,
            literal: literal.into(),
            line,
            column,
        }
    }

    pub fn is(&self, kind: TokenKind) -> bool {
        self.kind == kind
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TokenKind::Eof => f.write_str("end of input"),
            TokenKind::String => write!(f, "string \"{}\"", self.literal),
            TokenKind::Ident | TokenKind::Number | TokenKind::Illegal => {
                write!(f, "{} '{}'", self.kind.describe(), self.literal)
            }
            _ => f.write_str(self.kind.describe()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyword_lookup() {
        assert_eq!(TokenKind::keyword("flow"), Some(TokenKind::Flow));
        assert_eq!(TokenKind::keyword("type"), Some(TokenKind::Type));
        assert_eq!(TokenKind::keyword("Flow"), None);
        assert_eq!(TokenKind::keyword("retries"), None);
    }

    #[test]
    fn test_token_display() {
        assert_eq!(Token::new(TokenKind::Ident, "rows", 1, 1).to_string(), "identifier 'rows'");
        assert_eq!(Token::new(TokenKind::LBrace, "{", 1, 1).to_string(), "'{'");
        assert_eq!(Token::new(TokenKind::Eof, "", 3, 1).to_string(), "end of input");
    }
}
