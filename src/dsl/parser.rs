//! Recursive-descent parser with local error recovery.
//!
//! The parser looks at one token at a time. When it meets something it did
//! not expect it records a diagnostic and resynchronises, so a single bad
//! statement costs one diagnostic instead of derailing the rest of the file.

use std::mem;

use super::ast::{
    Assignment, BindingKeyword, BlockStatement, Config, Flow, FlowNode, Identifier, ListLiteral,
    NodeId, NumberLiteral, PortBinding, PortDecl, PortDirection, Ports, PositionTable, Program,
    Statement, StringLiteral, Value,
};
use super::diagnostics::{Diagnostic, DiagnosticCode, Position};
use super::lexer::Lexer;
use super::token::{Token, TokenKind};

/// Deepest nesting of blocks and lists the parser descends into.
pub const MAX_NESTING: usize = 64;

pub struct Parser<'a> {
    lexer: Lexer<'a>,
    current: Token,
    prev_line: usize,
    consumed: usize,
    depth: usize,
    positions: PositionTable,
    diagnostics: Vec<Diagnostic>,
}

impl<'a> Parser<'a> {
    pub fn new(lexer: Lexer<'a>) -> Self {
        let mut parser = Self {
            lexer,
            current: Token::new(TokenKind::Eof, "", 1, 1),
            prev_line: 0,
            consumed: 0,
            depth: 0,
            positions: PositionTable::new(),
            diagnostics: Vec::new(),
        };
        parser.current = parser.scan();
        parser
    }

    /// Diagnostics recorded so far.
    pub fn errors(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn into_diagnostics(self) -> Vec<Diagnostic> {
        self.diagnostics
    }

    pub fn parse_program(&mut self) -> Program {
        let mut flows = Vec::new();

        while !self.current.is(TokenKind::Eof) {
            if self.current.is(TokenKind::Flow) {
                if let Some(flow) = self.parse_flow() {
                    flows.push(flow);
                }
            } else {
                self.unexpected("'flow'");
                self.skip_to_next_flow();
            }
        }

        Program {
            flows,
            positions: mem::take(&mut self.positions),
        }
    }

    // ========================================================================
    // Token handling
    // ========================================================================

    /// Next significant token from the lexer. Illegal tokens are reported
    /// here and never reach the grammar rules.
    fn scan(&mut self) -> Token {
        loop {
            let token = self.lexer.next_token();
            if !token.is(TokenKind::Illegal) {
                return token;
            }
            let message = if token.literal.starts_with('"') {
                if token.literal.len() > 1 && token.literal.ends_with('"') {
                    "invalid escape sequence in string literal".to_string()
                } else {
                    "unterminated string literal".to_string()
                }
            } else {
                format!("illegal character '{}'", token.literal)
            };
            self.diagnostics.push(
                Diagnostic::error(DiagnosticCode::IllegalToken, message)
                    .at(Some(Position::new(token.line, token.column))),
            );
        }
    }

    fn advance(&mut self) {
        if self.current.is(TokenKind::Eof) {
            return;
        }
        self.prev_line = self.current.line;
        self.current = self.scan();
        self.consumed += 1;
    }

    fn position(&self) -> Position {
        Position::new(self.current.line, self.current.column)
    }

    fn alloc(&mut self) -> NodeId {
        let position = self.position();
        self.positions.alloc(position)
    }

    fn error(&mut self, code: DiagnosticCode, message: String) {
        let position = self.position();
        self.diagnostics
            .push(Diagnostic::error(code, message).at(Some(position)));
    }

    fn unexpected(&mut self, expected: &str) {
        let message = format!("expected {}, found {}", expected, self.current);
        self.error(DiagnosticCode::UnexpectedToken, message);
    }

    fn expect(&mut self, kind: TokenKind, context: &str) -> Option<()> {
        if self.current.is(kind) {
            self.advance();
            Some(())
        } else {
            self.unexpected(&format!("{} {}", kind, context));
            None
        }
    }

    /// Consume the `}` closing a block. A missing brace is reported but the
    /// block is still kept.
    fn expect_close(&mut self, what: &str) {
        if self.current.is(TokenKind::RBrace) {
            self.advance();
        } else {
            self.unexpected(&format!("'}}' to close {}", what));
        }
    }

    /// Skip tokens until a point where a statement can start again: a `}` at
    /// the current depth, a statement keyword, an identifier opening a new
    /// line, or the end of input. Nested braces are skipped whole, but a
    /// `flow` keyword always stops the skip.
    fn synchronize(&mut self) {
        let error_line = self.current.line;
        let mut depth = 0usize;

        loop {
            let kind = self.current.kind;
            if kind == TokenKind::Eof || kind == TokenKind::Flow {
                return;
            }
            if depth == 0 {
                if kind == TokenKind::RBrace || kind.starts_statement()
                {
                    return;
                }
                let opens_line = self.current.line > self.prev_line;
                if matches!(kind, TokenKind::Ident | TokenKind::Type)
                    && opens_line
                    && self.current.line > error_line
                {
                    return;
                }
            }
            match kind {
                TokenKind::LBrace => depth += 1,
                TokenKind::RBrace => depth -= 1,
                _ => {}
            }
            self.advance();
        }
    }

    /// Run a rule that opens a nested block or list. Past [`MAX_NESTING`]
    /// levels the rule is not entered and the caller resynchronises.
    fn nested<T>(&mut self, rule: impl FnOnce(&mut Self) -> Option<T>) -> Option<T> {
        if self.depth >= MAX_NESTING {
            self.error(
                DiagnosticCode::InvalidValue,
                format!("nesting deeper than {} levels", MAX_NESTING),
            );
            return None;
        }
        self.depth += 1;
        let parsed = rule(self);
        self.depth -= 1;
        parsed
    }

    fn skip_to_next_flow(&mut self) {
        while !matches!(self.current.kind, TokenKind::Flow | TokenKind::Eof) {
            self.advance();
        }
    }

    // ========================================================================
    // Grammar rules
    // ========================================================================

    fn parse_flow(&mut self) -> Option<Flow> {
        let id = self.alloc();
        self.advance();

        let header = self
            .parse_string("flow name")
            .and_then(|name| self.expect(TokenKind::LBrace, "after flow name").map(|_| name));
        let Some(name) = header else {
            self.skip_to_next_flow();
            return None;
        };

        let body = self.parse_block();
        self.expect_close("flow");
        Some(Flow { id, name, body })
    }

    fn parse_block(&mut self) -> BlockStatement {
        let id = self.alloc();
        let mut statements = Vec::new();

        loop {
            let before = self.consumed;
            let parsed = match self.current.kind {
                TokenKind::RBrace | TokenKind::Eof | TokenKind::Flow => break,
                TokenKind::Config => self.nested(Self::parse_config).map(Statement::Config),
                TokenKind::Node => self.nested(Self::parse_node).map(Statement::Node),
                TokenKind::Inputs | TokenKind::Outputs => self.parse_ports().map(Statement::Ports),
                TokenKind::Ident | TokenKind::Type => {
                    self.parse_assignment().map(Statement::Assignment)
                }
                _ => {
                    self.unexpected("a statement");
                    None
                }
            };

            match parsed {
                Some(statement) => statements.push(statement),
                None => {
                    self.synchronize();
                    if self.consumed == before {
                        self.advance();
                    }
                }
            }
        }

        BlockStatement { id, statements }
    }

    fn parse_config(&mut self) -> Option<Config> {
        let id = self.alloc();
        self.advance();
        self.expect(TokenKind::LBrace, "after 'config'")?;
        let body = self.parse_block();
        self.expect_close("config block");
        Some(Config { id, body })
    }

    fn parse_node(&mut self) -> Option<FlowNode> {
        let id = self.alloc();
        self.advance();
        let name = self.parse_string("node name")?;
        self.expect(TokenKind::LBrace, "after node name")?;
        let body = self.parse_block();
        self.expect_close("node block");
        Some(FlowNode { id, name, body })
    }

    fn parse_ports(&mut self) -> Option<Ports> {
        let direction = if self.current.is(TokenKind::Inputs) {
            PortDirection::Inputs
        } else {
            PortDirection::Outputs
        };
        let id = self.alloc();
        self.advance();
        self.expect(TokenKind::LBrace, &format!("after '{}'", direction.keyword()))?;

        let mut ports = Vec::new();
        loop {
            let kind = self.current.kind;
            if kind == TokenKind::RBrace {
                self.advance();
                break;
            }
            if kind == TokenKind::Eof || kind == TokenKind::Flow || kind.starts_statement() {
                self.unexpected(&format!("'}}' to close {} block", direction.keyword()));
                break;
            }

            let before = self.consumed;
            let decl = if kind == TokenKind::Ident {
                self.parse_port_decl()
            } else {
                self.unexpected("port declaration");
                None
            };
            match decl {
                Some(decl) => ports.push(decl),
                None => {
                    self.synchronize();
                    if self.consumed == before {
                        self.advance();
                    }
                }
            }
        }

        Some(Ports {
            id,
            direction,
            ports,
        })
    }

    fn parse_port_decl(&mut self) -> Option<PortDecl> {
        let id = self.alloc();
        let name = self.parse_identifier("port name")?;
        self.expect(TokenKind::Colon, "after port name")?;
        let value_type = self.parse_identifier("port type")?;

        let keyword = match self.current.kind {
            TokenKind::From => Some(BindingKeyword::From),
            TokenKind::To => Some(BindingKeyword::To),
            _ => None,
        };
        let binding = match keyword {
            Some(keyword) => {
                self.advance();
                let target = self.parse_string("binding target")?;
                Some(PortBinding { keyword, target })
            }
            None => None,
        };

        if self.current.is(TokenKind::Comma) {
            self.advance();
        }

        Some(PortDecl {
            id,
            name,
            value_type,
            binding,
        })
    }

    fn parse_assignment(&mut self) -> Option<Assignment> {
        let id = self.alloc();
        let key = Identifier {
            id: self.alloc(),
            name: self.current.literal.clone(),
        };
        self.advance();
        self.expect(TokenKind::Colon, &format!("after '{}'", key.name))?;
        let value = self.parse_value()?;
        if self.current.is(TokenKind::Comma) {
            self.advance();
        }
        Some(Assignment { id, key, value })
    }

    fn parse_value(&mut self) -> Option<Value> {
        match self.current.kind {
            TokenKind::String => self.parse_string("value").map(Value::String),
            TokenKind::Number => self.parse_number().map(Value::Number),
            TokenKind::Ident => self.parse_identifier("value").map(Value::Identifier),
            TokenKind::LBracket => self.nested(Self::parse_list).map(Value::List),
            _ => {
                self.unexpected("a value");
                None
            }
        }
    }

    fn parse_list(&mut self) -> Option<ListLiteral> {
        let id = self.alloc();
        self.advance();

        let mut items = Vec::new();
        loop {
            if self.current.is(TokenKind::RBracket) {
                self.advance();
                break;
            }
            items.push(self.parse_value()?);
            match self.current.kind {
                TokenKind::Comma => self.advance(),
                TokenKind::RBracket => {
                    self.advance();
                    break;
                }
                _ => {
                    self.unexpected("',' or ']'");
                    return None;
                }
            }
        }

        Some(ListLiteral { id, items })
    }

    fn parse_number(&mut self) -> Option<NumberLiteral> {
        let literal = self.current.literal.clone();
        let Ok(value) = literal.parse::<f64>() else {
            self.error(
                DiagnosticCode::InvalidValue,
                format!("invalid number literal '{}'", literal),
            );
            return None;
        };
        let id = self.alloc();
        self.advance();
        Some(NumberLiteral { id, literal, value })
    }

    fn parse_string(&mut self, what: &str) -> Option<StringLiteral> {
        if !self.current.is(TokenKind::String) {
            self.unexpected(&format!("{} string", what));
            return None;
        }
        let literal = StringLiteral {
            id: self.alloc(),
            value: self.current.literal.clone(),
        };
        self.advance();
        Some(literal)
    }

    fn parse_identifier(&mut self, what: &str) -> Option<Identifier> {
        if !self.current.is(TokenKind::Ident) {
            self.unexpected(what);
            return None;
        }
        let ident = Identifier {
            id: self.alloc(),
            name: self.current.literal.clone(),
        };
        self.advance();
        Some(ident)
    }
}

/// Parse a source string into a program and its diagnostics.
pub fn parse(source: &str) -> (Program, Vec<Diagnostic>) {
    let mut parser = Parser::new(Lexer::new(source));
    let program = parser.parse_program();
    (program, parser.into_diagnostics())
}
