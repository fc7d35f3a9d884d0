//! The flow language front end: tokens, lexer, AST, parser and diagnostics.
//!
//! ```text
//! flow "etl" {
//!   config { retries: 2, timeout: "30s" }
//!   node "extract" {
//!     type: set
//!     config { value: "rows.csv" }
//!   }
//!   node "load" {
//!     type: debug
//!     inputs { input: any from "extract.value" }
//!   }
//! }
//! ```

pub mod ast;
pub mod diagnostics;
pub mod lexer;
pub mod parser;
pub mod token;

pub use ast::{NodeId, Program};
pub use diagnostics::{Diagnostic, DiagnosticCode, Diagnostics, Position, Severity};
pub use lexer::{tokenize, Lexer};
pub use parser::{parse, Parser};
pub use token::{Token, TokenKind};
