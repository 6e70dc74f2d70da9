//! The sandboxed script language: lexer, AST and parser.
//!
//! A small JS-like language, shared by the validator (parse-only pass) and
//! the reference interpreter. Parsing never evaluates anything.

pub mod ast;
pub mod lexer;
pub mod parser;

pub use ast::{AstMetrics, Expr, Program, Stmt};
pub use parser::{ParseError, ParseWarning, Parsed};

/// Parse source text into a program plus any lint-style warnings.
pub fn parse(source: &str) -> Result<Parsed, ParseError> {
    let tokens = lexer::Lexer::new(source).tokenize()?;
    parser::Parser::new(tokens).parse_program()
}
