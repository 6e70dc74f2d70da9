//! Recursive-descent parser producing the [`Program`] tree plus
//! lint-style warnings. Statement separators are optional, so expression
//! snippets like `1 + 1` parse without ceremony.

use super::ast::{
    AssignOp, BinaryOp, DeclKind, Expr, LogicalOp, Program, Stmt, UnaryOp, UpdateOp,
};
use super::lexer::{Tok, Token};

#[derive(Debug, Clone)]
pub struct ParseError {
    pub line: u32,
    pub column: u32,
    pub message: String,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} at {}:{}", self.message, self.line, self.column)
    }
}

impl std::error::Error for ParseError {}

/// A non-fatal finding from the parse pass.
#[derive(Debug, Clone)]
pub struct ParseWarning {
    pub line: u32,
    pub column: u32,
    pub message: String,
}

#[derive(Debug)]
pub struct Parsed {
    pub program: Program,
    pub warnings: Vec<ParseWarning>,
}

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    warnings: Vec<ParseWarning>,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            warnings: Vec::new(),
        }
    }

    pub fn parse_program(mut self) -> Result<Parsed, ParseError> {
        let mut body = Vec::new();
        while !self.at(&Tok::Eof) {
            body.push(self.parse_stmt()?);
        }
        Ok(Parsed {
            program: Program { body },
            warnings: self.warnings,
        })
    }

    fn current(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn at(&self, tok: &Tok) -> bool {
        &self.current().tok == tok
    }

    fn bump(&mut self) -> Token {
        let token = self.current().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.at(tok) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: Tok, what: &str) -> Result<Token, ParseError> {
        if self.at(&tok) {
            Ok(self.bump())
        } else {
            Err(self.error_here(format!(
                "expected {}, found {}",
                what,
                describe(&self.current().tok)
            )))
        }
    }

    fn error_here(&self, message: String) -> ParseError {
        let token = self.current();
        ParseError {
            line: token.line,
            column: token.column,
            message,
        }
    }

    fn warn_here(&mut self, message: impl Into<String>) {
        let token = self.current().clone();
        self.warnings.push(ParseWarning {
            line: token.line,
            column: token.column,
            message: message.into(),
        });
    }

    fn parse_stmt(&mut self) -> Result<Stmt, ParseError> {
        match self.current().tok.clone() {
            Tok::Let => self.parse_var_decl(DeclKind::Let, true),
            Tok::Const => self.parse_var_decl(DeclKind::Const, true),
            Tok::Var => {
                self.warn_here("prefer `let` or `const` over `var`");
                self.parse_var_decl(DeclKind::Var, true)
            }
            Tok::Function => self.parse_func_decl(),
            Tok::Return => {
                self.bump();
                let value = if self.at(&Tok::Semi) || self.at(&Tok::RBrace) || self.at(&Tok::Eof) {
                    None
                } else {
                    Some(self.parse_expr()?)
                };
                self.eat(&Tok::Semi);
                Ok(Stmt::Return(value))
            }
            Tok::If => self.parse_if(),
            Tok::While => {
                self.bump();
                self.expect(Tok::LParen, "`(`")?;
                let cond = self.parse_condition()?;
                self.expect(Tok::RParen, "`)`")?;
                let body = self.parse_body()?;
                Ok(Stmt::While { cond, body })
            }
            Tok::For => self.parse_for(),
            Tok::Break => {
                self.bump();
                self.eat(&Tok::Semi);
                Ok(Stmt::Break)
            }
            Tok::Continue => {
                self.bump();
                self.eat(&Tok::Semi);
                Ok(Stmt::Continue)
            }
            Tok::LBrace => {
                self.bump();
                let mut body = Vec::new();
                while !self.eat(&Tok::RBrace) {
                    if self.at(&Tok::Eof) {
                        return Err(self.error_here("expected `}`".to_string()));
                    }
                    body.push(self.parse_stmt()?);
                }
                Ok(Stmt::Block(body))
            }
            Tok::Semi => {
                self.bump();
                Ok(Stmt::Block(Vec::new()))
            }
            _ => {
                let expr = self.parse_expr()?;
                self.eat(&Tok::Semi);
                Ok(Stmt::Expr(expr))
            }
        }
    }

    fn parse_var_decl(&mut self, kind: DeclKind, consume_semi: bool) -> Result<Stmt, ParseError> {
        self.bump();
        let name = self.expect_ident("variable name")?;
        let init = if self.eat(&Tok::Assign) {
            Some(self.parse_expr()?)
        } else {
            None
        };
        if consume_semi {
            self.eat(&Tok::Semi);
        }
        Ok(Stmt::VarDecl { kind, name, init })
    }

    fn parse_func_decl(&mut self) -> Result<Stmt, ParseError> {
        self.bump();
        let name = self.expect_ident("function name")?;
        let (params, body) = self.parse_func_rest()?;
        Ok(Stmt::FuncDecl { name, params, body })
    }

    fn parse_func_rest(&mut self) -> Result<(Vec<String>, Vec<Stmt>), ParseError> {
        self.expect(Tok::LParen, "`(`")?;
        let mut params = Vec::new();
        if !self.at(&Tok::RParen) {
            loop {
                params.push(self.expect_ident("parameter name")?);
                if !self.eat(&Tok::Comma) {
                    break;
                }
            }
        }
        self.expect(Tok::RParen, "`)`")?;
        self.expect(Tok::LBrace, "`{`")?;
        let mut body = Vec::new();
        while !self.eat(&Tok::RBrace) {
            if self.at(&Tok::Eof) {
                return Err(self.error_here("expected `}`".to_string()));
            }
            body.push(self.parse_stmt()?);
        }
        Ok((params, body))
    }

    fn parse_if(&mut self) -> Result<Stmt, ParseError> {
        self.bump();
        self.expect(Tok::LParen, "`(`")?;
        let cond = self.parse_condition()?;
        self.expect(Tok::RParen, "`)`")?;
        let then_branch = self.parse_body()?;
        let else_branch = if self.eat(&Tok::Else) {
            if self.at(&Tok::If) {
                Some(vec![self.parse_if()?])
            } else {
                Some(self.parse_body()?)
            }
        } else {
            None
        };
        Ok(Stmt::If {
            cond,
            then_branch,
            else_branch,
        })
    }

    fn parse_for(&mut self) -> Result<Stmt, ParseError> {
        self.bump();
        self.expect(Tok::LParen, "`(`")?;

        let init = if self.eat(&Tok::Semi) {
            None
        } else {
            let stmt = match self.current().tok {
                Tok::Let => self.parse_var_decl(DeclKind::Let, false)?,
                Tok::Const => self.parse_var_decl(DeclKind::Const, false)?,
                Tok::Var => {
                    self.warn_here("prefer `let` or `const` over `var`");
                    self.parse_var_decl(DeclKind::Var, false)?
                }
                _ => Stmt::Expr(self.parse_expr()?),
            };
            self.expect(Tok::Semi, "`;`")?;
            Some(Box::new(stmt))
        };

        let cond = if self.at(&Tok::Semi) {
            None
        } else {
            Some(self.parse_expr()?)
        };
        self.expect(Tok::Semi, "`;`")?;

        let step = if self.at(&Tok::RParen) {
            None
        } else {
            Some(self.parse_expr()?)
        };
        self.expect(Tok::RParen, "`)`")?;

        let body = self.parse_body()?;
        Ok(Stmt::For {
            init,
            cond,
            step,
            body,
        })
    }

    /// A loop or branch body: either a braced block or a single statement.
    fn parse_body(&mut self) -> Result<Vec<Stmt>, ParseError> {
        if self.eat(&Tok::LBrace) {
            let mut body = Vec::new();
            while !self.eat(&Tok::RBrace) {
                if self.at(&Tok::Eof) {
                    return Err(self.error_here("expected `}`".to_string()));
                }
                body.push(self.parse_stmt()?);
            }
            Ok(body)
        } else {
            Ok(vec![self.parse_stmt()?])
        }
    }

    /// Condition expression of `if`/`while`, with the classic
    /// assignment-instead-of-comparison lint.
    fn parse_condition(&mut self) -> Result<Expr, ParseError> {
        let start = self.pos;
        let cond = self.parse_expr()?;
        if matches!(cond, Expr::Assign { .. }) {
            let token = &self.tokens[start];
            self.warnings.push(ParseWarning {
                line: token.line,
                column: token.column,
                message: "assignment used as a condition, did you mean `==`?".to_string(),
            });
        }
        Ok(cond)
    }

    fn expect_ident(&mut self, what: &str) -> Result<String, ParseError> {
        match self.current().tok.clone() {
            Tok::Ident(name) => {
                self.bump();
                Ok(name)
            }
            other => Err(self.error_here(format!("expected {}, found {}", what, describe(&other)))),
        }
    }

    // ---- expressions ----

    fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        self.parse_assign()
    }

    fn parse_assign(&mut self) -> Result<Expr, ParseError> {
        let expr = self.parse_ternary()?;
        let op = match self.current().tok {
            Tok::Assign => Some(AssignOp::Assign),
            Tok::PlusAssign => Some(AssignOp::Add),
            Tok::MinusAssign => Some(AssignOp::Sub),
            Tok::StarAssign => Some(AssignOp::Mul),
            Tok::SlashAssign => Some(AssignOp::Div),
            _ => None,
        };
        let Some(op) = op else { return Ok(expr) };

        if !is_assign_target(&expr) {
            return Err(self.error_here("invalid assignment target".to_string()));
        }
        self.bump();
        let value = self.parse_assign()?;
        Ok(Expr::Assign {
            target: Box::new(expr),
            op,
            value: Box::new(value),
        })
    }

    fn parse_ternary(&mut self) -> Result<Expr, ParseError> {
        let cond = self.parse_or()?;
        if self.eat(&Tok::Question) {
            let then_expr = self.parse_assign()?;
            self.expect(Tok::Colon, "`:`")?;
            let else_expr = self.parse_assign()?;
            Ok(Expr::Cond {
                cond: Box::new(cond),
                then_expr: Box::new(then_expr),
                else_expr: Box::new(else_expr),
            })
        } else {
            Ok(cond)
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_and()?;
        while self.eat(&Tok::OrOr) {
            let rhs = self.parse_and()?;
            lhs = Expr::Logical {
                op: LogicalOp::Or,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_equality()?;
        while self.eat(&Tok::AndAnd) {
            let rhs = self.parse_equality()?;
            lhs = Expr::Logical {
                op: LogicalOp::And,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_equality(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_relational()?;
        loop {
            let op = match self.current().tok {
                Tok::Eq | Tok::StrictEq => BinaryOp::Eq,
                Tok::NotEq | Tok::StrictNotEq => BinaryOp::NotEq,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_relational()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_relational(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_additive()?;
        loop {
            let op = match self.current().tok {
                Tok::Lt => BinaryOp::Lt,
                Tok::LtEq => BinaryOp::LtEq,
                Tok::Gt => BinaryOp::Gt,
                Tok::GtEq => BinaryOp::GtEq,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_additive()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.current().tok {
                Tok::Plus => BinaryOp::Add,
                Tok::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_multiplicative()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.current().tok {
                Tok::Star => BinaryOp::Mul,
                Tok::Slash => BinaryOp::Div,
                Tok::Percent => BinaryOp::Rem,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        match self.current().tok {
            Tok::Minus => {
                self.bump();
                Ok(Expr::Unary {
                    op: UnaryOp::Neg,
                    expr: Box::new(self.parse_unary()?),
                })
            }
            Tok::Not => {
                self.bump();
                Ok(Expr::Unary {
                    op: UnaryOp::Not,
                    expr: Box::new(self.parse_unary()?),
                })
            }
            Tok::PlusPlus | Tok::MinusMinus => {
                let op = if self.at(&Tok::PlusPlus) {
                    UpdateOp::Incr
                } else {
                    UpdateOp::Decr
                };
                self.bump();
                let target = self.parse_unary()?;
                if !is_assign_target(&target) {
                    return Err(self.error_here("invalid increment target".to_string()));
                }
                Ok(Expr::Update {
                    target: Box::new(target),
                    op,
                    prefix: true,
                })
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.current().tok {
                Tok::Dot => {
                    self.bump();
                    let property = self.expect_ident("property name")?;
                    expr = Expr::Member {
                        object: Box::new(expr),
                        property,
                    };
                }
                Tok::LBracket => {
                    self.bump();
                    let index = self.parse_expr()?;
                    self.expect(Tok::RBracket, "`]`")?;
                    expr = Expr::Index {
                        object: Box::new(expr),
                        index: Box::new(index),
                    };
                }
                Tok::LParen => {
                    self.bump();
                    let mut args = Vec::new();
                    if !self.at(&Tok::RParen) {
                        loop {
                            args.push(self.parse_expr()?);
                            if !self.eat(&Tok::Comma) {
                                break;
                            }
                        }
                    }
                    self.expect(Tok::RParen, "`)`")?;
                    expr = Expr::Call {
                        callee: Box::new(expr),
                        args,
                    };
                }
                Tok::PlusPlus | Tok::MinusMinus => {
                    if !is_assign_target(&expr) {
                        break;
                    }
                    let op = if self.at(&Tok::PlusPlus) {
                        UpdateOp::Incr
                    } else {
                        UpdateOp::Decr
                    };
                    self.bump();
                    expr = Expr::Update {
                        target: Box::new(expr),
                        op,
                        prefix: false,
                    };
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        match self.current().tok.clone() {
            Tok::Number(n) => {
                self.bump();
                Ok(Expr::Number(n))
            }
            Tok::Str(s) => {
                self.bump();
                Ok(Expr::Str(s))
            }
            Tok::True => {
                self.bump();
                Ok(Expr::Bool(true))
            }
            Tok::False => {
                self.bump();
                Ok(Expr::Bool(false))
            }
            Tok::Null => {
                self.bump();
                Ok(Expr::Null)
            }
            Tok::Ident(name) => {
                self.bump();
                Ok(Expr::Ident(name))
            }
            Tok::Function => {
                self.bump();
                // optional name on function expressions is ignored
                if let Tok::Ident(_) = self.current().tok {
                    self.bump();
                }
                let (params, body) = self.parse_func_rest()?;
                Ok(Expr::Func { params, body })
            }
            Tok::LParen => {
                self.bump();
                let expr = self.parse_expr()?;
                self.expect(Tok::RParen, "`)`")?;
                Ok(expr)
            }
            Tok::LBracket => {
                self.bump();
                let mut items = Vec::new();
                if !self.at(&Tok::RBracket) {
                    loop {
                        items.push(self.parse_expr()?);
                        if !self.eat(&Tok::Comma) {
                            break;
                        }
                    }
                }
                self.expect(Tok::RBracket, "`]`")?;
                Ok(Expr::Array(items))
            }
            Tok::LBrace => {
                self.bump();
                let mut entries = Vec::new();
                if !self.at(&Tok::RBrace) {
                    loop {
                        let key = match self.current().tok.clone() {
                            Tok::Ident(name) => {
                                self.bump();
                                name
                            }
                            Tok::Str(s) => {
                                self.bump();
                                s
                            }
                            other => {
                                return Err(self.error_here(format!(
                                    "expected property name, found {}",
                                    describe(&other)
                                )))
                            }
                        };
                        self.expect(Tok::Colon, "`:`")?;
                        let value = self.parse_expr()?;
                        entries.push((key, value));
                        if !self.eat(&Tok::Comma) {
                            break;
                        }
                    }
                }
                self.expect(Tok::RBrace, "`}`")?;
                Ok(Expr::Object(entries))
            }
            other => Err(self.error_here(format!(
                "expected an expression, found {}",
                describe(&other)
            ))),
        }
    }
}

fn is_assign_target(expr: &Expr) -> bool {
    matches!(
        expr,
        Expr::Ident(_) | Expr::Member { .. } | Expr::Index { .. }
    )
}

fn describe(tok: &Tok) -> String {
    match tok {
        Tok::Number(n) => format!("number `{}`", n),
        Tok::Str(_) => "string literal".to_string(),
        Tok::Ident(name) => format!("`{}`", name),
        Tok::Eof => "end of input".to_string(),
        other => format!("`{:?}`", other),
    }
}
