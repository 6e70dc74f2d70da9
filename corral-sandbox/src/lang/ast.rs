//! Syntax tree for the script language, plus the static metrics walker
//! the validator's resource estimator runs over it.

#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclKind {
    Let,
    Const,
    Var,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Expr(Expr),
    VarDecl {
        kind: DeclKind,
        name: String,
        init: Option<Expr>,
    },
    FuncDecl {
        name: String,
        params: Vec<String>,
        body: Vec<Stmt>,
    },
    Return(Option<Expr>),
    If {
        cond: Expr,
        then_branch: Vec<Stmt>,
        else_branch: Option<Vec<Stmt>>,
    },
    While {
        cond: Expr,
        body: Vec<Stmt>,
    },
    For {
        init: Option<Box<Stmt>>,
        cond: Option<Expr>,
        step: Option<Expr>,
        body: Vec<Stmt>,
    },
    Break,
    Continue,
    Block(Vec<Stmt>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    Assign,
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOp {
    Incr,
    Decr,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Str(String),
    Bool(bool),
    Null,
    Array(Vec<Expr>),
    Object(Vec<(String, Expr)>),
    Ident(String),
    Assign {
        target: Box<Expr>,
        op: AssignOp,
        value: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Logical {
        op: LogicalOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Cond {
        cond: Box<Expr>,
        then_expr: Box<Expr>,
        else_expr: Box<Expr>,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    Member {
        object: Box<Expr>,
        property: String,
    },
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
    },
    Func {
        params: Vec<String>,
        body: Vec<Stmt>,
    },
    Update {
        target: Box<Expr>,
        op: UpdateOp,
        prefix: bool,
    },
}

/// Static shape of a program, for heuristic resource estimation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AstMetrics {
    pub node_count: u64,
    pub max_loop_depth: u32,
    /// Bytes the program's literals would allocate if evaluated once.
    pub literal_bytes: u64,
    pub function_count: u32,
}

impl AstMetrics {
    pub fn of(program: &Program) -> Self {
        let mut metrics = Self::default();
        walk_stmts(&program.body, 0, &mut metrics);
        metrics
    }
}

fn walk_stmts(stmts: &[Stmt], loop_depth: u32, m: &mut AstMetrics) {
    for stmt in stmts {
        walk_stmt(stmt, loop_depth, m);
    }
}

fn walk_stmt(stmt: &Stmt, loop_depth: u32, m: &mut AstMetrics) {
    m.node_count += 1;
    match stmt {
        Stmt::Expr(e) | Stmt::Return(Some(e)) => walk_expr(e, loop_depth, m),
        Stmt::Return(None) | Stmt::Break | Stmt::Continue => {}
        Stmt::VarDecl { init, .. } => {
            if let Some(e) = init {
                walk_expr(e, loop_depth, m);
            }
        }
        Stmt::FuncDecl { body, .. } => {
            m.function_count += 1;
            m.literal_bytes += 128;
            walk_stmts(body, loop_depth, m);
        }
        Stmt::If {
            cond,
            then_branch,
            else_branch,
        } => {
            walk_expr(cond, loop_depth, m);
            walk_stmts(then_branch, loop_depth, m);
            if let Some(else_branch) = else_branch {
                walk_stmts(else_branch, loop_depth, m);
            }
        }
        Stmt::While { cond, body } => {
            let depth = loop_depth + 1;
            m.max_loop_depth = m.max_loop_depth.max(depth);
            walk_expr(cond, depth, m);
            walk_stmts(body, depth, m);
        }
        Stmt::For {
            init,
            cond,
            step,
            body,
        } => {
            let depth = loop_depth + 1;
            m.max_loop_depth = m.max_loop_depth.max(depth);
            if let Some(init) = init {
                walk_stmt(init, depth, m);
            }
            if let Some(cond) = cond {
                walk_expr(cond, depth, m);
            }
            if let Some(step) = step {
                walk_expr(step, depth, m);
            }
            walk_stmts(body, depth, m);
        }
        Stmt::Block(body) => walk_stmts(body, loop_depth, m),
    }
}

fn walk_expr(expr: &Expr, loop_depth: u32, m: &mut AstMetrics) {
    m.node_count += 1;
    match expr {
        Expr::Number(_) => m.literal_bytes += 8,
        Expr::Bool(_) | Expr::Null | Expr::Ident(_) => {}
        Expr::Str(s) => m.literal_bytes += s.len() as u64,
        Expr::Array(items) => {
            m.literal_bytes += 16 * items.len() as u64;
            for item in items {
                walk_expr(item, loop_depth, m);
            }
        }
        Expr::Object(entries) => {
            m.literal_bytes += 64 * entries.len() as u64;
            for (_, value) in entries {
                walk_expr(value, loop_depth, m);
            }
        }
        Expr::Assign { target, value, .. } => {
            walk_expr(target, loop_depth, m);
            walk_expr(value, loop_depth, m);
        }
        Expr::Unary { expr, .. } => walk_expr(expr, loop_depth, m),
        Expr::Binary { lhs, rhs, .. } | Expr::Logical { lhs, rhs, .. } => {
            walk_expr(lhs, loop_depth, m);
            walk_expr(rhs, loop_depth, m);
        }
        Expr::Cond {
            cond,
            then_expr,
            else_expr,
        } => {
            walk_expr(cond, loop_depth, m);
            walk_expr(then_expr, loop_depth, m);
            walk_expr(else_expr, loop_depth, m);
        }
        Expr::Call { callee, args } => {
            walk_expr(callee, loop_depth, m);
            for arg in args {
                walk_expr(arg, loop_depth, m);
            }
        }
        Expr::Member { object, .. } => walk_expr(object, loop_depth, m),
        Expr::Index { object, index } => {
            walk_expr(object, loop_depth, m);
            walk_expr(index, loop_depth, m);
        }
        Expr::Func { body, .. } => {
            m.function_count += 1;
            m.literal_bytes += 128;
            walk_stmts(body, loop_depth, m);
        }
        Expr::Update { target, .. } => walk_expr(target, loop_depth, m),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang;

    #[test]
    fn test_metrics_loop_depth() {
        let parsed = lang::parse("for (let i = 0; i < 3; i += 1) { while (i < 2) { i += 1; } }")
            .unwrap();
        let m = AstMetrics::of(&parsed.program);
        assert_eq!(m.max_loop_depth, 2);
    }

    #[test]
    fn test_metrics_literal_bytes() {
        let parsed = lang::parse("let s = 'abcd'; let a = [1, 2];").unwrap();
        let m = AstMetrics::of(&parsed.program);
        // 4 string bytes + 2 array slots + 2 numbers
        assert_eq!(m.literal_bytes, 4 + 32 + 16);
    }
}
