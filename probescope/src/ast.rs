//! Front-end AST subset consumed by probe resolution
//!
//! The parser and type checker live in the front end; this module defines
//! the node shapes the resolution engine traverses and rewrites, plus the
//! probe-point and parameter-table types the pattern matcher hands over.

use std::collections::BTreeMap;
use std::fmt;

/// A literal parameter value attached to a probe-point component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Literal {
    Str(String),
    Num(i64),
}

/// Parameter table for one matched probe point: functor name to optional
/// literal argument (`None` for nullary components like `kernel` or `return`).
pub type Params = BTreeMap<String, Option<Literal>>;

/// True when `key` appears with no argument.
#[must_use]
pub fn has_null_param(params: &Params, key: &str) -> bool {
    matches!(params.get(key), Some(None))
}

#[must_use]
pub fn get_string_param(params: &Params, key: &str) -> Option<String> {
    match params.get(key) {
        Some(Some(Literal::Str(s))) => Some(s.clone()),
        _ => None,
    }
}

#[must_use]
pub fn get_number_param(params: &Params, key: &str) -> Option<i64> {
    match params.get(key) {
        Some(Some(Literal::Num(n))) => Some(*n),
        _ => None,
    }
}

/// One step in a target-variable access chain: `$var.field[3]` carries
/// `[Member("field"), Index(3)]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Component {
    Member(String),
    Index(u64),
}

/// Expression type vocabulary shared with the code emitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExpType {
    #[default]
    Unknown,
    Long,
    Str,
    Stats,
}

impl ExpType {
    /// Single-letter code used when fingerprinting target-variable bindings.
    #[must_use]
    pub fn code(self) -> char {
        match self {
            ExpType::Unknown => 'U',
            ExpType::Long => 'L',
            ExpType::Str => 'S',
            ExpType::Stats => 'T',
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(i64),
    Str(String),
    /// Script-level identifier (a plain script variable).
    Ident(String),
    /// `$name.field[n]...` reference into the probed program.
    TargetSymbol { base: String, components: Vec<Component> },
    Unary { op: String, operand: Box<Expr> },
    Binary { op: String, left: Box<Expr>, right: Box<Expr> },
    Assignment { op: String, left: Box<Expr>, right: Box<Expr> },
    Call { function: String, args: Vec<Expr> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Expr(Expr),
    Block(Vec<Stmt>),
    If { cond: Expr, then_branch: Box<Stmt>, else_branch: Option<Box<Stmt>> },
    Return(Option<Expr>),
}

/// A probe body is a brace-enclosed statement list.
pub type Block = Vec<Stmt>;

#[derive(Debug, Clone, PartialEq)]
pub struct VarDecl {
    pub name: String,
    pub ty: ExpType,
}

/// Body of a function declaration. Synthesized target-variable accessors
/// carry verbatim emitted C rather than script statements.
#[derive(Debug, Clone, PartialEq)]
pub enum FunctionBody {
    Script(Block),
    Embedded(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDecl {
    pub name: String,
    pub ty: ExpType,
    pub formal_args: Vec<VarDecl>,
    pub body: FunctionBody,
}

/// A probe as handed over by the front end: the point it was written
/// against plus its body.
#[derive(Debug, Clone)]
pub struct Probe {
    pub point: ProbePoint,
    pub body: Block,
}

/// One functor of a probe point, e.g. `function("sys_read")` or `return`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointComponent {
    pub functor: String,
    pub arg: Option<Literal>,
}

impl PointComponent {
    #[must_use]
    pub fn plain(functor: &str) -> Self {
        PointComponent { functor: functor.to_string(), arg: None }
    }

    #[must_use]
    pub fn with_str(functor: &str, arg: &str) -> Self {
        PointComponent { functor: functor.to_string(), arg: Some(Literal::Str(arg.to_string())) }
    }

    #[must_use]
    pub fn with_num(functor: &str, arg: i64) -> Self {
        PointComponent { functor: functor.to_string(), arg: Some(Literal::Num(arg)) }
    }
}

/// A dotted probe-point path, printable in the form the user wrote it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProbePoint {
    pub components: Vec<PointComponent>,
}

impl ProbePoint {
    #[must_use]
    pub fn new(components: Vec<PointComponent>) -> Self {
        ProbePoint { components }
    }
}

impl fmt::Display for ProbePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, c) in self.components.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            match &c.arg {
                None => write!(f, "{}", c.functor)?,
                Some(Literal::Str(s)) => write!(f, "{}(\"{}\")", c.functor, s)?,
                Some(Literal::Num(n)) => write!(f, "{}({:#x})", c.functor, n)?,
            }
        }
        Ok(())
    }
}

/// Read-only traversal used by analyses that only need to see
/// target-variable references, with lvalue context tracked for them.
pub trait Visitor {
    fn visit_target_symbol(&mut self, base: &str, components: &[Component], lvalue: bool);
}

pub fn walk_block<V: Visitor>(v: &mut V, block: &Block) {
    for stmt in block {
        walk_stmt(v, stmt);
    }
}

pub fn walk_stmt<V: Visitor>(v: &mut V, stmt: &Stmt) {
    match stmt {
        Stmt::Expr(e) => walk_expr(v, e, false),
        Stmt::Block(stmts) => walk_block(v, stmts),
        Stmt::If { cond, then_branch, else_branch } => {
            walk_expr(v, cond, false);
            walk_stmt(v, then_branch);
            if let Some(e) = else_branch {
                walk_stmt(v, e);
            }
        }
        Stmt::Return(Some(e)) => walk_expr(v, e, false),
        Stmt::Return(None) => {}
    }
}

pub fn walk_expr<V: Visitor>(v: &mut V, expr: &Expr, lvalue: bool) {
    match expr {
        Expr::Number(_) | Expr::Str(_) | Expr::Ident(_) => {}
        Expr::TargetSymbol { base, components } => {
            v.visit_target_symbol(base, components, lvalue);
        }
        Expr::Unary { operand, .. } => walk_expr(v, operand, false),
        Expr::Binary { left, right, .. } => {
            walk_expr(v, left, false);
            walk_expr(v, right, false);
        }
        Expr::Assignment { left, right, .. } => {
            walk_expr(v, left, true);
            walk_expr(v, right, false);
        }
        Expr::Call { args, .. } => {
            for a in args {
                walk_expr(v, a, false);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_point_display() {
        let pp = ProbePoint::new(vec![
            PointComponent::plain("kernel"),
            PointComponent::with_str("function", "sys_read"),
            PointComponent::plain("return"),
        ]);
        assert_eq!(pp.to_string(), "kernel.function(\"sys_read\").return");

        let pp = ProbePoint::new(vec![
            PointComponent::with_str("module", "ext3"),
            PointComponent::with_num("statement", 0xbeef),
        ]);
        assert_eq!(pp.to_string(), "module(\"ext3\").statement(0xbeef)");
    }

    #[test]
    fn walker_sees_lvalue_context() {
        struct Collect(Vec<(String, bool)>);
        impl Visitor for Collect {
            fn visit_target_symbol(&mut self, base: &str, _: &[Component], lvalue: bool) {
                self.0.push((base.to_string(), lvalue));
            }
        }

        // $x = $y + 1
        let body = vec![Stmt::Expr(Expr::Assignment {
            op: "=".into(),
            left: Box::new(Expr::TargetSymbol { base: "x".into(), components: vec![] }),
            right: Box::new(Expr::Binary {
                op: "+".into(),
                left: Box::new(Expr::TargetSymbol { base: "y".into(), components: vec![] }),
                right: Box::new(Expr::Number(1)),
            }),
        })];

        let mut c = Collect(Vec::new());
        walk_block(&mut c, &body);
        assert_eq!(c.0, vec![("x".to_string(), true), ("y".to_string(), false)]);
    }
}
