//! Probe body rewriting and variant grouping
//!
//! Every resolved site gets a probe body in which each `$name...` reference
//! is replaced by a call to a synthesized accessor whose embedded body is
//! the fetch/store snippet for that exact DIE and pc. Sites whose snippets
//! are bit-identical share one generated probe function; the *flavour*
//! string is the grouping key. It concatenates, per target-symbol
//! reference in source order, `r`/`w`, the type code, and the emitted text
//! length-prefixed in braces, so two sites agree exactly when every one of
//! their snippets does.

use crate::ast::{
    walk_block, Block, Component, Expr, ExpType, FunctionBody, FunctionDecl, Stmt, VarDecl,
    Visitor,
};
use crate::dwarf::DieRef;
use crate::error::SemanticError;
use crate::loc::AccessorSnippet;
use crate::session::Session;
use log::debug;
use std::collections::HashMap;

/// Produces the emitted accessor snippet for one target-variable access at
/// one resolved site. The DWARF-backed translator implements this; tests
/// substitute canned snippets.
pub trait AccessorSource {
    fn snippet(
        &mut self,
        scope: Option<DieRef>,
        pc: u64,
        local: &str,
        components: &[Component],
        lvalue: bool,
    ) -> Result<AccessorSnippet, SemanticError>;
}

/// A resolved location to instrument. Immutable once pushed.
#[derive(Debug, Clone)]
pub struct ProbeSite {
    /// Kernel-global address.
    pub address: u64,
    pub scope: Option<DieRef>,
    /// Human-readable probe point, parallel to the address array.
    pub location: String,
    pub has_return: bool,
}

/// Sites sharing one target-variable flavour and hence one generated
/// probe function.
#[derive(Debug, Clone)]
pub struct ProbeVariant {
    pub flavour: String,
    pub body: Block,
    pub has_return: bool,
    pub sites: Vec<ProbeSite>,
}

#[derive(Default)]
pub struct ProbeVariants {
    pub variants: Vec<ProbeVariant>,
    by_flavour: HashMap<String, usize>,
    /// Once a body shows no target variables, every site shares the one
    /// variant and flavour computation is skipped.
    no_target_variables: bool,
}

impl ProbeVariants {
    #[must_use]
    pub fn new() -> Self {
        ProbeVariants::default()
    }

    /// Adds one resolved site, rewriting the base body on first sight of
    /// its flavour. `pc` is the module-space address used for DWARF scope
    /// lookups; `site` carries the kernel-global address.
    #[allow(clippy::too_many_arguments)]
    pub fn add_site(
        &mut self,
        sess: &mut Session,
        src: &mut dyn AccessorSource,
        base_body: &Block,
        scope: Option<DieRef>,
        pc: u64,
        site: ProbeSite,
        has_return: bool,
    ) -> Result<(), SemanticError> {
        let idx = if self.no_target_variables {
            assert_eq!(self.variants.len(), 1);
            0
        } else {
            let flavour = {
                let mut flav = FlavourVisitor {
                    sess: &mut *sess,
                    src: &mut *src,
                    scope,
                    pc,
                    flavour: String::new(),
                    failed: false,
                };
                walk_block(&mut flav, base_body);
                if flav.failed {
                    // The flavour pass already reported the exact failure.
                    return Err(SemanticError::TargetVarResolution);
                }
                flav.flavour
            };

            let idx = match self.by_flavour.get(&flavour) {
                Some(&idx) => idx,
                None => {
                    let body = rewrite_body(sess, src, base_body, scope, pc)?;
                    let idx = self.variants.len();
                    self.variants.push(ProbeVariant {
                        flavour: flavour.clone(),
                        body,
                        has_return,
                        sites: Vec::new(),
                    });
                    self.by_flavour.insert(flavour.clone(), idx);
                    idx
                }
            };
            if flavour.is_empty() {
                self.no_target_variables = true;
            }
            idx
        };

        debug!("variant {idx}: adding probe site {}", site.location);
        self.variants[idx].sites.push(site);
        Ok(())
    }
}

struct FlavourVisitor<'a> {
    sess: &'a mut Session,
    src: &'a mut dyn AccessorSource,
    scope: Option<DieRef>,
    pc: u64,
    flavour: String,
    failed: bool,
}

impl Visitor for FlavourVisitor<'_> {
    fn visit_target_symbol(&mut self, base: &str, components: &[Component], lvalue: bool) {
        if lvalue && !self.sess.guru_mode {
            self.sess.record_error("", &SemanticError::IllegalLvalue);
            self.failed = true;
            return;
        }
        match self.src.snippet(self.scope, self.pc, base, components, lvalue) {
            Ok(snippet) => {
                self.flavour.push(if lvalue { 'w' } else { 'r' });
                self.flavour.push(snippet.ty.code());
                self.flavour.push_str(&snippet.code.len().to_string());
                self.flavour.push('{');
                self.flavour.push_str(&snippet.code);
                self.flavour.push('}');
            }
            Err(e) => {
                self.sess.record_error("", &e);
                self.failed = true;
            }
        }
    }
}

/// Deep-copies `body`, replacing target-symbol references with calls to
/// freshly synthesized accessor functions.
pub fn rewrite_body(
    sess: &mut Session,
    src: &mut dyn AccessorSource,
    body: &Block,
    scope: Option<DieRef>,
    pc: u64,
) -> Result<Block, SemanticError> {
    let mut expander = VarExpander { sess, src, scope, pc };
    let mut setters: Vec<Option<Expr>> = Vec::new();
    body.iter().map(|s| expander.rewrite_stmt(s, &mut setters)).collect()
}

struct VarExpander<'a> {
    sess: &'a mut Session,
    src: &'a mut dyn AccessorSource,
    scope: Option<DieRef>,
    pc: u64,
}

impl VarExpander<'_> {
    fn rewrite_stmt(
        &mut self,
        stmt: &Stmt,
        setters: &mut Vec<Option<Expr>>,
    ) -> Result<Stmt, SemanticError> {
        Ok(match stmt {
            Stmt::Expr(e) => Stmt::Expr(self.rewrite_expr(e, false, setters)?),
            Stmt::Block(stmts) => Stmt::Block(
                stmts
                    .iter()
                    .map(|s| self.rewrite_stmt(s, setters))
                    .collect::<Result<_, _>>()?,
            ),
            Stmt::If { cond, then_branch, else_branch } => Stmt::If {
                cond: self.rewrite_expr(cond, false, setters)?,
                then_branch: Box::new(self.rewrite_stmt(then_branch, setters)?),
                else_branch: match else_branch {
                    Some(e) => Some(Box::new(self.rewrite_stmt(e, setters)?)),
                    None => None,
                },
            },
            Stmt::Return(e) => Stmt::Return(match e {
                Some(e) => Some(self.rewrite_expr(e, false, setters)?),
                None => None,
            }),
        })
    }

    /// `setters` holds one slot per enclosing assignment, threaded through
    /// the recursion rather than kept on the rewriter. A rewritten lvalue
    /// target symbol deposits its setter call in the innermost slot so the
    /// assignment node above can splice the right-hand side in as the
    /// call's argument.
    fn rewrite_expr(
        &mut self,
        expr: &Expr,
        lvalue: bool,
        setters: &mut Vec<Option<Expr>>,
    ) -> Result<Expr, SemanticError> {
        match expr {
            Expr::Number(_) | Expr::Str(_) | Expr::Ident(_) => Ok(expr.clone()),
            Expr::Unary { op, operand } => Ok(Expr::Unary {
                op: op.clone(),
                operand: Box::new(self.rewrite_expr(operand, false, setters)?),
            }),
            Expr::Binary { op, left, right } => Ok(Expr::Binary {
                op: op.clone(),
                left: Box::new(self.rewrite_expr(left, false, setters)?),
                right: Box::new(self.rewrite_expr(right, false, setters)?),
            }),
            Expr::Call { function, args } => Ok(Expr::Call {
                function: function.clone(),
                args: args
                    .iter()
                    .map(|a| self.rewrite_expr(a, false, setters))
                    .collect::<Result<_, _>>()?,
            }),
            Expr::Assignment { op, left, right } => {
                setters.push(None);
                let new_left = self.rewrite_expr(left, true, setters)?;
                let slot = setters.pop().unwrap_or(None);
                let new_right = self.rewrite_expr(right, false, setters)?;

                if slot.is_some() {
                    // The left child was a target symbol and is now a
                    // set_target_foo() call; splice the right-hand side in
                    // as its sole argument and replace the whole
                    // assignment with the call.
                    if op != "=" {
                        return Err(SemanticError::UnsupportedCompoundAssign);
                    }
                    let Expr::Call { function, mut args } = new_left else {
                        unreachable!("setter slot filled by a non-call rewrite");
                    };
                    args.push(new_right);
                    Ok(Expr::Call { function, args })
                } else {
                    Ok(Expr::Assignment {
                        op: op.clone(),
                        left: Box::new(new_left),
                        right: Box::new(new_right),
                    })
                }
            }
            Expr::TargetSymbol { base, components } => {
                if lvalue && !self.sess.guru_mode {
                    return Err(SemanticError::IllegalLvalue);
                }

                let snippet = self
                    .src
                    .snippet(self.scope, self.pc, base, components, lvalue)
                    .map_err(|_| {
                        // The flavour-gathering pass already printed a
                        // message for this exact case.
                        SemanticError::TargetVarResolution
                    })?;

                let fname = format!(
                    "{}_{}_{}",
                    if lvalue { "set" } else { "get" },
                    base,
                    self.sess.next_tick()
                );
                let mut fdecl = FunctionDecl {
                    name: fname.clone(),
                    ty: snippet.ty,
                    formal_args: Vec::new(),
                    body: FunctionBody::Embedded(snippet.code),
                };
                if lvalue {
                    // Setters carry a single long-typed formal named
                    // "value"; only base-typed stores are supported.
                    fdecl.formal_args.push(VarDecl { name: "value".into(), ty: ExpType::Long });
                }
                self.sess.functions.push(fdecl);

                let call = Expr::Call { function: fname, args: Vec::new() };
                if lvalue {
                    let slot =
                        setters.last_mut().expect("lvalue target symbol outside assignment");
                    *slot = Some(call.clone());
                }
                Ok(call)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::ExpType;

    /// Canned accessor source: snippet text keyed by variable name.
    struct StubSource {
        snippets: HashMap<String, String>,
    }

    impl StubSource {
        fn new(pairs: &[(&str, &str)]) -> Self {
            StubSource {
                snippets: pairs
                    .iter()
                    .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                    .collect(),
            }
        }
    }

    impl AccessorSource for StubSource {
        fn snippet(
            &mut self,
            _scope: Option<DieRef>,
            _pc: u64,
            local: &str,
            _components: &[Component],
            _lvalue: bool,
        ) -> Result<AccessorSnippet, SemanticError> {
            match self.snippets.get(local) {
                Some(code) => Ok(AccessorSnippet { code: code.clone(), ty: ExpType::Long }),
                None => Err(SemanticError::LocalNotFound { local: local.into(), pc: 0 }),
            }
        }
    }

    fn log_of(var: &str) -> Block {
        vec![Stmt::Expr(Expr::Call {
            function: "log".into(),
            args: vec![Expr::TargetSymbol { base: var.into(), components: vec![] }],
        })]
    }

    fn site(addr: u64, name: &str) -> ProbeSite {
        ProbeSite { address: addr, scope: None, location: name.into(), has_return: false }
    }

    #[test]
    fn identical_snippets_share_a_variant() {
        // Sites A and B resolve $x identically, C differently: two
        // variants, the first holding both A and B.
        let body = log_of("x");
        let mut sess = Session::new(false, false);
        let mut variants = ProbeVariants::new();

        let mut same = StubSource::new(&[("x", "{ addr = R6 - 4; }")]);
        variants
            .add_site(&mut sess, &mut same, &body, None, 0x100, site(0x100, "A"), false)
            .unwrap();
        variants
            .add_site(&mut sess, &mut same, &body, None, 0x200, site(0x200, "B"), false)
            .unwrap();

        let mut different = StubSource::new(&[("x", "{ addr = R6 - 8; }")]);
        variants
            .add_site(&mut sess, &mut different, &body, None, 0x300, site(0x300, "C"), false)
            .unwrap();

        assert_eq!(variants.variants.len(), 2);
        let names: Vec<_> =
            variants.variants[0].sites.iter().map(|s| s.location.as_str()).collect();
        assert_eq!(names, vec!["A", "B"]);
        assert_eq!(variants.variants[1].sites.len(), 1);
        assert_ne!(variants.variants[0].flavour, variants.variants[1].flavour);
    }

    #[test]
    fn flavour_embeds_length_and_text() {
        let body = log_of("x");
        let mut sess = Session::new(false, false);
        let mut src = StubSource::new(&[("x", "CODE")]);
        let mut variants = ProbeVariants::new();
        variants
            .add_site(&mut sess, &mut src, &body, None, 0x1, site(0x1, "A"), false)
            .unwrap();
        assert_eq!(variants.variants[0].flavour, "rL4{CODE}");
    }

    #[test]
    fn body_without_target_vars_reuses_one_variant() {
        let body = vec![Stmt::Expr(Expr::Call { function: "log".into(), args: vec![] })];
        let mut sess = Session::new(false, false);
        let mut src = StubSource::new(&[]);
        let mut variants = ProbeVariants::new();
        for addr in [1u64, 2, 3] {
            variants
                .add_site(&mut sess, &mut src, &body, None, addr, site(addr, "p"), false)
                .unwrap();
        }
        assert_eq!(variants.variants.len(), 1);
        assert_eq!(variants.variants[0].sites.len(), 3);
        assert!(variants.variants[0].flavour.is_empty());
    }

    #[test]
    fn rewrite_replaces_reads_with_getter_calls() {
        let body = log_of("x");
        let mut sess = Session::new(false, false);
        let mut src = StubSource::new(&[("x", "SNIP")]);
        let out = rewrite_body(&mut sess, &mut src, &body, None, 0x10).unwrap();

        let Stmt::Expr(Expr::Call { args, .. }) = &out[0] else {
            panic!("expected call statement");
        };
        let Expr::Call { function, args: inner } = &args[0] else {
            panic!("expected getter call in place of $x");
        };
        assert!(function.starts_with("get_x_"));
        assert!(inner.is_empty());

        assert_eq!(sess.functions.len(), 1);
        assert_eq!(sess.functions[0].name, *function);
        assert_eq!(sess.functions[0].body, FunctionBody::Embedded("SNIP".into()));
        assert!(sess.functions[0].formal_args.is_empty());
    }

    #[test]
    fn assignment_to_target_becomes_setter_call() {
        // $x = 5 in guru mode turns into set_x_N(5).
        let body = vec![Stmt::Expr(Expr::Assignment {
            op: "=".into(),
            left: Box::new(Expr::TargetSymbol { base: "x".into(), components: vec![] }),
            right: Box::new(Expr::Number(5)),
        })];
        let mut sess = Session::new(false, true);
        let mut src = StubSource::new(&[("x", "STORE")]);
        let out = rewrite_body(&mut sess, &mut src, &body, None, 0x10).unwrap();

        let Stmt::Expr(Expr::Call { function, args }) = &out[0] else {
            panic!("expected setter call in place of assignment");
        };
        assert!(function.starts_with("set_x_"));
        assert_eq!(args, &vec![Expr::Number(5)]);

        let fdecl = &sess.functions[0];
        assert_eq!(fdecl.formal_args.len(), 1);
        assert_eq!(fdecl.formal_args[0].name, "value");
        assert_eq!(fdecl.formal_args[0].ty, ExpType::Long);
    }

    #[test]
    fn compound_assign_to_target_is_rejected() {
        let body = vec![Stmt::Expr(Expr::Assignment {
            op: "+=".into(),
            left: Box::new(Expr::TargetSymbol { base: "x".into(), components: vec![] }),
            right: Box::new(Expr::Number(1)),
        })];
        let mut sess = Session::new(false, true);
        let mut src = StubSource::new(&[("x", "STORE")]);
        let err = rewrite_body(&mut sess, &mut src, &body, None, 0x10).unwrap_err();
        assert!(matches!(err, SemanticError::UnsupportedCompoundAssign));
    }

    #[test]
    fn lvalue_outside_guru_mode_is_rejected() {
        let body = vec![Stmt::Expr(Expr::Assignment {
            op: "=".into(),
            left: Box::new(Expr::TargetSymbol { base: "x".into(), components: vec![] }),
            right: Box::new(Expr::Number(1)),
        })];
        let mut sess = Session::new(false, false);
        let mut src = StubSource::new(&[("x", "STORE")]);
        let err = rewrite_body(&mut sess, &mut src, &body, None, 0x10).unwrap_err();
        assert!(matches!(err, SemanticError::IllegalLvalue));

        // The flavour pass reports it as well, and the site is dropped.
        let mut variants = ProbeVariants::new();
        let err = variants
            .add_site(&mut sess, &mut src, &body, None, 0x10, site(0x10, "A"), false)
            .unwrap_err();
        assert!(matches!(err, SemanticError::TargetVarResolution));
        assert!(sess.num_errors() > 0);
    }

    #[test]
    fn plain_script_assignment_is_left_alone() {
        let body = vec![Stmt::Expr(Expr::Assignment {
            op: "=".into(),
            left: Box::new(Expr::Ident("count".into())),
            right: Box::new(Expr::Number(1)),
        })];
        let mut sess = Session::new(false, false);
        let mut src = StubSource::new(&[]);
        let out = rewrite_body(&mut sess, &mut src, &body, None, 0).unwrap();
        assert_eq!(out, body);
        assert!(sess.functions.is_empty());
    }
}
