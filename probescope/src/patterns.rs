//! Probe-point pattern table
//!
//! The front end matches each written probe point against this binding
//! tree to decide which builder runs and to extract the parameter table.
//! The tree accepts every shape the grammar knows, including forms the
//! query layer later rejects as incomplete; keeping them bound preserves
//! the accepted grammar.

use crate::ast::{Literal, Params, ProbePoint};
use std::collections::BTreeMap;

/// Which resolution engine a matched pattern is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuilderKind {
    Dwarf,
    Timer,
    Begin,
    End,
}

/// Argument shape expected at one tree edge.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum MatchKey {
    Plain(String),
    Str(String),
    Num(String),
}

#[derive(Debug, Default)]
pub struct MatchNode {
    children: BTreeMap<MatchKey, MatchNode>,
    builder: Option<BuilderKind>,
}

impl MatchNode {
    fn child(&mut self, key: MatchKey) -> &mut MatchNode {
        self.children.entry(key).or_default()
    }

    fn bind(&mut self, functor: &str) -> &mut MatchNode {
        self.child(MatchKey::Plain(functor.to_string()))
    }

    fn bind_str(&mut self, functor: &str) -> &mut MatchNode {
        self.child(MatchKey::Str(functor.to_string()))
    }

    fn bind_num(&mut self, functor: &str) -> &mut MatchNode {
        self.child(MatchKey::Num(functor.to_string()))
    }

    fn terminate(&mut self, kind: BuilderKind) {
        self.builder = Some(kind);
    }

    /// Walks the tree along `point`; a full match at a terminal node yields
    /// the builder and the extracted parameter table.
    #[must_use]
    pub fn lookup(&self, point: &ProbePoint) -> Option<(BuilderKind, Params)> {
        let mut node = self;
        let mut params = Params::new();
        for comp in &point.components {
            let key = match &comp.arg {
                None => MatchKey::Plain(comp.functor.clone()),
                Some(Literal::Str(_)) => MatchKey::Str(comp.functor.clone()),
                Some(Literal::Num(_)) => MatchKey::Num(comp.functor.clone()),
            };
            node = node.children.get(&key)?;
            params.insert(comp.functor.clone(), comp.arg.clone());
        }
        node.builder.map(|b| (b, params))
    }
}

fn register_relative_variants(root: &mut MatchNode) {
    // . and .relative(NN)
    root.terminate(BuilderKind::Dwarf);
    root.bind_num("relative").terminate(BuilderKind::Dwarf);
}

fn register_statement_variants(root: &mut MatchNode) {
    // ., .relative(NN) and .label("foo") variants
    register_relative_variants(root);
    register_relative_variants(root.bind_str("label"));
}

fn register_inline_variants(root: &mut MatchNode) {
    // ., .callees and .callees(N)
    root.terminate(BuilderKind::Dwarf);
    root.bind("callees").terminate(BuilderKind::Dwarf);
    root.bind_num("callees").terminate(BuilderKind::Dwarf);
}

fn register_function_variants(root: &mut MatchNode) {
    // ., .return, .callees and .callees(N)
    root.terminate(BuilderKind::Dwarf);
    root.bind("return").terminate(BuilderKind::Dwarf);
    root.bind("callees").terminate(BuilderKind::Dwarf);
    root.bind_num("callees").terminate(BuilderKind::Dwarf);
}

fn register_function_and_statement_variants(root: &mut MatchNode) {
    register_function_variants(root.bind_str("function"));
    register_function_variants(root.bind_num("function"));
    register_inline_variants(root.bind_str("inline"));
    register_inline_variants(root.bind_num("inline"));
    register_statement_variants(root.bind_str("statement"));
    register_statement_variants(root.bind_num("statement"));
}

/// Builds the standard pattern table: begin/end, jiffies timers, and the
/// kernel/module dwarf family.
#[must_use]
pub fn register_patterns() -> MatchNode {
    let mut root = MatchNode::default();

    root.bind("begin").terminate(BuilderKind::Begin);
    root.bind("end").terminate(BuilderKind::End);
    root.bind("timer").bind_num("jiffies").terminate(BuilderKind::Timer);
    root.bind("timer").bind_num("jiffies").bind_num("randomize").terminate(BuilderKind::Timer);

    register_function_and_statement_variants(root.bind("kernel"));
    register_function_and_statement_variants(root.bind_str("module"));
    // process("foo") is reserved and deliberately left unbound.

    root
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::PointComponent;
    use crate::ast::PointComponent as PC;

    fn point(comps: Vec<PointComponent>) -> ProbePoint {
        ProbePoint::new(comps)
    }

    #[test]
    fn dwarf_shapes_match() {
        let table = register_patterns();

        let (kind, params) = table
            .lookup(&point(vec![
                PC::plain("kernel"),
                PC::with_str("function", "sys_read"),
                PC::plain("return"),
            ]))
            .expect("kernel.function().return should match");
        assert_eq!(kind, BuilderKind::Dwarf);
        assert!(params.contains_key("return"));

        let (kind, _) = table
            .lookup(&point(vec![
                PC::with_str("module", "ext3"),
                PC::with_num("statement", 0x1000),
            ]))
            .expect("module().statement(num) should match");
        assert_eq!(kind, BuilderKind::Dwarf);
    }

    #[test]
    fn incomplete_forms_still_bind() {
        // .callees and .relative are accepted by the grammar; the query
        // layer rejects them later with a diagnostic.
        let table = register_patterns();
        assert!(table
            .lookup(&point(vec![
                PC::plain("kernel"),
                PC::with_str("function", "foo"),
                PC::plain("callees"),
            ]))
            .is_some());
        assert!(table
            .lookup(&point(vec![
                PC::plain("kernel"),
                PC::with_str("statement", "foo@bar.c"),
                PC::with_num("relative", 4),
            ]))
            .is_some());
    }

    #[test]
    fn timers_and_lifecycle_match() {
        let table = register_patterns();
        assert_eq!(
            table.lookup(&point(vec![PC::plain("begin")])).unwrap().0,
            BuilderKind::Begin
        );
        assert_eq!(
            table
                .lookup(&point(vec![
                    PC::plain("timer"),
                    PC::with_num("jiffies", 100),
                    PC::with_num("randomize", 10),
                ]))
                .unwrap()
                .0,
            BuilderKind::Timer
        );
    }

    #[test]
    fn unknown_shapes_do_not_match() {
        let table = register_patterns();
        assert!(table.lookup(&point(vec![PC::with_str("process", "init")])).is_none());
        assert!(table.lookup(&point(vec![PC::plain("kernel")])).is_none());
    }
}
