//! End-to-end shape of the translation pipeline, with accessor snippets
//! stubbed in place of live kernel debuginfo: pattern table lookup,
//! flavour-based variant grouping, and the emitted C.

use probescope::ast::{Component, Expr, PointComponent, ProbePoint, Stmt};
use probescope::dwarf::DieRef;
use probescope::emit::{DerivedProbe, Emitter};
use probescope::error::SemanticError;
use probescope::loc::AccessorSnippet;
use probescope::output::TranslatorOutput;
use probescope::patterns::{register_patterns, BuilderKind};
use probescope::rewrite::{AccessorSource, ProbeSite, ProbeVariants};
use probescope::session::Session;

struct FixedSnippets(&'static str);

impl AccessorSource for FixedSnippets {
    fn snippet(
        &mut self,
        _scope: Option<DieRef>,
        _pc: u64,
        _local: &str,
        _components: &[Component],
        _lvalue: bool,
    ) -> Result<AccessorSnippet, SemanticError> {
        Ok(AccessorSnippet {
            code: self.0.to_string(),
            ty: probescope::ast::ExpType::Long,
        })
    }
}

fn body_logging(var: &str) -> Vec<Stmt> {
    vec![Stmt::Expr(Expr::Call {
        function: "log".into(),
        args: vec![Expr::TargetSymbol { base: var.into(), components: vec![] }],
    })]
}

#[test]
fn return_probe_on_function_resolves_to_kretprobe_array() {
    // kernel.function("sys_read").return with one resolved site at the
    // function's entry pc.
    let table = register_patterns();
    let point = ProbePoint::new(vec![
        PointComponent::plain("kernel"),
        PointComponent::with_str("function", "sys_read"),
        PointComponent::plain("return"),
    ]);
    let (kind, params) = table.lookup(&point).expect("pattern should match");
    assert_eq!(kind, BuilderKind::Dwarf);
    assert!(params.contains_key("return"));

    let mut sess = Session::new(false, false);
    let mut src = FixedSnippets("{ THIS->__retvalue = deref(8, addr); }");
    let mut variants = ProbeVariants::new();
    variants
        .add_site(
            &mut sess,
            &mut src,
            &body_logging("count"),
            None,
            0x4000,
            ProbeSite {
                address: 0x4000,
                scope: None,
                location: "kernel.function(\"sys_read\").return".into(),
                has_return: true,
            },
            true,
        )
        .unwrap();

    assert_eq!(variants.variants.len(), 1);
    let variant = &variants.variants[0];
    assert_eq!(variant.sites.len(), 1);
    assert_eq!(variant.sites[0].address, 0x4000);
    assert!(variant.has_return);

    let mut emitter = Emitter::new();
    let mut o = TranslatorOutput::new();
    emitter.emit_all(&mut o, &sess.functions, &[DerivedProbe::Dwarf(variant.clone())]);
    let out = o.finish();
    assert!(out.contains("static struct kretprobe kprobe_array_0[1]"));
    assert!(out.contains("{.kp.addr= (void *) 0x4000}"));
    assert!(out.contains("register_kretprobe"));
}

#[test]
fn inline_instances_collapse_into_one_variant() {
    // Three instances of an inline function whose target variable
    // resolves identically: one variant carrying three addresses.
    let mut sess = Session::new(false, false);
    let mut src = FixedSnippets("{ THIS->__retvalue = fetch_register(c->regs, 5); }");
    let mut variants = ProbeVariants::new();
    let body = body_logging("flags");

    for addr in [0xAu64, 0xB, 0xC] {
        variants
            .add_site(
                &mut sess,
                &mut src,
                &body,
                None,
                addr,
                ProbeSite {
                    address: addr,
                    scope: None,
                    location: format!("kernel.inline(\"do_fork\")#{addr:x}"),
                    has_return: false,
                },
                false,
            )
            .unwrap();
    }

    assert_eq!(variants.variants.len(), 1);
    let sites: Vec<u64> = variants.variants[0].sites.iter().map(|s| s.address).collect();
    assert_eq!(sites, vec![0xA, 0xB, 0xC]);

    // One accessor per site: rewriting happened once, for the shared
    // variant, not per site.
    assert_eq!(sess.functions.len(), 1);

    let mut emitter = Emitter::new();
    let mut o = TranslatorOutput::new();
    emitter.emit_all(
        &mut o,
        &sess.functions,
        &[DerivedProbe::Dwarf(variants.variants[0].clone())],
    );
    let out = o.finish();
    assert!(out.contains("static struct kprobe kprobe_array_0[3]"));
    assert!(out.contains("{.addr= (void *) 0xa},"));
    assert!(out.contains("{.addr= (void *) 0xc}"));
}
