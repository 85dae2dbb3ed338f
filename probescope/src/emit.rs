//! C emission for probe registration, dispatch and fault handling
//!
//! Every probe variant becomes an address array (`struct kprobe[N]` or
//! `struct kretprobe[N]`), a parallel array of human-readable location
//! strings, and one dispatch function that gates on session state, refuses
//! reentry, and routes into the generated `probe_N (c)` handler. Timer and
//! begin/end probes share the dispatch skeleton with their own triggers.

use crate::ast::{FunctionBody, FunctionDecl};
use crate::error::SemanticError;
use crate::output::{c_quoted, TranslatorOutput};
use crate::rewrite::ProbeVariant;

/// A probe ready for emission.
pub enum DerivedProbe {
    Dwarf(ProbeVariant),
    Timer(TimerProbe),
    BeginEnd(BeProbe),
}

/// A jiffies-driven timer probe, optionally perturbed each round.
pub struct TimerProbe {
    pub interval: i64,
    pub randomize: i64,
    pub location: String,
}

impl TimerProbe {
    /// Interval and randomization must fit plain ints on the kernel side.
    pub fn new(location: String, interval: i64, randomize: i64) -> Result<Self, SemanticError> {
        if interval <= 0 || interval > 1_000_000 {
            return Err(SemanticError::BadTimerInterval);
        }
        if randomize < 0 || randomize > interval {
            return Err(SemanticError::BadTimerRandomize);
        }
        Ok(TimerProbe { interval, randomize, location })
    }

    /// Builds a timer probe from a matched `timer.jiffies(N)[.randomize(M)]`
    /// parameter table.
    pub fn from_params(
        location: String,
        params: &crate::ast::Params,
    ) -> Result<Self, SemanticError> {
        let interval =
            crate::ast::get_number_param(params, "jiffies").ok_or(SemanticError::BadTimerInterval)?;
        let randomize = crate::ast::get_number_param(params, "randomize").unwrap_or(0);
        TimerProbe::new(location, interval, randomize)
    }
}

/// Begin/end probes run during registration and deregistration.
pub struct BeProbe {
    pub begin: bool,
    pub locations: Vec<String>,
}

fn enter_function_name(probenum: usize) -> String {
    format!("kprobe_enter_{probenum}")
}

fn kprobe_array_name(probenum: usize) -> String {
    format!("kprobe_array_{probenum}")
}

fn location_array_name(probenum: usize) -> String {
    format!("kprobe_names_{probenum}")
}

#[derive(Default)]
pub struct Emitter {
    fault_handler_emitted: bool,
}

impl Emitter {
    #[must_use]
    pub fn new() -> Self {
        Emitter::default()
    }

    /// Emits everything for a set of probes: synthesized accessor bodies,
    /// per-probe entries, and the register/unregister pair.
    pub fn emit_all(
        &mut self,
        o: &mut TranslatorOutput,
        functions: &[FunctionDecl],
        probes: &[DerivedProbe],
    ) {
        self.emit_function_decls(o, functions);
        for (i, probe) in probes.iter().enumerate() {
            self.emit_probe_entries(o, i, probe);
        }
        self.emit_register_all(o, probes);
        self.emit_unregister_all(o, probes);
    }

    /// Synthesized target-variable accessors carry verbatim translated
    /// bodies; script-level functions are the front end's to emit.
    pub fn emit_function_decls(&mut self, o: &mut TranslatorOutput, functions: &[FunctionDecl]) {
        for fdecl in functions {
            let FunctionBody::Embedded(code) = &fdecl.body else {
                continue;
            };
            o.blank();
            o.line(&format!("static void function_{} (struct context* THIS_c) {{", fdecl.name));
            o.line_at(1, "struct context* c = THIS_c;");
            for line in code.lines() {
                o.line(line);
            }
            o.line_at(0, "out:");
            o.line(";");
            o.line_at(-1, "}");
        }
    }

    pub fn emit_probe_entries(&mut self, o: &mut TranslatorOutput, i: usize, probe: &DerivedProbe) {
        match probe {
            DerivedProbe::Dwarf(v) => self.emit_dwarf_entries(o, i, v),
            DerivedProbe::Timer(t) => emit_timer_entries(o, i, t),
            DerivedProbe::BeginEnd(b) => emit_be_entries(o, i, b),
        }
    }

    pub fn emit_registrations(&self, o: &mut TranslatorOutput, i: usize, probe: &DerivedProbe) {
        match probe {
            DerivedProbe::Dwarf(v) => emit_dwarf_registrations(o, i, v),
            DerivedProbe::Timer(t) => {
                o.line(&format!("init_timer (& timer_{i});"));
                o.line(&format!("timer_{i}.expires = jiffies + {};", t.interval));
                o.line(&format!("timer_{i}.function = & enter_{i};"));
                o.line(&format!("add_timer (& timer_{i});"));
            }
            DerivedProbe::BeginEnd(b) => {
                if b.begin {
                    for (loc_idx, _) in b.locations.iter().enumerate() {
                        o.line(&format!("enter_{i}_{loc_idx} ();"));
                    }
                }
            }
        }
    }

    pub fn emit_deregistrations(&self, o: &mut TranslatorOutput, i: usize, probe: &DerivedProbe) {
        match probe {
            DerivedProbe::Dwarf(v) => emit_dwarf_deregistrations(o, i, v),
            DerivedProbe::Timer(_) => {
                o.line(&format!("del_timer_sync (& timer_{i});"));
            }
            DerivedProbe::BeginEnd(b) => {
                if !b.begin {
                    for (loc_idx, _) in b.locations.iter().enumerate() {
                        o.line(&format!("enter_{i}_{loc_idx} ();"));
                    }
                }
            }
        }
    }

    fn emit_register_all(&self, o: &mut TranslatorOutput, probes: &[DerivedProbe]) {
        o.blank();
        o.line("static int register_all_probes (void) {");
        o.line_at(1, "int rc = 0;");
        o.line("const char* probe_point = 0;");
        o.line("(void) probe_point;");
        for (i, probe) in probes.iter().enumerate() {
            o.blank();
            o.line(&format!("/* register probe {i} */"));
            self.emit_registrations(o, i, probe);
            o.line("if (unlikely (rc)) {");
            o.line_at(1, "_stp_error (\"probe %s registration failed, rc=%d\", probe_point ? probe_point : \"?\", rc);");
            // Registrations that already succeeded must not stay armed.
            for j in (0..i).rev() {
                self.emit_deregistrations(o, j, &probes[j]);
            }
            o.line("return rc;");
            o.line_at(-1, "}");
        }
        o.line("return 0;");
        o.line_at(-1, "}");
    }

    fn emit_unregister_all(&self, o: &mut TranslatorOutput, probes: &[DerivedProbe]) {
        o.blank();
        o.line("static void unregister_all_probes (void) {");
        o.indent(1);
        for (i, probe) in probes.iter().enumerate().rev() {
            self.emit_deregistrations(o, i, probe);
        }
        o.line_at(-1, "}");
    }

    fn emit_dwarf_entries(&mut self, o: &mut TranslatorOutput, i: usize, v: &ProbeVariant) {
        if !self.fault_handler_emitted {
            emit_fault_handler(o);
            self.fault_handler_emitted = true;
        }

        let probe_array = kprobe_array_name(i);
        let string_array = location_array_name(i);
        let n = v.sites.len();

        // Address array.
        if v.has_return {
            o.line("#ifdef ARCH_SUPPORTS_KRETPROBES");
            o.line(&format!("static struct kretprobe {probe_array}[{n}] = {{"));
        } else {
            o.line(&format!("static struct kprobe {probe_array}[{n}] = {{"));
        }
        o.indent(1);
        for (idx, site) in v.sites.iter().enumerate() {
            let sep = if idx + 1 == n { "" } else { "," };
            if v.has_return {
                o.line(&format!("{{.kp.addr= (void *) {:#x}}}{sep}", site.address));
            } else {
                o.line(&format!("{{.addr= (void *) {:#x}}}{sep}", site.address));
            }
        }
        o.line_at(-1, "};");
        if v.has_return {
            o.line("#endif /* ARCH_SUPPORTS_KRETPROBES */");
        }
        o.blank();

        // Parallel location-string array. The dispatch function recovers
        // its own name by pointer arithmetic on the probe array and
        // indexes this table with the result.
        o.line(&format!("static char const * {string_array}[{n}] = {{"));
        o.indent(1);
        for (idx, site) in v.sites.iter().enumerate() {
            let sep = if idx + 1 == n { "" } else { "," };
            o.line(&format!("{}{sep}", c_quoted(&site.location)));
        }
        o.line_at(-1, "};");
        o.blank();

        // Dispatch function.
        if v.has_return {
            o.line("#ifdef ARCH_SUPPORTS_KRETPROBES");
            o.line(&format!(
                "static int {} (struct kretprobe_instance *probe_instance, struct pt_regs *regs) {{",
                enter_function_name(i)
            ));
        } else {
            o.line(&format!(
                "static int {} (struct kprobe *probe_instance, struct pt_regs *regs) {{",
                enter_function_name(i)
            ));
        }
        o.line_at(1, "struct context *c = & contexts [smp_processor_id()];");
        if v.has_return {
            o.line(&format!(
                "const char* probe_point = {string_array}[(probe_instance->rp - &({probe_array}[0]))];"
            ));
        } else {
            o.line(&format!(
                "const char* probe_point = {string_array}[(probe_instance - &({probe_array}[0]))];"
            ));
        }

        // Preconditions: session running, context free.
        o.line("if (atomic_read (&session_state) != STAP_SESSION_RUNNING)");
        o.line_at(1, "return 0;");
        o.line_at(-1, "if (atomic_inc_return (&c->busy) != 1) {");
        o.line_at(1, "printk (KERN_ERR \"probe reentrancy (%s vs %s)\\n\", c->probe_point, probe_point);");
        o.line("atomic_set (& session_state, STAP_SESSION_ERROR);");
        o.line("atomic_dec (&c->busy);");
        o.line("return 0;");
        o.line_at(-1, "}");
        o.blank();
        o.line("c->last_error = 0;");
        o.line("c->probe_point = probe_point;");
        o.line("c->nesting = 0;");
        o.line("c->regs = regs;");
        o.line("c->actioncount = 0;");

        // NB: locals are initialized by the probe function itself.
        o.line(&format!("probe_{i} (c);"));

        o.line("if (c->last_error && c->last_error[0]) {");
        o.line_at(1, "_stp_error (\"%s near %s\", c->last_error, c->last_stmt);");
        o.line("atomic_set (& session_state, STAP_SESSION_ERROR);");
        o.line_at(-1, "}");
        o.line("atomic_dec (&c->busy);");
        o.line("return 0;");
        o.line_at(-1, "}");
        if v.has_return {
            o.line("#endif /* ARCH_SUPPORTS_KRETPROBES */");
        }
        o.blank();
    }
}

fn emit_dwarf_registrations(o: &mut TranslatorOutput, i: usize, v: &ProbeVariant) {
    let func_name = enter_function_name(i);
    let probe_name = format!("{}[i]", kprobe_array_name(i));

    o.line("{");
    o.line_at(1, "int i;");
    o.line(&format!("for (i = 0; i < {}; i++) {{", v.sites.len()));
    o.indent(1);
    if v.has_return {
        o.line("#ifdef ARCH_SUPPORTS_KRETPROBES");
        o.line(&format!("{probe_name}.handler = &{func_name};"));
        o.line(&format!("{probe_name}.maxactive = 1;"));
        o.line(&format!("rc = register_kretprobe (&({probe_name}));"));
        o.line("#else");
        o.line("rc = 1;");
        o.line("#endif");
    } else {
        o.line(&format!("{probe_name}.pre_handler = &{func_name};"));
        o.line(&format!("{probe_name}.fault_handler = &stap_kprobe_fault_handler;"));
        o.line(&format!("rc = register_kprobe (&({probe_name}));"));
    }
    o.line("if (unlikely (rc)) {");
    o.line_at(1, &format!("probe_point = {}[i];", location_array_name(i)));
    o.line("break;");
    o.line_at(-1, "}");
    o.line_at(-1, "}");

    // One failure rolls back this probe's completed registrations.
    o.line("if (unlikely (rc)) while (--i >= 0)");
    o.indent(1);
    if v.has_return {
        o.line("#ifdef ARCH_SUPPORTS_KRETPROBES");
        o.line(&format!("unregister_kretprobe (&({probe_name}));"));
        o.line("#else");
        o.line(";");
        o.line("#endif");
    } else {
        o.line(&format!("unregister_kprobe (&({probe_name}));"));
    }
    o.line_at(-2, "}");
}

fn emit_dwarf_deregistrations(o: &mut TranslatorOutput, i: usize, v: &ProbeVariant) {
    let probe_name = format!("{}[i]", kprobe_array_name(i));
    o.line("{");
    o.line_at(1, "int i;");
    o.line(&format!("for (i = 0; i < {}; i++)", v.sites.len()));
    o.indent(1);
    if v.has_return {
        o.line("#ifdef ARCH_SUPPORTS_KRETPROBES");
        o.line(&format!("unregister_kretprobe (&({probe_name}));"));
        o.line("#else");
        o.line(";");
        o.line("#endif");
    } else {
        o.line(&format!("unregister_kprobe (&({probe_name}));"));
    }
    o.indent(-1);
    o.line_at(-1, "}");
}

/// Shared fault handler, one per translation unit. Returns zero so the
/// kernel's own handler still runs; claiming the fault could restart the
/// faulting instruction forever.
fn emit_fault_handler(o: &mut TranslatorOutput) {
    o.line("static int stap_kprobe_fault_handler (struct kprobe* kp, struct pt_regs* regs, int trapnr) {");
    o.line_at(1, "struct context *c = & contexts [smp_processor_id()];");
    o.line("printk (KERN_ERR \"probescope probe fault\\n\");");
    o.line("printk (KERN_ERR \"cpu %d, probe %s, near %s\\n\",");
    o.line_at(1, "smp_processor_id(),");
    o.line("c->probe_point ? c->probe_point : \"unknown\",");
    o.line("c->last_stmt ? c->last_stmt : \"unknown\");");
    o.line_at(-1, "c->last_error = \"probe faulted\";");
    o.line("atomic_set (& session_state, STAP_SESSION_ERROR);");
    o.line("return 0;");
    o.line_at(-1, "}");
    o.blank();
}

fn emit_timer_entries(o: &mut TranslatorOutput, i: usize, t: &TimerProbe) {
    o.line(&format!("static struct timer_list timer_{i};"));
    o.line(&format!("static void enter_{i} (unsigned long val) {{"));
    o.line_at(1, "struct context* c = & contexts [smp_processor_id()];");
    o.line(&format!("const char* probe_point = {};", c_quoted(&t.location)));
    o.line("(void) val;");

    o.line("if (atomic_read (&session_state) != STAP_SESSION_RUNNING)");
    o.line_at(1, "return;");
    o.line_at(-1, "if (atomic_inc_return (&c->busy) != 1) {");
    o.line_at(1, "printk (KERN_ERR \"probe reentrancy (%s vs %s)\\n\", c->probe_point, probe_point);");
    o.line("atomic_set (& session_state, STAP_SESSION_ERROR);");
    o.line("atomic_dec (&c->busy);");
    o.line("return;");
    o.line_at(-1, "}");
    o.blank();

    if t.randomize != 0 {
        o.line(&format!(
            "mod_timer (& timer_{i}, jiffies + {} + _stp_random_pm({}));",
            t.interval, t.randomize
        ));
    } else {
        o.line(&format!("mod_timer (& timer_{i}, jiffies + {});", t.interval));
    }

    o.line("c->probe_point = probe_point;");
    o.line("c->last_error = 0;");
    o.line("c->nesting = 0;");
    o.line("c->regs = 0;");
    o.line("c->actioncount = 0;");

    o.line(&format!("probe_{i} (c);"));

    o.line("if (c->last_error && c->last_error[0]) {");
    o.line_at(1, "_stp_error (\"%s near %s\", c->last_error, c->last_stmt);");
    o.line("atomic_set (& session_state, STAP_SESSION_ERROR);");
    o.line_at(-1, "}");
    o.line("atomic_dec (&c->busy);");
    o.line_at(-1, "}");
    o.blank();
}

fn emit_be_entries(o: &mut TranslatorOutput, j: usize, b: &BeProbe) {
    for (i, location) in b.locations.iter().enumerate() {
        o.line(&format!("/* location {i}: {location} */"));
        o.line(&format!("static void enter_{j}_{i} (void);"));
        o.line(&format!("static void enter_{j}_{i} (void) {{"));

        // Begin/end probes run single-threaded, but the per-cpu context
        // is used all the same.
        o.line_at(1, "struct context* c = & contexts [smp_processor_id()];");
        o.line(&format!("const char* probe_point = {};", c_quoted(location)));

        o.line(&format!(
            "if (atomic_read (&session_state) != {})",
            if b.begin { "STAP_SESSION_STARTING" } else { "STAP_SESSION_STOPPING" }
        ));
        o.line_at(1, "return;");
        o.line_at(-1, "if (atomic_inc_return (&c->busy) != 1) {");
        o.line_at(1, "printk (KERN_ERR \"probe reentrancy (%s vs %s)\\n\", c->probe_point, probe_point);");
        o.line("atomic_set (& session_state, STAP_SESSION_ERROR);");
        o.line("atomic_dec (&c->busy);");
        o.line("return;");
        o.line_at(-1, "}");
        o.blank();
        o.line("c->last_error = 0;");
        o.line("c->probe_point = probe_point;");
        o.line("c->nesting = 0;");
        o.line("c->regs = 0;");
        o.line("c->actioncount = 0;");

        o.line(&format!("probe_{j} (c);"));

        o.line("if (c->last_error && c->last_error[0]) {");
        o.line_at(1, "_stp_error (\"%s near %s\", c->last_error, c->last_stmt);");
        o.line("atomic_set (& session_state, STAP_SESSION_ERROR);");
        o.line_at(-1, "}");
        o.line("atomic_dec (&c->busy);");
        o.line_at(-1, "}");
        o.blank();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rewrite::ProbeSite;

    fn variant(addrs: &[u64], has_return: bool) -> ProbeVariant {
        ProbeVariant {
            flavour: String::new(),
            body: Vec::new(),
            has_return,
            sites: addrs
                .iter()
                .map(|&a| ProbeSite {
                    address: a,
                    scope: None,
                    location: format!("kernel.function(\"f_{a:x}\")"),
                    has_return,
                })
                .collect(),
        }
    }

    fn render(probes: &[DerivedProbe]) -> String {
        let mut e = Emitter::new();
        let mut o = TranslatorOutput::new();
        e.emit_all(&mut o, &[], probes);
        o.finish()
    }

    #[test]
    fn entry_probe_uses_kprobes() {
        let out = render(&[DerivedProbe::Dwarf(variant(&[0x4020], false))]);
        assert!(out.contains("static struct kprobe kprobe_array_0[1] = {"));
        assert!(out.contains("{.addr= (void *) 0x4020}"));
        assert!(out.contains("register_kprobe (&(kprobe_array_0[i]));"));
        assert!(out.contains("!= STAP_SESSION_RUNNING"));
        assert!(!out.contains("kretprobe"));
    }

    #[test]
    fn return_probe_uses_kretprobes_behind_arch_guard() {
        let out = render(&[DerivedProbe::Dwarf(variant(&[0x4000], true))]);
        assert!(out.contains("#ifdef ARCH_SUPPORTS_KRETPROBES"));
        assert!(out.contains("static struct kretprobe kprobe_array_0[1] = {"));
        assert!(out.contains("{.kp.addr= (void *) 0x4000}"));
        assert!(out.contains(".maxactive = 1;"));
        assert!(out.contains("probe_instance->rp - &(kprobe_array_0[0])"));
    }

    #[test]
    fn registration_failure_rolls_back_within_array() {
        let out = render(&[DerivedProbe::Dwarf(variant(&[0x1, 0x2, 0x3], false))]);
        assert!(out.contains("for (i = 0; i < 3; i++) {"));
        assert!(out.contains("probe_point = kprobe_names_0[i];"));
        assert!(out.contains("if (unlikely (rc)) while (--i >= 0)"));
        assert!(out.contains("unregister_kprobe (&(kprobe_array_0[i]));"));
    }

    #[test]
    fn location_strings_parallel_the_addresses() {
        let out = render(&[DerivedProbe::Dwarf(variant(&[0xa, 0xb], false))]);
        assert!(out.contains("static char const * kprobe_names_0[2] = {"));
        assert!(out.contains("\"kernel.function(\\\"f_a\\\")\","));
        assert!(out.contains("\"kernel.function(\\\"f_b\\\")\""));
    }

    #[test]
    fn fault_handler_emitted_once_per_translation_unit() {
        let out = render(&[
            DerivedProbe::Dwarf(variant(&[0x1], false)),
            DerivedProbe::Dwarf(variant(&[0x2], false)),
        ]);
        assert_eq!(out.matches("stap_kprobe_fault_handler (struct kprobe* kp").count(), 1);
    }

    #[test]
    fn timer_bounds_are_validated() {
        assert!(matches!(
            TimerProbe::new("timer.jiffies(0)".into(), 0, 0),
            Err(SemanticError::BadTimerInterval)
        ));
        assert!(matches!(
            TimerProbe::new("timer.jiffies(2000000)".into(), 2_000_000, 0),
            Err(SemanticError::BadTimerInterval)
        ));
        assert!(matches!(
            TimerProbe::new("timer.jiffies(100)".into(), 100, 101),
            Err(SemanticError::BadTimerRandomize)
        ));
        assert!(TimerProbe::new("timer.jiffies(100)".into(), 100, 100).is_ok());
    }

    #[test]
    fn timer_builds_from_matched_params() {
        use crate::ast::{Literal, Params};
        let mut params = Params::new();
        params.insert("jiffies".into(), Some(Literal::Num(250)));
        let t = TimerProbe::from_params("timer.jiffies(250)".into(), &params).unwrap();
        assert_eq!(t.interval, 250);
        assert_eq!(t.randomize, 0);

        params.insert("randomize".into(), Some(Literal::Num(50)));
        let t = TimerProbe::from_params("timer.jiffies(250).randomize(50)".into(), &params)
            .unwrap();
        assert_eq!(t.randomize, 50);
    }

    #[test]
    fn timer_rearms_itself_with_perturbation() {
        let t = TimerProbe::new("timer.jiffies(100).randomize(10)".into(), 100, 10).unwrap();
        let out = render(&[DerivedProbe::Timer(t)]);
        assert!(out.contains("mod_timer (& timer_0, jiffies + 100 + _stp_random_pm(10));"));
        assert!(out.contains("init_timer (& timer_0);"));
        assert!(out.contains("del_timer_sync (& timer_0);"));
    }

    #[test]
    fn begin_and_end_gate_on_lifecycle_states() {
        let begin = BeProbe { begin: true, locations: vec!["begin".into()] };
        let end = BeProbe { begin: false, locations: vec!["end".into()] };
        let out = render(&[DerivedProbe::BeginEnd(begin), DerivedProbe::BeginEnd(end)]);
        assert!(out.contains("!= STAP_SESSION_STARTING"));
        assert!(out.contains("!= STAP_SESSION_STOPPING"));
        // The begin probe fires at registration, the end probe at
        // deregistration.
        let reg = out.split("register_all_probes").nth(1).unwrap();
        let reg = reg.split("unregister_all_probes").next().unwrap();
        assert!(reg.contains("enter_0_0 ();"));
        assert!(!reg.contains("enter_1_0 ();"));
        let unreg = out.split("unregister_all_probes").nth(1).unwrap();
        assert!(unreg.contains("enter_1_0 ();"));
    }

    #[test]
    fn accessor_functions_embed_their_code() {
        use crate::ast::{ExpType, FunctionBody, FunctionDecl};
        let f = FunctionDecl {
            name: "get_x_0".into(),
            ty: ExpType::Long,
            formal_args: Vec::new(),
            body: FunctionBody::Embedded("{\n  THIS->__retvalue = 1;\n}".into()),
        };
        let mut e = Emitter::new();
        let mut o = TranslatorOutput::new();
        e.emit_function_decls(&mut o, &[f]);
        let out = o.finish();
        assert!(out.contains("static void function_get_x_0 (struct context* THIS_c) {"));
        assert!(out.contains("THIS->__retvalue = 1;"));
    }
}
