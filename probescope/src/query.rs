//! Probe-point queries against DWARF
//!
//! Interprets one matched pattern's parameter table, drives the debug-info
//! context through modules, CUs, functions, inline instances and line
//! records, and feeds every resolved address into the variant machinery.
//!
//! The decisive property of a pattern is the presence of a line number.
//! With `func@file:line` the line records of the matching source files are
//! visited and each is probed through whichever collected function or
//! inline instance covers its address. Without one, every collected
//! function is probed at its prologue end (entry pc for `.return`) and
//! every inline instance at its entry pc.

use crate::ast::{
    get_number_param, get_string_param, has_null_param, Params, PointComponent, Probe, ProbePoint,
};
use crate::dwarf::{
    CuOffset, DieRef, DwarfContext, FuncInfo, InlineInfo, IterationControl,
};
use crate::error::SemanticError;
use crate::loc;
use crate::rewrite::{AccessorSource, ProbeSite, ProbeVariants};
use crate::session::Session;
use log::debug;
use std::collections::{BTreeMap, BTreeSet};

impl AccessorSource for DwarfContext {
    fn snippet(
        &mut self,
        scope: Option<DieRef>,
        pc: u64,
        local: &str,
        components: &[crate::ast::Component],
        lvalue: bool,
    ) -> Result<loc::AccessorSnippet, SemanticError> {
        loc::stmt_for_local(self, scope, pc, local, components, lvalue)
    }
}

/// How much of `name@file:line` a string selector carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionSpec {
    Alone,
    AndFile,
    FileAndLine,
}

/// Splits a `name[@file[:line]]` selector.
fn parse_function_spec(
    spec: &str,
) -> Result<(FunctionSpec, String, String, i64), SemanticError> {
    let bad = || SemanticError::MalformedSpec(spec.to_string());

    let (function, rest) = match spec.split_once('@') {
        None => {
            if spec.contains(':') {
                return Err(bad());
            }
            return Ok((FunctionSpec::Alone, spec.to_string(), String::new(), 0));
        }
        Some((f, rest)) => (f.to_string(), rest),
    };
    if function.contains(':') || rest.is_empty() {
        return Err(bad());
    }

    match rest.split_once(':') {
        None => Ok((FunctionSpec::AndFile, function, rest.to_string(), 0)),
        Some((file, line)) => {
            if file.is_empty() {
                return Err(bad());
            }
            let line: i64 = line.parse().map_err(|_| bad())?;
            Ok((FunctionSpec::FileAndLine, function, file.to_string(), line))
        }
    }
}

/// One pattern's resolution pass. Holds the reduced parameters, the
/// per-CU function and inline collections, and the accumulating variants.
struct DwarfQuery<'a> {
    sess: &'a mut Session,
    base: &'a Probe,
    variants: ProbeVariants,

    has_kernel: bool,
    has_module: bool,
    module_val: String,
    has_process: bool,

    has_function_str: bool,
    has_function_num: bool,
    function_num_val: u64,
    has_inline_str: bool,
    has_inline_num: bool,
    inline_num_val: u64,
    has_statement_str: bool,
    has_statement_num: bool,
    statement_num_val: u64,

    has_return: bool,
    has_label: bool,
    has_relative: bool,
    has_callees: bool,

    spec_type: FunctionSpec,
    function: String,
    file: String,
    line: i64,

    filtered_srcfiles: BTreeSet<String>,
    filtered_functions: BTreeMap<u64, FuncInfo>,
    filtered_inlines: BTreeMap<u64, InlineInfo>,
}

impl<'a> DwarfQuery<'a> {
    fn new(
        sess: &'a mut Session,
        base: &'a Probe,
        params: &Params,
    ) -> Result<Self, SemanticError> {
        let has_function_str = get_string_param(params, "function").is_some();
        let has_inline_str = get_string_param(params, "inline").is_some();
        let has_statement_str = get_string_param(params, "statement").is_some();

        let spec_val = get_string_param(params, "function")
            .or_else(|| get_string_param(params, "inline"))
            .or_else(|| get_string_param(params, "statement"));
        let (spec_type, function, file, line) = match &spec_val {
            Some(s) => parse_function_spec(s)?,
            None => (FunctionSpec::Alone, String::new(), String::new(), 0),
        };

        Ok(DwarfQuery {
            sess,
            base,
            variants: ProbeVariants::new(),
            has_kernel: has_null_param(params, "kernel"),
            has_module: get_string_param(params, "module").is_some(),
            module_val: get_string_param(params, "module").unwrap_or_default(),
            has_process: get_string_param(params, "process").is_some(),
            has_function_str,
            has_function_num: get_number_param(params, "function").is_some(),
            function_num_val: get_number_param(params, "function").unwrap_or(0) as u64,
            has_inline_str,
            has_inline_num: get_number_param(params, "inline").is_some(),
            inline_num_val: get_number_param(params, "inline").unwrap_or(0) as u64,
            has_statement_str,
            has_statement_num: get_number_param(params, "statement").is_some(),
            statement_num_val: get_number_param(params, "statement").unwrap_or(0) as u64,
            has_return: has_null_param(params, "return"),
            has_label: get_string_param(params, "label").is_some(),
            has_relative: get_number_param(params, "relative").is_some(),
            has_callees: has_null_param(params, "callees")
                || get_number_param(params, "callees").is_some(),
            spec_type,
            function,
            file,
            line,
            filtered_srcfiles: BTreeSet::new(),
            filtered_functions: BTreeMap::new(),
            filtered_inlines: BTreeMap::new(),
        })
    }

    fn numeric_selector(&self) -> Option<u64> {
        if self.has_function_num {
            Some(self.function_num_val)
        } else if self.has_inline_num {
            Some(self.inline_num_val)
        } else if self.has_statement_num {
            Some(self.statement_num_val)
        } else {
            None
        }
    }

    // ---- module level ---------------------------------------------------

    fn query_module(
        &mut self,
        dw: &mut DwarfContext,
        idx: usize,
    ) -> Result<IterationControl, SemanticError> {
        dw.focus_on_module(idx);

        // Skip modules the pattern rules out.
        if self.has_kernel && !dw.module_name_matches("kernel") {
            return Ok(IterationControl::Continue);
        }
        if self.has_module && !dw.module_name_matches(&self.module_val) {
            return Ok(IterationControl::Continue);
        }

        debug!(
            "focused on module '{}' = [{:#x}-{:#x}]",
            dw.module_name(),
            dw.module_start(),
            dw.module_end()
        );

        if let Some(addr) = self.numeric_selector() {
            // module("foo").function(0xbeef) and friends: the address is
            // relative to the module start. Global addresses under
            // `kernel` bypass module iteration entirely.
            assert!(!self.has_kernel && self.has_module);
            let global = dw.module_address_to_global(addr);
            if let Some(cu) = dw.cu_containing_global_address(global)? {
                self.query_cu(dw, cu)?;
            }
            Ok(IterationControl::Continue)
        } else {
            assert!(self.has_function_str || self.has_inline_str || self.has_statement_str);
            self.iterate_cus_recording(dw)?;

            // Once the module "kernel" has been processed for a kernel
            // pattern there is nothing further to scan.
            if self.has_kernel && dw.module_name_matches("kernel") {
                Ok(IterationControl::Abort)
            } else {
                Ok(IterationControl::Continue)
            }
        }
    }

    /// CU sweep with per-CU error recording: one failing CU aborts this
    /// module's scan but the failure stays on the session error list.
    fn iterate_cus_recording(&mut self, dw: &mut DwarfContext) -> Result<(), SemanticError> {
        let mut deferred = None;
        dw.iterate_cus(false, |dw, cu| match self.query_cu(dw, cu) {
            Ok(()) => Ok(IterationControl::Continue),
            Err(e) => {
                deferred = Some(e);
                Ok(IterationControl::Abort)
            }
        })?;
        if let Some(e) = deferred {
            self.sess.record_error(&self.base.point.to_string(), &e);
        }
        Ok(())
    }

    // ---- CU level -------------------------------------------------------

    fn query_cu(&mut self, dw: &mut DwarfContext, cu: CuOffset) -> Result<(), SemanticError> {
        dw.focus_on_cu(cu)?;

        if self.has_statement_str
            || self.has_inline_str
            || self.has_inline_num
            || self.has_function_str
            || self.has_function_num
        {
            self.filtered_srcfiles.clear();
            self.filtered_functions.clear();
            self.filtered_inlines.clear();

            if (self.has_statement_str || self.has_function_str || self.has_inline_str)
                && self.spec_type != FunctionSpec::Alone
            {
                // A pattern with a filename elaborates the srcfile mask
                // first; a CU with no matching file is skipped outright.
                self.filtered_srcfiles = dw.collect_srcfiles_matching(&self.file)?;
                if self.filtered_srcfiles.is_empty() {
                    return Ok(());
                }
            }

            // Pick up [entrypc, name, DIE] tuples for every matching
            // function, then fill in their prologue ends in one pass.
            let mut failure = None;
            dw.iterate_functions(|dw, die| match self.query_dwarf_func(dw, die) {
                Ok(ctrl) => Ok(ctrl),
                Err(e) => {
                    failure = Some(e);
                    Ok(IterationControl::Abort)
                }
            })?;
            if let Some(e) = failure {
                return Err(e);
            }
            if !self.filtered_functions.is_empty() {
                dw.resolve_prologue_endings(&mut self.filtered_functions)?;
            }

            if (self.has_statement_str || self.has_function_str || self.has_inline_str)
                && self.spec_type == FunctionSpec::FileAndLine
            {
                // A target line means looking at line records in every
                // matched source file.
                for srcfile in self.filtered_srcfiles.clone() {
                    let need_unique = self.has_statement_str;
                    let line = self.line;
                    let result = dw.iterate_srcfile_lines(
                        &srcfile,
                        line,
                        need_unique,
                        |dw, addr| {
                            self.query_srcfile_line(dw, addr);
                            Ok(())
                        },
                    );
                    if let Err(e) = result {
                        // An ambiguous line drops this probe with advice;
                        // other srcfiles may still resolve.
                        self.sess.record_error(&self.base.point.to_string(), &e);
                    }
                }
            } else {
                if self.has_statement_str || self.has_function_str || self.has_function_num {
                    for (entrypc, fi) in self.filtered_functions.clone() {
                        self.query_func_info(dw, entrypc, &fi);
                    }
                }
                if self.has_statement_str || self.has_inline_str || self.has_inline_num {
                    for (entrypc, ii) in self.filtered_inlines.clone() {
                        self.query_inline_instance_info(dw, entrypc, &ii);
                    }
                }
            }
        } else {
            // A statement number needs no scanning; probe it directly.
            assert!(self.has_statement_num);
            let mut addr = self.statement_num_val;
            if self.has_module {
                addr = dw.module_address_to_global(addr);
            }
            self.query_statement(dw, "", "", -1, None, addr);
        }
        Ok(())
    }

    // ---- function level -------------------------------------------------

    fn query_dwarf_func(
        &mut self,
        dw: &mut DwarfContext,
        die: DieRef,
    ) -> Result<IterationControl, SemanticError> {
        if self.has_callees {
            return Err(SemanticError::Incomplete("callees".into()));
        }
        if self.has_label {
            return Err(SemanticError::Incomplete("label".into()));
        }

        dw.focus_on_function(die)?;

        if dw.func_is_inline()?
            && (((self.has_statement_str || self.has_inline_str)
                && dw.function_name_matches(&self.function))
                || self.has_inline_num)
        {
            debug!("checking instances of inline {}", dw.function_name());
            let mut failure = None;
            dw.iterate_inline_instances(|dw, idie| {
                match self.query_dwarf_inline_instance(dw, idie) {
                    Ok(()) => Ok(IterationControl::Continue),
                    Err(e) => {
                        failure = Some(e);
                        Ok(IterationControl::Abort)
                    }
                }
            })?;
            if let Some(e) = failure {
                return Err(e);
            }
        } else if !dw.func_is_inline()? {
            let record_this_function = if (self.has_statement_str || self.has_function_str)
                && dw.function_name_matches(&self.function)
            {
                true
            } else if self.has_function_num {
                // Numeric selectors arrive in module space on both the
                // kernel and module paths.
                dw.die_has_pc(die, self.function_num_val)?
            } else {
                false
            };

            if record_this_function {
                debug!("selected function {}", dw.function_name());
                let entrypc = dw
                    .function_entrypc()?
                    .ok_or_else(|| SemanticError::NoEntryPc(dw.function_name().to_string()))?;
                let (decl_file, decl_line) = dw.function_decl()?;
                self.filtered_functions.insert(
                    entrypc,
                    FuncInfo {
                        name: dw.function_name().to_string(),
                        decl_file,
                        decl_line,
                        die,
                        prologue_end: 0,
                    },
                );
            }
        }
        Ok(IterationControl::Continue)
    }

    fn query_dwarf_inline_instance(
        &mut self,
        dw: &mut DwarfContext,
        die: DieRef,
    ) -> Result<(), SemanticError> {
        let record_this_inline = if self.has_inline_str || self.has_statement_str {
            true
        } else if self.has_inline_num {
            dw.die_has_pc(die, self.inline_num_val)?
        } else {
            false
        };

        if record_this_inline {
            debug!("selected inline instance of {}", dw.function_name());
            if let Some(entrypc) = dw.die_entrypc(die)? {
                let (decl_file, decl_line) = dw.function_decl()?;
                self.filtered_inlines.insert(
                    entrypc,
                    InlineInfo {
                        name: dw.function_name().to_string(),
                        decl_file,
                        decl_line,
                        die,
                    },
                );
            }
        }
        Ok(())
    }

    // ---- statement level ------------------------------------------------

    /// Visits one line record address (module space): probe whichever
    /// collected function or inline instance covers it.
    fn query_srcfile_line(&mut self, dw: &mut DwarfContext, addr: u64) {
        for (entrypc, fi) in self.filtered_functions.clone() {
            match dw.die_has_pc(fi.die, addr) {
                Ok(true) => {
                    if self.has_statement_str {
                        let global = dw.module_address_to_global(addr);
                        self.query_statement(dw, &fi.name, &fi.decl_file, self.line, None, global);
                    } else {
                        self.query_func_info(dw, entrypc, &fi);
                    }
                }
                Ok(false) => {}
                Err(e) => self.sess.record_error(&self.base.point.to_string(), &e),
            }
        }
        for (entrypc, ii) in self.filtered_inlines.clone() {
            match dw.die_has_pc(ii.die, addr) {
                Ok(true) => {
                    if self.has_statement_str {
                        let global = dw.module_address_to_global(addr);
                        self.query_statement(dw, &ii.name, &ii.decl_file, self.line, None, global);
                    } else {
                        self.query_inline_instance_info(dw, entrypc, &ii);
                    }
                }
                Ok(false) => {}
                Err(e) => self.sess.record_error(&self.base.point.to_string(), &e),
            }
        }
    }

    fn query_func_info(&mut self, dw: &mut DwarfContext, entrypc: u64, fi: &FuncInfo) {
        if self.has_return {
            // Return probes anchor at the entry pc; registration emits a
            // kretprobe for them.
            debug!("querying entrypc of function '{}' for return probe", fi.name);
            let global = dw.module_address_to_global(entrypc);
            self.query_statement(dw, &fi.name, &fi.decl_file, fi.decl_line, Some(fi.die), global);
        } else {
            debug!("querying prologue-end of function '{}'", fi.name);
            if fi.prologue_end == 0 {
                self.sess.record_error(
                    &self.base.point.to_string(),
                    &SemanticError::NoPrologueEnd(fi.name.clone()),
                );
                return;
            }
            let global = dw.module_address_to_global(fi.prologue_end);
            self.query_statement(dw, &fi.name, &fi.decl_file, fi.decl_line, Some(fi.die), global);
        }
    }

    fn query_inline_instance_info(
        &mut self,
        dw: &mut DwarfContext,
        entrypc: u64,
        ii: &InlineInfo,
    ) {
        if self.has_return {
            self.sess.record_error(
                &self.base.point.to_string(),
                &SemanticError::ReturnOnInline(ii.name.clone()),
            );
            return;
        }
        debug!("querying entrypc {entrypc:#x} of instance of inline '{}'", ii.name);
        let global = dw.module_address_to_global(entrypc);
        self.query_statement(dw, &ii.name, &ii.decl_file, ii.decl_line, Some(ii.die), global);
    }

    fn query_statement(
        &mut self,
        dw: &mut DwarfContext,
        func: &str,
        file: &str,
        line: i64,
        scope: Option<DieRef>,
        global_addr: u64,
    ) {
        if self.has_relative {
            self.sess.record_error(
                &self.base.point.to_string(),
                &SemanticError::Incomplete("relative".into()),
            );
            return;
        }
        if let Err(e) = self.add_probe_point(dw, func, file, line, scope, global_addr) {
            self.sess.record_error(&self.base.point.to_string(), &e);
        }
    }

    // ---- site admission -------------------------------------------------

    fn add_probe_point(
        &mut self,
        dw: &mut DwarfContext,
        funcname: &str,
        filename: &str,
        line: i64,
        scope: Option<DieRef>,
        global_addr: u64,
    ) -> Result<(), SemanticError> {
        // Addresses inside .init.* sections are unmapped once the kernel
        // finishes booting; such a site is quietly ignored.
        let rel_addr = dw.global_address_to_module(global_addr);
        if dw.address_in_init_section(rel_addr)? {
            debug!(
                "skipping function '{funcname}' base {global_addr:#x}: within an .init. section"
            );
            return Ok(());
        }

        if dw.module_name() != "kernel" {
            self.sess.pin_module(dw.module_name())?;
        }

        let location = self.site_name(dw, funcname, filename, line);
        let site = ProbeSite {
            address: global_addr,
            scope,
            location,
            has_return: self.has_return,
        };
        self.variants.add_site(
            self.sess,
            dw,
            &self.base.body,
            scope,
            rel_addr,
            site,
            self.has_return,
        )
    }

    /// Reconstructs a concrete probe point naming this site, used in the
    /// emitted location-string arrays and in diagnostics.
    fn site_name(&self, dw: &DwarfContext, funcname: &str, filename: &str, line: i64) -> String {
        let mut comps = Vec::new();
        if dw.module_name() == "kernel" {
            comps.push(PointComponent::plain("kernel"));
        } else {
            comps.push(PointComponent::with_str("module", dw.module_name()));
        }

        let fn_or_stmt = if self.has_function_str || self.has_function_num {
            "function"
        } else if self.has_inline_str || self.has_inline_num {
            "inline"
        } else {
            "statement"
        };

        if self.has_function_str || self.has_inline_str || self.has_statement_str {
            let mut retro_name = funcname.to_string();
            if !filename.is_empty() {
                retro_name.push('@');
                retro_name.push_str(filename);
                if line != -1 {
                    retro_name.push(':');
                    retro_name.push_str(&line.to_string());
                }
            }
            comps.push(PointComponent::with_str(fn_or_stmt, &retro_name));
        } else if let Some(addr) = self.numeric_selector() {
            comps.push(PointComponent::with_num(fn_or_stmt, addr as i64));
        }

        if self.has_return {
            comps.push(PointComponent::plain("return"));
        }

        ProbePoint::new(comps).to_string()
    }
}

/// Resolves one dwarf-family pattern into probe variants. Per-probe
/// failures are recorded on the session; the returned variants carry the
/// sites that did resolve.
pub fn build(
    sess: &mut Session,
    dw: &mut DwarfContext,
    probe: &Probe,
    params: &Params,
) -> Result<ProbeVariants, SemanticError> {
    let mut q = DwarfQuery::new(sess, probe, params)?;

    if q.has_process {
        // The process axis is reserved; the pattern table leaves it
        // unbound, so getting here means the front end is ahead of us.
        return Err(SemanticError::Incomplete("process".into()));
    }

    if q.has_kernel && q.numeric_selector().is_some() {
        // kernel.function(0xbeef) and friends carry a global address; seek
        // the module and CU directly.
        let addr = q.numeric_selector().unwrap_or(0);
        if dw.focus_on_module_containing_global_address(addr) {
            if let Some(cu) = dw.cu_containing_global_address(addr)? {
                q.query_cu(dw, cu)?;
            }
        }
    } else {
        dw.iterate_modules(|dw, idx| {
            let ctrl = match q.query_module(dw, idx) {
                Ok(ctrl) => ctrl,
                Err(e) => {
                    q.sess.record_error(&q.base.point.to_string(), &e);
                    IterationControl::Abort
                }
            };
            Ok(ctrl)
        })?;
    }

    Ok(q.variants)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_spec_forms_parse() {
        assert_eq!(
            parse_function_spec("sys_read").unwrap(),
            (FunctionSpec::Alone, "sys_read".into(), String::new(), 0)
        );
        assert_eq!(
            parse_function_spec("tcp_sendmsg@net/ipv4/tcp.c").unwrap(),
            (FunctionSpec::AndFile, "tcp_sendmsg".into(), "net/ipv4/tcp.c".into(), 0)
        );
        assert_eq!(
            parse_function_spec("*@net/tcp.c:101").unwrap(),
            (FunctionSpec::FileAndLine, "*".into(), "net/tcp.c".into(), 101)
        );
    }

    #[test]
    fn malformed_specs_are_rejected() {
        for bad in ["a:b", "name@", "name@file:xyz", "na:me@file.c"] {
            assert!(
                matches!(parse_function_spec(bad), Err(SemanticError::MalformedSpec(_))),
                "'{bad}' should be malformed"
            );
        }
    }
}
