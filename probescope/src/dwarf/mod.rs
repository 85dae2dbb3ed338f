//! DWARF views over the kernel and its loadable modules
//!
//! `DwarfContext` carries the open debug-info session and a movable focus
//! (current module, compilation unit, function). Iteration methods collect
//! stable identifiers first and then hand the context back to the callback
//! refocused, so callbacks are free to drill further down.
//!
//! Address convention: everything at this surface is in *module space*
//! (the raw addresses found in a module's DWARF). The kernel proper loads
//! at base zero, so its module space and the global kernel space coincide;
//! for loadable modules `module_address_to_global` applies the load base.
//! DIEs are never held as borrowed handles: a [`DieRef`] records the CU
//! and DIE offsets needed to re-resolve the entry on demand.

pub mod image;
pub mod lines;

use crate::error::SemanticError;
use gimli::AttributeValue;
use gimli::Reader as _;
use image::{LoadedDwarf, ModuleImage, Reader, Section};
use lines::LineRow;
use log::{debug, warn};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::rc::Rc;

pub type CuOffset = gimli::DebugInfoOffset<usize>;
pub type DieOffset = gimli::UnitOffset<usize>;

/// Re-resolvable handle to a debugging information entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DieRef {
    pub cu: CuOffset,
    pub die: DieOffset,
}

impl Default for DieRef {
    fn default() -> Self {
        DieRef { cu: gimli::DebugInfoOffset(0), die: gimli::UnitOffset(0) }
    }
}

/// A concrete (out-of-line) function selected by a query.
#[derive(Debug, Clone, Default)]
pub struct FuncInfo {
    pub name: String,
    pub decl_file: String,
    pub decl_line: i64,
    pub die: DieRef,
    pub prologue_end: u64,
}

/// One inline-expansion instance of an inlined function.
#[derive(Debug, Clone, Default)]
pub struct InlineInfo {
    pub name: String,
    pub decl_file: String,
    pub decl_line: i64,
    pub die: DieRef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Kernel,
    UserProcess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationControl {
    Continue,
    Abort,
}

#[derive(Clone)]
struct FunctionFocus {
    die: DieRef,
    name: String,
}

pub struct DwarfContext {
    pub verbose: bool,
    kind: SessionKind,
    modules: Vec<ModuleImage>,
    cur_module: Option<usize>,
    cur_cu: Option<CuOffset>,
    cur_cu_name: String,
    cur_func: Option<FunctionFocus>,
    line_cache: HashMap<(usize, usize), Rc<Vec<LineRow>>>,
}

impl DwarfContext {
    /// Opens a debug-info session. For the kernel this reports the kernel
    /// image and every loaded module; failure to locate the kernel image
    /// is fatal. The user-process case is reserved and reports nothing.
    pub fn open(kind: SessionKind, verbose: bool) -> Result<Self, SemanticError> {
        let modules = match kind {
            SessionKind::Kernel => image::report_kernel()?,
            SessionKind::UserProcess => Vec::new(),
        };
        Ok(DwarfContext {
            verbose,
            kind,
            modules,
            cur_module: None,
            cur_cu: None,
            cur_cu_name: String::new(),
            cur_func: None,
            line_cache: HashMap::new(),
        })
    }

    #[must_use]
    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    #[must_use]
    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    // ---- focus management ----------------------------------------------

    pub fn focus_on_module(&mut self, idx: usize) {
        assert!(idx < self.modules.len());
        self.cur_module = Some(idx);
        self.cur_cu = None;
        self.cur_cu_name.clear();
        self.cur_func = None;
    }

    /// Focuses the module whose load range covers the global address.
    /// Falls back to the kernel image, which spans everything not claimed
    /// by a loadable module. Returns false when nothing is loaded.
    pub fn focus_on_module_containing_global_address(&mut self, addr: u64) -> bool {
        if let Some(idx) = self
            .modules
            .iter()
            .position(|m| !m.is_kernel() && addr >= m.start && addr < m.end)
        {
            self.focus_on_module(idx);
            return true;
        }
        if let Some(idx) = self.modules.iter().position(ModuleImage::is_kernel) {
            self.focus_on_module(idx);
            return true;
        }
        false
    }

    fn focused(&self) -> &ModuleImage {
        &self.modules[self.cur_module.expect("no module focused")]
    }

    #[must_use]
    pub fn module_name(&self) -> &str {
        &self.focused().name
    }

    #[must_use]
    pub fn module_start(&self) -> u64 {
        self.focused().start
    }

    #[must_use]
    pub fn module_end(&self) -> u64 {
        self.focused().end
    }

    pub fn focus_on_cu(&mut self, cu: CuOffset) -> Result<(), SemanticError> {
        let name = self.with_cu(cu, |_, unit| {
            Ok(match &unit.name {
                Some(n) => n.to_string_lossy()?.into_owned(),
                None => String::new(),
            })
        })?;
        self.cur_cu = Some(cu);
        self.cur_cu_name = name;
        self.cur_func = None;
        Ok(())
    }

    #[must_use]
    pub fn cu_name(&self) -> &str {
        &self.cur_cu_name
    }

    #[must_use]
    pub fn cu_offset(&self) -> Option<CuOffset> {
        self.cur_cu
    }

    pub fn focus_on_function(&mut self, die: DieRef) -> Result<(), SemanticError> {
        let name = self
            .with_cu(die.cu, |ld, unit| die_name(ld, unit, die.die))?
            .unwrap_or_default();
        self.cur_func = Some(FunctionFocus { die, name });
        Ok(())
    }

    #[must_use]
    pub fn function_name(&self) -> &str {
        self.cur_func.as_ref().map_or("", |f| f.name.as_str())
    }

    #[must_use]
    pub fn function_die(&self) -> DieRef {
        self.cur_func.as_ref().expect("no function focused").die
    }

    // ---- pattern matching ----------------------------------------------

    fn glob_matches(&self, pattern: &str, name: &str, what: &str) -> bool {
        let matched = match glob::Pattern::new(pattern) {
            Ok(p) => p.matches(name),
            Err(e) => {
                debug!("bad {what} pattern '{pattern}': {e}");
                false
            }
        };
        if matched && self.verbose {
            debug!("pattern '{pattern}' matches {what} '{name}'");
        }
        matched
    }

    #[must_use]
    pub fn module_name_matches(&self, pattern: &str) -> bool {
        self.glob_matches(pattern, self.module_name(), "module")
    }

    #[must_use]
    pub fn cu_name_matches(&self, pattern: &str) -> bool {
        self.glob_matches(pattern, &self.cur_cu_name, "CU")
    }

    #[must_use]
    pub fn function_name_matches(&self, pattern: &str) -> bool {
        self.glob_matches(pattern, self.function_name(), "function")
    }

    // ---- address translation -------------------------------------------

    #[must_use]
    pub fn module_address_to_global(&self, addr: u64) -> u64 {
        if self.focused().is_kernel() {
            addr
        } else {
            addr + self.module_start()
        }
    }

    #[must_use]
    pub fn global_address_to_module(&self, addr: u64) -> u64 {
        if self.focused().is_kernel() {
            addr
        } else {
            addr - self.module_start()
        }
    }

    // ---- debug info access ---------------------------------------------

    /// Lazily loads the focused module's debug info. With `required`, a
    /// module without usable debuginfo is a hard error; otherwise it is
    /// reported once and skipped.
    pub fn get_module_dwarf(
        &mut self,
        required: bool,
    ) -> Result<Option<Rc<LoadedDwarf>>, SemanticError> {
        let idx = self.cur_module.expect("no module focused");
        match self.modules[idx].dwarf() {
            Some(d) => Ok(Some(d)),
            None => {
                let what = if self.modules[idx].is_kernel() {
                    "kernel".to_string()
                } else {
                    format!("module {}", self.modules[idx].name)
                };
                if required {
                    Err(SemanticError::MissingDebuginfo(what))
                } else {
                    warn!("cannot find {what} debuginfo");
                    Ok(None)
                }
            }
        }
    }

    fn require_dwarf(&mut self) -> Result<Rc<LoadedDwarf>, SemanticError> {
        match self.get_module_dwarf(true)? {
            Some(d) => Ok(d),
            None => unreachable!("get_module_dwarf(true) returned no handle"),
        }
    }

    /// Runs `f` with the unit at `cu` of the focused module.
    pub fn with_cu<T>(
        &mut self,
        cu: CuOffset,
        f: impl FnOnce(&LoadedDwarf, &gimli::Unit<Reader>) -> Result<T, SemanticError>,
    ) -> Result<T, SemanticError> {
        let ld = self.require_dwarf()?;
        let header = ld.dwarf.debug_info.header_from_offset(cu)?;
        let unit = ld.dwarf.unit(header)?;
        f(&ld, &unit)
    }

    /// Sections of the focused module's image, for address classification.
    pub fn module_sections(&mut self) -> Result<Vec<Section>, SemanticError> {
        Ok(self.require_dwarf()?.sections.clone())
    }

    // ---- iteration ------------------------------------------------------

    /// Visits every reported module. The callback receives the context and
    /// the module index; it decides whether to focus.
    pub fn iterate_modules(
        &mut self,
        mut f: impl FnMut(&mut Self, usize) -> Result<IterationControl, SemanticError>,
    ) -> Result<(), SemanticError> {
        for idx in 0..self.modules.len() {
            if f(self, idx)? == IterationControl::Abort {
                break;
            }
        }
        Ok(())
    }

    /// Visits every compilation unit of the focused module.
    pub fn iterate_cus(
        &mut self,
        required: bool,
        mut f: impl FnMut(&mut Self, CuOffset) -> Result<IterationControl, SemanticError>,
    ) -> Result<(), SemanticError> {
        let Some(ld) = self.get_module_dwarf(required)? else {
            return Ok(());
        };
        let mut offsets = Vec::new();
        let mut units = ld.dwarf.units();
        while let Some(header) = units.next()? {
            if let gimli::UnitSectionOffset::DebugInfoOffset(off) = header.offset() {
                offsets.push(off);
            }
        }
        drop(ld);
        for off in offsets {
            if f(self, off)? == IterationControl::Abort {
                break;
            }
        }
        Ok(())
    }

    /// Finds the CU whose code ranges cover a global address.
    pub fn cu_containing_global_address(
        &mut self,
        addr: u64,
    ) -> Result<Option<CuOffset>, SemanticError> {
        let rel = self.global_address_to_module(addr);
        let ld = self.require_dwarf()?;
        let mut units = ld.dwarf.units();
        while let Some(header) = units.next()? {
            let gimli::UnitSectionOffset::DebugInfoOffset(off) = header.offset() else {
                continue;
            };
            let unit = ld.dwarf.unit(header)?;
            let mut cursor = unit.entries();
            let Some((_, root)) = cursor.next_dfs()? else {
                continue;
            };
            let mut ranges = ld.dwarf.die_ranges(&unit, root)?;
            while let Some(range) = ranges.next()? {
                if rel >= range.begin && rel < range.end {
                    return Ok(Some(off));
                }
            }
        }
        Ok(None)
    }

    /// Visits the top-level function DIEs of the focused CU.
    pub fn iterate_functions(
        &mut self,
        mut f: impl FnMut(&mut Self, DieRef) -> Result<IterationControl, SemanticError>,
    ) -> Result<(), SemanticError> {
        let cu = self.cur_cu.expect("no CU focused");
        let offsets = self.with_cu(cu, |_, unit| {
            let mut out = Vec::new();
            let mut tree = unit.entries_tree(None)?;
            let root = tree.root()?;
            let mut children = root.children();
            while let Some(node) = children.next()? {
                if node.entry().tag() == gimli::DW_TAG_subprogram {
                    out.push(node.entry().offset());
                }
            }
            Ok(out)
        })?;
        for off in offsets {
            if f(self, DieRef { cu, die: off })? == IterationControl::Abort {
                break;
            }
        }
        Ok(())
    }

    /// True when the focused function is an abstract inline definition.
    pub fn func_is_inline(&mut self) -> Result<bool, SemanticError> {
        let die = self.function_die();
        self.with_cu(die.cu, |_, unit| {
            let entry = unit.entry(die.die)?;
            match entry.attr_value(gimli::DW_AT_inline)? {
                Some(AttributeValue::Inline(inl)) => Ok(inl == gimli::DW_INL_inlined
                    || inl == gimli::DW_INL_declared_inlined),
                Some(AttributeValue::Udata(v)) => Ok(v == 1 || v == 3),
                _ => Ok(false),
            }
        })
    }

    /// Visits every inline-expansion instance of the focused function.
    /// Precondition: `func_is_inline()`.
    pub fn iterate_inline_instances(
        &mut self,
        mut f: impl FnMut(&mut Self, DieRef) -> Result<IterationControl, SemanticError>,
    ) -> Result<(), SemanticError> {
        let origin = self.function_die();
        let offsets = self.with_cu(origin.cu, |_, unit| {
            let mut out = Vec::new();
            let mut cursor = unit.entries();
            while let Some((_, entry)) = cursor.next_dfs()? {
                if entry.tag() != gimli::DW_TAG_inlined_subroutine {
                    continue;
                }
                if let Some(AttributeValue::UnitRef(o)) =
                    entry.attr_value(gimli::DW_AT_abstract_origin)?
                {
                    if o == origin.die {
                        out.push(entry.offset());
                    }
                }
            }
            Ok(out)
        })?;
        for off in offsets {
            if f(self, DieRef { cu: origin.cu, die: off })? == IterationControl::Abort {
                break;
            }
        }
        Ok(())
    }

    // ---- per-DIE queries ------------------------------------------------

    /// Preferred probe address of a DIE: the entry pc when recorded,
    /// otherwise the low pc.
    pub fn die_entrypc(&mut self, die: DieRef) -> Result<Option<u64>, SemanticError> {
        self.with_cu(die.cu, |ld, unit| {
            let entry = unit.entry(die.die)?;
            if let Some(av) = entry.attr_value(gimli::DW_AT_entry_pc)? {
                if let Some(addr) = ld.dwarf.attr_address(unit, av)? {
                    return Ok(Some(addr));
                }
            }
            if let Some(av) = entry.attr_value(gimli::DW_AT_low_pc)? {
                return Ok(ld.dwarf.attr_address(unit, av)?);
            }
            Ok(None)
        })
    }

    pub fn function_entrypc(&mut self) -> Result<Option<u64>, SemanticError> {
        let die = self.function_die();
        self.die_entrypc(die)
    }

    /// True when `pc` (module space) falls inside the DIE's code ranges.
    pub fn die_has_pc(&mut self, die: DieRef, pc: u64) -> Result<bool, SemanticError> {
        self.with_cu(die.cu, |ld, unit| {
            let entry = unit.entry(die.die)?;
            let mut ranges = ld.dwarf.die_ranges(unit, &entry)?;
            while let Some(range) = ranges.next()? {
                if pc >= range.begin && pc < range.end {
                    return Ok(true);
                }
            }
            Ok(false)
        })
    }

    /// Declaration file and line of the focused function, when recorded.
    pub fn function_decl(&mut self) -> Result<(String, i64), SemanticError> {
        let die = self.function_die();
        self.with_cu(die.cu, |ld, unit| {
            let entry = unit.entry(die.die)?;
            let file = match decl_file_index(&entry)? {
                Some(idx) => match &unit.line_program {
                    Some(program) => {
                        let header = program.header();
                        match header.file(idx) {
                            Some(file) => {
                                lines::file_entry_name(&ld.dwarf, unit, header, file)?
                            }
                            None => String::new(),
                        }
                    }
                    None => String::new(),
                },
                None => String::new(),
            };
            let line = match entry.attr_value(gimli::DW_AT_decl_line)? {
                Some(AttributeValue::Udata(l)) => l as i64,
                _ => -1,
            };
            Ok((file, line))
        })
    }

    // ---- line tables ----------------------------------------------------

    /// Line rows of the focused CU, cached per (module, CU).
    pub fn cu_line_rows(&mut self) -> Result<Rc<Vec<LineRow>>, SemanticError> {
        let module = self.cur_module.expect("no module focused");
        let cu = self.cur_cu.expect("no CU focused");
        if let Some(rows) = self.line_cache.get(&(module, cu.0)) {
            return Ok(Rc::clone(rows));
        }
        let rows = self.with_cu(cu, |ld, unit| lines::collect_line_rows(ld, unit))?;
        let rows = Rc::new(rows);
        self.line_cache.insert((module, cu.0), Rc::clone(&rows));
        Ok(rows)
    }

    /// Source files of the focused CU matching a filename glob.
    pub fn collect_srcfiles_matching(
        &mut self,
        pattern: &str,
    ) -> Result<BTreeSet<String>, SemanticError> {
        let rows = self.cu_line_rows()?;
        let mut out = BTreeSet::new();
        for row in rows.iter() {
            if out.contains(row.file.as_ref()) {
                continue;
            }
            if self.glob_matches(pattern, &row.file, "source file") {
                out.insert(row.file.to_string());
            }
        }
        Ok(out)
    }

    /// Visits each address carrying a line record for `srcfile`:`lineno`.
    /// With `need_unique`, more than one address is an error whose message
    /// suggests nearby single-address lines.
    pub fn iterate_srcfile_lines(
        &mut self,
        srcfile: &str,
        lineno: i64,
        need_unique: bool,
        mut f: impl FnMut(&mut Self, u64) -> Result<(), SemanticError>,
    ) -> Result<(), SemanticError> {
        let rows = self.cu_line_rows()?;
        let addrs = lines::addresses_for_line(&rows, srcfile, lineno);
        if need_unique && addrs.len() > 1 {
            let advice = lines::nearby_single_line_advice(&rows, srcfile, lineno);
            return Err(SemanticError::AmbiguousLine {
                file: srcfile.to_string(),
                line: lineno,
                advice,
            });
        }
        for addr in addrs {
            f(self, addr)?;
        }
        Ok(())
    }

    /// Fills in prologue ends for the collected functions using both
    /// heuristics; the second overrides the first where they disagree.
    pub fn resolve_prologue_endings(
        &mut self,
        funcs: &mut BTreeMap<u64, FuncInfo>,
    ) -> Result<(), SemanticError> {
        let rows = self.cu_line_rows()?;
        lines::resolve_prologue_endings(&rows, funcs);
        lines::resolve_prologue_endings2(&rows, funcs, self.verbose);
        Ok(())
    }

    // ---- section classification -----------------------------------------

    /// True when a module-space address lies in a section whose name
    /// begins with `.init.`; such code is discarded after boot and cannot
    /// be probed.
    pub fn address_in_init_section(&mut self, module_addr: u64) -> Result<bool, SemanticError> {
        let sections = self.module_sections()?;
        Ok(addr_in_init_section(&sections, module_addr))
    }
}

/// Pure form of the `.init.` classification, shared with tests.
#[must_use]
pub fn addr_in_init_section(sections: &[Section], rel_addr: u64) -> bool {
    sections.iter().any(|s| {
        s.name.starts_with(".init.") && rel_addr >= s.addr && rel_addr < s.addr + s.size
    })
}

/// DW_AT_name of a DIE, following abstract origin and specification links
/// the way the original declaration would be consulted.
pub(crate) fn die_name(
    ld: &LoadedDwarf,
    unit: &gimli::Unit<Reader>,
    die: DieOffset,
) -> Result<Option<String>, SemanticError> {
    let mut off = die;
    for _ in 0..8 {
        let entry = unit.entry(off)?;
        if let Some(av) = entry.attr_value(gimli::DW_AT_name)? {
            return Ok(Some(ld.dwarf.attr_string(unit, av)?.to_string_lossy()?.into_owned()));
        }
        let link = entry
            .attr_value(gimli::DW_AT_abstract_origin)?
            .or(entry.attr_value(gimli::DW_AT_specification)?);
        match link {
            Some(AttributeValue::UnitRef(o)) => off = o,
            _ => return Ok(None),
        }
    }
    Ok(None)
}

fn decl_file_index(
    entry: &gimli::DebuggingInformationEntry<Reader>,
) -> Result<Option<u64>, gimli::Error> {
    match entry.attr_value(gimli::DW_AT_decl_file)? {
        Some(AttributeValue::FileIndex(i)) => Ok(Some(i)),
        Some(AttributeValue::Udata(i)) => Ok(Some(i)),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(name: &str, addr: u64, size: u64) -> Section {
        Section { name: name.to_string(), addr, size }
    }

    #[test]
    fn init_sections_are_detected() {
        let sections = vec![
            section(".text", 0x1000, 0x1000),
            section(".init.text", 0x3000, 0x100),
            section(".initcall.init", 0x3100, 0x10),
        ];
        assert!(!addr_in_init_section(&sections, 0x1800));
        assert!(addr_in_init_section(&sections, 0x3000));
        assert!(addr_in_init_section(&sections, 0x30ff));
        assert!(!addr_in_init_section(&sections, 0x3100));
        // `.initcall.init` does not start with `.init.`
        assert!(!addr_in_init_section(&sections, 0x3105));
    }
}
