//! Location translation: `$local.a.b[n]` to a C fetch/store snippet
//!
//! Given a program counter and a chain of member, dereference and index
//! accesses rooted at a local or formal parameter, this module finds the
//! variable's DIE in the scopes containing the pc, compiles its DWARF
//! location expression into an address computation over the runtime's
//! `fetch_register` / `deref` / `store_deref` macros, walks the access
//! chain through the type graph, and wraps the result in the block the
//! generated probe embeds verbatim. The dereference fault label is emitted
//! unconditionally; the translated code jumps to `out` on success.

use crate::ast::{Component, ExpType};
use crate::dwarf::image::{LoadedDwarf, Reader};
use crate::dwarf::{die_name, DieOffset, DieRef, DwarfContext};
use crate::error::SemanticError;
use gimli::{AttributeValue, Operation};
use log::debug;

/// Emitted accessor code plus the script-level type it produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessorSnippet {
    pub code: String,
    pub ty: ExpType,
}

/// Frame-base forms the compiler understands. Kernel code of the vintage
/// this targets anchors frames in a register, possibly displaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameBase {
    Reg(u16),
    RegOffset(u16, i64),
}

/// Where the value currently lives while the access chain is walked.
enum LocKind {
    /// `addr` has been computed by the collected statements.
    Address,
    /// The value sits in a machine register; no address exists yet.
    Register(u16),
}

struct Snippet {
    stmts: Vec<String>,
    loc: LocKind,
    ptr_size: u64,
    local: String,
}

impl Snippet {
    fn unsupported(&self) -> SemanticError {
        SemanticError::UnsupportedLocation(self.local.clone())
    }

    /// Loads the pointer the current location holds, leaving its value as
    /// the new address.
    fn deref_pointer(&mut self) {
        match self.loc {
            LocKind::Register(r) => {
                self.stmts.push(format!("addr = fetch_register(c->regs, {r});"));
                self.loc = LocKind::Address;
            }
            LocKind::Address => {
                self.stmts.push(format!("addr = deref({}, addr);", self.ptr_size));
            }
        }
    }

    /// Displaces the current address by a byte offset.
    fn add_offset(&mut self, offset: i64) -> Result<(), SemanticError> {
        if !matches!(self.loc, LocKind::Address) {
            return Err(self.unsupported());
        }
        if offset != 0 {
            self.stmts.push(format!("addr += {offset}L;"));
        }
        Ok(())
    }

    fn require_addr(&self) -> Result<(), SemanticError> {
        if matches!(self.loc, LocKind::Address) {
            Ok(())
        } else {
            Err(self.unsupported())
        }
    }
}

/// Translates one target-variable access into embedded C.
///
/// `scope` narrows the search to a known scope DIE (an inline instance or
/// function body); without it the scopes containing `pc` are used. The
/// returned snippet either fetches into `THIS->__retvalue` or, for
/// `lvalue`, stores from `THIS->value`.
pub fn stmt_for_local(
    ctx: &mut DwarfContext,
    scope: Option<DieRef>,
    pc: u64,
    local: &str,
    components: &[Component],
    lvalue: bool,
) -> Result<AccessorSnippet, SemanticError> {
    let cu = match scope {
        Some(s) => s.cu,
        None => ctx.cu_offset().expect("no CU focused"),
    };
    let module_name = ctx.module_name().to_string();
    let verbose = ctx.verbose;

    ctx.with_cu(cu, |ld, unit| {
        if verbose {
            debug!("finding location for local '{local}' near address {pc:#x}");
        }
        translate(ld, unit, &module_name, scope, pc, local, components, lvalue)
    })
}

#[allow(clippy::too_many_arguments)]
fn translate(
    ld: &LoadedDwarf,
    unit: &gimli::Unit<Reader>,
    module_name: &str,
    scope: Option<DieRef>,
    pc: u64,
    local: &str,
    components: &[Component],
    lvalue: bool,
) -> Result<AccessorSnippet, SemanticError> {
    let scopes = match scope {
        Some(s) => scopes_for_die(unit, s.die)?,
        None => scopes_containing(ld, unit, pc)?,
    };
    if scopes.is_empty() {
        return Err(SemanticError::NoScopes { local: local.to_string(), pc });
    }

    let (vardie, declaring) = find_variable(ld, unit, &scopes, local)
        .ok_or_else(|| SemanticError::LocalNotFound { local: local.to_string(), pc })?;

    let frame_base = find_frame_base(unit, &scopes, declaring, local)?;

    // Base location of the variable itself.
    let var_entry = unit.entry(vardie)?;
    let loc_attr = var_entry
        .attr_value(gimli::DW_AT_location)?
        .ok_or_else(|| SemanticError::UnsupportedLocation(local.to_string()))?;
    let expr = location_expression(ld, unit, loc_attr, pc, local)?;

    let mut snippet = compile_location(
        &expr,
        unit.encoding(),
        frame_base.as_ref(),
        module_name,
        local,
    )?;

    // Walk ->a.b[n] through the type graph.
    let mut die = type_of(unit, vardie)?
        .ok_or_else(|| SemanticError::UnsupportedType(format!("no type for local '{local}'")))?;
    let mut i = 0;
    while i < components.len() {
        let entry = unit.entry(die)?;
        match entry.tag() {
            gimli::DW_TAG_typedef | gimli::DW_TAG_const_type | gimli::DW_TAG_volatile_type => {
                die = type_of(unit, die)?
                    .ok_or_else(|| SemanticError::UnsupportedType("stripped type".into()))?;
            }
            gimli::DW_TAG_pointer_type => {
                let pointee = type_of(unit, die)?
                    .ok_or_else(|| SemanticError::UnsupportedType("void pointer".into()))?;
                snippet.deref_pointer();
                if let Component::Index(n) = components[i] {
                    let elem = strip_quals(unit, pointee)?;
                    let size = byte_size(unit, elem)?.unwrap_or(snippet.ptr_size);
                    snippet.add_offset((n * size) as i64)?;
                    i += 1;
                }
                die = pointee;
            }
            gimli::DW_TAG_array_type => match &components[i] {
                Component::Index(n) => {
                    let elem = type_of(unit, die)?
                        .ok_or_else(|| SemanticError::UnsupportedType("array of nothing".into()))?;
                    let size = byte_size(unit, strip_quals(unit, elem)?)?
                        .unwrap_or(snippet.ptr_size);
                    snippet.require_addr()?;
                    snippet.add_offset((n * size) as i64)?;
                    die = elem;
                    i += 1;
                }
                Component::Member(f) => return Err(SemanticError::FieldOnArray(f.clone())),
            },
            tag @ (gimli::DW_TAG_structure_type | gimli::DW_TAG_union_type) => {
                let field = match &components[i] {
                    Component::Member(f) => f.clone(),
                    Component::Index(n) => {
                        return Err(SemanticError::UnsupportedType(format!(
                            "subscript [{n}] on {} type",
                            if tag == gimli::DW_TAG_union_type { "union" } else { "struct" }
                        )))
                    }
                };
                let member = find_member(ld, unit, die, &field)?.ok_or_else(|| {
                    if has_children(unit, die).unwrap_or(false) {
                        SemanticError::FieldNotFound(field.clone())
                    } else {
                        SemanticError::EmptyAggregate {
                            kind: if tag == gimli::DW_TAG_union_type {
                                "union".into()
                            } else {
                                "struct".into()
                            },
                            name: type_display_name(ld, unit, die),
                        }
                    }
                })?;
                let member_entry = unit.entry(member)?;
                match member_entry.attr_value(gimli::DW_AT_data_member_location)? {
                    Some(AttributeValue::Udata(off)) => {
                        snippet.require_addr()?;
                        snippet.add_offset(off as i64)?;
                    }
                    Some(AttributeValue::Sdata(off)) => {
                        snippet.require_addr()?;
                        snippet.add_offset(off)?;
                    }
                    // Union members usually carry no location and share
                    // the containing union's.
                    None if tag == gimli::DW_TAG_union_type => {}
                    _ => {
                        return Err(SemanticError::UnsupportedType(format!(
                            "no location for field {field}"
                        )))
                    }
                }
                die = type_of(unit, member)?.ok_or_else(|| {
                    SemanticError::UnsupportedType(format!("cannot get type of field {field}"))
                })?;
                i += 1;
            }
            gimli::DW_TAG_base_type => {
                let field = match &components[i] {
                    Component::Member(f) => f.clone(),
                    Component::Index(n) => format!("[{n}]"),
                };
                return Err(SemanticError::FieldOnBase {
                    field,
                    type_name: type_display_name(ld, unit, die),
                });
            }
            tag => {
                return Err(SemanticError::UnsupportedType(format!(
                    "{} while walking '{local}'",
                    tag
                )))
            }
        }
    }

    // Final fetch or store, by the unqualified result type.
    let final_die = strip_quals(unit, die)?;
    let final_entry = unit.entry(final_die)?;
    let ty = match final_entry.tag() {
        gimli::DW_TAG_enumeration_type | gimli::DW_TAG_base_type => {
            let size = byte_size(unit, final_die)?.unwrap_or(snippet.ptr_size);
            let in_register = match snippet.loc {
                LocKind::Register(r) => Some(r),
                LocKind::Address => None,
            };
            let stmt = match (in_register, lvalue) {
                (Some(r), false) => format!("THIS->__retvalue = fetch_register(c->regs, {r});"),
                (Some(r), true) => format!("store_register(c->regs, {r}, THIS->value);"),
                (None, false) => format!("THIS->__retvalue = deref({size}, addr);"),
                (None, true) => format!("store_deref({size}, addr, THIS->value);"),
            };
            snippet.stmts.push(stmt);
            ExpType::Long
        }
        gimli::DW_TAG_array_type => {
            if lvalue {
                return Err(SemanticError::CannotStorePointer);
            }
            // An array's location is already its first element's address.
            snippet.require_addr()?;
            snippet.stmts.push("THIS->__retvalue = addr;".to_string());
            ExpType::Long
        }
        gimli::DW_TAG_pointer_type => {
            if lvalue {
                return Err(SemanticError::CannotStorePointer);
            }
            snippet.deref_pointer();
            snippet.stmts.push("THIS->__retvalue = addr;".to_string());
            ExpType::Long
        }
        tag => return Err(SemanticError::UnsupportedType(tag.to_string())),
    };

    Ok(AccessorSnippet { code: render(&snippet), ty })
}

/// Wraps the collected statements in the block the probe body embeds. The
/// deref-used flag is unreliable, so the fault label is always present.
fn render(snippet: &Snippet) -> String {
    let mut out = String::from("{\n");
    let needs_addr = snippet.stmts.iter().any(|s| s.contains("addr"));
    if needs_addr {
        out.push_str("  intptr_t addr;\n");
    }
    for stmt in &snippet.stmts {
        out.push_str("  ");
        out.push_str(stmt);
        out.push('\n');
    }
    out.push_str("  goto out;\n");
    out.push_str("  if (0) goto deref_fault;\n");
    out.push_str("deref_fault:\n");
    out.push_str("  c->last_error = \"pointer dereference fault\";\n");
    out.push_str("  goto out;\n");
    out.push_str("}\n");
    out
}

/// Selects the location expression for `pc`, resolving location lists.
fn location_expression(
    ld: &LoadedDwarf,
    unit: &gimli::Unit<Reader>,
    attr: AttributeValue<Reader>,
    pc: u64,
    local: &str,
) -> Result<gimli::Expression<Reader>, SemanticError> {
    match attr {
        AttributeValue::Exprloc(expr) => Ok(expr),
        AttributeValue::LocationListsRef(offset) => {
            let mut locations = ld.dwarf.locations(unit, offset)?;
            while let Some(entry) = locations.next()? {
                if pc >= entry.range.begin && pc < entry.range.end {
                    return Ok(entry.data);
                }
            }
            Err(SemanticError::LocalNotFound { local: local.to_string(), pc })
        }
        _ => Err(SemanticError::UnsupportedLocation(local.to_string())),
    }
}

fn compile_frame_base(
    expr: &gimli::Expression<Reader>,
    encoding: gimli::Encoding,
    local: &str,
) -> Result<FrameBase, SemanticError> {
    let mut ops = expr.clone().operations(encoding);
    let mut base = None;
    while let Some(op) = ops.next()? {
        base = match (base, op) {
            (None, Operation::Register { register }) => Some(FrameBase::Reg(register.0)),
            (None, Operation::RegisterOffset { register, offset, .. }) => {
                Some(FrameBase::RegOffset(register.0, offset))
            }
            _ => return Err(SemanticError::UnsupportedLocation(local.to_string())),
        };
    }
    base.ok_or_else(|| SemanticError::UnsupportedLocation(local.to_string()))
}

fn compile_location(
    expr: &gimli::Expression<Reader>,
    encoding: gimli::Encoding,
    frame_base: Option<&FrameBase>,
    module_name: &str,
    local: &str,
) -> Result<Snippet, SemanticError> {
    let mut snippet = Snippet {
        stmts: Vec::new(),
        loc: LocKind::Address,
        ptr_size: u64::from(encoding.address_size),
        local: local.to_string(),
    };
    let mut seen = false;

    let mut ops = expr.clone().operations(encoding);
    while let Some(op) = ops.next()? {
        match op {
            Operation::Address { address } => {
                snippet.stmts.push(format!(
                    "addr = {address:#x}UL; /* hard-coded {module_name} address */"
                ));
            }
            Operation::Register { register } if !seen => {
                snippet.loc = LocKind::Register(register.0);
            }
            Operation::RegisterOffset { register, offset, .. } => {
                snippet
                    .stmts
                    .push(format!("addr = fetch_register(c->regs, {}) + ({offset}L);", register.0));
            }
            Operation::FrameOffset { offset } => match frame_base {
                Some(FrameBase::Reg(r)) => {
                    snippet
                        .stmts
                        .push(format!("addr = fetch_register(c->regs, {r}) + ({offset}L);"));
                }
                Some(FrameBase::RegOffset(r, fb_off)) => {
                    snippet.stmts.push(format!(
                        "addr = fetch_register(c->regs, {r}) + ({}L);",
                        fb_off + offset
                    ));
                }
                None => return Err(snippet.unsupported()),
            },
            Operation::PlusConstant { value } => {
                snippet.add_offset(value as i64)?;
            }
            Operation::Deref { .. } => {
                snippet.require_addr()?;
                snippet.stmts.push(format!("addr = deref({}, addr);", snippet.ptr_size));
            }
            _ => return Err(snippet.unsupported()),
        }
        seen = true;
    }

    if !seen {
        return Err(snippet.unsupported());
    }
    Ok(snippet)
}

// ---- scope and type helpers -------------------------------------------

/// Chain of scope DIEs whose code ranges contain `pc`, outermost first.
fn scopes_containing(
    ld: &LoadedDwarf,
    unit: &gimli::Unit<Reader>,
    pc: u64,
) -> Result<Vec<DieOffset>, SemanticError> {
    let mut tree = unit.entries_tree(None)?;
    let root = tree.root()?;
    let mut chain = Vec::new();
    descend_scopes(ld, unit, root, pc, &mut chain)?;
    Ok(chain)
}

fn descend_scopes(
    ld: &LoadedDwarf,
    unit: &gimli::Unit<Reader>,
    node: gimli::EntriesTreeNode<Reader>,
    pc: u64,
    chain: &mut Vec<DieOffset>,
) -> Result<(), SemanticError> {
    let mut children = node.children();
    while let Some(child) = children.next()? {
        let entry = child.entry();
        if !is_scope_tag(entry.tag()) {
            continue;
        }
        let mut contains = false;
        let mut ranges = ld.dwarf.die_ranges(unit, entry)?;
        while let Some(range) = ranges.next()? {
            if pc >= range.begin && pc < range.end {
                contains = true;
                break;
            }
        }
        if contains {
            chain.push(entry.offset());
            descend_scopes(ld, unit, child, pc, chain)?;
            return Ok(());
        }
    }
    Ok(())
}

fn is_scope_tag(tag: gimli::DwTag) -> bool {
    matches!(
        tag,
        gimli::DW_TAG_subprogram
            | gimli::DW_TAG_inlined_subroutine
            | gimli::DW_TAG_lexical_block
            | gimli::DW_TAG_entry_point
    )
}

/// Ancestor chain of a known DIE (outermost first, the DIE itself last),
/// restricted to scope-forming entries.
fn scopes_for_die(
    unit: &gimli::Unit<Reader>,
    target: DieOffset,
) -> Result<Vec<DieOffset>, SemanticError> {
    let mut cursor = unit.entries();
    let mut chain: Vec<(isize, DieOffset, gimli::DwTag)> = Vec::new();
    let mut depth = 0isize;
    while let Some((delta, entry)) = cursor.next_dfs()? {
        depth += delta;
        while chain.last().is_some_and(|(d, _, _)| *d >= depth) {
            chain.pop();
        }
        chain.push((depth, entry.offset(), entry.tag()));
        if entry.offset() == target {
            return Ok(chain
                .into_iter()
                .filter(|(_, off, tag)| is_scope_tag(*tag) || *off == target)
                .map(|(_, off, _)| off)
                .collect());
        }
    }
    Ok(Vec::new())
}

/// Searches the scope chain innermost-out for a variable or formal
/// parameter named `local`. Returns its DIE and the declaring scope's
/// index in the chain.
fn find_variable(
    ld: &LoadedDwarf,
    unit: &gimli::Unit<Reader>,
    scopes: &[DieOffset],
    local: &str,
) -> Option<(DieOffset, usize)> {
    for (idx, scope) in scopes.iter().enumerate().rev() {
        let found = (|| -> Result<Option<DieOffset>, SemanticError> {
            let mut tree = unit.entries_tree(Some(*scope))?;
            let root = tree.root()?;
            let mut children = root.children();
            while let Some(child) = children.next()? {
                let entry = child.entry();
                if !matches!(
                    entry.tag(),
                    gimli::DW_TAG_variable | gimli::DW_TAG_formal_parameter
                ) {
                    continue;
                }
                if die_name(ld, unit, entry.offset())?.as_deref() == Some(local) {
                    return Ok(Some(entry.offset()));
                }
            }
            Ok(None)
        })()
        .ok()
        .flatten();
        if let Some(die) = found {
            return Some((die, idx));
        }
    }
    None
}

/// Frame base of the function enclosing the declaring scope: the first
/// function-like scope at or outside it that carries one.
fn find_frame_base(
    unit: &gimli::Unit<Reader>,
    scopes: &[DieOffset],
    declaring: usize,
    local: &str,
) -> Result<Option<FrameBase>, SemanticError> {
    for scope in &scopes[..=declaring.min(scopes.len() - 1)] {
        let entry = unit.entry(*scope)?;
        if !matches!(
            entry.tag(),
            gimli::DW_TAG_subprogram
                | gimli::DW_TAG_entry_point
                | gimli::DW_TAG_inlined_subroutine
        ) {
            continue;
        }
        if let Some(AttributeValue::Exprloc(expr)) =
            entry.attr_value(gimli::DW_AT_frame_base)?
        {
            return Ok(Some(compile_frame_base(&expr, unit.encoding(), local)?));
        }
    }
    Ok(None)
}

fn type_of(
    unit: &gimli::Unit<Reader>,
    die: DieOffset,
) -> Result<Option<DieOffset>, SemanticError> {
    let entry = unit.entry(die)?;
    match entry.attr_value(gimli::DW_AT_type)? {
        Some(AttributeValue::UnitRef(off)) => Ok(Some(off)),
        Some(AttributeValue::DebugInfoRef(off)) => {
            // Cross-unit type references stay within this unit's section
            // span for the code this handles; recover the local offset.
            match off.to_unit_offset(&unit.header) {
                Some(local) => Ok(Some(local)),
                None => Err(SemanticError::UnsupportedType("cross-unit type".into())),
            }
        }
        _ => Ok(None),
    }
}

/// Boils away typedefs and cv-qualifiers.
fn strip_quals(
    unit: &gimli::Unit<Reader>,
    mut die: DieOffset,
) -> Result<DieOffset, SemanticError> {
    loop {
        let entry = unit.entry(die)?;
        match entry.tag() {
            gimli::DW_TAG_typedef | gimli::DW_TAG_const_type | gimli::DW_TAG_volatile_type => {
                die = type_of(unit, die)?.ok_or_else(|| {
                    SemanticError::UnsupportedType("cannot get type of pointee".into())
                })?;
            }
            _ => return Ok(die),
        }
    }
}

fn byte_size(
    unit: &gimli::Unit<Reader>,
    die: DieOffset,
) -> Result<Option<u64>, SemanticError> {
    let entry = unit.entry(die)?;
    match entry.attr_value(gimli::DW_AT_byte_size)? {
        Some(AttributeValue::Udata(n)) => Ok(Some(n)),
        _ => Ok(None),
    }
}

fn has_children(unit: &gimli::Unit<Reader>, die: DieOffset) -> Result<bool, SemanticError> {
    let mut tree = unit.entries_tree(Some(die))?;
    let root = tree.root()?;
    let mut children = root.children();
    Ok(children.next()?.is_some())
}

fn find_member(
    ld: &LoadedDwarf,
    unit: &gimli::Unit<Reader>,
    aggregate: DieOffset,
    field: &str,
) -> Result<Option<DieOffset>, SemanticError> {
    let mut tree = unit.entries_tree(Some(aggregate))?;
    let root = tree.root()?;
    let mut children = root.children();
    while let Some(child) = children.next()? {
        let entry = child.entry();
        if entry.tag() != gimli::DW_TAG_member {
            continue;
        }
        if die_name(ld, unit, entry.offset())?.as_deref() == Some(field) {
            return Ok(Some(entry.offset()));
        }
    }
    Ok(None)
}

fn type_display_name(
    ld: &LoadedDwarf,
    unit: &gimli::Unit<Reader>,
    die: DieOffset,
) -> String {
    die_name(ld, unit, die)
        .ok()
        .flatten()
        .unwrap_or_else(|| "<anonymous type>".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gimli::{EndianRcSlice, RunTimeEndian};
    use std::rc::Rc;

    fn expr(bytes: &[u8]) -> gimli::Expression<Reader> {
        gimli::Expression(EndianRcSlice::new(Rc::from(bytes), RunTimeEndian::Little))
    }

    fn encoding() -> gimli::Encoding {
        gimli::Encoding { format: gimli::Format::Dwarf32, version: 4, address_size: 8 }
    }

    #[test]
    fn fbreg_location_uses_frame_base_register() {
        // DW_OP_fbreg -12 against a DW_OP_reg6 frame base.
        let fb = compile_frame_base(&expr(&[0x56]), encoding(), "x").unwrap();
        assert_eq!(fb, FrameBase::Reg(6));

        let snippet =
            compile_location(&expr(&[0x91, 0x74]), encoding(), Some(&fb), "kernel", "x").unwrap();
        assert_eq!(snippet.stmts, vec!["addr = fetch_register(c->regs, 6) + (-12L);"]);
    }

    #[test]
    fn absolute_address_location() {
        // DW_OP_addr 0x1000 (8-byte address).
        let mut bytes = vec![0x03];
        bytes.extend_from_slice(&0x1000u64.to_le_bytes());
        let snippet = compile_location(&expr(&bytes), encoding(), None, "ext3", "x").unwrap();
        assert_eq!(
            snippet.stmts,
            vec!["addr = 0x1000UL; /* hard-coded ext3 address */"]
        );
    }

    #[test]
    fn register_location_needs_no_address() {
        // DW_OP_reg5: value lives in a register.
        let snippet = compile_location(&expr(&[0x55]), encoding(), None, "kernel", "x").unwrap();
        assert!(snippet.stmts.is_empty());
        assert!(matches!(snippet.loc, LocKind::Register(5)));
    }

    #[test]
    fn cfa_frame_base_is_rejected() {
        // DW_OP_call_frame_cfa needs unwind info this compiler does not
        // consult; the probe is dropped rather than mistranslated.
        let err = compile_frame_base(&expr(&[0x9c]), encoding(), "x").unwrap_err();
        assert!(matches!(err, SemanticError::UnsupportedLocation(_)));
    }

    #[test]
    fn fault_label_always_emitted() {
        let snippet = Snippet {
            stmts: vec!["addr = fetch_register(c->regs, 6) + (-8L);".into()],
            loc: LocKind::Address,
            ptr_size: 8,
            local: "x".into(),
        };
        let code = render(&snippet);
        assert!(code.starts_with("{\n"));
        assert!(code.contains("intptr_t addr;"));
        assert!(code.contains("deref_fault:"));
        assert!(code.contains("c->last_error = \"pointer dereference fault\";"));
        assert!(code.trim_end().ends_with('}'));
    }
}
