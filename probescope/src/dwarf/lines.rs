//! Line-table views and prologue-end heuristics
//!
//! Line rows are collected once per compilation unit, sorted by address,
//! and shared between source-line probing and prologue resolution. The
//! heuristics work on plain row slices so they can be exercised without a
//! live kernel image.

use super::image::{LoadedDwarf, Reader};
use super::FuncInfo;
use crate::error::SemanticError;
use gimli::Reader as _;
use log::info;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::rc::Rc;

/// One row of a compilation unit's line program.
#[derive(Debug, Clone)]
pub struct LineRow {
    pub address: u64,
    pub line: i64,
    pub file: Rc<str>,
}

/// Runs the unit's line program and returns its rows in address order.
pub fn collect_line_rows(
    loaded: &LoadedDwarf,
    unit: &gimli::Unit<Reader>,
) -> Result<Vec<LineRow>, SemanticError> {
    let Some(program) = unit.line_program.clone() else {
        return Ok(Vec::new());
    };

    let dwarf = &loaded.dwarf;
    let mut file_names: HashMap<u64, Rc<str>> = HashMap::new();
    let mut out = Vec::new();

    let mut rows = program.rows();
    while let Some((header, row)) = rows.next_row()? {
        if row.end_sequence() {
            continue;
        }
        let file_index = row.file_index();
        let file = match file_names.get(&file_index) {
            Some(f) => Rc::clone(f),
            None => {
                let name = match row.file(header) {
                    Some(file) => file_entry_name(dwarf, unit, header, file)?,
                    None => String::new(),
                };
                let rc: Rc<str> = Rc::from(name.as_str());
                file_names.insert(file_index, Rc::clone(&rc));
                rc
            }
        };
        out.push(LineRow {
            address: row.address(),
            line: row.line().map_or(0, |l| l.get() as i64),
            file,
        });
    }

    out.sort_by_key(|r| r.address);
    Ok(out)
}

/// Composes a file table entry into a path, prefixing the directory unless
/// the name is already absolute.
pub(crate) fn file_entry_name(
    dwarf: &gimli::Dwarf<Reader>,
    unit: &gimli::Unit<Reader>,
    header: &gimli::LineProgramHeader<Reader>,
    file: &gimli::FileEntry<Reader>,
) -> Result<String, gimli::Error> {
    let name = dwarf.attr_string(unit, file.path_name())?.to_string_lossy()?.into_owned();
    if name.starts_with('/') {
        return Ok(name);
    }
    let dir = match file.directory(header) {
        Some(d) => dwarf.attr_string(unit, d)?.to_string_lossy()?.into_owned(),
        None => String::new(),
    };
    if dir.is_empty() {
        Ok(name)
    } else {
        Ok(format!("{dir}/{name}"))
    }
}

/// Distinct addresses carrying a line record for `file`:`lineno`.
#[must_use]
pub fn addresses_for_line(rows: &[LineRow], file: &str, lineno: i64) -> Vec<u64> {
    let mut addrs: Vec<u64> = rows
        .iter()
        .filter(|r| r.line == lineno && r.file.as_ref() == file)
        .map(|r| r.address)
        .collect();
    addrs.dedup();
    addrs
}

fn has_single_line_record(rows: &[LineRow], file: &str, lineno: i64) -> bool {
    lineno > 0 && addresses_for_line(rows, file, lineno).len() == 1
}

/// Looks a few lines above and below an ambiguous line number for one that
/// resolves to a single address, so the diagnostic can offer alternatives.
#[must_use]
pub fn nearby_single_line_advice(rows: &[LineRow], file: &str, lineno: i64) -> String {
    let mut lo_try = None;
    let mut hi_try = None;
    for i in 1..6 {
        if lo_try.is_none() && has_single_line_record(rows, file, lineno - i) {
            lo_try = Some(lineno - i);
        }
        if hi_try.is_none() && has_single_line_record(rows, file, lineno + i) {
            hi_try = Some(lineno + i);
        }
    }

    match (lo_try, hi_try) {
        (None, None) => String::new(),
        (Some(lo), None) => format!(" (try {file}:{lo})"),
        (None, Some(hi)) => format!(" (try {file}:{hi})"),
        (Some(lo), Some(hi)) => format!(" (try {file}:{lo} or {file}:{hi})"),
    }
}

/// First prologue heuristic: the line record immediately following a
/// record at a function's entry pc is taken as its prologue end.
pub fn resolve_prologue_endings(rows: &[LineRow], funcs: &mut BTreeMap<u64, FuncInfo>) {
    let mut previous_addr: Option<u64> = None;
    let mut choose_next_line = false;

    for row in rows {
        if choose_next_line {
            if let Some(func) = previous_addr.and_then(|a| funcs.get_mut(&a)) {
                func.prologue_end = row.address;
            }
            choose_next_line = false;
        }
        if funcs.contains_key(&row.address) {
            choose_next_line = true;
        }
        previous_addr = Some(row.address);
    }
}

/// Second heuristic: pick the first address whose source line is distinct
/// from the entry pc's. This copes with inline expansions at the first
/// statement, so it overrides the first heuristic when they disagree.
pub fn resolve_prologue_endings2(
    rows: &[LineRow],
    funcs: &mut BTreeMap<u64, FuncInfo>,
    verbose: bool,
) {
    let mut pending: Option<(u64, i64)> = None;

    for row in rows {
        if let Some((entrypc, entry_line)) = pending {
            if row.line != entry_line {
                if let Some(func) = funcs.get_mut(&entrypc) {
                    let addr0 = func.prologue_end;
                    if addr0 != row.address {
                        func.prologue_end = row.address;
                        if verbose {
                            info!(
                                "prologue disagreement: {} heur0={addr0:#x} heur1={:#x}",
                                func.name, row.address
                            );
                        }
                    }
                }
                pending = None;
            }
        }
        if funcs.contains_key(&row.address) {
            pending = Some((row.address, row.line));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dwarf::FuncInfo;

    fn row(address: u64, line: i64, file: &str) -> LineRow {
        LineRow { address, line, file: Rc::from(file) }
    }

    fn func_at(funcs: &mut BTreeMap<u64, FuncInfo>, name: &str, entrypc: u64) {
        funcs.insert(entrypc, FuncInfo { name: name.to_string(), ..FuncInfo::default() });
    }

    #[test]
    fn heuristics_agree_on_simple_prologue() {
        // Entry line 10, first body statement on line 12 at the next record.
        let rows =
            vec![row(0x4000, 10, "f.c"), row(0x4020, 12, "f.c"), row(0x4040, 13, "f.c")];
        let mut funcs = BTreeMap::new();
        func_at(&mut funcs, "sys_read", 0x4000);

        resolve_prologue_endings(&rows, &mut funcs);
        let h0 = funcs[&0x4000].prologue_end;
        resolve_prologue_endings2(&rows, &mut funcs, false);
        let h1 = funcs[&0x4000].prologue_end;

        assert_eq!(h0, 0x4020);
        assert_eq!(h1, h0);
    }

    #[test]
    fn second_heuristic_skips_same_line_records() {
        // Two records still on the declaration line before the body starts.
        let rows = vec![
            row(0x4000, 10, "f.c"),
            row(0x4010, 10, "f.c"),
            row(0x4020, 11, "f.c"),
        ];
        let mut funcs = BTreeMap::new();
        func_at(&mut funcs, "do_fork", 0x4000);

        resolve_prologue_endings(&rows, &mut funcs);
        assert_eq!(funcs[&0x4000].prologue_end, 0x4010);

        resolve_prologue_endings2(&rows, &mut funcs, false);
        assert_eq!(funcs[&0x4000].prologue_end, 0x4020);
    }

    #[test]
    fn first_heuristic_handles_entry_on_first_row() {
        // A function entry on the very first record must not consult an
        // uninitialized previous address.
        let rows = vec![row(0x1000, 5, "g.c"), row(0x1008, 6, "g.c")];
        let mut funcs = BTreeMap::new();
        func_at(&mut funcs, "first", 0x1000);
        resolve_prologue_endings(&rows, &mut funcs);
        assert_eq!(funcs[&0x1000].prologue_end, 0x1008);
    }

    #[test]
    fn line_ambiguity_advice_points_at_neighbors() {
        // Line 101 maps to two addresses; 99 and 103 are unique.
        let rows = vec![
            row(0x90, 99, "net/tcp.c"),
            row(0x100, 101, "net/tcp.c"),
            row(0x200, 101, "net/tcp.c"),
            row(0x300, 103, "net/tcp.c"),
        ];
        assert_eq!(addresses_for_line(&rows, "net/tcp.c", 101), vec![0x100, 0x200]);
        let advice = nearby_single_line_advice(&rows, "net/tcp.c", 101);
        assert_eq!(advice, " (try net/tcp.c:99 or net/tcp.c:103)");
    }

    #[test]
    fn no_advice_when_no_neighbors_resolve() {
        let rows = vec![row(0x100, 50, "a.c"), row(0x200, 50, "a.c")];
        assert_eq!(nearby_single_line_advice(&rows, "a.c", 50), "");
    }
}
