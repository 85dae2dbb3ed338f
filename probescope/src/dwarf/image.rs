//! Module images: ELF + DWARF loading and debuginfo discovery
//!
//! A `ModuleImage` is one probeable object (the kernel proper, or one
//! loadable module) together with its load range and lazily parsed debug
//! info. Debuginfo files are located along the fixed search path
//! `-:.debug:/usr/lib/debug`: built-in system locations, a sibling
//! `.debug` directory, and the system debuginfo root.

use crate::error::SemanticError;
use gimli::{EndianRcSlice, RunTimeEndian};
use log::debug;
use object::{Object, ObjectSection};
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

pub type Reader = EndianRcSlice<RunTimeEndian>;

pub const DEBUGINFO_SEARCH_PATH: &str = "-:.debug:/usr/lib/debug";

/// Name under which the kernel proper is reported.
pub const KERNEL_MODULE_NAME: &str = "kernel";

/// One ELF section of a module image, kept for address classification.
#[derive(Debug, Clone)]
pub struct Section {
    pub name: String,
    pub addr: u64,
    pub size: u64,
}

/// Parsed debug information for one module.
pub struct LoadedDwarf {
    pub dwarf: gimli::Dwarf<Reader>,
    pub sections: Vec<Section>,
}

enum DwarfState {
    Unloaded,
    Loaded(Rc<LoadedDwarf>),
    Missing,
}

pub struct ModuleImage {
    pub name: String,
    /// Debuginfo file backing this module, when one was found.
    pub path: Option<PathBuf>,
    /// Load base; zero for the kernel proper.
    pub start: u64,
    pub end: u64,
    state: DwarfState,
}

impl ModuleImage {
    fn new(name: String, path: Option<PathBuf>, start: u64, end: u64) -> Self {
        ModuleImage { name, path, start, end, state: DwarfState::Unloaded }
    }

    #[must_use]
    pub fn is_kernel(&self) -> bool {
        self.name == KERNEL_MODULE_NAME
    }

    /// Lazily parses the module's debuginfo. Returns `None` (and remembers
    /// the failure) when no usable debug info can be had.
    pub fn dwarf(&mut self) -> Option<Rc<LoadedDwarf>> {
        match &self.state {
            DwarfState::Loaded(d) => return Some(Rc::clone(d)),
            DwarfState::Missing => return None,
            DwarfState::Unloaded => {}
        }
        let loaded = self.path.as_ref().and_then(|p| match load_debuginfo(p) {
            Ok(d) => Some(Rc::new(d)),
            Err(e) => {
                debug!("failed to load debuginfo for '{}' from {}: {e}", self.name, p.display());
                None
            }
        });
        match loaded {
            Some(d) => {
                self.state = DwarfState::Loaded(Rc::clone(&d));
                Some(d)
            }
            None => {
                self.state = DwarfState::Missing;
                None
            }
        }
    }
}

/// Parses one ELF file into a DWARF handle plus its section table.
pub fn load_debuginfo(path: &Path) -> Result<LoadedDwarf, SemanticError> {
    let data = fs::read(path)?;
    let obj = object::File::parse(&*data)?;

    let endian = if obj.is_little_endian() { RunTimeEndian::Little } else { RunTimeEndian::Big };

    let load_section = |id: gimli::SectionId| -> Result<Reader, gimli::Error> {
        let data = obj
            .section_by_name(id.name())
            .and_then(|section| section.uncompressed_data().ok())
            .unwrap_or(std::borrow::Cow::Borrowed(&[][..]));
        Ok(EndianRcSlice::new(Rc::from(&*data), endian))
    };

    let dwarf = gimli::Dwarf::load(load_section)?;

    let sections = obj
        .sections()
        .filter_map(|s| {
            let name = s.name().ok()?.to_string();
            Some(Section { name, addr: s.address(), size: s.size() })
        })
        .collect();

    Ok(LoadedDwarf { dwarf, sections })
}

fn kernel_release() -> Result<String, SemanticError> {
    Ok(fs::read_to_string("/proc/sys/kernel/osrelease")
        .map_err(|e| SemanticError::Open(format!("cannot read kernel release: {e}")))?
        .trim()
        .to_string())
}

/// Candidate locations for the kernel image itself, in search-path order.
fn kernel_image_candidates(release: &str) -> Vec<PathBuf> {
    let mut out = Vec::new();
    for entry in DEBUGINFO_SEARCH_PATH.split(':') {
        match entry {
            "-" => {
                out.push(PathBuf::from(format!("/boot/vmlinux-{release}")));
                out.push(PathBuf::from(format!("/lib/modules/{release}/vmlinux")));
                out.push(PathBuf::from("vmlinux"));
            }
            ".debug" => {
                out.push(PathBuf::from(format!(".debug/vmlinux-{release}")));
                out.push(PathBuf::from(".debug/vmlinux"));
            }
            dir => {
                out.push(PathBuf::from(format!("{dir}/lib/modules/{release}/vmlinux")));
                out.push(PathBuf::from(format!("{dir}/boot/vmlinux-{release}")));
            }
        }
    }
    out
}

/// Module filenames use dashes where /proc/modules reports underscores.
fn module_file_matches(file_stem: &str, module_name: &str) -> bool {
    file_stem.len() == module_name.len()
        && file_stem.chars().zip(module_name.chars()).all(|(a, b)| {
            let a = if a == '-' { '_' } else { a };
            let b = if b == '-' { '_' } else { b };
            a == b
        })
}

fn find_module_file(dir: &Path, module_name: &str, depth: usize) -> Option<PathBuf> {
    if depth == 0 {
        return None;
    }
    let entries = fs::read_dir(dir).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if let Some(found) = find_module_file(&path, module_name, depth - 1) {
                return Some(found);
            }
        } else if path.extension().is_some_and(|e| e == "ko") {
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if module_file_matches(stem, module_name) {
                    return Some(path);
                }
            }
        }
    }
    None
}

/// Locates a loadable module's debuginfo file along the search path.
fn module_debuginfo(release: &str, module_name: &str) -> Option<PathBuf> {
    for entry in DEBUGINFO_SEARCH_PATH.split(':') {
        let root = match entry {
            "-" => PathBuf::from(format!("/lib/modules/{release}")),
            ".debug" => PathBuf::from(".debug"),
            dir => PathBuf::from(format!("{dir}/lib/modules/{release}")),
        };
        if let Some(found) = find_module_file(&root, module_name, 8) {
            return Some(found);
        }
    }
    None
}

/// One line of /proc/modules: `name size refcnt deps state address`.
fn parse_proc_modules_line(line: &str) -> Option<(String, u64, u64)> {
    let mut fields = line.split_whitespace();
    let name = fields.next()?.to_string();
    let size: u64 = fields.next()?.parse().ok()?;
    let addr_field = fields.nth(3)?;
    let addr = u64::from_str_radix(addr_field.trim_start_matches("0x"), 16).ok()?;
    Some((name, size, addr))
}

/// Reports the kernel image and every loaded module. The kernel is always
/// first, with load base zero. Fails only when the kernel image itself
/// cannot be located; individual modules without debuginfo are reported
/// with no backing file and fail later, when their info is demanded.
pub fn report_kernel() -> Result<Vec<ModuleImage>, SemanticError> {
    let release = kernel_release()?;

    let kernel_path = kernel_image_candidates(&release).into_iter().find(|p| p.is_file());
    let Some(kernel_path) = kernel_path else {
        return Err(SemanticError::Open(format!(
            "cannot find kernel image for release {release} along {DEBUGINFO_SEARCH_PATH}"
        )));
    };
    debug!("kernel image: {}", kernel_path.display());

    let mut modules =
        vec![ModuleImage::new(KERNEL_MODULE_NAME.to_string(), Some(kernel_path), 0, 0)];

    let proc_modules = fs::read_to_string("/proc/modules").unwrap_or_default();
    for line in proc_modules.lines() {
        if let Some((name, size, addr)) = parse_proc_modules_line(line) {
            let path = module_debuginfo(&release, &name);
            if path.is_none() {
                debug!("no debuginfo file found for module '{name}'");
            }
            modules.push(ModuleImage::new(name, path, addr, addr + size));
        }
    }

    Ok(modules)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proc_modules_line_parses() {
        let (name, size, addr) =
            parse_proc_modules_line("ext3 141129 1 - Live 0xf8859000").unwrap();
        assert_eq!(name, "ext3");
        assert_eq!(size, 141129);
        assert_eq!(addr, 0xf885_9000);

        assert!(parse_proc_modules_line("").is_none());
        assert!(parse_proc_modules_line("short line").is_none());
    }

    #[test]
    fn dash_underscore_names_match() {
        assert!(module_file_matches("snd-pcm", "snd_pcm"));
        assert!(module_file_matches("ext3", "ext3"));
        assert!(!module_file_matches("ext3", "ext4"));
        assert!(!module_file_matches("ext", "ext3"));
    }

    #[test]
    fn search_path_order_is_fixed() {
        let candidates = kernel_image_candidates("2.6.14");
        // Built-in locations first, then the sibling .debug directory,
        // then the system debuginfo root.
        assert_eq!(candidates[0], PathBuf::from("/boot/vmlinux-2.6.14"));
        assert!(candidates.iter().any(|p| p.starts_with(".debug")));
        assert!(candidates.iter().any(|p| p.starts_with("/usr/lib/debug")));
    }
}
