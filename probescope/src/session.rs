//! Translation session state
//!
//! Collects per-session artifacts that accumulate while probes resolve:
//! synthesized accessor functions, the per-probe error list, pinned module
//! refcount fds, and the counter that keeps generated names unique.

use crate::ast::FunctionDecl;
use crate::error::SemanticError;
use log::error;
use std::fs::File;
use std::collections::HashMap;

#[derive(Default)]
pub struct Session {
    pub verbose: bool,
    /// Permits writes to target variables.
    pub guru_mode: bool,
    /// Functions synthesized during body rewriting, to be emitted with the
    /// rest of the translation unit.
    pub functions: Vec<FunctionDecl>,
    errors: Vec<String>,
    tick: usize,
    /// Open fds on /sys/module/<name>/sections/.text, held to keep probed
    /// modules loaded between resolution and insertion.
    module_pins: HashMap<String, File>,
}

impl Session {
    #[must_use]
    pub fn new(verbose: bool, guru_mode: bool) -> Self {
        Session { verbose, guru_mode, ..Session::default() }
    }

    /// Next value of the generated-name counter.
    pub fn next_tick(&mut self) -> usize {
        let t = self.tick;
        self.tick += 1;
        t
    }

    /// Records a per-probe failure and keeps going; the translation as a
    /// whole fails if any probe failed unrecoverably.
    pub fn record_error(&mut self, context: &str, err: &SemanticError) {
        let msg = if context.is_empty() {
            format!("semantic error: {err}")
        } else {
            format!("semantic error: {err} while resolving probe point {context}")
        };
        error!("{msg}");
        self.errors.push(msg);
    }

    #[must_use]
    pub fn num_errors(&self) -> usize {
        self.errors.len()
    }

    #[must_use]
    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// Bumps the refcount of a loadable module by holding its sections file
    /// open, so it cannot unload before the probe module is inserted.
    pub fn pin_module(&mut self, module_name: &str) -> Result<(), SemanticError> {
        if self.module_pins.contains_key(module_name) {
            return Ok(());
        }
        let path = format!("/sys/module/{module_name}/sections/.text");
        let file = File::open(&path).map_err(|e| SemanticError::ModulePin(e.to_string()))?;
        self.module_pins.insert(module_name.to_string(), file);
        Ok(())
    }
}
