//! Structured error types for probe resolution
//!
//! Using thiserror for automatic Display implementation and error chaining.
//! A failed probe is dropped with a diagnostic; resolution of the remaining
//! probes continues, so most of these are recorded on the session rather
//! than propagated to the caller.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SemanticError {
    #[error("cannot open debug-info session: {0}")]
    Open(String),

    #[error("cannot find {0} debuginfo")]
    MissingDebuginfo(String),

    #[error("unable to find local '{local}' near pc {pc:#x}")]
    LocalNotFound { local: String, pc: u64 },

    #[error("unable to find any scopes containing {pc:#x} while searching for local '{local}'")]
    NoScopes { local: String, pc: u64 },

    #[error("field name {0} not found")]
    FieldNotFound(String),

    #[error("field {field} vs base type {type_name}")]
    FieldOnBase { field: String, type_name: String },

    #[error("bad field '{0}' for array type")]
    FieldOnArray(String),

    #[error("unsupported type tag {0}")]
    UnsupportedType(String),

    #[error("unsupported location expression for '{0}'")]
    UnsupportedLocation(String),

    #[error("cannot store into target pointer value")]
    CannotStorePointer,

    #[error("multiple addresses for {file}:{line}{advice}")]
    AmbiguousLine { file: String, line: i64, advice: String },

    #[error("writing to target variable outside of guru mode")]
    IllegalLvalue,

    #[error("operator-assign expressions on target variables not implemented")]
    UnsupportedCompoundAssign,

    #[error("incomplete: do not know how to interpret .{0}")]
    Incomplete(String),

    #[error("cannot probe .return of inline function '{0}'")]
    ReturnOnInline(String),

    #[error("no entrypc found for function '{0}'")]
    NoEntryPc(String),

    #[error("could not find prologue-end for probed function '{0}'")]
    NoPrologueEnd(String),

    #[error("malformed specification '{0}'")]
    MalformedSpec(String),

    #[error("empty {kind} {name}")]
    EmptyAggregate { kind: String, name: String },

    #[error("invalid interval for jiffies timer")]
    BadTimerInterval,

    #[error("invalid randomize for jiffies timer")]
    BadTimerRandomize,

    #[error("due to failed target variable resolution")]
    TargetVarResolution,

    #[error("error opening module refcount-bumping file: {0}")]
    ModulePin(String),

    #[error("DWARF data malformed: {0}")]
    Dwarf(#[from] gimli::Error),

    #[error("object file malformed: {0}")]
    Object(#[from] object::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn return_on_inline_names_the_function() {
        let err = SemanticError::ReturnOnInline("do_fork".into());
        assert_eq!(err.to_string(), "cannot probe .return of inline function 'do_fork'");
    }

    #[test]
    fn ambiguous_line_carries_the_advice() {
        let err = SemanticError::AmbiguousLine {
            file: "net/tcp.c".into(),
            line: 101,
            advice: " (try net/tcp.c:99 or net/tcp.c:103)".into(),
        };
        let msg = err.to_string();
        assert!(msg.starts_with("multiple addresses for net/tcp.c:101"));
        assert!(msg.contains("try net/tcp.c:99"));
    }

    #[test]
    fn incomplete_forms_name_the_component() {
        let err = SemanticError::Incomplete("callees".into());
        assert_eq!(err.to_string(), "incomplete: do not know how to interpret .callees");
    }
}
