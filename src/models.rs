//! Data model shared between the Source Map, the MI session and the
//! Debugger Facade (spec.md §3).

use std::path::PathBuf;

use serde::Serialize;
use serde_json::Value;

use crate::mi::commands::BreakPointNumber;

/// A single COBOL-line <-> C-line correspondence.
///
/// Identity is `(cobol_file, cobol_line)`: a later entry with the same
/// identity replaces the previous one (last-write-wins, spec.md §3/§4.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineEntry {
    pub cobol_file: PathBuf,
    pub cobol_line: u32,
    pub c_file: PathBuf,
    pub c_line: u32,
}

impl LineEntry {
    /// The sentinel entry returned by lookups that found nothing: empty
    /// file strings and line 0, per spec.md §4.2.
    pub fn sentinel() -> Self {
        Self {
            cobol_file: PathBuf::new(),
            cobol_line: 0,
            c_file: PathBuf::new(),
            c_line: 0,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.cobol_line == 0 && self.c_line == 0
    }
}

/// A single COBOL-name <-> mangled-C-name correspondence. Identity is
/// `c_name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableEntry {
    pub cobol_name: String,
    pub c_name: String,
}

/// A breakpoint request as given by the debug-UI front end. Either `raw`
/// (opaque GDB location string) or mapped through the Source Map via
/// `(file, line)`.
#[derive(Debug, Clone, Default)]
pub struct Breakpoint {
    pub file: Option<PathBuf>,
    pub line: Option<u32>,
    pub raw: Option<String>,
    pub condition: Option<String>,
    pub count_condition: Option<String>,
}

/// The canonical breakpoint record handed back to the UI, in COBOL
/// coordinates, once GDB has accepted it.
#[derive(Debug, Clone, Serialize)]
pub struct BreakpointRecord {
    pub gdb_id: BreakPointNumber,
    pub file: Option<PathBuf>,
    pub line: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DebugThread {
    pub id: u64,
    pub target_id: String,
    pub name: Option<String>,
}

/// A stack frame translated into COBOL coordinates, falling through to raw
/// C coordinates when the Source Map has no mapping for it.
#[derive(Debug, Clone, Serialize)]
pub struct StackFrame {
    pub level: u32,
    pub address: Option<String>,
    pub function: String,
    pub file: PathBuf,
    pub file_basename: String,
    pub line: u32,
}

/// A local/stack variable, surfaced only when its C name is known to the
/// Source Map.
#[derive(Debug, Clone, Serialize)]
pub struct StackVariable {
    pub name: String,
    pub value_str: String,
    pub r#type: Option<String>,
    pub raw: Value,
}

/// A GDB varobj handle.
#[derive(Debug, Clone, Serialize)]
pub struct VarObject {
    pub name: String,
    pub exp: String,
    pub numchild: u32,
    pub r#type: Option<String>,
    pub value: Option<String>,
    pub thread_id: Option<String>,
    pub frozen: bool,
    pub dynamic: bool,
    pub displayhint: Option<String>,
    pub has_more: bool,
    pub id: String,
}

/// `numchild > 0 || value == "{...}" || (dynamic && displayhint in {array, map})`
pub fn is_compound(v: &VarObject) -> bool {
    if v.numchild > 0 {
        return true;
    }
    if v.value.as_deref() == Some("{...}") {
        return true;
    }
    if v.dynamic {
        if let Some(hint) = &v.displayhint {
            return hint == "array" || hint == "map";
        }
    }
    false
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sentinel_is_empty() {
        let s = LineEntry::sentinel();
        assert!(s.is_sentinel());
        assert_eq!(s.cobol_file, PathBuf::new());
    }

    #[test]
    fn compound_rules() {
        let base = VarObject {
            name: "v".into(),
            exp: "v".into(),
            numchild: 0,
            r#type: None,
            value: None,
            thread_id: None,
            frozen: false,
            dynamic: false,
            displayhint: None,
            has_more: false,
            id: "var1".into(),
        };
        assert!(!is_compound(&base));

        let mut with_children = base.clone();
        with_children.numchild = 3;
        assert!(is_compound(&with_children));

        let mut braces = base.clone();
        braces.value = Some("{...}".to_string());
        assert!(is_compound(&braces));

        let mut dyn_array = base.clone();
        dyn_array.dynamic = true;
        dyn_array.displayhint = Some("array".to_string());
        assert!(is_compound(&dyn_array));

        let mut dyn_other = base;
        dyn_other.dynamic = true;
        dyn_other.displayhint = Some("string".to_string());
        assert!(!is_compound(&dyn_other));
    }
}
