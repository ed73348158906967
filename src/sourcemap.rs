//! The COBOL <-> C Source Map (spec.md §4.2).
//!
//! Grounded on the teacher crate's `mi::commands` path-handling idioms
//! (quoting/normalizing paths) and its general preference for hand-rolled,
//! anchored parsing over a general grammar; here the markers are recognized
//! with small anchored regexes rather than a combinator grammar, per
//! spec.md §9's recommendation.

use std::collections::HashSet;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, warn};

use crate::error::AppResult;
use crate::models::{LineEntry, VariableEntry};

static GENERATED_FROM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)/\*\s*Generated from\s+(.+?)\s*\*/"#).unwrap());

static LINE_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)/\*\s*Line:\s*(\d+)\s*.*?:\s*(.+?)\s*\*/"#).unwrap());

static VARIABLE_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)^\s*static\s+cob_u8_t\s+(\S+)\b.*/\*\s*(.+?)\s*\*/"#).unwrap());

static INCLUDE_DIRECTIVE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r##"^\s*#include\s+"([^"]+)"\s*$"##).unwrap());

/// The bidirectional index built by scanning a compiler's generated C
/// output. Built once per `load` and then queried for the lifetime of the
/// debug session.
#[derive(Debug, Default)]
pub struct SourceMap {
    cwd: PathBuf,
    lines: Vec<LineEntry>,
    variables: Vec<VariableEntry>,
}

impl SourceMap {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self { cwd: cwd.into(), lines: Vec::new(), variables: Vec::new() }
    }

    /// Scans each COBOL path's corresponding `.c` file (and anything it
    /// `#include`s, recursively), accumulating line and variable entries.
    pub fn build(cwd: impl Into<PathBuf>, cobol_paths: &[PathBuf]) -> AppResult<Self> {
        let mut map = Self::new(cwd);
        let mut visited = HashSet::new();
        for cobol_path in cobol_paths {
            let c_path = map.resolve(&with_c_extension(cobol_path));
            map.scan_file(&c_path, Some(map.resolve(cobol_path)), &mut visited)?;
        }
        Ok(map)
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() { path.to_path_buf() } else { self.cwd.join(path) }
    }

    fn scan_file(&mut self, c_path: &Path, initial_cobol_file: Option<PathBuf>, visited: &mut HashSet<PathBuf>) -> AppResult<()> {
        let canonical = std::fs::canonicalize(c_path).unwrap_or_else(|_| c_path.to_path_buf());
        if !visited.insert(canonical) {
            debug!("skipping already-visited include {}", c_path.display());
            return Ok(());
        }

        let file = std::fs::File::open(c_path)?;
        let reader = std::io::BufReader::new(file);

        let mut current_cobol_file = initial_cobol_file;
        let mut c_line_no: u32 = 0;
        let mut includes: Vec<PathBuf> = Vec::new();

        for line in reader.lines() {
            c_line_no += 1;
            let line = match line {
                Ok(l) => l,
                Err(e) => {
                    warn!("skipping unreadable line in {}: {}", c_path.display(), e);
                    continue;
                }
            };

            if let Some(caps) = GENERATED_FROM.captures(&line) {
                current_cobol_file = Some(self.resolve(Path::new(&caps[1])));
                continue;
            }

            if let Some(caps) = LINE_MARKER.captures(&line) {
                let cobol_line: u32 = match caps[1].parse() {
                    Ok(n) => n,
                    Err(_) => continue,
                };
                let cobol_file = match &current_cobol_file {
                    Some(f) => f.clone(),
                    None => self.resolve(Path::new(&caps[2])),
                };
                let entry = LineEntry {
                    cobol_file,
                    cobol_line,
                    c_file: c_path.to_path_buf(),
                    c_line: c_line_no + 2,
                };
                self.push_line_entry(entry);
                continue;
            }

            if let Some(caps) = VARIABLE_MARKER.captures(&line) {
                let c_name = caps[1].to_string();
                let cobol_name = caps[2].to_string();
                self.push_variable_entry(VariableEntry { cobol_name, c_name });
                continue;
            }

            if let Some(caps) = INCLUDE_DIRECTIVE.captures(&line) {
                includes.push(PathBuf::from(&caps[1]));
            }
        }

        let base_dir = c_path.parent().map(Path::to_path_buf).unwrap_or_default();
        for include in includes {
            let include_path = if include.is_absolute() { include } else { base_dir.join(include) };
            self.scan_file(&include_path, current_cobol_file.clone(), visited)?;
        }

        Ok(())
    }

    /// Last-write-wins against the immediately previous entry for the same
    /// (cobol_file, cobol_line) identity (spec.md §4.2 / Testable Property
    /// 2 / Scenario S3).
    fn push_line_entry(&mut self, entry: LineEntry) {
        if let Some(last) = self.lines.last_mut() {
            if last.cobol_file == entry.cobol_file && last.cobol_line == entry.cobol_line {
                *last = entry;
                return;
            }
        }
        self.lines.push(entry);
    }

    fn push_variable_entry(&mut self, entry: VariableEntry) {
        if let Some(existing) = self.variables.iter_mut().find(|v| v.c_name == entry.c_name) {
            *existing = entry;
        } else {
            self.variables.push(entry);
        }
    }

    pub fn lines_count(&self) -> usize {
        self.lines.len()
    }

    /// `c_for(cobol_file, cobol_line) -> line entry or sentinel`.
    pub fn c_for_line(&self, cobol_file: &Path, cobol_line: u32) -> LineEntry {
        let cobol_file = self.resolve(cobol_file);
        self.lines
            .iter()
            .find(|e| e.cobol_file == cobol_file && e.cobol_line == cobol_line)
            .cloned()
            .unwrap_or_else(LineEntry::sentinel)
    }

    /// `cobol_for(c_file, c_line) -> line entry or sentinel`.
    pub fn cobol_for_line(&self, c_file: &Path, c_line: u32) -> LineEntry {
        let c_file = self.resolve(c_file);
        self.lines
            .iter()
            .find(|e| e.c_file == c_file && e.c_line == c_line)
            .cloned()
            .unwrap_or_else(LineEntry::sentinel)
    }

    pub fn has_cobol(&self, c_name: &str) -> bool {
        self.variables.iter().any(|v| v.c_name == c_name)
    }

    /// `cobol_for(c_name) -> cobol_name | none`.
    pub fn cobol_for_name(&self, c_name: &str) -> Option<&str> {
        self.variables.iter().find(|v| v.c_name == c_name).map(|v| v.cobol_name.as_str())
    }

    /// `c_for(cobol_name) -> c_name | none`; the query is stripped of ASCII
    /// double quotes before comparison (spec.md §4.2, Testable Property 4).
    pub fn c_for_name(&self, cobol_name: &str) -> Option<&str> {
        let query = cobol_name.replace('"', "");
        self.variables.iter().find(|v| v.cobol_name == query).map(|v| v.c_name.as_str())
    }
}

fn with_c_extension(cobol_path: &Path) -> PathBuf {
    cobol_path.with_extension("c")
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// A scratch directory under the OS temp dir, removed on drop. Avoids
    /// pulling in a dev-only crate for what's a handful of throwaway files.
    struct ScratchDir(PathBuf);

    impl ScratchDir {
        fn new() -> Self {
            static COUNTER: AtomicU32 = AtomicU32::new(0);
            let n = COUNTER.fetch_add(1, Ordering::SeqCst);
            let path = std::env::temp_dir().join(format!("cobol-dbg-adapter-test-{}-{}", std::process::id(), n));
            std::fs::create_dir_all(&path).unwrap();
            Self(path)
        }

        fn path(&self) -> &Path {
            &self.0
        }
    }

    impl Drop for ScratchDir {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.0);
        }
    }

    fn write_temp(name: &str, contents: &str) -> (ScratchDir, PathBuf) {
        let dir = ScratchDir::new();
        let path = dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        (dir, path)
    }

    #[test]
    fn scenario_s2_marker_plus_two_offset() {
        let mut body = String::from("/* Generated from hello.cbl */\n");
        for _ in 0..19 {
            body.push('\n');
        }
        body.push_str("/* Line: 10 ... : hello.cbl */\n");
        body.push_str("MOVE (x);\n");

        let (dir, c_path) = write_temp("hello.c", &body);
        let mut map = SourceMap::new(dir.path());
        let mut visited = HashSet::new();
        map.scan_file(&c_path, None, &mut visited).unwrap();

        let entry = map.c_for_line(&dir.path().join("hello.cbl"), 10);
        assert_eq!(entry.c_line, 23);
    }

    #[test]
    fn scenario_s3_last_write_wins_and_single_entry() {
        let body = "/* Generated from hello.cbl */\n\
                     /* Line: 10 ... : hello.cbl */\n\
                     ".to_string()
            + &"\n".repeat(52)
            + "/* Line: 10 ... : hello.cbl */\n";

        let (dir, c_path) = write_temp("hello.c", &body);
        let mut map = SourceMap::new(dir.path());
        let mut visited = HashSet::new();
        map.scan_file(&c_path, None, &mut visited).unwrap();

        assert_eq!(map.lines_count(), 1);
        let entry = map.c_for_line(&dir.path().join("hello.cbl"), 10);
        assert_eq!(entry.c_line, 57);
    }

    #[test]
    fn testable_property_1_round_trip() {
        let body = "/* Generated from hello.cbl */\n/* Line: 4 ... : hello.cbl */\nfoo();\n";
        let (dir, c_path) = write_temp("hello.c", body);
        let mut map = SourceMap::new(dir.path());
        let mut visited = HashSet::new();
        map.scan_file(&c_path, None, &mut visited).unwrap();

        let cobol_file = dir.path().join("hello.cbl");
        let by_cobol = map.c_for_line(&cobol_file, 4);
        assert!(!by_cobol.is_sentinel());
        let by_c = map.cobol_for_line(&by_cobol.c_file, by_cobol.c_line);
        assert_eq!(by_c, by_cobol);
    }

    #[test]
    fn testable_property_3_include_recursion() {
        let (dir, included_path) = write_temp(
            "util.c",
            "static cob_u8_t b_9 /* WS-FLAG */;\n",
        );
        let main_body = format!("#include \"{}\"\n", included_path.file_name().unwrap().to_string_lossy());
        let main_path = dir.path().join("main.c");
        std::fs::write(&main_path, main_body).unwrap();

        let mut map = SourceMap::new(dir.path());
        let mut visited = HashSet::new();
        map.scan_file(&main_path, None, &mut visited).unwrap();

        assert!(map.has_cobol("b_9"));
        assert_eq!(map.cobol_for_name("b_9"), Some("WS-FLAG"));
    }

    #[test]
    fn testable_property_4_variable_query_normalization() {
        let mut map = SourceMap::new(".");
        map.push_variable_entry(VariableEntry { cobol_name: "X".to_string(), c_name: "b_1".to_string() });
        assert_eq!(map.c_for_name("\"X\""), map.c_for_name("X"));
    }

    #[test]
    fn missing_mapping_is_sentinel() {
        let map = SourceMap::new(".");
        let entry = map.c_for_line(Path::new("nope.cbl"), 1);
        assert!(entry.is_sentinel());
    }

    #[test]
    fn include_cycle_terminates() {
        let dir = ScratchDir::new();
        let a = dir.path().join("a.c");
        let b = dir.path().join("b.c");
        std::fs::write(&a, "#include \"b.c\"\n").unwrap();
        std::fs::write(&b, "#include \"a.c\"\n").unwrap();

        let mut map = SourceMap::new(dir.path());
        let mut visited = HashSet::new();
        map.scan_file(&a, None, &mut visited).unwrap();
    }
}
