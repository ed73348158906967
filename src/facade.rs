//! The Debugger Facade (spec.md §4.4): the high-level operations a debug-UI
//! front end drives, composing the MI Session and the Source Map and
//! translating COBOL <-> C coordinates at every boundary.
//!
//! Grounded on the *shape* of the teacher crate's `gdb.rs` `GDBManager` (one
//! method per debugger operation, a table keyed by id), but every method
//! body is a real MI round-trip plus Source Map translation instead of the
//! teacher's in-memory stubs.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{Mutex, oneshot};
use tracing::warn;

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::events::DebugEvent;
use crate::mi::Session;
use crate::mi::commands::{BreakPointLocation, BreakPointNumber, MiCommand};
use crate::mi::output::{MiValue, ResultClass};
use crate::models::{Breakpoint, BreakpointRecord, DebugThread, StackFrame, StackVariable, VarObject};
use crate::sourcemap::SourceMap;

pub struct DebuggerFacade {
    config: Config,
    events: tokio::sync::mpsc::Sender<DebugEvent>,
    session: Mutex<Option<Arc<Session>>>,
    source_map: Mutex<Option<SourceMap>>,
    breakpoints: Mutex<HashMap<BreakPointNumber, (Breakpoint, BreakpointRecord)>>,
}

impl DebuggerFacade {
    pub fn new(config: Config, events: tokio::sync::mpsc::Sender<DebugEvent>) -> Self {
        Self {
            config,
            events,
            session: Mutex::new(None),
            source_map: Mutex::new(None),
            breakpoints: Mutex::new(HashMap::new()),
        }
    }

    async fn current_session(&self) -> AppResult<Arc<Session>> {
        self.session.lock().await.clone().ok_or_else(|| AppError::NotFound("no active debug session".to_string()))
    }

    /// **load(cwd, target, group)** (spec.md §4.4).
    pub async fn load(
        &self,
        cwd: &Path,
        target: &Path,
        group: &[PathBuf],
        env: &HashMap<String, Option<String>>,
        no_debug: bool,
    ) -> AppResult<()> {
        let mut compiler_args: Vec<OsString> =
            self.config.cobc_args.iter().map(|s| OsString::from(s.as_str())).collect();
        if no_debug {
            compiler_args.push(OsString::from("-j"));
        } else {
            for flag in ["-g", "-d", "-fdebugging-line", "-fsource-location", "-ftraceall"] {
                compiler_args.push(OsString::from(flag));
            }
        }
        compiler_args.push(OsString::from(target.as_os_str()));
        compiler_args.extend(group.iter().map(|p| OsString::from(p.as_os_str())));

        let compiler = Arc::new(Session::spawn(&self.config.cobc_path, &compiler_args, cwd, env, self.events.clone())?);
        *self.session.lock().await = Some(compiler.clone());
        let status = compiler.wait().await?;

        if no_debug {
            // Open question (spec.md §9): the source never resolves or
            // rejects this future. We resolve on exit for parity.
            return Ok(());
        }

        if !status.success() {
            let _ = self.events.send(DebugEvent::Quit).await;
            return Err(AppError::CompileFailed(status.code().unwrap_or(-1)));
        }

        let mut cobol_paths = vec![target.to_path_buf()];
        cobol_paths.extend(group.iter().cloned());
        let source_map = SourceMap::build(cwd, &cobol_paths)?;
        *self.source_map.lock().await = Some(source_map);

        let executable = derive_executable_path(target);
        let gdb_args = vec![OsString::from("-q"), OsString::from("--interpreter=mi2")];
        let session = Arc::new(Session::spawn(&self.config.gdb_path, &gdb_args, cwd, env, self.events.clone())?);
        *self.session.lock().await = Some(session.clone());

        session.execute_suppressing_failure(&MiCommand::gdb_set("target-async", "on")).await?;
        session.execute_suppressing_failure(&MiCommand::environment_directory(cwd)).await?;
        session.execute(&MiCommand::file_exec_and_symbols(&executable)).await?;

        let _ = self.events.send(DebugEvent::DebugReady).await;
        Ok(())
    }

    /// **connect(cwd, executable, target)** (spec.md §4.4).
    pub async fn connect(
        &self,
        cwd: &Path,
        executable: Option<&Path>,
        target: &str,
        env: &HashMap<String, Option<String>>,
    ) -> AppResult<()> {
        let mut gdb_args = vec![OsString::from("-q"), OsString::from("--interpreter=mi2")];
        if let Some(exe) = executable {
            gdb_args.push(OsString::from(exe.as_os_str()));
        }
        let session = Arc::new(Session::spawn(&self.config.gdb_path, &gdb_args, cwd, env, self.events.clone())?);
        *self.session.lock().await = Some(session.clone());

        session.execute_suppressing_failure(&MiCommand::gdb_set("target-async", "on")).await?;
        session.execute_suppressing_failure(&MiCommand::environment_directory(cwd)).await?;
        session.execute(&MiCommand::target_select_remote(target)).await?;

        let _ = self.events.send(DebugEvent::DebugReady).await;
        Ok(())
    }

    /// **start()**: awaits the UI's one-shot "breakpoints installed"
    /// rendezvous, then `exec-run`.
    pub async fn start(&self, ui_break_done: oneshot::Receiver<()>) -> AppResult<bool> {
        let _ = ui_break_done.await;
        let session = self.current_session().await?;
        let record = session.execute(&MiCommand::exec_run()).await?;
        Ok(record.class == ResultClass::Running)
    }

    async fn resolves_running(&self, command: MiCommand) -> AppResult<bool> {
        let session = self.current_session().await?;
        let record = session.execute(&command).await?;
        Ok(record.class == ResultClass::Running)
    }

    pub async fn r#continue(&self, reverse: bool) -> AppResult<bool> {
        self.resolves_running(MiCommand::exec_continue(reverse)).await
    }

    pub async fn next(&self, reverse: bool) -> AppResult<bool> {
        self.resolves_running(MiCommand::exec_next(reverse)).await
    }

    pub async fn step(&self, reverse: bool) -> AppResult<bool> {
        self.resolves_running(MiCommand::exec_step(reverse)).await
    }

    pub async fn step_out(&self, reverse: bool) -> AppResult<bool> {
        self.resolves_running(MiCommand::exec_finish(reverse)).await
    }

    pub async fn interrupt(&self) -> AppResult<bool> {
        let session = self.current_session().await?;
        let record = session.execute(&MiCommand::exec_interrupt()).await?;
        Ok(record.class == ResultClass::Done)
    }

    pub async fn goto(&self, file: &Path, line: u32) -> AppResult<()> {
        let session = self.current_session().await?;
        let (c_file, c_line) = self.translate_to_c(file, line).await?;
        let location = format!("{}:{}", c_file.display(), c_line);
        session
            .execute(&MiCommand::insert_breakpoint("-t ", BreakPointLocation::Raw(&location)))
            .await?;
        session.execute(&MiCommand::exec_jump(&location)).await?;
        Ok(())
    }

    async fn translate_to_c(&self, file: &Path, line: u32) -> AppResult<(PathBuf, u32)> {
        let guard = self.source_map.lock().await;
        let map = guard.as_ref().ok_or_else(|| AppError::NotFound("source map not built".to_string()))?;
        let entry = map.c_for_line(file, line);
        if entry.is_sentinel() {
            return Err(AppError::MissingMapping(format!("{}:{}", file.display(), line)));
        }
        Ok((entry.c_file, entry.c_line))
    }

    /// **addBreakPoint(bp)**: de-duplicates against the live table, builds
    /// the count-condition prefix, resolves the location through the Source
    /// Map (or uses `bp.raw` verbatim), and installs it.
    pub async fn add_break_point(&self, bp: &Breakpoint) -> AppResult<BreakpointRecord> {
        {
            let table = self.breakpoints.lock().await;
            if let Some((_, existing)) = table.values().find(|(existing_bp, _)| breakpoints_match(existing_bp, bp)) {
                return Ok(existing.clone());
            }
        }

        let prefix = count_condition_prefix(bp.count_condition.as_deref());

        let location_string;
        let location = if let Some(raw) = &bp.raw {
            BreakPointLocation::Raw(raw.as_str())
        } else {
            let file = bp.file.as_ref().ok_or_else(|| AppError::InvalidArgument("breakpoint needs file+line or raw".to_string()))?;
            let line = bp.line.ok_or_else(|| AppError::InvalidArgument("breakpoint needs file+line or raw".to_string()))?;
            let (c_file, c_line) = self.translate_to_c(file, line).await?;
            location_string = format!("{}:{}", c_file.display(), c_line);
            BreakPointLocation::Raw(&location_string)
        };

        let session = self.current_session().await?;
        let record = session.execute(&MiCommand::insert_breakpoint(&prefix, location)).await?;

        let gdb_id: BreakPointNumber = record
            .results
            .get_str("bkpt.number")
            .ok_or_else(|| AppError::MalformedRecord("break-insert result missing bkpt.number".to_string()))?
            .parse()
            .map_err(AppError::InvalidArgument)?;

        let (cobol_file, cobol_line) = match (record.results.get_str("bkpt.file"), record.results.get_str("bkpt.line")) {
            (Some(c_file), Some(c_line)) => {
                let c_line: u32 = c_line.parse().unwrap_or(0);
                let guard = self.source_map.lock().await;
                match guard.as_ref() {
                    Some(map) => {
                        let entry = map.cobol_for_line(Path::new(c_file), c_line);
                        if entry.is_sentinel() { (None, None) } else { (Some(entry.cobol_file), Some(entry.cobol_line)) }
                    }
                    None => (None, None),
                }
            }
            _ => (None, None),
        };

        let breakpoint_record = BreakpointRecord { gdb_id, file: cobol_file, line: cobol_line };

        if let Some(condition) = &bp.condition {
            if session.execute(&MiCommand::break_condition(gdb_id, condition)).await.is_err() {
                warn!("break-condition failed for breakpoint {}", gdb_id);
            }
        }

        self.breakpoints.lock().await.insert(gdb_id, (bp.clone(), breakpoint_record.clone()));
        Ok(breakpoint_record)
    }

    pub async fn remove_break_point(&self, number: BreakPointNumber) -> AppResult<()> {
        let session = self.current_session().await?;
        session.execute(&MiCommand::delete_breakpoint(number)).await?;
        self.breakpoints.lock().await.remove(&number);
        Ok(())
    }

    pub async fn clear_break_points(&self) -> AppResult<()> {
        let session = self.current_session().await?;
        session.execute(&MiCommand::delete_all_breakpoints()).await?;
        self.breakpoints.lock().await.clear();
        Ok(())
    }

    pub async fn get_threads(&self) -> AppResult<Vec<DebugThread>> {
        let session = self.current_session().await?;
        let record = session.execute(&MiCommand::thread_info(None)).await?;
        let threads = record.results.get_path("threads").and_then(MiValue::as_list).unwrap_or(&[]);
        Ok(threads
            .iter()
            .filter_map(|t| {
                let id = t.get_str("id")?.parse().ok()?;
                let target_id = t.get_str("target-id").unwrap_or_default().to_string();
                let name = t.get_str("name").map(str::to_string);
                Some(DebugThread { id, target_id, name })
            })
            .collect())
    }

    pub async fn get_stack(&self, max_levels: Option<usize>, thread: Option<u64>) -> AppResult<Vec<StackFrame>> {
        let session = self.current_session().await?;
        let record = session.execute(&MiCommand::stack_list_frames(thread, max_levels)).await?;
        let frames = record.results.get_path("stack").and_then(MiValue::as_list).unwrap_or(&[]);

        let guard = self.source_map.lock().await;
        let mut out = Vec::with_capacity(frames.len());
        for frame in frames {
            let level = frame.get_str("level").and_then(|v| v.parse().ok()).unwrap_or(0);
            let address = frame.get_str("addr").map(str::to_string);
            let function = frame.get_str("func").or_else(|| frame.get_str("from")).unwrap_or("??").to_string();
            let c_file = frame.get_str("fullname").or_else(|| frame.get_str("file"));
            let c_line: u32 = frame.get_str("line").and_then(|v| v.parse().ok()).unwrap_or(0);

            let (file, line) = match (c_file, guard.as_ref()) {
                (Some(c_file), Some(map)) => {
                    let entry = map.cobol_for_line(Path::new(c_file), c_line);
                    if entry.is_sentinel() { (PathBuf::from(c_file), c_line) } else { (entry.cobol_file, entry.cobol_line) }
                }
                (Some(c_file), None) => (PathBuf::from(c_file), c_line),
                (None, _) => (PathBuf::new(), c_line),
            };
            let file_basename = file.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();

            out.push(StackFrame { level, address, function, file, file_basename, line });
        }
        Ok(out)
    }

    pub async fn get_stack_variables(&self, thread: Option<u64>, frame: Option<u64>) -> AppResult<Vec<StackVariable>> {
        let session = self.current_session().await?;
        let record = session.execute(&MiCommand::stack_list_variables(thread, frame)).await?;
        let variables = record.results.get_path("variables").and_then(MiValue::as_list).unwrap_or(&[]);

        let guard = self.source_map.lock().await;
        let map = match guard.as_ref() {
            Some(m) => m,
            None => return Ok(vec![]),
        };

        Ok(variables
            .iter()
            .filter_map(|v| {
                let c_name = v.get_str("name")?;
                if !map.has_cobol(c_name) {
                    return None;
                }
                let cobol_name = map.cobol_for_name(c_name)?.to_string();
                let value_str = v.get_str("value").unwrap_or_default().to_string();
                let r#type = v.get_str("type").map(str::to_string);
                Some(StackVariable { name: cobol_name, value_str, r#type, raw: v.to_json() })
            })
            .collect())
    }

    pub async fn eval_expression(&self, name: &str, thread: Option<u64>, frame: Option<u64>) -> AppResult<String> {
        let c_name = {
            let guard = self.source_map.lock().await;
            let map = guard.as_ref().ok_or_else(|| AppError::NotFound("source map not built".to_string()))?;
            map.c_for_name(name).map(str::to_string).ok_or_else(|| AppError::MissingMapping(name.to_string()))?
        };
        let session = self.current_session().await?;
        let record = session.execute(&MiCommand::data_evaluate_expression(&c_name, thread, frame)).await?;
        Ok(record.results.get_str("value").unwrap_or_default().to_string())
    }

    pub async fn examine_memory(&self, from: u64, length: usize) -> AppResult<String> {
        let session = self.current_session().await?;
        let record = session.execute(&MiCommand::data_read_memory_bytes(from, length)).await?;
        record
            .results
            .get_path("memory.0.contents")
            .and_then(MiValue::as_str)
            .map(str::to_string)
            .ok_or_else(|| AppError::MalformedRecord("data-read-memory-bytes result missing contents".to_string()))
    }

    pub async fn var_create(&self, name: Option<&str>, expression: &str) -> AppResult<VarObject> {
        let session = self.current_session().await?;
        let record = session.execute(&MiCommand::var_create(name, expression)).await?;
        Ok(var_object_from_record(&record.results, expression))
    }

    pub async fn var_evaluate_expression(&self, name: &str) -> AppResult<String> {
        let session = self.current_session().await?;
        let record = session.execute(&MiCommand::var_evaluate_expression(name)).await?;
        Ok(record.results.get_str("value").unwrap_or_default().to_string())
    }

    pub async fn var_list_children(&self, name: &str) -> AppResult<Vec<VarObject>> {
        let session = self.current_session().await?;
        let record = session.execute(&MiCommand::var_list_children(name)).await?;
        let children = record.results.get_path("children").and_then(MiValue::as_list).unwrap_or(&[]);
        Ok(children.iter().map(|c| var_object_from_record(c, "")).collect())
    }

    pub async fn var_update(&self, name: &str) -> AppResult<Vec<VarObject>> {
        let session = self.current_session().await?;
        let record = session.execute(&MiCommand::var_update(name)).await?;
        let changes = record.results.get_path("changelist").and_then(MiValue::as_list).unwrap_or(&[]);
        Ok(changes.iter().map(|c| var_object_from_record(c, "")).collect())
    }

    pub async fn var_assign(&self, name: &str, expression: &str) -> AppResult<String> {
        let session = self.current_session().await?;
        let record = session.execute(&MiCommand::var_assign(name, expression)).await?;
        Ok(record.results.get_str("value").unwrap_or_default().to_string())
    }

    /// **sendUserInput**: a line beginning with `-` is forwarded as raw MI
    /// (minus the leading `-`); otherwise it's wrapped in
    /// `interpreter-exec console`.
    pub async fn send_user_input(&self, line: &str, thread: Option<u64>, frame: Option<u64>) -> AppResult<()> {
        let session = self.current_session().await?;
        if let Some(rest) = line.strip_prefix('-') {
            session.execute_text(rest).await?;
        } else {
            session.execute(&MiCommand::interpreter_exec_console(line, thread, frame)).await?;
        }
        Ok(())
    }

    pub async fn stop(&self) -> AppResult<()> {
        let session = self.current_session().await?;
        session.stop(self.config.watchdog_timeout).await
    }

    pub async fn detach(&self) -> AppResult<()> {
        let session = self.current_session().await?;
        session.detach(self.config.watchdog_timeout).await
    }
}

fn derive_executable_path(target: &Path) -> PathBuf {
    let stem = target.with_extension("");
    if cfg!(windows) { stem.with_extension("exe") } else { stem }
}

fn count_condition_prefix(count_condition: Option<&str>) -> String {
    match count_condition {
        None => String::new(),
        Some(cc) => {
            if let Some(rest) = cc.strip_prefix('>') {
                match rest.trim().parse::<u64>() {
                    Ok(n) => format!("-i {} ", n),
                    Err(_) => {
                        warn!("Unsupported break count expression: {}", cc);
                        "-t ".to_string()
                    }
                }
            } else if let Ok(n) = cc.trim().parse::<u64>() {
                if n != 0 { format!("-t -i {} ", n) } else { "-t ".to_string() }
            } else {
                warn!("Unsupported break count expression: {}", cc);
                "-t ".to_string()
            }
        }
    }
}

fn breakpoints_match(a: &Breakpoint, b: &Breakpoint) -> bool {
    if let (Some(raw_a), Some(raw_b)) = (&a.raw, &b.raw) {
        return raw_a == raw_b;
    }
    a.file == b.file && a.line == b.line
}

fn var_object_from_record(v: &MiValue, fallback_exp: &str) -> VarObject {
    VarObject {
        name: v.get_str("name").unwrap_or_default().to_string(),
        exp: v.get_str("exp").unwrap_or(fallback_exp).to_string(),
        numchild: v.get_str("numchild").and_then(|n| n.parse().ok()).unwrap_or(0),
        r#type: v.get_str("type").map(str::to_string),
        value: v.get_str("value").map(str::to_string),
        thread_id: v.get_str("thread-id").map(str::to_string),
        frozen: v.get_str("frozen").map(|f| f == "1").unwrap_or(false),
        dynamic: v.get_str("dynamic").map(|f| f == "1").unwrap_or(false),
        displayhint: v.get_str("displayhint").map(str::to_string),
        has_more: v.get_str("has_more").map(|f| f == "1").unwrap_or(false),
        id: v.get_str("name").unwrap_or_default().to_string(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn scenario_s5_count_condition_raw_breakpoint() {
        assert_eq!(count_condition_prefix(Some(">3")), "-i 3 ");
    }

    #[test]
    fn count_condition_bare_number_nonzero() {
        assert_eq!(count_condition_prefix(Some("3")), "-t -i 3 ");
    }

    #[test]
    fn count_condition_bare_zero_is_just_temporary() {
        assert_eq!(count_condition_prefix(Some("0")), "-t ");
    }

    #[test]
    fn count_condition_unsupported_falls_back_to_temporary() {
        assert_eq!(count_condition_prefix(Some("nonsense")), "-t ");
    }

    #[test]
    fn count_condition_absent_is_a_persistent_breakpoint() {
        assert_eq!(count_condition_prefix(None), "");
    }

    #[test]
    fn breakpoint_dedup_matches_on_raw() {
        let a = Breakpoint { raw: Some("main".to_string()), ..Default::default() };
        let b = Breakpoint { raw: Some("main".to_string()), ..Default::default() };
        assert!(breakpoints_match(&a, &b));
    }

    #[test]
    fn breakpoint_dedup_matches_on_file_line() {
        let a = Breakpoint { file: Some(PathBuf::from("/a/hello.cbl")), line: Some(10), ..Default::default() };
        let b = Breakpoint { file: Some(PathBuf::from("/a/hello.cbl")), line: Some(10), ..Default::default() };
        assert!(breakpoints_match(&a, &b));
        let c = Breakpoint { file: Some(PathBuf::from("/a/hello.cbl")), line: Some(11), ..Default::default() };
        assert!(!breakpoints_match(&a, &c));
    }
}
