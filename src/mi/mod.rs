//! The MI Session driver (spec.md §4.3): owns the child debugger process,
//! multiplexes tokenized commands against a pending-request table, and
//! dispatches parsed records to handlers or to the event sink.
//!
//! Grounded on the teacher crate's `GDB`/`GDBBuilder` (`mi/mod.rs`), but
//! generalized from "one outstanding command at a time" (the teacher's
//! `execute` rejects with `Busy` while a previous command is in flight) to
//! the concurrent, token-disambiguated model the spec requires: replies can
//! arrive out of order and still resolve the correct caller.

pub mod commands;
pub mod output;

use std::collections::HashMap;
use std::ffi::OsString;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::error::{AppError, AppResult};
use crate::events::{DebugEvent, MsgKind};
use output::{AsyncClass, AsyncKind, Line, MiValue, OutOfBandRecord, ResultClass, ResultRecord, StreamKind, ThreadEvent};

type PendingTable = Arc<Mutex<HashMap<u64, oneshot::Sender<ResultRecord>>>>;

/// Owns the GDB (or compiler) child process's stdin and the pending-request
/// table. Reads happen on a background task spawned in `spawn`.
pub struct Session {
    stdin: Mutex<ChildStdin>,
    child: Mutex<Child>,
    pending: PendingTable,
    next_token: AtomicU64,
    events: mpsc::Sender<DebugEvent>,
}

impl Session {
    /// Spawns `program` with `args`, wiring its stdout through the MI
    /// parser and its stderr straight to the `stderr` event channel. The
    /// child is placed in its own process group (spec.md §6) so `stop`/
    /// `detach` can signal the whole tree.
    pub fn spawn(
        program: &str,
        args: &[OsString],
        cwd: &std::path::Path,
        env: &HashMap<String, Option<String>>,
        events: mpsc::Sender<DebugEvent>,
    ) -> AppResult<Self> {
        let mut command = Command::new(program);
        command.args(args);
        command.current_dir(cwd);
        for (key, value) in env {
            match value {
                Some(v) => {
                    command.env(key, v);
                }
                None => {
                    command.env_remove(key);
                }
            }
        }
        command.stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::piped());

        #[cfg(unix)]
        unsafe {
            command.pre_exec(|| {
                nix::unistd::setsid().map_err(std::io::Error::from)?;
                Ok(())
            });
        }

        info!("spawning {} {:?}", program, args);
        let mut child = command.spawn().map_err(|e| AppError::Spawn { what: "debugger child", source: e })?;

        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(read_loop(stdout, pending.clone(), events.clone()));
        tokio::spawn(forward_stderr(stderr, events.clone()));

        Ok(Self {
            stdin: Mutex::new(stdin),
            child: Mutex::new(child),
            pending,
            next_token: AtomicU64::new(1),
            events,
        })
    }

    fn new_token(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::SeqCst)
    }

    /// Sends `command` with a fresh token, registers a one-shot handler for
    /// it, and awaits the reply. An `error`-class reply rejects the future.
    pub async fn execute(&self, command: &commands::MiCommand) -> AppResult<ResultRecord> {
        let record = self.execute_raw(command).await?;
        if record.class == ResultClass::Error {
            let msg = record.results.get_str("msg").unwrap_or("unknown error").to_string();
            return Err(AppError::Mi { command: command.operation.to_string(), msg });
        }
        Ok(record)
    }

    /// Like `execute`, but resolves with the error record instead of
    /// rejecting, for commands known to be best-effort (spec.md §4.3).
    pub async fn execute_suppressing_failure(&self, command: &commands::MiCommand) -> AppResult<ResultRecord> {
        self.execute_raw(command).await
    }

    async fn execute_raw(&self, command: &commands::MiCommand) -> AppResult<ResultRecord> {
        let token = self.new_token();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(token, tx);

        let write_result = {
            let mut stdin = self.stdin.lock().await;
            command.write_interpreter_string(&mut *stdin, token).await
        };
        if let Err(e) = write_result {
            self.pending.lock().await.remove(&token);
            return Err(AppError::IoError(e));
        }

        rx.await.map_err(|_| AppError::GdbQuit)
    }

    /// Sends a tokenized command built from arbitrary text rather than a
    /// `MiCommand`, for `sendUserInput` lines that already begin with `-`
    /// (spec.md §4.4: "pass as MI, minus the leading `-`").
    pub async fn execute_text(&self, text: &str) -> AppResult<ResultRecord> {
        let token = self.new_token();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(token, tx);

        let line = format!("{}-{}\n", token, text);
        let write_result = {
            let mut stdin = self.stdin.lock().await;
            stdin.write_all(line.as_bytes()).await
        };
        if let Err(e) = write_result {
            self.pending.lock().await.remove(&token);
            return Err(AppError::IoError(e));
        }

        rx.await.map_err(|_| AppError::GdbQuit)
    }

    /// Waits for the child to exit, e.g. the compiler in `no_debug` mode
    /// (spec.md §9 open question: resolve on `exit` for parity).
    pub async fn wait(&self) -> AppResult<std::process::ExitStatus> {
        let mut child = self.child.lock().await;
        child.wait().await.map_err(AppError::IoError)
    }

    /// Writes a raw line with no token, for `-gdb-exit`/`-target-detach`
    /// (spec.md §4.3: "send -gdb-exit or -target-detach, arm a 1 second
    /// watchdog").
    async fn send_raw_line(&self, line: &str) -> AppResult<()> {
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(format!("{}\n", line).as_bytes())
            .await
            .map_err(AppError::IoError)
    }

    pub async fn stop(&self, watchdog: Duration) -> AppResult<()> {
        self.send_raw_line("-gdb-exit").await?;
        self.wait_or_kill(watchdog).await
    }

    pub async fn detach(&self, watchdog: Duration) -> AppResult<()> {
        self.send_raw_line("-target-detach").await?;
        self.wait_or_kill(watchdog).await
    }

    async fn wait_or_kill(&self, watchdog: Duration) -> AppResult<()> {
        let mut child = self.child.lock().await;
        let mut controller = ChildController { child: &mut *child };
        stop_with_controller(&mut controller, watchdog).await;
        Ok(())
    }
}

/// Abstraction over "wait for the child to exit" / "kill its process
/// group", so the watchdog timing logic (spec.md Testable Property 7) can
/// be exercised against a fake process in tests without spawning GDB.
trait ProcessController {
    async fn wait(&mut self);
    async fn kill_group(&mut self);
}

struct ChildController<'a> {
    child: &'a mut Child,
}

impl ProcessController for ChildController<'_> {
    async fn wait(&mut self) {
        let _ = self.child.wait().await;
    }

    async fn kill_group(&mut self) {
        #[cfg(unix)]
        {
            if let Some(pid) = self.child.id() {
                use nix::sys::signal::{Signal, killpg};
                use nix::unistd::Pid;
                if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                    warn!("killpg failed: {}", e);
                }
                return;
            }
        }
        let _ = self.child.kill().await;
    }
}

async fn stop_with_controller<C: ProcessController>(controller: &mut C, watchdog: Duration) {
    if tokio::time::timeout(watchdog, controller.wait()).await.is_err() {
        warn!("watchdog expired after {:?}, killing process group", watchdog);
        controller.kill_group().await;
    }
}

async fn read_loop<R: AsyncRead + Unpin>(mut stdout: R, pending: PendingTable, events: mpsc::Sender<DebugEvent>) {
    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = match stdout.read(&mut chunk).await {
            Ok(0) => {
                let _ = events.send(DebugEvent::Quit).await;
                return;
            }
            Ok(n) => n,
            Err(e) => {
                error!("reading MI stdout: {}", e);
                let _ = events.send(DebugEvent::Quit).await;
                return;
            }
        };
        buf.extend_from_slice(&chunk[..n]);

        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let line_bytes: Vec<u8> = buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line_bytes).into_owned();
            handle_line(&line, &pending, &events).await;
        }

        if !buf.is_empty() {
            let partial = String::from_utf8_lossy(&buf).into_owned();
            if !output::could_be_mi_prefix(&partial) {
                let _ = events.send(DebugEvent::Msg(MsgKind::Stdout, partial)).await;
                buf.clear();
            }
        }
    }
}

async fn handle_line(line: &str, pending: &PendingTable, events: &mpsc::Sender<DebugEvent>) {
    let trimmed_for_classification = line.trim_end_matches(['\n', '\r']);
    if !output::looks_like_mi_line(trimmed_for_classification) {
        let _ = events.send(DebugEvent::Msg(MsgKind::Stdout, line.to_string())).await;
        return;
    }

    debug!("MI line: {}", line.trim_end());
    let parsed = match Line::parse(line) {
        Ok(l) => l,
        Err(e) => {
            let _ = events
                .send(DebugEvent::Msg(MsgKind::Log, format!("malformed MI record: {}", e)))
                .await;
            return;
        }
    };

    match parsed {
        Line::Result(record) => handle_result(record, pending, events).await,
        Line::OutOfBand(oob) => handle_oob(oob, events).await,
        Line::Prompt => {}
    }
}

async fn handle_result(record: ResultRecord, pending: &PendingTable, events: &mpsc::Sender<DebugEvent>) {
    if let Some(token) = record.token {
        let handler = pending.lock().await.remove(&token);
        if let Some(tx) = handler {
            let _ = tx.send(record);
            return;
        }
        if record.class != ResultClass::Error {
            warn!("Unhandled: no pending request for token {}", token);
            return;
        }
    }
    if record.class == ResultClass::Error {
        let msg = record.results.get_str("msg").unwrap_or("unknown error").to_string();
        let _ = events.send(DebugEvent::Msg(MsgKind::Stderr, msg)).await;
    }
}

async fn handle_oob(oob: OutOfBandRecord, events: &mpsc::Sender<DebugEvent>) {
    match oob {
        OutOfBandRecord::StreamRecord { kind, data } => {
            let msg_kind = match kind {
                StreamKind::Console => MsgKind::Console,
                StreamKind::Target => MsgKind::Target,
                StreamKind::Log => MsgKind::Log,
            };
            let _ = events.send(DebugEvent::Msg(msg_kind, data)).await;
        }
        OutOfBandRecord::AsyncRecord { kind, class, results, .. } => match kind {
            AsyncKind::Exec => handle_exec_async(class, &results, events).await,
            AsyncKind::Notify => handle_notify(class, &results, events).await,
            AsyncKind::Status => {
                let _ = events.send(DebugEvent::ExecAsyncOutput(results.to_json())).await;
            }
        },
    }
}

async fn handle_exec_async(class: AsyncClass, results: &MiValue, events: &mpsc::Sender<DebugEvent>) {
    match class {
        AsyncClass::Running => {
            let _ = events.send(DebugEvent::Running).await;
        }
        AsyncClass::Stopped => {
            let reason = results.get_str("reason").unwrap_or("");
            let event = match reason {
                "breakpoint-hit" => DebugEvent::Breakpoint,
                "end-stepping-range" => DebugEvent::StepEnd,
                "function-finished" => DebugEvent::StepOutEnd,
                "signal-received" => DebugEvent::SignalStop,
                "exited-normally" => DebugEvent::ExitedNormally,
                "exited" => {
                    info!("inferior exited with code {}", results.get_str("exit-code").unwrap_or("?"));
                    DebugEvent::ExitedNormally
                }
                other => {
                    warn!("unrecognized stop reason {:?}, assuming exception", other);
                    DebugEvent::Stopped
                }
            };
            let _ = events.send(event).await;
        }
        _ => {
            let _ = events.send(DebugEvent::ExecAsyncOutput(results.to_json())).await;
        }
    }
}

async fn handle_notify(class: AsyncClass, results: &MiValue, events: &mpsc::Sender<DebugEvent>) {
    match class {
        AsyncClass::Thread(ThreadEvent::Created) => {
            let id = results.get_str("id").unwrap_or_default().to_string();
            let _ = events.send(DebugEvent::ThreadCreated(id)).await;
        }
        AsyncClass::Thread(ThreadEvent::Exited) => {
            let id = results.get_str("id").unwrap_or_default().to_string();
            let _ = events.send(DebugEvent::ThreadExited(id)).await;
        }
        _ => {}
    }
}

async fn forward_stderr<R: AsyncRead + Unpin>(stderr: R, events: mpsc::Sender<DebugEvent>) {
    let mut reader = BufReader::new(stderr);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => return,
            Ok(_) => {
                let _ = events.send(DebugEvent::Msg(MsgKind::Stderr, line.clone())).await;
            }
            Err(e) => {
                error!("reading MI stderr: {}", e);
                return;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicBool;

    struct FakeController {
        exits: bool,
        killed: Arc<AtomicBool>,
    }

    impl ProcessController for FakeController {
        async fn wait(&mut self) {
            if self.exits {
                return;
            }
            std::future::pending::<()>().await
        }

        async fn kill_group(&mut self) {
            self.killed.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn watchdog_kills_unresponsive_child() {
        let killed = Arc::new(AtomicBool::new(false));
        let mut controller = FakeController { exits: false, killed: killed.clone() };
        stop_with_controller(&mut controller, Duration::from_millis(30)).await;
        assert!(killed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn watchdog_does_not_kill_cooperative_child() {
        let killed = Arc::new(AtomicBool::new(false));
        let mut controller = FakeController { exits: true, killed: killed.clone() };
        stop_with_controller(&mut controller, Duration::from_millis(30)).await;
        assert!(!killed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn token_multiplexing_out_of_order_replies() {
        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        pending.lock().await.insert(1, tx1);
        pending.lock().await.insert(2, tx2);

        let (events_tx, _events_rx) = mpsc::channel(8);

        // Reply to token 2 first, then token 1: replies interleave, each
        // caller still gets the record meant for it.
        handle_line("2^done,x=\"two\"\n", &pending, &events_tx).await;
        handle_line("1^done,x=\"one\"\n", &pending, &events_tx).await;

        let r1 = rx1.await.unwrap();
        let r2 = rx2.await.unwrap();
        assert_eq!(r1.results.get_str("x"), Some("one"));
        assert_eq!(r2.results.get_str("x"), Some("two"));
        assert!(pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn unclaimed_error_goes_to_stderr_channel() {
        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));
        let (events_tx, mut events_rx) = mpsc::channel(8);

        handle_line("99^error,msg=\"no symbol table\"\n", &pending, &events_tx).await;

        match events_rx.recv().await {
            Some(DebugEvent::Msg(MsgKind::Stderr, msg)) => assert_eq!(msg, "no symbol table"),
            other => panic!("expected a stderr message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn stop_reason_breakpoint_hit_emits_breakpoint_event() {
        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));
        let (events_tx, mut events_rx) = mpsc::channel(8);

        handle_line("*stopped,reason=\"breakpoint-hit\",bkptno=\"1\"\n", &pending, &events_tx).await;

        match events_rx.recv().await {
            Some(DebugEvent::Breakpoint) => {}
            other => panic!("expected Breakpoint event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn inferior_output_is_forwarded_verbatim() {
        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));
        let (events_tx, mut events_rx) = mpsc::channel(8);

        handle_line("Hello from the COBOL program\n", &pending, &events_tx).await;

        match events_rx.recv().await {
            Some(DebugEvent::Msg(MsgKind::Stdout, text)) => {
                assert_eq!(text, "Hello from the COBOL program\n")
            }
            other => panic!("expected a stdout message, got {:?}", other),
        }
    }
}
