//! Typed event channel surfaced to the debug-UI front end.
//!
//! Replaces the teacher's dynamic publish/subscribe surface with a closed
//! enumeration (spec.md §9 "Event emitter -> typed channels").

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgKind {
    Stdout,
    Stderr,
    Console,
    Log,
    Target,
}

#[derive(Debug, Clone)]
pub enum DebugEvent {
    /// Text on one of the UI-facing channels (inferior stdout, unclaimed MI
    /// errors, or a forwarded MI stream record).
    Msg(MsgKind, String),
    /// The child (compiler or GDB) exited or was never reachable.
    Quit,
    /// Spawning a child process failed outright.
    LaunchError(String),
    /// `load`/`connect` finished its init sequence.
    DebugReady,
    /// An async-exec record with class `running` arrived.
    Running,
    /// Stop reason `breakpoint-hit`.
    Breakpoint,
    /// Stop reason `end-stepping-range`.
    StepEnd,
    /// Stop reason `function-finished`.
    StepOutEnd,
    /// Stop reason `signal-received`.
    SignalStop,
    /// Stop reason `exited-normally`, or `exited` after logging the code.
    ExitedNormally,
    /// Stop reason not recognized; treated as "assume exception".
    Stopped,
    /// Notify record `thread-created`.
    ThreadCreated(String),
    /// Notify record `thread-exited`.
    ThreadExited(String),
    /// Any other async-exec record, passed through verbatim for callers that
    /// want the raw MI payload.
    ExecAsyncOutput(Value),
}
