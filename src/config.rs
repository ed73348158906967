use std::time::Duration;

#[derive(Debug, Clone)]
/// Adapter configuration
pub struct Config {
    /// Path to the `cobc` COBOL-to-C compiler
    pub cobc_path: String,
    /// Extra arguments always passed to `cobc`
    pub cobc_args: Vec<String>,
    /// Path to the `gdb` executable
    pub gdb_path: String,
    /// Timeout for a single MI command round-trip
    pub command_timeout: Duration,
    /// How long `stop`/`detach` wait before killing the child process group
    pub watchdog_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cobc_path: std::env::var("COBC_PATH").unwrap_or_else(|_| "cobc".to_string()),
            cobc_args: std::env::var("COBC_ARGS")
                .ok()
                .map(|v| v.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            gdb_path: std::env::var("GDB_PATH").unwrap_or_else(|_| "gdb".to_string()),
            command_timeout: Duration::from_secs(
                std::env::var("MI_COMMAND_TIMEOUT")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(10),
            ),
            watchdog_timeout: Duration::from_millis(
                std::env::var("MI_WATCHDOG_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(1000),
            ),
        }
    }
}
