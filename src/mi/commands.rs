use std::ffi::OsString;
use std::fmt;
use std::io::Error;
use std::path::Path;

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::info;

#[derive(Debug, Clone, Default)]
pub struct MiCommand {
    pub operation: &'static str,
    pub options: Option<Vec<OsString>>,
    pub parameters: Option<Vec<OsString>>,
}

pub enum BreakPointLocation<'a> {
    /// An opaque location string, used verbatim (escaped, quoted) — for
    /// `Breakpoint::raw`.
    Raw(&'a str),
    /// `file:line`, resolved via the Source Map.
    FileLine(&'a Path, usize),
}

#[derive(Copy, Clone, Hash, PartialEq, Eq)]
pub struct BreakPointNumber {
    pub major: usize,
    pub minor: Option<usize>,
}

impl std::str::FromStr for BreakPointNumber {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(dot_pos) = s.find('.') {
            let major = s[..dot_pos].parse::<usize>().map_err(|e| e.to_string())?;
            let minor = s[dot_pos + 1..].parse::<usize>().map_err(|e| e.to_string())?;
            Ok(BreakPointNumber { major, minor: Some(minor) })
        } else {
            s.parse::<usize>()
                .map(|major| BreakPointNumber { major, minor: None })
                .map_err(|e| e.to_string())
        }
    }
}

impl fmt::Display for BreakPointNumber {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.minor {
            Some(minor) => write!(f, "{}.{}", self.major, minor),
            None => write!(f, "{}", self.major),
        }
    }
}

impl fmt::Debug for BreakPointNumber {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl Serialize for BreakPointNumber {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

fn escape_command(input: &str) -> String {
    let mut output = '\"'.to_string();
    for c in input.chars() {
        match c {
            '\\' => output.push_str("\\\\"),
            '\"' => output.push_str("\\\""),
            '\r' => output.push_str("\\\r"),
            '\n' => output.push_str("\\\n"),
            other => output.push(other),
        }
    }
    output.push('\"');
    output
}

impl MiCommand {
    pub async fn write_interpreter_string<S: AsyncWriteExt + Unpin>(
        &self,
        sink: &mut S,
        token: u64,
    ) -> Result<(), Error> {
        let mut command = OsString::new();
        if !self.operation.is_empty() {
            command.push(format!("{}-{}", token, self.operation));
        }
        if let Some(options) = &self.options {
            for option in options {
                command.push(" ");
                command.push(option);
            }
        }
        if let Some(parameters) = &self.parameters {
            if self.options.is_some() {
                command.push(" --");
            }
            for parameter in parameters {
                command.push(" ");
                command.push(parameter);
            }
        }
        command.push("\n");
        info!("writing MI command: {}", String::from_utf8_lossy(command.as_encoded_bytes()));
        sink.write_all(command.as_encoded_bytes()).await?;
        Ok(())
    }

    pub fn interpreter_exec<S1: Into<OsString>, S2: Into<OsString>>(interpreter: S1, command: S2) -> MiCommand {
        MiCommand {
            operation: "interpreter-exec",
            options: Some(vec![interpreter.into(), command.into()]),
            parameters: None,
        }
    }

    pub fn cli_exec(command: &str) -> MiCommand {
        Self::interpreter_exec("console".to_owned(), escape_command(command))
    }

    /// `interpreter-exec [--thread N] [--frame F] console "<escaped>"`, for
    /// `sendUserInput` lines that don't begin with `-` (spec.md §4.4).
    pub fn interpreter_exec_console(command: &str, thread: Option<u64>, frame: Option<u64>) -> MiCommand {
        let mut options = vec![];
        if let Some(thread) = thread {
            options.push(OsString::from("--thread"));
            options.push(OsString::from(thread.to_string()));
        }
        if let Some(frame) = frame {
            options.push(OsString::from("--frame"));
            options.push(OsString::from(frame.to_string()));
        }
        options.push(OsString::from("console"));
        options.push(OsString::from(escape_command(command)));
        MiCommand { operation: "interpreter-exec", options: Some(options), parameters: None }
    }

    pub fn gdb_set(name: &str, value: &str) -> MiCommand {
        MiCommand {
            operation: "gdb-set",
            options: Some(vec![OsString::from(format!("{} {}", name, value))]),
            parameters: None,
        }
    }

    pub fn environment_directory(dir: &Path) -> MiCommand {
        MiCommand {
            operation: "environment-directory",
            options: Some(vec![{
                let mut q = OsString::from("\"");
                q.push(dir);
                q.push("\"");
                q
            }]),
            parameters: None,
        }
    }

    pub fn file_exec_and_symbols(file: &Path) -> MiCommand {
        MiCommand {
            operation: "file-exec-and-symbols",
            options: Some(vec![{
                let mut q = OsString::from("\"");
                q.push(file);
                q.push("\"");
                q
            }]),
            parameters: None,
        }
    }

    pub fn target_select_remote(target: &str) -> MiCommand {
        MiCommand {
            operation: "target-select",
            options: Some(vec![OsString::from("remote"), OsString::from(target)]),
            parameters: None,
        }
    }

    pub fn target_detach() -> MiCommand {
        MiCommand { operation: "target-detach", ..Default::default() }
    }

    pub fn exec_run() -> MiCommand {
        MiCommand { operation: "exec-run", ..Default::default() }
    }

    pub fn exec_continue(reverse: bool) -> MiCommand {
        MiCommand {
            operation: "exec-continue",
            options: reverse.then(|| vec![OsString::from("--reverse")]),
            parameters: None,
        }
    }

    pub fn exec_next(reverse: bool) -> MiCommand {
        MiCommand {
            operation: "exec-next",
            options: reverse.then(|| vec![OsString::from("--reverse")]),
            parameters: None,
        }
    }

    pub fn exec_step(reverse: bool) -> MiCommand {
        MiCommand {
            operation: "exec-step",
            options: reverse.then(|| vec![OsString::from("--reverse")]),
            parameters: None,
        }
    }

    pub fn exec_finish(reverse: bool) -> MiCommand {
        MiCommand {
            operation: "exec-finish",
            options: reverse.then(|| vec![OsString::from("--reverse")]),
            parameters: None,
        }
    }

    pub fn exec_interrupt() -> MiCommand {
        MiCommand { operation: "exec-interrupt", ..Default::default() }
    }

    pub fn exec_jump(location: &str) -> MiCommand {
        MiCommand {
            operation: "exec-jump",
            options: Some(vec![OsString::from(location)]),
            parameters: None,
        }
    }

    pub fn exit() -> MiCommand {
        MiCommand { operation: "gdb-exit", ..Default::default() }
    }

    /// `break-insert -f <prefix><location>`. `prefix` already carries the
    /// `-t `/`-i N ` count-condition flags the Facade derived.
    pub fn insert_breakpoint(prefix: &str, location: BreakPointLocation) -> MiCommand {
        let loc = match location {
            BreakPointLocation::Raw(raw) => escape_command(raw),
            BreakPointLocation::FileLine(path, line) => {
                format!("\"{}:{}\"", path.display(), line)
            }
        };
        MiCommand {
            operation: "break-insert",
            options: Some(vec![OsString::from("-f"), OsString::from(format!("{}{}", prefix, loc))]),
            parameters: None,
        }
    }

    pub fn break_condition(number: BreakPointNumber, condition: &str) -> MiCommand {
        MiCommand {
            operation: "break-condition",
            options: Some(vec![OsString::from(number.to_string()), OsString::from(condition)]),
            parameters: None,
        }
    }

    pub fn delete_breakpoint(number: BreakPointNumber) -> MiCommand {
        MiCommand {
            operation: "break-delete",
            options: Some(vec![OsString::from(number.to_string())]),
            parameters: None,
        }
    }

    pub fn delete_all_breakpoints() -> MiCommand {
        MiCommand { operation: "break-delete", ..Default::default() }
    }

    pub fn thread_info(thread_id: Option<u64>) -> MiCommand {
        MiCommand {
            operation: "thread-info",
            options: thread_id.map(|id| vec![OsString::from(id.to_string())]),
            parameters: None,
        }
    }

    pub fn stack_list_frames(thread: Option<u64>, max_levels: Option<usize>) -> MiCommand {
        let mut options = vec![];
        if let Some(thread) = thread {
            options.push(OsString::from("--thread"));
            options.push(OsString::from(thread.to_string()));
        }
        options.push(OsString::from("0"));
        options.push(OsString::from(max_levels.map(|m| m.to_string()).unwrap_or_else(|| "99999".to_string())));
        MiCommand { operation: "stack-list-frames", options: Some(options), parameters: None }
    }

    pub fn stack_list_variables(thread: Option<u64>, frame: Option<u64>) -> MiCommand {
        let mut parameters = vec![];
        if let Some(thread) = thread {
            parameters.push(OsString::from("--thread"));
            parameters.push(OsString::from(thread.to_string()));
        }
        if let Some(frame) = frame {
            parameters.push(OsString::from("--frame"));
            parameters.push(OsString::from(frame.to_string()));
        }
        parameters.push(OsString::from("--simple-values"));
        MiCommand { operation: "stack-list-variables", options: None, parameters: Some(parameters) }
    }

    pub fn data_evaluate_expression(expression: &str, thread: Option<u64>, frame: Option<u64>) -> MiCommand {
        let mut options = vec![];
        if let Some(thread) = thread {
            options.push(OsString::from("--thread"));
            options.push(OsString::from(thread.to_string()));
        }
        if let Some(frame) = frame {
            options.push(OsString::from("--frame"));
            options.push(OsString::from(frame.to_string()));
        }
        options.push(OsString::from(format!("\"{}\"", expression)));
        MiCommand { operation: "data-evaluate-expression", options: Some(options), parameters: None }
    }

    pub fn data_read_memory_bytes(address: u64, length: usize) -> MiCommand {
        MiCommand {
            operation: "data-read-memory-bytes",
            options: Some(vec![OsString::from(format!("0x{:x}", address)), OsString::from(length.to_string())]),
            parameters: None,
        }
    }

    /// Frame spec is always `@`: a floating varobj re-evaluated against the
    /// current frame on every `var-update`, per the pass-through contract.
    pub fn var_create(name: Option<&str>, expression: &str) -> MiCommand {
        MiCommand {
            operation: "var-create",
            options: None,
            parameters: Some(vec![
                OsString::from(name.unwrap_or("-")),
                OsString::from("@"),
                OsString::from(escape_command(expression)),
            ]),
        }
    }

    pub fn var_evaluate_expression(name: &str) -> MiCommand {
        MiCommand {
            operation: "var-evaluate-expression",
            options: None,
            parameters: Some(vec![OsString::from(name)]),
        }
    }

    pub fn var_list_children(name: &str) -> MiCommand {
        MiCommand {
            operation: "var-list-children",
            options: None,
            parameters: Some(vec![OsString::from("--all-values"), OsString::from(name)]),
        }
    }

    pub fn var_update(name: &str) -> MiCommand {
        MiCommand {
            operation: "var-update",
            options: None,
            parameters: Some(vec![OsString::from("--all-values"), OsString::from(name)]),
        }
    }

    pub fn var_assign(name: &str, expression: &str) -> MiCommand {
        MiCommand {
            operation: "var-assign",
            options: None,
            parameters: Some(vec![OsString::from(name), OsString::from(escape_command(expression))]),
        }
    }

    pub fn empty() -> MiCommand {
        MiCommand { operation: "", ..Default::default() }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn breakpoint_number_parses_dotted() {
        let n: BreakPointNumber = "7.2".parse().unwrap();
        assert_eq!(n.major, 7);
        assert_eq!(n.minor, Some(2));
        assert_eq!(n.to_string(), "7.2");

        let n: BreakPointNumber = "7".parse().unwrap();
        assert_eq!(n.major, 7);
        assert_eq!(n.minor, None);
        assert_eq!(n.to_string(), "7");
    }

    #[tokio::test]
    async fn scenario_s4_break_insert_then_condition() {
        let (mut client, mut server) = tokio::io::duplex(256);

        let insert = MiCommand::insert_breakpoint("", BreakPointLocation::FileLine(Path::new("/abs/hello.c"), 23));
        insert.write_interpreter_string(&mut client, 1).await.unwrap();

        let condition = MiCommand::break_condition(BreakPointNumber { major: 1, minor: None }, "x > 0");
        condition.write_interpreter_string(&mut client, 2).await.unwrap();
        drop(client);

        let mut buf = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut server, &mut buf).await.unwrap();
        assert_eq!(buf, "1-break-insert -f \"/abs/hello.c:23\"\n2-break-condition 1 x > 0\n");
    }

    #[tokio::test]
    async fn scenario_s5_count_condition_breakpoint() {
        let (mut client, mut server) = tokio::io::duplex(256);

        let insert = MiCommand::insert_breakpoint("-i 3 ", BreakPointLocation::Raw("main"));
        insert.write_interpreter_string(&mut client, 1).await.unwrap();
        drop(client);

        let mut buf = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut server, &mut buf).await.unwrap();
        assert_eq!(buf, "1-break-insert -f -i 3 \"main\"\n");
    }
}
