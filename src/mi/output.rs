//! The MI Value Tree and MI Parser (spec.md §4.1).
//!
//! Grounded on the teacher crate's `nom` grammar (escaped-string handling,
//! `key_value`, `result_record`, `async_record`, `stream_record`), but the
//! value representation is a hand-rolled tagged tree (`MiValue`) instead of
//! `serde_json::Value` so that duplicate keys inside a tuple (GDB really
//! does emit `frame={...}` more than once in some records) survive parsing
//! and can be disambiguated with the `@`-prefixed dotted-path accessor the
//! spec calls for.

use std::sync::LazyLock;

use nom::branch::alt;
use nom::bytes::complete::{is_not, tag, take_while_m_n};
use nom::character::complete::{char, digit1, line_ending, multispace1};
use nom::combinator::{map, map_opt, map_res, opt, value, verify};
use nom::error::{FromExternalError, ParseError};
use nom::multi::{fold, many0, separated_list0};
use nom::sequence::{delimited, preceded, separated_pair};
use nom::{IResult, Parser};
use regex::Regex;

/// The tagged value any MI field can hold: a bare/quoted string, an ordered
/// list, or a keyed tuple that preserves insertion order and duplicate keys.
#[derive(Debug, Clone, PartialEq)]
pub enum MiValue {
    String(String),
    List(Vec<MiValue>),
    Tuple(Vec<(String, MiValue)>),
}

impl MiValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MiValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[MiValue]> {
        match self {
            MiValue::List(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&[(String, MiValue)]> {
        match self {
            MiValue::Tuple(v) => Some(v),
            _ => None,
        }
    }

    fn field(&self, key: &str, first: bool) -> Option<&MiValue> {
        match self {
            MiValue::Tuple(entries) => {
                if first {
                    entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
                } else {
                    entries.iter().rev().find(|(k, _)| k == key).map(|(_, v)| v)
                }
            }
            MiValue::List(items) => key.parse::<usize>().ok().and_then(|idx| items.get(idx)),
            MiValue::String(_) => None,
        }
    }

    /// Dotted-path lookup. A leading `@` on a segment selects the first
    /// occurrence of that key instead of the last, for the handful of MI
    /// records where GDB repeats a key inside one tuple (spec.md §4.1).
    pub fn get_path(&self, path: &str) -> Option<&MiValue> {
        let mut cur = self;
        for seg in path.split('.') {
            let (first, key) = match seg.strip_prefix('@') {
                Some(rest) => (true, rest),
                None => (false, seg),
            };
            cur = cur.field(key, first)?;
        }
        Some(cur)
    }

    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get_path(path).and_then(MiValue::as_str)
    }

    /// Converts to a `serde_json::Value` for the handful of events that pass
    /// raw MI payloads through to the UI (`DebugEvent::ExecAsyncOutput`).
    /// Duplicate tuple keys collapse to last-write-wins, matching a JSON
    /// object's own semantics; `get_path`'s `@`-disambiguation is for MI
    /// consumers only.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            MiValue::String(s) => serde_json::Value::String(s.clone()),
            MiValue::List(items) => serde_json::Value::Array(items.iter().map(MiValue::to_json).collect()),
            MiValue::Tuple(entries) => {
                let mut map = serde_json::Map::new();
                for (k, v) in entries {
                    map.insert(k.clone(), v.to_json());
                }
                serde_json::Value::Object(map)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultClass {
    Done,
    Running,
    Connected,
    Error,
    Exit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakPointEvent {
    Created,
    Deleted,
    Modified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadEvent {
    Created,
    GroupStarted,
    Exited,
    GroupExited,
    Selected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsyncClass {
    Running,
    Stopped,
    CmdParamChanged,
    LibraryLoaded,
    Thread(ThreadEvent),
    BreakPoint(BreakPointEvent),
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsyncKind {
    Exec,
    Status,
    Notify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Console,
    Target,
    Log,
}

#[derive(Debug, Clone)]
pub struct ResultRecord {
    pub token: Option<u64>,
    pub class: ResultClass,
    pub results: MiValue,
}

#[derive(Debug, Clone)]
pub enum OutOfBandRecord {
    AsyncRecord {
        token: Option<u64>,
        kind: AsyncKind,
        class: AsyncClass,
        results: MiValue,
    },
    StreamRecord {
        kind: StreamKind,
        data: String,
    },
}

/// The parse of exactly one line of MI output.
#[derive(Debug, Clone)]
pub enum Line {
    Result(ResultRecord),
    OutOfBand(OutOfBandRecord),
    Prompt,
}

impl Line {
    pub fn parse(line: &str) -> Result<Self, String> {
        match mi_line(line) {
            Ok((_, l)) => Ok(l),
            Err(e) => match e {
                nom::Err::Incomplete(e) => Err(format!("incomplete: {:?}", e)),
                nom::Err::Error(e) => Err(format!("parse error: {}", e)),
                nom::Err::Failure(e) => Err(format!("parse failure: {}", e)),
            },
        }
    }
}

/// Classifies a raw line from the child's stdout as MI protocol output vs.
/// inferior program output (spec.md §4.3 point 1). Anchored, small regex
/// per spec.md §9's recommendation to keep this deterministic.
static MI_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^((\d*|undefined)[*+=])|[~@&^]|^(\d*|undefined)\(gdb\)").unwrap());

pub fn looks_like_mi_line(line: &str) -> bool {
    MI_LINE.is_match(line)
}

/// Heuristic used while buffering partial (non-newline-terminated) output:
/// a chunk that could plausibly be an MI line prefix is held back, anything
/// else is assumed to be inferior output and flushed immediately
/// (spec.md §5, Testable Property 6).
pub fn could_be_mi_prefix(partial: &str) -> bool {
    if partial.is_empty() {
        return true;
    }
    let mut chars = partial.chars();
    let mut c = chars.next();
    while let Some(ch) = c {
        if ch.is_ascii_digit() {
            c = chars.next();
            continue;
        }
        break;
    }
    matches!(c, Some('*') | Some('+') | Some('=') | Some('~') | Some('@') | Some('&') | Some('^'))
        || partial == "undefined"
        || "undefined".starts_with(partial)
        || partial.starts_with('(')
        || "(gdb) ".starts_with(partial)
}

fn result_class(input: &str) -> IResult<&str, ResultClass> {
    alt((
        value(ResultClass::Done, tag("done")),
        value(ResultClass::Running, tag("running")),
        value(ResultClass::Connected, tag("connected")),
        value(ResultClass::Error, tag("error")),
        value(ResultClass::Exit, tag("exit")),
    ))
    .parse(input)
}

fn unicode<'a, E>(input: &'a str) -> IResult<&'a str, char, E>
where
    E: ParseError<&'a str> + FromExternalError<&'a str, std::num::ParseIntError>,
{
    let parse_hex = take_while_m_n(1, 6, |c: char| c.is_ascii_hexdigit());
    let parse_delimited_hex = preceded(char('u'), delimited(char('{'), parse_hex, char('}')));
    let parse_u32 = map_res(parse_delimited_hex, move |hex| u32::from_str_radix(hex, 16));
    map_opt(parse_u32, std::char::from_u32).parse(input)
}

fn escaped_char(input: &str) -> IResult<&str, char> {
    preceded(
        char('\\'),
        alt((
            unicode,
            value('\n', char('n')),
            value('\r', char('r')),
            value('\t', char('t')),
            value('\u{08}', char('b')),
            value('\u{0C}', char('f')),
            value('\\', char('\\')),
            value('/', char('/')),
            value('"', char('"')),
        )),
    )
    .parse(input)
}

fn escaped_whitespace(input: &str) -> IResult<&str, &str> {
    preceded(char('\\'), multispace1).parse(input)
}

fn literal(input: &str) -> IResult<&str, &str> {
    verify(is_not("\"\\"), |s: &str| !s.is_empty()).parse(input)
}

#[derive(Debug, PartialEq, Eq, Clone)]
enum StringFragment<'a> {
    Literal(&'a str),
    EscapedChar(char),
    EscapedWS,
}

fn parse_fragment(input: &str) -> IResult<&str, StringFragment> {
    alt((
        map(literal, StringFragment::Literal),
        map(escaped_char, StringFragment::EscapedChar),
        value(StringFragment::EscapedWS, escaped_whitespace),
    ))
    .parse(input)
}

fn quoted_string(input: &str) -> IResult<&str, String> {
    let build_string = fold(0.., parse_fragment, String::new, |mut string, fragment| {
        match fragment {
            StringFragment::Literal(s) => string.push_str(s),
            StringFragment::EscapedChar(c) => string.push(c),
            StringFragment::EscapedWS => {}
        }
        string
    });
    delimited(char('"'), build_string, char('"')).parse(input)
}

fn mi_value(input: &str) -> IResult<&str, MiValue> {
    alt((
        map(quoted_string, MiValue::String),
        map(
            delimited(char('{'), separated_list0(char(','), key_value), char('}')),
            MiValue::Tuple,
        ),
        map(
            delimited(char('['), separated_list0(char(','), mi_value), char(']')),
            MiValue::List,
        ),
        map(
            delimited(char('['), separated_list0(char(','), key_value), char(']')),
            |entries| MiValue::List(entries.into_iter().map(|(_, v)| v).collect()),
        ),
    ))
    .parse(input)
}

/// GDB sometimes emits multiple comma-separated values for what the MI
/// grammar says should be a single tuple slot. Collapse a singleton list
/// back down transparently; keep a real list otherwise.
fn buggy_gdb_list_in_result(input: &str) -> IResult<&str, MiValue> {
    map(separated_list0(tag(","), mi_value), |mut values: Vec<MiValue>| {
        if values.len() == 1 {
            values.pop().expect("len == 1")
        } else {
            MiValue::List(values)
        }
    })
    .parse(input)
}

fn key_value(input: &str) -> IResult<&str, (String, MiValue)> {
    map(
        separated_pair(is_not("={}"), char('='), buggy_gdb_list_in_result),
        |(var, val): (&str, MiValue)| (var.to_string(), val),
    )
    .parse(input)
}

fn token(input: &str) -> IResult<&str, u64> {
    map(digit1, |v: &str| v.parse::<u64>().unwrap()).parse(input)
}

fn result_record(input: &str) -> IResult<&str, Line> {
    map(
        (opt(token), char('^'), result_class, many0(preceded(char(','), key_value))),
        |(t, _, c, results)| {
            Line::Result(ResultRecord {
                token: t,
                class: c,
                results: MiValue::Tuple(results),
            })
        },
    )
    .parse(input)
}

fn async_kind(input: &str) -> IResult<&str, AsyncKind> {
    alt((
        value(AsyncKind::Exec, tag("*")),
        value(AsyncKind::Status, tag("+")),
        value(AsyncKind::Notify, tag("=")),
    ))
    .parse(input)
}

fn async_class(input: &str) -> IResult<&str, AsyncClass> {
    alt((
        value(AsyncClass::Running, tag("running")),
        value(AsyncClass::Stopped, tag("stopped")),
        value(AsyncClass::Thread(ThreadEvent::Created), tag("thread-created")),
        value(AsyncClass::Thread(ThreadEvent::GroupStarted), tag("thread-group-started")),
        value(AsyncClass::Thread(ThreadEvent::Exited), tag("thread-exited")),
        value(AsyncClass::Thread(ThreadEvent::GroupExited), tag("thread-group-exited")),
        value(AsyncClass::Thread(ThreadEvent::Selected), tag("thread-selected")),
        value(AsyncClass::CmdParamChanged, tag("cmd-param-changed")),
        value(AsyncClass::LibraryLoaded, tag("library-loaded")),
        value(AsyncClass::BreakPoint(BreakPointEvent::Created), tag("breakpoint-created")),
        value(AsyncClass::BreakPoint(BreakPointEvent::Deleted), tag("breakpoint-deleted")),
        value(AsyncClass::BreakPoint(BreakPointEvent::Modified), tag("breakpoint-modified")),
        map(is_not(","), |msg: &str| AsyncClass::Other(msg.to_string())),
    ))
    .parse(input)
}

fn async_record(input: &str) -> IResult<&str, Line> {
    map(
        (opt(token), async_kind, async_class, many0(preceded(char(','), key_value))),
        |(t, kind, class, results)| {
            Line::OutOfBand(OutOfBandRecord::AsyncRecord {
                token: t,
                kind,
                class,
                results: MiValue::Tuple(results),
            })
        },
    )
    .parse(input)
}

fn stream_kind(input: &str) -> IResult<&str, StreamKind> {
    alt((
        value(StreamKind::Console, tag("~")),
        value(StreamKind::Target, tag("@")),
        value(StreamKind::Log, tag("&")),
    ))
    .parse(input)
}

fn stream_record(input: &str) -> IResult<&str, Line> {
    map((stream_kind, quoted_string), |(kind, data)| {
        Line::OutOfBand(OutOfBandRecord::StreamRecord { kind, data })
    })
    .parse(input)
}

fn prompt(input: &str) -> IResult<&str, Line> {
    value(Line::Prompt, tag("(gdb) ")).parse(input)
}

fn mi_line(input: &str) -> IResult<&str, Line> {
    map(
        (
            alt((result_record, stream_record, async_record, prompt)),
            opt(line_ending),
        ),
        |(line, _)| line,
    )
    .parse(input)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn scenario_s1_token_and_path() {
        let line = Line::parse("2^done,bkpt={number=\"7\",file=\"/tmp/x.c\",line=\"42\"}\n").unwrap();
        match line {
            Line::Result(r) => {
                assert_eq!(r.token, Some(2));
                assert_eq!(r.class, ResultClass::Done);
                assert_eq!(r.results.get_str("bkpt.number"), Some("7"));
                assert_eq!(r.results.get_str("bkpt.file"), Some("/tmp/x.c"));
            }
            _ => panic!("expected a result record"),
        }
    }

    #[test]
    fn async_stopped_breakpoint_hit() {
        let line = Line::parse(
            "*stopped,reason=\"breakpoint-hit\",bkptno=\"1\",frame={addr=\"0x1\",line=\"5\"},thread-id=\"1\"\n",
        )
        .unwrap();
        match line {
            Line::OutOfBand(OutOfBandRecord::AsyncRecord { kind, class, results, .. }) => {
                assert_eq!(kind, AsyncKind::Exec);
                assert_eq!(class, AsyncClass::Stopped);
                assert_eq!(results.get_str("reason"), Some("breakpoint-hit"));
                assert_eq!(results.get_str("frame.line"), Some("5"));
            }
            _ => panic!("expected an async record"),
        }
    }

    #[test]
    fn stream_record_roundtrip() {
        let line = Line::parse("~\"hello\\n\"\n").unwrap();
        match line {
            Line::OutOfBand(OutOfBandRecord::StreamRecord { kind, data }) => {
                assert_eq!(kind, StreamKind::Console);
                assert_eq!(data, "hello\n");
            }
            _ => panic!("expected a stream record"),
        }
    }

    #[test]
    fn duplicate_key_first_vs_last() {
        let tuple = MiValue::Tuple(vec![
            ("frame".to_string(), MiValue::String("first".to_string())),
            ("frame".to_string(), MiValue::String("second".to_string())),
        ]);
        assert_eq!(tuple.get_path("@frame").and_then(MiValue::as_str), Some("first"));
        assert_eq!(tuple.get_path("frame").and_then(MiValue::as_str), Some("second"));
    }

    #[test]
    fn malformed_record_is_an_error() {
        assert!(Line::parse("^done,bkpt={number=\"7\"\n").is_err());
    }

    #[test]
    fn classifies_mi_vs_inferior_lines() {
        assert!(looks_like_mi_line("^done,bkpt={}"));
        assert!(looks_like_mi_line("42^done"));
        assert!(looks_like_mi_line("~\"hi\""));
        assert!(looks_like_mi_line("(gdb) "));
        assert!(!looks_like_mi_line("this came from the COBOL program"));
    }

    #[test]
    fn to_json_collapses_duplicates_last_write_wins() {
        let tuple = MiValue::Tuple(vec![
            ("frame".to_string(), MiValue::String("first".to_string())),
            ("frame".to_string(), MiValue::String("second".to_string())),
        ]);
        assert_eq!(tuple.to_json(), serde_json::json!({"frame": "second"}));
    }

    #[test]
    fn partial_output_heuristic() {
        assert!(could_be_mi_prefix("12"));
        assert!(could_be_mi_prefix("12^"));
        assert!(!could_be_mi_prefix("Enter your name: "));
    }
}
