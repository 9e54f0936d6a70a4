//! Parsing of the compiler's bisection traces and construction of the limit flags
//! that produce them.
//!
//! Two traces are understood. The pass trace, one line per pass:
//!
//! ```text
//! BISECT: running pass (9) Early CSE on function (foo)
//! BISECT: NOT running pass (10) Combine redundant instructions on function (foo)
//! ```
//!
//! and the debug counter dump:
//!
//! ```text
//! Counters and values:
//! early-cse : {17, 0, 5}
//! ```

use thiserror::Error;

const RUNNING_PASS: &str = "running pass (";
const NOT_RUNNING_PASS: &str = "NOT running pass (";
const COUNTERS_MARKER: &str = "Counters and values:";

/// Environment variable the build script splices into its compiler flags.
pub const LIMIT_FLAGS_VAR: &str = "LIMIT_FLAGS";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DiagnosticsError {
    #[error("Pass limit {limit} requested but the build ran {ran} passes")]
    LimitMismatch { limit: u32, ran: u32 },
    #[error("No 'Counters and values:' section in build output")]
    NoCounters,
    #[error("Debug counter '{0}' missing or malformed in build output")]
    MalformedCounter(String),
}

/// How far a build got under a pass limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassTrace {
    /// Passes that ran; with an unbounded limit, every pass the build knows about.
    pub count: u32,
    /// The trace line of the last pass counted.
    pub last_pass: Option<String>,
}

/// Counts `running pass` lines. With `limit = Some(n)` counting stops at the first
/// pass that was not run, and the count must equal `n`.
pub fn parse_pass_trace(output: &str, limit: Option<u32>) -> Result<PassTrace, DiagnosticsError> {
    let mut count = 0u32;
    let mut last_pass = None;
    for line in output.lines() {
        if !line.contains(RUNNING_PASS) {
            continue;
        }
        if limit.is_some() && line.contains(NOT_RUNNING_PASS) {
            break;
        }
        count += 1;
        last_pass = Some(line.trim().to_string());
    }
    if let Some(limit) = limit {
        if limit != count {
            return Err(DiagnosticsError::LimitMismatch { limit, ran: count });
        }
    }
    Ok(PassTrace { count, last_pass })
}

/// Reads the `count` field of `counter` from a debug counter dump.
pub fn parse_counter(output: &str, counter: &str) -> Result<u32, DiagnosticsError> {
    let section = output
        .find(COUNTERS_MARKER)
        .map(|at| &output[at + COUNTERS_MARKER.len()..])
        .ok_or(DiagnosticsError::NoCounters)?;

    let malformed = || DiagnosticsError::MalformedCounter(counter.to_string());
    for line in section.lines() {
        let Some((name, values)) = line.split_once(':') else {
            continue;
        };
        if name.trim() != counter {
            continue;
        }
        let values = values.trim();
        let inner = values
            .strip_prefix('{')
            .and_then(|v| v.strip_suffix('}'))
            .ok_or_else(malformed)?;
        let count = inner.split(',').next().ok_or_else(malformed)?;
        return count.trim().parse().map_err(|_| malformed());
    }
    Err(malformed())
}

/// Description substrings of passes that expose a debug counter, mapped to the
/// counter's name. Extend this when a pass gains a counter.
const PASS_COUNTERS: &[(&str, &str)] = &[
    (
        "Hoist/decompose integer division and remainder",
        "div-rem-pairs-transform",
    ),
    ("Early CSE", "early-cse"),
    ("Falkor HW Prefetch Fix Late Phase", "falkor-hwpf"),
    ("Combine redundant instructions", "instcombine-visit"),
    ("Machine Copy Propagation Pass", "machine-cp-fwd"),
    ("Global Value Numbering", "newgvn-phi"),
    ("PredicateInfo Printer", "predicateinfo-rename"),
    ("SI Insert Waitcnts", "si-insert-waitcnts-forceexp"),
];

/// Maps a pass trace line to the name of that pass's debug counter.
pub fn counter_for_pass(pass_line: &str) -> Option<&'static str> {
    PASS_COUNTERS
        .iter()
        .find(|(description, _)| pass_line.contains(description))
        .map(|(_, counter)| *counter)
}

fn limit_arg(limit: Option<u32>) -> String {
    limit.map_or_else(|| "-1".to_string(), |l| l.to_string())
}

/// `None` means unbounded.
pub fn pass_limit_flags(limit: Option<u32>, emit_ir: bool) -> String {
    let mut flags = format!("-mllvm -opt-bisect-limit={}", limit_arg(limit));
    if emit_ir {
        flags.push_str(" -S -emit-llvm");
    }
    flags
}

pub fn transform_limit_flags(
    counter: &str,
    limit: Option<u32>,
    pass_limit: u32,
    emit_ir: bool,
) -> String {
    let mut flags = format!(
        "-mllvm -opt-bisect-limit={} -mllvm -debug-counter={}-count={} -mllvm -print-debug-counter",
        pass_limit,
        counter,
        limit_arg(limit)
    );
    if emit_ir {
        flags.push_str(" -S -emit-llvm");
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRACE: &str = "\
clang: note: something unrelated
BISECT: running pass (1) Simplify the CFG on function (main)
BISECT: running pass (2) Early CSE on function (main)
BISECT: running pass (3) Combine redundant instructions on function (main)
BISECT: NOT running pass (4) Global Value Numbering on function (main)
BISECT: NOT running pass (5) Early CSE on function (helper)
";

    #[test]
    fn unbounded_trace_counts_every_pass() {
        let trace = parse_pass_trace(TRACE, None).unwrap();
        assert_eq!(trace.count, 5);
        assert!(trace.last_pass.unwrap().contains("(5) Early CSE"));
    }

    #[test]
    fn bounded_trace_stops_at_first_skipped_pass() {
        let trace = parse_pass_trace(TRACE, Some(3)).unwrap();
        assert_eq!(trace.count, 3);
        assert_eq!(
            trace.last_pass.as_deref(),
            Some("BISECT: running pass (3) Combine redundant instructions on function (main)")
        );
    }

    #[test]
    fn bounded_trace_must_match_limit() {
        assert_eq!(
            parse_pass_trace(TRACE, Some(4)),
            Err(DiagnosticsError::LimitMismatch { limit: 4, ran: 3 })
        );
    }

    #[test]
    fn zero_limit_has_no_last_pass() {
        let output = "BISECT: NOT running pass (1) Early CSE on function (main)\n";
        let trace = parse_pass_trace(output, Some(0)).unwrap();
        assert_eq!(trace.count, 0);
        assert!(trace.last_pass.is_none());
    }

    #[test]
    fn counter_count_is_parsed() {
        let output = "\
warning: ignored
Counters and values:
instcombine-visit : {3, 0, -1}
early-cse : {17, 0, 5}
";
        assert_eq!(parse_counter(output, "early-cse"), Ok(17));
        assert_eq!(parse_counter(output, "instcombine-visit"), Ok(3));
    }

    #[test]
    fn counter_errors_are_distinguished() {
        assert_eq!(
            parse_counter("no counters here", "early-cse"),
            Err(DiagnosticsError::NoCounters)
        );
        assert_eq!(
            parse_counter("Counters and values:\nother : {1, 0, 0}\n", "early-cse"),
            Err(DiagnosticsError::MalformedCounter("early-cse".to_string()))
        );
        assert_eq!(
            parse_counter("Counters and values:\nearly-cse : {x, 0, 0}\n", "early-cse"),
            Err(DiagnosticsError::MalformedCounter("early-cse".to_string()))
        );
    }

    #[test]
    fn pass_descriptions_map_to_counters() {
        assert_eq!(
            counter_for_pass("BISECT: running pass (2) Early CSE on function (main)"),
            Some("early-cse")
        );
        assert_eq!(
            counter_for_pass("BISECT: running pass (7) Global Value Numbering on function (f)"),
            Some("newgvn-phi")
        );
        assert_eq!(counter_for_pass("BISECT: running pass (1) Simplify the CFG"), None);
    }

    #[test]
    fn limit_flags_are_built() {
        assert_eq!(pass_limit_flags(None, false), "-mllvm -opt-bisect-limit=-1");
        assert_eq!(
            pass_limit_flags(Some(12), true),
            "-mllvm -opt-bisect-limit=12 -S -emit-llvm"
        );
        assert_eq!(
            transform_limit_flags("early-cse", Some(4), 9, false),
            "-mllvm -opt-bisect-limit=9 -mllvm -debug-counter=early-cse-count=4 -mllvm -print-debug-counter"
        );
        assert_eq!(
            transform_limit_flags("early-cse", None, 9, false),
            "-mllvm -opt-bisect-limit=9 -mllvm -debug-counter=early-cse-count=-1 -mllvm -print-debug-counter"
        );
    }
}
