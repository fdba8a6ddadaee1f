//! Stdout decoding for job events
//!
//! Turns one event's captured output blob into display-ready lines:
//! - splits on CRLF and numbers lines from `start_line + 1`
//! - escapes HTML metacharacters before any styling
//! - translates the producer's ANSI-ish code vocabulary into span classes
//! - carries an unterminated color code onto following lines of the same
//!   event (color bleed), matching the producer's own renderer
//! - flags play/task/recap header lines and their fold groups

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use console_types::{JobEvent, EVENT_PLAY_START, EVENT_STATS, EVENT_TASK_START};

/// One rendered line of job output.
///
/// Derived per event from its `stdout` blob and line range, never stored
/// independently.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DisplayLine {
    /// 1-based line number within the job's whole output
    pub line_number: u64,
    /// Escaped and span-styled line content
    pub text: String,
    /// Marker classes for the rendering layer (`next_is_*`, `not_skeleton`,
    /// `line_num_*`)
    pub classes: Vec<String>,
    /// True for play/task header lines and recap banner lines
    pub is_header: bool,
    /// Stable fold-group id (`play_<uuid>` / `task_<uuid>`) when the line
    /// carries a collapse affordance
    pub fold_group: Option<String>,
    /// Timestamp badge shown on header lines
    pub created: Option<DateTime<Utc>>,
}

/// Style rules applied in order; order matters: the plain green rule
/// consumes `[0;32m` (and an optional `=`) before the `[0;32m1` form can
/// match, as in the producer's renderer.
static STYLE_RULES: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r"\[1;im", r#"<span class="cappedLine">"#),
        (r"\[0;30m", r#"<span class="ansi30">"#),
        (r"\[1;30m", r#"<span class="ansi1 ansi30">"#),
        (r"\[[01];31m", r#"<span class="ansi1 ansi31">"#),
        (r"\[0;32m=?", r#"<span class="ansi32">"#),
        (r"\[0;32m1", r#"<span class="ansi36">"#),
        (r"\[0;33m", r#"<span class="ansi33">"#),
        (r"\[0;34m", r#"<span class="ansi34">"#),
        (r"\[[01];35m", r#"<span class="ansi35">"#),
        (r"\[0;36m", r#"<span class="ansi36">"#),
        (r"\[0m", "</span>"),
    ]
    .iter()
    .map(|(pattern, span)| (Regex::new(pattern).unwrap(), *span))
    .collect()
});

/// Code-stripping rules for the plain-text variant.
static PLAIN_RULES: Lazy<Vec<Regex>> = Lazy::new(|| {
    [r"\[[01];3[0-9]m(1|=)?", r"\[0m"]
        .iter()
        .map(|pattern| Regex::new(pattern).unwrap())
        .collect()
});

/// Color codes that bleed onto following lines when no reset appears on the
/// line that set them. Checked in this order; `[0;32m=` and `[0;32m1` are
/// distinct codes to the producer and must stay ahead of plain `[0;32m`.
const BLEED_CODES: [&str; 11] = [
    "[1;31m", "[1;30m", "[0;31m", "[0;32m=", "[0;32m1", "[0;32m", "[0;33m", "[0;34m", "[0;35m",
    "[1;35m", "[0;36m",
];

/// Markers that distinguish collapsible headers from decorative banner
/// output (e.g. cowsay), which gets no fold affordance.
const PLAY_MARKER: &str = "PLAY";
const TASK_MARKER: &str = "TASK";
const HANDLER_MARKER: &str = "RUNNING HANDLER";

/// Decode one event's stdout into ordered display lines.
///
/// Never fails: events without stdout or with malformed ranges decode to a
/// best-effort (possibly empty) line list.
pub fn decode(event: &JobEvent) -> Vec<DisplayLine> {
    line_slots(event)
        .into_iter()
        .map(|(line_number, raw)| {
            let (is_header, fold_group, created) = header_flags(event, &raw);
            DisplayLine {
                line_number,
                text: prettify(&raw),
                classes: line_classes(event, line_number),
                is_header,
                fold_group,
                created,
            }
        })
        .collect()
}

/// The line index the event's rendered output actually ends at:
/// `start_line + count(decoded lines)`. Diverges from `end_line` when the
/// blob's physical line count disagrees with the logical range.
pub fn actual_end_line(event: &JobEvent) -> u64 {
    event.start_line + line_slots(event).len() as u64
}

/// Escape and style one raw line of output.
pub fn prettify(line: &str) -> String {
    let mut line = strip_control(&escape_html(line));
    for (rule, span) in STYLE_RULES.iter() {
        line = rule.replace_all(&line, *span).into_owned();
    }
    line
}

/// Escape one raw line and remove the code vocabulary without emitting
/// spans, for text-only consumers of the same blobs.
pub fn strip_styles(line: &str) -> String {
    let mut line = strip_control(&escape_html(line));
    for rule in PLAIN_RULES.iter() {
        line = rule.replace_all(&line, "").into_owned();
    }
    line
}

/// Pair physical lines with their 1-based line numbers.
///
/// The numbered range is `start_line + 1 ..= end_line`; when it is empty a
/// single slot at `start_line + 1` is assumed (unterminated single line).
/// When range and physical count disagree, pairing truncates to the shorter
/// side, which drops a trailing partial line from the numbered set.
fn line_slots(event: &JobEvent) -> Vec<(u64, String)> {
    let Some(stdout) = event.stdout.as_deref() else {
        return Vec::new();
    };

    let mut nums: Vec<u64> = (event.start_line + 1..=event.end_line).collect();
    if nums.is_empty() {
        nums.push(event.start_line + 1);
    }

    // First tab only, as the server renders it.
    let text = stdout.replacen('\t', "        ", 1);
    let lines: Vec<String> = text.split("\r\n").map(str::to_string).collect();

    if nums.len() > lines.len() {
        tracing::debug!(
            counter = event.counter,
            slots = nums.len(),
            lines = lines.len(),
            "stdout line count short of logical range"
        );
        nums.truncate(lines.len());
    }

    let lines = distribute_colors(lines);
    nums.into_iter().zip(lines).collect()
}

/// Carry an unreset color code onto following lines.
///
/// A line that sets a code without a `[0m` reset leaves the code open; the
/// code is prepended to every following line until one carries a reset. The
/// prepended code keeps re-arming itself, so the bleed spans any number of
/// lines. State is local to one call and never crosses events.
fn distribute_colors(lines: Vec<String>) -> Vec<String> {
    let mut color_code: Option<&'static str> = None;
    lines
        .into_iter()
        .map(|mut line| {
            if let Some(code) = color_code {
                line.insert_str(0, code);
            }
            if line.contains("[0m") {
                color_code = None;
            } else if let Some(code) = BLEED_CODES.iter().find(|code| line.contains(**code)) {
                color_code = Some(code);
            }
            line
        })
        .collect()
}

fn line_classes(event: &JobEvent, line_number: u64) -> Vec<String> {
    let mut classes = Vec::new();
    if line_number == event.end_line {
        // Continuation-anchor marker: tells the pane where the next
        // sequential event's lines belong.
        classes.push(format!("next_is_{}", event.end_line + 1));
    }
    if !console_types::STRUCTURAL_EVENT_KINDS.contains(&event.event_name.as_str()) {
        classes.push("not_skeleton".to_string());
    }
    classes.push(format!("line_num_{line_number}"));
    classes
}

/// Header flag, fold group, and time badge for one line.
fn header_flags(
    event: &JobEvent,
    raw_line: &str,
) -> (bool, Option<String>, Option<DateTime<Utc>>) {
    let structural_header = (event.event_name == EVENT_PLAY_START
        || event.event_name == EVENT_TASK_START)
        && !raw_line.is_empty();
    let recap_header = event.event_name == EVENT_STATS && raw_line.contains(PLAY_MARKER);

    if !structural_header && !recap_header {
        return (false, None, None);
    }

    let fold_group = if structural_header {
        if event.event_name == EVENT_PLAY_START && raw_line.contains(PLAY_MARKER) {
            event.play_uuid().map(|uuid| format!("play_{uuid}"))
        } else if raw_line.contains(TASK_MARKER) || raw_line.contains(HANDLER_MARKER) {
            event.task_uuid().map(|uuid| format!("task_{uuid}"))
        } else {
            // Banner lines without a recognized marker stay headers but
            // get no collapse affordance.
            None
        }
    } else {
        None
    };

    (true, fold_group, Some(event.created))
}

fn escape_html(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#x27;")
}

/// Remove the escape byte and its literal `u001b` spelling; the bracket
/// codes are matched without it.
fn strip_control(input: &str) -> String {
    input.replace('\u{1b}', "").replace("u001b", "")
}

// ============================================================================
// Tests
// ============================================================================
