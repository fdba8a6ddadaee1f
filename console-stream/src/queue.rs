//! Event normalization and the counter-keyed queue
//!
//! `normalize` turns one raw wire event into the canonical record the pane
//! works with; `EventQueue` tracks per-counter processed state so an event
//! delivered twice (REST backlog and socket push) renders at most once.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use console_types::{JobEvent, EVENT_STATS};

use crate::decode::{self, DisplayLine};

/// What a normalized event changes in the view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChangeKind {
    /// Rendered output lines to place in the pane
    Stdout,
    /// Per-host recap totals for the summary panel
    Recap,
}

/// Canonical internal record of one wire event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedEvent {
    pub counter: u64,
    pub id: i64,
    /// Flips false → true exactly once, when the pane has materialized
    /// this event's effect
    pub processed: bool,
    pub name: String,
    pub changes: Vec<ChangeKind>,
    /// Decoded lines, present when the raw event carried stdout
    pub stdout: Option<Vec<DisplayLine>>,
    /// 1-based line boundaries; meaningful when `stdout` is present
    pub start_line: u64,
    pub end_line: u64,
    /// 1-based boundary of the lines actually rendered; diverges from
    /// `end_line` when the blob was short of its logical range
    pub actual_end_line: u64,
    /// Fold group this event's lines belong to (`task_*` wins over
    /// `play_*`)
    pub fold_group: Option<String>,
    pub recap: Option<HostTotals>,
    pub created: DateTime<Utc>,
}

/// Hosts-by-final-state totals from a recap event.
///
/// Each host lands in exactly one bucket: unreachable beats failures beats
/// changed beats ok beats skipped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HostTotals {
    pub ok: u64,
    pub skipped: u64,
    pub unreachable: u64,
    pub failures: u64,
    pub changed: u64,
}

/// Normalize one raw event. Always produces a full record; line decoding
/// and recap aggregation happen here so downstream stages only see
/// display-ready data.
pub fn normalize(raw: &JobEvent) -> NormalizedEvent {
    let mut changes = Vec::new();

    let mut stdout = None;
    let mut start_line = 0;
    let mut end_line = 0;
    let mut actual_end_line = 0;
    if raw.stdout.is_some() {
        let lines = decode::decode(raw);
        start_line = raw.start_line + 1;
        end_line = raw.end_line + 1;
        actual_end_line = raw.start_line + lines.len() as u64 + 1;
        stdout = Some(lines);
        changes.push(ChangeKind::Stdout);
    }

    let recap = (raw.event_name == EVENT_STATS).then(|| host_totals(&raw.event_data));
    if recap.is_some() {
        changes.push(ChangeKind::Recap);
    }

    let fold_group = raw
        .task_uuid()
        .map(|uuid| format!("task_{uuid}"))
        .or_else(|| raw.play_uuid().map(|uuid| format!("play_{uuid}")));

    NormalizedEvent {
        counter: raw.counter,
        id: raw.id,
        processed: false,
        name: raw.event_name.clone(),
        changes,
        stdout,
        start_line,
        end_line,
        actual_end_line,
        fold_group,
        recap,
        created: raw.created,
    }
}

/// Aggregate a recap event's `event_data` into hosts-by-state totals.
pub fn host_totals(event_data: &serde_json::Value) -> HostTotals {
    const STATE_KEYS: [&str; 5] = ["changed", "dark", "failures", "ok", "skipped"];

    let mut hosts: HashMap<&str, HashMap<&str, u64>> = HashMap::new();
    for key in STATE_KEYS {
        let Some(per_host) = event_data.get(key).and_then(|v| v.as_object()) else {
            continue;
        };
        for (host, count) in per_host {
            *hosts
                .entry(host.as_str())
                .or_default()
                .entry(key)
                .or_default() += count.as_u64().unwrap_or(0);
        }
    }

    let mut totals = HostTotals::default();
    for states in hosts.values() {
        let count_of = |key: &str| states.get(key).copied().unwrap_or(0);
        if count_of("dark") > 0 {
            totals.unreachable += 1;
        } else if count_of("failures") > 0 {
            totals.failures += 1;
        } else if count_of("changed") > 0 {
            totals.changed += 1;
        } else if count_of("ok") > 0 {
            totals.ok += 1;
        } else if count_of("skipped") > 0 {
            totals.skipped += 1;
        }
    }
    totals
}

/// Counter-keyed store of normalized events for one job view.
///
/// Owned by the stream coordinator; cleared on context change and teardown.
#[derive(Debug, Default)]
pub struct EventQueue {
    queue: HashMap<u64, NormalizedEvent>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every entry; the next `apply` of any counter renders again.
    pub fn initialize(&mut self) {
        self.queue.clear();
    }

    /// Normalize and store `raw`, returning the record only if this counter
    /// has not been rendered yet. Re-application replaces the payload but
    /// keeps the existing processed flag, so duplicate delivery never
    /// renders twice.
    pub fn apply(&mut self, raw: &JobEvent) -> Option<NormalizedEvent> {
        let mut event = normalize(raw);
        if let Some(existing) = self.queue.get(&raw.counter) {
            event.processed = existing.processed;
        }
        let already_rendered = event.processed;
        self.queue.insert(raw.counter, event.clone());

        if already_rendered {
            tracing::debug!(counter = raw.counter, "event already rendered, skipping");
            None
        } else {
            Some(event)
        }
    }

    /// The pane's acknowledgment that a counter's effect is materialized.
    pub fn mark_processed(&mut self, counter: u64) {
        if let Some(event) = self.queue.get_mut(&counter) {
            event.processed = true;
        }
    }

    pub fn get(&self, counter: u64) -> Option<&NormalizedEvent> {
        self.queue.get(&counter)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================
