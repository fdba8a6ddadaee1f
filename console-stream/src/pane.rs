//! Incremental placement of rendered blocks into the live output pane.
//!
//! The pane is a pure in-memory model: an ordered list of blocks (one per
//! stdout-bearing event), a global line index, per-fold-group orderings, and
//! the continuation anchors left by blocks whose decoded lines cover their
//! full logical range. The rendering layer mirrors the [`Placement`] values
//! this module emits; nothing here touches presentation state.
//!
//! Scroll intent lives here too. The follow anchor conceptually sits after
//! the last block; every insertion relocates it, and when follow mode is
//! engaged the insertion records a scroll request for the renderer to
//! consume.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;

use crate::decode::DisplayLine;
use crate::queue::NormalizedEvent;

/// Where a block landed, phrased for a renderer mirroring the pane.
/// Neighbor blocks are named by their 1-based `start_line`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Appended at the bottom of the pane.
    Bottom,
    /// Inserted before every existing block.
    Front,
    /// Inserted immediately before the named block.
    Before(u64),
    /// Inserted immediately after the named block.
    After(u64),
    /// A block with this `start_line` is already materialized; nothing
    /// inserted.
    Duplicate,
    /// The event carried no renderable lines.
    Empty,
    /// A truncation notice is active; insertion is suppressed.
    Suppressed,
}

impl Placement {
    pub fn inserted(self) -> bool {
        matches!(
            self,
            Placement::Bottom | Placement::Front | Placement::Before(_) | Placement::After(_)
        )
    }
}

/// Why the bulk of a job's output is not being rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Truncation {
    /// The finished job's event count exceeds the display ceiling.
    TooManyEvents { count: u64, max_events: u64 },
    /// The running job has already exceeded the ceiling; output stays
    /// hidden until it can be downloaded whole.
    TooManyWhileRunning { count: u64, max_events: u64 },
}

impl Truncation {
    /// Banner text for the suppressed pane.
    pub fn notice(&self) -> &'static str {
        match self {
            Truncation::TooManyEvents { .. } => {
                "The output is too large to display. Please download."
            }
            Truncation::TooManyWhileRunning { .. } => {
                "Too much output has accumulated to display while the job is running. \
                 Download the full output once the job finishes."
            }
        }
    }
}

const FOLLOW_TOOLTIP_RUNNING: &str =
    "Currently following output as it comes in. Click to unfollow.";
const FOLLOW_TOOLTIP_FINISHED: &str = "Jump to last line of output.";

/// One materialized block: the rendered lines of one event.
#[derive(Debug, Clone)]
pub struct PaneBlock {
    pub counter: u64,
    /// 1-based first line number.
    pub start_line: u64,
    /// 1-based logical end boundary.
    pub end_line: u64,
    /// 1-based boundary implied by the decoded line count.
    pub actual_end_line: u64,
    pub fold_group: Option<String>,
    pub is_header: bool,
    pub lines: Vec<DisplayLine>,
}

#[derive(Debug)]
pub struct OutputPane {
    /// Block `start_line`s in pane order, top to bottom.
    order: Vec<u64>,
    /// `start_line` → block.
    blocks: HashMap<u64, PaneBlock>,
    /// Fold group id → member `start_line`s, sorted.
    groups: HashMap<String, BTreeSet<u64>>,
    /// Continuation anchors: logical `end_line` → owning block.
    anchors: HashMap<u64, u64>,
    /// Every materialized line number → owning block.
    line_owner: BTreeMap<u64, u64>,
    truncation: Option<Truncation>,
    follow_engaged: bool,
    job_finished: bool,
    scroll_requested: bool,
}

impl Default for OutputPane {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputPane {
    /// Pane for a job still producing output; follow starts engaged.
    pub fn new() -> Self {
        Self {
            order: Vec::new(),
            blocks: HashMap::new(),
            groups: HashMap::new(),
            anchors: HashMap::new(),
            line_owner: BTreeMap::new(),
            truncation: None,
            follow_engaged: true,
            job_finished: false,
            scroll_requested: false,
        }
    }

    /// Pane for a job that had already finished when the view opened;
    /// follow starts disengaged and the tooltip reads as a jump action.
    pub fn for_finished_job() -> Self {
        let mut pane = Self::new();
        pane.follow_engaged = false;
        pane.job_finished = true;
        pane
    }

    /// Place one normalized event's rendered lines.
    pub fn insert(&mut self, event: &NormalizedEvent) -> Placement {
        if self.truncation.is_some() {
            return Placement::Suppressed;
        }
        let lines = match event.stdout.as_ref() {
            Some(lines) if !lines.is_empty() => lines,
            _ => return Placement::Empty,
        };
        let start = event.start_line;
        if self.blocks.contains_key(&start) {
            tracing::debug!(start_line = start, counter = event.counter, "duplicate block skipped");
            return Placement::Duplicate;
        }

        let (index, placement) = self.locate(event);

        self.order.insert(index, start);
        for line in lines {
            self.line_owner.insert(line.line_number, start);
        }
        if let Some(group) = event.fold_group.as_deref() {
            self.groups.entry(group.to_string()).or_default().insert(start);
        }
        // Only a block covering its full logical range leaves an anchor;
        // a truncated line set would misplace the successor.
        if event.actual_end_line == event.end_line {
            self.anchors.insert(event.end_line, start);
        }
        self.blocks.insert(
            start,
            PaneBlock {
                counter: event.counter,
                start_line: start,
                end_line: event.end_line,
                actual_end_line: event.actual_end_line,
                fold_group: event.fold_group.clone(),
                is_header: lines.iter().any(|l| l.is_header),
                lines: lines.clone(),
            },
        );

        // Follow anchor moves to the new end of the pane.
        if self.follow_engaged {
            self.scroll_requested = true;
        }

        placement
    }

    fn locate(&self, event: &NormalizedEvent) -> (usize, Placement) {
        // Sequential arrival: the previous block's range ends exactly where
        // this one starts.
        if let Some(&owner) = self.anchors.get(&event.start_line) {
            if let Some(index) = self.index_of(owner) {
                return (index + 1, Placement::After(owner));
            }
        }

        // Ordinal position among the event's fold-group siblings.
        if let Some(group) = event.fold_group.as_deref() {
            if let Some(members) = self.groups.get(group).filter(|m| !m.is_empty()) {
                let after = members
                    .range((Bound::Unbounded, Bound::Excluded(event.start_line)))
                    .next_back()
                    .copied();
                let before = members
                    .range((Bound::Excluded(event.start_line), Bound::Unbounded))
                    .next()
                    .copied();
                if let Some(prev) = after {
                    if let Some(index) = self.index_of(prev) {
                        return (index + 1, Placement::After(prev));
                    }
                }
                if let Some(next) = before {
                    if let Some(index) = self.index_of(next) {
                        return (index, Placement::Before(next));
                    }
                }
            }
        }

        // No anchor, no siblings: order by the materialized lines.
        if let Some((_, &owner)) = self
            .line_owner
            .range((Bound::Unbounded, Bound::Excluded(event.start_line)))
            .next_back()
        {
            if let Some(index) = self.index_of(owner) {
                return (index + 1, Placement::After(owner));
            }
        }

        if self.order.is_empty() {
            (0, Placement::Bottom)
        } else {
            (0, Placement::Front)
        }
    }

    fn index_of(&self, start_line: u64) -> Option<usize> {
        self.order.iter().position(|&s| s == start_line)
    }

    pub fn set_truncation(&mut self, truncation: Truncation) {
        self.truncation = Some(truncation);
    }

    pub fn truncation(&self) -> Option<Truncation> {
        self.truncation
    }

    /// User toggles follow mode. Disengaging is sticky until the user
    /// re-engages.
    pub fn set_follow(&mut self, engaged: bool) {
        self.follow_engaged = engaged;
        if engaged {
            self.scroll_requested = true;
        }
    }

    pub fn follow_engaged(&self) -> bool {
        self.follow_engaged
    }

    pub fn follow_tooltip(&self) -> &'static str {
        if self.job_finished {
            FOLLOW_TOOLTIP_FINISHED
        } else {
            FOLLOW_TOOLTIP_RUNNING
        }
    }

    /// Terminal status observed: flip the follow affordance to jump-to-end
    /// and, when still following, issue one last scroll.
    pub fn finish_job(&mut self) {
        self.job_finished = true;
        if self.follow_engaged {
            self.scroll_requested = true;
        }
        self.follow_engaged = false;
    }

    pub fn job_finished(&self) -> bool {
        self.job_finished
    }

    /// Consume the pending scroll-to-anchor intent, if any.
    pub fn take_scroll_request(&mut self) -> bool {
        std::mem::take(&mut self.scroll_requested)
    }

    /// `start_line` of the block the follow anchor currently sits after.
    pub fn follow_anchor(&self) -> Option<u64> {
        self.order.last().copied()
    }

    /// Blocks in pane order.
    pub fn blocks(&self) -> impl Iterator<Item = &PaneBlock> {
        self.order.iter().filter_map(|start| self.blocks.get(start))
    }

    pub fn block(&self, start_line: u64) -> Option<&PaneBlock> {
        self.blocks.get(&start_line)
    }

    /// All materialized line numbers, ascending.
    pub fn line_numbers(&self) -> Vec<u64> {
        self.line_owner.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================
