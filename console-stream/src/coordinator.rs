//! Stream coordinator: the state machine behind one job view.
//!
//! [`CoordinatorCore`] is the pure state machine. It owns the event queue,
//! the output pane, the phase gates, and the context version; every input
//! returns the [`Action`]s the caller must carry out (fetches to issue,
//! subscription changes, updates for the embedder). It does no I/O, which
//! keeps the sequencing rules unit-testable.
//!
//! [`spawn`] wraps the core in a tokio task: a single consumer loop over
//! the transport's frame channel, the fetch-result channel, the flush and
//! elapsed tickers, and the embedder's command channel. Page fetches run as
//! spawned tasks tagged with the context version they were issued under;
//! the core discards results whose tag has gone stale.
//!
//! Phase gating enforces the ordering contract: structural skeleton first,
//! then backlog replay, and only then live flushes. Socket events that
//! arrive early are parked and join the flush buffer when the gates open.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use console_types::{JobEvent, JobStatus, JobSummary, SocketFrame, Subscription};

use crate::api::{ApiClient, ApiError, EventQuery, FetchedPage};
use crate::pane::{OutputPane, PaneBlock, Placement, Truncation};
use crate::queue::{ChangeKind, EventQueue, HostTotals};
use crate::transport::{self, ConnectionState, SocketHandle, TransportConfig, TransportEvent};

/// Event ceiling applied when the server does not advertise one.
pub const DEFAULT_MAX_EVENTS: u64 = 4000;

/// Pipeline phase for one job view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    /// Structural events loading; nothing else renders yet.
    LoadingSkeleton,
    /// Detail history replaying up to the live boundary.
    ReplayingBacklog,
    /// Socket events flushing on the buffer tick.
    Live,
    TornDown,
}

/// Low-water mark of counters seen on the socket, which fences the backlog
/// replay for views opened mid-run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirstLive {
    /// No job event seen on the socket yet.
    Unset,
    /// Counter 1 arrived live: the stream started after attach, there is no
    /// missed history to fence.
    FromStart,
    /// Lowest counter observed so far.
    At(u64),
}

impl FirstLive {
    /// Record one observed counter. Returns the new backlog boundary when
    /// the observation set or lowered it.
    fn observe(&mut self, counter: u64) -> Option<u64> {
        if counter == 1 {
            *self = FirstLive::FromStart;
            return None;
        }
        match *self {
            FirstLive::FromStart => None,
            FirstLive::Unset => {
                *self = FirstLive::At(counter);
                Some(counter)
            }
            FirstLive::At(current) if counter < current => {
                *self = FirstLive::At(counter);
                Some(counter)
            }
            FirstLive::At(_) => None,
        }
    }
}

/// Which request a [`FetchSpec`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchKind {
    /// Structural events, `order_by=start_line`.
    Skeleton,
    /// Non-structural events, optionally fenced by `counter__lte`.
    Detail,
    /// The job's own summary record.
    Summary,
}

/// One fetch for the driver to run. Results come back through
/// [`CoordinatorCore::on_page`] / [`CoordinatorCore::on_summary`] carrying
/// the same tags, which is how stale work is recognized.
#[derive(Debug, Clone)]
pub struct FetchSpec {
    pub kind: FetchKind,
    /// Context version at issue time.
    pub ctx: u64,
    /// Backlog run this detail fetch belongs to.
    pub generation: u64,
    /// Absolute next-page link; `None` requests the first page.
    pub next: Option<String>,
    /// Backlog fence for detail fetches.
    pub counter_lte: Option<u64>,
}

/// What the embedder sees. The renderer mirrors `Block` placements; all
/// other variants update chrome around the pane.
#[derive(Debug, Clone)]
pub enum StreamUpdate {
    Phase(Phase),
    /// Skeleton fully loaded; headers exist for detail placement.
    SkeletonReady,
    /// One block materialized in the pane.
    Block {
        placement: Placement,
        block: PaneBlock,
    },
    /// Follow mode wants the anchor scrolled into view.
    ScrollToAnchor,
    Status(JobStatus),
    /// Elapsed seconds while the job runs.
    Elapsed(f64),
    /// Per-host totals from the recap event.
    Recap(HostTotals),
    /// Reconciled job record after terminal status.
    SummaryRefreshed(JobSummary),
    /// A `jobs` frame without status: some job's summary data is complete.
    SummaryComplete {
        job_id: i64,
        job_name: Option<String>,
    },
    Truncated(Truncation),
    Connection(ConnectionState),
    /// Non-blocking failure notice.
    Notice(String),
    /// Session-fatal interrupt: control frame or rejected credentials.
    SessionExpired { reason: Option<String> },
}

/// Side effects the core asks its driver to carry out.
#[derive(Debug, Clone)]
pub enum Action {
    Fetch(FetchSpec),
    Subscribe(Subscription),
    Update(StreamUpdate),
}

#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Live buffer flush cadence.
    pub flush_interval: Duration,
    /// Events applied per flush tick.
    pub flush_batch: usize,
    /// Elapsed-ticker cadence.
    pub elapsed_interval: Duration,
    /// Truncation ceiling when the server sends no `X-UI-Max-Events`.
    pub default_max_events: u64,
    pub transport: TransportConfig,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(500),
            flush_batch: 4,
            elapsed_interval: Duration::from_secs(1),
            default_max_events: DEFAULT_MAX_EVENTS,
            transport: TransportConfig::default(),
        }
    }
}

/// The per-job-view state machine. One owned instance per view; construct,
/// drive, tear down.
#[derive(Debug)]
pub struct CoordinatorCore {
    job: JobSummary,
    status: JobStatus,
    phase: Phase,
    ctx: u64,
    backlog_generation: u64,
    queue: EventQueue,
    pane: OutputPane,
    first_live: FirstLive,
    /// Socket events held back until skeleton + backlog resolve.
    parked: VecDeque<JobEvent>,
    /// Socket events eligible for the next flush ticks.
    live_buffer: VecDeque<JobEvent>,
    /// Detail pages that arrived while the skeleton was still loading.
    pending_detail: Vec<FetchedPage>,
    skeleton_done: bool,
    backlog_done: bool,
    detail_page_seen: bool,
    max_events: u64,
    default_max_events: u64,
    flush_batch: usize,
    ticker_running: bool,
    started_at: Option<DateTime<Utc>>,
}

impl CoordinatorCore {
    pub fn new(job: JobSummary, options: &StreamOptions) -> Self {
        let pane = if job.status.is_terminal() {
            OutputPane::for_finished_job()
        } else {
            OutputPane::new()
        };
        Self {
            status: job.status,
            phase: Phase::Idle,
            ctx: 1,
            backlog_generation: 0,
            queue: EventQueue::new(),
            pane,
            first_live: FirstLive::Unset,
            parked: VecDeque::new(),
            live_buffer: VecDeque::new(),
            pending_detail: Vec::new(),
            skeleton_done: false,
            backlog_done: false,
            detail_page_seen: false,
            max_events: options.default_max_events,
            default_max_events: options.default_max_events,
            flush_batch: options.flush_batch,
            ticker_running: false,
            started_at: job.started,
            job,
        }
    }

    /// Kick off the view: subscribe, then load skeleton and initial detail
    /// history concurrently.
    pub fn start(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        self.phase = Phase::LoadingSkeleton;
        actions.push(Action::Update(StreamUpdate::Phase(self.phase)));
        actions.push(Action::Subscribe(Subscription::job_detail(self.job.id)));
        actions.push(Action::Fetch(self.fetch_spec(FetchKind::Skeleton, None, None)));
        actions.push(Action::Fetch(self.fetch_spec(FetchKind::Detail, None, None)));
        if self.status == JobStatus::Running {
            self.ticker_running = true;
            if self.started_at.is_none() {
                self.started_at = Some(Utc::now());
            }
        }
        actions
    }

    /// One fetched event page. `spec` is the tag the fetch was issued with.
    pub fn on_page(&mut self, spec: &FetchSpec, result: Result<FetchedPage, ApiError>) -> Vec<Action> {
        if self.phase == Phase::TornDown {
            return Vec::new();
        }
        if spec.ctx != self.ctx {
            tracing::debug!(kind = ?spec.kind, ctx = spec.ctx, current = self.ctx, "dropping stale page");
            return Vec::new();
        }
        match spec.kind {
            FetchKind::Skeleton => self.on_skeleton_page(result),
            FetchKind::Detail => {
                if spec.generation != self.backlog_generation {
                    tracing::debug!(
                        generation = spec.generation,
                        current = self.backlog_generation,
                        "dropping page from a superseded backlog run"
                    );
                    return Vec::new();
                }
                self.on_detail_page(result)
            }
            FetchKind::Summary => {
                tracing::debug!("summary results go through on_summary");
                Vec::new()
            }
        }
    }

    /// The reconciling summary refetch after terminal status.
    pub fn on_summary(&mut self, ctx: u64, result: Result<JobSummary, ApiError>) -> Vec<Action> {
        if self.phase == Phase::TornDown || ctx != self.ctx {
            return Vec::new();
        }
        match result {
            Ok(summary) => {
                self.status = summary.status;
                self.started_at = summary.started.or(self.started_at);
                self.job = summary.clone();
                vec![Action::Update(StreamUpdate::SummaryRefreshed(summary))]
            }
            Err(error) => self.fetch_failure("refreshing the job summary", error),
        }
    }

    /// One inbound socket frame.
    pub fn on_frame(&mut self, frame: SocketFrame) -> Vec<Action> {
        if self.phase == Phase::TornDown {
            return Vec::new();
        }
        let mut actions = Vec::new();
        match frame {
            SocketFrame::JobEvents(event) => {
                if event.job != Some(self.job.id) {
                    tracing::debug!(job = ?event.job, "event frame for another job");
                    return actions;
                }
                if let Some(boundary) = self.first_live.observe(event.counter) {
                    self.refetch_backlog(boundary, &mut actions);
                }
                if self.phase == Phase::Live {
                    self.live_buffer.push_back(event);
                } else {
                    self.parked.push_back(event);
                }
            }
            SocketFrame::Jobs {
                job_id,
                status,
                job_name,
            } => match status {
                None => {
                    actions.push(Action::Update(StreamUpdate::SummaryComplete {
                        job_id,
                        job_name,
                    }));
                }
                Some(new_status) if job_id == self.job.id => {
                    self.on_status(new_status, &mut actions);
                }
                Some(_) => {
                    tracing::debug!(job_id, "status frame for another job");
                }
            },
            SocketFrame::Control { reason } => {
                tracing::warn!(?reason, "control frame forcing session termination");
                actions.push(Action::Update(StreamUpdate::SessionExpired { reason }));
            }
        }
        self.scroll(&mut actions);
        actions
    }

    /// Flush tick: drain a small batch of buffered live events.
    pub fn on_flush_tick(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.phase != Phase::Live {
            return actions;
        }
        for _ in 0..self.flush_batch {
            let Some(raw) = self.live_buffer.pop_front() else {
                break;
            };
            self.apply_raw(&raw, &mut actions);
        }
        self.scroll(&mut actions);
        actions
    }

    /// Elapsed tick; `None` while the ticker is stopped.
    pub fn on_elapsed_tick(&mut self) -> Option<StreamUpdate> {
        if !self.ticker_running {
            return None;
        }
        let started = self.started_at?;
        let elapsed = (Utc::now() - started).num_seconds().max(0) as f64;
        self.job.elapsed = elapsed;
        Some(StreamUpdate::Elapsed(elapsed))
    }

    /// Switch the view to another job without touching the transport
    /// connection. Everything view-scoped resets; in-flight fetches for the
    /// old job die by context tag.
    pub fn change_job(&mut self, job: JobSummary) -> Vec<Action> {
        self.ctx += 1;
        self.queue.initialize();
        self.pane = if job.status.is_terminal() {
            OutputPane::for_finished_job()
        } else {
            OutputPane::new()
        };
        self.status = job.status;
        self.started_at = job.started;
        self.ticker_running = false;
        self.first_live = FirstLive::Unset;
        self.parked.clear();
        self.live_buffer.clear();
        self.pending_detail.clear();
        self.skeleton_done = false;
        self.backlog_done = false;
        self.detail_page_seen = false;
        self.max_events = self.default_max_events;
        self.job = job;
        self.phase = Phase::Idle;
        self.start()
    }

    /// Leave the view: stale-tag all in-flight work, clear the queue and
    /// buffers, drop the socket subscription.
    pub fn teardown(&mut self) -> Vec<Action> {
        self.ctx += 1;
        self.phase = Phase::TornDown;
        self.queue.initialize();
        self.parked.clear();
        self.live_buffer.clear();
        self.pending_detail.clear();
        self.ticker_running = false;
        self.first_live = FirstLive::Unset;
        vec![
            Action::Subscribe(Subscription::none()),
            Action::Update(StreamUpdate::Phase(Phase::TornDown)),
        ]
    }

    /// User toggles follow mode.
    pub fn set_follow(&mut self, engaged: bool) -> Vec<Action> {
        self.pane.set_follow(engaged);
        let mut actions = Vec::new();
        self.scroll(&mut actions);
        actions
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn context(&self) -> u64 {
        self.ctx
    }

    pub fn job(&self) -> &JobSummary {
        &self.job
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn pane(&self) -> &OutputPane {
        &self.pane
    }

    pub fn queue(&self) -> &EventQueue {
        &self.queue
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn fetch_spec(
        &self,
        kind: FetchKind,
        next: Option<String>,
        counter_lte: Option<u64>,
    ) -> FetchSpec {
        FetchSpec {
            kind,
            ctx: self.ctx,
            generation: self.backlog_generation,
            next,
            counter_lte,
        }
    }

    fn on_skeleton_page(&mut self, result: Result<FetchedPage, ApiError>) -> Vec<Action> {
        let mut actions = Vec::new();
        match result {
            Ok(fetched) => {
                if let Some(max) = fetched.max_events {
                    self.max_events = max;
                }
                for raw in &fetched.page.results {
                    self.apply_raw(raw, &mut actions);
                }
                match fetched.page.next {
                    Some(next) => actions.push(Action::Fetch(self.fetch_spec(
                        FetchKind::Skeleton,
                        Some(next),
                        None,
                    ))),
                    None => self.finish_skeleton(&mut actions),
                }
            }
            Err(error) => {
                actions.extend(self.fetch_failure("loading the output skeleton", error));
                self.finish_skeleton(&mut actions);
            }
        }
        self.scroll(&mut actions);
        actions
    }

    fn finish_skeleton(&mut self, actions: &mut Vec<Action>) {
        if self.skeleton_done {
            return;
        }
        self.skeleton_done = true;
        actions.push(Action::Update(StreamUpdate::SkeletonReady));
        // Detail pages held back while headers were loading apply now.
        for fetched in std::mem::take(&mut self.pending_detail) {
            self.process_detail_page(fetched, actions);
        }
        self.advance_phase(actions);
    }

    fn on_detail_page(&mut self, result: Result<FetchedPage, ApiError>) -> Vec<Action> {
        let mut actions = Vec::new();
        match result {
            Ok(fetched) => {
                if !self.skeleton_done {
                    self.pending_detail.push(fetched);
                } else {
                    self.process_detail_page(fetched, &mut actions);
                }
            }
            Err(error) => {
                actions.extend(self.fetch_failure("loading previous output", error));
                self.finish_backlog(&mut actions);
            }
        }
        self.scroll(&mut actions);
        actions
    }

    fn process_detail_page(&mut self, fetched: FetchedPage, actions: &mut Vec<Action>) {
        if self.backlog_done {
            return;
        }
        if let Some(max) = fetched.max_events {
            self.max_events = max;
        }
        if !self.detail_page_seen {
            self.detail_page_seen = true;
            if fetched.page.count > self.max_events {
                let truncation = if self.status.is_terminal() {
                    Truncation::TooManyEvents {
                        count: fetched.page.count,
                        max_events: self.max_events,
                    }
                } else {
                    Truncation::TooManyWhileRunning {
                        count: fetched.page.count,
                        max_events: self.max_events,
                    }
                };
                self.pane.set_truncation(truncation);
                actions.push(Action::Update(StreamUpdate::Truncated(truncation)));
                self.finish_backlog(actions);
                return;
            }
        }
        for raw in &fetched.page.results {
            self.apply_raw(raw, actions);
        }
        match fetched.page.next {
            Some(next) => {
                actions.push(Action::Fetch(self.fetch_spec(FetchKind::Detail, Some(next), None)));
            }
            None => self.finish_backlog(actions),
        }
    }

    fn finish_backlog(&mut self, actions: &mut Vec<Action>) {
        if self.backlog_done {
            return;
        }
        self.backlog_done = true;
        self.advance_phase(actions);
    }

    fn advance_phase(&mut self, actions: &mut Vec<Action>) {
        let next = if self.skeleton_done && self.backlog_done {
            Phase::Live
        } else if self.skeleton_done {
            Phase::ReplayingBacklog
        } else {
            self.phase
        };
        if next != self.phase {
            self.phase = next;
            actions.push(Action::Update(StreamUpdate::Phase(next)));
            if next == Phase::Live {
                self.live_buffer.extend(self.parked.drain(..));
            }
        }
    }

    /// A view opened mid-run just learned its live boundary: fence a fresh
    /// backlog run and drop the unfenced one.
    fn refetch_backlog(&mut self, boundary: u64, actions: &mut Vec<Action>) {
        tracing::debug!(boundary, "fencing backlog replay at first live counter");
        self.backlog_generation += 1;
        self.queue.initialize();
        self.pending_detail.clear();
        self.detail_page_seen = false;
        self.backlog_done = false;
        if self.phase == Phase::Live {
            self.phase = Phase::ReplayingBacklog;
            actions.push(Action::Update(StreamUpdate::Phase(self.phase)));
            // Already-buffered events wait for the fenced run to finish.
            self.parked.extend(self.live_buffer.drain(..));
        }
        actions.push(Action::Fetch(self.fetch_spec(
            FetchKind::Detail,
            None,
            Some(boundary),
        )));
    }

    fn on_status(&mut self, new_status: JobStatus, actions: &mut Vec<Action>) {
        if new_status == self.status {
            return;
        }
        self.status = new_status;
        self.job.status = new_status;
        actions.push(Action::Update(StreamUpdate::Status(new_status)));
        if new_status == JobStatus::Running {
            self.ticker_running = true;
            if self.started_at.is_none() {
                self.started_at = Some(Utc::now());
            }
        } else if new_status.is_terminal() {
            self.ticker_running = false;
            self.pane.finish_job();
            actions.push(Action::Fetch(self.fetch_spec(FetchKind::Summary, None, None)));
        }
    }

    fn apply_raw(&mut self, raw: &JobEvent, actions: &mut Vec<Action>) {
        let Some(event) = self.queue.apply(raw) else {
            return;
        };
        for change in &event.changes {
            match change {
                ChangeKind::Stdout => {
                    let placement = self.pane.insert(&event);
                    if placement.inserted() {
                        if let Some(block) = self.pane.block(event.start_line) {
                            actions.push(Action::Update(StreamUpdate::Block {
                                placement,
                                block: block.clone(),
                            }));
                        }
                    }
                }
                ChangeKind::Recap => {
                    if let Some(totals) = event.recap {
                        actions.push(Action::Update(StreamUpdate::Recap(totals)));
                    }
                }
            }
        }
        self.queue.mark_processed(event.counter);
    }

    fn fetch_failure(&mut self, what: &str, error: ApiError) -> Vec<Action> {
        if error.is_session_fatal() {
            tracing::warn!(error = %error, "session rejected during fetch");
            vec![Action::Update(StreamUpdate::SessionExpired { reason: None })]
        } else {
            tracing::warn!(error = %error, what, "fetch failed");
            vec![Action::Update(StreamUpdate::Notice(format!(
                "A problem occurred while {what}: {error}"
            )))]
        }
    }

    fn scroll(&mut self, actions: &mut Vec<Action>) {
        if self.pane.take_scroll_request() {
            actions.push(Action::Update(StreamUpdate::ScrollToAnchor));
        }
    }
}

// ============================================================================
// Driver
// ============================================================================

/// Commands the embedder can send a running stream.
#[derive(Debug, Clone)]
pub enum StreamCommand {
    SetFollow(bool),
    ChangeJob(JobSummary),
    /// Probe cancel eligibility and, if allowed, request cancellation.
    Cancel,
    Teardown,
}

/// Handle to a spawned job stream.
#[derive(Debug, Clone)]
pub struct JobStreamHandle {
    commands: mpsc::UnboundedSender<StreamCommand>,
}

impl JobStreamHandle {
    pub fn set_follow(&self, engaged: bool) {
        let _ = self.commands.send(StreamCommand::SetFollow(engaged));
    }

    pub fn change_job(&self, job: JobSummary) {
        let _ = self.commands.send(StreamCommand::ChangeJob(job));
    }

    pub fn cancel(&self) {
        let _ = self.commands.send(StreamCommand::Cancel);
    }

    pub fn teardown(&self) {
        let _ = self.commands.send(StreamCommand::Teardown);
    }
}

enum FetchOutcome {
    Page {
        spec: FetchSpec,
        result: Result<FetchedPage, ApiError>,
    },
    Summary {
        ctx: u64,
        result: Result<JobSummary, ApiError>,
    },
}

/// Spawn the stream task for one job view. Returns the command handle and
/// the update channel the embedder renders from.
pub fn spawn(
    api: ApiClient,
    socket_url: impl Into<String>,
    job: JobSummary,
    options: StreamOptions,
) -> (JobStreamHandle, mpsc::UnboundedReceiver<StreamUpdate>) {
    let socket_url = socket_url.into();
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (update_tx, update_rx) = mpsc::unbounded_channel();

    tokio::spawn(run_stream(api, socket_url, job, options, command_rx, update_tx));

    (JobStreamHandle { commands: command_tx }, update_rx)
}

async fn run_stream(
    api: ApiClient,
    socket_url: String,
    job: JobSummary,
    options: StreamOptions,
    mut commands: mpsc::UnboundedReceiver<StreamCommand>,
    updates: mpsc::UnboundedSender<StreamUpdate>,
) {
    let (socket, mut frames) = transport::connect(socket_url, options.transport.clone());
    let (fetch_tx, mut fetch_rx) = mpsc::unbounded_channel();
    let mut flush = tokio::time::interval(options.flush_interval);
    let mut elapsed = tokio::time::interval(options.elapsed_interval);
    let mut transport_alive = true;

    let mut core = CoordinatorCore::new(job, &options);
    perform(core.start(), &core, &api, &socket, &fetch_tx, &updates);

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                None | Some(StreamCommand::Teardown) => {
                    let actions = core.teardown();
                    perform(actions, &core, &api, &socket, &fetch_tx, &updates);
                    socket.close();
                    break;
                }
                Some(StreamCommand::SetFollow(engaged)) => {
                    let actions = core.set_follow(engaged);
                    perform(actions, &core, &api, &socket, &fetch_tx, &updates);
                }
                Some(StreamCommand::ChangeJob(job)) => {
                    let actions = core.change_job(job);
                    perform(actions, &core, &api, &socket, &fetch_tx, &updates);
                }
                Some(StreamCommand::Cancel) => {
                    spawn_cancel(api.clone(), core.job().id, updates.clone());
                }
            },
            event = frames.recv(), if transport_alive => match event {
                Some(TransportEvent::Frame(frame)) => {
                    let actions = core.on_frame(frame);
                    perform(actions, &core, &api, &socket, &fetch_tx, &updates);
                }
                Some(TransportEvent::Connecting { .. }) => {
                    let _ = updates.send(StreamUpdate::Connection(ConnectionState::Connecting));
                }
                Some(TransportEvent::Open { .. }) => {
                    let _ = updates.send(StreamUpdate::Connection(ConnectionState::Open));
                }
                Some(TransportEvent::Error(error)) => {
                    // The indicator tracks Connecting/Closed; errors are
                    // between the transport and its retry loop.
                    tracing::debug!(error = %error, "socket error");
                }
                Some(TransportEvent::Closed) | None => {
                    transport_alive = false;
                    let _ = updates.send(StreamUpdate::Connection(ConnectionState::Closed));
                }
            },
            Some(outcome) = fetch_rx.recv() => match outcome {
                FetchOutcome::Page { spec, result } => {
                    let actions = core.on_page(&spec, result);
                    perform(actions, &core, &api, &socket, &fetch_tx, &updates);
                }
                FetchOutcome::Summary { ctx, result } => {
                    let actions = core.on_summary(ctx, result);
                    perform(actions, &core, &api, &socket, &fetch_tx, &updates);
                }
            },
            _ = flush.tick() => {
                let actions = core.on_flush_tick();
                perform(actions, &core, &api, &socket, &fetch_tx, &updates);
            }
            _ = elapsed.tick() => {
                if let Some(update) = core.on_elapsed_tick() {
                    let _ = updates.send(update);
                }
            }
        }
    }
}

fn perform(
    actions: Vec<Action>,
    core: &CoordinatorCore,
    api: &ApiClient,
    socket: &SocketHandle,
    fetch_tx: &mpsc::UnboundedSender<FetchOutcome>,
    updates: &mpsc::UnboundedSender<StreamUpdate>,
) {
    for action in actions {
        match action {
            Action::Update(update) => {
                let _ = updates.send(update);
            }
            Action::Subscribe(subscription) => {
                if let Err(error) = socket.subscribe(subscription) {
                    tracing::warn!(error = %error, "subscription command failed");
                }
            }
            Action::Fetch(spec) => {
                spawn_fetch(spec, core.job().id, api.clone(), fetch_tx.clone());
            }
        }
    }
}

fn spawn_fetch(
    spec: FetchSpec,
    job_id: i64,
    api: ApiClient,
    tx: mpsc::UnboundedSender<FetchOutcome>,
) {
    if spec.kind == FetchKind::Summary {
        tokio::spawn(async move {
            let result = api.get_job(job_id).await;
            let _ = tx.send(FetchOutcome::Summary {
                ctx: spec.ctx,
                result,
            });
        });
        return;
    }

    let url = match &spec.next {
        Some(next) => Ok(next.clone()),
        None => {
            let query = if spec.kind == FetchKind::Skeleton {
                EventQuery::structural()
            } else {
                EventQuery::detail()
            };
            let query = match spec.counter_lte {
                Some(counter) => query.up_to_counter(counter),
                None => query,
            };
            api.events_url(job_id, &query)
        }
    };
    tokio::spawn(async move {
        let result = match url {
            Ok(url) => api.get_events(&url).await,
            Err(error) => Err(error),
        };
        let _ = tx.send(FetchOutcome::Page { spec, result });
    });
}

fn spawn_cancel(api: ApiClient, job_id: i64, updates: mpsc::UnboundedSender<StreamUpdate>) {
    tokio::spawn(async move {
        let outcome = async {
            if !api.can_cancel(job_id).await? {
                return Ok(false);
            }
            api.cancel(job_id).await?;
            Ok::<bool, ApiError>(true)
        }
        .await;
        match outcome {
            // The jobs channel reports the resulting status change.
            Ok(true) => {}
            Ok(false) => {
                let _ = updates.send(StreamUpdate::Notice(
                    "This job can no longer be canceled.".to_string(),
                ));
            }
            Err(error) => {
                let _ = updates.send(StreamUpdate::Notice(format!(
                    "Could not cancel the job: {error}"
                )));
            }
        }
    });
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use console_types::{EventPage, EVENT_PLAY_START, EVENT_TASK_START};
    use serde_json::json;

    fn summary(status: JobStatus) -> JobSummary {
        JobSummary {
            id: 42,
            name: "Nightly backup".to_string(),
            status,
            created: Utc::now(),
            started: matches!(status, JobStatus::Running).then(Utc::now),
            finished: None,
            elapsed: 0.0,
            job_explanation: None,
        }
    }

    fn core(status: JobStatus) -> CoordinatorCore {
        CoordinatorCore::new(summary(status), &StreamOptions::default())
    }

    /// A play or task header: a blank spacer line plus the banner line,
    /// occupying raw lines `raw_start .. raw_start + 2`.
    fn header_event(counter: u64, raw_start: u64, name: &str, uuid: &str) -> JobEvent {
        let (marker, event_data) = if name == EVENT_PLAY_START {
            ("PLAY", json!({ "play_uuid": uuid }))
        } else {
            ("TASK", json!({ "play_uuid": "p-1", "task_uuid": uuid }))
        };
        JobEvent {
            id: counter as i64,
            counter,
            event_name: name.to_string(),
            job: Some(42),
            start_line: raw_start,
            end_line: raw_start + 2,
            stdout: Some(format!("\r\n{marker} [site] ********\r\n")),
            created: Utc::now(),
            event_data,
        }
    }

    /// A runner event filling raw lines `raw_start .. raw_end`, one piece of
    /// text per line.
    fn detail_event(counter: u64, raw_start: u64, raw_end: u64, text: &str) -> JobEvent {
        let stdout: String = (0..raw_end - raw_start).map(|i| format!("{text}{i}\r\n")).collect();
        JobEvent {
            id: counter as i64,
            counter,
            event_name: "runner_on_ok".to_string(),
            job: Some(42),
            start_line: raw_start,
            end_line: raw_end,
            stdout: Some(stdout),
            created: Utc::now(),
            event_data: json!({ "task_uuid": "t-1" }),
        }
    }

    fn page(results: Vec<JobEvent>, count: u64, next: Option<&str>) -> FetchedPage {
        FetchedPage {
            page: EventPage {
                count,
                next: next.map(str::to_string),
                previous: None,
                results,
            },
            max_events: None,
        }
    }

    fn first_spec(actions: &[Action], kind: FetchKind) -> FetchSpec {
        actions
            .iter()
            .find_map(|action| match action {
                Action::Fetch(spec) if spec.kind == kind => Some(spec.clone()),
                _ => None,
            })
            .unwrap_or_else(|| panic!("no {kind:?} fetch in actions"))
    }

    fn live_frame(event: JobEvent) -> SocketFrame {
        SocketFrame::JobEvents(event)
    }

    fn status_frame(job_id: i64, status: JobStatus) -> SocketFrame {
        SocketFrame::Jobs {
            job_id,
            status: Some(status),
            job_name: None,
        }
    }

    // ------------------------------------------------------------------
    // FirstLive
    // ------------------------------------------------------------------

    #[test]
    fn test_first_live_low_water_mark() {
        let mut first = FirstLive::Unset;
        assert_eq!(first.observe(16), Some(16));
        assert_eq!(first.observe(20), None);
        assert_eq!(first.observe(12), Some(12));
        assert_eq!(first, FirstLive::At(12));
    }

    #[test]
    fn test_first_live_counter_one_means_no_backlog() {
        let mut first = FirstLive::Unset;
        assert_eq!(first.observe(1), None);
        assert_eq!(first, FirstLive::FromStart);
        // Later counters can no longer set a boundary.
        assert_eq!(first.observe(7), None);
    }

    // ------------------------------------------------------------------
    // Phase gating
    // ------------------------------------------------------------------

    #[test]
    fn test_phases_advance_skeleton_then_backlog_then_live() {
        let mut core = core(JobStatus::Running);
        core.start();
        assert_eq!(core.phase(), Phase::LoadingSkeleton);

        let spec = core.fetch_spec(FetchKind::Skeleton, None, None);
        core.on_page(&spec, Ok(page(vec![header_event(1, 0, EVENT_PLAY_START, "p-1")], 1, None)));
        assert_eq!(core.phase(), Phase::ReplayingBacklog);

        let spec = core.fetch_spec(FetchKind::Detail, None, None);
        core.on_page(&spec, Ok(page(vec![detail_event(2, 2, 4, "line")], 1, None)));
        assert_eq!(core.phase(), Phase::Live);
    }

    #[test]
    fn test_detail_page_waits_for_skeleton() {
        let mut core = core(JobStatus::Running);
        core.start();

        let detail = core.fetch_spec(FetchKind::Detail, None, None);
        core.on_page(&detail, Ok(page(vec![detail_event(2, 2, 4, "line")], 1, None)));
        // Nothing rendered yet; the page is parked.
        assert!(core.pane().is_empty());
        assert_eq!(core.phase(), Phase::LoadingSkeleton);

        let skeleton = core.fetch_spec(FetchKind::Skeleton, None, None);
        core.on_page(&skeleton, Ok(page(vec![header_event(1, 0, EVENT_PLAY_START, "p-1")], 1, None)));
        // Skeleton completion replays the parked page.
        assert_eq!(core.phase(), Phase::Live);
        assert_eq!(core.pane().len(), 2);
    }

    #[test]
    fn test_live_events_park_until_gates_open() {
        let mut core = core(JobStatus::Running);
        core.start();

        core.on_frame(live_frame(detail_event(30, 40, 41, "live")));
        assert!(core.on_flush_tick().is_empty());
        assert!(core.pane().is_empty());
    }

    #[test]
    fn test_flush_applies_batch_and_requests_scroll() {
        let mut core = core(JobStatus::Running);
        core.start();
        let spec = core.fetch_spec(FetchKind::Skeleton, None, None);
        core.on_page(&spec, Ok(page(vec![], 0, None)));
        let spec = core.fetch_spec(FetchKind::Detail, None, None);
        core.on_page(&spec, Ok(page(vec![], 0, None)));
        assert_eq!(core.phase(), Phase::Live);

        // Six buffered events, batch of four per tick. Counter 1 arrives
        // first: the stream began under our eyes, so no fence fires.
        for i in 1..=6u64 {
            core.on_frame(live_frame(detail_event(i, i - 1, i, "live")));
        }
        let actions = core.on_flush_tick();
        let blocks = actions
            .iter()
            .filter(|a| matches!(a, Action::Update(StreamUpdate::Block { .. })))
            .count();
        assert_eq!(blocks, 4);
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::Update(StreamUpdate::ScrollToAnchor))));

        let actions = core.on_flush_tick();
        let blocks = actions
            .iter()
            .filter(|a| matches!(a, Action::Update(StreamUpdate::Block { .. })))
            .count();
        assert_eq!(blocks, 2);
    }

    // ------------------------------------------------------------------
    // Context invalidation
    // ------------------------------------------------------------------

    #[test]
    fn test_stale_context_page_is_a_no_op() {
        let mut core = core(JobStatus::Running);
        let actions = core.start();
        let stale = first_spec(&actions, FetchKind::Skeleton);

        let mut other = summary(JobStatus::Running);
        other.id = 43;
        core.change_job(other);

        let before = core.queue().len();
        let actions = core.on_page(
            &stale,
            Ok(page(vec![header_event(1, 0, EVENT_PLAY_START, "p-1")], 1, None)),
        );
        assert!(actions.is_empty());
        assert_eq!(core.queue().len(), before);
        assert!(core.pane().is_empty());
    }

    #[test]
    fn test_superseded_backlog_run_is_dropped() {
        let mut core = core(JobStatus::Running);
        let actions = core.start();
        let unfenced = first_spec(&actions, FetchKind::Detail);

        let spec = core.fetch_spec(FetchKind::Skeleton, None, None);
        core.on_page(&spec, Ok(page(vec![header_event(1, 0, EVENT_PLAY_START, "p-1")], 1, None)));

        // Mid-run attach: first live counter fences a new backlog run.
        let actions = core.on_frame(live_frame(detail_event(16, 30, 31, "live")));
        let fenced = first_spec(&actions, FetchKind::Detail);
        assert_eq!(fenced.counter_lte, Some(16));

        // The unfenced run resolving late changes nothing.
        let actions = core.on_page(&unfenced, Ok(page(vec![detail_event(2, 2, 3, "old")], 1, None)));
        assert!(actions.is_empty());

        // The fenced run lands normally.
        core.on_page(&fenced, Ok(page(vec![detail_event(2, 2, 3, "new")], 1, None)));
        assert_eq!(core.phase(), Phase::Live);
    }

    // ------------------------------------------------------------------
    // Truncation
    // ------------------------------------------------------------------

    #[test]
    fn test_truncation_while_running_still_reaches_live() {
        let mut core = core(JobStatus::Running);
        core.start();
        let spec = core.fetch_spec(FetchKind::Skeleton, None, None);
        core.on_page(&spec, Ok(page(vec![header_event(1, 0, EVENT_PLAY_START, "p-1")], 1, None)));

        let spec = core.fetch_spec(FetchKind::Detail, None, None);
        let actions = core.on_page(&spec, Ok(page(vec![detail_event(2, 2, 3, "x")], 9000, None)));
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::Update(StreamUpdate::Truncated(Truncation::TooManyWhileRunning { .. }))
        )));
        assert_eq!(core.phase(), Phase::Live);
        // The bulk content was not rendered.
        assert!(core.pane().is_empty());

        // A first live counter still fences a replay; resolve it empty.
        let actions = core.on_frame(live_frame(detail_event(100, 50, 51, "live")));
        let fenced = first_spec(&actions, FetchKind::Detail);
        core.on_page(&fenced, Ok(page(vec![], 0, None)));
        assert_eq!(core.phase(), Phase::Live);

        // The pane keeps suppressing inserts for the rest of the view.
        let actions = core.on_flush_tick();
        assert!(!actions
            .iter()
            .any(|a| matches!(a, Action::Update(StreamUpdate::Block { .. }))));
        assert!(core.pane().is_empty());
    }

    #[test]
    fn test_truncation_message_for_finished_job() {
        let mut core = core(JobStatus::Successful);
        core.start();
        let spec = core.fetch_spec(FetchKind::Skeleton, None, None);
        core.on_page(&spec, Ok(page(vec![], 0, None)));

        let spec = core.fetch_spec(FetchKind::Detail, None, None);
        let actions = core.on_page(&spec, Ok(page(vec![], 9000, None)));
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::Update(StreamUpdate::Truncated(Truncation::TooManyEvents { .. }))
        )));
    }

    #[test]
    fn test_server_advertised_ceiling_overrides_default() {
        let mut core = core(JobStatus::Successful);
        core.start();
        let spec = core.fetch_spec(FetchKind::Skeleton, None, None);
        core.on_page(&spec, Ok(page(vec![], 0, None)));

        let spec = core.fetch_spec(FetchKind::Detail, None, None);
        let mut fetched = page(vec![detail_event(2, 1, 2, "x")], 500, None);
        fetched.max_events = Some(100);
        let actions = core.on_page(&spec, Ok(fetched));
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::Update(StreamUpdate::Truncated(Truncation::TooManyEvents {
                count: 500,
                max_events: 100,
            }))
        )));
    }

    // ------------------------------------------------------------------
    // Status channel
    // ------------------------------------------------------------------

    #[test]
    fn test_terminal_status_stops_ticker_and_refetches_summary() {
        let mut core = core(JobStatus::Running);
        core.start();
        assert!(core.on_elapsed_tick().is_some());

        let actions = core.on_frame(status_frame(42, JobStatus::Successful));
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::Update(StreamUpdate::Status(JobStatus::Successful)))));
        let refetch = first_spec(&actions, FetchKind::Summary);
        assert_eq!(refetch.ctx, core.context());
        assert!(core.on_elapsed_tick().is_none());
        assert!(!core.pane().follow_engaged());

        let mut reconciled = summary(JobStatus::Successful);
        reconciled.elapsed = 12.5;
        let actions = core.on_summary(refetch.ctx, Ok(reconciled));
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::Update(StreamUpdate::SummaryRefreshed(_)))));
        assert_eq!(core.job().elapsed, 12.5);
    }

    #[test]
    fn test_status_frames_for_other_jobs_are_ignored() {
        let mut core = core(JobStatus::Running);
        core.start();
        let actions = core.on_frame(status_frame(99, JobStatus::Failed));
        assert!(actions.is_empty());
        assert_eq!(core.status(), JobStatus::Running);
    }

    #[test]
    fn test_summary_complete_frame_is_surfaced() {
        let mut core = core(JobStatus::Running);
        core.start();
        let actions = core.on_frame(SocketFrame::Jobs {
            job_id: 7,
            status: None,
            job_name: Some("Other job".to_string()),
        });
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::Update(StreamUpdate::SummaryComplete { job_id: 7, .. }))));
    }

    #[test]
    fn test_control_frame_expires_session() {
        let mut core = core(JobStatus::Running);
        core.start();
        let actions = core.on_frame(SocketFrame::Control {
            reason: Some("session expired".to_string()),
        });
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::Update(StreamUpdate::SessionExpired { .. }))));
    }

    // ------------------------------------------------------------------
    // Teardown and context change
    // ------------------------------------------------------------------

    #[test]
    fn test_teardown_clears_state_and_unsubscribes() {
        let mut core = core(JobStatus::Running);
        core.start();
        core.on_frame(live_frame(detail_event(16, 30, 31, "live")));

        let actions = core.teardown();
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::Subscribe(sub) if sub.groups.is_empty()
        )));
        assert_eq!(core.phase(), Phase::TornDown);
        assert!(core.queue().is_empty());
        // Dead views ignore everything.
        assert!(core.on_frame(live_frame(detail_event(17, 31, 32, "x"))).is_empty());
        assert!(core.on_flush_tick().is_empty());
    }

    #[test]
    fn test_change_job_restarts_for_new_context() {
        let mut core = core(JobStatus::Running);
        core.start();
        let spec = core.fetch_spec(FetchKind::Skeleton, None, None);
        core.on_page(&spec, Ok(page(vec![header_event(1, 0, EVENT_PLAY_START, "p-1")], 1, None)));
        assert!(!core.pane().is_empty());
        let old_ctx = core.context();

        let mut next_job = summary(JobStatus::Running);
        next_job.id = 43;
        let actions = core.change_job(next_job);

        assert_eq!(core.context(), old_ctx + 1);
        assert_eq!(core.phase(), Phase::LoadingSkeleton);
        assert!(core.pane().is_empty());
        assert!(core.queue().is_empty());
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::Subscribe(sub) if !sub.groups.is_empty()
        )));
        assert_eq!(first_spec(&actions, FetchKind::Skeleton).ctx, core.context());
    }

    // ------------------------------------------------------------------
    // Fetch failures
    // ------------------------------------------------------------------

    #[test]
    fn test_skeleton_failure_is_non_blocking() {
        let mut core = core(JobStatus::Running);
        core.start();
        let spec = core.fetch_spec(FetchKind::Skeleton, None, None);
        let actions = core.on_page(
            &spec,
            Err(ApiError::Status {
                url: "http://backhaul.test/api/v1/jobs/42/job_events/".to_string(),
                status: 500,
                body: String::new(),
            }),
        );
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::Update(StreamUpdate::Notice(_)))));
        // The stage resolves so the pipeline still reaches Live.
        let spec = core.fetch_spec(FetchKind::Detail, None, None);
        core.on_page(&spec, Ok(page(vec![], 0, None)));
        assert_eq!(core.phase(), Phase::Live);
    }

    #[test]
    fn test_unauthorized_fetch_expires_session() {
        let mut core = core(JobStatus::Running);
        core.start();
        let spec = core.fetch_spec(FetchKind::Detail, None, None);
        let actions = core.on_page(&spec, Err(ApiError::Unauthorized(401)));
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::Update(StreamUpdate::SessionExpired { .. }))));
    }

    // ------------------------------------------------------------------
    // End to end through the core
    // ------------------------------------------------------------------

    #[test]
    fn test_skeleton_backlog_live_assemble_in_line_order() {
        let mut core = core(JobStatus::Running);
        core.start();

        // Two headers: play at raw line 0, task at raw line 20.
        let spec = core.fetch_spec(FetchKind::Skeleton, None, None);
        core.on_page(
            &spec,
            Ok(page(
                vec![
                    header_event(1, 0, EVENT_PLAY_START, "p-1"),
                    header_event(15, 20, EVENT_TASK_START, "t-2"),
                ],
                2,
                None,
            )),
        );
        assert_eq!(core.phase(), Phase::ReplayingBacklog);

        // First live counter arrives mid-replay and fences the backlog.
        let actions = core.on_frame(live_frame(detail_event(16, 22, 23, "live")));
        let fenced = first_spec(&actions, FetchKind::Detail);
        assert_eq!(fenced.counter_lte, Some(16));

        // The fenced replay fills raw lines 2..15, chaining continuation
        // anchors.
        core.on_page(
            &fenced,
            Ok(page(
                vec![
                    detail_event(3, 2, 7, "a"),
                    detail_event(7, 7, 11, "b"),
                    detail_event(11, 11, 15, "c"),
                ],
                3,
                None,
            )),
        );
        assert_eq!(core.phase(), Phase::Live);

        // The parked live event flushes directly below the task header.
        core.on_flush_tick();

        let starts: Vec<u64> = core.pane().blocks().map(|b| b.start_line).collect();
        assert_eq!(starts, vec![1, 3, 8, 12, 21, 23]);

        let expected: Vec<u64> = (1..=15).chain(21..=23).collect();
        assert_eq!(core.pane().line_numbers(), expected);

        assert_eq!(core.pane().follow_anchor(), Some(23));
        assert!(core.pane().follow_engaged());
    }

    #[test]
    fn test_duplicate_delivery_renders_once() {
        let mut core = core(JobStatus::Running);
        core.start();
        let spec = core.fetch_spec(FetchKind::Skeleton, None, None);
        core.on_page(&spec, Ok(page(vec![], 0, None)));
        let spec = core.fetch_spec(FetchKind::Detail, None, None);
        let event = detail_event(9, 4, 5, "once");
        core.on_page(&spec, Ok(page(vec![event.clone()], 1, None)));
        assert_eq!(core.pane().len(), 1);

        // The same counter arrives live, fencing a replay that re-serves
        // it. The pane's start-line guard absorbs the re-application.
        let actions = core.on_frame(live_frame(event.clone()));
        let fenced = first_spec(&actions, FetchKind::Detail);
        let actions = core.on_page(&fenced, Ok(page(vec![event], 1, None)));
        assert!(!actions
            .iter()
            .any(|a| matches!(a, Action::Update(StreamUpdate::Block { .. }))));

        // The buffered socket copy then flushes without a second block.
        let actions = core.on_flush_tick();
        assert!(!actions
            .iter()
            .any(|a| matches!(a, Action::Update(StreamUpdate::Block { .. }))));
        assert_eq!(core.pane().len(), 1);
    }
}
