//! Job event streaming and incremental output rendering.
//!
//! This crate drives the live-output view of the admin console: it loads a
//! job's structural skeleton and backlog over REST, follows the rest of the
//! run over a reconnecting WebSocket, and turns the merged event stream into
//! ordered display blocks an embedder can mirror one placement at a time.

pub mod api;
pub mod config;
pub mod coordinator;
pub mod decode;
pub mod pane;
pub mod queue;
pub mod transport;

pub use api::{ApiClient, ApiError, EventFilter, EventQuery, FetchedPage};
pub use config::ConsoleSettings;
pub use coordinator::{
    spawn, CoordinatorCore, FirstLive, JobStreamHandle, Phase, StreamCommand, StreamOptions,
    StreamUpdate,
};
pub use decode::DisplayLine;
pub use pane::{OutputPane, PaneBlock, Placement, Truncation};
pub use queue::{EventQueue, HostTotals, NormalizedEvent};
pub use transport::{ConnectionState, SocketHandle, TransportConfig, TransportEvent};
