//! Channel adapters (Signal, ntfy, iMessage, Omi) and the pieces they share.
//!
//! Every adapter implements [`Channel`]: it keeps its own connection to a backend,
//! publishes normalized [`InboundMessage`]s through a [`crate::bus::Publisher`] and
//! delivers [`OutboundMessage`]s routed to it by the [`ChannelRegistry`].

pub mod chunk;
pub mod dedup;
pub mod imsg;
pub mod lifecycle;
mod message;
pub mod ntfy;
pub mod omi;
pub mod poll;
mod registry;
pub mod rpc;
pub mod signal;
pub mod sse;

pub use chunk::split_message;
pub use dedup::{DedupWindow, SeenKey};
pub use imsg::{ImsgChannel, ImsgSource};
pub use lifecycle::{ConnectionEvent, ConnectionState, Lifecycle, StopWatcher};
pub use message::{InboundMessage, Metadata, OutboundMessage};
pub use ntfy::NtfyChannel;
pub use omi::{OmiChannel, OmiSource};
pub use poll::{PollItem, PollSource, PolledMessage, PollingChannel, Watermark};
pub use registry::{Channel, ChannelRegistry};
pub use signal::SignalChannel;
