//! Per-device session engine for controlling DLNA/UPnP MediaRenderer
//! playback: SOAP transport, SCPD-derived action schemas, a deduplicating
//! command queue, device sessions, playlist control, and the session
//! registry that ties discovery events to live sessions.

pub mod collaborators;
pub mod config;
pub mod error;
pub mod model;
pub mod playlist;
pub mod queue;
pub mod registry;
pub mod schema;
pub mod session;
pub mod soap;
#[cfg(test)]
#[macro_use]
pub mod testing;
pub mod time;

pub use config::Config;
pub use error::{DlnaError, Result};
pub use model::{CurrentMedia, DeviceDescription, Playlist, PlaylistItem, TransportState};
pub use playlist::PlaylistController;
pub use registry::{notify_filter, SessionRegistry};
pub use session::{DeviceSession, SessionEvent};
