//! External contracts this crate consumes but does not implement: SSDP
//! discovery events, the device profile repository, the host session
//! manager, the media library, and the DIDL-Lite/StreamInfo builders.
//! Test doubles for all of them are generated with `mockall::automock`.

use std::collections::HashMap;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::model::{DeviceDescription, MediaType};

/// A device sighted (or lost) by SSDP discovery. Discovery itself is out
/// of scope; this crate only reacts to the events it raises.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub location: String,
    pub endpoint: String,
    pub usn: String,
    pub headers: HashMap<String, String>,
}

/// Device-matching rule resolved by the profile repository: which
/// container/codec combinations this renderer accepts, per media type,
/// and whether DIDL-Lite metadata must be HTML-entity-escaped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceProfile {
    pub id: String,
    pub name: String,
    pub supported_media_types: Vec<MediaType>,
    pub requires_escaped_metadata: bool,
}

impl DeviceProfile {
    pub fn supports(&self, media_type: MediaType) -> bool {
        self.supported_media_types.contains(&media_type)
    }
}

/// Resolves a [`DeviceProfile`] from device metadata and `ProtocolInfo`,
/// matching by regex-or-substring over the device's identifying fields.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProfileRepository: Send + Sync + std::fmt::Debug {
    async fn get_profile(
        &self,
        device: &DeviceDescription,
        protocol_info: &str,
        auto_create: bool,
    ) -> Option<DeviceProfile>;

    async fn delete_profile(&self, id: &str);
}

/// Snapshot of playback progress reported to the host session manager.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlaybackInfo {
    pub item_id: String,
    pub media_source_id: String,
    pub position_ticks: i64,
    pub is_paused: bool,
    pub volume_level: i32,
    pub is_muted: bool,
}

/// The host application's session manager: the far end of every
/// playback-progress report this crate emits.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SessionManager: Send + Sync + std::fmt::Debug {
    async fn log_session_activity(&self, session_id: &str);
    async fn report_capabilities(&self, session_id: &str, commands: Vec<String>);
    async fn on_playback_start(&self, session_id: &str, info: PlaybackInfo);
    async fn on_playback_progress(&self, session_id: &str, info: PlaybackInfo);
    async fn on_playback_stopped(&self, session_id: &str, info: PlaybackInfo);
    async fn report_session_ended(&self, session_id: &str);
}

/// A resolved library entry, the input to [`StreamInfoBuilder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseItem {
    pub id: String,
    pub title: String,
    pub media_type: MediaType,
}

/// Resolves item ids to playable library entries.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MediaLibrary: Send + Sync + std::fmt::Debug {
    async fn resolve(&self, item_id: &str) -> Option<BaseItem>;
}

/// A server-side stream URL plus whether it is a byte-for-byte direct
/// stream (seekable on the renderer) or a transcode (seek re-encodes the
/// URL's start-position parameter instead).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamInfo {
    pub url: Option<String>,
    pub content_features: String,
    pub is_direct_stream: bool,
}

/// Builds the server-side stream URL for an item, given the device
/// profile, requested stream indices, and a starting position.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StreamInfoBuilder: Send + Sync + std::fmt::Debug {
    async fn build(
        &self,
        item: &BaseItem,
        profile: &DeviceProfile,
        media_source_id: Option<String>,
        audio_stream_index: Option<i32>,
        subtitle_stream_index: Option<i32>,
        start_position_ticks: i64,
    ) -> StreamInfo;
}

/// Builds the DIDL-Lite XML embedded in `CurrentURIMetaData`.
#[cfg_attr(test, automock)]
pub trait DidlBuilder: Send + Sync + std::fmt::Debug {
    fn build(&self, item: &BaseItem, stream: &StreamInfo) -> String;
}

/// `PlayCommand` selects how a play request composes with the existing
/// playlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayCommand {
    PlayNow,
    PlayNext,
    PlayLast,
    PlayInstantMix,
    PlayShuffle,
}

/// A "play these items" request from the host session manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayRequest {
    pub item_ids: Vec<String>,
    pub start_index: usize,
    pub start_position_ticks: i64,
    pub media_source_id: Option<String>,
    pub audio_stream_index: Option<i32>,
    pub subtitle_stream_index: Option<i32>,
    pub command: PlayCommand,
}

/// A transport-level control request from the host session manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaystateCommand {
    Stop,
    Pause,
    Unpause,
    PlayPause,
    Seek(i64),
    NextTrack,
    PreviousTrack,
}

/// A volume/mute/stream-index control request from the host session
/// manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneralCommand {
    VolumeUp,
    VolumeDown,
    Mute,
    Unmute,
    ToggleMute,
    SetVolume(i32),
    SetAudioStreamIndex(i32),
    SetSubtitleStreamIndex(i32),
}
