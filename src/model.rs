//! Core data model shared by every component: device description, action
//! schema shapes, volume quantization, transport state, and the playlist.

use std::collections::HashMap;
use std::fmt;

use derive_more::Display;

/// The three UPnP services a MediaRenderer is expected to expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum ServiceKind {
    #[display("ConnectionManager")]
    ConnectionManager,
    #[display("RenderingControl")]
    RenderingControl,
    #[display("AVTransport")]
    AVTransport,
}

impl ServiceKind {
    /// Returns the service kind matching a UPnP `serviceType` URN, if any.
    pub fn from_service_type(service_type: &str) -> Option<Self> {
        if service_type.contains(":ConnectionManager:") {
            Some(Self::ConnectionManager)
        } else if service_type.contains(":RenderingControl:") {
            Some(Self::RenderingControl)
        } else if service_type.contains(":AVTransport:") {
            Some(Self::AVTransport)
        } else {
            None
        }
    }
}

/// One entry of a device's `serviceList`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescription {
    pub service_type: String,
    pub scpd_url: String,
    pub control_url: String,
    pub event_sub_url: String,
}

/// UPnP `MediaRenderer` device type prefix required of any device we adopt.
pub const MEDIA_RENDERER_DEVICE_TYPE_PREFIX: &str = "urn:schemas-upnp-org:device:MediaRenderer:";

/// Immutable snapshot of a renderer's root device description. Replaced
/// wholesale on refresh; never mutated in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescription {
    pub uuid: String,
    pub friendly_name: String,
    pub manufacturer: String,
    pub manufacturer_url: String,
    pub model_name: String,
    pub model_number: String,
    pub model_description: String,
    pub model_url: String,
    pub serial_number: String,
    pub base_url: String,
    pub services: HashMap<ServiceKind, ServiceDescription>,
}

impl DeviceDescription {
    pub fn service(&self, kind: ServiceKind) -> Option<&ServiceDescription> {
        self.services.get(&kind)
    }
}

/// Device-scale volume range, used to quantize the 0..100 user scale the
/// host application speaks onto whatever scale the renderer actually uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeRange {
    pub min: i32,
    pub max: i32,
}

impl Default for VolumeRange {
    fn default() -> Self {
        Self { min: 0, max: 100 }
    }
}

impl VolumeRange {
    /// `step = round((max-min)/20)`, the device's smallest addressable step.
    pub fn step(&self) -> i32 {
        let span = (self.max - self.min) as f64;
        (span / 20.0).round() as i32
    }

    /// Maps a 0..100 user-scale volume onto the device scale.
    pub fn get_value(&self, user: i32) -> i32 {
        let span = (self.max - self.min) as f64;
        ((span * user as f64) / 100.0 + self.min as f64).round() as i32
    }

    /// Inverts [`Self::get_value`]: maps a device-scale volume back onto
    /// the 0..100 user scale.
    pub fn from_value(&self, device: i32) -> i32 {
        let span = (self.max - self.min) as f64;
        if span == 0.0 {
            return 0;
        }
        let user = ((device - self.min) as f64 * 100.0 / span).round() as i32;
        user.clamp(0, 100)
    }
}

/// Transport state as reported by `GetTransportInfo` or a `LastChange` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum TransportState {
    Stopped,
    Playing,
    Transitioning,
    Paused,
    PausedPlayback,
    PausedRecording,
    Recording,
    NoMediaPresent,
    Error,
}

impl TransportState {
    pub fn is_playing(&self) -> bool {
        matches!(self, Self::Playing)
    }

    pub fn is_paused(&self) -> bool {
        matches!(self, Self::Paused | Self::PausedPlayback)
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped)
    }
}

impl std::str::FromStr for TransportState {
    type Err = crate::error::DlnaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STOPPED" => Ok(Self::Stopped),
            "PLAYING" => Ok(Self::Playing),
            "TRANSITIONING" | "LG_TRANSITIONING" => Ok(Self::Transitioning),
            "PAUSED" => Ok(Self::Paused),
            "PAUSED_PLAYBACK" => Ok(Self::PausedPlayback),
            "PAUSED_RECORDING" => Ok(Self::PausedRecording),
            "RECORDING" => Ok(Self::Recording),
            "NO_MEDIA_PRESENT" => Ok(Self::NoMediaPresent),
            other => Err(crate::error::DlnaError::MalformedXml(format!(
                "unknown transport state {}",
                other
            ))),
        }
    }
}

/// The item the renderer reports as currently loaded. Equality and
/// "emptiness" are both defined on `url`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CurrentMedia {
    pub id: String,
    pub url: String,
}

impl CurrentMedia {
    pub fn is_empty(&self) -> bool {
        self.url.is_empty()
    }
}

/// The media kind a `PlaylistItem` carries, driving both profile filtering
/// and renderer-facing behavior (slideshow timing only applies to photos).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum MediaType {
    Audio,
    Video,
    Photo,
}

/// One resolved, renderer-ready entry of a playlist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaylistItem {
    /// Absent when the stream builder could not resolve a playable URL.
    pub stream_url: Option<String>,
    pub didl_metadata: String,
    pub content_features: String,
    pub media_type: MediaType,
    pub start_position_ticks: i64,
    pub is_direct_stream: bool,
    pub audio_stream_index: Option<i32>,
    pub subtitle_stream_index: Option<i32>,
    pub item_id: String,
    pub media_source_id: String,
}

/// Ordered list of playlist items plus the cursor invariant: `-1` (empty or
/// stopped) or `0 <= cursor < len`.
#[derive(Debug, Clone, Default)]
pub struct Playlist {
    items: Vec<PlaylistItem>,
    cursor: i64,
}

impl Playlist {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            cursor: -1,
        }
    }

    pub fn items(&self) -> &[PlaylistItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn cursor(&self) -> i64 {
        self.cursor
    }

    pub fn current(&self) -> Option<&PlaylistItem> {
        if self.cursor >= 0 {
            self.items.get(self.cursor as usize)
        } else {
            None
        }
    }

    /// Replaces the playlist wholesale (`PlayNow`). Cursor becomes `0` if
    /// the new list is non-empty, `-1` otherwise.
    pub fn replace(&mut self, items: Vec<PlaylistItem>) {
        self.cursor = if items.is_empty() { -1 } else { 0 };
        self.items = items;
    }

    /// Appends items at the end (`PlayLast`).
    pub fn append(&mut self, items: Vec<PlaylistItem>) {
        self.items.extend(items);
    }

    /// Inserts items right after the cursor, or appends if there is no
    /// current item (`PlayNext`).
    pub fn insert_next(&mut self, items: Vec<PlaylistItem>) {
        let at = if self.cursor < 0 {
            self.items.len()
        } else {
            (self.cursor as usize) + 1
        };
        for (offset, item) in items.into_iter().enumerate() {
            self.items.insert(at + offset, item);
        }
    }

    /// Moves the cursor to `index` if in range, returning whether it moved.
    /// Out-of-range clears the playlist per the spec's `SetPlaylistIndex`.
    pub fn set_cursor(&mut self, index: i64) -> bool {
        if index < 0 || index as usize >= self.items.len() {
            self.clear();
            false
        } else {
            self.cursor = index;
            true
        }
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.cursor = -1;
    }

    pub fn has_next(&self) -> bool {
        self.cursor >= 0 && (self.cursor as usize) + 1 < self.items.len()
    }

    pub fn next_item(&self) -> Option<&PlaylistItem> {
        if self.has_next() {
            self.items.get((self.cursor + 1) as usize)
        } else {
            None
        }
    }

    /// Shuffles the items in place, keeping the current cursor item first
    /// when it already exists (the shuffle itself is provided by the
    /// caller; this just swaps the backing storage in).
    pub fn set_items(&mut self, items: Vec<PlaylistItem>) {
        self.items = items;
    }

    pub fn items_mut(&mut self) -> &mut Vec<PlaylistItem> {
        &mut self.items
    }
}

impl fmt::Display for Playlist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Playlist(len={}, cursor={})", self.items.len(), self.cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str) -> PlaylistItem {
        PlaylistItem {
            stream_url: Some(format!("http://host/{}", id)),
            didl_metadata: String::new(),
            content_features: String::new(),
            media_type: MediaType::Video,
            start_position_ticks: 0,
            is_direct_stream: true,
            audio_stream_index: None,
            subtitle_stream_index: None,
            item_id: id.to_string(),
            media_source_id: id.to_string(),
        }
    }

    #[test]
    fn test_volume_range_step_and_get_value() {
        let range = VolumeRange { min: 0, max: 100 };
        assert_eq!(5, range.step());
        assert_eq!(50, range.get_value(50));

        let range = VolumeRange { min: -9216, max: 0 };
        assert_eq!(461, range.step());
    }

    #[test]
    fn test_volume_range_from_value_inverts_get_value() {
        let range = VolumeRange { min: -9216, max: 0 };
        assert_eq!(50, range.from_value(range.get_value(50)));
        assert_eq!(-4608, range.get_value(50));

        let range = VolumeRange::default();
        assert_eq!(50, range.from_value(range.get_value(50)));
    }

    #[test]
    fn test_transport_state_predicates() {
        assert!(TransportState::Playing.is_playing());
        assert!(TransportState::Paused.is_paused());
        assert!(TransportState::PausedPlayback.is_paused());
        assert!(TransportState::Stopped.is_stopped());
        assert!(!TransportState::Transitioning.is_playing());
    }

    #[test]
    fn test_playlist_cursor_invariants() {
        let mut playlist = Playlist::new();
        assert_eq!(-1, playlist.cursor());

        playlist.replace(vec![item("a"), item("b"), item("c")]);
        assert_eq!(0, playlist.cursor());

        assert!(playlist.set_cursor(1));
        assert_eq!(1, playlist.cursor());

        assert!(!playlist.set_cursor(5));
        assert_eq!(-1, playlist.cursor());
        assert!(playlist.is_empty());
    }

    #[test]
    fn test_playlist_insert_next_without_cursor_appends() {
        let mut playlist = Playlist::new();
        playlist.insert_next(vec![item("a")]);
        assert_eq!(1, playlist.len());
    }

    #[test]
    fn test_playlist_has_next() {
        let mut playlist = Playlist::new();
        playlist.replace(vec![item("a"), item("b")]);
        assert!(playlist.has_next());
        assert_eq!("b", playlist.next_item().unwrap().item_id);

        playlist.set_cursor(1);
        assert!(!playlist.has_next());
    }
}
