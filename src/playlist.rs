//! Playlist Controller: owns the playlist/cursor, turns host session
//! requests into Device Session commands, and drives slideshow timing and
//! playback-completed auto-advance.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use rand::Rng;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::collaborators::{
    BaseItem, DeviceProfile, DidlBuilder, GeneralCommand, MediaLibrary, PlayCommand, PlayRequest,
    PlaybackInfo, PlaystateCommand, SessionManager, StreamInfoBuilder,
};
use crate::config::Config;
use crate::model::{CurrentMedia, MediaType, Playlist, PlaylistItem};
use crate::queue::{Command, MediaData};
use crate::session::{DeviceSession, SessionEvent};

const SEEK_AFTER_TRANSPORT_CHANGE_POLL: Duration = Duration::from_millis(500);
const SEEK_AFTER_TRANSPORT_CHANGE_TIMEOUT: Duration = Duration::from_secs(15);
const PHOTO_RESUME_POSITION_TICKS: i64 = 1;

/// Unbiased index in `0..bound`, drawn by rejecting samples in the tail of
/// `u32`'s range so no value of `bound` is favoured (the same rejection
/// principle the spec describes at the byte level, generalized to words so
/// playlists past 256 entries still shuffle without bias).
fn unbiased_index(rng: &mut impl Rng, bound: usize) -> usize {
    if bound <= 1 {
        return 0;
    }
    let bound = bound as u32;
    let threshold = u32::MAX - (u32::MAX % bound);
    loop {
        let candidate = rng.next_u32();
        if candidate < threshold {
            return (candidate % bound) as usize;
        }
    }
}

/// Fisher-Yates shuffle using a cryptographically secure RNG.
pub fn fisher_yates_shuffle<T>(items: &mut [T], rng: &mut impl Rng) {
    for i in (1..items.len()).rev() {
        let j = unbiased_index(rng, i + 1);
        items.swap(i, j);
    }
}

/// `true` when a stop at `position_ticks` of `duration_ticks` counts as
/// having played the item to completion (either it never started, or it
/// stopped within `max_resume_pct` of the end).
pub fn played_to_completion(position_ticks: i64, duration_ticks: i64, max_resume_pct: f64) -> bool {
    if position_ticks <= 0 {
        return true;
    }
    if duration_ticks <= 0 {
        return false;
    }
    let remaining_pct = (1.0 - position_ticks as f64 / duration_ticks as f64).abs() * 100.0;
    remaining_pct <= max_resume_pct
}

#[derive(Debug, Default)]
struct SlideshowState {
    active: bool,
    handle: Option<tokio::task::JoinHandle<()>>,
}

/// Owns one renderer's playlist and cursor. A thin `Arc` handle sharing
/// the same lifecycle shape as [`DeviceSession`].
#[derive(Debug, Clone)]
pub struct PlaylistController {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    device: DeviceSession,
    library: Arc<dyn MediaLibrary>,
    stream_builder: Arc<dyn StreamInfoBuilder>,
    didl_builder: Arc<dyn DidlBuilder>,
    session_manager: Arc<dyn SessionManager>,
    session_id: String,
    profile: Mutex<DeviceProfile>,
    config: Config,
    playlist: Mutex<Playlist>,
    slideshow: Mutex<SlideshowState>,
    cancellation_token: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
    }
}

impl PlaylistController {
    /// Replaces the resolved device profile, used by the registry's
    /// refresh path when a rediscovered device's base URL changes.
    pub async fn set_profile(&self, profile: DeviceProfile) {
        *self.inner.profile.lock().await = profile;
    }

    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device: DeviceSession,
        library: Arc<dyn MediaLibrary>,
        stream_builder: Arc<dyn StreamInfoBuilder>,
        didl_builder: Arc<dyn DidlBuilder>,
        session_manager: Arc<dyn SessionManager>,
        session_id: String,
        profile: DeviceProfile,
        config: Config,
    ) -> Self {
        let inner = Arc::new(Inner {
            device,
            library,
            stream_builder,
            didl_builder,
            session_manager,
            session_id,
            profile: Mutex::new(profile),
            config,
            playlist: Mutex::new(Playlist::new()),
            slideshow: Mutex::new(SlideshowState::default()),
            cancellation_token: CancellationToken::new(),
        });

        let controller = Self { inner };
        controller.spawn_event_listener();
        controller
    }

    fn spawn_event_listener(&self) {
        use fx_callback::Callback;

        let controller = self.clone();
        let mut events = controller.inner.device.subscribe();
        let token = controller.inner.cancellation_token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    event = events.recv() => {
                        match event {
                            Ok(event) => controller.on_session_event((*event).clone()).await,
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        }
                    }
                }
            }
        });
    }

    async fn on_session_event(&self, event: SessionEvent) {
        trace!("Playlist controller received {:?}", event);
        match event {
            SessionEvent::PlaybackStart(media) => self.report_progress(&media, false).await,
            SessionEvent::PlaybackProgress(media) => self.report_progress(&media, false).await,
            SessionEvent::MediaChanged(_, new) => self.report_progress(&new, false).await,
            SessionEvent::PlaybackStopped(old) => self.on_playback_stopped(old).await,
            SessionEvent::DeviceUnavailable => {
                self.inner.playlist.lock().await.clear();
                self.disarm_slideshow().await;
                self.inner.session_manager.report_session_ended(&self.inner.session_id).await;
            }
        }
    }

    async fn report_progress(&self, media: &CurrentMedia, is_stop: bool) {
        let _ = media;
        let playlist = self.inner.playlist.lock().await;
        let Some(item) = playlist.current() else { return };
        let is_photo = matches!(item.media_type, MediaType::Photo);
        let position_ticks = if is_photo {
            PHOTO_RESUME_POSITION_TICKS
        } else {
            self.inner.device.position_ticks().await
        };
        let info = PlaybackInfo {
            item_id: item.item_id.clone(),
            media_source_id: item.media_source_id.clone(),
            position_ticks,
            is_paused: self.inner.device.transport_state().await.is_paused(),
            volume_level: self.inner.device.volume().await,
            is_muted: self.inner.device.is_muted().await,
        };
        drop(playlist);
        if is_stop {
            self.inner.session_manager.on_playback_stopped(&self.inner.session_id, info).await;
        } else {
            self.inner.session_manager.on_playback_progress(&self.inner.session_id, info).await;
        }
    }

    /// Playback-completed handling: auto-advances when the stop looks like
    /// natural end-of-item, otherwise clears the playlist.
    async fn on_playback_stopped(&self, old: CurrentMedia) {
        self.report_progress(&old, true).await;

        let position = self.inner.device.position_ticks().await;
        let duration = self.inner.device.duration_ticks().await;

        if played_to_completion(position, duration, self.inner.config.max_resume_pct) {
            let next = self.inner.playlist.lock().await.cursor() + 1;
            self.set_playlist_index(next).await;
        } else {
            debug!("Playback stopped short of completion, clearing playlist");
            self.inner.playlist.lock().await.clear();
            self.disarm_slideshow().await;
        }
    }

    /// §4.4.1: resolves a library item into a renderer-ready playlist
    /// entry. Returns `None` (drops the item) when the stream builder
    /// cannot resolve a playable URL.
    async fn create_playlist_item(
        &self,
        item: &BaseItem,
        media_source_id: Option<String>,
        audio_stream_index: Option<i32>,
        subtitle_stream_index: Option<i32>,
        start_position_ticks: i64,
    ) -> Option<PlaylistItem> {
        let profile = self.inner.profile.lock().await.clone();
        let stream = self
            .inner
            .stream_builder
            .build(
                item,
                &profile,
                media_source_id.clone(),
                audio_stream_index,
                subtitle_stream_index,
                start_position_ticks,
            )
            .await;

        let mut stream_url = stream.url.clone()?;
        if !matches!(item.media_type, MediaType::Photo) {
            stream_url.push_str(if stream_url.contains('?') { "&dlna=true" } else { "?dlna=true" });
        }
        let didl_metadata = self.inner.didl_builder.build(item, &stream);

        Some(PlaylistItem {
            stream_url: Some(stream_url),
            didl_metadata,
            content_features: stream.content_features,
            media_type: item.media_type,
            start_position_ticks,
            is_direct_stream: stream.is_direct_stream,
            audio_stream_index,
            subtitle_stream_index,
            item_id: item.id.clone(),
            media_source_id: media_source_id.unwrap_or_default(),
        })
    }

    /// Handles a `{items[], startIndex, ...}` play request from the host
    /// session manager.
    pub async fn handle_play_request(&self, request: PlayRequest) {
        let profile = self.inner.profile.lock().await.clone();
        let mut items = Vec::new();
        for (offset, item_id) in request.item_ids.iter().enumerate() {
            let Some(base_item) = self.inner.library.resolve(item_id).await else {
                continue;
            };
            if !profile.supports(base_item.media_type) {
                continue;
            }
            let start_ticks = if offset == request.start_index {
                request.start_position_ticks
            } else {
                0
            };
            if let Some(item) = self
                .create_playlist_item(
                    &base_item,
                    request.media_source_id.clone(),
                    request.audio_stream_index,
                    request.subtitle_stream_index,
                    start_ticks,
                )
                .await
            {
                items.push(item);
            }
        }

        match request.command {
            PlayCommand::PlayNow => {
                self.inner.playlist.lock().await.replace(items);
                self.set_playlist_index(0).await;
            }
            PlayCommand::PlayLast => {
                let already_playing = !self.inner.playlist.lock().await.is_empty();
                self.inner.playlist.lock().await.append(items);
                if !already_playing {
                    self.set_playlist_index(0).await;
                }
            }
            PlayCommand::PlayNext => {
                let already_playing = !self.inner.playlist.lock().await.is_empty();
                self.inner.playlist.lock().await.insert_next(items);
                if !already_playing {
                    self.set_playlist_index(0).await;
                }
            }
            PlayCommand::PlayShuffle | PlayCommand::PlayInstantMix => {
                let mut shuffled = items;
                let mut rng = rand::rng();
                fisher_yates_shuffle(&mut shuffled, &mut rng);
                self.inner.playlist.lock().await.replace(shuffled);
                self.set_playlist_index(0).await;
            }
        }
    }

    /// §4.4: moves the cursor and queues the item (plus its successor for
    /// gapless playback). Out-of-range clears the playlist and stops.
    pub async fn set_playlist_index(&self, index: i64) {
        let item = self.apply_playlist_index(index).await;
        match item {
            Some(item) if matches!(item.media_type, MediaType::Photo) => self.arm_slideshow().await,
            _ => self.disarm_slideshow().await,
        }
    }

    /// The cursor-move-and-enqueue core of [`Self::set_playlist_index`],
    /// without the slideshow side effect — kept separate so the slideshow
    /// timer loop can advance the cursor without recursing back through
    /// `arm_slideshow`.
    async fn apply_playlist_index(&self, index: i64) -> Option<PlaylistItem> {
        let moved = self.inner.playlist.lock().await.set_cursor(index);
        if !moved {
            self.inner.device.enqueue(Command::Stop).await;
            return None;
        }

        let (item, next_item) = {
            let playlist = self.inner.playlist.lock().await;
            (playlist.current().cloned(), playlist.next_item().cloned())
        };
        let item = item?;
        let Some(stream_url) = item.stream_url.clone() else {
            warn!("Playlist item {} has no resolved stream URL", item.item_id);
            return None;
        };

        self.inner
            .device
            .enqueue(Command::Queue(MediaData {
                url: stream_url,
                content_features: item.content_features.clone(),
                metadata: item.didl_metadata.clone(),
                media_type: item.media_type,
                reset_playback: index > 0,
                position_ticks: if item.is_direct_stream { item.start_position_ticks } else { 0 },
                is_direct_stream: item.is_direct_stream,
            }))
            .await;

        if let Some(next) = next_item {
            if let Some(next_url) = next.stream_url.clone() {
                self.inner
                    .device
                    .enqueue(Command::QueueNext(MediaData {
                        url: next_url,
                        content_features: next.content_features.clone(),
                        metadata: next.didl_metadata.clone(),
                        media_type: next.media_type,
                        reset_playback: false,
                        position_ticks: 0,
                        is_direct_stream: next.is_direct_stream,
                    }))
                    .await;
            }
        }

        Some(item)
    }

    /// Handles a transport-level control request, intercepting for
    /// slideshow mode first.
    pub async fn handle_playstate_request(&self, command: PlaystateCommand) {
        if self.inner.slideshow.lock().await.active {
            return self.handle_slideshow_playstate(command).await;
        }

        match command {
            PlaystateCommand::Stop => self.inner.device.enqueue(Command::Stop).await,
            PlaystateCommand::Pause => self.inner.device.enqueue(Command::Pause).await,
            PlaystateCommand::Unpause => self.inner.device.enqueue(Command::Play).await,
            PlaystateCommand::PlayPause => {
                if self.inner.device.transport_state().await.is_playing() {
                    self.inner.device.enqueue(Command::Pause).await;
                } else {
                    self.inner.device.enqueue(Command::Play).await;
                }
            }
            PlaystateCommand::Seek(ticks) => self.seek(ticks).await,
            PlaystateCommand::NextTrack => {
                let next = self.inner.playlist.lock().await.cursor() + 1;
                self.set_playlist_index(next).await;
            }
            PlaystateCommand::PreviousTrack => {
                let prev = self.inner.playlist.lock().await.cursor() - 1;
                self.set_playlist_index(prev).await;
            }
        }
    }

    async fn handle_slideshow_playstate(&self, command: PlaystateCommand) {
        match command {
            PlaystateCommand::Stop => {
                self.inner.playlist.lock().await.clear();
                self.disarm_slideshow().await;
            }
            PlaystateCommand::Pause => self.disarm_slideshow().await,
            PlaystateCommand::Unpause | PlaystateCommand::PlayPause => self.arm_slideshow().await,
            PlaystateCommand::NextTrack => {
                let next = self.inner.playlist.lock().await.cursor() + 1;
                self.set_playlist_index(next).await;
            }
            PlaystateCommand::PreviousTrack => {
                let prev = self.inner.playlist.lock().await.cursor() - 1;
                self.set_playlist_index(prev).await;
            }
            PlaystateCommand::Seek(_) => {}
        }
    }

    async fn seek(&self, ticks: i64) {
        let current = { self.inner.playlist.lock().await.current().cloned() };
        let Some(item) = current else { return };

        if item.is_direct_stream {
            self.inner.device.enqueue(Command::Seek(ticks)).await;
            return;
        }

        self.rebuild_current_item(item.audio_stream_index, item.subtitle_stream_index, ticks)
            .await;
    }

    pub async fn handle_general_command(&self, command: GeneralCommand) {
        match command {
            GeneralCommand::VolumeUp => self.step_volume(1).await,
            GeneralCommand::VolumeDown => self.step_volume(-1).await,
            GeneralCommand::Mute => self.inner.device.enqueue(Command::Mute).await,
            GeneralCommand::Unmute => self.inner.device.enqueue(Command::Unmute).await,
            GeneralCommand::ToggleMute => self.inner.device.enqueue(Command::ToggleMute).await,
            GeneralCommand::SetVolume(v) => self.inner.device.enqueue(Command::SetVolume(v.clamp(0, 100))).await,
            GeneralCommand::SetAudioStreamIndex(idx) => self.change_stream_index(Some(idx), None).await,
            GeneralCommand::SetSubtitleStreamIndex(idx) => self.change_stream_index(None, Some(idx)).await,
        }
    }

    async fn step_volume(&self, delta: i32) {
        let current = self.inner.device.volume().await;
        self.inner
            .device
            .enqueue(Command::SetVolume((current + delta).clamp(0, 100)))
            .await;
    }

    async fn change_stream_index(&self, audio: Option<i32>, subtitle: Option<i32>) {
        let position = self.inner.device.position_ticks().await;
        let (current_audio, current_subtitle) = {
            let playlist = self.inner.playlist.lock().await;
            match playlist.current() {
                Some(item) => (item.audio_stream_index, item.subtitle_stream_index),
                None => return,
            }
        };

        let Some(new_item) = self
            .rebuild_current_item(audio.or(current_audio), subtitle.or(current_subtitle), position)
            .await
        else {
            return;
        };

        if new_item.is_direct_stream {
            self.spawn_seek_after_transport_change(position);
        }
    }

    /// Resolves the current item's library entry again, builds a fresh
    /// [`PlaylistItem`] at `start_position_ticks` with the given stream
    /// indices, swaps it into the playlist in place, and replaces the
    /// renderer's AVTransport URI.
    async fn rebuild_current_item(
        &self,
        audio_stream_index: Option<i32>,
        subtitle_stream_index: Option<i32>,
        start_position_ticks: i64,
    ) -> Option<PlaylistItem> {
        let (item_id, media_source_id) = {
            let playlist = self.inner.playlist.lock().await;
            let current = playlist.current()?;
            (current.item_id.clone(), current.media_source_id.clone())
        };
        let base_item = self.inner.library.resolve(&item_id).await?;
        let media_source_id = (!media_source_id.is_empty()).then_some(media_source_id);

        let new_item = self
            .create_playlist_item(&base_item, media_source_id, audio_stream_index, subtitle_stream_index, start_position_ticks)
            .await?;

        {
            let mut playlist = self.inner.playlist.lock().await;
            let cursor = playlist.cursor();
            if cursor >= 0 {
                if let Some(slot) = playlist.items_mut().get_mut(cursor as usize) {
                    *slot = new_item.clone();
                }
            }
        }

        let stream_url = new_item.stream_url.clone()?;
        self.inner
            .device
            .enqueue(Command::Queue(MediaData {
                url: stream_url,
                content_features: new_item.content_features.clone(),
                metadata: new_item.didl_metadata.clone(),
                media_type: new_item.media_type,
                reset_playback: true,
                position_ticks: 0,
                is_direct_stream: new_item.is_direct_stream,
            }))
            .await;

        Some(new_item)
    }

    /// Polls `IsPlaying` every 500 ms up to 15 s after a transport change,
    /// then issues the seek the new URI couldn't encode.
    fn spawn_seek_after_transport_change(&self, ticks: i64) {
        let device = self.inner.device.clone();
        tokio::spawn(async move {
            let deadline = Instant::now() + SEEK_AFTER_TRANSPORT_CHANGE_TIMEOUT;
            while Instant::now() < deadline {
                if device.transport_state().await.is_playing() {
                    device.enqueue(Command::Seek(ticks)).await;
                    return;
                }
                tokio::time::sleep(SEEK_AFTER_TRANSPORT_CHANGE_POLL).await;
            }
        });
    }

    /// Spawns the one-shot transition timer. The loop advances through
    /// consecutive photos itself via `apply_playlist_index` rather than
    /// calling back through `set_playlist_index`/`arm_slideshow`, so the
    /// timer task's future type does not recurse into itself.
    async fn arm_slideshow(&self) {
        self.disarm_slideshow().await;

        let controller = self.clone();
        let duration = self.inner.config.photo_transitional_timeout();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(duration).await;
                let next = controller.inner.playlist.lock().await.cursor() + 1;
                match controller.apply_playlist_index(next).await {
                    Some(item) if matches!(item.media_type, MediaType::Photo) => continue,
                    _ => break,
                }
            }
            controller.inner.slideshow.lock().await.active = false;
        });

        let mut slideshow = self.inner.slideshow.lock().await;
        slideshow.active = true;
        slideshow.handle = Some(handle);
    }

    async fn disarm_slideshow(&self) {
        let mut slideshow = self.inner.slideshow.lock().await;
        slideshow.active = false;
        if let Some(handle) = slideshow.handle.take() {
            handle.abort();
        }
    }
}
