//! Device Session: per-renderer state machine, command dispatch, the
//! media-change protocol, the polling timer, and event reconciliation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use fx_callback::{Callback, MultiThreadedCallback, Subscription};
use log::{debug, error, trace, warn};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::model::{CurrentMedia, DeviceDescription, ServiceKind, TransportState, VolumeRange};
use crate::queue::{Command, CommandQueue, MediaData};
use crate::schema::{build_argument_xml, ActionSchema, Direction};
use crate::soap::{flatten_xml, SoapTransport};

const CACHE_FRESHNESS_WINDOW: Duration = Duration::from_secs(5);
const DISPATCH_PULSE_DELAY: Duration = Duration::from_millis(100);
const MEDIA_LOAD_SETTLE_DELAY: Duration = Duration::from_millis(50);
const MAX_CONSECUTIVE_POLL_FAILURES: u32 = 3;
/// User-scale (0..100) volume to restore on unmute when no prior volume
/// was ever observed.
const DEFAULT_UNMUTE_VOLUME: i32 = 20;

/// The four observable transitions a `DeviceSession` emits, plus
/// unavailability, which the owning `PlaylistController`/`Registry`
/// subscribe to.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    PlaybackStart(CurrentMedia),
    PlaybackProgress(CurrentMedia),
    PlaybackStopped(CurrentMedia),
    MediaChanged(CurrentMedia, CurrentMedia),
    DeviceUnavailable,
}

/// Strips a `StartTimeTicks=NNN` query parameter so URLs that only differ
/// by requested seek position compare equal (the "seek within same item"
/// case of the media-change protocol).
pub fn strip_start_time_ticks(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(parsed) => {
            let pairs: Vec<(String, String)> = parsed
                .query_pairs()
                .filter(|(k, _)| k != "StartTimeTicks")
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
            let mut stripped = parsed.clone();
            stripped.set_query(None);
            if !pairs.is_empty() {
                let query = pairs
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect::<Vec<_>>()
                    .join("&");
                stripped.set_query(Some(&query));
            }
            stripped.to_string()
        }
        Err(_) => url.to_string(),
    }
}

/// Decides the `UpdateMediaInfo` transition (and the event it emits, if
/// any) for a move from `old` to `new`.
pub fn transition_event(old: &CurrentMedia, new: &CurrentMedia) -> Option<SessionEvent> {
    match (old.is_empty(), new.is_empty()) {
        (true, true) => None,
        (true, false) => Some(SessionEvent::PlaybackStart(new.clone())),
        (false, true) => Some(SessionEvent::PlaybackStopped(old.clone())),
        (false, false) => {
            if old.id == new.id {
                Some(SessionEvent::PlaybackProgress(new.clone()))
            } else {
                Some(SessionEvent::MediaChanged(old.clone(), new.clone()))
            }
        }
    }
}

fn is_fresh(last: Option<Instant>) -> bool {
    last.map(|at| at.elapsed() < CACHE_FRESHNESS_WINDOW).unwrap_or(false)
}

#[derive(Debug, Clone)]
struct SessionState {
    transport_state: TransportState,
    volume_range: VolumeRange,
    current_media: CurrentMedia,
    duration_ticks: i64,
    position_ticks: i64,
    position_offset_ms: i64,
    is_muted: bool,
    volume: i32,
    mute_volume: i32,
    last_volume_refresh: Option<Instant>,
    last_mute_refresh: Option<Instant>,
    last_position_refresh: Option<Instant>,
    av_transport_sid: Option<String>,
    rendering_control_sid: Option<String>,
    consecutive_poll_failures: u32,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            transport_state: TransportState::NoMediaPresent,
            volume_range: VolumeRange::default(),
            current_media: CurrentMedia::default(),
            duration_ticks: 0,
            position_ticks: 0,
            position_offset_ms: 0,
            is_muted: false,
            volume: 0,
            mute_volume: 0,
            last_volume_refresh: None,
            last_mute_refresh: None,
            last_position_refresh: None,
            av_transport_sid: None,
            rendering_control_sid: None,
            consecutive_poll_failures: 0,
        }
    }
}

/// Owns a single renderer's live state: the command queue, the polling
/// timer, and the event reconciler. A thin `Arc` handle whose `Drop`
/// cancels the background tasks.
#[derive(Debug, Clone)]
pub struct DeviceSession {
    inner: Arc<Inner>,
}

impl std::fmt::Display for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DeviceSession({})", self.inner.description.uuid)
    }
}

#[derive(Debug)]
struct Inner {
    description: DeviceDescription,
    session_id: String,
    callback_base: String,
    config: Config,
    transport: SoapTransport,
    schemas: Mutex<HashMap<ServiceKind, ActionSchema>>,
    state: Mutex<SessionState>,
    queue: Mutex<CommandQueue>,
    callbacks: MultiThreadedCallback<SessionEvent>,
    cancellation_token: CancellationToken,
    queue_wake: mpsc::UnboundedSender<()>,
}

impl DeviceSession {
    /// Creates a session and spawns its queue-worker and polling-timer
    /// tasks. Callers still owe it an explicit [`DeviceSession::initialize`]
    /// call once the description's services are known.
    pub fn new(
        description: DeviceDescription,
        transport: SoapTransport,
        config: Config,
        session_id: String,
        callback_base: String,
    ) -> Self {
        let (queue_wake, mut queue_wake_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            description,
            session_id,
            callback_base,
            config,
            transport,
            schemas: Mutex::new(HashMap::new()),
            state: Mutex::new(SessionState::default()),
            queue: Mutex::new(CommandQueue::new()),
            callbacks: MultiThreadedCallback::new(),
            cancellation_token: CancellationToken::new(),
            queue_wake,
        });

        let queue_inner = inner.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = queue_inner.cancellation_token.cancelled() => break,
                    _ = tokio::time::sleep(queue_inner.config.queue_processing_interval()) => {}
                    Some(()) = queue_wake_rx.recv() => {}
                }
                if queue_inner.cancellation_token.is_cancelled() {
                    break;
                }
                let command = { queue_inner.queue.lock().await.pop() };
                if let Some(command) = command {
                    queue_inner.dispatch(command).await;
                }
            }
        });

        let poll_inner = inner.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_inner.config.device_polling_interval());
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = poll_inner.cancellation_token.cancelled() => break,
                    _ = interval.tick() => {}
                }
                poll_inner.poll_once().await;
            }
        });

        Self { inner }
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn uuid(&self) -> &str {
        &self.inner.description.uuid
    }

    pub fn description(&self) -> &DeviceDescription {
        &self.inner.description
    }

    /// Reads RenderingControl's SCPD for an allowed Volume range and
    /// primes the position/volume/mute caches. Subscriptions follow.
    pub async fn initialize(&self) {
        if let Some(service) = self.inner.description.service(ServiceKind::RenderingControl) {
            if let Ok(schema) = self.inner.load_schema(ServiceKind::RenderingControl, &service.scpd_url).await {
                if let Some(range) = schema.volume_range() {
                    self.inner.state.lock().await.volume_range = range;
                }
            }
        }
        let _ = self.inner.get_position_info().await;
        let _ = self.inner.get_volume().await;
        let _ = self.inner.get_mute().await;
        self.inner.subscribe_all().await;
    }

    pub async fn transport_state(&self) -> TransportState {
        self.inner.state.lock().await.transport_state
    }

    pub async fn current_media(&self) -> CurrentMedia {
        self.inner.state.lock().await.current_media.clone()
    }

    pub async fn volume(&self) -> i32 {
        self.inner.state.lock().await.volume
    }

    pub async fn is_muted(&self) -> bool {
        self.inner.state.lock().await.is_muted
    }

    pub async fn position_ticks(&self) -> i64 {
        self.inner.state.lock().await.position_ticks
    }

    pub async fn duration_ticks(&self) -> i64 {
        self.inner.state.lock().await.duration_ticks
    }

    #[cfg(test)]
    pub async fn queue_entries(&self) -> Vec<Command> {
        self.inner.queue.lock().await.entries().to_vec()
    }

    /// Enqueues a command for the queue worker; returns immediately.
    pub async fn enqueue(&self, command: Command) {
        self.inner.queue.lock().await.enqueue(command);
        let _ = self.inner.queue_wake.send(());
    }

    pub async fn queue_len(&self) -> usize {
        self.inner.queue.lock().await.len()
    }

    /// Hands a `LastChange` event body to the reconciler.
    pub async fn reconcile_event(&self, body: &str) {
        self.inner.reconcile_event(body).await;
    }

    /// Best-effort teardown of any active GENA subscriptions, called by
    /// the registry when a device leaves.
    pub async fn unsubscribe_all(&self) {
        let (av_sid, rc_sid) = {
            let state = self.inner.state.lock().await;
            (state.av_transport_sid.clone(), state.rendering_control_sid.clone())
        };
        if let (Some(service), Some(sid)) = (self.inner.description.service(ServiceKind::AVTransport), av_sid) {
            let url = format!("{}{}", self.inner.description.base_url, service.event_sub_url);
            self.inner.transport.unsubscribe(&url, &sid).await;
        }
        if let (Some(service), Some(sid)) = (self.inner.description.service(ServiceKind::RenderingControl), rc_sid) {
            let url = format!("{}{}", self.inner.description.base_url, service.event_sub_url);
            self.inner.transport.unsubscribe(&url, &sid).await;
        }
    }
}

impl Callback<SessionEvent> for DeviceSession {
    fn subscribe(&self) -> Subscription<SessionEvent> {
        self.inner.callbacks.subscribe()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
    }
}

impl Inner {
    async fn load_schema(&self, kind: ServiceKind, scpd_url: &str) -> crate::error::Result<ActionSchema> {
        {
            let schemas = self.schemas.lock().await;
            if let Some(schema) = schemas.get(&kind) {
                return Ok(schema.clone());
            }
        }
        let url = format!("{}{}", self.description.base_url, scpd_url);
        let xml = self.fetch_raw(&url).await?;
        let schema = ActionSchema::parse_scpd(&xml)?;
        self.schemas.lock().await.insert(kind, schema.clone());
        Ok(schema)
    }

    async fn fetch_raw(&self, url: &str) -> crate::error::Result<String> {
        reqwest::Client::new()
            .get(url)
            .send()
            .await
            .map_err(|e| crate::error::DlnaError::Network(e.to_string()))?
            .text()
            .await
            .map_err(|e| crate::error::DlnaError::Network(e.to_string()))
    }

    fn control_url(&self, kind: ServiceKind) -> Option<String> {
        self.description.service(kind).map(|s| format!("{}{}", self.description.base_url, s.control_url))
    }

    fn service_type(&self, kind: ServiceKind) -> Option<String> {
        self.description.service(kind).map(|s| s.service_type.clone())
    }

    async fn invoke(
        &self,
        kind: ServiceKind,
        action: &str,
        arg_values: &[(&str, String)],
        content_features: Option<&str>,
    ) -> crate::error::Result<HashMap<String, String>> {
        let service = self
            .description
            .service(kind)
            .ok_or_else(|| crate::error::DlnaError::DeviceUnsupported(kind.to_string()))?;
        let schema = self.load_schema(kind, &service.scpd_url).await?;
        let action_descriptor = schema
            .action(action)
            .ok_or_else(|| crate::error::DlnaError::DeviceUnsupported(action.to_string()))?;

        let mut xml = String::new();
        for arg in &action_descriptor.arguments {
            if arg.direction != Direction::In {
                continue;
            }
            let value = arg_values
                .iter()
                .find(|(name, _)| *name == arg.name)
                .map(|(_, v)| v.as_str())
                .unwrap_or("");
            xml.push_str(&build_argument_xml(&schema, arg, value, None));
        }

        let control_url = self.control_url(kind).expect("service presence already checked");
        let service_type = self.service_type(kind).expect("service presence already checked");
        let result = self
            .transport
            .invoke(
                &service_type,
                &control_url,
                action,
                &xml,
                content_features,
                self.config.communication_timeout(),
            )
            .await?;
        Ok(result.fields)
    }

    async fn subscribe_all(&self) {
        let callback_url = format!("{}/Dlna/Eventing/{}", self.callback_base, self.session_id);
        if let Some(service) = self.description.service(ServiceKind::AVTransport) {
            let url = format!("{}{}", self.description.base_url, service.event_sub_url);
            if let Ok(sid) = self
                .transport
                .subscribe(&url, &callback_url, &["TransportState", "CurrentTrackMetaData"], None)
                .await
            {
                self.state.lock().await.av_transport_sid = Some(sid);
            }
        }
        if let Some(service) = self.description.service(ServiceKind::RenderingControl) {
            let url = format!("{}{}", self.description.base_url, service.event_sub_url);
            if let Ok(sid) = self
                .transport
                .subscribe(&url, &callback_url, &["Volume", "Mute"], None)
                .await
            {
                self.state.lock().await.rendering_control_sid = Some(sid);
            }
        }
    }

    async fn resubscribe(&self) {
        let callback_url = format!("{}/Dlna/Eventing/{}", self.callback_base, self.session_id);
        let existing_av = self.state.lock().await.av_transport_sid.clone();
        if let (Some(service), Some(sid)) = (self.description.service(ServiceKind::AVTransport), existing_av) {
            let url = format!("{}{}", self.description.base_url, service.event_sub_url);
            let _ = self.transport.subscribe(&url, &callback_url, &[], Some(&sid)).await;
        }
    }

    async fn ensure_subscribed(&self) {
        let has_av = self.state.lock().await.av_transport_sid.is_some();
        if !has_av {
            self.subscribe_all().await;
        }
    }

    // ---- command dispatch (§4.3) ----

    async fn dispatch(&self, command: Command) {
        self.ensure_subscribed().await;
        trace!("Dispatching {:?}", command);
        let result = match command {
            Command::SetVolume(v) => self.dispatch_set_volume(v).await,
            Command::Mute => self.dispatch_mute(true).await,
            Command::Unmute => self.dispatch_mute(false).await,
            Command::ToggleMute => {
                let muted = self.state.lock().await.is_muted;
                self.dispatch_mute(!muted).await
            }
            Command::Play => self.dispatch_transport("Play", TransportState::Playing).await,
            Command::Pause => self.dispatch_transport("Pause", TransportState::Paused).await,
            Command::Stop => self.dispatch_transport("Stop", TransportState::Stopped).await,
            Command::Seek(ticks) => self.dispatch_seek(ticks).await,
            Command::Queue(media) => self.dispatch_queue(media).await,
            Command::QueueNext(media) => self.dispatch_queue_next(media).await,
        };
        if let Err(e) = result {
            warn!("Command dispatch failed: {}", e);
        }
    }

    async fn dispatch_set_volume(&self, volume: i32) -> crate::error::Result<()> {
        let device_volume = {
            let state = self.state.lock().await;
            if state.volume == volume {
                return Ok(());
            }
            state.volume_range.get_value(volume)
        };
        self.invoke(
            ServiceKind::RenderingControl,
            "SetVolume",
            &[("DesiredVolume", device_volume.to_string())],
            None,
        )
        .await?;
        let mut state = self.state.lock().await;
        state.volume = volume;
        if volume > 0 {
            state.mute_volume = volume;
        }
        Ok(())
    }

    async fn dispatch_mute(&self, mute: bool) -> crate::error::Result<()> {
        let arg = if mute { "1" } else { "0" };
        let result = self
            .invoke(ServiceKind::RenderingControl, "SetMute", &[("DesiredMute", arg.to_string())], None)
            .await;

        match result {
            Ok(_) => {
                self.state.lock().await.is_muted = mute;
                Ok(())
            }
            Err(_) => {
                let fallback_volume = if mute {
                    0
                } else {
                    let state = self.state.lock().await;
                    if state.mute_volume > 0 {
                        state.mute_volume
                    } else {
                        DEFAULT_UNMUTE_VOLUME
                    }
                };
                self.dispatch_set_volume(fallback_volume).await?;
                self.state.lock().await.is_muted = mute;
                Ok(())
            }
        }
    }

    async fn dispatch_transport(&self, action: &str, target_state: TransportState) -> crate::error::Result<()> {
        if self.state.lock().await.transport_state == target_state {
            return Ok(());
        }
        self.invoke(ServiceKind::AVTransport, action, &[("Speed", "1".to_string())], None)
            .await?;
        self.state.lock().await.transport_state = target_state;
        self.pulse_poll();
        Ok(())
    }

    async fn dispatch_seek(&self, ticks: i64) -> crate::error::Result<()> {
        let state = self.state.lock().await.transport_state;
        if !(state.is_playing() || state.is_paused()) {
            return Ok(());
        }
        let target = crate::time::ticks_to_hms(ticks);
        self.invoke(
            ServiceKind::AVTransport,
            "Seek",
            &[("Unit", "REL_TIME".to_string()), ("Target", target)],
            None,
        )
        .await?;
        self.state.lock().await.position_ticks = ticks;
        Ok(())
    }

    /// The media-change protocol (§4.3.1): decides between a same-item
    /// seek and a full `SetAVTransportURI` + `Play` sequence.
    async fn dispatch_queue(&self, media: MediaData) -> crate::error::Result<()> {
        let (is_same_item, current_url) = {
            let state = self.state.lock().await;
            (
                media.is_direct_stream
                    && state.transport_state.is_playing()
                    && strip_start_time_ticks(&state.current_media.url) == strip_start_time_ticks(&media.url),
                state.current_media.url.clone(),
            )
        };

        if is_same_item {
            if current_url != media.url {
                self.state.lock().await.transport_state = TransportState::Transitioning;
                let _ = self.invoke(ServiceKind::AVTransport, "Stop", &[], None).await;
                self.state.lock().await.current_media = CurrentMedia::default();
            }
            if media.reset_playback || media.position_ticks > 0 {
                self.dispatch_seek(media.position_ticks).await?;
            }
            return Ok(());
        }

        self.invoke(
            ServiceKind::AVTransport,
            "SetAVTransportURI",
            &[("CurrentURI", media.url.clone()), ("CurrentURIMetaData", media.metadata.clone())],
            Some(&media.content_features),
        )
        .await?;
        tokio::time::sleep(MEDIA_LOAD_SETTLE_DELAY).await;
        self.invoke(ServiceKind::AVTransport, "Play", &[("Speed", "1".to_string())], None)
            .await?;

        let mut state = self.state.lock().await;
        state.current_media = CurrentMedia {
            id: media.url.clone(),
            url: media.url,
        };
        drop(state);
        self.pulse_poll();
        Ok(())
    }

    async fn dispatch_queue_next(&self, media: MediaData) -> crate::error::Result<()> {
        self.invoke(
            ServiceKind::AVTransport,
            "SetNextAVTransportURI",
            &[("NextURI", media.url), ("NextURIMetaData", media.metadata)],
            Some(&media.content_features),
        )
        .await?;
        Ok(())
    }

    fn pulse_poll(&self) {
        let wake = self.queue_wake.clone();
        tokio::spawn(async move {
            tokio::time::sleep(DISPATCH_PULSE_DELAY).await;
            let _ = wake.send(());
        });
    }

    // ---- polling timer (§4.3) ----

    async fn get_transport_info(&self) -> crate::error::Result<TransportState> {
        let fields = self
            .invoke(ServiceKind::AVTransport, "GetTransportInfo", &[], None)
            .await?;
        fields
            .get("CurrentTransportState")
            .ok_or_else(|| crate::error::DlnaError::MalformedXml("missing CurrentTransportState".to_string()))?
            .parse()
    }

    async fn get_position_info(&self) -> crate::error::Result<HashMap<String, String>> {
        if is_fresh(self.state.lock().await.last_position_refresh) {
            return Ok(HashMap::new());
        }
        let started = Instant::now();
        let fields = self
            .invoke(ServiceKind::AVTransport, "GetPositionInfo", &[], None)
            .await?;
        let round_trip = started.elapsed();
        let mut state = self.state.lock().await;
        state.last_position_refresh = Some(Instant::now());
        state.position_offset_ms = (round_trip.as_secs_f64() * 1000.0 / 1.8) as i64;
        Ok(fields)
    }

    async fn get_volume(&self) -> crate::error::Result<()> {
        if is_fresh(self.state.lock().await.last_volume_refresh) {
            return Ok(());
        }
        let fields = self
            .invoke(ServiceKind::RenderingControl, "GetVolume", &[("Channel", "Master".to_string())], None)
            .await?;
        if let Some(device_volume) = fields.get("CurrentVolume").and_then(|v| v.parse::<i32>().ok()) {
            let mut state = self.state.lock().await;
            state.volume = state.volume_range.from_value(device_volume);
            state.last_volume_refresh = Some(Instant::now());
        }
        Ok(())
    }

    async fn get_mute(&self) -> crate::error::Result<()> {
        if is_fresh(self.state.lock().await.last_mute_refresh) {
            return Ok(());
        }
        let fields = self
            .invoke(ServiceKind::RenderingControl, "GetMute", &[("Channel", "Master".to_string())], None)
            .await?;
        if let Some(v) = fields.get("CurrentMute") {
            let mut state = self.state.lock().await;
            state.is_muted = v == "1";
            state.last_mute_refresh = Some(Instant::now());
        }
        Ok(())
    }

    async fn update_media_info(&self, new_current: CurrentMedia) {
        let old = { self.state.lock().await.current_media.clone() };
        if let Some(event) = transition_event(&old, &new_current) {
            self.state.lock().await.current_media = new_current;
            debug!("Device session {} emitting {:?}", self.session_id, event);
            self.callbacks.invoke(event);
        }
    }

    async fn poll_once(&self) {
        match self.get_transport_info().await {
            Err(e) => {
                warn!("Polling GetTransportInfo failed: {}", e);
                let mut state = self.state.lock().await;
                state.consecutive_poll_failures += 1;
                let unavailable = state.consecutive_poll_failures >= MAX_CONSECUTIVE_POLL_FAILURES;
                drop(state);
                if unavailable {
                    error!("Device {} unavailable after repeated poll failures", self.description.uuid);
                    self.callbacks.invoke(SessionEvent::DeviceUnavailable);
                }
            }
            Ok(state) => {
                self.state.lock().await.consecutive_poll_failures = 0;
                self.state.lock().await.transport_state = state;
                if state.is_stopped() {
                    self.update_media_info(CurrentMedia::default()).await;
                } else if let Ok(fields) = self.get_position_info().await {
                    self.apply_position_fields(&fields).await;
                }
            }
        }
    }

    async fn apply_position_fields(&self, fields: &HashMap<String, String>) {
        if let Some(duration) = fields.get("TrackDuration").and_then(|v| crate::time::hms_to_ticks(v).ok()) {
            self.state.lock().await.duration_ticks = duration;
        }
        if let Some(position) = fields.get("RelTime").and_then(|v| crate::time::hms_to_ticks(v).ok()) {
            self.state.lock().await.position_ticks = position;
        }
        let new_media = self.media_from_fields(fields);
        if let Some(media) = new_media {
            self.update_media_info(media).await;
        }
    }

    fn media_from_fields(&self, fields: &HashMap<String, String>) -> Option<CurrentMedia> {
        let didl = fields.get("TrackMetaData")?;
        if !didl.contains("DIDL-Lite") {
            return None;
        }
        let inner = flatten_xml(didl).ok()?;
        let id = inner.get("item.id").cloned().unwrap_or_default();
        let url = inner
            .get("res")
            .or_else(|| fields.get("TrackURI"))
            .cloned()
            .unwrap_or_default();
        if url.is_empty() {
            None
        } else {
            Some(CurrentMedia { id, url })
        }
    }

    // ---- event reconciliation (§4.3) ----

    async fn reconcile_event(&self, body: &str) {
        let fields = match flatten_xml(body) {
            Ok(fields) => fields,
            Err(e) => {
                warn!("Malformed LastChange body: {}", e);
                return;
            }
        };

        if let Some(mute) = fields.get("Mute.val") {
            let mut state = self.state.lock().await;
            state.is_muted = mute == "1";
            state.last_mute_refresh = Some(Instant::now());
        }
        if let Some(device_volume) = fields.get("Volume.val").and_then(|v| v.parse::<i32>().ok()) {
            let mut state = self.state.lock().await;
            state.volume = state.volume_range.from_value(device_volume);
            state.last_volume_refresh = Some(Instant::now());
        }

        let reported_state = fields
            .get("TransportState.val")
            .or_else(|| fields.get("CurrentTransportState.val"))
            .and_then(|v| v.parse::<TransportState>().ok());
        if let Some(reported_state) = reported_state {
            let mut state = self.state.lock().await;
            if reported_state != state.transport_state && state.transport_state != TransportState::Transitioning {
                state.transport_state = reported_state;
                if reported_state.is_stopped() {
                    drop(state);
                    self.update_media_info(CurrentMedia::default()).await;
                }
            }
        }

        if let Some(position) = fields
            .get("RelativeTimePosition.val")
            .and_then(|v| crate::time::hms_to_ticks(v).ok())
        {
            self.state.lock().await.position_ticks = position;
        } else if self.state.lock().await.transport_state.is_playing() {
            let _ = self.get_position_info().await;
        }

        if let Some(duration) = fields
            .get("CurrentTrackDuration.val")
            .and_then(|v| crate::time::hms_to_ticks(v).ok())
        {
            self.state.lock().await.duration_ticks = duration;
        }

        let didl = fields.get("CurrentTrackMetaData.val").filter(|v| v.contains("DIDL-Lite"));
        let new_media = match didl {
            Some(didl) => flatten_xml(didl).ok().and_then(|inner| {
                let url = inner
                    .get("res")
                    .or_else(|| fields.get("TrackURI.val"))
                    .cloned()
                    .unwrap_or_default();
                if url.is_empty() {
                    None
                } else {
                    Some(CurrentMedia {
                        id: inner.get("item.id").cloned().unwrap_or_default(),
                        url,
                    })
                }
            }),
            None => {
                let fields = self.invoke(ServiceKind::AVTransport, "GetMediaInfo", &[], None).await.ok();
                fields.and_then(|fields| {
                    let url = fields.get("CurrentURI").cloned().unwrap_or_default();
                    if url.is_empty() {
                        None
                    } else {
                        Some(CurrentMedia { id: url.clone(), url })
                    }
                })
            }
        };

        if let Some(media) = new_media {
            self.update_media_info(media).await;
        }

        self.resubscribe().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MediaType;
    use crate::model::{DeviceDescription, ServiceDescription};
    use httpmock::Method::{GET, POST};
    use httpmock::MockServer;
    use std::collections::HashMap as StdHashMap;

    #[test]
    fn test_strip_start_time_ticks() {
        let with_ticks = "http://host/video?Static=false&StartTimeTicks=50000000";
        let without_ticks = "http://host/video?Static=false";

        assert_eq!(strip_start_time_ticks(with_ticks), strip_start_time_ticks(without_ticks));
    }

    #[test]
    fn test_transition_event_playback_start() {
        let old = CurrentMedia::default();
        let new = CurrentMedia { id: "1".to_string(), url: "http://host/a".to_string() };

        assert_eq!(Some(SessionEvent::PlaybackStart(new.clone())), transition_event(&old, &new));
    }

    #[test]
    fn test_transition_event_progress_same_id() {
        let old = CurrentMedia { id: "1".to_string(), url: "http://host/a".to_string() };
        let new = CurrentMedia { id: "1".to_string(), url: "http://host/a?pos=5".to_string() };

        assert_eq!(Some(SessionEvent::PlaybackProgress(new.clone())), transition_event(&old, &new));
    }

    #[test]
    fn test_transition_event_media_changed() {
        let old = CurrentMedia { id: "1".to_string(), url: "http://host/a".to_string() };
        let new = CurrentMedia { id: "2".to_string(), url: "http://host/b".to_string() };

        assert_eq!(
            Some(SessionEvent::MediaChanged(old.clone(), new.clone())),
            transition_event(&old, &new)
        );
    }

    #[test]
    fn test_transition_event_playback_stopped() {
        let old = CurrentMedia { id: "1".to_string(), url: "http://host/a".to_string() };
        let new = CurrentMedia::default();

        assert_eq!(Some(SessionEvent::PlaybackStopped(old.clone())), transition_event(&old, &new));
    }

    #[test]
    fn test_transition_event_empty_to_empty_ignored() {
        assert_eq!(None, transition_event(&CurrentMedia::default(), &CurrentMedia::default()));
    }

    const SCPD_AV_TRANSPORT: &str = r#"<?xml version="1.0"?>
        <scpd xmlns="urn:schemas-upnp-org:service-1-0">
            <actionList>
                <action><name>Play</name><argumentList>
                    <argument><name>InstanceID</name><direction>in</direction><relatedStateVariable>A_ARG_TYPE_InstanceID</relatedStateVariable></argument>
                    <argument><name>Speed</name><direction>in</direction><relatedStateVariable>TransportPlaySpeed</relatedStateVariable></argument>
                </argumentList></action>
                <action><name>Pause</name><argumentList>
                    <argument><name>InstanceID</name><direction>in</direction><relatedStateVariable>A_ARG_TYPE_InstanceID</relatedStateVariable></argument>
                </argumentList></action>
                <action><name>Stop</name><argumentList>
                    <argument><name>InstanceID</name><direction>in</direction><relatedStateVariable>A_ARG_TYPE_InstanceID</relatedStateVariable></argument>
                </argumentList></action>
                <action><name>Seek</name><argumentList>
                    <argument><name>InstanceID</name><direction>in</direction><relatedStateVariable>A_ARG_TYPE_InstanceID</relatedStateVariable></argument>
                    <argument><name>Unit</name><direction>in</direction><relatedStateVariable>A_ARG_TYPE_SeekMode</relatedStateVariable></argument>
                    <argument><name>Target</name><direction>in</direction><relatedStateVariable>A_ARG_TYPE_SeekTarget</relatedStateVariable></argument>
                </argumentList></action>
                <action><name>GetTransportInfo</name><argumentList>
                    <argument><name>InstanceID</name><direction>in</direction><relatedStateVariable>A_ARG_TYPE_InstanceID</relatedStateVariable></argument>
                </argumentList></action>
                <action><name>SetAVTransportURI</name><argumentList>
                    <argument><name>InstanceID</name><direction>in</direction><relatedStateVariable>A_ARG_TYPE_InstanceID</relatedStateVariable></argument>
                    <argument><name>CurrentURI</name><direction>in</direction><relatedStateVariable>AVTransportURI</relatedStateVariable></argument>
                    <argument><name>CurrentURIMetaData</name><direction>in</direction><relatedStateVariable>AVTransportURIMetaData</relatedStateVariable></argument>
                </argumentList></action>
            </actionList>
            <serviceStateTable></serviceStateTable>
        </scpd>"#;

    const SCPD_RENDERING_CONTROL: &str = r#"<?xml version="1.0"?>
        <scpd xmlns="urn:schemas-upnp-org:service-1-0">
            <actionList>
                <action><name>GetVolume</name><argumentList>
                    <argument><name>InstanceID</name><direction>in</direction><relatedStateVariable>A_ARG_TYPE_InstanceID</relatedStateVariable></argument>
                    <argument><name>Channel</name><direction>in</direction><relatedStateVariable>A_ARG_TYPE_Channel</relatedStateVariable></argument>
                </argumentList></action>
                <action><name>SetVolume</name><argumentList>
                    <argument><name>InstanceID</name><direction>in</direction><relatedStateVariable>A_ARG_TYPE_InstanceID</relatedStateVariable></argument>
                    <argument><name>Channel</name><direction>in</direction><relatedStateVariable>A_ARG_TYPE_Channel</relatedStateVariable></argument>
                    <argument><name>DesiredVolume</name><direction>in</direction><relatedStateVariable>Volume</relatedStateVariable></argument>
                </argumentList></action>
            </actionList>
            <serviceStateTable>
                <stateVariable sendEvents="yes">
                    <name>Volume</name>
                    <allowedValueRange><minimum>-9216</minimum><maximum>0</maximum></allowedValueRange>
                </stateVariable>
            </serviceStateTable>
        </scpd>"#;

    fn test_description(base_url: String) -> DeviceDescription {
        let mut services = StdHashMap::new();
        services.insert(
            ServiceKind::AVTransport,
            ServiceDescription {
                service_type: "urn:schemas-upnp-org:service:AVTransport:1".to_string(),
                scpd_url: "/AVTransport/scpd.xml".to_string(),
                control_url: "/AVTransport/control".to_string(),
                event_sub_url: "/AVTransport/event".to_string(),
            },
        );
        services.insert(
            ServiceKind::RenderingControl,
            ServiceDescription {
                service_type: "urn:schemas-upnp-org:service:RenderingControl:1".to_string(),
                scpd_url: "/RenderingControl/scpd.xml".to_string(),
                control_url: "/RenderingControl/control".to_string(),
                event_sub_url: "/RenderingControl/event".to_string(),
            },
        );
        DeviceDescription {
            uuid: "uuid:test-device".to_string(),
            friendly_name: "test".to_string(),
            manufacturer: String::new(),
            manufacturer_url: String::new(),
            model_name: String::new(),
            model_number: String::new(),
            model_description: String::new(),
            model_url: String::new(),
            serial_number: String::new(),
            base_url,
            services,
        }
    }

    #[tokio::test]
    async fn test_dispatch_play_suppressed_when_already_playing() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/AVTransport/scpd.xml");
            then.status(200).body(SCPD_AV_TRANSPORT);
        });
        let play_mock = server.mock(|when, then| {
            when.method(POST).path("/AVTransport/control").header(
                "soapaction",
                "\"urn:schemas-upnp-org:service:AVTransport:1#Play\"",
            );
            then.status(200).body(
                r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/"><s:Body><u:PlayResponse xmlns:u="urn:schemas-upnp-org:service:AVTransport:1"/></s:Body></s:Envelope>"#,
            );
        });
        let description = test_description(server.base_url());
        let transport = SoapTransport::new(reqwest::Client::new(), "agent".to_string(), "test".to_string());
        let inner = Inner {
            description,
            session_id: "abc".to_string(),
            callback_base: "http://localhost".to_string(),
            config: Config::default(),
            transport,
            schemas: Mutex::new(HashMap::new()),
            state: Mutex::new(SessionState::default()),
            queue: Mutex::new(CommandQueue::new()),
            callbacks: MultiThreadedCallback::new(),
            cancellation_token: CancellationToken::new(),
            queue_wake: mpsc::unbounded_channel().0,
        };

        inner.dispatch_transport("Play", TransportState::Playing).await.unwrap();
        play_mock.assert_calls(1);

        // Already playing: a second dispatch must be suppressed.
        inner.dispatch_transport("Play", TransportState::Playing).await.unwrap();
        play_mock.assert_calls(1);
    }

    #[tokio::test]
    async fn test_dispatch_seek_formats_rel_time() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/AVTransport/scpd.xml");
            then.status(200).body(SCPD_AV_TRANSPORT);
        });
        let seek_mock = server.mock(|when, then| {
            when.method(POST)
                .path("/AVTransport/control")
                .header("soapaction", "\"urn:schemas-upnp-org:service:AVTransport:1#Seek\"")
                .body_includes("<Target>00:08:20</Target>");
            then.status(200).body(
                r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/"><s:Body><u:SeekResponse xmlns:u="urn:schemas-upnp-org:service:AVTransport:1"/></s:Body></s:Envelope>"#,
            );
        });
        let description = test_description(server.base_url());
        let transport = SoapTransport::new(reqwest::Client::new(), "agent".to_string(), "test".to_string());
        let state = SessionState {
            transport_state: TransportState::Playing,
            ..SessionState::default()
        };
        let inner = Inner {
            description,
            session_id: "abc".to_string(),
            callback_base: "http://localhost".to_string(),
            config: Config::default(),
            transport,
            schemas: Mutex::new(HashMap::new()),
            state: Mutex::new(state),
            queue: Mutex::new(CommandQueue::new()),
            callbacks: MultiThreadedCallback::new(),
            cancellation_token: CancellationToken::new(),
            queue_wake: mpsc::unbounded_channel().0,
        };

        inner.dispatch_seek(5_000_000_000).await.unwrap();

        seek_mock.assert();
    }

    fn inner_with_volume_range(server: &MockServer, range: VolumeRange) -> Inner {
        let description = test_description(server.base_url());
        let transport = SoapTransport::new(reqwest::Client::new(), "agent".to_string(), "test".to_string());
        let state = SessionState {
            volume_range: range,
            ..SessionState::default()
        };
        Inner {
            description,
            session_id: "abc".to_string(),
            callback_base: "http://localhost".to_string(),
            config: Config::default(),
            transport,
            schemas: Mutex::new(HashMap::new()),
            state: Mutex::new(state),
            queue: Mutex::new(CommandQueue::new()),
            callbacks: MultiThreadedCallback::new(),
            cancellation_token: CancellationToken::new(),
            queue_wake: mpsc::unbounded_channel().0,
        }
    }

    #[tokio::test]
    async fn test_dispatch_set_volume_converts_to_device_scale() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/RenderingControl/scpd.xml");
            then.status(200).body(SCPD_RENDERING_CONTROL);
        });
        let volume_mock = server.mock(|when, then| {
            when.method(POST)
                .path("/RenderingControl/control")
                .header("soapaction", "\"urn:schemas-upnp-org:service:RenderingControl:1#SetVolume\"")
                .body_includes("<DesiredVolume>-4608</DesiredVolume>");
            then.status(200).body(
                r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/"><s:Body><u:SetVolumeResponse xmlns:u="urn:schemas-upnp-org:service:RenderingControl:1"/></s:Body></s:Envelope>"#,
            );
        });
        let inner = inner_with_volume_range(&server, VolumeRange { min: -9216, max: 0 });

        inner.dispatch_set_volume(50).await.unwrap();
        volume_mock.assert();
        assert_eq!(50, inner.state.lock().await.volume);
    }

    #[tokio::test]
    async fn test_get_volume_converts_from_device_scale() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/RenderingControl/scpd.xml");
            then.status(200).body(SCPD_RENDERING_CONTROL);
        });
        server.mock(|when, then| {
            when.method(POST)
                .path("/RenderingControl/control")
                .header("soapaction", "\"urn:schemas-upnp-org:service:RenderingControl:1#GetVolume\"");
            then.status(200).body(
                r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/"><s:Body><u:GetVolumeResponse xmlns:u="urn:schemas-upnp-org:service:RenderingControl:1"><CurrentVolume>-4608</CurrentVolume></u:GetVolumeResponse></s:Body></s:Envelope>"#,
            );
        });
        let inner = inner_with_volume_range(&server, VolumeRange { min: -9216, max: 0 });

        inner.get_volume().await.unwrap();
        assert_eq!(50, inner.state.lock().await.volume);
    }

    #[tokio::test]
    async fn test_dispatch_queue_transcoded_same_item_reloads_uri_instead_of_seeking() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/AVTransport/scpd.xml");
            then.status(200).body(SCPD_AV_TRANSPORT);
        });
        let set_uri_mock = server.mock(|when, then| {
            when.method(POST)
                .path("/AVTransport/control")
                .header("soapaction", "\"urn:schemas-upnp-org:service:AVTransport:1#SetAVTransportURI\"");
            then.status(200).body(
                r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/"><s:Body><u:SetAVTransportURIResponse xmlns:u="urn:schemas-upnp-org:service:AVTransport:1"/></s:Body></s:Envelope>"#,
            );
        });
        server.mock(|when, then| {
            when.method(POST)
                .path("/AVTransport/control")
                .header("soapaction", "\"urn:schemas-upnp-org:service:AVTransport:1#Play\"");
            then.status(200).body(
                r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/"><s:Body><u:PlayResponse xmlns:u="urn:schemas-upnp-org:service:AVTransport:1"/></s:Body></s:Envelope>"#,
            );
        });
        let seek_mock = server.mock(|when, then| {
            when.method(POST)
                .path("/AVTransport/control")
                .header("soapaction", "\"urn:schemas-upnp-org:service:AVTransport:1#Seek\"");
            then.status(200).body("");
        });

        let description = test_description(server.base_url());
        let transport = SoapTransport::new(reqwest::Client::new(), "agent".to_string(), "test".to_string());
        let state = SessionState {
            transport_state: TransportState::Playing,
            current_media: CurrentMedia {
                id: "1".to_string(),
                url: "http://host/item?Static=false&StartTimeTicks=0".to_string(),
            },
            ..SessionState::default()
        };
        let inner = Inner {
            description,
            session_id: "abc".to_string(),
            callback_base: "http://localhost".to_string(),
            config: Config::default(),
            transport,
            schemas: Mutex::new(HashMap::new()),
            state: Mutex::new(state),
            queue: Mutex::new(CommandQueue::new()),
            callbacks: MultiThreadedCallback::new(),
            cancellation_token: CancellationToken::new(),
            queue_wake: mpsc::unbounded_channel().0,
        };

        let media = MediaData {
            url: "http://host/item?Static=false&StartTimeTicks=5000000000".to_string(),
            content_features: String::new(),
            metadata: String::new(),
            media_type: MediaType::Video,
            reset_playback: true,
            position_ticks: 0,
            is_direct_stream: false,
        };

        inner.dispatch_queue(media).await.unwrap();

        set_uri_mock.assert();
        seek_mock.assert_calls(0);
        assert_eq!(
            "http://host/item?Static=false&StartTimeTicks=5000000000",
            inner.state.lock().await.current_media.url
        );
    }
}
