//! Session Registry (§4.5): creates, refreshes, and tears down a Device
//! Session + Playlist Controller per discovered renderer, and routes
//! inbound GENA `NOTIFY` bodies to the right session's reconciler.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;

use log::{debug, info, trace, warn};
use tokio::sync::Mutex;
use warp::Filter;
use xml::reader::XmlEvent;
use xml::EventReader;

use crate::collaborators::{DidlBuilder, DiscoveredDevice, MediaLibrary, ProfileRepository, SessionManager, StreamInfoBuilder};
use crate::config::Config;
use crate::error::{DlnaError, Result};
use crate::model::{DeviceDescription, ServiceDescription, ServiceKind, MEDIA_RENDERER_DEVICE_TYPE_PREFIX};
use crate::playlist::PlaylistController;
use crate::session::DeviceSession;
use crate::soap::SoapTransport;

const SUPPORTED_COMMANDS: &[&str] = &[
    "VolumeUp",
    "VolumeDown",
    "Mute",
    "Unmute",
    "ToggleMute",
    "SetVolume",
    "Play",
    "Pause",
    "Stop",
    "Seek",
    "NextTrack",
    "PreviousTrack",
    "PlayNow",
    "PlayNext",
    "PlayLast",
    "PlayShuffle",
    "PlayInstantMix",
];

/// Parses a UPnP root device description into a [`DeviceDescription`],
/// keyed by a hand-rolled stateful walk (mirroring `ActionSchema::parse_scpd`)
/// rather than [`crate::soap::flatten_xml`], since a `serviceList` holds
/// repeated `service` elements that a flat map would collapse.
///
/// Returns `None` when the document has no `deviceType` matching
/// [`MEDIA_RENDERER_DEVICE_TYPE_PREFIX`].
pub fn parse_device_description(xml: &str, base_url: &str) -> Option<DeviceDescription> {
    let reader = EventReader::new(Cursor::new(xml.as_bytes()));

    let mut path: Vec<String> = Vec::new();
    let mut text = String::new();
    let mut device_type = String::new();
    let mut uuid = String::new();
    let mut friendly_name = String::new();
    let mut manufacturer = String::new();
    let mut manufacturer_url = String::new();
    let mut model_name = String::new();
    let mut model_number = String::new();
    let mut model_description = String::new();
    let mut model_url = String::new();
    let mut serial_number = String::new();
    let mut services = HashMap::new();
    let mut current_service: Option<ServiceDescription> = None;

    for event in reader.into_iter().flatten() {
        match event {
            XmlEvent::StartElement { name, .. } => {
                let local = name.local_name;
                path.push(local.clone());
                text.clear();
                if local == "service" {
                    current_service = Some(ServiceDescription {
                        service_type: String::new(),
                        scpd_url: String::new(),
                        control_url: String::new(),
                        event_sub_url: String::new(),
                    });
                }
            }
            XmlEvent::Characters(chars) | XmlEvent::CData(chars) => {
                text.push_str(&chars);
            }
            XmlEvent::EndElement { .. } => {
                let local = path.pop().unwrap_or_default();
                let value = text.trim().to_string();
                text.clear();

                let in_service = path.last().map(String::as_str) == Some("service");
                match local.as_str() {
                    "deviceType" if !in_service => device_type = value,
                    "UDN" if !in_service => uuid = value,
                    "friendlyName" if !in_service => friendly_name = value,
                    "manufacturer" if !in_service => manufacturer = value,
                    "manufacturerURL" if !in_service => manufacturer_url = value,
                    "modelName" if !in_service => model_name = value,
                    "modelNumber" if !in_service => model_number = value,
                    "modelDescription" if !in_service => model_description = value,
                    "modelURL" if !in_service => model_url = value,
                    "serialNumber" if !in_service => serial_number = value,
                    "serviceType" => {
                        if let Some(service) = current_service.as_mut() {
                            service.service_type = value;
                        }
                    }
                    "SCPDURL" => {
                        if let Some(service) = current_service.as_mut() {
                            service.scpd_url = value;
                        }
                    }
                    "controlURL" => {
                        if let Some(service) = current_service.as_mut() {
                            service.control_url = value;
                        }
                    }
                    "eventSubURL" => {
                        if let Some(service) = current_service.as_mut() {
                            service.event_sub_url = value;
                        }
                    }
                    "service" => {
                        if let Some(service) = current_service.take() {
                            if let Some(kind) = ServiceKind::from_service_type(&service.service_type) {
                                services.insert(kind, service);
                            }
                        }
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }

    if !device_type.starts_with(MEDIA_RENDERER_DEVICE_TYPE_PREFIX) {
        return None;
    }

    Some(DeviceDescription {
        uuid,
        friendly_name: clean_friendly_name(&friendly_name),
        manufacturer,
        manufacturer_url,
        model_name,
        model_number,
        model_description,
        model_url,
        serial_number,
        base_url: base_url.to_string(),
        services,
    })
}

/// Strips a trailing MAC address or empty bracket pair from a
/// discovery-advertised friendly name (e.g. `"Living Room TV (AA:BB:CC:DD:EE:FF)"`
/// → `"Living Room TV"`).
fn clean_friendly_name(raw: &str) -> String {
    let mut name = raw.trim().to_string();
    if let Some(start) = name.rfind('(') {
        if let Some(end_offset) = name[start..].find(')') {
            let inner = &name[start + 1..start + end_offset];
            if inner.trim().is_empty() || is_mac_address(inner) {
                name.truncate(start);
            }
        }
    }
    let trimmed = name.trim();
    if let Some(stripped) = trimmed.strip_suffix("[]") {
        return stripped.trim().to_string();
    }
    trimmed.to_string()
}

fn is_mac_address(s: &str) -> bool {
    let parts: Vec<&str> = s.trim().split(':').collect();
    parts.len() == 6 && parts.iter().all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
}

struct SessionEntry {
    uuid: String,
    base_url: String,
    friendly_name: String,
    device_session: DeviceSession,
    playlist_controller: PlaylistController,
}

struct Inner {
    sessions: Mutex<HashMap<String, SessionEntry>>,
    profile_repository: Arc<dyn ProfileRepository>,
    session_manager: Arc<dyn SessionManager>,
    media_library: Arc<dyn MediaLibrary>,
    stream_builder: Arc<dyn StreamInfoBuilder>,
    didl_builder: Arc<dyn DidlBuilder>,
    client: reqwest::Client,
    config: Config,
    callback_base: String,
}

/// Owns every live (Device Session, Playlist Controller) pair, keyed by
/// SSDP USN. Thin `Arc` handle, cheaply cloned into the `warp` filter.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<Inner>,
}

impl SessionRegistry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: reqwest::Client,
        profile_repository: Arc<dyn ProfileRepository>,
        session_manager: Arc<dyn SessionManager>,
        media_library: Arc<dyn MediaLibrary>,
        stream_builder: Arc<dyn StreamInfoBuilder>,
        didl_builder: Arc<dyn DidlBuilder>,
        config: Config,
        callback_base: String,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                sessions: Mutex::new(HashMap::new()),
                profile_repository,
                session_manager,
                media_library,
                stream_builder,
                didl_builder,
                client,
                config,
                callback_base,
            }),
        }
    }

    /// Discovery hook: creates a session for a newly seen renderer, or
    /// refreshes its resolved profile if it was already registered under
    /// a different base URL.
    pub async fn on_discovered(&self, discovered: DiscoveredDevice) {
        let body = match self.fetch_text(&discovered.location).await {
            Ok(body) => body,
            Err(e) => {
                warn!("Failed to fetch device description from {}: {}", discovered.location, e);
                return;
            }
        };
        let Some(description) = parse_device_description(&body, &discovered.endpoint) else {
            debug!("Ignoring non-MediaRenderer device at {}", discovered.location);
            return;
        };

        let existing_base_url = {
            let sessions = self.inner.sessions.lock().await;
            sessions.get(&discovered.usn).map(|entry| entry.base_url.clone())
        };

        match existing_base_url {
            Some(base_url) if base_url == description.base_url => {
                trace!("Device {} already registered", description.uuid);
            }
            Some(_) => self.refresh_session(&discovered.usn, description).await,
            None => self.create_session(discovered.usn, description).await,
        }
    }

    async fn create_session(&self, usn: String, description: DeviceDescription) {
        let protocol_info = self.fetch_protocol_info(&description).await.unwrap_or_default();
        let profile = self
            .inner
            .profile_repository
            .get_profile(&description, &protocol_info, true)
            .await
            .unwrap_or_default();

        let transport = SoapTransport::new(
            self.inner.client.clone(),
            self.inner.config.user_agent.clone(),
            self.inner.config.friendly_name.clone(),
        );
        let session_id = description.uuid.clone();
        let friendly_name = description.friendly_name.clone();
        let base_url = description.base_url.clone();

        let device_session = DeviceSession::new(
            description,
            transport,
            self.inner.config.clone(),
            session_id.clone(),
            self.inner.callback_base.clone(),
        );
        device_session.initialize().await;

        let playlist_controller = PlaylistController::new(
            device_session.clone(),
            self.inner.media_library.clone(),
            self.inner.stream_builder.clone(),
            self.inner.didl_builder.clone(),
            self.inner.session_manager.clone(),
            session_id.clone(),
            profile,
            self.inner.config.clone(),
        );

        self.inner
            .session_manager
            .report_capabilities(&session_id, SUPPORTED_COMMANDS.iter().map(|s| s.to_string()).collect())
            .await;

        self.inner.sessions.lock().await.insert(
            usn,
            SessionEntry {
                uuid: session_id,
                base_url,
                friendly_name: friendly_name.clone(),
                device_session,
                playlist_controller,
            },
        );
        info!("Registered device session for {}", friendly_name);
    }

    async fn refresh_session(&self, usn: &str, description: DeviceDescription) {
        let protocol_info = self.fetch_protocol_info(&description).await.unwrap_or_default();
        let profile = self
            .inner
            .profile_repository
            .get_profile(&description, &protocol_info, false)
            .await
            .unwrap_or_default();

        let playlist_controller = {
            let mut sessions = self.inner.sessions.lock().await;
            let Some(entry) = sessions.get_mut(usn) else { return };
            entry.base_url = description.base_url;
            debug!("Refreshed profile for {}", entry.friendly_name);
            entry.playlist_controller.clone()
        };
        playlist_controller.set_profile(profile).await;
    }

    /// Looks up the Playlist Controller for a live session by its
    /// externally-visible session id (the device UUID), for the host
    /// application to route play/playstate/general commands through.
    pub async fn playlist_controller(&self, session_id: &str) -> Option<PlaylistController> {
        let sessions = self.inner.sessions.lock().await;
        sessions
            .values()
            .find(|entry| entry.uuid == session_id)
            .map(|entry| entry.playlist_controller.clone())
    }

    async fn fetch_protocol_info(&self, description: &DeviceDescription) -> Option<String> {
        let service = description.service(ServiceKind::ConnectionManager)?;
        let control_url = format!("{}{}", description.base_url, service.control_url);
        let transport = SoapTransport::new(
            self.inner.client.clone(),
            self.inner.config.user_agent.clone(),
            self.inner.config.friendly_name.clone(),
        );
        let result = transport
            .invoke(
                &service.service_type,
                &control_url,
                "GetProtocolInfo",
                "",
                None,
                self.inner.config.communication_timeout(),
            )
            .await
            .ok()?;
        result.fields.get("Sink").cloned()
    }

    /// Device-left hook: tears down the session matching a `DeviceLeft`
    /// event whose USN or advertised `NT` mentions `MediaRenderer:` and
    /// whose USN contains a registered device's UUID.
    pub async fn on_device_left(&self, discovered: DiscoveredDevice) {
        let nt = discovered.headers.get("NT").cloned().unwrap_or_default();
        if !discovered.usn.contains("MediaRenderer:") && !nt.contains("MediaRenderer:") {
            return;
        }

        let matching_usn = {
            let sessions = self.inner.sessions.lock().await;
            sessions
                .iter()
                .find(|(_, entry)| discovered.usn.contains(&entry.uuid))
                .map(|(usn, _)| usn.clone())
        };
        let Some(usn) = matching_usn else { return };

        let entry = self.inner.sessions.lock().await.remove(&usn);
        if let Some(entry) = entry {
            entry.device_session.unsubscribe_all().await;
            self.inner.profile_repository.delete_profile(&entry.uuid).await;
            self.inner.session_manager.report_session_ended(&entry.uuid).await;
            info!("Device session {} ended", entry.friendly_name);
        }
    }

    /// Hands a `NOTIFY` body to the session matching `session_id`.
    /// Unknown or malformed ids are silently ignored by the caller
    /// returning `200 OK` regardless.
    pub async fn handle_notify(&self, session_id: &str, body: &str) {
        let device_session = {
            let sessions = self.inner.sessions.lock().await;
            sessions.values().find(|entry| entry.uuid == session_id).map(|entry| entry.device_session.clone())
        };
        match device_session {
            Some(device_session) => device_session.reconcile_event(body).await,
            None => debug!("NOTIFY for unknown session {}", session_id),
        }
    }

    async fn fetch_text(&self, url: &str) -> Result<String> {
        self.inner
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| DlnaError::Network(e.to_string()))?
            .text()
            .await
            .map_err(|e| DlnaError::Network(e.to_string()))
    }
}

fn notify_method() -> impl Filter<Extract = (), Error = warp::Rejection> + Copy {
    warp::method()
        .and_then(|method: warp::http::Method| async move {
            if method.as_str() == "NOTIFY" {
                Ok(())
            } else {
                Err(warp::reject::not_found())
            }
        })
        .untuple_one()
}

/// Builds the `NOTIFY /Dlna/Eventing/{id}` ingress route (§AMBIENT — HTTP
/// ingress implementation). Always replies `200 OK`, even when `id` is
/// unknown or the body fails to reconcile, so a misbehaving renderer
/// can't be driven into a retry storm by our own error responses.
pub fn notify_filter(registry: SessionRegistry) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    warp::path!("Dlna" / "Eventing" / String)
        .and(notify_method())
        .and(warp::body::bytes())
        .and(warp::any().map(move || registry.clone()))
        .and_then(|session_id: String, body: bytes::Bytes, registry: SessionRegistry| async move {
            let body_text = String::from_utf8_lossy(&body).into_owned();
            registry.handle_notify(&session_id, &body_text).await;
            Ok::<_, warp::Rejection>(warp::reply::with_status("", warp::http::StatusCode::OK))
        })
}
