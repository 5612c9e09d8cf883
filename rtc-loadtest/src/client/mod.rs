//! The SFU client contract the load generator drives.
//!
//! Testers only ever talk to an SFU through these traits, so any signaling
//! stack can be plugged in behind [`SfuConnector`]. [`loopback`] provides an
//! in-process implementation.

pub mod loopback;
pub mod token;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use webrtc::rtp::packet::Packet;

use crate::error::Result;
use crate::media::{Sample, VideoLayer};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackSource {
    #[default]
    Unknown,
    Camera,
    Microphone,
    ScreenShare,
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantKind {
    #[default]
    Standard,
    Agent,
    Ingress,
    Egress,
    Sip,
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ConnectionQuality {
    Excellent,
    #[default]
    Good,
    Poor,
    Lost,
}

/// Credentials and identity for joining a room.
#[derive(Debug, Clone, Default)]
pub struct ConnectInfo {
    pub api_key: String,
    pub api_secret: String,
    pub room_name: String,
    pub identity: String,
    pub attributes: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RoomOptions {
    pub auto_subscribe: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantInfo {
    pub sid: String,
    pub identity: String,
    pub kind: ParticipantKind,
    pub attributes: HashMap<String, String>,
}

/// Parameters of a local track to be written to.
#[derive(Debug, Clone)]
pub struct LocalTrackInit {
    pub kind: TrackKind,
    pub mime_type: String,
    pub clock_rate: u32,
    /// Set for each encoding of a simulcast video track.
    pub layer: Option<VideoLayer>,
    /// Encodings of the same simulcast track share a group id.
    pub simulcast_group: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TrackPublishOptions {
    pub name: String,
    pub source: TrackSource,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCodec {
    pub mime_type: String,
    pub clock_rate: u32,
    pub payload_type: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentDispatch {
    pub id: String,
    pub room: String,
    pub agent_name: String,
    pub metadata: String,
}

/// A participant and the tracks it published.
#[derive(Clone)]
pub struct RemoteParticipant {
    pub info: ParticipantInfo,
    pub publications: Vec<Arc<dyn RemoteTrackPublication>>,
}

/// Events delivered by a joined room, in order.
pub enum RoomEvent {
    ParticipantConnected(ParticipantInfo),
    ParticipantDisconnected(ParticipantInfo),
    TrackPublished {
        publication: Arc<dyn RemoteTrackPublication>,
        participant: ParticipantInfo,
    },
    TrackUnpublished {
        track_sid: String,
        participant: ParticipantInfo,
    },
    TrackSubscribed {
        track: Box<dyn RemoteTrack>,
        publication: Arc<dyn RemoteTrackPublication>,
        participant: ParticipantInfo,
    },
    TrackSubscriptionFailed {
        track_sid: String,
        participant: ParticipantInfo,
        error: String,
    },
    ConnectionQualityChanged {
        participant: ParticipantInfo,
        quality: ConnectionQuality,
    },
    DataReceived {
        participant: Option<ParticipantInfo>,
        topic: Option<String>,
        payload: Vec<u8>,
    },
    Reconnecting,
    Reconnected,
    Disconnected {
        reason: String,
    },
}

impl RoomEvent {
    /// Short event name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            RoomEvent::ParticipantConnected(_) => "ParticipantConnected",
            RoomEvent::ParticipantDisconnected(_) => "ParticipantDisconnected",
            RoomEvent::TrackPublished { .. } => "TrackPublished",
            RoomEvent::TrackUnpublished { .. } => "TrackUnpublished",
            RoomEvent::TrackSubscribed { .. } => "TrackSubscribed",
            RoomEvent::TrackSubscriptionFailed { .. } => "TrackSubscriptionFailed",
            RoomEvent::ConnectionQualityChanged { .. } => "ConnectionQualityChanged",
            RoomEvent::DataReceived { .. } => "DataReceived",
            RoomEvent::Reconnecting => "Reconnecting",
            RoomEvent::Reconnected => "Reconnected",
            RoomEvent::Disconnected { .. } => "Disconnected",
        }
    }
}

impl fmt::Debug for RoomEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub type RoomEvents = mpsc::UnboundedReceiver<RoomEvent>;

/// SfuConnector joins rooms on an SFU.
#[async_trait]
pub trait SfuConnector: Send + Sync {
    async fn join(
        &self,
        url: &str,
        info: &ConnectInfo,
        options: RoomOptions,
    ) -> Result<(Arc<dyn Room>, RoomEvents)>;
}

/// Room is a joined session.
#[async_trait]
pub trait Room: Send + Sync {
    fn name(&self) -> &str;

    fn sid(&self) -> &str;

    fn local_participant(&self) -> &ParticipantInfo;

    async fn remote_participants(&self) -> Vec<RemoteParticipant>;

    async fn create_local_track(&self, init: LocalTrackInit) -> Result<Arc<dyn LocalTrack>>;

    /// Publishes a track, returning its sid.
    async fn publish_track(
        &self,
        track: Arc<dyn LocalTrack>,
        options: TrackPublishOptions,
    ) -> Result<String>;

    /// Publishes the encodings of one simulcast video track, returning its sid.
    async fn publish_simulcast_track(
        &self,
        tracks: Vec<Arc<dyn LocalTrack>>,
        options: TrackPublishOptions,
    ) -> Result<String>;

    async fn unpublish_track(&self, sid: &str) -> Result<()>;

    async fn disconnect(&self);
}

#[async_trait]
pub trait LocalTrack: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> TrackKind;

    fn layer(&self) -> Option<VideoLayer>;

    async fn write_sample(&self, sample: &Sample) -> Result<()>;
}

#[async_trait]
pub trait RemoteTrackPublication: Send + Sync {
    fn sid(&self) -> &str;

    fn name(&self) -> &str;

    fn kind(&self) -> TrackKind;

    fn source(&self) -> TrackSource;

    fn mime_type(&self) -> &str;

    fn is_simulcasted(&self) -> bool;

    async fn set_subscribed(&self, subscribed: bool) -> Result<()>;

    /// Requests the layer that best fits the given dimensions.
    async fn set_video_dimensions(&self, width: u32, height: u32) -> Result<()>;

    async fn set_enabled(&self, enabled: bool) -> Result<()>;

    /// Asks the publisher for a key frame.
    async fn write_pli(&self, media_ssrc: u32) -> Result<()>;
}

#[async_trait]
pub trait RemoteTrack: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> TrackKind;

    fn ssrc(&self) -> u32;

    fn codec(&self) -> RemoteCodec;

    /// Returns the next packet. A terminal error ends the stream.
    async fn read_rtp(&mut self) -> Result<Packet>;
}

#[async_trait]
pub trait AgentDispatcher: Send + Sync {
    async fn create_dispatch(
        &self,
        room: &str,
        agent_name: &str,
        metadata: &str,
    ) -> Result<AgentDispatch>;
}
