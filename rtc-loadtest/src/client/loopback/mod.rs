//! In-process SFU.
//!
//! Every published track is fanned out to its subscribers over broadcast
//! channels. Forwarding applies a configurable delay that grows with the
//! number of active subscriptions, which lets the load generator be driven
//! end to end without a network.


mod room;
mod track;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

pub use room::LoopbackRoom;
use track::{LoopbackLocalTrack, LoopbackPublication, PublishedTrack};

use super::token::{AccessToken, TokenVerifier, VideoGrant};
use super::{
    AgentDispatch, AgentDispatcher, ConnectInfo, LocalTrack, LocalTrackInit, ParticipantInfo,
    ParticipantKind, RemoteTrackPublication, Room, RoomEvent, RoomEvents, RoomOptions,
    SfuConnector, TrackKind, TrackPublishOptions, TrackSource,
};
use crate::error::{Error, Result};
use crate::media::looper::{CountingSource, SampleProvider};
use crate::media::{MIME_TYPE_OPUS, OPUS_CLOCK_RATE, OPUS_FRAME_DURATION};

/// Bitrate of the speech a dispatched agent publishes.
pub const AGENT_VOICE_BITRATE: u32 = 24_000;

#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    pub api_key: String,
    pub api_secret: String,
    /// Delay applied to every forwarded packet.
    pub base_delay: Duration,
    /// Additional delay per active subscription across the SFU.
    pub per_subscription_delay: Duration,
    /// Number of join attempts rejected before joins succeed.
    pub failing_joins: u32,
    /// Time between a dispatch and the agent joining its room.
    pub agent_join_delay: Duration,
    /// Packets buffered per track before slow subscribers lose packets.
    pub channel_capacity: usize,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        LoopbackConfig {
            api_key: "devkey".to_owned(),
            api_secret: "secret".to_owned(),
            base_delay: Duration::ZERO,
            per_subscription_delay: Duration::ZERO,
            failing_joins: 0,
            agent_join_delay: Duration::from_millis(100),
            channel_capacity: 1024,
        }
    }
}

/// State without back references into rooms, shared by tracks.
pub(crate) struct Shared {
    pub(crate) config: LoopbackConfig,
    next_id: AtomicU64,
    pub(crate) subscriptions: AtomicU64,
    pub(crate) plis: AtomicU64,
}

impl Shared {
    pub(crate) fn next_sid(&self, prefix: &str) -> String {
        format!("{prefix}_{:06}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn forwarding_delay(&self) -> Duration {
        let subscriptions = self.subscriptions.load(Ordering::Relaxed).min(u32::MAX as u64) as u32;
        self.config.base_delay + self.config.per_subscription_delay * subscriptions
    }
}

pub(crate) struct RoomState {
    pub(crate) name: String,
    pub(crate) sid: String,
    participants: Mutex<BTreeMap<String, Arc<ParticipantState>>>,
}

impl RoomState {
    /// Everyone in the room but `me`.
    pub(crate) async fn others(&self, me: &Arc<ParticipantState>) -> Vec<Arc<ParticipantState>> {
        self.participants
            .lock()
            .await
            .values()
            .filter(|p| !Arc::ptr_eq(p, me))
            .cloned()
            .collect()
    }
}

pub(crate) struct ParticipantState {
    pub(crate) info: ParticipantInfo,
    events: mpsc::UnboundedSender<RoomEvent>,
    pub(crate) auto_subscribe: bool,
    pub(crate) publications: Mutex<Vec<Arc<PublishedTrack>>>,
    /// this participant's views of other participants' tracks, by track sid
    pub(crate) views: Mutex<HashMap<String, Arc<LoopbackPublication>>>,
    pub(crate) local_tracks: Mutex<HashMap<String, Arc<LoopbackLocalTrack>>>,
    pub(crate) cancel: CancellationToken,
    left: AtomicBool,
}

impl ParticipantState {
    pub(crate) fn send(&self, event: RoomEvent) {
        // the participant may have stopped listening
        let _ = self.events.send(event);
    }

    pub(crate) async fn view_of(
        self: &Arc<Self>,
        track: &Arc<PublishedTrack>,
        shared: &Arc<Shared>,
    ) -> Arc<LoopbackPublication> {
        self.views
            .lock()
            .await
            .entry(track.sid.clone())
            .or_insert_with(|| {
                LoopbackPublication::new(Arc::clone(track), Arc::downgrade(self), Arc::clone(shared))
            })
            .clone()
    }
}

pub(crate) struct SfuState {
    pub(crate) shared: Arc<Shared>,
    verifier: TokenVerifier,
    rooms: Mutex<HashMap<String, Arc<RoomState>>>,
    join_attempts: AtomicU32,
    shutdown: CancellationToken,
}

/// LoopbackSfu is an in-process SFU implementing [`SfuConnector`] and
/// [`AgentDispatcher`].
#[derive(Clone)]
pub struct LoopbackSfu {
    pub(crate) state: Arc<SfuState>,
}

impl Default for LoopbackSfu {
    fn default() -> Self {
        LoopbackSfu::new(LoopbackConfig::default())
    }
}

impl LoopbackSfu {
    pub fn new(config: LoopbackConfig) -> Self {
        let verifier = TokenVerifier::new(config.api_key.clone(), config.api_secret.clone());
        LoopbackSfu {
            state: Arc::new(SfuState {
                shared: Arc::new(Shared {
                    config,
                    next_id: AtomicU64::new(1),
                    subscriptions: AtomicU64::new(0),
                    plis: AtomicU64::new(0),
                }),
                verifier,
                rooms: Mutex::new(HashMap::new()),
                join_attempts: AtomicU32::new(0),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &LoopbackConfig {
        &self.state.shared.config
    }

    /// Names of the rooms that currently have participants.
    pub async fn room_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.rooms.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn participants(&self, room: &str) -> Vec<ParticipantInfo> {
        let Some(room) = self.state.rooms.lock().await.get(room).cloned() else {
            return vec![];
        };
        let participants = room.participants.lock().await;
        participants.values().map(|p| p.info.clone()).collect()
    }

    /// Subscriptions whose remote track is still alive.
    pub fn active_subscriptions(&self) -> u64 {
        self.state.shared.subscriptions.load(Ordering::Relaxed)
    }

    /// Key frame requests received across all tracks.
    pub fn pli_count(&self) -> u64 {
        self.state.shared.plis.load(Ordering::Relaxed)
    }

    pub fn join_attempts(&self) -> u32 {
        self.state.join_attempts.load(Ordering::Relaxed)
    }

    /// Removes a participant as if the server dropped it.
    pub async fn disconnect_participant(&self, room: &str, identity: &str, reason: &str) -> Result<()> {
        let room = self
            .state
            .rooms
            .lock()
            .await
            .get(room)
            .cloned()
            .ok_or_else(|| Error::ErrNotFound(room.to_owned()))?;
        let participant = room
            .participants
            .lock()
            .await
            .get(identity)
            .cloned()
            .ok_or_else(|| Error::ErrParticipantNotFound(identity.to_owned()))?;

        participant.send(RoomEvent::Disconnected {
            reason: reason.to_owned(),
        });
        self.remove_participant(&room, &participant).await;
        Ok(())
    }

    /// Disconnects everyone and rejects further joins.
    pub async fn close(&self) {
        self.state.shutdown.cancel();
        let rooms: Vec<Arc<RoomState>> = self.state.rooms.lock().await.values().cloned().collect();
        for room in rooms {
            let participants: Vec<Arc<ParticipantState>> =
                room.participants.lock().await.values().cloned().collect();
            for participant in participants {
                participant.send(RoomEvent::Disconnected {
                    reason: "server shutdown".to_owned(),
                });
                self.remove_participant(&room, &participant).await;
            }
        }
    }

    pub(crate) async fn join_as(
        &self,
        room_name: &str,
        identity: &str,
        kind: ParticipantKind,
        attributes: HashMap<String, String>,
        auto_subscribe: bool,
    ) -> Result<(Arc<LoopbackRoom>, RoomEvents)> {
        if self.state.shutdown.is_cancelled() {
            return Err(Error::ErrRoomClosed);
        }
        let shared = &self.state.shared;

        let (tx, rx) = mpsc::unbounded_channel();
        let participant = Arc::new(ParticipantState {
            info: ParticipantInfo {
                sid: shared.next_sid("PA"),
                identity: identity.to_owned(),
                kind,
                attributes,
            },
            events: tx,
            auto_subscribe,
            publications: Mutex::new(vec![]),
            views: Mutex::new(HashMap::new()),
            local_tracks: Mutex::new(HashMap::new()),
            cancel: self.state.shutdown.child_token(),
            left: AtomicBool::new(false),
        });

        let (room, replaced, others) = {
            let mut rooms = self.state.rooms.lock().await;
            let room = rooms
                .entry(room_name.to_owned())
                .or_insert_with(|| {
                    Arc::new(RoomState {
                        name: room_name.to_owned(),
                        sid: shared.next_sid("RM"),
                        participants: Mutex::new(BTreeMap::new()),
                    })
                })
                .clone();
            let mut participants = room.participants.lock().await;
            let replaced = participants.insert(identity.to_owned(), Arc::clone(&participant));
            let others: Vec<Arc<ParticipantState>> = participants
                .values()
                .filter(|p| !Arc::ptr_eq(p, &participant))
                .cloned()
                .collect();
            drop(participants);
            (room, replaced, others)
        };

        if let Some(replaced) = replaced {
            replaced.send(RoomEvent::Disconnected {
                reason: "duplicate identity".to_owned(),
            });
            self.remove_participant(&room, &replaced).await;
        }

        for other in &others {
            other.send(RoomEvent::ParticipantConnected(participant.info.clone()));
        }
        if auto_subscribe {
            for other in &others {
                let tracks = other.publications.lock().await.clone();
                for track in tracks {
                    let view = participant.view_of(&track, shared).await;
                    view.set_subscribed(true).await?;
                }
            }
        }

        debug!(
            "{} ({:?}) joined {} ({})",
            identity, kind, room.name, room.sid
        );
        Ok((
            Arc::new(LoopbackRoom {
                sfu: self.clone(),
                room,
                participant,
            }),
            rx,
        ))
    }

    pub(crate) async fn remove_participant(
        &self,
        room: &Arc<RoomState>,
        participant: &Arc<ParticipantState>,
    ) {
        if participant.left.swap(true, Ordering::SeqCst) {
            return;
        }

        let others = {
            let mut rooms = self.state.rooms.lock().await;
            let mut participants = room.participants.lock().await;
            let identity = &participant.info.identity;
            if participants
                .get(identity)
                .is_some_and(|p| Arc::ptr_eq(p, participant))
            {
                participants.remove(identity);
            }
            if participants.is_empty()
                && rooms
                    .get(&room.name)
                    .is_some_and(|r| Arc::ptr_eq(r, room))
            {
                rooms.remove(&room.name);
                debug!("room {} closed", room.name);
            }
            participants.values().cloned().collect::<Vec<_>>()
        };

        participant.cancel.cancel();
        let publications = std::mem::take(&mut *participant.publications.lock().await);
        for track in &publications {
            track.unpublished.cancel();
        }

        for other in &others {
            for track in &publications {
                other.views.lock().await.remove(&track.sid);
                other.send(RoomEvent::TrackUnpublished {
                    track_sid: track.sid.clone(),
                    participant: participant.info.clone(),
                });
            }
            other.send(RoomEvent::ParticipantDisconnected(
                participant.info.clone(),
            ));
        }

        // agents leave once nobody is left to talk to
        if !others.is_empty()
            && others
                .iter()
                .all(|other| other.info.kind == ParticipantKind::Agent)
        {
            for agent in &others {
                agent.cancel.cancel();
            }
        }

        debug!(
            "{} left {}",
            participant.info.identity, room.name
        );
    }

    async fn run_agent(self, dispatch: AgentDispatch) {
        let identity = format!("agent-{}", dispatch.id);
        let attributes = HashMap::from([
            ("agentName".to_owned(), dispatch.agent_name.clone()),
            ("dispatchId".to_owned(), dispatch.id.clone()),
        ]);

        let (room, _events) = match self
            .join_as(&dispatch.room, &identity, ParticipantKind::Agent, attributes, false)
            .await
        {
            Ok(joined) => joined,
            Err(err) => {
                warn!("agent {} failed to join {}: {}", identity, dispatch.room, err);
                return;
            }
        };
        info!("agent {} joined {}", identity, dispatch.room);

        if let Err(err) = speak(&room).await {
            warn!("agent {} stopped speaking: {}", identity, err);
        }
        room.disconnect().await;
    }
}

async fn speak(room: &LoopbackRoom) -> Result<()> {
    let track = room
        .create_local_track(LocalTrackInit {
            kind: TrackKind::Audio,
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: OPUS_CLOCK_RATE,
            layer: None,
            simulcast_group: None,
        })
        .await?;
    room.publish_track(
        Arc::clone(&track),
        TrackPublishOptions {
            name: "agent-voice".to_owned(),
            source: TrackSource::Microphone,
        },
    )
    .await?;

    let closed = room.closed();
    let mut source = CountingSource::new(AGENT_VOICE_BITRATE, OPUS_FRAME_DURATION);
    let mut next = tokio::time::Instant::now();
    loop {
        let sample = source.next_sample()?;
        track.write_sample(&sample).await?;
        next += sample.duration;
        tokio::select! {
            _ = closed.cancelled() => return Ok(()),
            _ = tokio::time::sleep_until(next) => {}
        }
    }
}

#[async_trait]
impl SfuConnector for LoopbackSfu {
    async fn join(
        &self,
        url: &str,
        info: &ConnectInfo,
        options: RoomOptions,
    ) -> Result<(Arc<dyn Room>, RoomEvents)> {
        let attempt = self.state.join_attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.state.shared.config.failing_joins {
            return Err(Error::Other(format!(
                "{url}: join attempt {} rejected",
                attempt + 1
            )));
        }

        let token = AccessToken::new(info.api_key.as_str(), info.api_secret.as_str())
            .with_identity(info.identity.as_str())
            .with_grant(VideoGrant::join(info.room_name.as_str()))
            .with_attributes(info.attributes.clone())
            .to_jwt()?;
        let claims = self.state.verifier.verify(&token)?;
        if !claims.video.room_join || claims.video.room.is_empty() {
            return Err(Error::ErrInvalidToken("missing room join grant".to_owned()));
        }

        let (room, events) = self
            .join_as(
                &claims.video.room,
                &claims.sub,
                ParticipantKind::Standard,
                claims.attributes,
                options.auto_subscribe,
            )
            .await?;
        let room: Arc<dyn Room> = room;
        Ok((room, events))
    }
}

#[async_trait]
impl AgentDispatcher for LoopbackSfu {
    async fn create_dispatch(
        &self,
        room: &str,
        agent_name: &str,
        metadata: &str,
    ) -> Result<AgentDispatch> {
        if self.state.shutdown.is_cancelled() {
            return Err(Error::ErrRoomClosed);
        }
        let dispatch = AgentDispatch {
            id: self.state.shared.next_sid("AD"),
            room: room.to_owned(),
            agent_name: agent_name.to_owned(),
            metadata: metadata.to_owned(),
        };

        let sfu = self.clone();
        let delay = self.state.shared.config.agent_join_delay;
        let shutdown = self.state.shutdown.clone();
        let agent = dispatch.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => sfu.run_agent(agent).await,
            }
        });

        Ok(dispatch)
    }
}
