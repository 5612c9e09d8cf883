use std::sync::Arc;

use chrono::Utc;
use log::{debug, info, trace, warn};
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::{AgentRoomStats, ECHO_BUFFER, ECHO_IDENTITY, ECHO_TRACK_NAME};
use crate::client::{
    AgentDispatcher, ConnectInfo, LocalTrack, LocalTrackInit, ParticipantKind, RemoteTrack, Room,
    RoomEvent, RoomEvents, RoomOptions, SfuConnector, TrackKind, TrackPublishOptions, TrackSource,
};
use crate::config::AgentLoadTestParams;
use crate::error::Result;
use crate::media::{MIME_TYPE_OPUS, OPUS_CLOCK_RATE, OPUS_FRAME_DURATION, Sample};
use crate::tester::join_with_retry;

struct EchoSample {
    sample: Sample,
    received_at: Instant,
}

pub(super) struct EchoRoom {
    pub(super) name: String,
    pub(super) params: AgentLoadTestParams,
    pub(super) connector: Arc<dyn SfuConnector>,
    pub(super) dispatcher: Arc<dyn AgentDispatcher>,
    pub(super) stats: Arc<Mutex<AgentRoomStats>>,
    pub(super) cancel: CancellationToken,
}

impl EchoRoom {
    pub(super) async fn run(self) {
        let tasks = TaskTracker::new();
        if let Err(err) = self.echo(&tasks).await {
            warn!("{}: {err}", self.name);
            self.stats.lock().await.error = Some(err.to_string());
        }
        self.cancel.cancel();
        tasks.close();
        tasks.wait().await;
    }

    async fn echo(&self, tasks: &TaskTracker) -> Result<()> {
        let info = ConnectInfo {
            api_key: self.params.api_key.clone(),
            api_secret: self.params.api_secret.clone(),
            room_name: self.name.clone(),
            identity: ECHO_IDENTITY.to_owned(),
            attributes: self.params.attributes.clone(),
        };
        let options = RoomOptions {
            auto_subscribe: true,
        };
        let (room, events) = join_with_retry(
            self.connector.as_ref(),
            &self.params.url,
            &info,
            options,
            &self.cancel,
            &self.name,
        )
        .await?;
        info!("{}: echo participant joined", self.name);

        let result = self.serve(&room, events, tasks).await;
        room.disconnect().await;
        result
    }

    async fn serve(&self, room: &Arc<dyn Room>, mut events: RoomEvents, tasks: &TaskTracker) -> Result<()> {
        let echo = room
            .create_local_track(LocalTrackInit {
                kind: TrackKind::Audio,
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: OPUS_CLOCK_RATE,
                layer: None,
                simulcast_group: None,
            })
            .await?;
        room.publish_track(
            Arc::clone(&echo),
            TrackPublishOptions {
                name: ECHO_TRACK_NAME.to_owned(),
                source: TrackSource::Microphone,
            },
        )
        .await?;

        if !self.params.agent_name.is_empty() {
            self.stats.lock().await.dispatched_at = Some(Utc::now());
            let dispatch = self
                .dispatcher
                .create_dispatch(&self.name, &self.params.agent_name, "")
                .await?;
            debug!("{}: dispatched {} ({})", self.name, dispatch.agent_name, dispatch.id);
        }

        // the first participant to show up is the one being echoed
        let mut first: Option<String> = room
            .remote_participants()
            .await
            .into_iter()
            .next()
            .map(|p| p.info.identity);

        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                event = events.recv() => match event {
                    Some(event) => event,
                    None => return Ok(()),
                },
            };

            match event {
                RoomEvent::ParticipantConnected(participant) => {
                    if first.is_none() {
                        first = Some(participant.identity.clone());
                    }
                    if participant.kind == ParticipantKind::Agent {
                        let mut stats = self.stats.lock().await;
                        if !stats.agent_joined {
                            stats.agent_joined = true;
                            stats.joined_at = Some(Utc::now());
                            info!("{}: agent {} joined", self.name, participant.identity);
                        }
                    }
                }
                RoomEvent::TrackSubscribed {
                    track,
                    publication,
                    participant,
                } => {
                    if publication.kind() != TrackKind::Audio
                        || first.as_deref() != Some(participant.identity.as_str())
                    {
                        continue;
                    }
                    let mut stats = self.stats.lock().await;
                    if stats.agent_track_subscribed {
                        continue;
                    }
                    stats.agent_track_subscribed = true;
                    drop(stats);
                    info!(
                        "{}: echoing {} from {}",
                        self.name,
                        publication.name(),
                        participant.identity
                    );

                    let (tx, rx) = mpsc::channel(ECHO_BUFFER);
                    tasks.spawn(read_samples(track, tx, self.cancel.clone()));
                    tasks.spawn(write_samples(
                        Arc::clone(&echo),
                        rx,
                        self.params.echo_speech_delay,
                        Arc::clone(&self.stats),
                        self.cancel.clone(),
                    ));
                }
                RoomEvent::ParticipantDisconnected(participant) => {
                    if first.as_deref() == Some(participant.identity.as_str()) {
                        info!("{}: {} left, closing", self.name, participant.identity);
                        return Ok(());
                    }
                }
                RoomEvent::TrackSubscriptionFailed {
                    track_sid, error, ..
                } => warn!("{}: subscription to {track_sid} failed: {error}", self.name),
                RoomEvent::Disconnected { reason } => {
                    info!("{}: disconnected: {reason}", self.name);
                    return Ok(());
                }
                event => trace!("{}: {}", self.name, event.name()),
            }
        }
    }
}

async fn read_samples(
    mut track: Box<dyn RemoteTrack>,
    samples: mpsc::Sender<EchoSample>,
    cancel: CancellationToken,
) {
    loop {
        let packet = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            packet = track.read_rtp() => packet,
        };
        match packet {
            Ok(packet) => {
                let sample = EchoSample {
                    sample: Sample {
                        data: packet.payload,
                        duration: OPUS_FRAME_DURATION,
                    },
                    received_at: Instant::now(),
                };
                if samples.try_send(sample).is_err() {
                    trace!("echo buffer of {} is full, dropping", track.id());
                }
            }
            Err(err) => {
                debug!("stopped reading {}: {err}", track.id());
                return;
            }
        }
    }
}

async fn write_samples(
    echo: Arc<dyn LocalTrack>,
    mut samples: mpsc::Receiver<EchoSample>,
    delay: std::time::Duration,
    stats: Arc<Mutex<AgentRoomStats>>,
    cancel: CancellationToken,
) {
    let mut echoed = false;
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return,
            next = samples.recv() => match next {
                Some(next) => next,
                None => return,
            },
        };
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep_until(next.received_at + delay) => {}
        }
        match echo.write_sample(&next.sample).await {
            Ok(()) if !echoed => {
                echoed = true;
                stats.lock().await.echo_track_published = true;
            }
            Ok(()) => {}
            Err(err) if err.is_terminal() => return,
            Err(err) => trace!("echo write to {} failed: {err}", echo.id()),
        }
    }
}
