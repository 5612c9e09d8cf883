use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::{debug, info, trace, warn};
use tokio::sync::Mutex;

use super::TesterInner;
use super::consumer::consume;
use crate::client::{
    ParticipantInfo, RemoteTrack, RemoteTrackPublication, RoomEvent, RoomEvents, TrackKind,
};
use crate::config::{QualityCounts, QualityTarget};
use crate::stats::{LATENCY_WINDOW, TrackStats};

/// Subscription bookkeeping, always updated under one lock.
#[derive(Debug, Default)]
pub(crate) struct Subscriptions {
    /// identities of the remote participants we subscribe to
    pub(crate) participants: HashSet<String>,
    /// video quality assigned per remote participant identity
    pub(crate) qualities: HashMap<String, QualityTarget>,
}

impl TesterInner {
    pub(crate) async fn handle_events(self: Arc<Self>, mut events: RoomEvents) {
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => return,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => return,
                },
            };
            trace!("{}: {:?}", self.params.name, event);
            self.handle_event(event).await;
        }
    }

    async fn handle_event(self: &Arc<Self>, event: RoomEvent) {
        let name = &self.params.name;
        match event {
            RoomEvent::TrackPublished {
                publication,
                participant,
            } => self.on_track_published(publication, &participant).await,
            RoomEvent::TrackSubscribed {
                track,
                publication,
                participant,
            } => self.on_track_subscribed(track, publication, &participant).await,
            RoomEvent::TrackSubscriptionFailed {
                track_sid,
                participant,
                error,
            } => warn!(
                "{name}: subscription to {track_sid} of {} failed: {error}",
                participant.identity
            ),
            RoomEvent::TrackUnpublished {
                track_sid,
                participant,
            } => debug!(
                "{name}: {} unpublished {track_sid}",
                participant.identity
            ),
            RoomEvent::ParticipantConnected(participant) => {
                debug!("{name}: {} connected", participant.identity)
            }
            RoomEvent::ParticipantDisconnected(participant) => {
                self.on_participant_disconnected(&participant).await
            }
            RoomEvent::ConnectionQualityChanged {
                participant,
                quality,
            } => debug!(
                "{name}: connection quality of {} is {quality:?}",
                participant.identity
            ),
            RoomEvent::DataReceived {
                participant,
                topic,
                payload,
            } => trace!(
                "{name}: {} bytes of data on {:?} from {:?}",
                payload.len(),
                topic,
                participant.map(|p| p.identity)
            ),
            RoomEvent::Reconnecting => info!("{name}: reconnecting"),
            RoomEvent::Reconnected => info!("{name}: reconnected"),
            RoomEvent::Disconnected { reason } => {
                self.fail(format!("disconnected by server: {reason}")).await
            }
        }
    }

    pub(crate) async fn on_track_published(
        &self,
        publication: Arc<dyn RemoteTrackPublication>,
        participant: &ParticipantInfo,
    ) {
        if !self.params.subscribe {
            return;
        }

        {
            let mut subscriptions = self.subscriptions.lock().await;
            if !subscriptions.participants.contains(&participant.identity) {
                if subscriptions.participants.len() >= self.params.layout.max_subscriptions() {
                    return;
                }
                subscriptions
                    .participants
                    .insert(participant.identity.clone());
            }
        }

        if let Err(err) = publication.set_subscribed(true).await {
            warn!(
                "{}: could not subscribe to {} of {}: {err}",
                self.params.name,
                publication.sid(),
                participant.identity
            );
        }
    }

    async fn on_track_subscribed(
        self: &Arc<Self>,
        track: Box<dyn RemoteTrack>,
        publication: Arc<dyn RemoteTrackPublication>,
        participant: &ParticipantInfo,
    ) {
        let kind = track.kind();
        let stats = TrackStats::new(track.id(), publication.name(), kind)
            .with_latency_window(self.params.latency_window.unwrap_or(LATENCY_WINDOW));
        let stats = Arc::new(Mutex::new(stats));
        let subscribed = {
            let mut tracks = self.stats.lock().await;
            tracks.insert(track.id().to_owned(), Arc::clone(&stats));
            tracks.len()
        };
        info!(
            "{}: subscribed to {subscribed}/{} tracks",
            self.params.name, self.params.expected_tracks
        );

        if kind == TrackKind::Video {
            if let Err(err) = publication.write_pli(track.ssrc()).await {
                debug!("{}: pli failed: {err}", self.params.name);
            }
        }

        let name = self.params.name.clone();
        let cancel = self.cancel.clone();
        let consumer_publication = Arc::clone(&publication);
        self.tasks.spawn(async move {
            consume(name, track, consumer_publication, stats, cancel).await;
        });

        if kind == TrackKind::Video {
            self.assign_quality(publication, participant).await;
        }
    }

    async fn assign_quality(
        &self,
        publication: Arc<dyn RemoteTrackPublication>,
        participant: &ParticipantInfo,
    ) {
        let target = {
            let mut subscriptions = self.subscriptions.lock().await;
            let target = match subscriptions.qualities.get(&participant.identity) {
                Some(target) => *target,
                None => self
                    .params
                    .layout
                    .next_quality(&QualityCounts::tally(subscriptions.qualities.values())),
            };
            subscriptions
                .qualities
                .insert(participant.identity.clone(), target);
            target
        };
        debug!(
            "{}: {} of {} at {target}",
            self.params.name,
            publication.sid(),
            participant.identity
        );

        let result = match target.dimensions() {
            Some((width, height)) => publication.set_video_dimensions(width, height).await,
            None => publication.set_enabled(false).await,
        };
        if let Err(err) = result {
            warn!(
                "{}: could not set quality of {}: {err}",
                self.params.name,
                publication.sid()
            );
        }
    }

    /// Frees the participant's slot and quality, then offers the slot to
    /// participants that did not fit before.
    async fn on_participant_disconnected(&self, participant: &ParticipantInfo) {
        let released = {
            let mut subscriptions = self.subscriptions.lock().await;
            subscriptions.qualities.remove(&participant.identity);
            subscriptions.participants.remove(&participant.identity)
        };
        debug!(
            "{}: {} disconnected",
            self.params.name, participant.identity
        );
        if !released {
            return;
        }

        let Some(room) = self.room.lock().await.clone() else {
            return;
        };
        for remote in room.remote_participants().await {
            let tracked = self
                .subscriptions
                .lock()
                .await
                .participants
                .contains(&remote.info.identity);
            if tracked {
                continue;
            }
            for publication in remote.publications {
                self.on_track_published(publication, &remote.info).await;
            }
        }
    }
}
