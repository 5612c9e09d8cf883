use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use async_trait::async_trait;
use log::debug;
use tokio_util::sync::CancellationToken;

use super::track::{LoopbackLocalTrack, PublishedLayer, PublishedTrack};
use super::{LoopbackSfu, ParticipantState, RoomState};
use crate::client::{
    LocalTrack, LocalTrackInit, ParticipantInfo, RemoteParticipant, RemoteTrackPublication, Room,
    RoomEvent, TrackKind, TrackPublishOptions,
};
use crate::error::{Error, Result};

/// LoopbackRoom is a participant's handle on a loopback room.
pub struct LoopbackRoom {
    pub(crate) sfu: LoopbackSfu,
    pub(crate) room: Arc<RoomState>,
    pub(crate) participant: Arc<ParticipantState>,
}

impl LoopbackRoom {
    /// Cancelled once the participant has left the room.
    pub fn closed(&self) -> CancellationToken {
        self.participant.cancel.clone()
    }

    async fn local_track(&self, id: &str) -> Result<Arc<LoopbackLocalTrack>> {
        self.participant
            .local_tracks
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::ErrTrackNotFound(id.to_owned()))
    }

    async fn announce(&self, track: Arc<PublishedTrack>) -> Result<String> {
        if self.participant.cancel.is_cancelled() {
            return Err(Error::ErrRoomClosed);
        }
        self.participant
            .publications
            .lock()
            .await
            .push(Arc::clone(&track));

        let shared = &self.sfu.state.shared;
        for other in self.room.others(&self.participant).await {
            let view = other.view_of(&track, shared).await;
            other.send(RoomEvent::TrackPublished {
                publication: view.clone(),
                participant: self.participant.info.clone(),
            });
            if other.auto_subscribe {
                view.set_subscribed(true).await?;
            }
        }

        debug!(
            "{} published {} ({}) in {}",
            self.participant.info.identity, track.name, track.sid, self.room.name
        );
        Ok(track.sid.clone())
    }
}

#[async_trait]
impl Room for LoopbackRoom {
    fn name(&self) -> &str {
        &self.room.name
    }

    fn sid(&self) -> &str {
        &self.room.sid
    }

    fn local_participant(&self) -> &ParticipantInfo {
        &self.participant.info
    }

    async fn remote_participants(&self) -> Vec<RemoteParticipant> {
        let shared = &self.sfu.state.shared;
        let mut participants = vec![];
        for other in self.room.others(&self.participant).await {
            let tracks = other.publications.lock().await.clone();
            let mut publications: Vec<Arc<dyn RemoteTrackPublication>> = vec![];
            for track in tracks {
                publications.push(self.participant.view_of(&track, shared).await);
            }
            participants.push(RemoteParticipant {
                info: other.info.clone(),
                publications,
            });
        }
        participants
    }

    async fn create_local_track(&self, init: LocalTrackInit) -> Result<Arc<dyn LocalTrack>> {
        let shared = &self.sfu.state.shared;
        let track = Arc::new(LoopbackLocalTrack::new(
            shared.next_sid("LT"),
            init.kind,
            init.mime_type,
            init.clock_rate,
            init.layer,
            shared.config.channel_capacity,
        )?);
        self.participant
            .local_tracks
            .lock()
            .await
            .insert(track.id.clone(), Arc::clone(&track));
        Ok(track)
    }

    async fn publish_track(
        &self,
        track: Arc<dyn LocalTrack>,
        options: TrackPublishOptions,
    ) -> Result<String> {
        let local = self.local_track(track.id()).await?;
        let track = Arc::new(PublishedTrack {
            sid: self.sfu.state.shared.next_sid("TR"),
            name: options.name,
            kind: local.kind,
            source: options.source,
            mime_type: local.mime_type.clone(),
            clock_rate: local.clock_rate,
            publisher: self.participant.info.clone(),
            layers: vec![PublishedLayer {
                height: local.layer.map(|layer| layer.height).unwrap_or_default(),
                packets: local.packets.clone(),
            }],
            unpublished: self.participant.cancel.child_token(),
            plis: AtomicU64::new(0),
        });
        self.announce(track).await
    }

    async fn publish_simulcast_track(
        &self,
        tracks: Vec<Arc<dyn LocalTrack>>,
        options: TrackPublishOptions,
    ) -> Result<String> {
        let mut locals = Vec::with_capacity(tracks.len());
        for track in &tracks {
            locals.push(self.local_track(track.id()).await?);
        }
        let Some(first) = locals.first() else {
            return Err(Error::ErrPublishFailed(
                "simulcast track without encodings".to_owned(),
            ));
        };
        if locals
            .iter()
            .any(|local| local.kind != TrackKind::Video || local.mime_type != first.mime_type)
        {
            return Err(Error::ErrPublishFailed(
                "simulcast encodings must share one video codec".to_owned(),
            ));
        }

        let mut layers: Vec<PublishedLayer> = locals
            .iter()
            .map(|local| PublishedLayer {
                height: local.layer.map(|layer| layer.height).unwrap_or_default(),
                packets: local.packets.clone(),
            })
            .collect();
        layers.sort_by_key(|layer| layer.height);

        let track = Arc::new(PublishedTrack {
            sid: self.sfu.state.shared.next_sid("TR"),
            name: options.name,
            kind: TrackKind::Video,
            source: options.source,
            mime_type: first.mime_type.clone(),
            clock_rate: first.clock_rate,
            publisher: self.participant.info.clone(),
            layers,
            unpublished: self.participant.cancel.child_token(),
            plis: AtomicU64::new(0),
        });
        self.announce(track).await
    }

    async fn unpublish_track(&self, sid: &str) -> Result<()> {
        let track = {
            let mut publications = self.participant.publications.lock().await;
            let index = publications
                .iter()
                .position(|track| track.sid == sid)
                .ok_or_else(|| Error::ErrTrackNotFound(sid.to_owned()))?;
            publications.remove(index)
        };
        track.unpublished.cancel();

        for other in self.room.others(&self.participant).await {
            other.views.lock().await.remove(sid);
            other.send(RoomEvent::TrackUnpublished {
                track_sid: sid.to_owned(),
                participant: self.participant.info.clone(),
            });
        }
        Ok(())
    }

    async fn disconnect(&self) {
        self.sfu
            .remove_participant(&self.room, &self.participant)
            .await;
    }
}
