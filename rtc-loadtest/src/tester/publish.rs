use std::sync::Arc;

use log::{debug, info, trace, warn};
use tokio_util::sync::CancellationToken;

use super::Tester;
use crate::client::{LocalTrack, LocalTrackInit, TrackKind, TrackPublishOptions, TrackSource};
use crate::error::{Error, Result};
use crate::media::looper::SampleProvider;
use crate::media::{VideoCodec, VideoResolution};

/// Simulcast group shared by the encodings of a published video track.
pub const SIMULCAST_GROUP: &str = "loadtest-video";

impl Tester {
    /// Publishes looped speech carrying send timestamps, returning the sid.
    pub async fn publish_audio_track(&self, name: &str) -> Result<String> {
        let looper = self.inner.library.timestamped_audio_looper()?;
        self.publish_provider(name, TrackKind::Audio, TrackSource::Microphone, looper)
            .await
    }

    /// Publishes a single layer of looped video.
    pub async fn publish_video_track(
        &self,
        name: &str,
        resolution: VideoResolution,
        codec: VideoCodec,
    ) -> Result<String> {
        let looper = self
            .inner
            .library
            .video_loopers(resolution, codec, false)?
            .pop()
            .ok_or_else(|| Error::ErrUnsupportedCodec(format!("{codec} at {resolution}")))?;
        self.publish_provider(name, TrackKind::Video, TrackSource::Camera, looper)
            .await
    }

    /// Publishes the synthetic counting source as an audio-clocked track.
    pub async fn publish_counting_track(&self, name: &str, bitrate: u32) -> Result<String> {
        let source = Box::new(self.inner.library.counting_source(bitrate));
        self.publish_provider(name, TrackKind::Audio, TrackSource::Microphone, source)
            .await
    }

    /// Publishes low, medium and high encodings as one simulcast track.
    /// `resolution` is only checked to be available.
    pub async fn publish_simulcast_track(
        &self,
        name: &str,
        resolution: VideoResolution,
        codec: VideoCodec,
    ) -> Result<String> {
        self.inner.library.video_spec(codec, resolution)?;
        let loopers = self.inner.library.video_loopers(resolution, codec, true)?;
        let room = self.room().await?;

        let mut tracks: Vec<Arc<dyn LocalTrack>> = Vec::with_capacity(loopers.len());
        let inits: Vec<LocalTrackInit> = loopers
            .iter()
            .map(|looper| LocalTrackInit {
                kind: TrackKind::Video,
                mime_type: looper.mime_type().to_owned(),
                clock_rate: looper.clock_rate(),
                layer: looper.layer(),
                simulcast_group: Some(SIMULCAST_GROUP.to_owned()),
            })
            .collect();
        for init in inits {
            let track = room
                .create_local_track(init)
                .await
                .map_err(|err| Error::ErrPublishFailed(format!("{name}: {err}")))?;
            tracks.push(track);
        }

        // writers stop with the publication if publishing fails
        let writers = self.inner.cancel.child_token();
        for (track, looper) in tracks.iter().zip(loopers) {
            self.spawn_writer(Arc::clone(track), looper, writers.clone());
        }

        let options = TrackPublishOptions {
            name: name.to_owned(),
            source: TrackSource::Camera,
        };
        match room.publish_simulcast_track(tracks, options).await {
            Ok(sid) => {
                info!("{}: published simulcast {name} ({sid})", self.name());
                self.inner.publications.lock().await.push(sid.clone());
                Ok(sid)
            }
            Err(err) => {
                writers.cancel();
                Err(Error::ErrPublishFailed(format!("{name}: {err}")))
            }
        }
    }

    /// Stops publishing the track with `sid`.
    pub async fn unpublish(&self, sid: &str) -> Result<()> {
        let room = self.room().await?;
        room.unpublish_track(sid).await?;
        self.inner.publications.lock().await.retain(|s| s != sid);
        Ok(())
    }

    async fn publish_provider(
        &self,
        name: &str,
        kind: TrackKind,
        source: TrackSource,
        provider: Box<dyn SampleProvider>,
    ) -> Result<String> {
        let room = self.room().await?;
        let track = room
            .create_local_track(LocalTrackInit {
                kind,
                mime_type: provider.mime_type().to_owned(),
                clock_rate: provider.clock_rate(),
                layer: provider.layer(),
                simulcast_group: None,
            })
            .await
            .map_err(|err| Error::ErrPublishFailed(format!("{name}: {err}")))?;

        let writer = self.inner.cancel.child_token();
        self.spawn_writer(Arc::clone(&track), provider, writer.clone());

        let options = TrackPublishOptions {
            name: name.to_owned(),
            source,
        };
        match room.publish_track(track, options).await {
            Ok(sid) => {
                info!("{}: published {kind} {name} ({sid})", self.name());
                self.inner.publications.lock().await.push(sid.clone());
                Ok(sid)
            }
            Err(err) => {
                writer.cancel();
                Err(Error::ErrPublishFailed(format!("{name}: {err}")))
            }
        }
    }

    fn spawn_writer(
        &self,
        track: Arc<dyn LocalTrack>,
        provider: Box<dyn SampleProvider>,
        cancel: CancellationToken,
    ) {
        let name = self.inner.params.name.clone();
        self.inner
            .tasks
            .spawn(write_samples(name, track, provider, cancel));
    }
}

/// Writes samples at their presentation cadence until cancelled.
async fn write_samples(
    tester: String,
    track: Arc<dyn LocalTrack>,
    mut provider: Box<dyn SampleProvider>,
    cancel: CancellationToken,
) {
    let mut next = tokio::time::Instant::now();
    loop {
        let sample = match provider.next_sample() {
            Ok(sample) => sample,
            Err(err) => {
                warn!("{tester}: media source of {} failed: {err}", track.id());
                return;
            }
        };
        if let Err(err) = track.write_sample(&sample).await {
            if err.is_terminal() {
                debug!("{tester}: stopped writing {}: {err}", track.id());
                return;
            }
            trace!("{tester}: write to {} failed: {err}", track.id());
        }

        next += sample.duration;
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep_until(next) => {}
        }
    }
}
