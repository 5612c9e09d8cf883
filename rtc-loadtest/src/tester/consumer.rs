use std::sync::Arc;

use log::{debug, error, trace};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::client::{RemoteTrack, RemoteTrackPublication, TrackKind};
use crate::error::Result;
use crate::media::sample_builder::{
    MAX_LATE_AUDIO, MAX_LATE_VIDEO, SampleBuilder, depacketizer_for,
};
use crate::stats::TrackStats;

/// Reads one subscribed track until it ends or `cancel` fires. A panic in
/// the read loop ends only this track.
pub(crate) async fn consume(
    tester: String,
    track: Box<dyn RemoteTrack>,
    publication: Arc<dyn RemoteTrackPublication>,
    stats: Arc<Mutex<TrackStats>>,
    cancel: CancellationToken,
) {
    let track_id = track.id().to_owned();
    let handle = tokio::spawn(read_loop(track, publication, stats, cancel));

    match handle.await {
        Ok(Ok(())) => trace!("{tester}: consumer of {track_id} finished"),
        Ok(Err(err)) => debug!("{tester}: stopped reading {track_id}: {err}"),
        Err(err) if err.is_panic() => error!("{tester}: consumer of {track_id} panicked: {err}"),
        Err(err) => debug!("{tester}: consumer of {track_id} aborted: {err}"),
    }
}

async fn read_loop(
    mut track: Box<dyn RemoteTrack>,
    publication: Arc<dyn RemoteTrackPublication>,
    stats: Arc<Mutex<TrackStats>>,
    cancel: CancellationToken,
) -> Result<()> {
    let codec = track.codec();
    let kind = track.kind();
    let max_late = match kind {
        TrackKind::Video => MAX_LATE_VIDEO,
        TrackKind::Audio => MAX_LATE_AUDIO,
    };
    let mut builder = SampleBuilder::new(max_late, depacketizer_for(&codec.mime_type)?);

    loop {
        let packet = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            packet = track.read_rtp() => packet?,
        };
        builder.push(packet);

        while let Some(packets) = builder.pop_packets() {
            let mut stats = stats.lock().await;
            let tail = packets.len().saturating_sub(1);
            for (i, packet) in packets.iter().enumerate() {
                stats.on_packet(packet, i == tail);
            }
        }

        let dropped = builder.take_dropped();
        if dropped > 0 {
            stats.lock().await.on_samples_dropped(dropped);
            if kind == TrackKind::Video {
                publication.write_pli(track.ssrc()).await?;
            }
        }
    }
}
