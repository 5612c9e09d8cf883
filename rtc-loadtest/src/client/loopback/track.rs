use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use log::trace;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use webrtc::rtp::codecs::h264::H264Payloader;
use webrtc::rtp::codecs::opus::OpusPayloader;
use webrtc::rtp::codecs::vp8::Vp8Payloader;
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet;
use webrtc::rtp::packetizer::{Packetizer, new_packetizer};
use webrtc::rtp::sequence::new_random_sequencer;

use super::{ParticipantState, Shared};
use crate::client::{
    LocalTrack, ParticipantInfo, RemoteCodec, RemoteTrack, RemoteTrackPublication, RoomEvent,
    TrackKind, TrackSource,
};
use crate::error::{Error, Result};
use crate::media::h26x_reader::H26xReader;
use crate::media::{MIME_TYPE_H264, MIME_TYPE_HEVC, MIME_TYPE_OPUS, MIME_TYPE_VP8, Sample, VideoLayer};

pub(crate) const RTP_OUTBOUND_MTU: usize = 1200;

const PAYLOAD_TYPE_H264: u8 = 96;
const PAYLOAD_TYPE_VP8: u8 = 97;
const PAYLOAD_TYPE_H265: u8 = 98;
const PAYLOAD_TYPE_OPUS: u8 = 111;

/// H.265 fragmentation unit, RFC 7798 section 4.4.3.
const HEVC_FU_TYPE: u8 = 49;

/// A packet as it left the publisher.
#[derive(Debug, Clone)]
pub(crate) struct ForwardedPacket {
    pub(crate) packet: Packet,
    pub(crate) sent_at: Instant,
}

pub(crate) fn payload_type_for(mime_type: &str) -> Result<u8> {
    if mime_type.eq_ignore_ascii_case(MIME_TYPE_H264) {
        Ok(PAYLOAD_TYPE_H264)
    } else if mime_type.eq_ignore_ascii_case(MIME_TYPE_VP8) {
        Ok(PAYLOAD_TYPE_VP8)
    } else if mime_type.eq_ignore_ascii_case(MIME_TYPE_HEVC) {
        Ok(PAYLOAD_TYPE_H265)
    } else if mime_type.eq_ignore_ascii_case(MIME_TYPE_OPUS) {
        Ok(PAYLOAD_TYPE_OPUS)
    } else {
        Err(Error::ErrUnsupportedCodec(mime_type.to_owned()))
    }
}

pub(crate) enum SamplePacketizer {
    Rtp(Box<dyn Packetizer + Send + Sync>),
    Hevc(HevcPacketizer),
}

impl SamplePacketizer {
    pub(crate) fn new(mime_type: &str, clock_rate: u32) -> Result<Self> {
        let payload_type = payload_type_for(mime_type)?;
        let ssrc = rand::random::<u32>();

        if payload_type == PAYLOAD_TYPE_H265 {
            return Ok(SamplePacketizer::Hevc(HevcPacketizer::new(
                RTP_OUTBOUND_MTU,
                payload_type,
                ssrc,
            )));
        }

        let packetizer: Box<dyn Packetizer + Send + Sync> = match payload_type {
            PAYLOAD_TYPE_H264 => Box::new(new_packetizer(
                RTP_OUTBOUND_MTU,
                payload_type,
                ssrc,
                Box::<H264Payloader>::default(),
                Box::new(new_random_sequencer()),
                clock_rate,
            )),
            PAYLOAD_TYPE_VP8 => Box::new(new_packetizer(
                RTP_OUTBOUND_MTU,
                payload_type,
                ssrc,
                Box::<Vp8Payloader>::default(),
                Box::new(new_random_sequencer()),
                clock_rate,
            )),
            _ => Box::new(new_packetizer(
                RTP_OUTBOUND_MTU,
                payload_type,
                ssrc,
                Box::new(OpusPayloader),
                Box::new(new_random_sequencer()),
                clock_rate,
            )),
        };
        Ok(SamplePacketizer::Rtp(packetizer))
    }

    pub(crate) fn packetize(&mut self, payload: &Bytes, samples: u32) -> Result<Vec<Packet>> {
        match self {
            SamplePacketizer::Rtp(packetizer) => Ok(packetizer.packetize(payload, samples)?),
            SamplePacketizer::Hevc(packetizer) => packetizer.packetize(payload, samples),
        }
    }
}

/// HevcPacketizer sends each NAL unit of an access unit as a single NAL unit
/// packet, or as fragmentation units when it exceeds the MTU.
pub(crate) struct HevcPacketizer {
    mtu: usize,
    payload_type: u8,
    ssrc: u32,
    sequence_number: u16,
    timestamp: u32,
}

impl HevcPacketizer {
    pub(crate) fn new(mtu: usize, payload_type: u8, ssrc: u32) -> Self {
        HevcPacketizer {
            mtu: mtu.max(4),
            payload_type,
            ssrc,
            sequence_number: rand::random::<u16>(),
            timestamp: rand::random::<u32>(),
        }
    }

    pub(crate) fn packetize(&mut self, payload: &Bytes, samples: u32) -> Result<Vec<Packet>> {
        let mut reader = H26xReader::new(payload.clone(), true)?;
        let mut payloads = vec![];

        while let Some(nal) = reader.next_nal() {
            if nal.data.len() <= self.mtu {
                payloads.push(nal.data);
                continue;
            }

            let nal_type = (nal.data[0] >> 1) & 0x3f;
            let header = [(nal.data[0] & 0x81) | (HEVC_FU_TYPE << 1), nal.data[1]];
            let body = nal.data.slice(2..);
            let chunk_size = self.mtu - 3;
            let chunks = body.len().div_ceil(chunk_size);

            for (i, chunk) in body.chunks(chunk_size).enumerate() {
                let mut fu_header = nal_type;
                if i == 0 {
                    fu_header |= 0x80;
                }
                if i + 1 == chunks {
                    fu_header |= 0x40;
                }

                let mut fu = BytesMut::with_capacity(3 + chunk.len());
                fu.put_slice(&header);
                fu.put_u8(fu_header);
                fu.put_slice(chunk);
                payloads.push(fu.freeze());
            }
        }

        let count = payloads.len();
        let mut packets = Vec::with_capacity(count);
        for (i, payload) in payloads.into_iter().enumerate() {
            packets.push(Packet {
                header: Header {
                    version: 2,
                    marker: i + 1 == count,
                    payload_type: self.payload_type,
                    sequence_number: self.sequence_number,
                    timestamp: self.timestamp,
                    ssrc: self.ssrc,
                    ..Default::default()
                },
                payload,
            });
            self.sequence_number = self.sequence_number.wrapping_add(1);
        }
        self.timestamp = self.timestamp.wrapping_add(samples);

        Ok(packets)
    }
}

/// LoopbackLocalTrack packetizes written samples and fans them out to every
/// subscriber of the publication it belongs to.
pub(crate) struct LoopbackLocalTrack {
    pub(crate) id: String,
    pub(crate) kind: TrackKind,
    pub(crate) mime_type: String,
    pub(crate) clock_rate: u32,
    pub(crate) layer: Option<VideoLayer>,
    pub(crate) packets: broadcast::Sender<ForwardedPacket>,
    packetizer: Mutex<SamplePacketizer>,
}

impl LoopbackLocalTrack {
    pub(crate) fn new(
        id: String,
        kind: TrackKind,
        mime_type: String,
        clock_rate: u32,
        layer: Option<VideoLayer>,
        capacity: usize,
    ) -> Result<Self> {
        let packetizer = SamplePacketizer::new(&mime_type, clock_rate)?;
        let (packets, _) = broadcast::channel(capacity.max(1));
        Ok(LoopbackLocalTrack {
            id,
            kind,
            mime_type,
            clock_rate,
            layer,
            packets,
            packetizer: Mutex::new(packetizer),
        })
    }
}

#[async_trait]
impl LocalTrack for LoopbackLocalTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn layer(&self) -> Option<VideoLayer> {
        self.layer
    }

    async fn write_sample(&self, sample: &Sample) -> Result<()> {
        let samples = (sample.duration.as_secs_f64() * self.clock_rate as f64) as u32;
        let packets = self
            .packetizer
            .lock()
            .await
            .packetize(&sample.data, samples)?;

        let sent_at = Instant::now();
        for packet in packets {
            // no subscribers is not an error
            let _ = self.packets.send(ForwardedPacket { packet, sent_at });
        }
        Ok(())
    }
}

pub(crate) struct PublishedLayer {
    pub(crate) height: u32,
    pub(crate) packets: broadcast::Sender<ForwardedPacket>,
}

/// PublishedTrack is the SFU side of a publication.
pub(crate) struct PublishedTrack {
    pub(crate) sid: String,
    pub(crate) name: String,
    pub(crate) kind: TrackKind,
    pub(crate) source: TrackSource,
    pub(crate) mime_type: String,
    pub(crate) clock_rate: u32,
    pub(crate) publisher: ParticipantInfo,
    /// lowest resolution first
    pub(crate) layers: Vec<PublishedLayer>,
    pub(crate) unpublished: CancellationToken,
    pub(crate) plis: AtomicU64,
}

impl PublishedTrack {
    pub(crate) fn codec(&self) -> RemoteCodec {
        RemoteCodec {
            mime_type: self.mime_type.clone(),
            clock_rate: self.clock_rate,
            payload_type: payload_type_for(&self.mime_type).unwrap_or_default(),
        }
    }

    /// Index of the smallest layer at least `height` tall, else the largest.
    pub(crate) fn layer_for_height(&self, height: u32) -> usize {
        self.layers
            .iter()
            .position(|layer| layer.height >= height)
            .unwrap_or(self.layers.len().saturating_sub(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LayerSelection {
    pub(crate) enabled: bool,
    pub(crate) layer: usize,
}

/// LoopbackPublication is one subscriber's view of a published track.
pub(crate) struct LoopbackPublication {
    me: Weak<LoopbackPublication>,
    track: Arc<PublishedTrack>,
    subscriber: Weak<ParticipantState>,
    shared: Arc<Shared>,
    selection: watch::Sender<LayerSelection>,
    subscription: Mutex<Option<CancellationToken>>,
}

impl LoopbackPublication {
    pub(crate) fn new(
        track: Arc<PublishedTrack>,
        subscriber: Weak<ParticipantState>,
        shared: Arc<Shared>,
    ) -> Arc<Self> {
        let (selection, _) = watch::channel(LayerSelection {
            enabled: true,
            layer: track.layers.len().saturating_sub(1),
        });
        Arc::new_cyclic(|me| LoopbackPublication {
            me: me.clone(),
            track,
            subscriber,
            shared,
            selection,
            subscription: Mutex::new(None),
        })
    }

    pub(crate) fn selection(&self) -> LayerSelection {
        *self.selection.borrow()
    }
}

#[async_trait]
impl RemoteTrackPublication for LoopbackPublication {
    fn sid(&self) -> &str {
        &self.track.sid
    }

    fn name(&self) -> &str {
        &self.track.name
    }

    fn kind(&self) -> TrackKind {
        self.track.kind
    }

    fn source(&self) -> TrackSource {
        self.track.source
    }

    fn mime_type(&self) -> &str {
        &self.track.mime_type
    }

    fn is_simulcasted(&self) -> bool {
        self.track.layers.len() > 1
    }

    async fn set_subscribed(&self, subscribed: bool) -> Result<()> {
        let mut subscription = self.subscription.lock().await;

        if !subscribed {
            if let Some(token) = subscription.take() {
                token.cancel();
            }
            return Ok(());
        }
        if subscription.is_some() {
            return Ok(());
        }

        let subscriber = self.subscriber.upgrade().ok_or(Error::ErrRoomClosed)?;
        if self.track.unpublished.is_cancelled() {
            subscriber.send(RoomEvent::TrackSubscriptionFailed {
                track_sid: self.track.sid.clone(),
                participant: self.track.publisher.clone(),
                error: "track is unpublished".to_owned(),
            });
            return Ok(());
        }
        let publication = self.me.upgrade().ok_or(Error::ErrRoomClosed)?;

        let token = subscriber.cancel.child_token();
        *subscription = Some(token.clone());

        let track = LoopbackRemoteTrack::new(
            self.track.clone(),
            self.selection.subscribe(),
            token,
            self.shared.clone(),
        );
        subscriber.send(RoomEvent::TrackSubscribed {
            track: Box::new(track),
            publication,
            participant: self.track.publisher.clone(),
        });
        Ok(())
    }

    async fn set_video_dimensions(&self, _width: u32, height: u32) -> Result<()> {
        let layer = self.track.layer_for_height(height);
        self.selection.send_modify(|selection| selection.layer = layer);
        Ok(())
    }

    async fn set_enabled(&self, enabled: bool) -> Result<()> {
        self.selection
            .send_modify(|selection| selection.enabled = enabled);
        Ok(())
    }

    async fn write_pli(&self, media_ssrc: u32) -> Result<()> {
        trace!("pli for {} (ssrc {media_ssrc})", self.track.sid);
        self.track.plis.fetch_add(1, Ordering::Relaxed);
        self.shared.plis.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// LoopbackRemoteTrack reads the selected layer of a publication with
/// per-subscriber sequence numbers and ssrc, delayed by the forwarding
/// delay model.
pub(crate) struct LoopbackRemoteTrack {
    track: Arc<PublishedTrack>,
    selection: watch::Receiver<LayerSelection>,
    current: Option<(usize, broadcast::Receiver<ForwardedPacket>)>,
    cancel: CancellationToken,
    shared: Arc<Shared>,
    ssrc: u32,
    sequence_number: u16,
}

impl LoopbackRemoteTrack {
    fn new(
        track: Arc<PublishedTrack>,
        selection: watch::Receiver<LayerSelection>,
        cancel: CancellationToken,
        shared: Arc<Shared>,
    ) -> Self {
        shared.subscriptions.fetch_add(1, Ordering::Relaxed);
        // subscribe right away so nothing written after the subscription is missed
        let initial = *selection.borrow();
        let current = track
            .layers
            .get(initial.layer)
            .filter(|_| initial.enabled)
            .map(|layer| (initial.layer, layer.packets.subscribe()));
        LoopbackRemoteTrack {
            track,
            selection,
            current,
            cancel,
            shared,
            ssrc: rand::random::<u32>(),
            sequence_number: rand::random::<u16>(),
        }
    }

    fn forwarding_delay(&self) -> Duration {
        self.shared.forwarding_delay()
    }
}

impl Drop for LoopbackRemoteTrack {
    fn drop(&mut self) {
        self.shared.subscriptions.fetch_sub(1, Ordering::Relaxed);
    }
}

#[async_trait]
impl RemoteTrack for LoopbackRemoteTrack {
    fn id(&self) -> &str {
        &self.track.sid
    }

    fn kind(&self) -> TrackKind {
        self.track.kind
    }

    fn ssrc(&self) -> u32 {
        self.ssrc
    }

    fn codec(&self) -> RemoteCodec {
        self.track.codec()
    }

    async fn read_rtp(&mut self) -> Result<Packet> {
        loop {
            let selection = *self.selection.borrow_and_update();

            if !selection.enabled {
                self.current = None;
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        return Err(Error::ErrRtpReadTerminated("unsubscribed".to_owned()));
                    }
                    _ = self.track.unpublished.cancelled() => {
                        return Err(Error::ErrRtpReadTerminated("track unpublished".to_owned()));
                    }
                    changed = self.selection.changed() => {
                        if changed.is_err() {
                            return Err(Error::ErrRtpReadTerminated("publication closed".to_owned()));
                        }
                        continue;
                    }
                }
            }

            if self.current.as_ref().map(|(layer, _)| *layer) != Some(selection.layer) {
                let layer = self
                    .track
                    .layers
                    .get(selection.layer)
                    .ok_or_else(|| Error::ErrTrackNotFound(self.track.sid.clone()))?;
                self.current = Some((selection.layer, layer.packets.subscribe()));
            }
            let Some((_, packets)) = self.current.as_mut() else {
                continue;
            };

            let received = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return Err(Error::ErrRtpReadTerminated("unsubscribed".to_owned()));
                }
                _ = self.track.unpublished.cancelled() => {
                    return Err(Error::ErrRtpReadTerminated("track unpublished".to_owned()));
                }
                changed = self.selection.changed() => {
                    if changed.is_err() {
                        return Err(Error::ErrRtpReadTerminated("publication closed".to_owned()));
                    }
                    continue;
                }
                received = packets.recv() => received,
            };

            match received {
                Ok(forwarded) => {
                    let due = forwarded.sent_at + self.forwarding_delay();
                    tokio::time::sleep_until(due).await;

                    let mut packet = forwarded.packet;
                    packet.header.ssrc = self.ssrc;
                    packet.header.sequence_number = self.sequence_number;
                    self.sequence_number = self.sequence_number.wrapping_add(1);
                    return Ok(packet);
                }
                Err(RecvError::Lagged(skipped)) => {
                    // the subscriber fell behind, the skipped packets are lost
                    self.sequence_number = self.sequence_number.wrapping_add(skipped as u16);
                }
                Err(RecvError::Closed) => {
                    return Err(Error::ErrRtpReadTerminated("publisher left".to_owned()));
                }
            }
        }
    }
}
