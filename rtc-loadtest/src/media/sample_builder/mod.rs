#[cfg(test)]
mod sample_builder_test;

use std::collections::BTreeMap;

use webrtc::rtp::codecs::h264::H264Packet;
use webrtc::rtp::codecs::h265::H265Packet;
use webrtc::rtp::codecs::opus::OpusPacket;
use webrtc::rtp::codecs::vp8::Vp8Packet;
use webrtc::rtp::packet::Packet;
use webrtc::rtp::packetizer::Depacketizer;

use crate::error::{Error, Result};
use crate::sequence::SequenceUnwrapper;

/// Reorder window for audio tracks, in packets.
pub const MAX_LATE_AUDIO: u16 = 16;
/// Reorder window for video tracks, in packets.
pub const MAX_LATE_VIDEO: u16 = 256;

/// Returns the depacketizer used to find sample boundaries for `mime_type`.
pub fn depacketizer_for(mime_type: &str) -> Result<Box<dyn Depacketizer + Send>> {
    match mime_type.to_ascii_lowercase().as_str() {
        "video/h264" => Ok(Box::new(H264Packet::default())),
        "video/h265" | "video/hevc" => Ok(Box::new(H265Packet::default())),
        "video/vp8" => Ok(Box::new(Vp8Packet::default())),
        "audio/opus" => Ok(Box::new(OpusPacket)),
        other => Err(Error::ErrUnsupportedCodec(other.to_owned())),
    }
}

/// SampleBuilder reassembles RTP packets into complete samples.
///
/// Packets are buffered by unwrapped sequence number. A sample is released
/// once every packet from its partition head to its partition tail is
/// present. A gap that stays open for more than `max_late` packets is given
/// up on and counted as one drop.
pub struct SampleBuilder {
    max_late: u64,
    depacketizer: Box<dyn Depacketizer + Send>,
    sequence: SequenceUnwrapper,
    packets: BTreeMap<u64, Packet>,
    head: Option<u64>,
    dropped: u64,
}

impl SampleBuilder {
    pub fn new(max_late: u16, depacketizer: Box<dyn Depacketizer + Send>) -> Self {
        SampleBuilder {
            max_late: max_late.max(1) as u64,
            depacketizer,
            sequence: SequenceUnwrapper::new(),
            packets: BTreeMap::new(),
            head: None,
            dropped: 0,
        }
    }

    pub fn push(&mut self, packet: Packet) {
        let seq = self.sequence.unwrap(packet.header.sequence_number);
        match self.head {
            Some(head) if seq < head => return,
            Some(_) => {}
            None => self.head = Some(seq),
        }
        self.packets.entry(seq).or_insert(packet);
    }

    /// Returns the packets of the next complete sample, in order.
    pub fn pop_packets(&mut self) -> Option<Vec<Packet>> {
        loop {
            let head = self.head?;

            let Some(first) = self.packets.get(&head) else {
                if self.is_too_late(head) {
                    self.skip_to_next_buffered();
                    continue;
                }
                return None;
            };

            if !self.depacketizer.is_partition_head(&first.payload) {
                // continuation of a sample whose head was lost
                self.packets.remove(&head);
                self.head = Some(head + 1);
                continue;
            }

            let mut tail = head;
            loop {
                let Some(packet) = self.packets.get(&tail) else {
                    if self.is_too_late(tail) {
                        // the gap at `tail` is counted once it reaches the head
                        self.discard(head, tail);
                        break;
                    }
                    return None;
                };
                if self
                    .depacketizer
                    .is_partition_tail(packet.header.marker, &packet.payload)
                {
                    let sample = (head..=tail)
                        .filter_map(|seq| self.packets.remove(&seq))
                        .collect();
                    self.head = Some(tail + 1);
                    return Some(sample);
                }
                tail += 1;
            }
        }
    }

    /// Returns and resets the number of samples dropped since the last call.
    pub fn take_dropped(&mut self) -> u64 {
        std::mem::take(&mut self.dropped)
    }

    fn is_too_late(&self, seq: u64) -> bool {
        self.sequence
            .highest()
            .is_some_and(|highest| highest >= seq + self.max_late)
    }

    fn skip_to_next_buffered(&mut self) {
        let Some(head) = self.head else {
            return;
        };
        let next = self
            .packets
            .range(head..)
            .next()
            .map(|(seq, _)| *seq)
            .or_else(|| self.sequence.highest().map(|h| h + 1));
        self.head = next;
        self.dropped += 1;
    }

    fn discard(&mut self, from: u64, to: u64) {
        for seq in from..to {
            self.packets.remove(&seq);
        }
        self.head = Some(to);
    }
}
