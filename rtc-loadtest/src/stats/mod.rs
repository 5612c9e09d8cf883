//! Per-track receive statistics and their aggregation into tester and test
//! summaries.


pub mod format;
pub mod table;

use std::collections::{BTreeMap, HashSet};
use std::time::{Duration, Instant};

use serde::Serialize;
use webrtc::rtp::packet::Packet;

use crate::client::TrackKind;
use crate::media::looper::send_timestamp;
use crate::media::unix_nanos_now;
use crate::sequence::SequenceUnwrapper;

/// Default upper bound for an accepted one-way latency sample.
pub const LATENCY_WINDOW: Duration = Duration::from_millis(100);

/// How far below the first packet a late arrival may land and still be
/// accounted for instead of ignored as stale.
pub const MAX_ORIGIN_REWIND: u64 = 512;

/// TrackStats accumulates receive-quality counters for one subscribed track.
#[derive(Debug, Clone)]
pub struct TrackStats {
    pub track_id: String,
    pub name: String,
    pub kind: TrackKind,

    started_at: Option<Instant>,
    last_packet_at: Option<Instant>,

    sequence: SequenceUnwrapper,
    origin: Option<u64>,
    highest: Option<u64>,
    missing: HashSet<u64>,
    /// Samples at or above this are taken for clock skew.
    latency_window: Duration,

    packets: u64,
    bytes: u64,
    out_of_order: u64,
    dropped_samples: u64,
    latency_sum: Duration,
    latency_count: u64,
}

impl TrackStats {
    pub fn new(track_id: impl Into<String>, name: impl Into<String>, kind: TrackKind) -> Self {
        TrackStats {
            track_id: track_id.into(),
            name: name.into(),
            kind,
            started_at: None,
            last_packet_at: None,
            sequence: SequenceUnwrapper::new(),
            origin: None,
            highest: None,
            missing: HashSet::new(),
            latency_window: LATENCY_WINDOW,
            packets: 0,
            bytes: 0,
            out_of_order: 0,
            dropped_samples: 0,
            latency_sum: Duration::ZERO,
            latency_count: 0,
        }
    }

    pub fn with_latency_window(mut self, latency_window: Duration) -> Self {
        self.latency_window = latency_window;
        self
    }

    pub fn latency_window(&self) -> Duration {
        self.latency_window
    }

    /// Accounts one released packet. `partition_tail` marks the last packet
    /// of a sample.
    pub fn on_packet(&mut self, packet: &Packet, partition_tail: bool) {
        self.on_packet_at(
            packet.header.sequence_number,
            &packet.payload,
            partition_tail,
            Instant::now(),
            unix_nanos_now(),
        );
    }

    pub fn on_packet_at(
        &mut self,
        seq: u16,
        payload: &[u8],
        partition_tail: bool,
        now: Instant,
        now_unix_nanos: i64,
    ) {
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
        self.last_packet_at = Some(now);
        self.packets += 1;
        self.bytes += payload.len() as u64;

        self.account_sequence(seq);

        if self.kind == TrackKind::Audio && partition_tail {
            if let Some(sent_at) = send_timestamp(payload) {
                let latency = now_unix_nanos - sent_at;
                if latency > 0 && (latency as u128) < self.latency_window.as_nanos() {
                    self.latency_sum += Duration::from_nanos(latency as u64);
                    self.latency_count += 1;
                }
            }
        }
    }

    fn account_sequence(&mut self, seq: u16) {
        let ext = self.sequence.unwrap(seq);

        let (Some(origin), Some(highest)) = (self.origin, self.highest) else {
            self.origin = Some(ext);
            self.highest = Some(ext);
            return;
        };

        if ext > highest {
            self.missing.extend(highest + 1..ext);
            self.highest = Some(ext);
        } else if ext >= origin {
            // only a packet filling a gap is out of order, duplicates are not
            if self.missing.remove(&ext) {
                self.out_of_order += 1;
            }
        } else if origin - ext <= MAX_ORIGIN_REWIND {
            self.missing.extend(ext + 1..origin);
            self.origin = Some(ext);
        }
    }

    /// Counts samples the sample builder gave up on.
    pub fn on_samples_dropped(&mut self, count: u64) {
        self.dropped_samples += count;
    }

    /// Clears every counter and the sequence state. Identity and the latency
    /// window are kept.
    pub fn reset(&mut self) {
        let latency_window = self.latency_window;
        *self = TrackStats::new(
            std::mem::take(&mut self.track_id),
            std::mem::take(&mut self.name),
            self.kind,
        )
        .with_latency_window(latency_window);
    }

    pub fn packets(&self) -> u64 {
        self.packets
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Sequence numbers still missing inside the received range.
    pub fn dropped(&self) -> u64 {
        self.missing.len() as u64
    }

    pub fn out_of_order(&self) -> u64 {
        self.out_of_order
    }

    pub fn dropped_samples(&self) -> u64 {
        self.dropped_samples
    }

    pub fn latency_sum(&self) -> Duration {
        self.latency_sum
    }

    pub fn latency_count(&self) -> u64 {
        self.latency_count
    }

    pub fn mean_latency(&self) -> Option<Duration> {
        mean(self.latency_sum, self.latency_count)
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.started_at
    }

    pub fn last_packet_at(&self) -> Option<Instant> {
        self.last_packet_at
    }

    pub fn elapsed(&self, until: Instant) -> Duration {
        self.started_at
            .map(|started| until.saturating_duration_since(started))
            .unwrap_or_default()
    }

    /// Receive bitrate in bits per second over `[started_at, until]`.
    pub fn bitrate(&self, until: Instant) -> f64 {
        bitrate(self.bytes, self.elapsed(until))
    }

    pub fn summary(&self, until: Instant) -> TrackSummary {
        TrackSummary {
            track_id: self.track_id.clone(),
            name: self.name.clone(),
            kind: self.kind,
            packets: self.packets,
            bytes: self.bytes,
            dropped: self.dropped(),
            out_of_order: self.out_of_order,
            dropped_samples: self.dropped_samples,
            latency_sum: self.latency_sum,
            latency_count: self.latency_count,
            elapsed: self.elapsed(until),
            bitrate: self.bitrate(until),
        }
    }
}

fn mean(sum: Duration, count: u64) -> Option<Duration> {
    if count == 0 {
        return None;
    }
    Some(Duration::from_nanos((sum.as_nanos() / count as u128) as u64))
}

fn bitrate(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    bytes as f64 * 8.0 / secs
}

/// Loss percentage of `dropped` against everything that should have arrived.
pub fn loss_percent(dropped: u64, packets: u64) -> f64 {
    let expected = dropped + packets;
    if expected == 0 {
        return 0.0;
    }
    dropped as f64 * 100.0 / expected as f64
}

/// Snapshot of one track's counters.
#[derive(Debug, Clone, Serialize)]
pub struct TrackSummary {
    pub track_id: String,
    pub name: String,
    pub kind: TrackKind,
    pub packets: u64,
    pub bytes: u64,
    pub dropped: u64,
    pub out_of_order: u64,
    pub dropped_samples: u64,
    pub latency_sum: Duration,
    pub latency_count: u64,
    pub elapsed: Duration,
    /// bits per second
    pub bitrate: f64,
}

impl TrackSummary {
    pub fn mean_latency(&self) -> Option<Duration> {
        mean(self.latency_sum, self.latency_count)
    }
}

/// Stats of one tester at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct TesterStats {
    pub name: String,
    pub expected_tracks: usize,
    /// keyed by track id
    pub tracks: BTreeMap<String, TrackSummary>,
}

impl TesterStats {
    /// Tracks ordered by published track name.
    pub fn tracks_by_name(&self) -> Vec<&TrackSummary> {
        let mut tracks: Vec<&TrackSummary> = self.tracks.values().collect();
        tracks.sort_by(|a, b| a.name.cmp(&b.name).then(a.track_id.cmp(&b.track_id)));
        tracks
    }

    pub fn summary(&self) -> TesterSummary {
        let mut summary = TesterSummary {
            name: self.name.clone(),
            tracks: self.tracks.len(),
            expected_tracks: self.expected_tracks,
            ..Default::default()
        };
        for track in self.tracks.values() {
            summary.packets += track.packets;
            summary.bytes += track.bytes;
            summary.dropped += track.dropped;
            summary.out_of_order += track.out_of_order;
            summary.latency_sum += track.latency_sum;
            summary.latency_count += track.latency_count;
            summary.elapsed = summary.elapsed.max(track.elapsed);
            summary.bitrate += track.bitrate;
        }
        summary
    }
}

/// Per-tester aggregate.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TesterSummary {
    pub name: String,
    pub tracks: usize,
    pub expected_tracks: usize,
    pub packets: u64,
    pub bytes: u64,
    pub dropped: u64,
    pub out_of_order: u64,
    pub latency_sum: Duration,
    pub latency_count: u64,
    pub elapsed: Duration,
    /// Sum of the per-track bitrates, bits per second.
    pub bitrate: f64,
}

impl TesterSummary {
    pub fn mean_latency(&self) -> Option<Duration> {
        mean(self.latency_sum, self.latency_count)
    }

    /// Average bitrate of one track of this tester.
    pub fn track_bitrate(&self) -> f64 {
        if self.tracks == 0 {
            0.0
        } else {
            self.bitrate / self.tracks as f64
        }
    }
}

/// Whole-test aggregate over every tester summary.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TestSummary {
    pub testers: usize,
    pub tracks: usize,
    pub expected_tracks: usize,
    pub packets: u64,
    pub bytes: u64,
    pub dropped: u64,
    pub out_of_order: u64,
    pub latency_sum: Duration,
    pub latency_count: u64,
    pub elapsed: Duration,
    /// Sum of the tester bitrates, bits per second.
    pub bitrate: f64,
    /// Testers that failed to start or publish, with the reason.
    pub errors: BTreeMap<String, String>,
}

impl TestSummary {
    pub fn from_testers<'a>(testers: impl IntoIterator<Item = &'a TesterSummary>) -> Self {
        let mut summary = TestSummary::default();
        for tester in testers {
            summary.testers += 1;
            summary.tracks += tester.tracks;
            summary.expected_tracks += tester.expected_tracks;
            summary.packets += tester.packets;
            summary.bytes += tester.bytes;
            summary.dropped += tester.dropped;
            summary.out_of_order += tester.out_of_order;
            summary.latency_sum += tester.latency_sum;
            summary.latency_count += tester.latency_count;
            summary.elapsed = summary.elapsed.max(tester.elapsed);
            summary.bitrate += tester.bitrate;
        }
        summary
    }

    pub fn mean_latency(&self) -> Option<Duration> {
        mean(self.latency_sum, self.latency_count)
    }

    pub fn loss_percent(&self) -> f64 {
        loss_percent(self.dropped, self.packets)
    }
}
