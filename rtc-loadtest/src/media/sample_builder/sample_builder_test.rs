use bytes::Bytes;
use webrtc::rtp::header::Header;

use super::*;

// =============================================================================
// Helper Functions
// =============================================================================

fn opus_packet(seq: u16) -> Packet {
    Packet {
        header: Header {
            sequence_number: seq,
            timestamp: seq as u32 * 960,
            payload_type: 111,
            marker: true,
            ..Default::default()
        },
        payload: Bytes::from(vec![0x78, seq as u8]),
    }
}

/// VP8 packet with a one byte payload descriptor carrying the S bit.
fn vp8_packet(seq: u16, start: bool, marker: bool) -> Packet {
    Packet {
        header: Header {
            sequence_number: seq,
            payload_type: 96,
            marker,
            ..Default::default()
        },
        payload: Bytes::from(vec![if start { 0x10 } else { 0x00 }, 0x9d, seq as u8]),
    }
}

fn seqs(sample: &[Packet]) -> Vec<u16> {
    sample.iter().map(|p| p.header.sequence_number).collect()
}

// =============================================================================
// Tests
// =============================================================================

#[test]
fn test_depacketizer_for_known_codecs() {
    for mime in ["video/H264", "video/H265", "video/VP8", "audio/opus"] {
        assert!(depacketizer_for(mime).is_ok(), "{mime}");
    }
    assert!(matches!(
        depacketizer_for("video/AV1"),
        Err(Error::ErrUnsupportedCodec(_))
    ));
}

#[test]
fn test_audio_samples_pop_in_order() {
    let mut builder = SampleBuilder::new(MAX_LATE_AUDIO, depacketizer_for("audio/opus").unwrap());
    builder.push(opus_packet(5));
    builder.push(opus_packet(7));
    assert_eq!(seqs(&builder.pop_packets().unwrap()), vec![5]);
    // 6 is missing and still within the reorder window
    assert!(builder.pop_packets().is_none());

    builder.push(opus_packet(6));
    assert_eq!(seqs(&builder.pop_packets().unwrap()), vec![6]);
    assert_eq!(seqs(&builder.pop_packets().unwrap()), vec![7]);
    assert!(builder.pop_packets().is_none());
    assert_eq!(builder.take_dropped(), 0);
}

#[test]
fn test_gap_beyond_max_late_is_dropped() {
    let mut builder = SampleBuilder::new(4, depacketizer_for("audio/opus").unwrap());
    builder.push(opus_packet(1));
    assert!(builder.pop_packets().is_some());

    // 2 never arrives
    for seq in 3..=5 {
        builder.push(opus_packet(seq));
        assert!(builder.pop_packets().is_none());
    }
    builder.push(opus_packet(6));
    let mut popped = vec![];
    while let Some(sample) = builder.pop_packets() {
        popped.extend(seqs(&sample));
    }
    assert_eq!(popped, vec![3, 4, 5, 6]);
    assert_eq!(builder.take_dropped(), 1);
    assert_eq!(builder.take_dropped(), 0);

    // too late to be useful
    builder.push(opus_packet(2));
    assert!(builder.pop_packets().is_none());
}

#[test]
fn test_video_sample_spans_packets() {
    let mut builder = SampleBuilder::new(MAX_LATE_VIDEO, depacketizer_for("video/VP8").unwrap());
    builder.push(vp8_packet(100, true, false));
    builder.push(vp8_packet(102, false, true));
    assert!(builder.pop_packets().is_none());

    builder.push(vp8_packet(101, false, false));
    assert_eq!(
        seqs(&builder.pop_packets().unwrap()),
        vec![100, 101, 102]
    );
    assert!(builder.pop_packets().is_none());
}

#[test]
fn test_video_sample_with_lost_middle_packet_is_dropped() {
    let mut builder = SampleBuilder::new(4, depacketizer_for("video/VP8").unwrap());
    builder.push(vp8_packet(10, true, false));
    // 11 is lost
    builder.push(vp8_packet(12, false, true));
    builder.push(vp8_packet(13, true, true));
    builder.push(vp8_packet(14, true, true));
    builder.push(vp8_packet(15, true, true));

    let mut popped = vec![];
    while let Some(sample) = builder.pop_packets() {
        popped.push(seqs(&sample));
    }
    assert_eq!(popped, vec![vec![13], vec![14], vec![15]]);
    assert_eq!(builder.take_dropped(), 1);
}

#[test]
fn test_samples_across_sequence_wrap() {
    let mut builder = SampleBuilder::new(MAX_LATE_AUDIO, depacketizer_for("audio/opus").unwrap());
    let mut popped = vec![];
    for seq in [65534u16, 65535, 0, 1] {
        builder.push(opus_packet(seq));
        while let Some(sample) = builder.pop_packets() {
            popped.extend(seqs(&sample));
        }
    }
    assert_eq!(popped, vec![65534, 65535, 0, 1]);
    assert_eq!(builder.take_dropped(), 0);
}
