
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};

use super::h26x_reader::{H26xReader, NAL_PREFIX_4BYTES, Nal};
use super::ivf_reader::IVFReader;
use super::ogg_reader::OggReader;
use super::{
    MIME_TYPE_OPUS, OPUS_CLOCK_RATE, OPUS_FRAME_DURATION, SEND_TIMESTAMP_LEN, Sample,
    VIDEO_CLOCK_RATE, VideoCodec, VideoLayer, VideoSpec, unix_nanos_now,
};
use crate::error::{Error, Result};

/// SampleProvider yields encoded samples forever, restarting at end of input.
pub trait SampleProvider: Send {
    fn next_sample(&mut self) -> Result<Sample>;

    fn mime_type(&self) -> &'static str;

    fn clock_rate(&self) -> u32;

    /// Simulcast layer described by this provider, video only.
    fn layer(&self) -> Option<VideoLayer> {
        None
    }
}

/// H26xLooper emits one Annex-B access unit per sample.
pub struct H26xLooper {
    reader: H26xReader,
    pending: Option<Nal>,
    spec: VideoSpec,
}

impl H26xLooper {
    pub fn new(data: Bytes, spec: VideoSpec) -> Result<Self> {
        let is_hevc = match spec.codec {
            VideoCodec::H264 => false,
            VideoCodec::H265 => true,
            VideoCodec::VP8 => return Err(Error::ErrUnsupportedCodec(spec.codec.to_string())),
        };
        Ok(H26xLooper {
            reader: H26xReader::new(data, is_hevc)?,
            pending: None,
            spec,
        })
    }
}

impl SampleProvider for H26xLooper {
    fn next_sample(&mut self) -> Result<Sample> {
        let mut access_unit = BytesMut::new();
        let mut has_picture = false;
        let mut rewinds = 0;

        loop {
            let nal = match self.pending.take() {
                Some(nal) => nal,
                None => match self.reader.next_nal() {
                    Some(nal) => nal,
                    None => {
                        self.reader.rewind();
                        if has_picture {
                            break;
                        }
                        rewinds += 1;
                        if rewinds > 1 {
                            return Err(self.reader.not_a_stream());
                        }
                        continue;
                    }
                },
            };

            if has_picture && nal.starts_access_unit() {
                self.pending = Some(nal);
                break;
            }

            has_picture |= nal.is_vcl();
            access_unit.put_slice(&NAL_PREFIX_4BYTES);
            access_unit.put_slice(&nal.data);
        }

        Ok(Sample {
            data: access_unit.freeze(),
            duration: self.spec.frame_duration(),
        })
    }

    fn mime_type(&self) -> &'static str {
        self.spec.codec.mime_type()
    }

    fn clock_rate(&self) -> u32 {
        VIDEO_CLOCK_RATE
    }

    fn layer(&self) -> Option<VideoLayer> {
        Some(self.spec.layer())
    }
}

/// IvfLooper emits one VP8 frame per sample.
pub struct IvfLooper {
    reader: IVFReader,
    frame_duration: Duration,
    spec: VideoSpec,
}

impl IvfLooper {
    pub fn new(data: Bytes, spec: VideoSpec) -> Result<Self> {
        let (reader, header) = IVFReader::new(data)?;
        let frame_duration = if header.timebase_denominator > 0 && header.timebase_numerator > 0 {
            Duration::from_secs_f64(
                header.timebase_numerator as f64 / header.timebase_denominator as f64,
            )
        } else {
            spec.frame_duration()
        };
        Ok(IvfLooper {
            reader,
            frame_duration,
            spec,
        })
    }
}

impl SampleProvider for IvfLooper {
    fn next_sample(&mut self) -> Result<Sample> {
        let frame = match self.reader.parse_next_frame()? {
            Some((frame, _)) => frame,
            None => {
                self.reader.rewind();
                let (frame, _) = self
                    .reader
                    .parse_next_frame()?
                    .ok_or(Error::ErrIvfIncompleteFrame)?;
                frame
            }
        };
        Ok(Sample {
            data: frame,
            duration: self.frame_duration,
        })
    }

    fn mime_type(&self) -> &'static str {
        self.spec.codec.mime_type()
    }

    fn clock_rate(&self) -> u32 {
        VIDEO_CLOCK_RATE
    }

    fn layer(&self) -> Option<VideoLayer> {
        Some(self.spec.layer())
    }
}

/// OpusLooper emits one Ogg page payload per sample, timed by the granule
/// position delta.
pub struct OpusLooper {
    reader: OggReader,
    audio_start: u64,
    last_granule: u64,
    with_send_timestamp: bool,
}

impl OpusLooper {
    /// With `with_send_timestamp` every payload is followed by the wall clock
    /// send time in nanoseconds, little endian.
    pub fn new(data: Bytes, with_send_timestamp: bool) -> Result<Self> {
        let (mut reader, _) = OggReader::new(data, true)?;

        let mut audio_start = reader.position();
        while let Some((payload, page)) = reader.parse_next_page()? {
            if !page.is_opus_header(&payload) {
                break;
            }
            audio_start = reader.position();
        }
        reader.seek(audio_start);

        Ok(OpusLooper {
            reader,
            audio_start,
            last_granule: 0,
            with_send_timestamp,
        })
    }
}

impl SampleProvider for OpusLooper {
    fn next_sample(&mut self) -> Result<Sample> {
        let (payload, page) = match self.reader.parse_next_page()? {
            Some(page) => page,
            None => {
                self.reader.seek(self.audio_start);
                self.last_granule = 0;
                self.reader
                    .parse_next_page()?
                    .ok_or(Error::ErrNotFound("opus audio page".to_owned()))?
            }
        };

        let samples = page.granule_position.saturating_sub(self.last_granule);
        self.last_granule = page.granule_position;
        let duration = if samples == 0 || samples > OPUS_CLOCK_RATE as u64 {
            OPUS_FRAME_DURATION
        } else {
            Duration::from_micros(samples * 1_000_000 / OPUS_CLOCK_RATE as u64)
        };

        let data = if self.with_send_timestamp {
            let mut buf = BytesMut::with_capacity(payload.len() + SEND_TIMESTAMP_LEN);
            buf.put_slice(&payload);
            buf.put_i64_le(unix_nanos_now());
            buf.freeze()
        } else {
            payload
        };

        Ok(Sample { data, duration })
    }

    fn mime_type(&self) -> &'static str {
        MIME_TYPE_OPUS
    }

    fn clock_rate(&self) -> u32 {
        OPUS_CLOCK_RATE
    }
}

/// CountingSource produces audio-clocked payloads sized to a target
/// bitrate. Each payload starts with a little endian counter and ends with
/// the send timestamp trailer.
#[derive(Debug, Clone)]
pub struct CountingSource {
    counter: u64,
    payload_size: usize,
    duration: Duration,
}

impl CountingSource {
    pub fn new(bitrate: u32, duration: Duration) -> Self {
        let bytes_per_sample = (bitrate as f64 / 8.0 * duration.as_secs_f64()) as usize;
        CountingSource {
            counter: 0,
            payload_size: bytes_per_sample.max(2 * SEND_TIMESTAMP_LEN),
            duration,
        }
    }

    pub fn payload_size(&self) -> usize {
        self.payload_size
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }
}

impl SampleProvider for CountingSource {
    fn next_sample(&mut self) -> Result<Sample> {
        let mut buf = BytesMut::with_capacity(self.payload_size);
        buf.put_u64_le(self.counter);
        buf.put_bytes(self.counter as u8, self.payload_size - 2 * SEND_TIMESTAMP_LEN);
        buf.put_i64_le(unix_nanos_now());
        self.counter += 1;

        Ok(Sample {
            data: buf.freeze(),
            duration: self.duration,
        })
    }

    fn mime_type(&self) -> &'static str {
        MIME_TYPE_OPUS
    }

    fn clock_rate(&self) -> u32 {
        OPUS_CLOCK_RATE
    }
}

/// Reads the send timestamp trailer of a payload, if it is long enough to
/// carry one.
pub fn send_timestamp(payload: &[u8]) -> Option<i64> {
    if payload.len() < SEND_TIMESTAMP_LEN {
        return None;
    }
    let mut trailer = [0u8; SEND_TIMESTAMP_LEN];
    trailer.copy_from_slice(&payload[payload.len() - SEND_TIMESTAMP_LEN..]);
    Some(i64::from_le_bytes(trailer))
}
