//! Media source library.
//!
//! Encoded media is looped from in-memory resources so that a single process
//! can feed thousands of publishers without touching the disk after start-up.


pub mod h26x_reader;
pub mod ivf_reader;
pub mod looper;
pub mod ogg_reader;
pub mod resources;
pub mod sample_builder;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use looper::{CountingSource, H26xLooper, IvfLooper, OpusLooper, SampleProvider};
use resources::{MemoryResources, ResourceProvider};

pub const MIME_TYPE_H264: &str = "video/H264";
pub const MIME_TYPE_HEVC: &str = "video/H265";
pub const MIME_TYPE_VP8: &str = "video/VP8";
pub const MIME_TYPE_OPUS: &str = "audio/opus";

pub const VIDEO_CLOCK_RATE: u32 = 90000;
pub const OPUS_CLOCK_RATE: u32 = 48000;
pub const OPUS_FRAME_DURATION: Duration = Duration::from_millis(20);

/// Name of the looped speech resource.
pub const AUDIO_RESOURCE: &str = "speech.ogg";

/// Size of the send timestamp trailer appended to timestamped audio payloads.
pub const SEND_TIMESTAMP_LEN: usize = 8;

/// Sample is one unit of encoded media with its presentation duration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sample {
    pub data: Bytes,
    pub duration: Duration,
}

/// Nanoseconds since the unix epoch, as written into send timestamp trailers.
pub fn unix_nanos_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    #[default]
    H264,
    H265,
    VP8,
}

impl VideoCodec {
    pub fn mime_type(&self) -> &'static str {
        match self {
            VideoCodec::H264 => MIME_TYPE_H264,
            VideoCodec::H265 => MIME_TYPE_HEVC,
            VideoCodec::VP8 => MIME_TYPE_VP8,
        }
    }

    /// File extension of looped resources encoded with this codec.
    pub fn extension(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "h264",
            VideoCodec::H265 => "h265",
            VideoCodec::VP8 => "ivf",
        }
    }
}

impl fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VideoCodec::H264 => "h264",
            VideoCodec::H265 => "h265",
            VideoCodec::VP8 => "vp8",
        };
        write!(f, "{s}")
    }
}

impl FromStr for VideoCodec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "h264" | "video/h264" => Ok(VideoCodec::H264),
            "h265" | "hevc" | "video/h265" => Ok(VideoCodec::H265),
            "vp8" | "video/vp8" => Ok(VideoCodec::VP8),
            other => Err(Error::ErrUnsupportedCodec(other.to_owned())),
        }
    }
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoResolution {
    Low,
    Medium,
    #[default]
    High,
}

impl VideoResolution {
    pub fn height(&self) -> u32 {
        match self {
            VideoResolution::Low => 180,
            VideoResolution::Medium => 360,
            VideoResolution::High => 720,
        }
    }

    /// Resolutions published as simulcast layers, lowest first.
    pub fn layers() -> [VideoResolution; 3] {
        [
            VideoResolution::Low,
            VideoResolution::Medium,
            VideoResolution::High,
        ]
    }
}

impl fmt::Display for VideoResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VideoResolution::Low => "low",
            VideoResolution::Medium => "medium",
            VideoResolution::High => "high",
        };
        write!(f, "{s}")
    }
}

impl FromStr for VideoResolution {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(VideoResolution::Low),
            "medium" | "mid" => Ok(VideoResolution::Medium),
            "high" => Ok(VideoResolution::High),
            other => Err(Error::ErrInvalidConfig(format!(
                "unknown video resolution {other}"
            ))),
        }
    }
}

/// VideoLayer describes one encoding of a (possibly simulcast) video track.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct VideoLayer {
    pub quality: VideoResolution,
    pub width: u32,
    pub height: u32,
    pub bitrate: u32,
}

/// VideoSpec is one entry of the encoded video catalog.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct VideoSpec {
    pub codec: VideoCodec,
    pub resolution: VideoResolution,
    pub width: u32,
    pub height: u32,
    /// Target bitrate in kbps.
    pub kbps: u32,
    pub fps: u32,
}

impl VideoSpec {
    fn new(codec: VideoCodec, resolution: VideoResolution, kbps: u32) -> Self {
        let height = resolution.height();
        Self {
            codec,
            resolution,
            width: height * 16 / 9,
            height,
            kbps,
            fps: DEFAULT_FPS,
        }
    }

    /// Resource name, e.g. `butterfly_720_2000.h264`.
    pub fn resource_name(&self) -> String {
        format!(
            "butterfly_{}_{}.{}",
            self.height,
            self.kbps,
            self.codec.extension()
        )
    }

    pub fn frame_duration(&self) -> Duration {
        Duration::from_secs(1) / self.fps.max(1)
    }

    pub fn layer(&self) -> VideoLayer {
        VideoLayer {
            quality: self.resolution,
            width: self.width,
            height: self.height,
            bitrate: self.kbps * 1000,
        }
    }
}

const DEFAULT_FPS: u32 = 30;

/// Catalog of looped encodings for every supported codec and resolution.
pub fn video_catalog() -> Vec<VideoSpec> {
    let mut specs = vec![];
    for codec in [VideoCodec::H264, VideoCodec::H265, VideoCodec::VP8] {
        for (resolution, kbps) in [
            (VideoResolution::Low, 150),
            (VideoResolution::Medium, 400),
            (VideoResolution::High, 2000),
        ] {
            specs.push(VideoSpec::new(codec, resolution, kbps));
        }
    }
    specs
}

/// MediaLibrary hands out fresh loopers over a shared set of resources.
#[derive(Clone)]
pub struct MediaLibrary {
    resources: Arc<dyn ResourceProvider>,
    catalog: Vec<VideoSpec>,
}

impl MediaLibrary {
    pub fn new(resources: Arc<dyn ResourceProvider>) -> Self {
        Self {
            resources,
            catalog: video_catalog(),
        }
    }

    /// A library over generated bitstreams, for tests and demos that ship no
    /// media files.
    pub fn synthetic() -> Self {
        Self::new(Arc::new(MemoryResources::synthetic()))
    }

    pub fn video_spec(&self, codec: VideoCodec, resolution: VideoResolution) -> Result<VideoSpec> {
        self.catalog
            .iter()
            .find(|spec| spec.codec == codec && spec.height == resolution.height())
            .copied()
            .ok_or_else(|| Error::ErrUnsupportedCodec(format!("{codec} at {resolution}")))
    }

    /// Returns one looper per layer, lowest resolution first. Simulcast
    /// always yields every layer regardless of `resolution`.
    pub fn video_loopers(
        &self,
        resolution: VideoResolution,
        codec: VideoCodec,
        simulcast: bool,
    ) -> Result<Vec<Box<dyn SampleProvider>>> {
        let resolutions = if simulcast {
            VideoResolution::layers().to_vec()
        } else {
            vec![resolution]
        };

        let mut loopers = Vec::with_capacity(resolutions.len());
        for resolution in resolutions {
            let spec = self.video_spec(codec, resolution)?;
            let data = self.resources.load(&spec.resource_name())?;
            let looper: Box<dyn SampleProvider> = match codec {
                VideoCodec::H264 | VideoCodec::H265 => Box::new(H26xLooper::new(data, spec)?),
                VideoCodec::VP8 => Box::new(IvfLooper::new(data, spec)?),
            };
            loopers.push(looper);
        }
        Ok(loopers)
    }

    pub fn audio_looper(&self) -> Result<Box<dyn SampleProvider>> {
        let data = self.resources.load(AUDIO_RESOURCE)?;
        Ok(Box::new(OpusLooper::new(data, false)?))
    }

    /// Audio looper whose payloads carry a send timestamp trailer, used to
    /// measure end-to-end latency.
    pub fn timestamped_audio_looper(&self) -> Result<Box<dyn SampleProvider>> {
        let data = self.resources.load(AUDIO_RESOURCE)?;
        Ok(Box::new(OpusLooper::new(data, true)?))
    }

    /// Synthetic audio-clocked source sized to `bitrate` bits per second.
    pub fn counting_source(&self, bitrate: u32) -> CountingSource {
        CountingSource::new(bitrate, OPUS_FRAME_DURATION)
    }
}

impl fmt::Debug for MediaLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaLibrary")
            .field("catalog", &self.catalog.len())
            .finish()
    }
}
