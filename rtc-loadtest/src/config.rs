//! Load test configuration.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::media::{VideoCodec, VideoResolution};
use crate::stats::LATENCY_WINDOW;

pub const DEFAULT_NUM_PER_SECOND: f64 = 5.0;
pub const DEFAULT_SUITE_CASE_DURATION: Duration = Duration::from_secs(15);
pub const DEFAULT_CHECKPOINT_WINDOW: Duration = Duration::from_secs(30);
pub const DEFAULT_TRACK_BUDGET: u32 = 5000;

const IDENTITY_PREFIX_LEN: usize = 5;

/// Layout is the rendering pattern a subscriber emulates.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Layout {
    #[default]
    #[serde(rename = "speaker")]
    Speaker,
    #[serde(rename = "3x3")]
    Grid3x3,
    #[serde(rename = "4x4")]
    Grid4x4,
    #[serde(rename = "5x5")]
    Grid5x5,
}

impl Layout {
    /// Number of remote participants a subscriber renders.
    pub fn max_subscriptions(&self) -> usize {
        match self {
            Layout::Speaker => 6,
            Layout::Grid3x3 => 9,
            Layout::Grid4x4 => 16,
            Layout::Grid5x5 => 25,
        }
    }

    /// Quality of the next video track given what has been assigned so far.
    pub fn next_quality(&self, assigned: &QualityCounts) -> QualityTarget {
        match self {
            Layout::Speaker => {
                if assigned.high == 0 {
                    QualityTarget::High
                } else if assigned.low < 5 {
                    QualityTarget::Low
                } else {
                    QualityTarget::Off
                }
            }
            Layout::Grid3x3 if assigned.medium < 9 => QualityTarget::Medium,
            Layout::Grid4x4 if assigned.low < 16 => QualityTarget::Low,
            Layout::Grid5x5 if assigned.low < 25 => QualityTarget::Low,
            _ => QualityTarget::Off,
        }
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Layout::Speaker => "speaker",
            Layout::Grid3x3 => "3x3",
            Layout::Grid4x4 => "4x4",
            Layout::Grid5x5 => "5x5",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Layout {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "speaker" => Ok(Layout::Speaker),
            "3x3" => Ok(Layout::Grid3x3),
            "4x4" => Ok(Layout::Grid4x4),
            "5x5" => Ok(Layout::Grid5x5),
            other => Err(Error::ErrInvalidConfig(format!("unknown layout {other}"))),
        }
    }
}

/// QualityTarget is the receive quality requested for a remote video track.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QualityTarget {
    Off,
    Low,
    Medium,
    High,
}

impl QualityTarget {
    /// Requested dimensions, `None` when the track is disabled.
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        match self {
            QualityTarget::Off => None,
            QualityTarget::Low => Some((320, 180)),
            QualityTarget::Medium => Some((640, 360)),
            QualityTarget::High => Some((1280, 720)),
        }
    }
}

impl fmt::Display for QualityTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QualityTarget::Off => "OFF",
            QualityTarget::Low => "LOW",
            QualityTarget::Medium => "MEDIUM",
            QualityTarget::High => "HIGH",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct QualityCounts {
    pub off: usize,
    pub low: usize,
    pub medium: usize,
    pub high: usize,
}

impl QualityCounts {
    pub fn tally<'a>(targets: impl IntoIterator<Item = &'a QualityTarget>) -> Self {
        let mut counts = QualityCounts::default();
        for target in targets {
            match target {
                QualityTarget::Off => counts.off += 1,
                QualityTarget::Low => counts.low += 1,
                QualityTarget::Medium => counts.medium += 1,
                QualityTarget::High => counts.high += 1,
            }
        }
        counts
    }
}

pub(crate) mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// LoadTestParams configures one load test run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadTestParams {
    pub url: String,
    pub api_key: String,
    pub api_secret: String,
    /// Generated as `testroomNNN` when empty.
    pub room: String,
    /// Five random lowercase letters when empty.
    pub identity_prefix: String,

    pub video_publishers: usize,
    pub audio_publishers: usize,
    pub subscribers: usize,
    /// Whether publishers also subscribe to each other.
    pub publisher_subscribe: bool,

    pub video_resolution: VideoResolution,
    /// `None` uses H.264.
    pub video_codec: Option<VideoCodec>,
    pub simulcast: bool,

    /// Testers started per second.
    pub num_per_second: f64,
    pub layout: Layout,
    /// Zero runs until cancelled.
    #[serde(with = "duration_secs")]
    pub duration: Duration,
    pub attributes: HashMap<String, String>,
}

impl Default for LoadTestParams {
    fn default() -> Self {
        LoadTestParams {
            url: String::new(),
            api_key: String::new(),
            api_secret: String::new(),
            room: String::new(),
            identity_prefix: String::new(),
            video_publishers: 0,
            audio_publishers: 0,
            subscribers: 0,
            publisher_subscribe: false,
            video_resolution: VideoResolution::High,
            video_codec: None,
            simulcast: true,
            num_per_second: DEFAULT_NUM_PER_SECOND,
            layout: Layout::Speaker,
            duration: Duration::ZERO,
            attributes: HashMap::new(),
        }
    }
}

impl LoadTestParams {
    pub fn publishers(&self) -> usize {
        self.video_publishers.max(self.audio_publishers)
    }

    pub fn testers(&self) -> usize {
        self.publishers() + self.subscribers
    }

    /// Tracks every subscriber should end up receiving. A simulcast
    /// publication counts once.
    pub fn expected_tracks(&self) -> usize {
        self.video_publishers + self.audio_publishers
    }

    pub fn codec(&self) -> VideoCodec {
        self.video_codec.unwrap_or_default()
    }

    /// Rejects configurations that cannot run, before any tester exists.
    pub fn validate(&self) -> Result<()> {
        if self.url.is_empty() {
            return Err(Error::ErrInvalidConfig("url is required".to_owned()));
        }
        url::Url::parse(&self.url)
            .map_err(|err| Error::ErrInvalidConfig(format!("invalid url {}: {err}", self.url)))?;
        if self.api_key.is_empty() || self.api_secret.is_empty() {
            return Err(Error::ErrInvalidConfig(
                "api key and secret are required".to_owned(),
            ));
        }
        self.startup_interval()?;
        if self.testers() == 0 {
            return Err(Error::ErrInvalidConfig(
                "at least one publisher or subscriber is required".to_owned(),
            ));
        }
        Ok(())
    }

    /// Time between two tester startups. Rates whose interval does not fit a
    /// [`Duration`] are rejected.
    pub fn startup_interval(&self) -> Result<Duration> {
        if !self.num_per_second.is_finite() || self.num_per_second <= 0.0 {
            return Err(Error::ErrInvalidConfig(format!(
                "num_per_second must be positive, got {}",
                self.num_per_second
            )));
        }
        Duration::try_from_secs_f64(1.0 / self.num_per_second).map_err(|err| {
            Error::ErrInvalidConfig(format!(
                "num_per_second {} is too small: {err}",
                self.num_per_second
            ))
        })
    }

    /// Fills in a generated room name and identity prefix where empty.
    pub fn materialize(&self) -> LoadTestParams {
        let mut params = self.clone();
        let mut rng = rand::rng();
        if params.room.is_empty() {
            params.room = format!("testroom{:03}", rng.random_range(0..1000));
        }
        if params.identity_prefix.is_empty() {
            params.identity_prefix = (0..IDENTITY_PREFIX_LEN)
                .map(|_| rng.random_range(b'a'..=b'z') as char)
                .collect();
        }
        params
    }
}

/// FindMaxParams configures the subscriber sweep.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FindMaxParams {
    #[serde(with = "duration_secs")]
    pub max_latency: Duration,
    /// Time stats are collected for at each checkpoint.
    #[serde(with = "duration_secs")]
    pub checkpoint_window: Duration,
    /// Subscribed tracks the first checkpoint aims for.
    pub track_budget: u32,
}

impl Default for FindMaxParams {
    fn default() -> Self {
        FindMaxParams {
            max_latency: Duration::from_millis(400),
            checkpoint_window: DEFAULT_CHECKPOINT_WINDOW,
            track_budget: DEFAULT_TRACK_BUDGET,
        }
    }
}

impl FindMaxParams {
    /// Latency samples up to twice the ceiling are kept, so a checkpoint can
    /// measure latency at and above `max_latency`.
    pub fn latency_window(&self) -> Duration {
        LATENCY_WINDOW.max(self.max_latency * 2)
    }

    /// Subscribers of the first checkpoint.
    pub fn initial_subscribers(&self, publisher_tracks: usize) -> usize {
        (self.track_budget as usize).div_ceil(publisher_tracks.max(1)).max(1)
    }

    /// Subscribers to add after a checkpoint measured `latency`.
    pub fn next_delta(&self, latency: Duration, publisher_tracks: usize) -> usize {
        let tracks = publisher_tracks.max(1);
        let ratio = latency.as_secs_f64() / self.max_latency.as_secs_f64().max(f64::EPSILON);
        let budget = self.track_budget as usize;
        let delta = if ratio < 0.25 {
            budget / 5 / tracks
        } else if ratio < 0.5 {
            budget / 10 / tracks
        } else if ratio < 0.75 {
            budget / 50 / tracks
        } else if ratio < 0.875 {
            budget / 500 / tracks
        } else {
            1
        };
        delta.max(1)
    }
}

/// AgentLoadTestParams configures the agent echo test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentLoadTestParams {
    pub url: String,
    pub api_key: String,
    pub api_secret: String,
    pub rooms: usize,
    /// No agent is dispatched when empty.
    pub agent_name: String,
    #[serde(with = "duration_secs")]
    pub echo_speech_delay: Duration,
    /// Zero runs until cancelled.
    #[serde(with = "duration_secs")]
    pub duration: Duration,
    pub attributes: HashMap<String, String>,
    /// Base url of the room inspector, `{base}/{room}` is reported per room.
    pub inspector_base_url: String,
}

impl Default for AgentLoadTestParams {
    fn default() -> Self {
        AgentLoadTestParams {
            url: String::new(),
            api_key: String::new(),
            api_secret: String::new(),
            rooms: 1,
            agent_name: String::new(),
            echo_speech_delay: Duration::from_secs(5),
            duration: Duration::ZERO,
            attributes: HashMap::new(),
            inspector_base_url: String::new(),
        }
    }
}

impl AgentLoadTestParams {
    pub fn validate(&self) -> Result<()> {
        if self.url.is_empty() {
            return Err(Error::ErrInvalidConfig("url is required".to_owned()));
        }
        url::Url::parse(&self.url)
            .map_err(|err| Error::ErrInvalidConfig(format!("invalid url {}: {err}", self.url)))?;
        if self.api_key.is_empty() || self.api_secret.is_empty() {
            return Err(Error::ErrInvalidConfig(
                "api key and secret are required".to_owned(),
            ));
        }
        if self.rooms == 0 {
            return Err(Error::ErrInvalidConfig("at least one room is required".to_owned()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn valid() -> LoadTestParams {
        LoadTestParams {
            url: "ws://localhost:7880".to_owned(),
            api_key: "devkey".to_owned(),
            api_secret: "secret".to_owned(),
            subscribers: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_layout_parse_and_display() -> Result<()> {
        for layout in [
            Layout::Speaker,
            Layout::Grid3x3,
            Layout::Grid4x4,
            Layout::Grid5x5,
        ] {
            assert_eq!(layout.to_string().parse::<Layout>()?, layout);
        }
        assert_eq!("SPEAKER".parse::<Layout>()?, Layout::Speaker);
        assert!("6x6".parse::<Layout>().is_err());
        Ok(())
    }

    #[test]
    fn test_speaker_quality_plan() {
        let mut assigned = vec![];
        for _ in 0..10 {
            let next = Layout::Speaker.next_quality(&QualityCounts::tally(&assigned));
            assigned.push(next);
        }
        let counts = QualityCounts::tally(&assigned);
        assert_eq!(assigned[0], QualityTarget::High);
        assert_eq!(counts.high, 1);
        assert_eq!(counts.low, 5);
        assert_eq!(counts.off, 4);
    }

    #[test]
    fn test_grid_quality_plans() {
        for (layout, quality, limit) in [
            (Layout::Grid3x3, QualityTarget::Medium, 9),
            (Layout::Grid4x4, QualityTarget::Low, 16),
            (Layout::Grid5x5, QualityTarget::Low, 25),
        ] {
            let mut assigned = vec![];
            for _ in 0..limit + 2 {
                assigned.push(layout.next_quality(&QualityCounts::tally(&assigned)));
            }
            assert!(assigned[..limit].iter().all(|q| *q == quality));
            assert!(assigned[limit..].iter().all(|q| *q == QualityTarget::Off));
            assert_eq!(layout.max_subscriptions(), limit);
        }
    }

    #[test]
    fn test_validate() {
        assert!(valid().validate().is_ok());

        let mut params = valid();
        params.url.clear();
        assert!(params.validate().is_err());

        let mut params = valid();
        params.url = "not a url".to_owned();
        assert!(params.validate().is_err());

        let mut params = valid();
        params.api_secret.clear();
        assert!(params.validate().is_err());

        let mut params = valid();
        params.num_per_second = 0.0;
        assert!(params.validate().is_err());

        let mut params = valid();
        params.num_per_second = 1e-30;
        assert!(matches!(
            params.validate(),
            Err(Error::ErrInvalidConfig(_))
        ));
        params.num_per_second = 4.0;
        assert_eq!(params.startup_interval().ok(), Some(Duration::from_millis(250)));

        let mut params = valid();
        params.subscribers = 0;
        assert!(matches!(
            params.validate(),
            Err(Error::ErrInvalidConfig(_))
        ));
    }

    #[test]
    fn test_materialize() {
        let params = valid().materialize();
        assert!(params.room.starts_with("testroom"));
        assert_eq!(params.room.len(), "testroom".len() + 3);
        assert_eq!(params.identity_prefix.len(), 5);
        assert!(params.identity_prefix.chars().all(|c| c.is_ascii_lowercase()));

        let mut fixed = valid();
        fixed.room = "myroom".to_owned();
        fixed.identity_prefix = "me".to_owned();
        let params = fixed.materialize();
        assert_eq!(params.room, "myroom");
        assert_eq!(params.identity_prefix, "me");
    }

    #[test]
    fn test_expected_tracks() {
        let params = LoadTestParams {
            video_publishers: 3,
            audio_publishers: 5,
            subscribers: 2,
            ..valid()
        };
        assert_eq!(params.publishers(), 5);
        assert_eq!(params.testers(), 7);
        assert_eq!(params.expected_tracks(), 8);
    }

    #[test]
    fn test_deserialize_defaults() -> Result<()> {
        let params: LoadTestParams = serde_json::from_str(
            r#"{"url":"ws://sfu","layout":"4x4","duration":2.5,"video_codec":"vp8"}"#,
        )?;
        assert_eq!(params.layout, Layout::Grid4x4);
        assert_eq!(params.duration, Duration::from_millis(2500));
        assert_eq!(params.codec(), VideoCodec::VP8);
        assert_eq!(params.num_per_second, DEFAULT_NUM_PER_SECOND);
        assert!(params.simulcast);
        Ok(())
    }

    #[test]
    fn test_find_max_steps() {
        let params = FindMaxParams {
            max_latency: Duration::from_millis(400),
            ..Default::default()
        };
        assert_eq!(params.initial_subscribers(1), 5000);
        assert_eq!(params.initial_subscribers(3), 1667);

        assert_eq!(params.next_delta(Duration::from_millis(50), 1), 1000);
        assert_eq!(params.next_delta(Duration::from_millis(150), 1), 500);
        assert_eq!(params.next_delta(Duration::from_millis(250), 1), 100);
        assert_eq!(params.next_delta(Duration::from_millis(320), 1), 10);
        assert_eq!(params.next_delta(Duration::from_millis(390), 1), 1);
        assert_eq!(params.next_delta(Duration::from_millis(250), 200), 1);

        assert_eq!(params.latency_window(), Duration::from_millis(800));
        let tight = FindMaxParams {
            max_latency: Duration::from_millis(15),
            ..Default::default()
        };
        assert_eq!(tight.latency_window(), LATENCY_WINDOW);
    }
}
