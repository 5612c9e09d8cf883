use std::io::{self, Write};

use log::info;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::{LoadTest, LoadTestReport};
use crate::client::TrackKind;
use crate::config::{DEFAULT_SUITE_CASE_DURATION, LoadTestParams};
use crate::error::Result;
use crate::stats::format::{format_bitrate, format_latency, format_loss};
use crate::stats::table::Table;

/// One scenario of a suite run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SuiteCase {
    pub publishers: usize,
    pub subscribers: usize,
    pub video: bool,
}

impl SuiteCase {
    pub const fn new(publishers: usize, subscribers: usize, video: bool) -> Self {
        SuiteCase {
            publishers,
            subscribers,
            video,
        }
    }

    /// Applies this case to `base`, keeping endpoint, codec and layout.
    pub fn params(&self, base: &LoadTestParams) -> LoadTestParams {
        LoadTestParams {
            audio_publishers: self.publishers,
            video_publishers: if self.video { self.publishers } else { 0 },
            subscribers: self.subscribers,
            duration: if base.duration.is_zero() {
                DEFAULT_SUITE_CASE_DURATION
            } else {
                base.duration
            },
            ..base.clone()
        }
    }
}

pub const DEFAULT_SUITE: [SuiteCase; 7] = [
    SuiteCase::new(1, 10, false),
    SuiteCase::new(10, 10, false),
    SuiteCase::new(10, 100, false),
    SuiteCase::new(50, 50, false),
    SuiteCase::new(1, 10, true),
    SuiteCase::new(10, 10, true),
    SuiteCase::new(10, 100, true),
];

/// Outcome of one suite case.
#[derive(Debug, Clone, Serialize)]
pub struct SuiteResult {
    pub case: SuiteCase,
    pub tracks: usize,
    pub expected_tracks: usize,
    /// Mean per-track bitrate of received audio, bits per second.
    pub audio_bitrate: f64,
    /// Mean per-track bitrate of received video, bits per second.
    pub video_bitrate: f64,
    pub latency: Option<std::time::Duration>,
    pub dropped: u64,
    pub packets: u64,
}

impl SuiteResult {
    fn from_report(case: SuiteCase, report: &LoadTestReport) -> Self {
        let mut audio = (0.0, 0usize);
        let mut video = (0.0, 0usize);
        for tester in &report.testers {
            for track in tester.tracks.values() {
                let slot = match track.kind {
                    TrackKind::Audio => &mut audio,
                    TrackKind::Video => &mut video,
                };
                slot.0 += track.bitrate;
                slot.1 += 1;
            }
        }
        let average = |(sum, count): (f64, usize)| if count == 0 { 0.0 } else { sum / count as f64 };

        SuiteResult {
            case,
            tracks: report.summary.tracks,
            expected_tracks: report.summary.expected_tracks,
            audio_bitrate: average(audio),
            video_bitrate: average(video),
            latency: report.summary.mean_latency(),
            dropped: report.summary.dropped,
            packets: report.summary.packets,
        }
    }
}

impl LoadTest {
    /// Runs [`DEFAULT_SUITE`] with this test's endpoint and media settings.
    pub async fn run_suite<W: Write + Send + ?Sized>(
        &self,
        cancel: CancellationToken,
        out: &mut W,
    ) -> Result<Vec<SuiteResult>> {
        self.run_cases(&DEFAULT_SUITE, cancel, out).await
    }

    /// Runs `cases` one after the other and writes a single table. Stops
    /// early when `cancel` fires, reporting the cases completed so far.
    pub async fn run_cases<W: Write + Send + ?Sized>(
        &self,
        cases: &[SuiteCase],
        cancel: CancellationToken,
        out: &mut W,
    ) -> Result<Vec<SuiteResult>> {
        let mut results = Vec::with_capacity(cases.len());
        for case in cases {
            if cancel.is_cancelled() {
                break;
            }
            info!(
                "suite case: {} publishers, {} subscribers, video {}",
                case.publishers, case.subscribers, case.video
            );
            let test = LoadTest::new(
                case.params(&self.params),
                self.connector.clone(),
                self.library.clone(),
            );
            let report = test.run(cancel.clone(), &mut io::sink()).await?;
            results.push(SuiteResult::from_report(*case, &report));
        }

        write_suite(out, &results)?;
        Ok(results)
    }
}

pub fn write_suite<W: Write + ?Sized>(w: &mut W, results: &[SuiteResult]) -> io::Result<()> {
    let mut table = Table::new(&[
        "Pubs",
        "Subs",
        "Tracks",
        "Audio",
        "Video",
        "Latency",
        "Packet loss",
    ]);
    for result in results {
        table.add_row(vec![
            result.case.publishers.to_string(),
            result.case.subscribers.to_string(),
            format!("{}/{}", result.tracks, result.expected_tracks),
            format_bitrate(result.audio_bitrate),
            if result.case.video {
                format_bitrate(result.video_bitrate)
            } else {
                "-".to_owned()
            },
            format_latency(result.latency),
            format_loss(result.dropped, result.packets),
        ]);
    }
    table.render(w)
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_case_params() {
        let base = LoadTestParams {
            url: "ws://localhost:7880".to_owned(),
            duration: Duration::ZERO,
            ..Default::default()
        };
        let params = SuiteCase::new(10, 100, true).params(&base);
        assert_eq!(params.audio_publishers, 10);
        assert_eq!(params.video_publishers, 10);
        assert_eq!(params.subscribers, 100);
        assert_eq!(params.duration, DEFAULT_SUITE_CASE_DURATION);
        assert_eq!(params.url, base.url);

        let base = LoadTestParams {
            duration: Duration::from_secs(3),
            ..base
        };
        let params = SuiteCase::new(1, 10, false).params(&base);
        assert_eq!(params.video_publishers, 0);
        assert_eq!(params.duration, Duration::from_secs(3));
    }

    #[test]
    fn test_write_suite() {
        let results = [SuiteResult {
            case: SuiteCase::new(1, 10, false),
            tracks: 10,
            expected_tracks: 10,
            audio_bitrate: 24_000.0,
            video_bitrate: 0.0,
            latency: Some(Duration::from_millis(3)),
            dropped: 0,
            packets: 5000,
        }];
        let mut out = vec![];
        write_suite(&mut out, &results).unwrap();
        let out = String::from_utf8(out).unwrap();

        assert!(out.contains("Packet loss"));
        assert!(out.contains("10/10"));
        assert!(out.contains("24.00kbps"));
        assert!(out.contains("3ms"));
        assert!(out.contains("0 (0%)"));
    }
}
