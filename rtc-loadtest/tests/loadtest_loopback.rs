//! End-to-end load tests against the in-process loopback SFU.
//!
//! Test scenarios:
//! 1. Audio fan-out - every subscriber receives every publisher
//! 2. Simulcast video - a 3x3 grid receives every publisher at medium quality
//! 3. Ramp-up pacing - joins are spread at the configured rate
//! 4. Deadline - the run ends shortly after its duration
//! 5. Join retry - rejected joins are retried until they succeed

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use rtc_loadtest::client::loopback::{LoopbackConfig, LoopbackSfu};
use rtc_loadtest::client::{ConnectInfo, Room, RoomEvents, RoomOptions, SfuConnector, TrackKind};
use rtc_loadtest::media::{MediaLibrary, VideoCodec, VideoResolution};
use rtc_loadtest::{Layout, LoadTest, LoadTestParams};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn params() -> LoadTestParams {
    LoadTestParams {
        url: "ws://loopback".to_owned(),
        api_key: "devkey".to_owned(),
        api_secret: "secret".to_owned(),
        num_per_second: 50.0,
        ..Default::default()
    }
}

fn load_test(connector: Arc<dyn SfuConnector>, params: LoadTestParams) -> LoadTest {
    LoadTest::new(params, connector, MediaLibrary::synthetic())
}

/// Records when each join succeeded.
struct RecordingConnector {
    sfu: LoopbackSfu,
    joined_at: Mutex<Vec<Instant>>,
}

#[async_trait]
impl SfuConnector for RecordingConnector {
    async fn join(
        &self,
        url: &str,
        info: &ConnectInfo,
        options: RoomOptions,
    ) -> rtc_loadtest::Result<(Arc<dyn Room>, RoomEvents)> {
        let joined = self.sfu.join(url, info, options).await?;
        self.joined_at.lock().await.push(Instant::now());
        Ok(joined)
    }
}

#[tokio::test(start_paused = true)]
async fn test_audio_fan_out() -> Result<()> {
    init_log();
    let sfu = LoopbackSfu::default();
    let test = load_test(
        Arc::new(sfu.clone()),
        LoadTestParams {
            audio_publishers: 5,
            subscribers: 10,
            layout: Layout::Speaker,
            duration: Duration::from_secs(5),
            ..params()
        },
    );

    let mut out = vec![];
    let report = test.run(CancellationToken::new(), &mut out).await?;

    for tester in report.testers.iter().filter(|t| t.name.starts_with("Sub")) {
        assert_eq!(tester.tracks.len(), 5, "{}", tester.name);
        assert!(tester.tracks.values().all(|t| t.kind == TrackKind::Audio));
    }
    assert_eq!(report.summary.tracks, 50);
    assert_eq!(report.summary.expected_tracks, 50);
    assert_eq!(report.summary.dropped, 0);
    assert!(report.summary.latency_count > 0);

    let out = String::from_utf8(out)?;
    let total = out
        .lines()
        .find(|l| l.starts_with("| Total"))
        .ok_or_else(|| anyhow::anyhow!("no total row"))?;
    assert!(total.contains("50/50"));
    // 15 tester headers, 50 track rows, then the summary header, 15 testers and the total
    assert_eq!(out.lines().filter(|l| l.starts_with("| ")).count(), 15 + 50 + 17);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_simulcast_grid() -> Result<()> {
    init_log();
    let sfu = LoopbackSfu::default();
    let test = load_test(
        Arc::new(sfu.clone()),
        LoadTestParams {
            video_publishers: 9,
            subscribers: 5,
            video_codec: Some(VideoCodec::H264),
            video_resolution: VideoResolution::High,
            simulcast: true,
            layout: Layout::Grid3x3,
            duration: Duration::from_secs(4),
            ..params()
        },
    );

    let report = test.run(CancellationToken::new(), &mut std::io::sink()).await?;
    let medium = MediaLibrary::synthetic().video_spec(VideoCodec::H264, VideoResolution::Medium)?;
    let nominal = f64::from(medium.kbps) * 1000.0;

    for tester in report.testers.iter().filter(|t| t.name.starts_with("Sub")) {
        let summary = tester.summary();
        assert_eq!(summary.tracks, 9, "{}", tester.name);
        let per_track = summary.track_bitrate();
        assert!(
            per_track > nominal * 0.5 && per_track < nominal * 1.5,
            "{}: {per_track}bps per track",
            tester.name
        );
    }
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_ramp_up_pacing() -> Result<()> {
    init_log();
    let connector = Arc::new(RecordingConnector {
        sfu: LoopbackSfu::default(),
        joined_at: Mutex::new(vec![]),
    });
    let test = load_test(
        connector.clone(),
        LoadTestParams {
            subscribers: 100,
            num_per_second: 10.0,
            duration: Duration::from_secs(12),
            ..params()
        },
    );
    let report = test.run(CancellationToken::new(), &mut std::io::sink()).await?;
    assert!(report.summary.errors.is_empty());

    let joined_at = connector.joined_at.lock().await;
    assert_eq!(joined_at.len(), 100);
    let (Some(first), Some(last)) = (joined_at.iter().min(), joined_at.iter().max()) else {
        anyhow::bail!("no joins recorded");
    };
    let spread = *last - *first;
    assert!(spread >= Duration::from_secs(9), "{spread:?}");
    assert!(spread <= Duration::from_secs(12), "{spread:?}");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_deadline_termination() -> Result<()> {
    init_log();
    let sfu = LoopbackSfu::default();
    let test = load_test(
        Arc::new(sfu.clone()),
        LoadTestParams {
            audio_publishers: 2,
            video_publishers: 2,
            subscribers: 2,
            simulcast: false,
            video_resolution: VideoResolution::Low,
            duration: Duration::from_secs(10),
            ..params()
        },
    );

    let started = Instant::now();
    let mut out = vec![];
    let report = test.run(CancellationToken::new(), &mut out).await?;
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(10));
    assert!(elapsed < Duration::from_secs(11), "{elapsed:?}");

    assert!(sfu.room_names().await.is_empty());
    // one track per video publisher without simulcast
    assert_eq!(report.summary.tracks, 8);
    assert!(String::from_utf8(out)?.contains("Summary:"));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_join_retry_recovers() -> Result<()> {
    init_log();
    let sfu = LoopbackSfu::new(LoopbackConfig {
        failing_joins: 3,
        ..Default::default()
    });
    let test = load_test(
        Arc::new(sfu.clone()),
        LoadTestParams {
            audio_publishers: 1,
            subscribers: 2,
            duration: Duration::from_secs(5),
            ..params()
        },
    );

    let report = test.run(CancellationToken::new(), &mut std::io::sink()).await?;
    assert!(report.summary.errors.is_empty(), "{:?}", report.summary.errors);
    assert_eq!(report.summary.tracks, 2);
    assert!(sfu.join_attempts() >= 6);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_single_layer_video_is_one_track_per_publisher() -> Result<()> {
    init_log();
    let sfu = LoopbackSfu::default();
    let test = load_test(
        Arc::new(sfu.clone()),
        LoadTestParams {
            video_publishers: 3,
            subscribers: 2,
            simulcast: false,
            video_codec: Some(VideoCodec::VP8),
            video_resolution: VideoResolution::Medium,
            layout: Layout::Grid3x3,
            duration: Duration::from_secs(5),
            ..params()
        },
    );

    let report = test.run(CancellationToken::new(), &mut std::io::sink()).await?;
    assert!(report.summary.errors.is_empty(), "{:?}", report.summary.errors);
    for tester in report.testers.iter().filter(|t| t.name.starts_with("Sub")) {
        assert_eq!(tester.tracks.len(), 3, "{}", tester.name);
        assert!(tester.tracks.values().all(|t| t.kind == TrackKind::Video));
        assert!(tester.tracks.values().all(|t| t.packets > 0));
    }
    assert_eq!(report.summary.tracks, 6);
    assert_eq!(report.summary.expected_tracks, 6);
    Ok(())
}
