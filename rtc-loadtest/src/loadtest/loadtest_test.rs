use std::time::Duration;

use super::*;
use crate::client::loopback::{LoopbackConfig, LoopbackSfu};

fn params() -> LoadTestParams {
    LoadTestParams {
        url: "ws://loopback".to_owned(),
        api_key: "devkey".to_owned(),
        api_secret: "secret".to_owned(),
        num_per_second: 10.0,
        ..Default::default()
    }
}

fn load_test(sfu: &LoopbackSfu, params: LoadTestParams) -> LoadTest {
    LoadTest::new(params, Arc::new(sfu.clone()), MediaLibrary::synthetic())
}

#[test]
fn test_build_testers() {
    let params = LoadTestParams {
        video_publishers: 2,
        audio_publishers: 3,
        subscribers: 2,
        publisher_subscribe: true,
        ..params()
    }
    .materialize();
    let connector: Arc<dyn SfuConnector> = Arc::new(LoopbackSfu::default());
    let testers = build_testers(
        &params,
        &connector,
        &MediaLibrary::synthetic(),
        &CancellationToken::new(),
        None,
    );

    let described: Vec<(&str, usize, bool, usize)> = testers
        .iter()
        .map(|t| {
            let p = t.params();
            (t.name(), p.sequence, p.subscribe, p.expected_tracks)
        })
        .collect();
    assert_eq!(
        described,
        vec![
            ("Pub 0", 0, true, 3),
            ("Pub 1", 1, true, 3),
            ("Pub 2", 2, true, 4),
            ("Sub 0", 3, true, 5),
            ("Sub 1", 4, true, 5),
        ]
    );
}

#[test]
fn test_publishers_do_not_subscribe_by_default() {
    let params = LoadTestParams {
        audio_publishers: 2,
        subscribers: 1,
        ..params()
    }
    .materialize();
    let connector: Arc<dyn SfuConnector> = Arc::new(LoopbackSfu::default());
    let testers = build_testers(
        &params,
        &connector,
        &MediaLibrary::synthetic(),
        &CancellationToken::new(),
        None,
    );
    assert!(!testers[0].params().subscribe);
    assert_eq!(testers[0].params().expected_tracks, 0);
    assert_eq!(testers[2].params().expected_tracks, 2);
}

#[tokio::test]
async fn test_invalid_config_is_rejected_up_front() {
    let sfu = LoopbackSfu::default();
    let test = load_test(
        &sfu,
        LoadTestParams {
            subscribers: 1,
            api_secret: String::new(),
            ..params()
        },
    );
    let mut out = vec![];
    let result = test.run(CancellationToken::new(), &mut out).await;
    assert!(matches!(result, Err(Error::ErrInvalidConfig(_))));
    assert!(out.is_empty());
    assert_eq!(sfu.join_attempts(), 0);
}

#[tokio::test]
async fn test_tiny_startup_rate_is_rejected() {
    let sfu = LoopbackSfu::default();
    let test = load_test(
        &sfu,
        LoadTestParams {
            subscribers: 2,
            num_per_second: 1e-30,
            ..params()
        },
    );
    let mut out = vec![];
    let result = test.run(CancellationToken::new(), &mut out).await;
    assert!(matches!(result, Err(Error::ErrInvalidConfig(_))));
    assert!(out.is_empty());
    assert_eq!(sfu.join_attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_run_until_deadline() -> Result<()> {
    let sfu = LoopbackSfu::default();
    let test = load_test(
        &sfu,
        LoadTestParams {
            audio_publishers: 2,
            subscribers: 2,
            duration: Duration::from_secs(10),
            ..params()
        },
    );

    let started = Instant::now();
    let mut out = vec![];
    let report = test.run(CancellationToken::new(), &mut out).await?;
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(10));
    assert!(elapsed < Duration::from_secs(11));

    assert_eq!(report.testers.len(), 4);
    assert_eq!(report.summary.tracks, 4);
    assert_eq!(report.summary.expected_tracks, 4);
    assert!(report.summary.errors.is_empty());
    assert_eq!(report.params.room.len(), "testroom000".len());
    assert!(sfu.room_names().await.is_empty());

    let out = String::from_utf8(out).map_err(|err| Error::Other(err.to_string()))?;
    assert!(out.contains("Pub 0:"));
    assert!(out.contains("Sub 1:"));
    assert!(out.contains("Summary:"));
    assert!(out.contains("4/4"));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_run_ends_when_every_tester_failed() -> Result<()> {
    let sfu = LoopbackSfu::new(LoopbackConfig {
        failing_joins: u32::MAX,
        ..Default::default()
    });
    let test = load_test(
        &sfu,
        LoadTestParams {
            subscribers: 2,
            ..params()
        },
    );

    let mut out = vec![];
    let report = test.run(CancellationToken::new(), &mut out).await?;
    assert_eq!(report.summary.errors.len(), 2);
    assert!(report.summary.errors["Sub 0"].contains("10 attempts"));
    assert_eq!(sfu.join_attempts(), 20);

    let out = String::from_utf8(out).map_err(|err| Error::Other(err.to_string()))?;
    assert!(out.contains("Errors:"));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_cancel_reports_partial_stats() -> Result<()> {
    let sfu = LoopbackSfu::default();
    let test = load_test(
        &sfu,
        LoadTestParams {
            audio_publishers: 1,
            subscribers: 1,
            ..params()
        },
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(3)).await;
        trigger.cancel();
    });

    let mut out = vec![];
    let report = test.run(cancel, &mut out).await?;
    assert_eq!(report.summary.tracks, 1);
    assert!(report.summary.packets > 0);
    assert!(sfu.room_names().await.is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_launch_paces_startups() {
    let sfu = LoopbackSfu::default();
    let params = LoadTestParams {
        subscribers: 5,
        num_per_second: 2.0,
        ..params()
    }
    .materialize();
    let connector: Arc<dyn SfuConnector> = Arc::new(sfu.clone());
    let cancel = CancellationToken::new();
    let testers = build_testers(&params, &connector, &MediaLibrary::synthetic(), &cancel, None);

    let (errors_tx, _errors_rx) = mpsc::unbounded_channel();
    let startups = TaskTracker::new();
    let started = Instant::now();
    launch(
        params,
        testers.clone(),
        startups.clone(),
        errors_tx,
        cancel.clone(),
    )
    .await;
    startups.close();
    startups.wait().await;

    // the fifth tester starts two seconds in
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert!(started.elapsed() < Duration::from_millis(2500));
    assert!(any_running(&testers).await);
    stop_all(&testers).await;
    assert!(!any_running(&testers).await);
}
