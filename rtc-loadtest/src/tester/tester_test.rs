use std::time::Duration;

use super::*;
use crate::client::loopback::{LoopbackConfig, LoopbackSfu};
use crate::client::{RemoteCodec, RemoteTrack, RoomEvent, TrackKind};
use crate::config::QualityTarget;
use crate::media::{VideoCodec, VideoResolution};

fn params(name: &str, sequence: usize) -> TesterParams {
    TesterParams {
        url: "ws://loopback".to_owned(),
        api_key: "devkey".to_owned(),
        api_secret: "secret".to_owned(),
        room: "testroom001".to_owned(),
        identity_prefix: "abcde".to_owned(),
        name: name.to_owned(),
        sequence,
        layout: Layout::Speaker,
        subscribe: true,
        expected_tracks: 0,
        attributes: HashMap::new(),
        latency_window: None,
    }
}

fn tester(sfu: &LoopbackSfu, params: TesterParams, cancel: &CancellationToken) -> Tester {
    Tester::new(
        params,
        Arc::new(sfu.clone()),
        MediaLibrary::synthetic(),
        cancel,
    )
}

async fn eventually<F, Fut>(what: &str, tester: &Tester, check: F)
where
    F: Fn(Tester) -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check(tester.clone()).await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_start_and_stop() -> Result<()> {
    let sfu = LoopbackSfu::default();
    let cancel = CancellationToken::new();
    let t = tester(&sfu, params("Sub 0", 7), &cancel);
    assert_eq!(t.state().await, TesterState::Idle);

    t.start().await?;
    assert_eq!(t.state().await, TesterState::Running);
    let participants = sfu.participants("testroom001").await;
    assert_eq!(participants.len(), 1);
    assert_eq!(participants[0].identity, "abcde_7");

    // a running tester cannot be started again
    assert!(t.start().await.is_err());

    t.stop().await;
    assert_eq!(t.state().await, TesterState::Stopped);
    assert!(sfu.room_names().await.is_empty());
    t.stop().await;
    assert_eq!(t.state().await, TesterState::Stopped);

    assert!(matches!(
        t.publish_audio_track("late").await,
        Err(Error::ErrTesterNotRunning)
    ));

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_join_retries_with_backoff() -> Result<()> {
    let sfu = LoopbackSfu::new(LoopbackConfig {
        failing_joins: 3,
        ..Default::default()
    });
    let cancel = CancellationToken::new();
    let t = tester(&sfu, params("Sub 0", 0), &cancel);

    let started = tokio::time::Instant::now();
    t.start().await?;
    assert_eq!(sfu.join_attempts(), 4);
    assert!(started.elapsed() >= 3 * JOIN_BACKOFF);
    t.stop().await;

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_join_retry_exhausted() {
    let sfu = LoopbackSfu::new(LoopbackConfig {
        failing_joins: u32::MAX,
        ..Default::default()
    });
    let cancel = CancellationToken::new();
    let t = tester(&sfu, params("Sub 0", 0), &cancel);

    match t.start().await {
        Err(Error::ErrJoinRetryExhausted { attempts, .. }) => assert_eq!(attempts, JOIN_ATTEMPTS),
        other => panic!("unexpected {:?}", other.err()),
    }
    assert_eq!(sfu.join_attempts(), JOIN_ATTEMPTS);
    assert!(matches!(t.state().await, TesterState::Failed(_)));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_between_join_attempts() {
    let sfu = LoopbackSfu::new(LoopbackConfig {
        failing_joins: u32::MAX,
        ..Default::default()
    });
    let cancel = CancellationToken::new();
    let t = tester(&sfu, params("Sub 0", 0), &cancel);

    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(2500)).await;
        canceller.cancel();
    });

    assert!(matches!(t.start().await, Err(Error::ErrCancelled)));
    assert_eq!(sfu.join_attempts(), 3);
    assert_eq!(t.state().await, TesterState::Stopped);
}

#[tokio::test]
async fn test_publish_and_measure_audio() -> Result<()> {
    let sfu = LoopbackSfu::default();
    let cancel = CancellationToken::new();

    let publisher = tester(
        &sfu,
        TesterParams {
            subscribe: false,
            ..params("Pub 0", 0)
        },
        &cancel,
    );
    publisher.start().await?;
    let sid = publisher.publish_audio_track("abcde_0-audio").await?;
    assert_eq!(publisher.publications().await, vec![sid]);

    let subscriber = tester(
        &sfu,
        TesterParams {
            expected_tracks: 1,
            ..params("Sub 0", 1)
        },
        &cancel,
    );
    subscriber.start().await?;

    eventually("audio packets", &subscriber, |t| async move {
        t.stats()
            .await
            .tracks
            .values()
            .any(|track| track.packets >= 10)
    })
    .await;

    subscriber.stop().await;
    publisher.stop().await;

    let stats = subscriber.stats().await;
    assert_eq!(stats.name, "Sub 0");
    assert_eq!(stats.expected_tracks, 1);
    let tracks = stats.tracks_by_name();
    assert_eq!(tracks.len(), 1);
    assert_eq!(tracks[0].name, "abcde_0-audio");
    assert_eq!(tracks[0].dropped, 0);
    assert!(tracks[0].latency_count > 0);

    // nothing is written after stop
    let packets = tracks[0].packets;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let after = subscriber.stats().await;
    assert_eq!(after.tracks.values().next().map(|t| t.packets), Some(packets));

    assert_eq!(publisher.subscribed_tracks().await, 0);

    Ok(())
}

#[tokio::test]
async fn test_counting_track() -> Result<()> {
    let sfu = LoopbackSfu::default();
    let cancel = CancellationToken::new();

    let publisher = tester(&sfu, params("Pub 0", 0), &cancel);
    publisher.start().await?;
    publisher.publish_counting_track("counting", 64_000).await?;

    let subscriber = tester(&sfu, params("Sub 0", 1), &cancel);
    subscriber.start().await?;

    eventually("counting packets", &subscriber, |t| async move {
        t.stats()
            .await
            .tracks
            .values()
            .any(|track| track.packets >= 5 && track.latency_count >= 5)
    })
    .await;

    cancel.cancel();
    subscriber.stop().await;
    publisher.stop().await;

    Ok(())
}

#[tokio::test]
async fn test_no_subscription_when_disabled() -> Result<()> {
    let sfu = LoopbackSfu::default();
    let cancel = CancellationToken::new();

    let publisher = tester(&sfu, params("Pub 0", 0), &cancel);
    publisher.start().await?;
    publisher.publish_audio_track("audio").await?;

    let listener = tester(
        &sfu,
        TesterParams {
            subscribe: false,
            ..params("Pub 1", 1)
        },
        &cancel,
    );
    listener.start().await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(listener.subscribed_participants().await, 0);
    assert_eq!(listener.subscribed_tracks().await, 0);
    assert_eq!(sfu.active_subscriptions(), 0);

    cancel.cancel();
    listener.stop().await;
    publisher.stop().await;

    Ok(())
}

#[tokio::test]
async fn test_speaker_layout_caps_subscriptions() -> Result<()> {
    let sfu = LoopbackSfu::default();
    let cancel = CancellationToken::new();

    let mut publishers = vec![];
    for i in 0..8 {
        let publisher = tester(
            &sfu,
            TesterParams {
                subscribe: false,
                ..params(&format!("Pub {i}"), i)
            },
            &cancel,
        );
        publisher.start().await?;
        publisher
            .publish_video_track(
                &format!("video {i}"),
                VideoResolution::Low,
                VideoCodec::H264,
            )
            .await?;
        publishers.push(publisher);
    }

    let subscriber = tester(&sfu, params("Sub 0", 100), &cancel);
    subscriber.start().await?;

    eventually("six subscriptions", &subscriber, |t| async move {
        t.subscribed_tracks().await == 6
    })
    .await;
    assert_eq!(subscriber.subscribed_participants().await, 6);

    eventually("quality assignment", &subscriber, |t| async move {
        t.inner.subscriptions.lock().await.qualities.len() == 6
    })
    .await;
    let qualities = subscriber.inner.subscriptions.lock().await.qualities.clone();
    let high = qualities
        .values()
        .filter(|q| **q == QualityTarget::High)
        .count();
    let low = qualities
        .values()
        .filter(|q| **q == QualityTarget::Low)
        .count();
    assert_eq!((high, low), (1, 5));
    assert!(sfu.pli_count() >= 6);

    // a departing participant frees its slot for one that did not fit
    let gone = &publishers[0];
    let gone_identity = gone.params().identity();
    let was_subscribed = subscriber
        .inner
        .subscriptions
        .lock()
        .await
        .participants
        .contains(&gone_identity);
    gone.stop().await;
    if was_subscribed {
        eventually("slot reuse", &subscriber, |t| {
            let gone_identity = gone_identity.clone();
            async move {
                let subscriptions = t.inner.subscriptions.lock().await;
                subscriptions.participants.len() == 6
                    && !subscriptions.participants.contains(&gone_identity)
            }
        })
        .await;
    }

    cancel.cancel();
    subscriber.stop().await;
    for publisher in &publishers {
        publisher.stop().await;
    }

    Ok(())
}

#[tokio::test]
async fn test_simulcast_publish_shares_one_sid() -> Result<()> {
    let sfu = LoopbackSfu::default();
    let cancel = CancellationToken::new();

    let publisher = tester(&sfu, params("Pub 0", 0), &cancel);
    publisher.start().await?;
    let sid = publisher
        .publish_simulcast_track("video", VideoResolution::High, VideoCodec::VP8)
        .await?;
    assert_eq!(publisher.publications().await, vec![sid.clone()]);

    let subscriber = tester(
        &sfu,
        TesterParams {
            layout: Layout::Grid3x3,
            ..params("Sub 0", 1)
        },
        &cancel,
    );
    subscriber.start().await?;
    eventually("video packets", &subscriber, |t| {
        let sid = sid.clone();
        async move {
            t.stats()
                .await
                .tracks
                .get(&sid)
                .is_some_and(|track| track.packets > 0)
        }
    })
    .await;
    assert_eq!(
        subscriber
            .inner
            .subscriptions
            .lock()
            .await
            .qualities
            .get(&publisher.params().identity()),
        Some(&QualityTarget::Medium)
    );

    publisher.unpublish(&sid).await?;
    assert!(publisher.publications().await.is_empty());

    cancel.cancel();
    subscriber.stop().await;
    publisher.stop().await;

    Ok(())
}

#[tokio::test]
async fn test_server_disconnect_fails_tester() -> Result<()> {
    let sfu = LoopbackSfu::default();
    let cancel = CancellationToken::new();
    let t = tester(&sfu, params("Sub 0", 3), &cancel);
    t.start().await?;

    sfu.disconnect_participant("testroom001", "abcde_3", "room deleted")
        .await?;
    eventually("failure", &t, |t| async move {
        matches!(t.state().await, TesterState::Failed(_))
    })
    .await;

    t.stop().await;
    assert!(matches!(t.state().await, TesterState::Failed(_)));

    Ok(())
}

#[tokio::test]
async fn test_reset_stats_keeps_tracks() -> Result<()> {
    let sfu = LoopbackSfu::default();
    let cancel = CancellationToken::new();

    let publisher = tester(&sfu, params("Pub 0", 0), &cancel);
    publisher.start().await?;
    publisher.publish_audio_track("audio").await?;
    let subscriber = tester(&sfu, params("Sub 0", 1), &cancel);
    subscriber.start().await?;

    eventually("audio packets", &subscriber, |t| async move {
        t.stats()
            .await
            .tracks
            .values()
            .any(|track| track.packets > 0)
    })
    .await;

    cancel.cancel();
    subscriber.stop().await;
    subscriber.reset_stats().await;
    let stats = subscriber.stats().await;
    assert_eq!(stats.tracks.len(), 1);
    assert!(stats.tracks.values().all(|track| track.packets == 0));
    publisher.stop().await;

    Ok(())
}

/// Wraps the tracks of one publication so that reading them panics.
struct PanickingTrack {
    inner: Box<dyn RemoteTrack>,
}

#[async_trait::async_trait]
impl RemoteTrack for PanickingTrack {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn kind(&self) -> TrackKind {
        self.inner.kind()
    }

    fn ssrc(&self) -> u32 {
        self.inner.ssrc()
    }

    fn codec(&self) -> RemoteCodec {
        self.inner.codec()
    }

    async fn read_rtp(&mut self) -> Result<webrtc::rtp::packet::Packet> {
        if self.inner.kind() == TrackKind::Audio {
            panic!("reading {} failed hard", self.inner.id());
        }
        self.inner.read_rtp().await
    }
}

struct PanickingConnector {
    sfu: LoopbackSfu,
    publication: String,
}

#[async_trait::async_trait]
impl SfuConnector for PanickingConnector {
    async fn join(
        &self,
        url: &str,
        info: &ConnectInfo,
        options: RoomOptions,
    ) -> Result<(Arc<dyn Room>, RoomEvents)> {
        let (room, mut events) = self.sfu.join(url, info, options).await?;
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let target = self.publication.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let event = match event {
                    RoomEvent::TrackSubscribed {
                        track,
                        publication,
                        participant,
                    } if publication.name() == target => RoomEvent::TrackSubscribed {
                        track: Box::new(PanickingTrack { inner: track }),
                        publication,
                        participant,
                    },
                    event => event,
                };
                if tx.send(event).is_err() {
                    return;
                }
            }
        });
        Ok((room, rx))
    }
}

#[tokio::test]
async fn test_consumer_panic_ends_only_its_track() -> Result<()> {
    let sfu = LoopbackSfu::default();
    let cancel = CancellationToken::new();

    let mut publishers = vec![];
    for (i, name) in ["broken-audio", "healthy-audio"].into_iter().enumerate() {
        let publisher = tester(
            &sfu,
            TesterParams {
                subscribe: false,
                ..params(&format!("Pub {i}"), i)
            },
            &cancel,
        );
        publisher.start().await?;
        publisher.publish_audio_track(name).await?;
        publishers.push(publisher);
    }

    let subscriber = Tester::new(
        TesterParams {
            expected_tracks: 2,
            ..params("Sub 0", 2)
        },
        Arc::new(PanickingConnector {
            sfu: sfu.clone(),
            publication: "broken-audio".to_owned(),
        }),
        MediaLibrary::synthetic(),
        &cancel,
    );
    subscriber.start().await?;

    eventually("healthy packets", &subscriber, |t| async move {
        t.stats()
            .await
            .tracks
            .values()
            .any(|track| track.name == "healthy-audio" && track.packets >= 10)
    })
    .await;

    assert_eq!(subscriber.state().await, TesterState::Running);
    let stats = subscriber.stats().await;
    assert_eq!(stats.tracks.len(), 2);
    let tracks = stats.tracks_by_name();
    assert_eq!(tracks[0].name, "broken-audio");
    assert_eq!(tracks[0].packets, 0);

    // the healthy track keeps flowing after the panic
    let before = tracks[1].packets;
    eventually("more healthy packets", &subscriber, |t| async move {
        t.stats()
            .await
            .tracks
            .values()
            .any(|track| track.name == "healthy-audio" && track.packets > before)
    })
    .await;

    subscriber.stop().await;
    assert_eq!(subscriber.state().await, TesterState::Stopped);
    for publisher in &publishers {
        publisher.stop().await;
    }

    Ok(())
}
