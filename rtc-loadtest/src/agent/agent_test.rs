use std::time::Duration;

use super::*;
use crate::client::loopback::{LoopbackConfig, LoopbackSfu};
use crate::error::Error;

fn params() -> AgentLoadTestParams {
    AgentLoadTestParams {
        url: "ws://loopback".to_owned(),
        api_key: "devkey".to_owned(),
        api_secret: "secret".to_owned(),
        rooms: 3,
        agent_name: "echo-agent".to_owned(),
        echo_speech_delay: Duration::from_millis(200),
        duration: Duration::from_secs(2),
        ..Default::default()
    }
}

fn agent_test(sfu: &LoopbackSfu, params: AgentLoadTestParams) -> AgentLoadTest {
    AgentLoadTest::new(params, Arc::new(sfu.clone()), Arc::new(sfu.clone()))
}

#[tokio::test(start_paused = true)]
async fn test_agent_echo_rooms() -> Result<()> {
    let sfu = LoopbackSfu::default();
    let mut out = vec![];
    let rooms = agent_test(&sfu, params())
        .run(CancellationToken::new(), &mut out)
        .await?;

    assert_eq!(rooms.len(), 3);
    for room in &rooms {
        assert!(room.error.is_none(), "{:?}", room.error);
        assert!(room.echo_track_published);
        assert!(room.agent_joined);
        assert!(room.agent_track_subscribed);
        let (Some(dispatched), Some(joined)) = (room.dispatched_at, room.joined_at) else {
            panic!("{} has no dispatch or join time", room.room);
        };
        assert!(joined >= dispatched);
        assert!(room.join_delay().is_some());
    }
    let dispatched: Vec<_> = rooms.iter().map(|r| r.dispatched_at).collect();
    let mut sorted = dispatched.clone();
    sorted.sort();
    assert_eq!(dispatched, sorted);

    let out = String::from_utf8(out).map_err(|err| Error::Other(err.to_string()))?;
    assert!(out.contains("Agent Track Subscribed"));
    assert!(out.contains("✓"));
    assert!(!out.contains("✗"));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_no_agent_without_name() -> Result<()> {
    let sfu = LoopbackSfu::default();
    let params = AgentLoadTestParams {
        rooms: 1,
        agent_name: String::new(),
        duration: Duration::from_secs(1),
        inspector_base_url: "https://inspect.example.com/rooms/".to_owned(),
        ..params()
    };
    let mut out = vec![];
    let rooms = agent_test(&sfu, params)
        .run(CancellationToken::new(), &mut out)
        .await?;

    assert_eq!(rooms.len(), 1);
    let room = &rooms[0];
    // nobody speaks, so nothing is echoed
    assert!(!room.echo_track_published);
    assert!(!room.agent_joined);
    assert!(room.dispatched_at.is_none());
    assert_eq!(
        room.inspector_url.as_deref(),
        Some(format!("https://inspect.example.com/rooms/{}", room.room).as_str())
    );

    let out = String::from_utf8(out).map_err(|err| Error::Other(err.to_string()))?;
    assert!(out.contains("Inspect:"));
    assert!(out.contains("✗"));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_echo_is_published_only_after_the_delay() -> Result<()> {
    let sfu = LoopbackSfu::default();
    let params = AgentLoadTestParams {
        rooms: 1,
        echo_speech_delay: Duration::from_secs(5),
        duration: Duration::from_secs(2),
        ..params()
    };
    let mut out = vec![];
    let rooms = agent_test(&sfu, params)
        .run(CancellationToken::new(), &mut out)
        .await?;

    let room = &rooms[0];
    assert!(room.agent_joined);
    assert!(room.agent_track_subscribed);
    assert!(!room.echo_track_published);

    let out = String::from_utf8(out).map_err(|err| Error::Other(err.to_string()))?;
    assert!(out.contains("✗"));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_room_join_failure_is_reported() -> Result<()> {
    let sfu = LoopbackSfu::new(LoopbackConfig {
        failing_joins: u32::MAX,
        ..Default::default()
    });
    let params = AgentLoadTestParams {
        rooms: 1,
        duration: Duration::ZERO,
        ..params()
    };
    let mut out = vec![];
    let rooms = agent_test(&sfu, params)
        .run(CancellationToken::new(), &mut out)
        .await?;

    assert!(!rooms[0].echo_track_published);
    assert!(
        rooms[0]
            .error
            .as_deref()
            .is_some_and(|err| err.contains("10 attempts"))
    );
    let out = String::from_utf8(out).map_err(|err| Error::Other(err.to_string()))?;
    assert!(out.contains("Errors:"));
    Ok(())
}

#[tokio::test]
async fn test_invalid_params() {
    let sfu = LoopbackSfu::default();
    let params = AgentLoadTestParams {
        rooms: 0,
        ..params()
    };
    let result = agent_test(&sfu, params)
        .run(CancellationToken::new(), &mut std::io::sink())
        .await;
    assert!(matches!(result, Err(Error::ErrInvalidConfig(_))));
}
