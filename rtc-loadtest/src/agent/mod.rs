//! Agent echo test: one echo participant per room, an agent dispatched into
//! each room, and everything the agent says played back after a delay.

#[cfg(test)]
mod agent_test;

mod echo;

use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::info;
use rand::Rng;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::bootstrap;
use crate::client::{AgentDispatcher, SfuConnector};
use crate::config::AgentLoadTestParams;
use crate::error::Result;
use crate::stats::format::format_latency;
use crate::stats::table::Table;

/// Identity of the participant that echoes the agent.
pub const ECHO_IDENTITY: &str = "echo-participant";
/// Name of the published echo track.
pub const ECHO_TRACK_NAME: &str = "echo";
/// Received samples buffered between the echo reader and writer.
pub const ECHO_BUFFER: usize = 1000;

/// What happened in one echo room.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentRoomStats {
    pub room: String,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub agent_joined: bool,
    pub joined_at: Option<DateTime<Utc>>,
    pub agent_track_subscribed: bool,
    /// Set once the first received sample was echoed back.
    pub echo_track_published: bool,
    pub inspector_url: Option<String>,
    /// Why the room could not be set up.
    pub error: Option<String>,
}

impl AgentRoomStats {
    pub fn join_delay(&self) -> Option<Duration> {
        let (dispatched, joined) = (self.dispatched_at?, self.joined_at?);
        (joined - dispatched).to_std().ok()
    }
}

/// AgentLoadTest runs echo rooms against an agent deployment.
pub struct AgentLoadTest {
    params: AgentLoadTestParams,
    connector: Arc<dyn SfuConnector>,
    dispatcher: Arc<dyn AgentDispatcher>,
}

impl AgentLoadTest {
    pub fn new(
        params: AgentLoadTestParams,
        connector: Arc<dyn SfuConnector>,
        dispatcher: Arc<dyn AgentDispatcher>,
    ) -> Self {
        AgentLoadTest {
            params,
            connector,
            dispatcher,
        }
    }

    /// Runs every room until `cancel` fires or the duration elapses, then
    /// writes one row per room ordered by dispatch time.
    pub async fn run<W: Write + Send + ?Sized>(
        &self,
        cancel: CancellationToken,
        out: &mut W,
    ) -> Result<Vec<AgentRoomStats>> {
        self.params.validate()?;
        bootstrap::raise_fd_limit();

        let suffix: String = {
            let mut rng = rand::rng();
            (0..6).map(|_| rng.random_range(b'a'..=b'z') as char).collect()
        };
        let run_cancel = cancel.child_token();
        let rooms = TaskTracker::new();
        let mut stats = Vec::with_capacity(self.params.rooms);

        for i in 0..self.params.rooms {
            let name = format!("agent-loadtest-{suffix}-{i}");
            let room_stats = Arc::new(Mutex::new(AgentRoomStats {
                room: name.clone(),
                inspector_url: (!self.params.inspector_base_url.is_empty()).then(|| {
                    format!(
                        "{}/{name}",
                        self.params.inspector_base_url.trim_end_matches('/')
                    )
                }),
                ..Default::default()
            }));
            stats.push(Arc::clone(&room_stats));

            let room = echo::EchoRoom {
                name,
                params: self.params.clone(),
                connector: Arc::clone(&self.connector),
                dispatcher: Arc::clone(&self.dispatcher),
                stats: room_stats,
                cancel: run_cancel.child_token(),
            };
            rooms.spawn(room.run());
        }
        rooms.close();

        let deadline = self.params.duration;
        tokio::select! {
            _ = cancel.cancelled() => info!("agent load test cancelled"),
            _ = sleep_or_pending(deadline) => info!("agent load test duration elapsed"),
            _ = rooms.wait() => info!("every echo room closed"),
        }
        run_cancel.cancel();
        rooms.wait().await;

        let mut results = Vec::with_capacity(stats.len());
        for room in &stats {
            results.push(room.lock().await.clone());
        }
        results.sort_by(|a, b| a.dispatched_at.cmp(&b.dispatched_at).then(a.room.cmp(&b.room)));

        write_rooms(out, &results)?;
        Ok(results)
    }
}

async fn sleep_or_pending(duration: Duration) {
    if duration.is_zero() {
        std::future::pending::<()>().await;
    } else {
        tokio::time::sleep(duration).await;
    }
}

fn check(value: bool) -> String {
    if value { "✓" } else { "✗" }.to_owned()
}

pub fn write_rooms<W: Write + ?Sized>(w: &mut W, rooms: &[AgentRoomStats]) -> io::Result<()> {
    let mut table = Table::new(&[
        "#",
        "Room",
        "Dispatched At",
        "Agent Joined",
        "Agent Join Delay",
        "Agent Track Subscribed",
        "Echo Track Published",
    ]);
    for (i, room) in rooms.iter().enumerate() {
        table.add_row(vec![
            (i + 1).to_string(),
            room.room.clone(),
            room.dispatched_at
                .map(|at| at.format("%H:%M:%S%.3f").to_string())
                .unwrap_or_else(|| "-".to_owned()),
            check(room.agent_joined),
            format_latency(room.join_delay()),
            check(room.agent_track_subscribed),
            check(room.echo_track_published),
        ]);
    }
    table.render(w)?;

    let inspectable: Vec<&AgentRoomStats> = rooms.iter().filter(|r| r.inspector_url.is_some()).collect();
    if !inspectable.is_empty() {
        writeln!(w, "\nInspect:")?;
        for room in inspectable {
            if let Some(url) = &room.inspector_url {
                writeln!(w, "  {}: {url}", room.room)?;
            }
        }
    }

    let failed: Vec<&AgentRoomStats> = rooms.iter().filter(|r| r.error.is_some()).collect();
    if !failed.is_empty() {
        writeln!(w, "\nErrors:")?;
        for room in failed {
            if let Some(error) = &room.error {
                writeln!(w, "  {}: {error}", room.room)?;
            }
        }
    }
    Ok(())
}
