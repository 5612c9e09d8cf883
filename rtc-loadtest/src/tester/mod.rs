//! Tester is one simulated participant.
//!
//! A tester joins a room, optionally publishes media, subscribes to remote
//! tracks according to its [`Layout`] and measures everything it receives.

#[cfg(test)]
mod tester_test;

mod consumer;
mod publish;
mod subscription;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::client::{ConnectInfo, Room, RoomEvents, RoomOptions, SfuConnector};
use crate::config::{Layout, LoadTestParams};
use crate::error::{Error, Result};
use crate::media::MediaLibrary;
use crate::stats::{TesterStats, TrackStats};
use subscription::Subscriptions;

pub const JOIN_ATTEMPTS: u32 = 10;
pub const JOIN_BACKOFF: Duration = Duration::from_secs(1);

/// TesterParams configures a single simulated participant.
#[derive(Debug, Clone, Default)]
pub struct TesterParams {
    pub url: String,
    pub api_key: String,
    pub api_secret: String,
    pub room: String,
    pub identity_prefix: String,
    /// Display name, e.g. `Pub 0`.
    pub name: String,
    pub sequence: usize,
    pub layout: Layout,
    pub subscribe: bool,
    pub expected_tracks: usize,
    pub attributes: HashMap<String, String>,
    /// Upper bound of accepted latency samples, `stats::LATENCY_WINDOW` when unset.
    pub latency_window: Option<Duration>,
}

impl TesterParams {
    /// Params of the `sequence`-th tester of a load test.
    pub fn from_load_test(params: &LoadTestParams, name: String, sequence: usize) -> Self {
        TesterParams {
            url: params.url.clone(),
            api_key: params.api_key.clone(),
            api_secret: params.api_secret.clone(),
            room: params.room.clone(),
            identity_prefix: params.identity_prefix.clone(),
            name,
            sequence,
            layout: params.layout,
            subscribe: true,
            expected_tracks: 0,
            attributes: params.attributes.clone(),
            latency_window: None,
        }
    }

    pub fn identity(&self) -> String {
        format!("{}_{}", self.identity_prefix, self.sequence)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TesterState {
    Idle,
    Connecting,
    Running,
    Stopping,
    Stopped,
    Failed(String),
}

impl TesterState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TesterState::Stopped | TesterState::Failed(_))
    }
}

impl fmt::Display for TesterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TesterState::Idle => write!(f, "idle"),
            TesterState::Connecting => write!(f, "connecting"),
            TesterState::Running => write!(f, "running"),
            TesterState::Stopping => write!(f, "stopping"),
            TesterState::Stopped => write!(f, "stopped"),
            TesterState::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

pub(crate) struct TesterInner {
    pub(crate) params: TesterParams,
    connector: Arc<dyn SfuConnector>,
    pub(crate) library: MediaLibrary,
    state: Mutex<TesterState>,
    pub(crate) room: Mutex<Option<Arc<dyn Room>>>,
    /// sids of our own publications
    pub(crate) publications: Mutex<Vec<String>>,
    pub(crate) subscriptions: Mutex<Subscriptions>,
    /// keyed by track id, each value written by exactly one consumer
    pub(crate) stats: Mutex<HashMap<String, Arc<Mutex<TrackStats>>>>,
    pub(crate) cancel: CancellationToken,
    pub(crate) tasks: TaskTracker,
}

/// Tester is a cheap handle, clones drive the same participant.
#[derive(Clone)]
pub struct Tester {
    pub(crate) inner: Arc<TesterInner>,
}

impl Tester {
    /// `cancel` is the parent token, cancelling it stops the tester's tasks.
    pub fn new(
        params: TesterParams,
        connector: Arc<dyn SfuConnector>,
        library: MediaLibrary,
        cancel: &CancellationToken,
    ) -> Self {
        Tester {
            inner: Arc::new(TesterInner {
                params,
                connector,
                library,
                state: Mutex::new(TesterState::Idle),
                room: Mutex::new(None),
                publications: Mutex::new(vec![]),
                subscriptions: Mutex::new(Subscriptions::default()),
                stats: Mutex::new(HashMap::new()),
                cancel: cancel.child_token(),
                tasks: TaskTracker::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.params.name
    }

    pub fn params(&self) -> &TesterParams {
        &self.inner.params
    }

    pub async fn state(&self) -> TesterState {
        self.inner.state.lock().await.clone()
    }

    pub async fn is_running(&self) -> bool {
        *self.inner.state.lock().await == TesterState::Running
    }

    /// Joins the room, retrying up to [`JOIN_ATTEMPTS`] times, then picks up
    /// every track already published in it.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock().await;
            if *state != TesterState::Idle {
                return Err(Error::ErrInvalidConfig(format!(
                    "{} cannot start while {state}",
                    self.name()
                )));
            }
            *state = TesterState::Connecting;
        }

        let (room, events) = match self.join_with_retry().await {
            Ok(joined) => joined,
            Err(err) => {
                let mut state = self.inner.state.lock().await;
                *state = if matches!(err, Error::ErrCancelled) {
                    TesterState::Stopped
                } else {
                    TesterState::Failed(err.to_string())
                };
                return Err(err);
            }
        };

        {
            let mut state = self.inner.state.lock().await;
            if *state != TesterState::Connecting {
                // stopped while joining
                drop(state);
                room.disconnect().await;
                return Err(Error::ErrCancelled);
            }
            *self.inner.room.lock().await = Some(Arc::clone(&room));
            *state = TesterState::Running;
        }
        info!(
            "{}: joined {} as {}",
            self.name(),
            room.name(),
            room.local_participant().identity
        );

        let inner = Arc::clone(&self.inner);
        self.inner
            .tasks
            .spawn(async move { inner.handle_events(events).await });

        // tracks published before we joined are not announced again
        for participant in room.remote_participants().await {
            for publication in participant.publications {
                self.inner
                    .on_track_published(publication, &participant.info)
                    .await;
            }
        }

        Ok(())
    }

    async fn join_with_retry(&self) -> Result<(Arc<dyn Room>, RoomEvents)> {
        let params = &self.inner.params;
        let info = ConnectInfo {
            api_key: params.api_key.clone(),
            api_secret: params.api_secret.clone(),
            room_name: params.room.clone(),
            identity: params.identity(),
            attributes: params.attributes.clone(),
        };
        let options = RoomOptions {
            auto_subscribe: false,
        };
        join_with_retry(
            self.inner.connector.as_ref(),
            &params.url,
            &info,
            options,
            &self.inner.cancel,
            &params.name,
        )
        .await
    }

    /// Leaves the room and waits for every publisher and consumer task to
    /// exit. Stopping twice is a no-op.
    pub async fn stop(&self) {
        {
            let mut state = self.inner.state.lock().await;
            match &*state {
                TesterState::Stopping | TesterState::Stopped => return,
                TesterState::Failed(_) => {}
                _ => *state = TesterState::Stopping,
            }
        }

        self.inner.cancel.cancel();
        if let Some(room) = self.inner.room.lock().await.take() {
            room.disconnect().await;
        }
        self.inner.tasks.close();
        self.inner.tasks.wait().await;

        let mut state = self.inner.state.lock().await;
        if !matches!(*state, TesterState::Failed(_)) {
            *state = TesterState::Stopped;
        }
        debug!("{}: stopped", self.name());
    }

    /// Snapshot of every track's counters.
    pub async fn stats(&self) -> TesterStats {
        let now = Instant::now();
        let stats = self.inner.stats.lock().await;
        let mut tracks = BTreeMap::new();
        for (track_id, track) in stats.iter() {
            tracks.insert(track_id.clone(), track.lock().await.summary(now));
        }
        TesterStats {
            name: self.inner.params.name.clone(),
            expected_tracks: self.inner.params.expected_tracks,
            tracks,
        }
    }

    /// Clears the counters of every subscribed track.
    pub async fn reset_stats(&self) {
        let stats = self.inner.stats.lock().await;
        for track in stats.values() {
            track.lock().await.reset();
        }
    }

    /// Number of remote participants this tester subscribed to.
    pub async fn subscribed_participants(&self) -> usize {
        self.inner.subscriptions.lock().await.participants.len()
    }

    pub async fn subscribed_tracks(&self) -> usize {
        self.inner.stats.lock().await.len()
    }

    /// sids of this tester's own publications.
    pub async fn publications(&self) -> Vec<String> {
        self.inner.publications.lock().await.clone()
    }

    pub(crate) async fn room(&self) -> Result<Arc<dyn Room>> {
        if !self.is_running().await {
            return Err(Error::ErrTesterNotRunning);
        }
        self.inner
            .room
            .lock()
            .await
            .clone()
            .ok_or(Error::ErrTesterNotRunning)
    }
}

/// Joins a room, making up to [`JOIN_ATTEMPTS`] attempts [`JOIN_BACKOFF`]
/// apart. Cancellation is observed between attempts.
pub(crate) async fn join_with_retry(
    connector: &dyn SfuConnector,
    url: &str,
    info: &ConnectInfo,
    options: RoomOptions,
    cancel: &CancellationToken,
    label: &str,
) -> Result<(Arc<dyn Room>, RoomEvents)> {
    let mut last_error = String::new();
    for attempt in 1..=JOIN_ATTEMPTS {
        if cancel.is_cancelled() {
            return Err(Error::ErrCancelled);
        }
        match connector.join(url, info, options).await {
            Ok(joined) => return Ok(joined),
            Err(err) => {
                warn!("{label}: join attempt {attempt}/{JOIN_ATTEMPTS} failed: {err}");
                last_error = err.to_string();
            }
        }
        if attempt < JOIN_ATTEMPTS {
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::ErrCancelled),
                _ = tokio::time::sleep(JOIN_BACKOFF) => {}
            }
        }
    }

    Err(Error::ErrJoinRetryExhausted {
        attempts: JOIN_ATTEMPTS,
        reason: last_error,
    })
}

impl TesterInner {
    /// Moves a running tester to `Failed`.
    pub(crate) async fn fail(&self, reason: String) {
        let mut state = self.state.lock().await;
        if *state == TesterState::Running {
            warn!("{}: {reason}", self.params.name);
            *state = TesterState::Failed(reason);
            drop(state);
            self.cancel.cancel();
        }
    }
}
