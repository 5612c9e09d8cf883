//! LoadTest orchestrates a population of testers against one room.

#[cfg(test)]
mod loadtest_test;

pub mod find_max;
pub mod report;
pub mod suite;

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::bootstrap;
use crate::client::SfuConnector;
use crate::config::LoadTestParams;
use crate::error::{Error, Result};
use crate::media::MediaLibrary;
use crate::stats::{TestSummary, TesterStats, TesterSummary};
use crate::tester::{Tester, TesterParams};

/// How often the orchestrator checks whether any tester is still running.
const LIVENESS_INTERVAL: Duration = Duration::from_millis(500);

/// Result of one load test run.
#[derive(Debug, Clone, Serialize)]
pub struct LoadTestReport {
    /// Params with the generated room and identity prefix filled in.
    pub params: LoadTestParams,
    pub testers: Vec<TesterStats>,
    pub summary: TestSummary,
}

impl LoadTestReport {
    pub fn tester_summaries(&self) -> Vec<TesterSummary> {
        self.testers.iter().map(TesterStats::summary).collect()
    }
}

/// LoadTest runs publishers and subscribers in one room and reports what
/// every subscriber received.
pub struct LoadTest {
    params: LoadTestParams,
    connector: Arc<dyn SfuConnector>,
    library: MediaLibrary,
}

impl LoadTest {
    pub fn new(
        params: LoadTestParams,
        connector: Arc<dyn SfuConnector>,
        library: MediaLibrary,
    ) -> Self {
        LoadTest {
            params,
            connector,
            library,
        }
    }

    pub fn params(&self) -> &LoadTestParams {
        &self.params
    }

    /// Runs until `cancel` fires, the duration elapses or no tester is left
    /// running, then stops every tester and writes the report to `out`.
    pub async fn run<W: Write + Send + ?Sized>(
        &self,
        cancel: CancellationToken,
        out: &mut W,
    ) -> Result<LoadTestReport> {
        self.params.validate()?;
        bootstrap::raise_fd_limit();
        let params = self.params.materialize();
        info!(
            "starting load test in {} with {} publishers and {} subscribers",
            params.room,
            params.publishers(),
            params.subscribers
        );

        let run_cancel = cancel.child_token();
        let testers = build_testers(&params, &self.connector, &self.library, &run_cancel, None);

        let (errors_tx, mut errors_rx) = mpsc::unbounded_channel();
        let startups = TaskTracker::new();
        let launcher = tokio::spawn(launch(
            params.clone(),
            testers.clone(),
            startups.clone(),
            errors_tx,
            run_cancel.clone(),
        ));

        let deadline = (!params.duration.is_zero()).then(|| Instant::now() + params.duration);
        let mut errors = BTreeMap::new();
        let mut launched = false;
        let mut liveness = tokio::time::interval(LIVENESS_INTERVAL);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("load test cancelled");
                    break;
                }
                _ = sleep_until_deadline(deadline) => {
                    info!("load test duration elapsed");
                    break;
                }
                Some((name, err)) = errors_rx.recv() => {
                    warn!("{name}: {err}");
                    errors.insert(name, err.to_string());
                }
                _ = liveness.tick() => {
                    if !launched && launcher.is_finished() {
                        launched = true;
                        startups.close();
                    }
                    if launched && startups.is_empty() && !any_running(&testers).await {
                        info!("no tester is running");
                        break;
                    }
                }
            }
        }

        run_cancel.cancel();
        if let Err(err) = launcher.await {
            warn!("launcher failed: {err}");
        }
        startups.close();
        startups.wait().await;
        while let Ok((name, err)) = errors_rx.try_recv() {
            errors.insert(name, err.to_string());
        }
        stop_all(&testers).await;

        let mut stats = Vec::with_capacity(testers.len());
        for tester in &testers {
            stats.push(tester.stats().await);
        }
        let summaries: Vec<TesterSummary> = stats.iter().map(TesterStats::summary).collect();
        let mut summary = TestSummary::from_testers(&summaries);
        summary.errors = errors;

        for tester in &stats {
            report::write_tester_stats(out, tester)?;
        }
        report::write_summary(out, &summaries, &summary)?;

        Ok(LoadTestReport {
            params,
            testers: stats,
            summary,
        })
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn any_running(testers: &[Tester]) -> bool {
    for tester in testers {
        if tester.is_running().await {
            return true;
        }
    }
    false
}

/// Publishers first, as `Pub i`, then subscribers as `Sub j`.
pub(crate) fn build_testers(
    params: &LoadTestParams,
    connector: &Arc<dyn SfuConnector>,
    library: &MediaLibrary,
    cancel: &CancellationToken,
    latency_window: Option<Duration>,
) -> Vec<Tester> {
    let publishers = params.publishers();
    let expected = params.expected_tracks();
    let mut testers = Vec::with_capacity(params.testers());

    for i in 0..publishers {
        let own = usize::from(i < params.video_publishers) + usize::from(i < params.audio_publishers);
        let mut tester_params = TesterParams::from_load_test(params, format!("Pub {i}"), i);
        tester_params.latency_window = latency_window;
        tester_params.subscribe = params.publisher_subscribe;
        tester_params.expected_tracks = if params.publisher_subscribe {
            expected - own
        } else {
            0
        };
        testers.push(Tester::new(
            tester_params,
            Arc::clone(connector),
            library.clone(),
            cancel,
        ));
    }
    for j in 0..params.subscribers {
        let mut tester_params =
            TesterParams::from_load_test(params, format!("Sub {j}"), publishers + j);
        tester_params.latency_window = latency_window;
        tester_params.expected_tracks = expected;
        testers.push(Tester::new(
            tester_params,
            Arc::clone(connector),
            library.clone(),
            cancel,
        ));
    }
    testers
}

/// Starts tester `i` at `i / num_per_second` seconds, each startup running
/// on its own task.
pub(crate) async fn launch(
    params: LoadTestParams,
    testers: Vec<Tester>,
    startups: TaskTracker,
    errors: mpsc::UnboundedSender<(String, Error)>,
    cancel: CancellationToken,
) {
    let started = Instant::now();
    let interval = match params.startup_interval() {
        Ok(interval) => interval,
        Err(err) => {
            warn!("not launching testers: {err}");
            return;
        }
    };
    let params = Arc::new(params);

    for (i, tester) in testers.into_iter().enumerate() {
        let Some(at) = interval
            .checked_mul(i as u32)
            .and_then(|offset| started.checked_add(offset))
        else {
            warn!("startup of {} is out of time range", tester.name());
            return;
        };
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep_until(at) => {}
        }

        let params = Arc::clone(&params);
        let errors = errors.clone();
        startups.spawn(async move {
            let name = tester.name().to_owned();
            if let Err(err) = start_tester(&params, &tester).await {
                if !matches!(err, Error::ErrCancelled) {
                    let _ = errors.send((name, err));
                }
            }
        });
    }
    debug!("launched {} testers", startups.len());
}

async fn start_tester(params: &LoadTestParams, tester: &Tester) -> Result<()> {
    tester.start().await?;
    let i = tester.params().sequence;
    if i >= params.publishers() {
        return Ok(());
    }

    let identity = tester.params().identity();
    if i < params.audio_publishers {
        tester
            .publish_audio_track(&format!("{identity}-audio"))
            .await?;
    }
    if i < params.video_publishers {
        let name = format!("{identity}-video");
        if params.simulcast {
            tester
                .publish_simulcast_track(&name, params.video_resolution, params.codec())
                .await?;
        } else {
            tester
                .publish_video_track(&name, params.video_resolution, params.codec())
                .await?;
        }
    }
    Ok(())
}

pub(crate) async fn stop_all(testers: &[Tester]) {
    let mut set = JoinSet::new();
    for tester in testers {
        let tester = tester.clone();
        set.spawn(async move { tester.stop().await });
    }
    while set.join_next().await.is_some() {}
}
