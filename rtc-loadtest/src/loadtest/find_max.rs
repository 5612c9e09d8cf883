use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::{LoadTest, launch, stop_all};
use crate::bootstrap;
use crate::config::{FindMaxParams, LoadTestParams};
use crate::error::{Error, Result};
use crate::stats::format::{format_latency, format_loss};
use crate::stats::table::Table;
use crate::stats::{TestSummary, TesterSummary};
use crate::tester::{Tester, TesterParams};

/// Measurements taken at one subscriber count.
#[derive(Debug, Clone, Serialize)]
pub struct Checkpoint {
    pub subscribers: usize,
    pub tracks: usize,
    pub expected_tracks: usize,
    /// `None` when no latency sample landed inside the window.
    pub latency: Option<Duration>,
    pub dropped: u64,
    pub packets: u64,
}

impl Checkpoint {
    fn exceeds(&self, max_latency: Duration) -> bool {
        // every sample fell outside the latency window
        self.latency.is_none_or(|latency| latency >= max_latency)
    }
}

impl LoadTest {
    /// Adds subscribers until the mean latency reaches `find.max_latency`,
    /// writing one row per checkpoint.
    pub async fn find_max<W: Write + Send + ?Sized>(
        &self,
        find: FindMaxParams,
        cancel: CancellationToken,
        out: &mut W,
    ) -> Result<Vec<Checkpoint>> {
        let params = LoadTestParams {
            subscribers: 0,
            ..self.params.clone()
        };
        params.validate()?;
        if params.publishers() == 0 {
            return Err(Error::ErrInvalidConfig(
                "find max needs at least one publisher".to_owned(),
            ));
        }
        bootstrap::raise_fd_limit();
        let params = params.materialize();
        let publisher_tracks = params.expected_tracks();

        let latency_window = find.latency_window();
        let run_cancel = cancel.child_token();
        let mut testers = super::build_testers(
            &params,
            &self.connector,
            &self.library,
            &run_cancel,
            Some(latency_window),
        );
        self.start_batch(&params, testers.clone(), &run_cancel).await;

        let mut checkpoints = vec![];
        let mut target = find.initial_subscribers(publisher_tracks);
        let mut subscribers = 0;

        while !cancel.is_cancelled() {
            let batch: Vec<Tester> = (subscribers..target)
                .map(|j| {
                    let mut tester_params = TesterParams::from_load_test(
                        &params,
                        format!("Sub {j}"),
                        params.publishers() + j,
                    );
                    tester_params.expected_tracks = publisher_tracks;
                    tester_params.latency_window = Some(latency_window);
                    Tester::new(
                        tester_params,
                        Arc::clone(&self.connector),
                        self.library.clone(),
                        &run_cancel,
                    )
                })
                .collect();
            subscribers = target;
            testers.extend(batch.iter().cloned());
            self.start_batch(&params, batch, &run_cancel).await;

            for tester in &testers {
                tester.reset_stats().await;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(find.checkpoint_window) => {}
            }

            let checkpoint = checkpoint(&testers, subscribers).await;
            info!(
                "{} subscribers: latency {}, loss {}",
                checkpoint.subscribers,
                format_latency(checkpoint.latency),
                format_loss(checkpoint.dropped, checkpoint.packets)
            );
            let done = checkpoint.exceeds(find.max_latency);
            let latency = checkpoint.latency.unwrap_or(find.max_latency);
            checkpoints.push(checkpoint);
            if done {
                break;
            }
            target += find.next_delta(latency, publisher_tracks);
        }

        run_cancel.cancel();
        stop_all(&testers).await;
        write_checkpoints(out, &checkpoints)?;
        Ok(checkpoints)
    }

    /// Starts `batch` at the configured pace and waits for every startup.
    async fn start_batch(
        &self,
        params: &LoadTestParams,
        batch: Vec<Tester>,
        cancel: &CancellationToken,
    ) {
        let (errors_tx, mut errors_rx) = mpsc::unbounded_channel();
        let startups = TaskTracker::new();
        launch(
            params.clone(),
            batch,
            startups.clone(),
            errors_tx,
            cancel.clone(),
        )
        .await;
        startups.close();
        startups.wait().await;
        while let Ok((name, err)) = errors_rx.try_recv() {
            warn!("{name}: {err}");
        }
    }
}

async fn checkpoint(testers: &[Tester], subscribers: usize) -> Checkpoint {
    let mut summaries: Vec<TesterSummary> = Vec::with_capacity(testers.len());
    for tester in testers {
        summaries.push(tester.stats().await.summary());
    }
    let total = TestSummary::from_testers(&summaries);
    Checkpoint {
        subscribers,
        tracks: total.tracks,
        expected_tracks: total.expected_tracks,
        latency: total.mean_latency(),
        dropped: total.dropped,
        packets: total.packets,
    }
}

pub fn write_checkpoints<W: Write + ?Sized>(w: &mut W, checkpoints: &[Checkpoint]) -> io::Result<()> {
    let mut table = Table::new(&["Subs", "Tracks", "Latency", "Packet loss"]);
    for checkpoint in checkpoints {
        table.add_row(vec![
            checkpoint.subscribers.to_string(),
            format!("{}/{}", checkpoint.tracks, checkpoint.expected_tracks),
            format_latency(checkpoint.latency),
            format_loss(checkpoint.dropped, checkpoint.packets),
        ]);
    }
    table.render(w)
}
