use std::io::Write;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use log::{error, info};
use tokio_util::sync::CancellationToken;

use loadtest::client::loopback::{LoopbackConfig, LoopbackSfu};
use loadtest::media::MediaLibrary;
use loadtest::{FindMaxParams, LoadTest, LoadTestParams};

#[derive(Parser)]
#[command(name = "loopback-find-max")]
#[command(author = "Rusty Rain <y@liu.mx>")]
#[command(version = "0.0.0")]
#[command(about = "Adds subscribers to a loopback SFU until latency hits a ceiling", long_about = None)]
struct Cli {
    #[arg(short, long)]
    debug: bool,
    #[arg(long, default_value_t = format!("INFO"))]
    log_level: String,

    #[arg(long, default_value_t = 1)]
    audio_publishers: usize,
    #[arg(long, default_value_t = 0)]
    video_publishers: usize,
    #[arg(long, default_value_t = 400)]
    max_latency_ms: u64,
    #[arg(long, default_value_t = 5)]
    checkpoint_secs: u64,
    #[arg(long, default_value_t = 50)]
    track_budget: u32,
    #[arg(long, default_value_t = 20.0)]
    num_per_second: f64,

    /// Forwarding delay added per active subscription, in microseconds.
    #[arg(long, default_value_t = 500)]
    per_subscription_delay_us: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let log_level = log::LevelFilter::from_str(&cli.log_level)?;
    if cli.debug {
        env_logger::Builder::new()
            .format(|buf, record| {
                writeln!(
                    buf,
                    "{}:{} [{}] {} - {}",
                    record.file().unwrap_or("unknown"),
                    record.line().unwrap_or(0),
                    record.level(),
                    chrono::Local::now().format("%H:%M:%S.%6f"),
                    record.args()
                )
            })
            .filter(None, log_level)
            .init();
    } else {
        env_logger::Builder::new().filter(None, log_level).init();
    }

    let cancel = CancellationToken::new();
    let stop = cancel.clone();
    ctrlc::set_handler(move || stop.cancel())?;
    info!("Press Ctrl-C to stop");

    let sfu = LoopbackSfu::new(LoopbackConfig {
        per_subscription_delay: Duration::from_micros(cli.per_subscription_delay_us),
        ..Default::default()
    });
    let params = LoadTestParams {
        url: "ws://loopback".to_owned(),
        api_key: sfu.config().api_key.clone(),
        api_secret: sfu.config().api_secret.clone(),
        audio_publishers: cli.audio_publishers,
        video_publishers: cli.video_publishers,
        num_per_second: cli.num_per_second,
        ..Default::default()
    };
    let find = FindMaxParams {
        max_latency: Duration::from_millis(cli.max_latency_ms),
        checkpoint_window: Duration::from_secs(cli.checkpoint_secs),
        track_budget: cli.track_budget,
    };

    let test = LoadTest::new(params, Arc::new(sfu.clone()), MediaLibrary::synthetic());
    match test.find_max(find, cancel, &mut std::io::stdout()).await {
        Ok(checkpoints) => {
            if let Some(last) = checkpoints.last() {
                info!("stopped at {} subscribers", last.subscribers);
            }
        }
        Err(err) => error!("find max failed: {err}"),
    }

    sfu.close().await;
    Ok(())
}
