use std::io::Write;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use log::{error, info};
use tokio_util::sync::CancellationToken;

use loadtest::client::loopback::{LoopbackConfig, LoopbackSfu};
use loadtest::media::resources::DirResources;
use loadtest::media::{MediaLibrary, VideoCodec, VideoResolution};
use loadtest::{Layout, LoadTest, LoadTestParams};

#[derive(Parser)]
#[command(name = "loopback-loadtest")]
#[command(author = "Rusty Rain <y@liu.mx>")]
#[command(version = "0.0.0")]
#[command(about = "Runs a load test against the in-process loopback SFU", long_about = None)]
struct Cli {
    #[arg(short, long)]
    debug: bool,
    #[arg(long, default_value_t = format!("INFO"))]
    log_level: String,

    #[arg(long, default_value_t = 0)]
    video_publishers: usize,
    #[arg(long, default_value_t = 1)]
    audio_publishers: usize,
    #[arg(long, default_value_t = 5)]
    subscribers: usize,
    #[arg(long)]
    publisher_subscribe: bool,
    #[arg(long, default_value_t = format!("high"))]
    video_resolution: String,
    #[arg(long, default_value_t = format!(""))]
    video_codec: String,
    #[arg(long)]
    no_simulcast: bool,
    #[arg(long, default_value_t = 5.0)]
    num_per_second: f64,
    #[arg(long, default_value_t = format!("speaker"))]
    layout: String,
    /// Seconds, 0 runs until Ctrl-C.
    #[arg(long, default_value_t = 30.0)]
    duration: f64,
    /// Run the fixed case suite instead of a single test.
    #[arg(long)]
    suite: bool,
    /// Directory holding butterfly_*.h264/ivf and speech.ogg, synthetic media otherwise.
    #[arg(long)]
    resource_dir: Option<String>,
    /// Print the report as JSON after the tables.
    #[arg(long)]
    json: bool,

    /// Forwarding delay of the loopback SFU in milliseconds.
    #[arg(long, default_value_t = 0)]
    base_delay_ms: u64,
    /// Extra forwarding delay per active subscription in microseconds.
    #[arg(long, default_value_t = 0)]
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
        base_delay: Duration::from_millis(cli.base_delay_ms),
        per_subscription_delay: Duration::from_micros(cli.per_subscription_delay_us),
        ..Default::default()
    });
    let library = match &cli.resource_dir {
        Some(dir) => MediaLibrary::new(Arc::new(DirResources::new(dir))),
        None => MediaLibrary::synthetic(),
    };
    let codec = if cli.video_codec.is_empty() {
        None
    } else {
        Some(VideoCodec::from_str(&cli.video_codec)?)
    };
    let params = LoadTestParams {
        url: "ws://loopback".to_owned(),
        api_key: sfu.config().api_key.clone(),
        api_secret: sfu.config().api_secret.clone(),
        video_publishers: cli.video_publishers,
        audio_publishers: cli.audio_publishers,
        subscribers: cli.subscribers,
        publisher_subscribe: cli.publisher_subscribe,
        video_resolution: VideoResolution::from_str(&cli.video_resolution)?,
        video_codec: codec,
        simulcast: !cli.no_simulcast,
        num_per_second: cli.num_per_second,
        layout: Layout::from_str(&cli.layout)?,
        duration: Duration::try_from_secs_f64(cli.duration)?,
        ..Default::default()
    };

    let test = LoadTest::new(params, Arc::new(sfu.clone()), library);
    let mut stdout = std::io::stdout();
    if cli.suite {
        match test.run_suite(cancel, &mut stdout).await {
            Ok(results) if cli.json => println!("{}", serde_json::to_string_pretty(&results)?),
            Ok(_) => {}
            Err(err) => error!("suite failed: {err}"),
        }
    } else {
        match test.run(cancel, &mut stdout).await {
            Ok(report) if cli.json => println!("{}", serde_json::to_string_pretty(&report)?),
            Ok(_) => {}
            Err(err) => error!("load test failed: {err}"),
        }
    }

    sfu.close().await;
    Ok(())
}
