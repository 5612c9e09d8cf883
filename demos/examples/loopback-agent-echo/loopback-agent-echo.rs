use std::io::Write;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use log::{error, info};
use tokio_util::sync::CancellationToken;

use loadtest::client::loopback::{LoopbackConfig, LoopbackSfu};
use loadtest::{AgentLoadTest, AgentLoadTestParams};

#[derive(Parser)]
#[command(name = "loopback-agent-echo")]
#[command(author = "Rusty Rain <y@liu.mx>")]
#[command(version = "0.0.0")]
#[command(about = "Dispatches loopback agents into echo rooms", long_about = None)]
struct Cli {
    #[arg(short, long)]
    debug: bool,
    #[arg(long, default_value_t = format!("INFO"))]
    log_level: String,

    #[arg(long, default_value_t = 3)]
    rooms: usize,
    #[arg(long, default_value_t = format!("echo-agent"))]
    agent_name: String,
    #[arg(long, default_value_t = 5)]
    echo_speech_delay_secs: u64,
    /// Seconds, 0 runs until Ctrl-C.
    #[arg(long, default_value_t = 15)]
    duration_secs: u64,
    #[arg(long, default_value_t = 100)]
    agent_join_delay_ms: u64,
    #[arg(long, default_value_t = format!(""))]
    inspector_base_url: String,
    #[arg(long)]
    json: bool,
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
        agent_join_delay: Duration::from_millis(cli.agent_join_delay_ms),
        ..Default::default()
    });
    let params = AgentLoadTestParams {
        url: "ws://loopback".to_owned(),
        api_key: sfu.config().api_key.clone(),
        api_secret: sfu.config().api_secret.clone(),
        rooms: cli.rooms,
        agent_name: cli.agent_name,
        echo_speech_delay: Duration::from_secs(cli.echo_speech_delay_secs),
        duration: Duration::from_secs(cli.duration_secs),
        inspector_base_url: cli.inspector_base_url,
        ..Default::default()
    };

    let test = AgentLoadTest::new(params, Arc::new(sfu.clone()), Arc::new(sfu.clone()));
    match test.run(cancel, &mut std::io::stdout()).await {
        Ok(rooms) if cli.json => println!("{}", serde_json::to_string_pretty(&rooms)?),
        Ok(_) => {}
        Err(err) => error!("agent load test failed: {err}"),
    }

    sfu.close().await;
    Ok(())
}
