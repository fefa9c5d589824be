use anyhow::Context;
use clap::Parser;
use kafka_firehose_nozzle::{Config, Relay};
use std::path::PathBuf;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "kafka-firehose-nozzle")]
#[command(about = "Republishes firehose envelopes onto Kafka topics", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,

    #[arg(short, long, value_name = "FILE", help = "Read envelopes from FILE instead of stdin")]
    input: Option<PathBuf>,

    #[arg(short, long, help = "Log envelopes instead of producing them to Kafka")]
    debug: bool,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Starting kafka-firehose-nozzle");
    info!("Loading configuration from {:?}", args.config);

    let mut config = Config::from_file(&args.config)
        .with_context(|| format!("failed to load configuration from {:?}", args.config))?;
    if args.debug {
        config.nozzle.debug = true;
    }

    info!(
        kafka_brokers = ?config.kafka.brokers,
        retry_max = config.kafka.retry_max(),
        retry_backoff_ms = config.kafka.retry_backoff().as_millis() as u64,
        debug = config.nozzle.debug,
        "Configuration summary"
    );

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received interrupt, shutting down");
                signal_token.cancel();
            }
            Err(e) => error!("Failed to listen for interrupt: {}", e),
        }
    });

    let relay = Relay::new(config);
    let result = match &args.input {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("failed to open input {:?}", path))?;
            relay.run(BufReader::new(file), shutdown).await
        }
        None => relay.run(BufReader::new(tokio::io::stdin()), shutdown).await,
    };

    let snapshot = result.context("nozzle stopped with an error")?;
    info!(
        consume = snapshot.consume,
        publish = snapshot.publish,
        publish_fail = snapshot.publish_fail,
        "Shutdown complete"
    );

    Ok(())
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("kafka_firehose_nozzle=debug,nozzle=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("kafka_firehose_nozzle=info,nozzle=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
