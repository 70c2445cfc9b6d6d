use clap::Parser;
use dotenv::dotenv;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_appender::rolling;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use sentinel_scheduler::monitor::coordinator::Coordinator;
use sentinel_scheduler::monitor::probe::HttpProbe;
use sentinel_scheduler::notifications::{LogSink, NotificationSink, WebhookSink};
use sentinel_scheduler::server::config::SchedulerConfig;
use sentinel_scheduler::store::MemoryTargetStore;
use sentinel_scheduler::version::VERSION;
use sentinel_scheduler::web::{AppState, create_axum_router};

#[derive(Parser, Debug)]
#[command(author, version = VERSION, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<String>,
}

fn init_logging(log_dir: &str) {
    // Log to a file: JSON format, daily rotation
    let file_appender = rolling::daily(log_dir, "scheduler.log");
    let file_layer = fmt::layer()
        .with_writer(file_appender)
        .with_ansi(false)
        .json();

    // Log to stdout: human-readable format
    let stdout_layer = fmt::layer().with_writer(std::io::stdout);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,hyper=warn,reqwest=warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();
    dotenv().ok();

    // Logging depends on log_dir, so config errors before this point go to stderr.
    let config = match SchedulerConfig::load(args.config.as_deref()) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("Failed to load scheduler configuration: {e}");
            return Err(e.into());
        }
    };

    init_logging(&config.log_dir);
    info!("Starting scheduler service, version: {}", VERSION);

    let store = Arc::new(
        MemoryTargetStore::with_targets(config.seed_targets())
            .with_retention(config.check_log_retention),
    );
    info!(
        targets = config.targets.len(),
        retention = config.check_log_retention,
        "Seeded target store."
    );

    let probe = Arc::new(HttpProbe::new(config.probe_timeout())?);

    let sink: Arc<dyn NotificationSink> = match &config.notification_webhook_url {
        Some(url) => {
            let sink = WebhookSink::new(
                url.clone(),
                config.notification_body_template.clone(),
                config.notify_timeout(),
            )?;
            info!(url = %url, "Transition notifications go to webhook.");
            Arc::new(sink)
        }
        None => {
            warn!("No notification webhook configured; transitions are only logged.");
            Arc::new(LogSink)
        }
    };

    let engine = match Coordinator::new(config.engine_config(), store.clone(), probe, sink).start() {
        Ok(handle) => Arc::new(handle),
        Err(e) => {
            error!(error = %e, "Failed to start scheduler engine.");
            return Err(e.into());
        }
    };

    let app_state = Arc::new(AppState {
        engine: engine.clone(),
        store,
        config: config.clone(),
    });
    let app = create_axum_router(app_state);

    let listener = tokio::net::TcpListener::bind(config.listen_address).await?;
    info!(address = %config.listen_address, "Control surface listening.");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal.");
            }
            info!("Shutdown signal received.");
        })
        .await;

    engine.stop().await;
    info!("Scheduler service stopped.");
    served?;
    Ok(())
}
