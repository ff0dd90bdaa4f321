use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use stream_capture::auth::{Authenticator, HttpAuthenticator};
use stream_capture::config::RecorderConfig;
use stream_capture::connectivity::{AlwaysOnline, ConnectivityProbe, HttpConnectivityProbe};
use stream_capture::downloader::CaptureSupervisor;
use stream_capture::history::ChannelHistoryStore;
use stream_capture::keywords::KeywordRules;
use stream_capture::logging::init_logging;
use stream_capture::notification::NotificationService;
use stream_capture::pipeline::PassthroughPipeline;
use stream_capture::recorder::RecorderContext;
use stream_capture::schedule::HttpScheduleSource;
use stream_capture::scheduler::ScheduleService;
use stream_capture::utils::{Clock, SystemClock};

const DEFAULT_CONFIG_PATH: &str = "appsettings.json";
const ENV_CONFIG_PATH: &str = "STREAM_CAPTURE_CONFIG";

struct Args {
    config_path: PathBuf,
    dry_run: bool,
}

fn parse_args() -> Args {
    let mut config_path = None;
    let mut dry_run = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--dry-run" => dry_run = true,
            other => config_path = Some(PathBuf::from(other)),
        }
    }
    let config_path = config_path
        .or_else(|| std::env::var_os(ENV_CONFIG_PATH).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    Args {
        config_path,
        dry_run,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables before the config reads its overrides
    dotenvy::dotenv().ok();

    let args = parse_args();
    let config = RecorderConfig::load(&args.config_path)
        .with_context(|| format!("loading {}", args.config_path.display()))?;
    let config = Arc::new(config);

    let _log_guard = init_logging(&config.log_path)?;
    info!(config = %args.config_path.display(), "stream-capture starting");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let authenticator: Arc<dyn Authenticator> = Arc::new(HttpAuthenticator::new(
        &config.auth_url,
        &config.user,
        &config.pass,
    ));
    if let Err(e) = authenticator.authenticate(clock.now()).await {
        error!("Cannot authenticate with the upstream service: {}", e);
        return Err(e).context("initial authentication");
    }
    info!("Authenticated");

    let history = Arc::new(ChannelHistoryStore::new(
        &config.history_path,
        Arc::clone(&clock),
    ));
    history.load().await;

    let rules = KeywordRules::load(&config.keywords_path)
        .with_context(|| format!("loading {}", config.keywords_path.display()))?;
    info!(rules = rules.len(), "Loaded keyword rules");

    let connectivity: Arc<dyn ConnectivityProbe> = match &config.connectivity_url {
        Some(url) => Arc::new(HttpConnectivityProbe::new(url)),
        None => Arc::new(AlwaysOnline),
    };

    let ctx = RecorderContext {
        config: Arc::clone(&config),
        history,
        authenticator,
        schedule: Arc::new(HttpScheduleSource::new(
            &config.schedule_url,
            config.schedule_file.clone(),
            config.min_schedule_channels,
        )),
        capture: Arc::new(CaptureSupervisor::new()),
        connectivity,
        pipeline: Arc::new(PassthroughPipeline),
        notifier: NotificationService::new(&config.notification),
        clock,
    };

    let shutdown = CancellationToken::new();
    let (mut service, _control) = ScheduleService::new(ctx, Arc::new(rules), shutdown.clone());

    if args.dry_run {
        let admitted = service.dry_run().await?;
        info!(admitted = admitted.len(), "Dry run finished");
        return Ok(());
    }

    let service_task = tokio::spawn(service.run());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested, stopping recordings");
    shutdown.cancel();
    service_task.await?;

    info!("stream-capture stopped");
    Ok(())
}
