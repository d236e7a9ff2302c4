use std::sync::Arc;

use clap::Parser;
use tracing::info;

use latchflow_bundles::{BundleScheduler, DownloadGuard, SchedulerConfig};
use latchflow_crypto::{ConfigCipher, ConfigEncryptionMode};
use latchflow_email::MemoryEmailProvider;
use latchflow_executor::{ActionConsumer, ConsumerConfig};
use latchflow_plugin::{PluginRegistry, TracingAuditSink};
use latchflow_queue::{MemoryQueue, QueueDriver};
use latchflow_server::api::{AppState, router};
use latchflow_server::auth::policy::{Compiled, DecisionLog};
use latchflow_server::auth::service::{AuthService, DeviceTokenCache};
use latchflow_server::config::LatchflowConfig;
use latchflow_server::ratelimit::RateLimiter;
use latchflow_storage::{MemoryStorageDriver, StorageService};
use latchflow_store::{HistoryConfig, MemoryStore};
use latchflow_triggers::{TriggerManager, TriggerRunner};

/// Latchflow HTTP server.
#[derive(Parser, Debug)]
#[command(name = "latchflow-server", about = "Secure file-distribution service")]
struct Cli {
    /// Override the bind port (`PORT` otherwise).
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = LatchflowConfig::from_env();
    if let Some(port) = cli.port {
        config.port = port;
    }
    let config = Arc::new(config);

    // Config encryption: AES-GCM when a key is present, plaintext otherwise.
    let cipher = match std::env::var("CONFIG_ENCRYPTION_KEY") {
        Ok(raw) => Arc::new(ConfigCipher::from_settings(
            ConfigEncryptionMode::AesGcm,
            Some(&raw),
            false,
        )?),
        Err(_) => Arc::new(ConfigCipher::plaintext()),
    };

    // Single-process reference backends. Alternative drivers implement the
    // same traits and slot in here.
    let store = Arc::new(MemoryStore::with_history(HistoryConfig {
        snapshot_interval: config.history_snapshot_interval,
        max_chain_depth: config.history_max_chain_depth,
    }));
    let storage = StorageService::new(
        Arc::new(MemoryStorageDriver::new()),
        config.storage_bucket.clone(),
        config.storage_key_prefix.clone(),
    );
    let queue = Arc::new(MemoryQueue::new());
    let email = Arc::new(MemoryEmailProvider::new());
    let registry = Arc::new(PluginRegistry::new());
    let audit = Arc::new(TracingAuditSink);

    let scheduler = BundleScheduler::new(
        store.clone(),
        storage.clone(),
        SchedulerConfig {
            debounce: config.bundle_rebuild_debounce,
        },
    );
    let guard = Arc::new(DownloadGuard::new(store.clone(), scheduler.clone()));

    let runner = Arc::new(TriggerRunner::new(store.clone(), queue.clone()));
    let manager = TriggerManager::new(
        store.clone(),
        registry.clone(),
        cipher.clone(),
        audit.clone(),
        runner,
    );

    let consumer = ActionConsumer::new(
        store.clone(),
        registry.clone(),
        cipher.clone(),
        audit,
        queue.clone(),
        ConsumerConfig {
            concurrency: config.plugin_action_concurrency,
            ..ConsumerConfig::default()
        },
    );
    consumer.attach().await?;
    manager.start_all().await?;

    let rate_limiter = Arc::new(RateLimiter::default());
    let device_tokens = Arc::new(DeviceTokenCache::new());
    let auth = Arc::new(AuthService::new(
        store.clone(),
        email.clone(),
        config.clone(),
        rate_limiter.clone(),
        device_tokens.clone(),
    ));

    let state = AppState {
        config: config.clone(),
        store,
        storage,
        queue: queue.clone(),
        scheduler: scheduler.clone(),
        guard,
        manager: manager.clone(),
        registry,
        email,
        auth,
        policy: Arc::new(Compiled::default()),
        authz_log: Arc::new(DecisionLog::default()),
        cipher,
        rate_limiter,
        device_tokens,
    };

    let listener =
        tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(port = config.port, "latchflow server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Drain in dependency order: deliveries first, runtimes last.
    queue.shutdown().await;
    consumer.shutdown().await;
    scheduler.stop().await;
    manager.stop_all().await;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("install ctrl-c handler");
    };
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install sigterm handler")
            .recv()
            .await;
    };
    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("shutdown signal received");
}
