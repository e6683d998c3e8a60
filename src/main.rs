//! chatcore - chat gateway and agent orchestration backend
//!
//! Terminates the client-facing duplex transport, persists conversation
//! history, classifies each user turn, and routes it to an LLM or a
//! longer-running execution strategy.

mod auth;
mod bus;
mod classifier;
mod config;
mod db;
mod domain;
mod error;
mod gateway;
mod llm;
mod orchestration;
mod presence;
mod validation;

use auth::AuthVerifier;
use bus::InMemoryEventBus;
use classifier::HybridClassifier;
use config::Config;
use db::SqliteConversationStore;
use gateway::{AppState, ConversationHub};
use llm::{LlmConfig, ModelRegistry};
use orchestration::{BusReplyDelivery, GatewayCallbackDelivery, OrchestrationWorker, ReplyDelivery};
use presence::InMemoryPresenceStore;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Waits for SIGTERM or SIGINT (ctrl-c). Mirrors the signal set the teacher's
/// own hot-restart shutdown handler watches, minus the SIGHUP restart path —
/// this process always exits on a shutdown signal rather than re-execing.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
            _ = sigint.recv() => tracing::info!("received SIGINT, shutting down"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("failed to install ctrl-c handler");
        tracing::info!("received ctrl-c, shutting down");
    }
}

/// Number of competing `OrchestrationWorker` consumers to run. Keeps one
/// slow LLM call from starving the rest of the `MessageSent` backlog.
const ORCHESTRATION_WORKER_POOL_SIZE: usize = 4;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chatcore=info,tower_http=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let config = Config::from_env();

    if let Some(parent) = PathBuf::from(&config.chat_db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    tracing::info!(path = %config.chat_db_path, "opening conversation store");
    let store: Arc<dyn db::ConversationRepository> = Arc::new(SqliteConversationStore::open(&config.chat_db_path)?);

    let presence: Arc<dyn presence::PresenceStore> = match &config.redis_url {
        #[cfg(feature = "redis-presence")]
        Some(url) => {
            tracing::info!("using redis-backed presence store");
            Arc::new(presence::RedisPresenceStore::connect(url, config.presence_ttl).await?)
        }
        #[cfg(not(feature = "redis-presence"))]
        Some(_) => {
            tracing::warn!(
                "Redis__ConnectionString set but redis-presence feature is disabled; falling back to in-memory presence"
            );
            Arc::new(InMemoryPresenceStore::new(config.presence_ttl))
        }
        None => Arc::new(InMemoryPresenceStore::new(config.presence_ttl)),
    };

    let bus: Arc<dyn bus::EventBus> = Arc::new(InMemoryEventBus::new());

    let llm_config = LlmConfig::from_env();
    let llm_registry = Arc::new(ModelRegistry::new(&llm_config));
    if llm_registry.has_models() {
        tracing::info!(
            models = ?llm_registry.available_models(),
            default = %llm_registry.default_model_id(),
            "LLM registry initialized"
        );
    } else {
        tracing::warn!("no LLM API keys configured; set ANTHROPIC_API_KEY, OPENAI_API_KEY, FIREWORKS_API_KEY or LLM_GATEWAY");
    }

    let classifier_llm = llm_registry.get_cheap_model();
    let classifier = Arc::new(HybridClassifier::new(
        config.classifier_heuristic_threshold,
        config.classifier_learned_threshold,
        classifier_llm,
    ));

    let conversation_llm = config
        .llm_model_name
        .as_deref()
        .and_then(|id| llm_registry.get(id))
        .or_else(|| llm_registry.default())
        .ok_or("no LLM model available to drive the orchestration worker")?;

    let delivery: Arc<dyn ReplyDelivery> = match config.orchestration_delivery_mode {
        config::DeliveryMode::Bus => Arc::new(BusReplyDelivery::new(bus.clone())),
        config::DeliveryMode::GatewayCallback => Arc::new(GatewayCallbackDelivery::new(
            config.gateway_internal_base_url.clone(),
            config.internal_service_token.clone(),
            config.gateway_callback_timeout,
        )),
    };

    let shutdown = CancellationToken::new();
    let mut worker_handles = Vec::with_capacity(ORCHESTRATION_WORKER_POOL_SIZE);
    for worker_id in 0..ORCHESTRATION_WORKER_POOL_SIZE {
        let worker = Arc::new(OrchestrationWorker::new(
            store.clone(),
            classifier.clone(),
            conversation_llm.clone(),
            delivery.clone(),
            config.orchestration_history_depth,
            config.llm_max_tokens,
        ));
        let bus_for_worker = bus.clone();
        let worker_shutdown = shutdown.clone();
        let grace_period = config.shutdown_grace_period;
        worker_handles.push(tokio::spawn(async move {
            tracing::info!(worker_id, "orchestration worker started");
            worker.run(bus_for_worker, worker_shutdown, grace_period).await;
            tracing::info!(worker_id, "orchestration worker drained and stopped");
        }));
    }

    let state = AppState {
        store,
        bus: bus.clone(),
        presence,
        auth: AuthVerifier::new(&config),
        hub: Arc::new(ConversationHub::new()),
        llm_registry,
        config: config.clone(),
    };

    let mut consumer_handle = None;
    if config.orchestration_delivery_mode == config::DeliveryMode::Bus {
        let consumer_state = state.clone();
        let consumer_shutdown = shutdown.clone();
        consumer_handle = Some(tokio::spawn(async move {
            gateway::run_agent_response_consumer(consumer_state, consumer_shutdown).await;
        }));
    }

    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);
    let compression = CompressionLayer::new().gzip(true).br(true).deflate(true).zstd(true);

    let app = gateway::router(state)
        .layer(cors)
        .layer(compression)
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "chatcore listening");

    let serve_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            serve_shutdown.cancel();
        })
        .await?;

    tracing::info!(
        grace_period_secs = config.shutdown_grace_period.as_secs(),
        "draining orchestration workers and agent-response consumer"
    );
    for handle in worker_handles {
        let _ = handle.await;
    }
    if let Some(handle) = consumer_handle {
        let _ = handle.await;
    }

    Ok(())
}
