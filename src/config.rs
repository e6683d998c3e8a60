//! Global configuration, loaded once at startup and handed to each
//! component's constructor (spec.md §9 "Global configuration object").

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: std::net::SocketAddr,

    /// `ChatDb.ConnectionString` — durable store location.
    pub chat_db_path: String,

    /// `Redis.ConnectionString` — backing store for `PresenceStore`.
    /// Optional; presence degrades gracefully without it.
    pub redis_url: Option<String>,

    /// `Presence.TtlSeconds` (default 300).
    pub presence_ttl: Duration,

    /// `Classifier.HeuristicThreshold` (0.85).
    pub classifier_heuristic_threshold: f64,
    /// `Classifier.LearnedThreshold` (0.70).
    pub classifier_learned_threshold: f64,

    /// `Llm.ModelName`, `Llm.Temperature`, `Llm.MaxTokens`, `Llm.TimeoutSeconds`.
    pub llm_model_name: Option<String>,
    pub llm_temperature: f32,
    pub llm_max_tokens: u32,
    pub llm_timeout: Duration,

    /// `Orchestration.HistoryDepth` (10).
    pub orchestration_history_depth: u32,

    /// Selects which wire carries `AgentResponse`: bus publish (default) or
    /// the `InternalService` HTTP callback (spec.md §9 Open Question).
    pub orchestration_delivery_mode: DeliveryMode,

    /// Deadline for the classifier's learned/LLM tiers and context fetch.
    pub classifier_timeout: Duration,

    /// Deadline for gateway-to-gateway service callbacks.
    pub gateway_callback_timeout: Duration,

    /// Base URL for the gateway's `InternalService` surface, used only when
    /// `orchestration_delivery_mode == GatewayCallback`.
    pub gateway_internal_base_url: String,

    /// Secret used to verify bearer JWTs issued by the auth collaborator.
    pub jwt_signing_secret: String,

    /// Credential accepted by the `InternalService` authorization policy.
    pub internal_service_token: String,

    /// `FileStorage.MaxFileSizeBytes` (~50 MiB) and allow-listed types.
    /// Attachment validation is the upload collaborator's job; the core
    /// only needs the limits to validate referenced `Attachment` DTOs.
    pub file_storage_max_bytes: u64,
    pub file_storage_allowed_mime_types: Vec<String>,

    /// Grace period bus consumers have to drain in-flight work on shutdown.
    pub shutdown_grace_period: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Bus,
    GatewayCallback,
}

impl Config {
    pub fn from_env() -> Self {
        let bind_addr = std::env::var("CHATCORE_BIND_ADDR")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| std::net::SocketAddr::from(([0, 0, 0, 0], 8000)));

        let chat_db_path = std::env::var("ChatDb__ConnectionString")
            .or_else(|_| std::env::var("CHAT_DB_PATH"))
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                format!("{home}/.chatcore/chatcore.db")
            });

        let redis_url = std::env::var("Redis__ConnectionString")
            .or_else(|_| std::env::var("REDIS_URL"))
            .ok();

        let presence_ttl = Duration::from_secs(env_u64("Presence__TtlSeconds", 300));

        let classifier_heuristic_threshold =
            env_f64("Classifier__HeuristicThreshold", 0.85);
        let classifier_learned_threshold = env_f64("Classifier__LearnedThreshold", 0.70);

        let llm_model_name = std::env::var("Llm__ModelName").ok();
        let llm_temperature = env_f64("Llm__Temperature", 0.7) as f32;
        let llm_max_tokens = env_u64("Llm__MaxTokens", 4096) as u32;
        let llm_timeout = Duration::from_secs(env_u64("Llm__TimeoutSeconds", 60));

        let orchestration_history_depth = env_u64("Orchestration__HistoryDepth", 10) as u32;
        let orchestration_delivery_mode = match std::env::var("Orchestration__DeliveryMode")
            .unwrap_or_default()
            .to_ascii_lowercase()
            .as_str()
        {
            "gateway_callback" | "callback" => DeliveryMode::GatewayCallback,
            _ => DeliveryMode::Bus,
        };

        let classifier_timeout = Duration::from_secs(env_u64("Classifier__TimeoutSeconds", 10));
        let gateway_callback_timeout =
            Duration::from_secs(env_u64("Gateway__CallbackTimeoutSeconds", 30));
        let gateway_internal_base_url = std::env::var("Gateway__InternalBaseUrl")
            .unwrap_or_else(|_| format!("http://{bind_addr}"));

        let jwt_signing_secret =
            std::env::var("Auth__JwtSigningSecret").unwrap_or_else(|_| "dev-insecure-secret".to_string());
        let internal_service_token = std::env::var("Auth__InternalServiceToken")
            .unwrap_or_else(|_| "dev-internal-service-token".to_string());

        let file_storage_max_bytes = env_u64("FileStorage__MaxFileSizeBytes", 50 * 1024 * 1024);
        let file_storage_allowed_mime_types = std::env::var("FileStorage__AllowedMimeTypes")
            .map(|s| s.split(',').map(|v| v.trim().to_string()).collect())
            .unwrap_or_else(|_| {
                vec![
                    "image/png".to_string(),
                    "image/jpeg".to_string(),
                    "text/plain".to_string(),
                    "application/pdf".to_string(),
                ]
            });

        let shutdown_grace_period =
            Duration::from_secs(env_u64("Shutdown__GracePeriodSeconds", 30));

        Self {
            bind_addr,
            chat_db_path,
            redis_url,
            presence_ttl,
            classifier_heuristic_threshold,
            classifier_learned_threshold,
            llm_model_name,
            llm_temperature,
            llm_max_tokens,
            llm_timeout,
            orchestration_history_depth,
            orchestration_delivery_mode,
            classifier_timeout,
            gateway_callback_timeout,
            gateway_internal_base_url,
            jwt_signing_secret,
            internal_service_token,
            file_storage_max_bytes,
            file_storage_allowed_mime_types,
            shutdown_grace_period,
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
