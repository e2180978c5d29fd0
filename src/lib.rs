pub mod audit;
pub mod config;
pub mod core_state;
pub mod db;
pub mod models;
pub mod pipeline;

use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;
use crate::core_state::CoreState;
use crate::pipeline::PipelineError;

/// Install the global tracing subscriber. Safe to call more than once.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .try_init();
}

/// Run the background worker until the process is stopped.
pub fn run() -> Result<(), PipelineError> {
    init_tracing();
    tracing::info!("SpecMatrix worker starting v{}", config::APP_VERSION);

    let config = AppConfig::from_env()?;
    let state = CoreState::from_config(config)?;

    let health = state.provider_health();
    for (role, status) in [("extraction", &health.extraction), ("analysis", &health.analysis)] {
        if status.available {
            tracing::info!(role, provider = %status.identity, "Provider available");
        } else {
            tracing::warn!(
                role,
                provider = %status.identity,
                detail = status.detail.as_deref().unwrap_or(""),
                "Provider unavailable"
            );
        }
    }

    let handle = state.start_dispatcher();
    handle.join();
    Ok(())
}
