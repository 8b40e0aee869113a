//! introspect-worker: the process side of the introspection bridge.
//!
//! Loads an application snapshot, then serves model and route queries on
//! stdin/stdout until the controller asks it to stop.

pub mod app;
pub mod error;
pub mod handlers;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub use app::AppRuntime;
pub use error::WorkerError;
pub use handlers::router;

/// Level used when `INTROSPECT_LOG` is unset or unrecognized. The controller
/// reads stderr only to explain failures, so per-query chatter stays out of it.
const DEFAULT_LOG_LEVEL: LevelFilter = LevelFilter::ERROR;

fn log_level(value: Option<&str>) -> LevelFilter {
    value
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(DEFAULT_LOG_LEVEL)
}

fn filter_directive(level: LevelFilter) -> String {
    let level = level.to_string().to_ascii_lowercase();
    // Frame-level tracing would echo every payload.
    format!("introspect={level},introspect_worker={level},introspect::bridge::codec=off")
}

/// Logging setup for the worker process.
///
/// stdout carries protocol frames, so logs always go to stderr, without ANSI
/// colors since the controller may quote them in its own logs. `RUST_LOG`
/// overrides `INTROSPECT_LOG`; `LOG_FORMAT=json` switches to JSON lines.
pub fn init_tracing() {
    let filter = match std::env::var("RUST_LOG") {
        Ok(_) => EnvFilter::from_default_env(),
        Err(_) => {
            let level = log_level(std::env::var("INTROSPECT_LOG").ok().as_deref());
            EnvFilter::new(filter_directive(level))
        }
    };

    let json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");
    let text_layer = (!json).then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(false)
    });
    let json_layer = json.then(|| fmt::layer().json().with_writer(std::io::stderr));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(text_layer)
        .with(json_layer)
        .try_init();
}

/// Boot the runtime from `manifest` and serve stdin/stdout until shutdown.
///
/// A manifest that fails to load is returned as an error before anything is
/// written to stdout, so the controller never sees a handshake.
pub async fn serve(manifest: &Path) -> anyhow::Result<()> {
    let app = AppRuntime::load(manifest).context("failed to boot application runtime")?;
    let router = router(Arc::new(app));

    introspect::run_server(tokio::io::stdin(), tokio::io::stdout(), &router)
        .await
        .context("server loop failed")?;

    tracing::info!("Worker exiting");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_level_defaults_to_errors_only() {
        assert_eq!(log_level(None), LevelFilter::ERROR);
        assert_eq!(log_level(Some("chatty")), LevelFilter::ERROR);
    }

    #[test]
    fn log_level_accepts_level_names() {
        assert_eq!(log_level(Some("debug")), LevelFilter::DEBUG);
        assert_eq!(log_level(Some("WARN")), LevelFilter::WARN);
        assert_eq!(log_level(Some("off")), LevelFilter::OFF);
    }

    #[test]
    fn directive_silences_codec() {
        assert_eq!(
            filter_directive(LevelFilter::INFO),
            "introspect=info,introspect_worker=info,introspect::bridge::codec=off"
        );
    }
}
