use crate::config::Settings;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Inicjalizacja logowania: `RUST_LOG` ma pierwszeństwo, potem `logging.level`.
/// Format tekstowy; `logging.json` wyłącza tylko kolory (bez feature'u json).
pub fn init(settings: &Settings) {
    let level = settings
        .logging
        .level
        .clone()
        .unwrap_or_else(|| "info".to_string());

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let plain = settings.logging.json.unwrap_or(false);

    let fmt_layer = fmt::layer().with_target(true).with_ansi(!plain);

    // Drugi init (np. w testach) zostawia istniejący subscriber.
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init();
}
