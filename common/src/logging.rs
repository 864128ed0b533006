use tracing_subscriber::EnvFilter;

/// Instala el subscriber `fmt` con filtro por `RUST_LOG` o, si no está
/// definido, por `default_filter` (ej: `"coordinator=debug,axum=info"`).
///
/// Se puede llamar varias veces (tests, clúster local): sólo la primera
/// instala el subscriber.
pub fn init(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
