use tracing::Level;

/// Installs the fmt subscriber for this process. Debug mode is driven by the
/// per-stage environment marker (`SPAWNER_DEBUG` / `INITD_DEBUG`).
pub fn init(debug: bool) {
    let max_level = if debug { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_max_level(max_level)
        .with_target(false)
        .init();
}
