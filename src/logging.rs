/// Logging initialization: stderr via `tracing-subscriber`, filterable with
/// `RUST_LOG`. Called once from `Messenger::new`; repeat calls are no-ops.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "veil_core=debug,info".into()),
        )
        .try_init();
}
