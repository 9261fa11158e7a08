/// Install the process-wide tracing subscriber: structured logs on stderr,
/// filtered by RUST_LOG with an `info` default.
///
/// Example usage, first thing in main():
///
///   ops::tracing::install();
///
pub fn install() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .finish();

    // Already-installed is fine: tests install per-process.
    let _ = ::tracing::subscriber::set_global_default(subscriber);
}
