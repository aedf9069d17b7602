use backtrace::Backtrace;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Sets up logging from `LOG_LEVEL` (default `info`) and `LOG_PATH`.
///
/// With `LOG_PATH` set, logs go to a daily rolling file there; the returned
/// guard has to be kept alive for them to be flushed.
pub fn setup_tracing() -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_env("LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    let (file_layer, guard) = match std::env::var("LOG_PATH") {
        Ok(log_path) => {
            let file_appender = tracing_appender::rolling::daily(log_path, "pointtiles.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking);

            (Some(layer), Some(guard))
        }
        Err(_) => (None, None),
    };

    // on debug, also log to stdout
    let log_stdout = cfg!(debug_assertions) || file_layer.is_none();
    let stdout_layer = log_stdout.then(tracing_subscriber::fmt::layer);

    registry.with(file_layer).with(stdout_layer).init();

    set_panic_hook();

    guard
}

/// Routes panics into the log, so a crashed request handler shows up in the
/// rolling file and not only on stderr.
fn set_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let payload = info.payload();
        let reason = payload
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("non-string panic payload");
        let thread = std::thread::current();
        let location = info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_default();

        tracing::error!(
            thread = thread.name().unwrap_or("<unnamed>"),
            location = %location,
            backtrace = ?Backtrace::new(),
            "panicked: {reason}"
        );
    }));
}
