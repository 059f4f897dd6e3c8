use std::sync::Once;

use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "POLYTRACE_LOG";

static INIT: Once = Once::new();

/// Installs the global fmt subscriber. Filter directives come from `POLYTRACE_LOG`
/// and default to `warn`. Later calls are no-ops.
pub fn init_logging() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .try_init();
    });
}
