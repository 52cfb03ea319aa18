use std::sync::OnceLock;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

static INITIALISED: OnceLock<()> = OnceLock::new();

/// installs the global fmt subscriber. The filter defaults to `info` and can be overridden with
/// `RUST_LOG`. Calling this more than once is a no-op
pub fn init_tracing() {
    if INITIALISED.set(()).is_err() {
        return;
    }
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    // another subscriber may already be installed by a host application
    let _ = Registry::default().with(filter).with(fmt_layer).try_init();
}
