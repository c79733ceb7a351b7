use tracing_subscriber::{fmt, EnvFilter};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_DIRECTIVES: &str =
    "cairn_core=debug,cairn_net=info,cairn_media=info,cairn_store=info,warn";

/// Install the global `tracing` subscriber. `RUST_LOG` takes precedence over
/// `default_directives`. Calling this twice is harmless.
pub fn init_tracing(default_directives: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}
