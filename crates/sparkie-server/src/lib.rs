pub mod config;

/// Log filter used when `RUST_LOG` is unset: every Sparkie crate plus the
/// HTTP trace layer at debug.
pub const DEFAULT_LOG_FILTER: &str =
    "sparkie=debug,sparkie_server=debug,sparkie_api=debug,sparkie_db=debug,sparkie_llm=debug,tower_http=debug";

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::EnvFilter;

    #[test]
    fn default_log_filter_covers_every_crate() {
        assert!(EnvFilter::try_new(DEFAULT_LOG_FILTER).is_ok());
        for target in ["sparkie", "sparkie_server", "sparkie_api", "sparkie_db", "sparkie_llm", "tower_http"] {
            let directive = format!("{target}=debug");
            assert!(
                DEFAULT_LOG_FILTER.split(',').any(|d| d == directive),
                "{target} missing from default filter"
            );
        }
    }
}
