//! Log subscriber setup

use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable with the log filter; `RUST_LOG` is used when unset.
pub const LOG_ENV: &str = "PERMIT_LOG";
const DEFAULT_FILTER: &str = "info";

pub fn filter() -> EnvFilter {
	EnvFilter::try_from_env(LOG_ENV)
		.or_else(|_| EnvFilter::try_from_default_env())
		.unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global subscriber. Fails if one is already set.
pub fn init() -> anyhow::Result<()> {
	tracing_subscriber::registry()
		.with(filter())
		.with(fmt::layer().with_target(true))
		.try_init()?;
	Ok(())
}
