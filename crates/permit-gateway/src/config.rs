//! Loading the permission config file into a shared resolver

use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use permit_core::{BackendRegistry, Config, Resolver};
use tracing::info;

/// Environment variable overriding the configuration path
pub const CONFIG_ENV: &str = "PERMIT_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "permissions.conf";

/// Path to load: `PERMIT_CONFIG` if set, then `explicit`, then the default.
pub fn config_path(explicit: Option<PathBuf>) -> PathBuf {
	resolve_path(env::var_os(CONFIG_ENV).map(PathBuf::from), explicit)
}

fn resolve_path(from_env: Option<PathBuf>, explicit: Option<PathBuf>) -> PathBuf {
	from_env
		.filter(|p| !p.as_os_str().is_empty())
		.or(explicit)
		.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

pub fn parse_config(
	contents: &str,
	filename: Option<&Path>,
	registry: &BackendRegistry,
) -> anyhow::Result<Config> {
	let name = filename
		.map(|f| f.display().to_string())
		.unwrap_or_else(|| "<inline>".to_string());
	Config::parse(contents, registry).with_context(|| format!("invalid permission config {name}"))
}

/// Read and parse a configuration file into a ready resolver.
pub fn load(path: &Path, registry: &BackendRegistry) -> anyhow::Result<Arc<Resolver>> {
	let contents = std::fs::read_to_string(path)
		.with_context(|| format!("failed to read permission config {}", path.display()))?;
	let config = parse_config(&contents, Some(path), registry)?;
	info!(
		path = %path.display(),
		backends = config.backends.len(),
		"permission config loaded"
	);
	Ok(Arc::new(config.into_resolver()))
}

/// Load from [`config_path`] with the builtin backends.
pub fn load_from_env(explicit: Option<PathBuf>) -> anyhow::Result<Arc<Resolver>> {
	load(&config_path(explicit), &BackendRegistry::with_builtin())
}
