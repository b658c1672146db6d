//! Configuration loading from disk.
//!
//! A missing file yields defaults. A file that exists but cannot be read or
//! parsed is an error: the mediator refuses to start on a half-read config.

use lime_types::config::MediatorConfig;
use lime_types::error::{LimeError, LimeResult};
use lime_wire::TlsMaterial;
use std::path::{Path, PathBuf};
use tracing::info;

/// Load, resolve and validate the mediator configuration.
pub fn load_config(path: Option<&Path>) -> LimeResult<MediatorConfig> {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(MediatorConfig::default_path);

    let mut config = if config_path.exists() {
        let contents = std::fs::read_to_string(&config_path).map_err(|e| {
            LimeError::Config(format!("reading {}: {e}", config_path.display()))
        })?;
        let config: MediatorConfig = toml::from_str(&contents).map_err(|e| {
            LimeError::Config(format!("parsing {}: {e}", config_path.display()))
        })?;
        info!(
            path = %config_path.display(),
            agents = config.agents.len(),
            "Loaded configuration"
        );
        config
    } else {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
        MediatorConfig::default()
    };

    if let Some(dir) = config_path.parent() {
        resolve_relative_paths(&mut config, dir);
    }
    config.validate()?;
    Ok(config)
}

/// Load the server certificate, key and root named by the configuration.
pub fn load_tls(config: &MediatorConfig) -> LimeResult<TlsMaterial> {
    TlsMaterial::load(&config.certificates).map_err(|e| LimeError::Certificate(e.to_string()))
}

/// Certificate paths in the file are relative to the file's directory.
fn resolve_relative_paths(config: &mut MediatorConfig, base: &Path) {
    let certs = &mut config.certificates;
    for path in [
        &mut certs.server_cert,
        &mut certs.server_key,
        &mut certs.root_cert,
    ] {
        if path.is_relative() {
            *path = base.join(&*path);
        }
    }
}

/// Human-readable summary printed by `check-config`.
pub fn summary(config: &MediatorConfig) -> Vec<(String, String)> {
    let certs = &config.certificates;
    let display = |p: &PathBuf| p.display().to_string();
    vec![
        ("listen".into(), config.listen_addr.to_string()),
        ("max payload".into(), format!("{} bytes", config.max_payload_bytes)),
        (
            "heartbeat".into(),
            format!(
                "every {}s, timeout {}s, margin {}s",
                config.heartbeat.interval_secs,
                config.heartbeat.timeout_secs,
                config.heartbeat.margin_secs
            ),
        ),
        ("server cert".into(), display(&certs.server_cert)),
        ("server key".into(), display(&certs.server_key)),
        ("root cert".into(), display(&certs.root_cert)),
        (
            "trusted root".into(),
            certs
                .trusted_root_thumbprint
                .as_ref()
                .map(|t| t.to_string())
                .unwrap_or_else(|| "(root cert thumbprint)".into()),
        ),
        ("agents".into(), config.agents.len().to_string()),
    ]
}
