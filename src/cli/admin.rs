//! Admin command handlers: stats, warmup, namespace clearing, raw entries
//! and config inspection.

use std::path::Path;

use anyhow::Result;

use zeptocache::{CacheService, Config};

use super::ConfigAction;

/// Print a JSON stats snapshot.
pub(crate) async fn cmd_stats(config: &Config, warmup: Option<&Path>) -> Result<()> {
    let service = CacheService::from_config(config).await?;
    if let Some(path) = warmup {
        service.warmup_from_file(path).await?;
    }
    let healthy = service.health_check().await;
    let mut stats = serde_json::to_value(service.stats())?;
    if let Some(obj) = stats.as_object_mut() {
        obj.insert("backend_healthy".to_string(), healthy.into());
    }
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

pub(crate) async fn cmd_warmup(config: &Config, path: &Path) -> Result<()> {
    let service = CacheService::from_config(config).await?;
    let report = service.warmup_from_file(path).await?;
    println!(
        "Loaded {} decisions and {} instant replies from {}",
        report.decisions,
        report.instant,
        path.display()
    );
    Ok(())
}

pub(crate) async fn cmd_clear(config: &Config, namespace: &str) -> Result<()> {
    let service = CacheService::from_config(config).await?;
    let removed = service.clear_namespace(namespace).await?;
    println!("Cleared '{}': {} entries removed", namespace, removed);
    Ok(())
}

pub(crate) async fn cmd_get(config: &Config, key: &str) -> Result<()> {
    let service = CacheService::from_config(config).await?;
    match service.debug_get(key).await {
        Some(entry) => println!("{}", serde_json::to_string_pretty(&entry)?),
        None => println!("'{}' not found", key),
    }
    Ok(())
}

pub(crate) async fn cmd_delete(config: &Config, key: &str) -> Result<()> {
    let service = CacheService::from_config(config).await?;
    if service.debug_delete(key).await {
        println!("Deleted '{}'", key);
    } else {
        println!("'{}' not found", key);
    }
    Ok(())
}

/// `config` subcommands. Takes the load result so `check` can report errors.
pub(crate) fn cmd_config(action: &ConfigAction, loaded: Result<Config>) -> Result<()> {
    match action {
        ConfigAction::Path => {
            println!("{}", Config::path().display());
        }
        ConfigAction::Show => {
            let config = loaded?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        ConfigAction::Check => match loaded {
            Ok(config) => {
                println!(
                    "Configuration OK (backend: {}, namespace: {})",
                    config.store.backend, config.store.namespace
                );
            }
            Err(e) => {
                println!("Configuration invalid: {:#}", e);
                return Err(e);
            }
        },
    }
    Ok(())
}
