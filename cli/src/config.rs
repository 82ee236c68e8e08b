use anyhow::{bail, Context, Result};
use colored::*;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use ytgrab_core::config::default_config_path;
use ytgrab_core::EngineConfig;

fn config_path() -> Result<PathBuf> {
    default_config_path().context("this system has no configuration directory")
}

/// Defaults, the settings file, then `YTGRAB_*` variables.
pub fn load_config() -> Result<EngineConfig> {
    let path = default_config_path();
    EngineConfig::load(path.as_deref()).context("failed to load configuration")
}

pub fn show_config() -> Result<()> {
    let config = load_config()?;
    let path = config_path()?;

    println!("{}", "⚙️  Configuration".cyan().bold());
    println!("   File: {}", path.display());
    if !path.exists() {
        println!("   {}", "(not written yet; showing defaults)".dimmed());
    }
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

pub fn set_config(key: &str, value: &str) -> Result<()> {
    let path = config_path()?;
    let Value::Object(defaults) = serde_json::to_value(EngineConfig::default())? else {
        bail!("configuration is not an object");
    };
    if !defaults.contains_key(key) {
        let known: Vec<&str> = defaults.keys().map(String::as_str).collect();
        bail!("unknown setting '{}'; known settings: {}", key, known.join(", "));
    }

    let mut settings = read_settings(&path)?;
    let parsed = parse_value(&defaults, &settings, key, value)?;
    settings.insert(key.to_string(), parsed);

    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    fs::write(&path, serde_json::to_string_pretty(&Value::Object(settings))?)
        .with_context(|| format!("failed to write {}", path.display()))?;

    println!("✅ {} = {}", key.green(), value);
    Ok(())
}

pub fn reset_config() -> Result<()> {
    let path = config_path()?;
    if path.exists() {
        fs::remove_file(&path).with_context(|| format!("failed to remove {}", path.display()))?;
    }
    println!("✅ Configuration reset to defaults");
    Ok(())
}

fn read_settings(path: &Path) -> Result<Map<String, Value>> {
    if !path.exists() {
        return Ok(Map::new());
    }
    let text = fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    match serde_json::from_str(&text)? {
        Value::Object(map) => Ok(map),
        _ => bail!("{} does not hold a JSON object", path.display()),
    }
}

/// Read `raw` as JSON when that yields a valid setting (numbers, booleans,
/// `null`), else as a plain string.
fn parse_value(
    defaults: &Map<String, Value>,
    settings: &Map<String, Value>,
    key: &str,
    raw: &str,
) -> Result<Value> {
    let candidates = serde_json::from_str::<Value>(raw)
        .ok()
        .into_iter()
        .chain(std::iter::once(Value::String(raw.to_string())));

    for candidate in candidates {
        let mut merged = defaults.clone();
        merged.extend(settings.clone());
        merged.insert(key.to_string(), candidate.clone());
        if serde_json::from_value::<EngineConfig>(Value::Object(merged)).is_ok() {
            return Ok(candidate);
        }
    }
    bail!("'{}' is not a valid value for {}", raw, key)
}
