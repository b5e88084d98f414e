use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::cli::*;
use crate::generation::{DEFAULT_MAX_NEW_TOKENS, DEFAULT_OLLAMA_HOST};

pub const DEFAULT_GEOCODING_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_FORECAST_TIMEOUT_SECS: u64 = 20;
pub const DEFAULT_GENERATION_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_TELEMETRY_PATH: &str = ".askflow/telemetry/events.jsonl";

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub profile: String,
    pub config_path: String,
    pub provider: Provider,
    pub model: Option<String>,
    pub ollama_host: String,
    pub max_new_tokens: u32,
    pub generation_timeout_secs: u64,
    pub retrieval_backend: RetrievalBackend,
    pub corpus_paths: Vec<String>,
    pub geocoding_timeout_secs: u64,
    pub forecast_timeout_secs: u64,
    pub telemetry_enabled: bool,
    pub telemetry_path: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfilesFile {
    #[serde(default)]
    pub profiles: HashMap<String, ProfileConfig>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfileConfig {
    pub provider: Option<Provider>,
    pub model: Option<String>,
    pub ollama_host: Option<String>,
    pub max_new_tokens: Option<u32>,
    pub generation_timeout_secs: Option<u64>,
    pub retrieval_backend: Option<RetrievalBackend>,
    #[serde(default)]
    pub corpus_paths: Vec<String>,
    pub geocoding_timeout_secs: Option<u64>,
    pub forecast_timeout_secs: Option<u64>,
    pub telemetry_enabled: Option<bool>,
    pub telemetry_path: Option<String>,
}

pub fn load_profiles(config_path: &str) -> Result<ProfilesFile> {
    let path = Path::new(config_path);
    if !path.exists() {
        return Ok(ProfilesFile::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read profile config file at '{}'", path.display()))?;
    toml::from_str::<ProfilesFile>(&content).with_context(|| {
        format!(
            "invalid profile configuration in '{}'. Check provider/retrieval values and field names.",
            path.display()
        )
    })
}

/// Profile paths first, then CLI paths, without repeats.
fn merge_unique_paths(first: &[String], second: &[String]) -> Vec<String> {
    let mut seen = BTreeSet::<String>::new();
    let mut merged = Vec::<String>::new();

    for path in first.iter().chain(second.iter()) {
        let trimmed = path.trim();
        if trimmed.is_empty() {
            continue;
        }
        if seen.insert(trimmed.to_string()) {
            merged.push(trimmed.to_string());
        }
    }

    merged
}

fn select_profile(cli: &Cli, profiles: &ProfilesFile) -> Result<ProfileConfig> {
    let selected = cli.profile.trim();
    if selected.is_empty() {
        return Err(anyhow::anyhow!(
            "profile name cannot be empty. Set --profile <name>."
        ));
    }

    if selected == "default" && !profiles.profiles.contains_key("default") {
        return Ok(ProfileConfig::default());
    }

    profiles.profiles.get(selected).cloned().ok_or_else(|| {
        let mut names = profiles.profiles.keys().cloned().collect::<Vec<String>>();
        names.sort();
        if names.is_empty() {
            anyhow::anyhow!(
                "profile '{}' not found in '{}'. No profiles are defined yet.",
                selected,
                cli.config_path
            )
        } else {
            anyhow::anyhow!(
                "profile '{}' not found in '{}'. Available profiles: {}",
                selected,
                cli.config_path,
                names.join(", ")
            )
        }
    })
}

/// CLI flags (and their env vars) win over the profile, the profile over built-in defaults.
pub fn resolve_runtime_config(cli: &Cli, profiles: &ProfilesFile) -> Result<RuntimeConfig> {
    let profile = select_profile(cli, profiles)?;
    let corpus_paths = merge_unique_paths(&profile.corpus_paths, &cli.corpus_path);
    let default_backend = if corpus_paths.is_empty() {
        RetrievalBackend::Disabled
    } else {
        RetrievalBackend::Local
    };

    Ok(RuntimeConfig {
        profile: cli.profile.trim().to_string(),
        config_path: cli.config_path.clone(),
        provider: cli
            .provider
            .or(profile.provider)
            .unwrap_or(Provider::Ollama),
        model: cli
            .model
            .clone()
            .or(profile.model)
            .map(|model| model.trim().to_string())
            .filter(|model| !model.is_empty()),
        ollama_host: cli
            .ollama_host
            .clone()
            .or(profile.ollama_host)
            .unwrap_or_else(|| DEFAULT_OLLAMA_HOST.to_string()),
        max_new_tokens: cli
            .max_new_tokens
            .or(profile.max_new_tokens)
            .unwrap_or(DEFAULT_MAX_NEW_TOKENS)
            .max(1),
        generation_timeout_secs: cli
            .generation_timeout_secs
            .or(profile.generation_timeout_secs)
            .unwrap_or(DEFAULT_GENERATION_TIMEOUT_SECS)
            .max(1),
        retrieval_backend: cli
            .retrieval_backend
            .or(profile.retrieval_backend)
            .unwrap_or(default_backend),
        corpus_paths,
        geocoding_timeout_secs: cli
            .geocoding_timeout_secs
            .or(profile.geocoding_timeout_secs)
            .unwrap_or(DEFAULT_GEOCODING_TIMEOUT_SECS)
            .max(1),
        forecast_timeout_secs: cli
            .forecast_timeout_secs
            .or(profile.forecast_timeout_secs)
            .unwrap_or(DEFAULT_FORECAST_TIMEOUT_SECS)
            .max(1),
        telemetry_enabled: cli
            .telemetry_enabled
            .or(profile.telemetry_enabled)
            .unwrap_or(true),
        telemetry_path: cli
            .telemetry_path
            .clone()
            .or(profile.telemetry_path)
            .unwrap_or_else(|| DEFAULT_TELEMETRY_PATH.to_string()),
    })
}
