use anyhow::Result;

use crate::config::{ProfilesFile, RuntimeConfig};

pub fn profile_names(profiles: &ProfilesFile) -> Vec<String> {
    let mut names = profiles.profiles.keys().cloned().collect::<Vec<String>>();
    if !names.iter().any(|name| name == "default") {
        names.push("default".to_string());
    }
    names.sort();
    names
}

pub fn run_profiles_list(profiles: &ProfilesFile, cfg: &RuntimeConfig) -> Result<()> {
    println!("Configured profiles (active='{}'):", cfg.profile);
    for name in profile_names(profiles) {
        let marker = if name == cfg.profile { "*" } else { " " };
        let source = if profiles.profiles.contains_key(&name) {
            "configured"
        } else {
            "implicit"
        };
        println!("{marker} {name} ({source})");
    }

    Ok(())
}

pub fn run_profiles_show(cfg: &RuntimeConfig) -> Result<()> {
    println!("Active profile: {}", cfg.profile);
    println!("Config path: {}", cfg.config_path);
    println!("Provider: {}", cfg.provider.label());
    println!(
        "Model: {}",
        cfg.model.as_deref().unwrap_or("<provider-default>")
    );
    println!("Ollama host: {}", cfg.ollama_host);
    println!("Max new tokens: {}", cfg.max_new_tokens);
    println!("Generation timeout (secs): {}", cfg.generation_timeout_secs);
    println!("Retrieval backend: {}", cfg.retrieval_backend.label());
    println!(
        "Corpus paths: {}",
        if cfg.corpus_paths.is_empty() {
            "<not configured>".to_string()
        } else {
            cfg.corpus_paths.join(", ")
        }
    );
    println!("Geocoding timeout (secs): {}", cfg.geocoding_timeout_secs);
    println!("Forecast timeout (secs): {}", cfg.forecast_timeout_secs);
    println!("Telemetry enabled: {}", cfg.telemetry_enabled);
    println!("Telemetry path: {}", cfg.telemetry_path);
    Ok(())
}
