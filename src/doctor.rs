use anyhow::Result;

use crate::config::RuntimeConfig;
use crate::tools::ToolName;
use crate::workflow::Orchestrator;

pub fn env_present(key: &str) -> bool {
    std::env::var(key)
        .map(|value| !value.trim().is_empty())
        .unwrap_or(false)
}

pub fn run_doctor(cfg: &RuntimeConfig, orchestrator: &Orchestrator) -> Result<()> {
    println!(
        "Active profile: '{}' (config: {})",
        cfg.profile, cfg.config_path
    );

    println!("Environment check:");
    for key in ["OLLAMA_HOST", "PORT", "ASKFLOW_SERVER_AUTH_TOKEN"] {
        let status = if env_present(key) { "set" } else { "missing" };
        println!("- {key}: {status}");
    }

    println!(
        "Generation: provider={} model={} host={} max_new_tokens={} timeout_secs={}",
        cfg.provider.label(),
        orchestrator.generator_name().unwrap_or("<none>"),
        cfg.ollama_host,
        cfg.max_new_tokens,
        cfg.generation_timeout_secs
    );
    println!(
        "Retrieval: backend={} corpus_paths={}",
        orchestrator
            .context_search_backend()
            .unwrap_or(cfg.retrieval_backend.label()),
        if cfg.corpus_paths.is_empty() {
            "<not configured>".to_string()
        } else {
            cfg.corpus_paths.join(", ")
        }
    );
    println!(
        "Weather: geocoding_timeout_secs={} forecast_timeout_secs={}",
        cfg.geocoding_timeout_secs, cfg.forecast_timeout_secs
    );
    println!("Tools:");
    for tool in ToolName::ALL {
        println!("- {}: {}", tool.as_str(), tool.description());
    }
    println!(
        "Telemetry: enabled={} path={}",
        cfg.telemetry_enabled, cfg.telemetry_path
    );

    match orchestrator.ensure_ready() {
        Ok(()) => println!("Document answering: ready"),
        Err(err) => {
            println!("Document answering: not ready ({err})");
            println!("Tip: pass --corpus-path <file> and --provider ollama; tool queries still work.");
        }
    }

    Ok(())
}
