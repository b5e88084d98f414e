use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Disabled,
    Ollama,
}

impl Provider {
    pub fn label(self) -> &'static str {
        match self {
            Provider::Disabled => "disabled",
            Provider::Ollama => "ollama",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalBackend {
    Disabled,
    Local,
    Semantic,
}

impl RetrievalBackend {
    pub fn label(self) -> &'static str {
        match self {
            RetrievalBackend::Disabled => "disabled",
            RetrievalBackend::Local => "local",
            RetrievalBackend::Semantic => "semantic",
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum ProfileCommands {
    #[command(about = "List configured profiles and highlight the active profile")]
    List,
    #[command(about = "Show the active profile's resolved runtime settings")]
    Show,
}

#[derive(Debug, Subcommand)]
pub enum TelemetryCommands {
    #[command(about = "Summarize telemetry events from a JSONL stream")]
    Report {
        #[arg(long)]
        path: Option<String>,
        #[arg(long, default_value_t = 5000)]
        limit: usize,
    },
}

const CLI_EXAMPLES: &str = "Examples:\n\
  askflow --corpus-path docs/handbook.txt ask \"What are the applications of AI?\"\n\
  askflow ask --trace \"weather in Chennai\"\n\
  askflow ask \"calculate (10+20)/2\"\n\
  askflow tool weather --args '{\"location\": \"Oslo\", \"days\": 5}'\n\
  askflow tool calculator --args '{\"expression\": \"sqrt(16) + 2**3\"}'\n\
  askflow --corpus-path docs/handbook.txt chat\n\
  askflow --corpus-path docs/handbook.txt serve --port 10000\n\
  askflow --profile research doctor\n\
  askflow telemetry report --limit 2000\n\
\n\
Routing:\n\
  - Queries mentioning weather, temperature or forecast call the weather tool.\n\
  - Queries with 'calculate' or simple arithmetic call the calculator.\n\
  - Everything else is answered from the corpus with citations.";

#[derive(Debug, Parser)]
#[command(name = "askflow")]
#[command(about = "Question answering over documents with weather and calculator tools")]
#[command(after_long_help = CLI_EXAMPLES)]
pub struct Cli {
    #[arg(long, env = "ASKFLOW_PROVIDER", value_enum)]
    pub provider: Option<Provider>,

    #[arg(long, env = "ASKFLOW_MODEL")]
    pub model: Option<String>,

    #[arg(long, env = "OLLAMA_HOST")]
    pub ollama_host: Option<String>,

    #[arg(long, env = "ASKFLOW_MAX_NEW_TOKENS")]
    pub max_new_tokens: Option<u32>,

    #[arg(long, env = "ASKFLOW_GENERATION_TIMEOUT_SECS")]
    pub generation_timeout_secs: Option<u64>,

    #[arg(long, env = "ASKFLOW_PROFILE", default_value = "default")]
    pub profile: String,

    #[arg(long, env = "ASKFLOW_CONFIG", default_value = ".askflow/config.toml")]
    pub config_path: String,

    #[arg(long, env = "ASKFLOW_RETRIEVAL_BACKEND", value_enum)]
    pub retrieval_backend: Option<RetrievalBackend>,

    #[arg(long, env = "ASKFLOW_CORPUS_PATH", value_delimiter = ',')]
    pub corpus_path: Vec<String>,

    #[arg(long, env = "ASKFLOW_GEOCODING_TIMEOUT_SECS")]
    pub geocoding_timeout_secs: Option<u64>,

    #[arg(long, env = "ASKFLOW_FORECAST_TIMEOUT_SECS")]
    pub forecast_timeout_secs: Option<u64>,

    #[arg(long, env = "ASKFLOW_TELEMETRY_ENABLED", action = clap::ArgAction::Set)]
    pub telemetry_enabled: Option<bool>,

    #[arg(long, env = "ASKFLOW_TELEMETRY_PATH")]
    pub telemetry_path: Option<String>,

    #[arg(long, env = "RUST_LOG", default_value = "error")]
    pub log_filter: String,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    #[command(about = "Answer one query and print the answer with citations")]
    Ask {
        #[arg(required = true)]
        query: Vec<String>,
        #[arg(long, default_value_t = false)]
        trace: bool,
    },
    #[command(about = "Run the interactive question loop")]
    Chat,
    #[command(about = "Invoke one tool directly with JSON arguments")]
    Tool {
        name: String,
        #[arg(long, default_value = "{}")]
        args: String,
    },
    #[command(about = "Run the HTTP server (health and ask endpoints)")]
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, env = "PORT", default_value_t = 10000)]
        port: u16,
    },
    #[command(about = "Show resolved configuration and capability readiness")]
    Doctor,
    #[command(about = "Inspect profile configuration and active resolved profile state")]
    Profiles {
        #[command(subcommand)]
        command: ProfileCommands,
    },
    #[command(about = "Telemetry utilities and reporting")]
    Telemetry {
        #[command(subcommand)]
        command: TelemetryCommands,
    },
}

pub fn command_label(command: &Commands) -> String {
    match command {
        Commands::Ask { .. } => "ask".to_string(),
        Commands::Chat => "chat".to_string(),
        Commands::Tool { name, .. } => format!("tool.{}", name.trim().to_ascii_lowercase()),
        Commands::Serve { .. } => "serve".to_string(),
        Commands::Doctor => "doctor".to_string(),
        Commands::Profiles { command } => match command {
            ProfileCommands::List => "profiles.list".to_string(),
            ProfileCommands::Show => "profiles.show".to_string(),
        },
        Commands::Telemetry { command } => match command {
            TelemetryCommands::Report { .. } => "telemetry.report".to_string(),
        },
    }
}
