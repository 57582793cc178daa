//! Run a single built-in tool call from the command line
//!
//! Run with: cargo run --bin run_tool -- math_eval '{"expression": "2^10"}'

use clap::{Parser, ValueEnum};
use serde_json::Value;
use tool_conversation::{SandboxLimits, ToolRegistry};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser)]
#[command(name = "run_tool")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Dispatch one built-in tool call and print its result as JSON", long_about = None)]
struct Cli {
    /// Tool to call (math_eval, run_js, list_documents, read_document, write_document)
    tool: String,

    /// Tool arguments as a JSON object
    #[arg(default_value = "{}")]
    args: String,

    /// Sandbox limits profile for run_js
    #[arg(short, long, value_enum, default_value_t = Profile::Default)]
    profile: Profile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Profile {
    Quick,
    Default,
    Extended,
}

impl Profile {
    fn limits(self) -> SandboxLimits {
        match self {
            Profile::Quick => SandboxLimits::quick(),
            Profile::Default => SandboxLimits::default(),
            Profile::Extended => SandboxLimits::extended(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logs go to stderr; stdout carries the result
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let tool_args: Value = serde_json::from_str(&cli.args)?;

    let registry = ToolRegistry::with_builtins(cli.profile.limits());
    info!(tool = %cli.tool, available = ?registry.tool_names(), "running tool");

    let result = registry.execute(&cli.tool, tool_args).await;
    println!("{}", serde_json::to_string_pretty(&result)?);

    if !result.ok {
        std::process::exit(1);
    }
    Ok(())
}
