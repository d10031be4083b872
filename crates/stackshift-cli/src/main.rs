//! stackshift: blue/green deployments with weighted DNS cutover.
//!
//! # Usage
//!
//! ```text
//! STACKSHIFT_CONFIG='{"app_name":"shop","compute":{...}}' stackshift deploy
//! stackshift --state-dir /var/lib/stackshift scale --capacity 6
//! stackshift status
//! ```
//!
//! State is written back to `<state-dir>/state.json` when the command
//! finishes, fails or is interrupted with Ctrl-C.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::error;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser, Debug)]
#[command(
    name = "stackshift",
    about = "Blue/green deployments with weighted DNS traffic shifting",
    version,
    propagate_version = true
)]
struct Cli {
    /// Directory holding the state document and the sandbox cloud.
    #[arg(long, global = true, default_value = ".stackshift")]
    state_dir: PathBuf,

    /// Engine settings file (TOML).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Deploy configuration (JSON), merged over the stored configuration.
    #[arg(long, global = true, env = "STACKSHIFT_CONFIG")]
    config: Option<String>,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Deploy to the passive side of every stack and shift traffic to it.
    Deploy,
    /// Deploy fresh compute groups even if the configuration is unchanged.
    Redeploy,
    /// Route traffic back to the previously active side.
    Revert,
    /// Split a new total capacity across the active compute groups.
    Scale {
        /// Total instances across all stacks.
        #[arg(long)]
        capacity: u32,
    },
    /// Replace the instances of every active group in place.
    RollingRestart,
    /// Print the deployment report as JSON.
    Status,
    /// Delete every resource and the stored configuration.
    Undeploy,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,stackshift=debug"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let options = commands::Options {
        state_dir: cli.state_dir,
        settings: cli.settings,
        config: cli.config,
    };
    match commands::execute(&options, cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = format!("{err:#}"), "stackshift failed");
            ExitCode::from(commands::exit_code(&err))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_scale_with_global_flags_after_the_subcommand() {
        let cli = Cli::try_parse_from([
            "stackshift",
            "scale",
            "--capacity",
            "6",
            "--state-dir",
            "/tmp/shop",
            "--log-format",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.command, Command::Scale { capacity: 6 });
        assert_eq!(cli.state_dir, PathBuf::from("/tmp/shop"));
        assert_eq!(cli.log_format, LogFormat::Json);
    }

    #[test]
    fn defaults_apply_without_flags() {
        let cli = Cli::try_parse_from(["stackshift", "rolling-restart"]).unwrap();
        assert_eq!(cli.command, Command::RollingRestart);
        assert_eq!(cli.state_dir, PathBuf::from(".stackshift"));
        assert_eq!(cli.log_format, LogFormat::Text);
        assert!(cli.settings.is_none());
    }

    #[test]
    fn config_flag_is_accepted() {
        let cli = Cli::try_parse_from(["stackshift", "--config", r#"{"stacks":2}"#, "deploy"]).unwrap();
        assert_eq!(cli.config.as_deref(), Some(r#"{"stacks":2}"#));
        assert_eq!(cli.command, Command::Deploy);
    }

    #[test]
    fn scale_requires_capacity() {
        assert!(Cli::try_parse_from(["stackshift", "scale"]).is_err());
        assert!(Cli::try_parse_from(["stackshift", "launch"]).is_err());
    }
}
