//! CLI definitions.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Conduit - agent stage dispatch over a durable message bus
#[derive(Parser, Debug)]
#[command(name = "conduit")]
#[command(version)]
#[command(about = "Dispatch workflow stages to CLI agents over NATS JetStream")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug, Clone, Default)]
pub struct ConfigArgs {
    /// Configuration file (TOML, or JSON by extension)
    #[arg(short, long, env = "CONDUIT_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Provision streams, then dispatch stage events until SIGINT/SIGTERM
    Run {
        #[command(flatten)]
        config: ConfigArgs,
    },

    /// Provision the orchestration stream and one stream per configured agent
    EnsureStreams {
        #[command(flatten)]
        config: ConfigArgs,
    },

    /// Print the latest deliverable for (agent, task type, request)
    Fetch {
        /// Agent identity
        agent: String,

        /// Task type, e.g. `research`
        task_type: String,

        /// Request identifier, e.g. `REQ-1`
        request_id: String,

        #[command(flatten)]
        config: ConfigArgs,
    },
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_parse_fetch() -> Result<(), Box<dyn std::error::Error>> {
        let cli = Cli::try_parse_from(["conduit", "fetch", "cynthia", "research", "REQ-1", "--config", "c.toml"])?;
        let Commands::Fetch {
            agent,
            task_type,
            request_id,
            config,
        } = cli.command
        else {
            return Err("expected the fetch command".into());
        };
        assert_eq!(agent, "cynthia");
        assert_eq!(task_type, "research");
        assert_eq!(request_id, "REQ-1");
        assert_eq!(config.config, Some(PathBuf::from("c.toml")));
        Ok(())
    }

    #[test]
    fn test_parse_run_without_config() {
        let cli = Cli::try_parse_from(["conduit", "run"]).unwrap();
        assert!(matches!(cli.command, Commands::Run { .. }));
    }

    #[test]
    fn test_fetch_requires_key() {
        assert!(Cli::try_parse_from(["conduit", "fetch", "cynthia"]).is_err());
    }
}
