use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use alm_client::config::{CliArgs, Settings};
use alm_client::{AlmClient, Entity};

/// ALM client - command-line front end
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    args: CliArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Log in and open a server session
    Check,

    /// Print every entity of a type as JSON lines
    List {
        /// Entity collection, e.g. defects, requirements, tests
        #[arg(short = 't', long = "type", default_value = "defects")]
        entity_type: String,
    },

    /// Lock, update and unlock one entity
    Update {
        /// Entity id
        id: String,

        /// Field to change, as name=value (repeatable)
        #[arg(short, long = "field", value_parser = parse_field, required = true)]
        fields: Vec<(String, String)>,

        /// Entity collection the id belongs to
        #[arg(short = 't', long = "type", default_value = "defects")]
        entity_type: String,
    },
}

fn parse_field(s: &str) -> std::result::Result<(String, String), String> {
    s.split_once('=')
        .filter(|(name, _)| !name.trim().is_empty())
        .map(|(name, value)| (name.trim().to_string(), value.to_string()))
        .ok_or_else(|| format!("expected name=value, got '{}'", s))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if it exists
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    // Initialize logging with a configured level
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.args.log_level.to_lowercase()));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let settings = Settings::load(cli.args)?;
    tracing::info!(
        "Using backend profile {} for {}/{}",
        settings.profile.version,
        settings.options.domain,
        settings.options.project
    );

    let client = AlmClient::new(settings.options, &settings.profile)
        .context("Failed to create ALM client")?;

    let cancel = client.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Received Ctrl+C, cancelling...");
            cancel.cancel();
        }
    });

    let result = run(&client, cli.command).await;

    client.dispose().await;
    result
}

async fn run(client: &AlmClient, command: Command) -> Result<()> {
    match command {
        Command::Check => {
            if !client.ensure_session_active().await? {
                anyhow::bail!("Could not establish an ALM session");
            }
            let state = client.session_state().await;
            println!(
                "authenticated (login token: {}, session token: {})",
                if state.login_token.is_some() { "yes" } else { "no" },
                if state.session_token.is_some() { "yes" } else { "no" },
            );
        }

        Command::List { entity_type } => {
            let entities = client
                .read_all(&entity_type)
                .await?
                .with_context(|| format!("Failed to read {}", entity_type))?;

            for entity in &entities {
                println!("{}", serde_json::to_string(&entity.fields)?);
            }
            tracing::info!("Listed {} {}", entities.len(), entity_type);
        }

        Command::Update {
            id,
            fields,
            entity_type,
        } => {
            let changes: Entity = fields.into_iter().collect();
            let outcome = client
                .update_entity_detailed(&entity_type, &id, &changes)
                .await?
                .with_context(|| format!("Failed to update {}/{}", entity_type, id))?;

            println!("lock:   {:?}", outcome.lock);
            println!("update: {:?}", outcome.update);
            println!("unlock: {:?}", outcome.unlock);

            outcome.into_result()?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_field() {
        assert_eq!(
            parse_field("status=Open"),
            Ok(("status".to_string(), "Open".to_string()))
        );
        assert_eq!(
            parse_field("description=a=b"),
            Ok(("description".to_string(), "a=b".to_string()))
        );
        assert!(parse_field("status").is_err());
        assert!(parse_field("=Open").is_err());
    }

    #[test]
    fn test_cli_parses_update() {
        let cli = Cli::try_parse_from([
            "alm-client",
            "--url",
            "https://alm.example.com",
            "--username",
            "jdoe",
            "--password",
            "secret",
            "--domain",
            "DEFAULT",
            "--project",
            "Demo",
            "update",
            "42",
            "-f",
            "status=Fixed",
            "--field",
            "owner=jdoe",
        ])
        .unwrap();

        match cli.command {
            Command::Update { id, fields, entity_type } => {
                assert_eq!(id, "42");
                assert_eq!(entity_type, "defects");
                assert_eq!(fields.len(), 2);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
