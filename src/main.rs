use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use gateway_auth::comms::local_api::{self, AppState};
use gateway_auth::config::Settings;
use gateway_auth::security::crypto::generate_key_base64;
use gateway_auth::utils::logging;

#[derive(Parser)]
#[command(name = "gateway-auth", version, about = "Credential lifecycle and identity for the API gateway")]
struct AppCli {
    /// JSON settings file; environment variables are used when omitted
    #[arg(short, long, global = true, env = "GATEWAY_AUTH_CONFIG")]
    config: Option<String>,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, global = true, default_value = logging::DEFAULT_FILTER)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start HTTP server (auth endpoints and protected API)
    Serve {
        #[arg(long, default_value_t = 8765)]
        port: u16,
    },
    /// Log a principal in with the device-code flow
    Login { principal: String },
    /// Remove stored tokens for a principal
    Logout { principal: String },
    /// Show authentication state for a principal, or list all
    Status { principal: Option<String> },
    /// Print a fresh base64 TOKEN_ENCRYPTION_KEY
    GenKey,
}

fn load_settings(path: Option<&str>) -> Result<Settings> {
    let settings = match path {
        Some(path) => Settings::from_file(path)?,
        None => Settings::from_env()?,
    };
    Ok(settings)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = AppCli::parse();
    logging::init(&args.log_level).map_err(|e| anyhow!("logging init failed: {e}"))?;

    if matches!(args.command, Commands::GenKey) {
        println!("{}", generate_key_base64());
        return Ok(());
    }

    let settings = load_settings(args.config.as_deref())?;
    let state = AppState::build(&settings).await?;

    match args.command {
        Commands::Serve { port } => {
            info!("Starting gateway auth server on port {port}");
            return local_api::serve(state, port).await;
        }
        Commands::Login { principal } => {
            let manager = state
                .provider
                .token_manager()
                .ok_or_else(|| anyhow!("login requires AUTH_METHOD=oauth2"))?;
            let device = manager.start_device_login(&principal).await?;
            println!(
                "Open {} and enter code {}",
                device
                    .verification_uri_complete
                    .as_deref()
                    .unwrap_or(&device.verification_uri),
                device.user_code
            );
            let token = manager.complete_device_login(&principal, &device).await?;
            println!("{}", serde_json::to_string_pretty(&token)?);
        }
        Commands::Logout { principal } => {
            let manager = state
                .provider
                .token_manager()
                .ok_or_else(|| anyhow!("logout requires AUTH_METHOD=oauth2"))?;
            if manager.logout(&principal).await? {
                println!("Logged out {principal}");
            } else {
                println!("No stored tokens for {principal}");
            }
        }
        Commands::Status { principal } => {
            let manager = state
                .provider
                .token_manager()
                .ok_or_else(|| anyhow!("status requires AUTH_METHOD=oauth2"))?;
            match principal {
                Some(principal) => {
                    let status = serde_json::json!({
                        "principal": principal,
                        "status": manager.state(&principal).await?,
                        "token": manager.token_info(&principal).await?,
                    });
                    println!("{}", serde_json::to_string_pretty(&status)?);
                }
                None => {
                    for principal in manager.list_authenticated_principals().await? {
                        println!("{principal}");
                    }
                }
            }
        }
        // printed above, before settings are loaded
        Commands::GenKey => {}
    }

    state.shutdown().await;
    Ok(())
}
