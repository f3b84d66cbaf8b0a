//! `winotp` – headless console front end for the token engine.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use winotp_lib::totp::{ExportFormat, ImportFormat, ImportStatus, TokenService};
use winotp_lib::{
    logging, open_app_lock, open_service, start_background_sync, AppConfig, AppError, AppResult,
};

#[derive(Parser)]
#[command(name = "winotp", version, about = "TOTP authenticator with NTP-corrected time")]
struct Cli {
    /// Use the development token file (tokens.json.dev)
    #[arg(short, long)]
    debug: bool,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Skip the NTP sync before showing codes
    #[arg(long)]
    no_sync: bool,

    /// PIN or password when the app lock is on
    #[arg(long, value_name = "SECRET")]
    unlock: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show tokens with their current codes
    List {
        /// Case-insensitive filter on issuer or name
        search: Option<String>,
    },

    /// Import tokens from a file
    Import {
        /// auto, otpauth, google, 2fas, aegis, winotp
        format: String,
        file: PathBuf,
    },

    /// Print tokens in an export format (contains secrets)
    Export {
        /// otpauth, json, winotp
        format: String,
    },

    /// Add a token by hand
    Add {
        issuer: String,
        name: String,
        secret: String,
    },

    /// Sync the clock and show the time source status
    Sync,

    /// Manage the app lock
    Lock {
        #[command(subcommand)]
        action: LockAction,
    },

    /// Keep showing codes, re-syncing the clock in the background
    Watch {
        /// Case-insensitive filter on issuer or name
        search: Option<String>,
    },
}

#[derive(Subcommand)]
enum LockAction {
    /// Show whether a lock is set
    Status,
    /// Protect the app with a PIN (at least 4 digits)
    SetPin { pin: String },
    /// Protect the app with a password (at least 6 characters)
    SetPassword { password: String },
    /// Remove the lock
    Clear,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match AppConfig::load_or_default(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("winotp: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = logging::init(&config.log_level, config.log_json) {
        eprintln!("winotp: {}", e);
    }

    match run(cli, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, config: AppConfig) -> AppResult<()> {
    if cli.debug {
        info!("Debug mode: using {}", winotp_lib::config::DEV_TOKENS_FILE_NAME);
    }
    let command = cli.command.unwrap_or(Commands::List { search: None });

    let lock = open_app_lock(&config).await?;
    if let Commands::Lock { action: LockAction::Status } = &command {
        match lock.kind().await {
            Some(kind) => println!("locked ({})", kind),
            None => println!("unlocked"),
        }
        return Ok(());
    }
    if !lock.verify(cli.unlock.as_deref().unwrap_or("")).await? {
        return Err(AppError::Locked);
    }

    let service = open_service(&config, cli.debug).await?;

    match command {
        Commands::Lock { action } => match action {
            LockAction::Status => {}
            LockAction::SetPin { pin } => {
                lock.set_pin(&pin).await?;
                println!("PIN lock set");
            }
            LockAction::SetPassword { password } => {
                lock.set_password(&password).await?;
                println!("Password lock set");
            }
            LockAction::Clear => {
                lock.clear().await?;
                println!("Lock cleared");
            }
        },
        Commands::List { search } => {
            if config.ntp.enabled && !cli.no_sync {
                try_sync(&service).await;
            }
            print_tokens(&service, search.as_deref().unwrap_or("")).await?;
        }
        Commands::Import { format, file } => {
            let format: ImportFormat = format.parse()?;
            let payload = tokio::fs::read_to_string(&file).await?;
            let outcome = service.import_tokens(format, &payload).await?;
            println!(
                "{}: {} imported, {} rejected, {} duplicates skipped",
                outcome.format, outcome.accepted, outcome.rejected, outcome.skipped_duplicate
            );
            for msg in &outcome.messages {
                println!("  {}", msg);
            }
            if outcome.status() == ImportStatus::NothingImported && outcome.rejected > 0 {
                outcome.ensure_complete()?;
            }
        }
        Commands::Export { format } => {
            let format: ExportFormat = format.parse()?;
            for line in service.export_tokens(format).await? {
                println!("{}", line);
            }
        }
        Commands::Add { issuer, name, secret } => {
            let summary = service.add_token(&issuer, &name, &secret).await?;
            println!("Added {} ({})", summary.issuer, summary.id);
        }
        Commands::Watch { search } => {
            if config.ntp.enabled && !cli.no_sync {
                try_sync(&service).await;
                start_background_sync(&service, &config);
            }
            let search = search.unwrap_or_default();
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        print!("\x1b[2J\x1b[H");
                        print_tokens(&service, &search).await?;
                    }
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
            service.stop_periodic_sync();
        }
        Commands::Sync => {
            try_sync(&service).await;
            let status = service.get_ntp_status();
            println!("state:  {}", status.state);
            if let Some(ms) = status.offset_ms {
                println!("offset: {:+.1} ms", ms);
            }
            if let Some(server) = &status.last_server {
                println!("server: {}", server);
            }
            if let Some(err) = &status.last_error {
                println!("error:  {}", err);
            }
        }
    }
    Ok(())
}

/// Codes stay usable on the local clock when sync fails.
async fn try_sync(service: &TokenService) {
    if let Err(e) = service.sync_ntp().await {
        warn!("Time sync failed, using local clock: {}", e);
    }
}

async fn print_tokens(service: &TokenService, search: &str) -> AppResult<()> {
    let ascending = service.registry().sort_ascending().await;
    let views = service.list_tokens(search, ascending).await?;
    if views.is_empty() {
        println!("No tokens.");
        return Ok(());
    }
    let width = views.iter().map(|v| v.issuer.len()).max().unwrap_or(0);
    for v in views {
        println!(
            "{:<width$}  {:<24}  {}  ({:>4.1}s)",
            v.issuer,
            v.name,
            v.code,
            v.time_remaining,
            width = width
        );
    }
    Ok(())
}
