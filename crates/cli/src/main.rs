use avifsgate_core::audit::AUDIT_TARGET;
use avifsgate_core::config::AppConfig;
use avifsgate_core::gatekeeper::{Admission, Gatekeeper};
use avifsgate_core::metrics::MetricsStore;
use avifsgate_core::policy::AccessPolicy;
use avifsgate_core::types::{extension_of, FileClassification, UploadCandidate};
use avifsgate_server::gateway::Gateway;
use avifsgate_server::htaccess::{self, InstallOutcome};
use avifsgate_server::unique::DirectoryUniqueFilename;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

#[derive(Parser)]
#[command(name = "avifsgate")]
#[command(version)]
#[command(about = "Upload gatekeeper for AVIF Sequence (.avifs) files")]
struct Cli {
    /// Path to a config file (defaults to ~/.avifsgate/config.json if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full admission check (role, type, size) against a local file
    Check {
        file: PathBuf,
        /// Filename as declared by the client (defaults to the file's own name)
        #[arg(long)]
        name: Option<String>,
        /// Caller role; repeat for several (defaults to server.local_roles)
        #[arg(short, long = "role")]
        roles: Vec<String>,
    },
    /// Run only the type classification hook and print the classification
    Classify {
        file: PathBuf,
        #[arg(long)]
        name: Option<String>,
        #[arg(short, long = "role")]
        roles: Vec<String>,
    },
    /// Start the upload gateway
    Serve {
        /// Override server.port
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Manage the managed .htaccess block in an uploads directory
    Htaccess {
        #[command(subcommand)]
        action: HtaccessActions,
    },
    /// Print the effective configuration
    Config,
}

#[derive(Subcommand)]
enum HtaccessActions {
    /// Append the rules block unless already present
    Install {
        /// Uploads directory (defaults to server.upload_dir)
        dir: Option<PathBuf>,
    },
    /// Remove the rules block
    Uninstall {
        dir: Option<PathBuf>,
    },
}

fn get_config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".avifsgate")
}

fn init_tracing() -> tracing_appender::non_blocking::WorkerGuard {
    let (non_blocking, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(
        get_config_dir().join("logs"),
        "audit.jsonl",
    ));

    let audit_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_target(false)
        .with_level(false)
        .with_file(false)
        .with_line_number(false)
        .without_time() // Timestamp is in JSON
        .with_filter(tracing_subscriber::filter::Targets::new().with_target(AUDIT_TARGET, Level::INFO));

    let stdout_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(Level::INFO.into());

    // Audit records only go to the audit file.
    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(stdout_filter)
        .with_filter(tracing_subscriber::filter::filter_fn(|metadata| {
            metadata.target() != AUDIT_TARGET
        }));

    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(audit_layer)
        .init();

    guard
}

fn declared_name(file: &Path, name: Option<String>) -> String {
    name.unwrap_or_else(|| {
        file.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    })
}

fn caller_roles(config: &AppConfig, roles: Vec<String>) -> HashSet<String> {
    if roles.is_empty() {
        config.server.local_roles.iter().cloned().collect()
    } else {
        roles.into_iter().collect()
    }
}

fn admission_json(filename: &str, admission: &Admission) -> Value {
    match admission {
        Admission::NotApplicable => json!({
            "file": filename,
            "decision": "not_applicable",
        }),
        Admission::Admitted {
            extension,
            mime,
            filename: stored_as,
        } => json!({
            "file": filename,
            "decision": "admitted",
            "extension": extension,
            "mime": mime,
            "stored_as": stored_as,
        }),
        Admission::Rejected(e) => json!({
            "file": filename,
            "decision": "rejected",
            "reason": e.code(),
            "message": e.to_string(),
        }),
    }
}

fn gatekeeper(config: &AppConfig) -> Gatekeeper {
    Gatekeeper::from_settings(&config.verifier, Arc::new(DirectoryUniqueFilename))
}

fn run_check(config: &AppConfig, file: &Path, name: Option<String>, roles: Vec<String>) -> anyhow::Result<bool> {
    let filename = declared_name(file, name);
    let size = std::fs::metadata(file)
        .map_err(|e| anyhow::anyhow!("Cannot read {}: {}", file.display(), e))?
        .len();

    let candidate = UploadCandidate::new(&filename, size, file).with_roles(caller_roles(config, roles));
    let policy = AccessPolicy::from_settings(&config.policy);
    let admission = gatekeeper(config).admit(&candidate, &policy);

    println!("{}", serde_json::to_string_pretty(&admission_json(&filename, &admission))?);
    Ok(!matches!(admission, Admission::Rejected(_)))
}

fn run_classify(config: &AppConfig, file: &Path, name: Option<String>, roles: Vec<String>) -> anyhow::Result<bool> {
    let filename = declared_name(file, name);
    let policy = AccessPolicy::from_settings(&config.policy);
    let keeper = gatekeeper(config);

    let mut mimes = config.server.accepted_types.clone();
    keeper.register_mime_types(&mut mimes, &caller_roles(config, roles), &policy);

    let ext = extension_of(&filename);
    let tentative = config
        .server
        .accepted_types
        .get(&ext)
        .map(|mime| FileClassification::new(&ext, mime))
        .unwrap_or_default();

    let classification = keeper.check_filetype_and_ext(tentative, file, &filename, &mimes);
    println!("{}", serde_json::to_string_pretty(&classification)?);
    Ok(classification.error.is_none())
}

fn run_htaccess(config: &AppConfig, action: &HtaccessActions) -> anyhow::Result<()> {
    match action {
        HtaccessActions::Install { dir } => {
            let dir = dir.clone().unwrap_or_else(|| config.server.upload_dir.clone());
            match htaccess::install(&dir)? {
                InstallOutcome::Created | InstallOutcome::Appended => {
                    println!("Installed rules in {}", htaccess::htaccess_path(&dir).display())
                }
                InstallOutcome::AlreadyPresent => println!("Rules already present"),
                InstallOutcome::NotWritable => {
                    anyhow::bail!("{} is not a writable directory", dir.display())
                }
            }
        }
        HtaccessActions::Uninstall { dir } => {
            let dir = dir.clone().unwrap_or_else(|| config.server.upload_dir.clone());
            if htaccess::uninstall(&dir)? {
                println!("Removed rules from {}", htaccess::htaccess_path(&dir).display());
            } else {
                println!("No rules to remove");
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _guard = init_tracing();
    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.clone())
        .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;

    match cli.command {
        Commands::Check { file, name, roles } => {
            if !run_check(&config, &file, name, roles)? {
                std::process::exit(1);
            }
        }
        Commands::Classify { file, name, roles } => {
            if !run_classify(&config, &file, name, roles)? {
                std::process::exit(1);
            }
        }
        Commands::Serve { port } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            info!(
                "Allowed roles: {:?}, custom ceiling: {} MB",
                config.policy.allowed_roles, config.policy.custom_max_size_mb
            );
            let gateway = Gateway::new(config, cli.config, MetricsStore::new());
            gateway.start().await?;
        }
        Commands::Htaccess { action } => run_htaccess(&config, &action)?,
        Commands::Config => println!("{}", serde_json::to_string_pretty(&config)?),
    }

    Ok(())
}
