//! devauth Server
//!
//! Operator entry point: runs data migrations, inspects devices and auth
//! sets, decides auth sets, and issues, checks or revokes device tokens.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;

use devauth_core::config::{Config, load_config};
use devauth_core::db::unix_timestamp;
use devauth_core::tracing_init::init_tracing;
use devauth_server::auth::{TokenAgent, TokenAgentConfig};
use devauth_server::devices::Decision;
use devauth_server::migrate::Migrator;
use devauth_server::service::DevAuthService;
use devauth_server::storage::{DeviceDatabase, Status, TenantDatabases, TenantId, database_file};

#[derive(Parser, Debug)]
#[command(name = "devauth-server")]
#[command(version, about = "devauth - device identity and token authority")]
struct Args {
    /// Path to a JSON config file.
    #[arg(long, global = true, env = "DEVAUTH_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding the tenant databases.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// PEM-encoded PKCS#1 RSA private key for signing tokens.
    #[arg(long, global = true)]
    private_key: Option<PathBuf>,

    /// Tenant namespace; the default database when omitted.
    #[arg(long, global = true)]
    tenant: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply schema and data migrations.
    Migrate,
    /// Show a device and its auth sets.
    Status { device_id: String },
    /// Accept or reject an auth set.
    Decide {
        auth_set_id: String,
        #[arg(value_enum)]
        decision: DecisionArg,
    },
    /// Issue a token for an accepted device.
    IssueToken { device_id: String },
    /// Validate a token and check its revocation state.
    ValidateToken { token: String },
    /// Revoke a single token by its `jti`.
    RevokeToken { jti: String },
    /// Delete records of tokens that have already expired.
    PurgeTokens,
    /// List devices, optionally by status.
    ListDevices {
        #[arg(long)]
        status: Option<Status>,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum DecisionArg {
    Accept,
    Reject,
}

impl From<DecisionArg> for Decision {
    fn from(arg: DecisionArg) -> Self {
        match arg {
            DecisionArg::Accept => Self::Accept,
            DecisionArg::Reject => Self::Reject,
        }
    }
}

impl Args {
    /// Resolve the config file and environment, then apply CLI overrides.
    fn resolve_config(&self) -> anyhow::Result<Config> {
        let mut config = load_config(self.config.as_deref())?;
        if let Some(dir) = &self.data_dir {
            config.storage.data_dir = Some(dir.clone());
        }
        if let Some(key) = &self.private_key {
            config.token.private_key_path = key.clone();
        }
        if self.log_json {
            config.log.json = true;
        }
        Ok(config)
    }

    fn tenant(&self) -> anyhow::Result<Option<TenantId>> {
        self.tenant
            .as_deref()
            .map(TenantId::parse)
            .transpose()
            .context("Invalid --tenant")
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = args.resolve_config()?;
    init_tracing(&config.log);

    let data_dir = config.storage.resolved_data_dir()?;
    let tenant = args.tenant()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %data_dir.display(),
        tenant = tenant.as_ref().map_or("default", TenantId::as_str),
        "Starting devauth-server"
    );

    match args.command {
        Command::Migrate => migrate(&data_dir, tenant.as_ref()).await,
        command => {
            let databases = TenantDatabases::new(data_dir, config.storage.automigrate);
            let db = databases.get(tenant.as_ref()).await?;
            run(command, db, &config).await
        }
    }
}

#[allow(clippy::print_stdout)]
async fn run(command: Command, db: DeviceDatabase, config: &Config) -> anyhow::Result<()> {
    match command {
        Command::ListDevices { status } => {
            for device in db.list_devices(status).await? {
                println!("{}\t{}", device.id, device.status);
            }
            return Ok(());
        }
        Command::PurgeTokens => {
            let purged = db.delete_expired_tokens(unix_timestamp()).await?;
            println!("purged {purged} expired tokens");
            return Ok(());
        }
        _ => {}
    }

    let service = DevAuthService::new(db, Arc::new(load_agent(config)?));
    match command {
        Command::Status { device_id } => {
            let device = service.engine().device(&device_id).await?;
            println!(
                "{}\t{}\tdecommissioning={}",
                device.id, device.status, device.decommissioning
            );
            for auth_set in service.engine().list_auth_sets(&device_id).await? {
                println!(
                    "  {}\t{}\t{}",
                    auth_set.id, auth_set.status, auth_set.identity_hash
                );
            }
        }
        Command::Decide {
            auth_set_id,
            decision,
        } => {
            let outcome = service.decide(&auth_set_id, decision.into()).await?;
            let revoked = if outcome.revoke_tokens {
                " (tokens revoked)"
            } else {
                ""
            };
            println!(
                "auth set {} -> {}, device {} -> {}{revoked}",
                outcome.auth_set.id, outcome.auth_set.status, outcome.device.id, outcome.device.status
            );
        }
        Command::IssueToken { device_id } => {
            let token = service.issue_token(&device_id).await?;
            println!("{}", token.token);
        }
        Command::ValidateToken { token } => {
            let claims = service.verify(&token).await?;
            println!(
                "valid: sub={} jti={} exp={}",
                claims.sub, claims.jti, claims.exp
            );
        }
        Command::RevokeToken { jti } => {
            if service.revoke(&jti).await? {
                println!("revoked {jti}");
            } else {
                anyhow::bail!("No live token with jti {jti}");
            }
        }
        Command::Migrate | Command::ListDevices { .. } | Command::PurgeTokens => {}
    }

    Ok(())
}

fn load_agent(config: &Config) -> anyhow::Result<TokenAgent> {
    let agent_config = TokenAgentConfig::from(&config.token);
    TokenAgent::new(&agent_config).with_context(|| {
        format!(
            "Failed to load signing key {}",
            agent_config.private_key_path.display()
        )
    })
}

#[allow(clippy::print_stdout)]
async fn migrate(data_dir: &Path, tenant: Option<&TenantId>) -> anyhow::Result<()> {
    let path = database_file(data_dir, tenant);
    info!(path = %path.display(), "Opening device database");
    let db = DeviceDatabase::open(&path).await?;

    let report = Migrator::with_default_steps().run(&db).await?;
    for (version, step) in &report.applied {
        println!(
            "applied {version}: {} devices, {} auth sets updated",
            step.devices_updated, step.auth_sets_updated
        );
    }
    match report.version {
        Some(version) => println!("data version {version}"),
        None => println!("no data migrations"),
    }
    Ok(())
}
