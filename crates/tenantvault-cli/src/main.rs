//! `TenantVault` CLI: onboards tenants onto managed database clusters.
//!
//! Counts the users in the shared project, provisions either a new project
//! or a new user through Terraform, and records the resulting credentials
//! with deterministically encrypted passwords.

#![allow(clippy::print_stdout, clippy::print_stderr)]

mod config;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tenantvault_core::atlas::{AtlasClient, ClusterScaleRequest, ProviderSettings};
use tenantvault_core::capacity::CapacityGate;
use tenantvault_core::pipeline::Orchestrator;
use tenantvault_core::provisioning::{ProvisioningInvoker, ProvisioningTarget, Terraform};
use tenantvault_core::recorder::{CredentialRecorder, PlaintextFallback};
use tenantvault_core::vault::{EncryptionContext, MasterKey};
use tenantvault_storage::{DocumentStore, JsonLinesStore, MemoryStore, Namespace, PostgresStore};
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::config::{
    AtlasSettings, EncryptionSettings, LogFormat, LogSettings, MappingSettings, MappingStoreType,
    ProvisionerConfig, env_lookup,
};

// ── ANSI color helpers ───────────────────────────────────────────────

const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const RED: &str = "\x1b[31m";
const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const WHITE: &str = "\x1b[37m";

// ── CLI structure ────────────────────────────────────────────────────

/// TenantVault: capacity-aware tenant provisioning with encrypted credential records.
#[derive(Parser)]
#[command(
    name = "tenantvault",
    version,
    about = "TenantVault CLI: provision tenant database users and record their credentials",
    long_about = None,
    after_help = format!(
        "{DIM}Required environment variables (run, check):{RESET}\n  \
         ATLAS_PUBLIC_KEY, ATLAS_PRIVATE_KEY, ATLAS_ORG_ID,\n  \
         ATLAS_SOURCE_PROJECT_ID, GCP_PROJECT_ID\n\n\
         {DIM}Examples:{RESET}\n  \
         tenantvault keygen\n  \
         tenantvault check\n  \
         CSFLE_MASTER_KEY=... tenantvault run\n  \
         tenantvault scale --cluster Cluster0 --instance-size M30"
    ),
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check capacity, provision through Terraform, and record credentials.
    Run,
    /// Validate configuration and report the capacity decision without provisioning.
    Check,
    /// Generate a new base64 master key.
    Keygen,
    /// Decrypt and print stored credential records.
    Reveal {
        /// Only show records for this username.
        #[arg(long)]
        username: Option<String>,
    },
    /// Resize a cluster through the management API.
    Scale {
        /// Cluster name.
        #[arg(long)]
        cluster: String,
        /// Project holding the cluster (default: `ATLAS_SOURCE_PROJECT_ID`).
        #[arg(long)]
        project: Option<String>,
        /// Target instance size.
        #[arg(long, default_value = "M30")]
        instance_size: String,
        /// Disk size in GB.
        #[arg(long, default_value = "20")]
        disk_size_gb: u32,
        /// Provisioned disk IOPS.
        #[arg(long, default_value = "3000")]
        disk_iops: u32,
        /// Cloud provider.
        #[arg(long, default_value = "GCP")]
        provider: String,
    },
}

// ── Pretty output helpers ────────────────────────────────────────────

fn header(icon: &str, title: &str) {
    println!("{BOLD}{CYAN}{icon} {title}{RESET}");
    println!("{DIM}─────────────────────────────────────────{RESET}");
}

fn kv_line(key: &str, value: &str) {
    println!("  {DIM}{key:<20}{RESET} {WHITE}{value}{RESET}");
}

fn success(msg: &str) {
    println!("{GREEN}{BOLD}✓{RESET} {msg}");
}

fn warning(msg: &str) {
    eprintln!("{YELLOW}{BOLD}⚠{RESET} {YELLOW}{msg}{RESET}");
}

// ── Command dispatch ─────────────────────────────────────────────────

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&LogSettings::from_lookup(env_lookup));

    match run(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!();
            eprintln!("  {RED}{BOLD}✗ Error:{RESET} {e:#}");
            eprintln!();
            ExitCode::FAILURE
        }
    }
}

fn init_logging(settings: &LogSettings) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&settings.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match settings.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

async fn run(cmd: Commands) -> Result<()> {
    match cmd {
        Commands::Keygen => {
            cmd_keygen();
            Ok(())
        }
        Commands::Run => cmd_run(&ProvisionerConfig::from_env()?).await,
        Commands::Check => cmd_check(&ProvisionerConfig::from_env()?).await,
        Commands::Reveal { username } => cmd_reveal(username.as_deref()).await,
        Commands::Scale {
            cluster,
            project,
            instance_size,
            disk_size_gb,
            disk_iops,
            provider,
        } => {
            let request = ClusterScaleRequest {
                provider_settings: ProviderSettings {
                    provider_name: provider,
                    instance_size_name: instance_size,
                    disk_iops: Some(disk_iops),
                },
                disk_size_gb: Some(disk_size_gb),
            };
            cmd_scale(&cluster, project.as_deref(), &request).await
        }
    }
}

// ── Commands ─────────────────────────────────────────────────────────

fn cmd_keygen() {
    let key = MasterKey::generate();
    println!("{}", key.to_base64().as_str());
}

async fn cmd_run(config: &ProvisionerConfig) -> Result<()> {
    let master_key = resolve_master_key(&config.encryption, true);
    let orchestrator = build_orchestrator(config).await?;

    header("⟐", "Tenant provisioning");
    let report = orchestrator.run(&master_key).await.map_err(|e| {
        let stage = e.stage();
        anyhow::Error::new(e).context(format!("run failed at stage '{stage}'"))
    })?;

    let mode = if report.decision.create_new {
        "new project"
    } else {
        "existing project"
    };
    kv_line("Users counted", &report.decision.user_count.to_string());
    kv_line("Threshold", &config.user_threshold.to_string());
    kv_line("Mode", mode);
    if let Some(changes) = report.changes {
        kv_line(
            "Changes",
            &format!("+{} ~{} -{}", changes.add, changes.change, changes.remove),
        );
    }
    kv_line("Records stored", &report.batch.inserted.to_string());
    kv_line("Encrypted", &report.batch.encrypted.to_string());
    if report.batch.plaintext > 0 {
        warning(&format!(
            "{} password(s) stored in PLAINTEXT under ALLOW_PLAINTEXT_FALLBACK",
            report.batch.plaintext
        ));
    }
    println!();
    success("Provisioning complete.");
    Ok(())
}

async fn cmd_check(config: &ProvisionerConfig) -> Result<()> {
    let master_key = resolve_master_key(&config.encryption, false);
    let orchestrator = build_orchestrator(config).await?;

    header("⟐", "Capacity check");
    let decision = orchestrator.check(&master_key).await.map_err(|e| {
        let stage = e.stage();
        anyhow::Error::new(e).context(format!("check failed at stage '{stage}'"))
    })?;

    kv_line("Source project", &config.atlas.source_project_id);
    kv_line("Users counted", &decision.user_count.to_string());
    kv_line("Threshold", &config.user_threshold.to_string());
    kv_line(
        "Next run would",
        if decision.create_new {
            "create a new project"
        } else {
            "add a user to the existing project"
        },
    );
    println!();
    success("Configuration is valid.");
    Ok(())
}

async fn cmd_reveal(username: Option<&str>) -> Result<()> {
    let encryption = EncryptionSettings::from_lookup(env_lookup)?;
    let Some(master_key) = encryption.master_key else {
        bail!("CSFLE_MASTER_KEY must be set to decrypt stored records");
    };
    let ctx = EncryptionContext::initialize(&master_key).context("invalid CSFLE_MASTER_KEY")?;

    let mapping = MappingSettings::from_lookup(env_lookup)?;
    let recorder = CredentialRecorder::new(
        build_store(&mapping.store).await?,
        namespace(&mapping)?,
        PlaintextFallback::Refuse,
    );
    let records = recorder.load().await.context("failed to read credential records")?;

    header("⚷", &format!("Credential records in {}", recorder.namespace()));
    let mut shown = 0usize;
    for record in records
        .iter()
        .filter(|r| username.is_none_or(|u| r.username == u))
    {
        let password = record
            .reveal_password(&ctx)
            .with_context(|| format!("failed to decrypt password for '{}'", record.username))?;
        println!();
        kv_line("Username", &record.username);
        kv_line("Password", &password);
        kv_line("Connection string", &record.connection_string);
        kv_line("Created", &record.created_at.to_rfc3339());
        shown += 1;
    }
    println!();
    if shown == 0 {
        println!("  {DIM}No matching records.{RESET}");
    } else {
        success(&format!("{shown} record(s) decrypted."));
    }
    Ok(())
}

async fn cmd_scale(cluster: &str, project: Option<&str>, request: &ClusterScaleRequest) -> Result<()> {
    let settings = AtlasSettings::from_lookup(env_lookup)?;
    let client = atlas_client(&settings)?;
    let project = project.unwrap_or(&settings.source_project_id);

    header("⇅", &format!("Scaling {cluster}"));
    let updated = client
        .scale_cluster(project, cluster, request)
        .await
        .with_context(|| format!("failed to scale cluster '{cluster}'"))?;

    kv_line("Project", project);
    kv_line("Instance size", &request.provider_settings.instance_size_name);
    if let Some(state) = updated.get("stateName").and_then(|v| v.as_str()) {
        kv_line("State", state);
    }
    println!();
    success("Resize requested.");
    Ok(())
}

// ── Wiring ───────────────────────────────────────────────────────────

/// Use the configured master key, or generate one.
///
/// A key generated for `run` is printed so the operator can persist it;
/// without it, this run's records can never be decrypted.
fn resolve_master_key(settings: &EncryptionSettings, surface: bool) -> Zeroizing<String> {
    if let Some(key) = &settings.master_key {
        return Zeroizing::new(key.clone());
    }
    let key = MasterKey::generate().to_base64();
    if surface {
        warning("CSFLE_MASTER_KEY is not set; generated a new master key.");
        eprintln!("  Save it now. Records from this run cannot be decrypted without it:");
        eprintln!();
        eprintln!("  {BOLD}CSFLE_MASTER_KEY={}{RESET}", key.as_str());
        eprintln!();
        warn!("generated a new master key; it was printed to stderr and must be persisted");
    }
    key
}

fn atlas_client(settings: &AtlasSettings) -> Result<AtlasClient> {
    AtlasClient::new(
        &settings.base_url,
        settings.credentials.clone(),
        settings.http_timeout,
    )
    .context("failed to build management API client")
}

fn namespace(mapping: &MappingSettings) -> Result<Namespace> {
    Namespace::new(&mapping.database, &mapping.collection)
        .context("invalid MAPPING_DB_NAME or MAPPING_COLLECTION_NAME")
}

async fn build_store(store: &MappingStoreType) -> Result<Arc<dyn DocumentStore>> {
    Ok(match store {
        MappingStoreType::Memory => {
            warn!("mapping store is in-memory; credential records will not survive this process");
            Arc::new(MemoryStore::new())
        }
        MappingStoreType::File { path } => {
            info!(path = %path.display(), "using JSON-lines mapping store");
            Arc::new(JsonLinesStore::new(path))
        }
        MappingStoreType::Postgres { url } => {
            info!("using PostgreSQL mapping store");
            Arc::new(
                PostgresStore::connect(url)
                    .await
                    .context("failed to connect to the mapping store")?,
            )
        }
    })
}

async fn build_orchestrator(config: &ProvisionerConfig) -> Result<Orchestrator> {
    let client = atlas_client(&config.atlas)?;
    let gate = CapacityGate::new(Arc::new(client), config.user_threshold);

    let terraform = Terraform::new(
        &config.terraform.binary,
        &config.terraform.working_dir,
        config.terraform.timeout,
    );
    let invoker = ProvisioningInvoker::new(Arc::new(terraform));

    let fallback = PlaintextFallback::from_flag(config.encryption.allow_plaintext_fallback);
    if fallback == PlaintextFallback::Allow {
        warn!("ALLOW_PLAINTEXT_FALLBACK is set; passwords may be stored unencrypted");
    }
    let recorder = CredentialRecorder::new(
        build_store(&config.mapping.store).await?,
        namespace(&config.mapping)?,
        fallback,
    );

    let target = ProvisioningTarget {
        credentials: config.atlas.credentials.clone(),
        org_id: config.org_id.clone(),
        source_project_id: config.atlas.source_project_id.clone(),
        gcp_project_id: config.gcp_project_id.clone(),
        ip_whitelist: config.ip_whitelist.clone(),
    };

    Ok(Orchestrator::new(gate, invoker, recorder, target))
}
