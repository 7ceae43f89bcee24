//! tenantdb CLI
//!
//! Manage the tenant registry in the master catalog and issue tenant claims.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tenantdb_core::Tenant;
use tenantdb_pipeline::RoutingConfig;
use tenantdb_storage::{
    AesGcmEncryption, AuditContext, CreateTenantRequest, SqliteTenantRegistry, TenantClaimIssuer,
    TenantContext,
};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tenantdb")]
#[command(version, about = "tenantdb registry CLI", long_about = None)]
struct Cli {
    /// Master catalog descriptor
    #[arg(short, long, env = "TENANTDB_MASTER_DB", global = true)]
    master: Option<String>,

    /// Actor recorded in the audit log
    #[arg(long, default_value = "cli", global = true)]
    actor: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the master catalog
    Init,

    /// Register a tenant
    Create {
        tenant_id: String,

        #[arg(long)]
        name: String,

        /// Defaults to the tenant id
        #[arg(long)]
        routing_key: Option<String>,

        /// App database descriptor (default: from TENANTDB_TENANT_DB_TEMPLATE)
        #[arg(long)]
        app_db: Option<String>,

        /// Identity database descriptor (default: from TENANTDB_TENANT_DB_TEMPLATE)
        #[arg(long)]
        identity_db: Option<String>,
    },

    /// List tenants
    List {
        /// Include deleted tenants
        #[arg(short, long)]
        all: bool,

        #[arg(long)]
        json: bool,
    },

    /// Show one tenant
    Show {
        tenant_id: String,

        /// Number of audit entries to show
        #[arg(long, default_value_t = 10)]
        audit: usize,

        #[arg(long)]
        json: bool,
    },

    /// Stop routing to a tenant
    Deactivate { tenant_id: String },

    /// Resume routing to a tenant
    Activate { tenant_id: String },

    /// Soft-delete a tenant
    Delete { tenant_id: String },

    /// Print an encrypted tenant claim (needs TENANTDB_CLAIM_KEY)
    IssueClaim { tenant_id: String },

    /// Print a new random claim key
    GenerateKey,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn config(cli: &Cli) -> RoutingConfig {
    let mut config = RoutingConfig::from_env();
    if let Some(master) = &cli.master {
        config.master_db = master.clone();
    }
    config
}

fn registry(config: &RoutingConfig) -> anyhow::Result<SqliteTenantRegistry> {
    let mut registry = SqliteTenantRegistry::new(config.master_descriptor()?)?;
    if let Some(template) = &config.tenant_db_template {
        registry = registry.with_descriptor_template(template.clone())?;
    }
    Ok(registry)
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = config(&cli);
    debug!(?config, "Resolved configuration");
    let audit = AuditContext::new(cli.actor.clone());

    match cli.command {
        Commands::GenerateKey => {
            println!("{}", AesGcmEncryption::generate_key()?);
        }
        Commands::IssueClaim { tenant_id } => {
            let issuer = TenantClaimIssuer::new(config.encryption()?);
            let tenant = TenantContext::new(tenant_id)?;
            println!("{}", issuer.issue(&tenant)?);
        }
        Commands::Init => {
            let applied = registry(&config)?.initialize().await?;
            println!(
                "Initialized master catalog at '{}' ({} migrations applied)",
                config.master_db, applied
            );
        }
        Commands::Create {
            tenant_id,
            name,
            routing_key,
            app_db,
            identity_db,
        } => {
            let routing_key = routing_key.unwrap_or_else(|| tenant_id.clone());
            let tenant = registry(&config)?
                .create_tenant(
                    CreateTenantRequest {
                        tenant_id,
                        name,
                        routing_key,
                        app_db,
                        identity_db,
                    },
                    audit,
                )
                .await?;
            println!("Created tenant '{}'", tenant.tenant_id);
            print_tenant(&tenant);
        }
        Commands::List { all, json } => {
            let tenants = registry(&config)?.list_tenants(all).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&tenants)?);
                return Ok(());
            }
            if tenants.is_empty() {
                println!("No tenants found.");
                return Ok(());
            }
            println!("{:<24} {:<10} {:<20} NAME", "TENANT", "STATUS", "ROUTING KEY");
            for tenant in &tenants {
                println!(
                    "{:<24} {:<10} {:<20} {}",
                    tenant.tenant_id,
                    status(tenant),
                    tenant.routing_key,
                    tenant.name
                );
            }
        }
        Commands::Show {
            tenant_id,
            audit: limit,
            json,
        } => {
            let registry = registry(&config)?;
            let Some(tenant) = registry.get_tenant(&tenant_id).await? else {
                bail!("Tenant '{}' not found", tenant_id);
            };
            let entries = registry.get_audit_log(Some(&tenant_id), limit).await?;
            if json {
                let value = serde_json::json!({ "tenant": tenant, "audit": entries });
                println!("{}", serde_json::to_string_pretty(&value)?);
                return Ok(());
            }
            print_tenant(&tenant);
            if !entries.is_empty() {
                println!();
                println!("Audit log:");
                for entry in entries {
                    println!(
                        "  {}  {:<12} by {}",
                        entry.timestamp,
                        entry.action,
                        entry.actor.as_deref().unwrap_or("-")
                    );
                }
            }
        }
        Commands::Deactivate { tenant_id } => {
            registry(&config)?
                .deactivate_tenant(&tenant_id, audit)
                .await
                .with_context(|| format!("deactivating '{}'", tenant_id))?;
            println!("Deactivated tenant '{}'", tenant_id);
        }
        Commands::Activate { tenant_id } => {
            registry(&config)?
                .activate_tenant(&tenant_id, audit)
                .await
                .with_context(|| format!("activating '{}'", tenant_id))?;
            println!("Activated tenant '{}'", tenant_id);
        }
        Commands::Delete { tenant_id } => {
            registry(&config)?
                .delete_tenant(&tenant_id, audit)
                .await
                .with_context(|| format!("deleting '{}'", tenant_id))?;
            println!("Deleted tenant '{}'", tenant_id);
        }
    }

    Ok(())
}

fn status(tenant: &Tenant) -> &'static str {
    if tenant.is_deleted {
        "deleted"
    } else if tenant.is_active {
        "active"
    } else {
        "inactive"
    }
}

fn print_tenant(tenant: &Tenant) {
    println!("  Tenant ID:    {}", tenant.tenant_id);
    println!("  Name:         {}", tenant.name);
    println!("  Routing key:  {}", tenant.routing_key);
    println!("  Status:       {}", status(tenant));
    println!("  App DB:       {}", tenant.app_db);
    println!("  Identity DB:  {}", tenant.identity_db);
    println!("  Created:      {}", tenant.created_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(at) = tenant.deactivated_at {
        println!("  Deactivated:  {}", at.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(at) = tenant.deleted_at {
        println!("  Deleted:      {}", at.format("%Y-%m-%d %H:%M:%S"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_create() {
        let cli = Cli::try_parse_from([
            "tenantdb",
            "--master",
            "/tmp/master.db",
            "create",
            "acme",
            "--name",
            "Acme Corp",
        ])
        .unwrap();
        assert_eq!(cli.master.as_deref(), Some("/tmp/master.db"));
        match cli.command {
            Commands::Create {
                tenant_id,
                routing_key,
                ..
            } => {
                assert_eq!(tenant_id, "acme");
                assert!(routing_key.is_none());
            }
            _ => panic!("expected create"),
        }
    }
}
