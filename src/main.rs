//! DealerSync
//!
//! Main entry point for the DealerSync CLI.

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use dealersync::auth::{CrmAccount, Credentials, OAuthClient};
use dealersync::config::{validate_config, validate_config_result, SyncConfig};
use dealersync::ledger::{
    AppointmentType, EntityKind, LocalAppointment, LocalContact, RecordStore, SyncLedger,
    SyncStatus,
};
use dealersync::remote::{DmsAdapter, HttpDmsAdapter, MessageKind, ReqwestTransport, Transport};
use dealersync::server::{AppState, SyncServer};
use dealersync::sync::{
    build_sessions, delete_remote_appointment, queue_remote_appointment, queue_remote_contact,
    send_message, BatchOrchestrator, SyncDaemon, TenantSession,
};
use dealersync::{Result, SyncError};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

/// DealerSync - keep dealership contacts and appointments in step across systems
#[derive(Parser, Debug)]
#[command(name = "dealersync")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to config file (default: ~/.config/dealersync/config.yaml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Debug logging for dealersync
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the scheduler daemon and the trigger server
    Run,

    /// Run one orchestrator pass now
    Sync {
        /// Only this tenant (default: all)
        #[arg(short, long)]
        tenant: Option<String>,
    },

    /// Store a local contact and queue it for the remote CRM
    EnqueueContact {
        #[arg(short, long)]
        tenant: String,
        #[arg(long)]
        contact: String,
        #[arg(long)]
        first_name: Option<String>,
        #[arg(long)]
        last_name: Option<String>,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        phone: Option<String>,
    },

    /// Store a local appointment and queue it for the remote calendar
    EnqueueAppointment {
        #[arg(short, long)]
        tenant: String,
        #[arg(long)]
        appointment: String,
        #[arg(long)]
        contact: String,
        #[arg(long)]
        title: String,
        /// RFC 3339 start time
        #[arg(long)]
        start: DateTime<Utc>,
        /// RFC 3339 end time
        #[arg(long)]
        end: DateTime<Utc>,
        /// sales, service or test_drive
        #[arg(long = "type", default_value = "sales")]
        appointment_type: AppointmentType,
    },

    /// Message a contact through the remote CRM (reconciles it first)
    Message {
        #[arg(short, long)]
        tenant: String,
        #[arg(long)]
        contact: String,
        /// sms or email
        #[arg(long, default_value = "sms")]
        kind: MessageKind,
        #[arg(long)]
        body: String,
    },

    /// Queue a remote contact to be pulled into the DMS on the next pass
    QueueRemoteContact {
        #[arg(short, long)]
        tenant: String,
        #[arg(long)]
        remote_id: String,
    },

    /// Queue a remote calendar event to be pulled into the DMS on the next pass
    QueueRemoteAppointment {
        #[arg(short, long)]
        tenant: String,
        #[arg(long)]
        remote_id: String,
    },

    /// Remove an appointment's remote event
    DeleteAppointment {
        #[arg(short, long)]
        tenant: String,
        #[arg(long)]
        appointment: String,
    },

    /// Delete every ledger row of a tenant
    Purge {
        #[arg(short, long)]
        tenant: String,
    },

    /// Ledger row counts by status
    Status {
        #[arg(short, long)]
        tenant: String,
    },

    /// Store API-key credentials for a tenant
    ConnectApiKey {
        #[arg(short, long)]
        tenant: String,
        #[arg(long)]
        api_key: String,
        #[arg(long)]
        location: String,
    },

    /// Exchange an OAuth authorization code for a tenant
    ConnectOauth {
        #[arg(short, long)]
        tenant: String,
        #[arg(long)]
        code: String,
        #[arg(long)]
        location: String,
    },

    /// Deactivate a tenant's CRM account
    Deactivate {
        #[arg(short, long)]
        tenant: String,
    },

    /// Check the configuration for errors
    Validate,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = dealersync::logging::init(cli.verbose) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = match cli.config {
        Some(ref path) => SyncConfig::load(path)?,
        None => SyncConfig::load_default()?,
    };
    tracing::info!(tenants = config.tenants.len(), "Configuration loaded");

    if let Commands::Validate = cli.command {
        return handle_validate(&config);
    }

    let ledger = Arc::new(SyncLedger::open(&config.database)?);
    let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::new(config.remote.timeout())?);

    match cli.command {
        Commands::Run => {
            validate_config_result(&config)?;
            let sessions = sessions(&config, ledger.clone(), transport)?;
            let orchestrator = BatchOrchestrator::from_config(&config.orchestrator);

            if config.server.enabled {
                let server = SyncServer::new(AppState::new(
                    &sessions,
                    ledger.clone(),
                    orchestrator.clone(),
                ));
                let bind = config.server.bind.clone();
                tokio::spawn(async move {
                    if let Err(e) = server.run(&bind).await {
                        tracing::error!("Trigger server stopped: {}", e);
                    }
                });
            }

            let mut daemon =
                SyncDaemon::new(sessions, orchestrator, config.orchestrator.poll_interval());
            daemon.run().await
        }

        Commands::Sync { tenant } => {
            let sessions: Vec<Arc<TenantSession>> = sessions(&config, ledger, transport)?
                .into_iter()
                .filter(|s| tenant.as_deref().map_or(true, |id| s.tenant_id() == id))
                .collect();
            if let Some(ref id) = tenant {
                if sessions.is_empty() {
                    return Err(unknown_tenant(id));
                }
            }

            let reports = BatchOrchestrator::from_config(&config.orchestrator)
                .run_tenants(&sessions)
                .await;
            println!("{}", serde_json::to_string_pretty(&reports)?);
            Ok(())
        }

        Commands::EnqueueContact {
            tenant,
            contact,
            first_name,
            last_name,
            email,
            phone,
        } => {
            require_tenant(&config, &tenant)?;
            let local = LocalContact {
                id: contact,
                first_name,
                last_name,
                email,
                phone,
            };
            ledger.upsert_contact(&tenant, &local)?;
            let record = ledger.enqueue_contact(&tenant, &local.id, local.email(), local.phone())?;
            println!("Queued contact {} ({})", record.local_contact_id, record.sync_status);
            Ok(())
        }

        Commands::EnqueueAppointment {
            tenant,
            appointment,
            contact,
            title,
            start,
            end,
            appointment_type,
        } => {
            require_tenant(&config, &tenant)?;
            if end < start {
                return Err(SyncError::Validation(
                    "appointment ends before it starts".to_string(),
                ));
            }
            let local = LocalAppointment {
                id: appointment,
                contact_id: contact,
                title,
                start,
                end,
                status: "confirmed".to_string(),
                appointment_type,
            };
            ledger.upsert_appointment(&tenant, &local)?;
            let record = ledger.enqueue_appointment(&tenant, &local)?;
            println!(
                "Queued {} appointment {} ({})",
                record.appointment_type, record.local_appointment_id, record.sync_status
            );
            Ok(())
        }

        Commands::Message {
            tenant,
            contact,
            kind,
            body,
        } => {
            let session = session(&config, ledger, transport, &tenant)?;
            let sent = send_message(&session, &contact, kind, &body).await?;
            println!(
                "Sent {} to {} (message {})",
                kind.as_str(),
                sent.remote_contact_id,
                sent.message_id.as_deref().unwrap_or("-")
            );
            Ok(())
        }

        Commands::QueueRemoteContact { tenant, remote_id } => {
            let session = session(&config, ledger, transport, &tenant)?;
            let record = queue_remote_contact(&session, &remote_id)?;
            println!(
                "Queued remote contact {} as {} ({})",
                remote_id, record.local_contact_id, record.sync_status
            );
            Ok(())
        }

        Commands::QueueRemoteAppointment { tenant, remote_id } => {
            let session = session(&config, ledger, transport, &tenant)?;
            let record = queue_remote_appointment(&session, &remote_id)?;
            println!(
                "Queued remote event {} as {} ({})",
                remote_id, record.local_appointment_id, record.sync_status
            );
            Ok(())
        }

        Commands::DeleteAppointment {
            tenant,
            appointment,
        } => {
            let session = session(&config, ledger, transport, &tenant)?;
            match delete_remote_appointment(&session, &appointment).await? {
                Some(event_id) => println!("Deleted remote event {} for {}", event_id, appointment),
                None => println!("Appointment {} has no remote event", appointment),
            }
            Ok(())
        }

        Commands::Purge { tenant } => {
            let removed = ledger.purge_tenant(&tenant)?;
            println!("Removed {} ledger rows for {}", removed, tenant);
            Ok(())
        }

        Commands::Status { tenant } => {
            let counts = ledger.status_counts(&tenant)?;
            println!("Tenant {}", tenant);
            for entity in [EntityKind::Contact, EntityKind::Appointment] {
                println!("  {}:", entity);
                for status in SyncStatus::all() {
                    println!("    {:<15} {}", status.as_str(), counts.count(entity, status));
                }
            }
            Ok(())
        }

        Commands::ConnectApiKey {
            tenant,
            api_key,
            location,
        } => {
            require_tenant(&config, &tenant)?;
            ledger.upsert_account(&CrmAccount::new(
                &tenant,
                Credentials::api_key(api_key, location),
            ))?;
            println!("Connected tenant {} with an API key", tenant);
            Ok(())
        }

        Commands::ConnectOauth {
            tenant,
            code,
            location,
        } => {
            require_tenant(&config, &tenant)?;
            let app = config
                .oauth
                .clone()
                .ok_or_else(|| SyncError::Config("No oauth app configured".to_string()))?;
            let client = OAuthClient::new(app, &config.remote.base_url, transport);
            client.connect(&ledger, &tenant, &code, &location).await?;
            println!("Connected tenant {} through OAuth", tenant);
            Ok(())
        }

        Commands::Deactivate { tenant } => {
            if ledger.deactivate_account(&tenant)? {
                println!("Deactivated CRM account for {}", tenant);
            } else {
                println!("No CRM account for {}", tenant);
            }
            Ok(())
        }

        Commands::Validate => unreachable!("handled above"),
    }
}

fn handle_validate(config: &SyncConfig) -> Result<()> {
    match validate_config(config) {
        Ok(()) => {
            println!("Configuration OK ({} tenants)", config.tenants.len());
            Ok(())
        }
        Err(errors) => {
            for error in &errors {
                println!("  {}", error);
            }
            Err(SyncError::Config(format!(
                "{} validation error(s)",
                errors.len()
            )))
        }
    }
}

fn sessions(
    config: &SyncConfig,
    ledger: Arc<SyncLedger>,
    transport: Arc<dyn Transport>,
) -> Result<Vec<Arc<TenantSession>>> {
    let dms: Option<Arc<dyn DmsAdapter>> = match config.dms {
        Some(ref dms) => Some(Arc::new(HttpDmsAdapter::new(dms)?)),
        None => None,
    };
    Ok(build_sessions(config, ledger, transport, dms))
}

fn session(
    config: &SyncConfig,
    ledger: Arc<SyncLedger>,
    transport: Arc<dyn Transport>,
    tenant_id: &str,
) -> Result<Arc<TenantSession>> {
    sessions(config, ledger, transport)?
        .into_iter()
        .find(|s| s.tenant_id() == tenant_id)
        .ok_or_else(|| unknown_tenant(tenant_id))
}

fn require_tenant(config: &SyncConfig, tenant_id: &str) -> Result<()> {
    config
        .tenant(tenant_id)
        .map(|_| ())
        .ok_or_else(|| unknown_tenant(tenant_id))
}

fn unknown_tenant(tenant_id: &str) -> SyncError {
    SyncError::Config(format!("Unknown tenant: {}", tenant_id))
}
