//! # LeadPilot: Lead Follow-up Automation
//!
//! Usage:
//!   leadpilot run                               # Trigger monitor, due sweep, optimization
//!   leadpilot stages                            # Show the configured stage catalog
//!   leadpilot schedule <lead-id>                # Plan the lead's next send
//!   leadpilot reply <lead-id> --message-id <id> # Feed an inbound reply to the learning loop
//!   leadpilot route <lead-id> --attr key=value  # Route a lead with extra attributes
//!   leadpilot recommend <lead-id>               # Ranked next actions for a lead

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value, json};
use tracing_subscriber::EnvFilter;

use leadpilot_core::config::LeadPilotConfig;
use leadpilot_core::traits::composer::TemplateComposer;
use leadpilot_core::traits::sender::OutboundSender;
use leadpilot_core::types::Lead;
use leadpilot_scheduler::ScheduleOutcome;
use leadpilot_workflow::LeadPilot;

#[derive(Parser)]
#[command(
    name = "leadpilot",
    version,
    about = "🧭 LeadPilot: lead follow-up automation"
)]
struct Cli {
    /// Config file (default: ~/.leadpilot/config.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Database path, overrides the config (":memory:" for an in-process store)
    #[arg(long)]
    db_path: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the background loops until Ctrl+C
    Run,
    /// Show the configured stage catalog
    Stages,
    /// Plan the next send for a lead
    Schedule { lead_id: String },
    /// Record an inbound reply
    Reply {
        lead_id: String,
        /// Sent message the reply answers
        #[arg(long)]
        message_id: Option<String>,
        /// Reply time, RFC 3339 (default: now)
        #[arg(long)]
        at: Option<String>,
    },
    /// Route a lead to an assignee
    Route {
        lead_id: String,
        /// Extra attribute, repeatable (key=value; JSON values accepted)
        #[arg(long = "attr")]
        attrs: Vec<String>,
    },
    /// Ranked next actions for a lead
    Recommend { lead_id: String },
}

/// Hands messages to the log until a real transport is plugged in.
struct LogSender;

#[async_trait]
impl OutboundSender for LogSender {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, lead: &Lead, body: &str) -> leadpilot_core::error::Result<()> {
        tracing::info!("📤 [{}] → {} ({}): {}", self.name(), lead.name, lead.id, body);
        Ok(())
    }
}

fn expand_path(p: &str) -> String {
    shellexpand::tilde(p).to_string()
}

fn init_logging(verbose: bool, json_logs: bool) {
    let filter = if verbose {
        "leadpilot=debug,leadpilot_core=debug,leadpilot_db=debug,\
         leadpilot_scheduler=debug,leadpilot_workflow=debug"
    } else {
        "info"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    if json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .init();
    }
}

/// `key=value`; values that parse as JSON keep their type.
fn parse_attr(raw: &str) -> Result<(String, Value)> {
    let (key, value) = raw
        .split_once('=')
        .with_context(|| format!("attribute '{raw}' is not key=value"))?;
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.trim().to_string(), value))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json_logs);

    let mut config = match &cli.config {
        Some(path) => LeadPilotConfig::load_from(Path::new(&expand_path(path)))?,
        None => LeadPilotConfig::load()?,
    };
    if let Some(db_path) = &cli.db_path {
        config.database.path = db_path.clone();
    }

    let db_path = config.database.path.clone();
    if db_path != ":memory:" {
        if let Some(parent) = Path::new(&expand_path(&db_path)).parent() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let store = leadpilot_db::open_datastore(&db_path)?;
    let composer = Arc::new(TemplateComposer::new(config.composer.strict));
    let pilot = LeadPilot::new(config, store, composer, Arc::new(LogSender)).await?;

    match cli.command {
        Commands::Run => {
            println!("🧭 LeadPilot v{}", env!("CARGO_PKG_VERSION"));
            println!("   🗄️  Database:  {db_path}");
            println!("   📚 Stages:    {}", pilot.config().stages.len());
            println!(
                "   ⏱️  Sweep:     every {}s",
                pilot.config().sweep.interval_secs
            );
            println!();

            let handles = pilot.start();
            tokio::signal::ctrl_c().await?;
            tracing::info!("🛑 Shutting down");
            for handle in handles {
                handle.abort();
            }
        }
        Commands::Stages => {
            println!(
                "{:<14} {:>6} {:>7} {:>9}  {:<12} HOURS",
                "STAGE", "DELAY", "JITTER", "PRIORITY", "BUCKET"
            );
            for stage in &pilot.config().stages {
                let bucket = stage
                    .day_bucket
                    .map(|b| format!("{b:?}"))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<14} {:>5}h {:>6}m {:>9}  {:<12} {:?}",
                    stage.stage,
                    stage.delay_hours,
                    stage.jitter_minutes,
                    stage.priority,
                    bucket,
                    stage.preferred_hours
                );
            }
        }
        Commands::Schedule { lead_id } => match pilot.schedule_next(&lead_id).await? {
            ScheduleOutcome::Scheduled(send) => {
                println!("{}", serde_json::to_string_pretty(&send)?);
            }
            ScheduleOutcome::Skipped(reason) => println!("⏭️  Skipped: {}", reason.as_str()),
            ScheduleOutcome::Terminated => println!("🏁 Sequence finished for {lead_id}"),
            ScheduleOutcome::Conflict => println!("⚠️  Concurrent update, try again"),
            ScheduleOutcome::LeadMissing => println!("❌ Lead {lead_id} not found"),
        },
        Commands::Reply {
            lead_id,
            message_id,
            at,
        } => {
            let replied_at = match at {
                Some(raw) => DateTime::parse_from_rfc3339(&raw)
                    .with_context(|| format!("invalid --at '{raw}'"))?
                    .with_timezone(&Utc),
                None => Utc::now(),
            };
            let report = pilot
                .on_inbound_reply(&lead_id, message_id.as_deref(), replied_at)
                .await;
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "lead_id": lead_id,
                    "pattern_updated": report.pattern_updated,
                    "template_credited": report.template_credited,
                    "lead_marked": report.lead_marked,
                }))?
            );
        }
        Commands::Route { lead_id, attrs } => {
            let mut attributes = match pilot.store().get_lead(&lead_id).await? {
                Some(lead) => leadpilot_workflow::lead_attributes(&lead),
                None => Map::new(),
            };
            for raw in &attrs {
                let (key, value) = parse_attr(raw)?;
                attributes.insert(key, value);
            }
            match pilot.route_lead(&lead_id, &attributes).await? {
                Some(assignee) => println!("✅ {lead_id} → {assignee}"),
                None => println!("🤷 No routing rule matched {lead_id}"),
            }
        }
        Commands::Recommend { lead_id } => {
            let ctx = pilot
                .recommendation_context(&lead_id)
                .await?
                .with_context(|| format!("lead '{lead_id}' not found"))?;
            let recs = pilot.get_recommendations(&ctx).await;
            println!("{}", serde_json::to_string_pretty(&recs)?);
        }
    }

    Ok(())
}
