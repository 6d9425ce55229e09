//! Campaigner CLI entry point.
//!
//! Provides `send`, `check`, `quota`, and `suppress` subcommands for running
//! a campaign, validating the setup, inspecting the send quota, and
//! maintaining the suppression list.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use campaigner::campaign::compose::compose_messages;
use campaigner::campaign::{CampaignConfig, CampaignDispatcher, DispatcherDeps};
use campaigner::config::{load_config, load_default_config, runtime_paths, Config, RuntimePaths};
use campaigner::credentials::load_default_credentials;
use campaigner::delivery::quota::QuotaTracker;
use campaigner::delivery::sink::{DeliveryRecordSink, InMemorySink};
use campaigner::delivery::DeliveryOutcome;
use campaigner::providers::resend::ResendClient;
use campaigner::providers::ProviderClient;
use campaigner::recipients::{is_valid_email, load_recipients};
use campaigner::store::SqliteDeliveryStore;
use campaigner::template::{MessageTemplate, PlaceholderRenderer};

/// Template id used for the single template of a CLI run.
const CLI_TEMPLATE_ID: &str = "campaign";

/// Campaigner: bulk email campaign delivery.
#[derive(Parser)]
#[command(name = "campaigner", version, about)]
struct Cli {
    /// Path to `config.toml` (defaults to `~/.campaigner/config.toml`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Render and deliver a campaign.
    Send {
        /// Recipient list: CSV with a header row, a JSON array, or JSON lines (`.jsonl`).
        #[arg(long)]
        recipients: PathBuf,
        /// HTML body template with `{{ placeholders }}`.
        #[arg(long)]
        template: PathBuf,
        /// Optional plain-text body template.
        #[arg(long)]
        text_template: Option<PathBuf>,
        /// Subject template.
        #[arg(long)]
        subject: String,
        /// Campaign id; reuse it to resume an interrupted run.
        #[arg(long)]
        campaign_id: Option<String>,
        /// Render and simulate delivery without contacting the provider.
        #[arg(long)]
        dry_run: bool,
        /// Print the summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Validate configuration and credentials, then exit.
    Check,
    /// Show the remaining sends in the current quota window.
    Quota,
    /// Add an address to the suppression list.
    Suppress {
        /// Address to suppress.
        email: String,
        /// Why it is suppressed (e.g. "unsubscribed").
        #[arg(long)]
        reason: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let paths = runtime_paths()?;
    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => load_default_config()
            .with_context(|| format!("failed to load {}", paths.config_toml.display()))?,
    };

    match cli.command {
        Command::Send {
            recipients,
            template,
            text_template,
            subject,
            campaign_id,
            dry_run,
            json,
        } => {
            let request = SendArgs {
                recipients,
                template,
                text_template,
                subject,
                campaign_id,
                dry_run,
                json,
            };
            handle_send(&paths, &config, request).await
        }
        Command::Check => handle_check(&config),
        Command::Quota => handle_quota(&paths, &config).await,
        Command::Suppress { email, reason } => {
            handle_suppress(&paths, &config, &email, reason.as_deref()).await
        }
    }
}

struct SendArgs {
    recipients: PathBuf,
    template: PathBuf,
    text_template: Option<PathBuf>,
    subject: String,
    campaign_id: Option<String>,
    dry_run: bool,
    json: bool,
}

/// Render the recipient list and run the campaign to completion.
async fn handle_send(paths: &RuntimePaths, config: &Config, args: SendArgs) -> anyhow::Result<()> {
    std::fs::create_dir_all(&paths.root)
        .with_context(|| format!("failed to create {}", paths.root.display()))?;
    let _logging_guard = campaigner::logging::init_delivery_logging(&paths.logs_dir)?;

    ensure_valid(config)?;
    let dry_run = args.dry_run || config.delivery.dry_run;

    let recipients = load_recipients(&args.recipients)
        .with_context(|| format!("failed to load {}", args.recipients.display()))?;
    let mut template = MessageTemplate::load(args.subject, &args.template)?;
    if let Some(text_path) = &args.text_template {
        let text = std::fs::read_to_string(text_path)
            .with_context(|| format!("failed to read {}", text_path.display()))?;
        template = template.with_text(text);
    }
    let renderer = PlaceholderRenderer::new().with_template(CLI_TEMPLATE_ID, template);

    let campaign_id = args.campaign_id.unwrap_or_else(new_campaign_id);
    let composition = compose_messages(&campaign_id, &recipients, &renderer, CLI_TEMPLATE_ID);
    for failure in &composition.failures {
        warn!(email = %failure.email, reason = %failure.reason, "recipient dropped");
    }
    if composition.messages.is_empty() {
        anyhow::bail!("no deliverable recipients in {}", args.recipients.display());
    }

    let provider = build_provider(config)?;
    let store = if dry_run {
        None
    } else {
        Some(Arc::new(SqliteDeliveryStore::open(&paths.db_path(&config.storage)).await?))
    };
    let sink: Arc<dyn DeliveryRecordSink> = match &store {
        Some(store) => Arc::clone(store) as Arc<dyn DeliveryRecordSink>,
        None => Arc::new(InMemorySink::new()),
    };

    let deps = DispatcherDeps::from_config(&config.delivery, provider, sink);
    let campaign = CampaignConfig::from_delivery(&campaign_id, &config.delivery).with_dry_run(dry_run);
    let total = composition.messages.len();
    let done = AtomicUsize::new(0);
    let dispatcher = CampaignDispatcher::new(campaign, deps).with_observer(
        move |outcome: &DeliveryOutcome| {
            let n = done.fetch_add(1, Ordering::Relaxed).saturating_add(1);
            info!(
                progress = %format!("{n}/{total}"),
                recipient = %outcome.recipient,
                status = outcome.status.as_str(),
                "delivery outcome"
            );
        },
    );

    let cancel = dispatcher.cancel_handle();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received interrupt; finishing in-flight sends and skipping the rest");
            cancel.cancel();
        }
    });

    info!(campaign_id = %campaign_id, messages = total, dry_run, "starting campaign");
    let result = dispatcher.run(composition.messages).await;
    ctrl_c.abort();
    if let Some(store) = store {
        if let Ok(store) = Arc::try_unwrap(store) {
            store.shutdown().await;
        }
    }
    let summary = result.context("campaign aborted")?;

    if args.json {
        let json =
            serde_json::to_string_pretty(&summary).context("failed to serialize summary")?;
        println!("{json}");
    } else {
        println!("{summary}");
        for (reason, count) in &summary.skipped_by_reason {
            println!("  skipped ({}): {count}", reason.as_str());
        }
        for (class, reasons) in &summary.error_reasons {
            for reason in reasons {
                println!("  {} failure: {reason}", class.as_str());
            }
        }
        if !composition.failures.is_empty() {
            println!("  dropped before sending: {}", composition.failures.len());
        }
    }
    Ok(())
}

/// Preflight: configuration and provider credentials.
fn handle_check(config: &Config) -> anyhow::Result<()> {
    campaigner::logging::init_console_logging();
    ensure_valid(config)?;
    let provider = build_provider(config)?;
    provider
        .check_ready()
        .with_context(|| format!("provider {} is not ready", provider.name()))?;
    println!("configuration ok; provider {} ready", provider.name());
    Ok(())
}

/// Print the remaining sends in the current quota window.
async fn handle_quota(paths: &RuntimePaths, config: &Config) -> anyhow::Result<()> {
    campaigner::logging::init_console_logging();
    let store = SqliteDeliveryStore::open(&paths.db_path(&config.storage)).await?;
    let quota = QuotaTracker::from_config(&config.delivery);
    let window_start = quota.period().window_start(Utc::now());
    if let Some(window) = store
        .load_quota_window(window_start)
        .await
        .context("failed to read quota window")?
    {
        quota.restore(&window);
    }
    let window = quota.snapshot();
    println!(
        "{} of {} sends remaining in window starting {}",
        quota.remaining(),
        window.ceiling,
        window.window_start.to_rfc3339()
    );
    store.shutdown().await;
    Ok(())
}

/// Add an address to the suppression list.
async fn handle_suppress(
    paths: &RuntimePaths,
    config: &Config,
    email: &str,
    reason: Option<&str>,
) -> anyhow::Result<()> {
    campaigner::logging::init_console_logging();
    if !is_valid_email(email) {
        anyhow::bail!("not a valid email address: {email}");
    }
    let store = SqliteDeliveryStore::open(&paths.db_path(&config.storage)).await?;
    store
        .add_suppression(email, reason)
        .await
        .context("failed to add suppression")?;
    store.shutdown().await;
    println!("suppressed {email}");
    Ok(())
}

fn ensure_valid(config: &Config) -> anyhow::Result<()> {
    let problems = config.validate();
    if problems.is_empty() {
        return Ok(());
    }
    anyhow::bail!("invalid configuration:\n  - {}", problems.join("\n  - "))
}

fn build_provider(config: &Config) -> anyhow::Result<Arc<dyn ProviderClient>> {
    let credentials = load_default_credentials(&[config.provider.api_key_env.as_str()])?;
    let api_key = credentials
        .get(&config.provider.api_key_env)
        .map(str::to_owned);
    Ok(Arc::new(ResendClient::new(&config.provider, api_key)))
}

fn new_campaign_id() -> String {
    let suffix: String = uuid::Uuid::new_v4().simple().to_string().chars().take(8).collect();
    format!("cmp-{}-{suffix}", Utc::now().format("%Y%m%d"))
}
