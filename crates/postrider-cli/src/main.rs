//! postrider - bulk mail delivery, from the command line

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use postrider_common::Config;
use postrider_core::backoff::BackoffSchedule;
use postrider_core::delivery::{DeliveryEngine, DeliveryOptions};
use postrider_core::message::{DkimSigner, DkimSigningConfig, MessageBuilder, SenderIdentity};
use postrider_core::roster::{CsvRoster, RecipientSource};
use postrider_core::smtp::{ConnectionPool, LettreSessionFactory, PoolConfig};
use postrider_core::template::TemplateRenderer;
use postrider_core::validate::{CheckStatus, DnsChecker, PreSendValidator};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "postrider", about = "Personalized bulk mail delivery engine", version)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "postrider.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Deliver every pending roster row
    Send {
        /// Roster CSV path, overriding the configured one
        #[arg(long)]
        roster: Option<PathBuf>,

        /// Render and validate everything but skip the network transaction
        #[arg(long)]
        dry_run: bool,

        /// Skip the interactive confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// Connectivity self-test plus the sender-side DNS verdict
    Check,
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("postrider={level},postrider_core={level}")));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

/// Wire the engine from configuration.
fn build_engine(config: &Config, dry_run: bool) -> Result<Arc<DeliveryEngine<LettreSessionFactory>>> {
    let factory = LettreSessionFactory::new(config.smtp.clone());
    let pool = Arc::new(ConnectionPool::new(
        factory,
        PoolConfig {
            max_connections: config.delivery.pool_size,
            rotate_after_sends: config.delivery.rotate_after_sends,
        },
    ));

    let (body_template, html_template) = config.template.load()?;
    let renderer = Arc::new(TemplateRenderer::new(
        config.template.subject.clone(),
        body_template,
        html_template,
        config.sender.name.clone().unwrap_or_default(),
    ));

    let signer = match &config.dkim {
        Some(dkim) => {
            let signer = DkimSigner::from_key_file(
                DkimSigningConfig::new(dkim.domain.clone(), dkim.selector.clone()),
                &dkim.private_key_path,
            )?;
            info!("DKIM signing enabled for {} ({})", dkim.domain, dkim.selector);
            Some(signer)
        }
        None => {
            warn!("DKIM is not configured; large providers may filter unsigned bulk mail");
            None
        }
    };

    let builder = Arc::new(MessageBuilder::new(
        SenderIdentity {
            address: config.sender.address.clone(),
            name: config.sender.name.clone(),
            reply_to: config.sender.reply_to.clone(),
            unsubscribe_address: config.sender.unsubscribe_address.clone(),
            unsubscribe_url: config.sender.unsubscribe_url.clone(),
        },
        signer,
        config.delivery.html_enabled,
    ));

    let validator = if config.checks.enabled {
        let dns = if config.checks.dns_enabled {
            config.sender.domain().map(|domain| {
                Arc::new(DnsChecker::new(
                    domain.to_string(),
                    config.checks.sender_ip.clone(),
                    config.checks.dnsbl_zones.clone(),
                ))
            })
        } else {
            None
        };
        Some(Arc::new(PreSendValidator::new(dns)))
    } else {
        None
    };

    let schedule = BackoffSchedule {
        base_delay_secs: config.delivery.base_delay_secs,
        max_delay_secs: config.delivery.max_delay_secs,
        jitter_fraction: config.delivery.jitter_fraction,
        max_attempts: config.delivery.max_attempts,
    };

    let options = DeliveryOptions {
        batch_size: config.delivery.batch_size,
        batch_delay: Duration::from_secs(config.delivery.batch_delay_secs),
        per_message_delay: Duration::from_millis(config.delivery.per_message_delay_ms),
        workers: config.delivery.workers,
        dry_run,
        reject_on_failure: config.checks.reject_on_failure,
        unsubscribe_footer: config.sender.unsubscribe_address.clone(),
        attachments_dir: config.roster.attachments_dir.clone(),
    };

    Ok(Arc::new(DeliveryEngine::new(
        pool,
        renderer,
        builder,
        validator,
        schedule,
        options,
    )))
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{} (y/N): ", prompt);
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    Ok(answer.trim().eq_ignore_ascii_case("y"))
}

async fn run_send(config: Config, roster_path: Option<PathBuf>, dry_run: bool, yes: bool) -> Result<()> {
    let roster_path = roster_path.unwrap_or_else(|| config.roster.path.clone());
    let mut roster = CsvRoster::open(&roster_path)?;
    let records = roster.read()?;

    if records.is_empty() {
        info!("nothing to send: no pending roster rows");
        return Ok(());
    }

    info!(
        "{} pending recipient(s) in {:?}{}",
        records.len(),
        roster_path,
        if dry_run { " (dry run)" } else { "" }
    );

    if !dry_run && !yes && !confirm(&format!("Send to {} recipient(s)?", records.len()))? {
        info!("cancelled by operator");
        return Ok(());
    }

    let engine = build_engine(&config, dry_run)?;

    // A server we cannot reach at all is a configuration problem; fail the
    // run before any recipient is touched.
    if !dry_run {
        engine.self_test().await?;
        info!("connectivity self-test passed");
    }

    let cancel = engine.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing in-flight sends");
            cancel.cancel();
        }
    });

    let report = engine.run(records).await?;
    report.log();

    if !dry_run {
        for outcome in &report.outcomes {
            roster.write_status(outcome.record_id, outcome.status.send_status())?;
        }
        info!("statuses written back to {:?}", roster_path);
    }

    let report_path = roster_path.with_extension(format!(
        "report.{}.json",
        report.finished_at.format("%Y%m%d%H%M%S")
    ));
    std::fs::write(&report_path, report.to_json()?)
        .with_context(|| format!("failed to write report {:?}", report_path))?;
    info!("outcome report written to {:?}", report_path);

    let summary = report.summary();
    if summary.sent < summary.total {
        warn!(
            "{} of {} recipient(s) were not delivered",
            summary.total - summary.sent,
            summary.total
        );
    }
    Ok(())
}

async fn run_check(config: Config) -> Result<()> {
    let engine = build_engine(&config, false)?;

    match engine.self_test().await {
        Ok(()) => info!(
            "connectivity self-test passed for {}:{}",
            config.smtp.host, config.smtp.port
        ),
        Err(e) => {
            error!("connectivity self-test failed: {}", e);
            bail!("self-test failed");
        }
    }

    let checks = engine.sender_checks().await;
    if checks.is_empty() {
        info!("sender DNS checks are disabled");
    }
    for check in checks {
        match check.status {
            CheckStatus::Pass => info!("{}: ok", check.name),
            CheckStatus::Warning(msg) => warn!("{}: {}", check.name, msg),
            CheckStatus::Fail(msg) => error!("{}: {}", check.name, msg),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::from_file(&cli.config)
        .with_context(|| format!("failed to load configuration {:?}", cli.config))?;
    init_logging(&config.logging.level);

    match cli.command {
        Command::Send {
            roster,
            dry_run,
            yes,
        } => run_send(config, roster, dry_run, yes).await,
        Command::Check => run_check(config).await,
    }
}
