//! fwsync - firewall rule sync
//!
//! Command-line entry point, normally run from a timer or cron job.
//!
//! # Usage
//!
//! ```bash
//! fwsync import                       # Fetch the configured rule list and apply it if it changed
//! fwsync apply rules.yaml             # Apply a local rule document
//! fwsync plan rules.yaml              # Show which artifacts would change
//! fwsync check                        # Exit 0 if the remote changed, 3 if not
//! fwsync rule 22 --protocol tcp --ip-addr 10.0.0.0/8
//! fwsync rule 8080 --machine-tag role:web=true --collection web
//! fwsync rule 22 --disable
//! fwsync init                         # Write a default config (switch off)
//! fwsync history --count 5            # Show the last audit events
//! ```

use clap::{Parser, Subcommand};
use fwsync::audit::{self, AuditLog};
use fwsync::config::{self, Config, DEFAULT_CONFIG_PATH};
use fwsync::core::apply::{CommandAction, DryRunAction, HostAction, Orchestrator};
use fwsync::core::change::ChangeDetector;
use fwsync::core::import::{self, DocumentReport, ImportOutcome};
use fwsync::core::render::{DirStore, DryRunStore};
use fwsync::core::resolve::{DEFAULT_IP_TAG, FileDiscovery, TagSelector};
use fwsync::core::rules::{DEFAULT_TARGET, RuleSpec};
use fwsync::core::source::HttpSource;
use fwsync::{Error, Result};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{Level, warn};

shadow_rs::shadow!(build);

/// Exit status of `check` when the remote rules are unchanged
const EXIT_UNCHANGED: u8 = 3;

#[derive(Parser)]
#[command(name = "fwsync")]
#[command(version = build::PKG_VERSION, long_version = build::CLAP_LONG_VERSION)]
#[command(about = "Keeps host firewall rules in sync with a remote rule list", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, value_name = "PATH", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// More output (debug level)
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Less output (warnings and errors only)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Print the cycle report as JSON on stdout
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one import cycle from the configured rule source
    Import,
    /// Apply a local rule document (no change detection)
    Apply {
        /// YAML rule document
        file: PathBuf,
    },
    /// Dry run: report which artifacts a rule document would change
    Plan {
        /// YAML rule document
        file: PathBuf,
    },
    /// Exit 0 if the remote rules need applying, 3 if they are unchanged
    Check,
    /// Apply or disable a single rule
    Rule {
        /// Port number, comma-separated list, or "any"
        port: String,
        /// tcp, udp or both
        #[arg(long, default_value = "tcp")]
        protocol: String,
        /// Source address or CIDR network
        #[arg(long, value_name = "ADDR", default_value = "any")]
        ip_addr: String,
        /// Apply to discovered members carrying this tag (repeatable)
        #[arg(long = "machine-tag", value_name = "TAG")]
        machine_tags: Vec<String>,
        /// Tag holding a member's address
        #[arg(long, value_name = "TAG")]
        ip_tag: Option<String>,
        /// Discovery collection to query
        #[arg(long)]
        collection: Option<String>,
        /// Remove the rule instead of adding it
        #[arg(long)]
        disable: bool,
        /// Chain target
        #[arg(long, default_value = DEFAULT_TARGET)]
        target: String,
    },
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Show the most recent audit events, newest first
    History {
        /// Number of events to show
        #[arg(long, default_value_t = 20)]
        count: usize,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else if cli.quiet {
        Level::WARN
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to create Tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(handle_cli(cli)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn handle_cli(cli: Cli) -> Result<ExitCode> {
    if let Commands::Init { force } = cli.command {
        let config = config::init_config(&cli.config, force).await?;
        if cli.json {
            println!("{}", serde_json::to_string_pretty(&config)?);
        } else {
            println!("Wrote {} (firewall not enabled yet)", cli.config.display());
        }
        return Ok(ExitCode::SUCCESS);
    }

    let config = config::load_config(&cli.config).await?;
    config.validate()?;
    let audit = config.audit_log.as_ref().map(AuditLog::new);

    match cli.command {
        Commands::Import => {
            warn_if_not_root();
            let source = config.require_source()?.to_string();
            let http = HttpSource::new(config.http_timeout())?;
            let detector = ChangeDetector::new(http.clone());
            let mut orchestrator = live_orchestrator(&config, config.tag_selector.clone())?;

            let result = import::run_import(
                &source,
                &config.local_reference,
                &detector,
                &http,
                &mut orchestrator,
            )
            .await;

            match &result {
                Ok(ImportOutcome::Disabled) => audit::log_disabled(audit.as_ref()).await,
                Ok(ImportOutcome::Unchanged) => {
                    audit::log_unchanged(audit.as_ref(), &source).await;
                }
                Ok(ImportOutcome::Applied(report)) => {
                    audit::log_apply(audit.as_ref(), &source, report).await;
                }
                Err(e) => audit::log_failure(audit.as_ref(), &source, e).await,
            }

            let outcome = result?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                match &outcome {
                    ImportOutcome::Disabled => println!("Firewall not enabled; nothing done."),
                    ImportOutcome::Unchanged => println!("Rules unchanged since last run."),
                    ImportOutcome::Applied(report) => print_report(report),
                }
            }
        }
        Commands::Apply { file } => {
            warn_if_not_root();
            let text = tokio::fs::read_to_string(&file).await?;
            let source = file.display().to_string();
            let mut orchestrator = live_orchestrator(&config, config.tag_selector.clone())?;

            let result = import::apply_document(&text, &mut orchestrator).await;
            match &result {
                Ok(report) if report.apply.disabled => audit::log_disabled(audit.as_ref()).await,
                Ok(report) => audit::log_apply(audit.as_ref(), &source, report).await,
                Err(e) => audit::log_failure(audit.as_ref(), &source, e).await,
            }
            emit(&result?, cli.json)?;
        }
        Commands::Plan { file } => {
            let text = tokio::fs::read_to_string(&file).await?;
            if !config.enabled {
                warn!("Firewall is not enabled; planning as if it were");
            }
            let rebuild = CommandAction::from_argv(&config.rebuild_command)?;
            let reload = CommandAction::from_argv(&config.reload_command)?;
            let mut orchestrator = Orchestrator::new(
                discovery(&config),
                DryRunStore::new(DirStore::new(&config.artifact_dir)),
                DryRunAction::new(rebuild.describe()),
                DryRunAction::new(reload.describe()),
            )
            .with_selector(config.tag_selector.clone());

            let report = import::apply_document(&text, &mut orchestrator).await?;
            emit(&report, cli.json)?;
        }
        Commands::Check => {
            let source = config.require_source()?;
            let detector = ChangeDetector::new(HttpSource::new(config.http_timeout())?);
            if !detector.should_apply(&config.local_reference, source).await? {
                println!("unchanged");
                return Ok(ExitCode::from(EXIT_UNCHANGED));
            }
            println!("changed");
        }
        Commands::Rule {
            port,
            protocol,
            ip_addr,
            machine_tags,
            ip_tag,
            collection,
            disable,
            target,
        } => {
            warn_if_not_root();
            let selector = rule_selector(&config, machine_tags, ip_tag, collection)?;
            let spec = RuleSpec {
                ip_address: ip_addr,
                protocol,
                ports: port,
                enable: !disable,
                target,
            };
            let source = format!("command line ({})", spec.ports);
            let mut orchestrator = live_orchestrator(&config, selector)?;

            let result = import::apply_rule(&spec, &mut orchestrator).await;
            match &result {
                Ok(report) if report.apply.disabled => audit::log_disabled(audit.as_ref()).await,
                Ok(report) => audit::log_apply(audit.as_ref(), &source, report).await,
                Err(e) => audit::log_failure(audit.as_ref(), &source, e).await,
            }
            emit(&result?, cli.json)?;
        }
        Commands::History { count } => {
            let audit = audit
                .ok_or_else(|| Error::Config("audit_log is not configured".to_string()))?;
            let events = match audit.read_recent(count).await {
                Ok(events) => events,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
                Err(e) => return Err(e.into()),
            };
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&events)?);
            } else if events.is_empty() {
                println!("No audit events in {}", audit.path().display());
            } else {
                for event in &events {
                    println!("{}", event.summary());
                }
            }
        }
        // Handled before the config is loaded
        Commands::Init { .. } => {}
    }
    Ok(ExitCode::SUCCESS)
}

type LiveOrchestrator = Orchestrator<Option<FileDiscovery>, DirStore, CommandAction, CommandAction>;

fn live_orchestrator(config: &Config, selector: Option<TagSelector>) -> Result<LiveOrchestrator> {
    Ok(Orchestrator::new(
        discovery(config),
        DirStore::new(&config.artifact_dir),
        CommandAction::from_argv(&config.rebuild_command)?,
        CommandAction::from_argv(&config.reload_command)?,
    )
    .with_enabled(config.enabled)
    .with_selector(selector))
}

fn discovery(config: &Config) -> Option<FileDiscovery> {
    config.discovery_file.as_ref().map(FileDiscovery::new)
}

/// Tag selector for a single command-line rule.
///
/// Only tags given on the command line select members; the configured
/// selector contributes its collection and address tag as defaults.
fn rule_selector(
    config: &Config,
    machine_tags: Vec<String>,
    ip_tag: Option<String>,
    collection: Option<String>,
) -> Result<Option<TagSelector>> {
    if machine_tags.is_empty() {
        return Ok(None);
    }
    for tag in &machine_tags {
        fwsync::validators::validate_machine_tag(tag).map_err(|message| Error::Validation {
            field: "machine_tag".to_string(),
            message,
        })?;
    }

    let configured = config.tag_selector.as_ref();
    let collection = collection
        .or_else(|| configured.map(|s| s.collection.clone()))
        .ok_or_else(|| Error::Validation {
            field: "collection".to_string(),
            message: "--machine-tag needs --collection or a configured tag_selector".to_string(),
        })?;
    let ip_tag = ip_tag
        .or_else(|| configured.map(|s| s.ip_tag.clone()))
        .unwrap_or_else(|| DEFAULT_IP_TAG.to_string());

    Ok(Some(TagSelector {
        collection,
        machine_tags,
        ip_tag,
    }))
}

fn warn_if_not_root() {
    if !nix::unistd::getuid().is_root() {
        warn!("Not running as root; writing artifacts or running the rebuild may fail");
    }
}

fn emit(report: &DocumentReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        print_report(report);
    }
    Ok(())
}

fn print_report(report: &DocumentReport) {
    let apply = &report.apply;
    if apply.disabled {
        println!("Firewall not enabled; nothing done.");
        return;
    }

    println!(
        "{} entr{} -> {} rule(s), {} artifact(s), {} changed",
        report.specs,
        if report.specs == 1 { "y" } else { "ies" },
        report.rules,
        apply.rendered,
        apply.changes.len()
    );
    for change in &apply.changes {
        let verb = if change.enable { "write " } else { "remove" };
        println!("  {verb} {}", change.name);
    }
    if report.dropped_ports > 0 || report.skipped_specs > 0 || apply.skipped_rules > 0 {
        println!(
            "Skipped: {} port token(s), {} entr{}, {} rule(s) without targets",
            report.dropped_ports,
            report.skipped_specs,
            if report.skipped_specs == 1 { "y" } else { "ies" },
            apply.skipped_rules
        );
    }
    if apply.superseded > 0 {
        println!(
            "Overridden: {} artifact(s) named by more than one rule (last rule wins)",
            apply.superseded
        );
    }
    if apply.reloaded {
        println!("Rebuilt and reloaded.");
    } else if apply.rebuilt {
        println!("Rebuilt; no reload needed.");
    }
}
