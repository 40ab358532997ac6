use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::SystemTime;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use clap::Parser;
use colored::Colorize;
use serde::Serialize;
use tracing::{debug, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use odoo_ops::cli::{Cli, Commands, ConfigCommands, VERSION_WITH_BUILD};
use odoo_ops::core::lock::RunLock;
use odoo_ops::core::postgres::ComposePostgres;
use odoo_ops::core::restore::{verify_bundle, RestoreOptions, TerminalPrompt};
use odoo_ops::core::retention::{list_bundles, sweep};
use odoo_ops::core::schedule::{self, ScheduleEntry, SystemCrontab};
use odoo_ops::core::pipeline::{run_backup, BackupOptions};
use odoo_ops::core::shipper::Rsync;
use odoo_ops::core::{ConfigManager, DockerManager, OpsConfig, OpsError, RestoreOrchestrator};
use odoo_ops::utils::{
    format_age, format_bytes, get_project_root, is_sensitive_key, mask_sensitive,
    ContainerState, DEFAULT_ENV_FILE,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => report_error(&e),
    }
}

fn init_tracing(cli: &Cli) {
    let filter = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => "warn,odoo_ops=info",
            1 => "info,odoo_ops=debug",
            2 => "debug,odoo_ops=trace",
            _ => "trace",
        }
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn report_error(e: &anyhow::Error) -> ExitCode {
    match e.downcast_ref::<OpsError>() {
        Some(OpsError::ScheduleAlreadyExists(line)) => {
            println!("✓ Backup schedule already installed:\n  {}", line);
            ExitCode::SUCCESS
        }
        Some(ops) => {
            eprintln!("{} {}", "✗ Error:".red().bold(), ops);
            if let OpsError::RestoreHalted { state, .. } = ops {
                eprintln!(
                    "  Restore stopped after {}; the deployment was not rolled back.",
                    state.to_string().yellow()
                );
            }
            ExitCode::from(ops.exit_code())
        }
        None => {
            eprintln!("{} {:#}", "✗ Error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Backup { no_ship, no_prune } => {
            let deployment = Deployment::load(&cli.project_dir, &cli.env_file)?;
            handle_backup(&deployment, no_ship, no_prune).await
        }
        Commands::Restore {
            bundle,
            yes,
            allow_unverified,
            skip_addons,
            no_restart,
        } => {
            let deployment = Deployment::load(&cli.project_dir, &cli.env_file)?;
            let options = RestoreOptions {
                interactive: !yes,
                allow_unverified,
                restore_addons: !skip_addons,
                restart_service: !no_restart,
            };
            handle_restore(&deployment, &bundle, options).await
        }
        Commands::Verify { bundle } => {
            let deployment = Deployment::load(&cli.project_dir, &cli.env_file)?;
            handle_verify(&deployment, &bundle)
        }
        Commands::List { json } => {
            let deployment = Deployment::load(&cli.project_dir, &cli.env_file)?;
            handle_list(&deployment, json)
        }
        Commands::Prune => {
            let deployment = Deployment::load(&cli.project_dir, &cli.env_file)?;
            handle_prune(&deployment)
        }
        Commands::ScheduleInstall { cron } => {
            let deployment = Deployment::load(&cli.project_dir, &cli.env_file)?;
            handle_schedule_install(&deployment, cron)
        }
        Commands::ScheduleRemove => {
            let deployment = Deployment::load(&cli.project_dir, &cli.env_file)?;
            handle_schedule_remove(&deployment)
        }
        Commands::Status => {
            let deployment = Deployment::load(&cli.project_dir, &cli.env_file)?;
            handle_status(&deployment).await
        }
        Commands::Config { command } => handle_config(&cli.project_dir, &cli.env_file, command),
    }
}

/// Resolved project root and settings for one invocation
struct Deployment {
    config: OpsConfig,
}

impl Deployment {
    fn load(project_dir: &Option<PathBuf>, env_file: &Option<PathBuf>) -> Result<Self> {
        let (root, manager) = load_env(project_dir, env_file)?;
        let config = manager.resolve(&root)?;
        debug!(root = %root.display(), db = %config.db_name, "Loaded deployment");
        Ok(Self { config })
    }

    fn docker(&self) -> Result<DockerManager> {
        Ok(DockerManager::new(&self.config.project_root)?)
    }
}

fn load_env(project_dir: &Option<PathBuf>, env_file: &Option<PathBuf>) -> Result<(PathBuf, ConfigManager)> {
    let root = get_project_root(project_dir.as_deref())?;
    let root = root
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", root.display()))?;
    let env_path = env_file
        .clone()
        .unwrap_or_else(|| root.join(DEFAULT_ENV_FILE));
    let manager = ConfigManager::load(&env_path)?;
    Ok((root, manager))
}

async fn handle_backup(deployment: &Deployment, no_ship: bool, no_prune: bool) -> Result<()> {
    let config = &deployment.config;

    let docker = deployment.docker()?;
    match docker.service_state(&config.db_service).await {
        Ok(state) if state.is_running() => {}
        Ok(state) => {
            return Err(OpsError::backup_failed(
                "checking database service",
                format!("service '{}' is {}", config.db_service, state.as_str()),
            )
            .into());
        }
        Err(e) => warn!(error = %e, "Could not query the database service state; trying anyway"),
    }

    let db = ComposePostgres::new(
        docker,
        &config.db_service,
        &config.db_user,
        config.db_password.clone(),
    );
    let options = BackupOptions {
        ship: !no_ship,
        prune: !no_prune,
    };
    let run = run_backup(config, &db, &Rsync, options, Local::now()).await?;

    println!(
        "✓ Created {} ({})",
        run.bundle.path.display(),
        format_bytes(run.bundle.size)
    );
    for endpoint in &run.shipped {
        println!("✓ Shipped to {}", endpoint);
    }
    if !run.removed.is_empty() {
        println!("✓ Removed {} expired bundle(s)", run.removed.len());
    }

    run.finish()?;
    Ok(())
}

async fn handle_restore(deployment: &Deployment, bundle: &Path, options: RestoreOptions) -> Result<()> {
    let config = &deployment.config;
    if options.interactive && !std::io::stdin().is_terminal() {
        return Err(OpsError::ConfirmationDeclined(
            "stdin is not a terminal; pass --yes to restore without prompting".to_string(),
        )
        .into());
    }

    let _lock = RunLock::acquire(&config.lock_path(), "restore")?;
    let docker = deployment.docker()?;
    let db = ComposePostgres::new(
        docker.clone(),
        &config.db_service,
        &config.db_user,
        config.db_password.clone(),
    );

    let mut orchestrator = RestoreOrchestrator::new(config, &db, &docker, &TerminalPrompt, options);
    let report = orchestrator.run(bundle).await?;

    println!("✓ Restored database '{}'", report.database);
    if !report.verified {
        println!("  {} bundle was not verifiable against its dump", "!".yellow());
    }
    if report.terminated_connections > 0 {
        println!("  Terminated {} active connection(s)", report.terminated_connections);
    }
    if let odoo_ops::core::postgres::ReplayOutcome::Tolerated { errors, .. } = &report.replay {
        println!("  {} pg_restore skipped {} object error(s)", "!".yellow(), errors);
    }
    println!("✓ Filestore restored to {}", report.filestore_dir.display());
    if report.addons_mirrored {
        println!("✓ Custom addons restored to {}", config.addons_dir.display());
    }
    if report.service_restarted {
        println!("✓ Service '{}' started", config.app_service);
    } else {
        println!("  Service '{}' left stopped", config.app_service);
    }
    Ok(())
}

fn handle_verify(deployment: &Deployment, bundle: &Path) -> Result<()> {
    let (opened, validation) = verify_bundle(bundle, &deployment.config.db_name)?;

    println!("Bundle: {}\n", bundle.display());
    if let Some(info) = &opened.info {
        for (key, value) in info.entries() {
            println!("  {:<16} {}", format!("{}:", key), value);
        }
    }
    if let Some(header) = &opened.header {
        let (major, minor, rev) = header.version;
        println!("  {:<16} {}.{}.{}", "Dump format:", major, minor, rev);
        if let Some(server) = &header.server_version {
            println!("  {:<16} {}", "Server:", server);
        }
    }
    println!();

    match (&validation.metadata_name, &validation.dump_name) {
        (_, Some(dump)) => println!("✓ Dump is a backup of '{}'", dump),
        (Some(metadata), None) => println!(
            "{} Dump does not name its database; metadata says '{}'",
            "!".yellow(),
            metadata
        ),
        (None, None) => println!(
            "{} Neither metadata nor dump name a database; would restore as '{}'",
            "!".yellow(),
            validation.target
        ),
    }
    if let Some(reason) = &opened.header_error {
        println!("  {}", reason);
    }
    if validation.target != deployment.config.db_name {
        println!(
            "{} Target '{}' differs from POSTGRES_DB '{}'",
            "!".yellow(),
            validation.target,
            deployment.config.db_name
        );
    }
    println!("✓ Bundle is intact");
    Ok(())
}

#[derive(Serialize)]
struct BundleListing {
    name: String,
    path: PathBuf,
    size: u64,
    modified: String,
    age_seconds: u64,
    partial: bool,
}

fn handle_list(deployment: &Deployment, json: bool) -> Result<()> {
    let config = &deployment.config;
    let now = SystemTime::now();
    let bundles = list_bundles(&config.backup_dir, &config.backup_prefix)?;

    if json {
        let listing: Vec<BundleListing> = bundles
            .iter()
            .map(|b| BundleListing {
                name: b.name(),
                path: b.path.clone(),
                size: b.size,
                modified: DateTime::<Local>::from(b.modified).to_rfc3339(),
                age_seconds: b.age(now).as_secs(),
                partial: b.partial,
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&listing)?);
        return Ok(());
    }

    if bundles.is_empty() {
        println!("No bundles in {}", config.backup_dir.display());
        return Ok(());
    }

    println!("{:<45} {:>10} {:>12}", "Bundle", "Size", "Age");
    println!("{}", "-".repeat(69));
    for bundle in &bundles {
        let mut name = bundle.name();
        if bundle.partial {
            name = format!("{} (incomplete)", name);
        }
        println!(
            "{:<45} {:>10} {:>12}",
            name,
            format_bytes(bundle.size),
            format_age(bundle.age(now))
        );
    }

    let total: u64 = bundles.iter().map(|b| b.size).sum();
    println!("\n{} bundle(s), {}", bundles.len(), format_bytes(total));
    Ok(())
}

fn handle_prune(deployment: &Deployment) -> Result<()> {
    let config = &deployment.config;
    let _lock = RunLock::acquire(&config.lock_path(), "prune")?;

    if config.retention_days == 0 {
        println!("Retention is disabled (BACKUP_RETENTION_DAYS=0)");
        return Ok(());
    }

    let removed = sweep(
        &config.backup_dir,
        &config.backup_prefix,
        config.retention_days,
        SystemTime::now(),
    )?;
    if removed.is_empty() {
        println!("✓ No bundles older than {} day(s)", config.retention_days);
    } else {
        for path in &removed {
            println!("  removed {}", path.display());
        }
        println!("✓ Removed {} expired bundle(s)", removed.len());
    }
    Ok(())
}

fn handle_schedule_install(deployment: &Deployment, cron: Option<String>) -> Result<()> {
    let config = &deployment.config;
    let entry = ScheduleEntry {
        cron: cron.unwrap_or_else(|| config.backup_cron.clone()),
        executable: std::env::current_exe().context("Failed to locate the odoo-ops binary")?,
        project_root: config.project_root.clone(),
        log_file: config.backup_dir.join("backup.log"),
    };

    let line = schedule::install(&SystemCrontab, &entry)?;
    println!("✓ Installed backup schedule:\n  {}", line);
    Ok(())
}

fn handle_schedule_remove(deployment: &Deployment) -> Result<()> {
    match schedule::remove(&SystemCrontab, &deployment.config.project_root)? {
        0 => println!("No backup schedule installed"),
        n => println!("✓ Removed {} crontab line(s)", n),
    }
    Ok(())
}

async fn handle_status(deployment: &Deployment) -> Result<()> {
    let config = &deployment.config;

    println!("odoo-ops {}", VERSION_WITH_BUILD);
    println!("Odoo deployment: {}\n", config.project_root.display());
    println!("{:<20} {}", "Database:", config.db_name);
    println!("{:<20} {}", "Backup dir:", config.backup_dir.display());
    println!(
        "{:<20} {}",
        "Remotes:",
        if config.remotes.is_empty() {
            "none".to_string()
        } else {
            config
                .remotes
                .iter()
                .map(|r| r.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        }
    );
    println!("{:<20} {} day(s)", "Retention:", config.retention_days);
    println!();

    match deployment.docker() {
        Ok(docker) if docker.check_docker().await => {
            println!("{:<25} {:<15}", "Service", "State");
            println!("{}", "-".repeat(40));
            for service in [&config.db_service, &config.app_service] {
                let state = docker
                    .service_state(service)
                    .await
                    .unwrap_or(ContainerState::Unknown);
                let shown = if state.is_running() {
                    state.as_str().green()
                } else {
                    state.as_str().red()
                };
                println!("{:<25} {:<15}", service, shown);
            }
        }
        _ => println!("{} Docker daemon is not reachable", "✗".red()),
    }
    println!();

    let now = SystemTime::now();
    let bundles = list_bundles(&config.backup_dir, &config.backup_prefix)?;
    match bundles.iter().rev().find(|b| !b.partial) {
        Some(latest) => println!(
            "{:<20} {} ({}, {})",
            "Latest bundle:",
            latest.name(),
            format_bytes(latest.size),
            format_age(latest.age(now))
        ),
        None => println!("{:<20} none", "Latest bundle:"),
    }

    match schedule::installed(&SystemCrontab, &config.project_root) {
        Ok(Some(line)) => println!("{:<20} {}", "Schedule:", line),
        Ok(None) => println!("{:<20} not installed", "Schedule:"),
        Err(e) => println!("{:<20} unknown ({})", "Schedule:", e),
    }

    if let Some(holder) = RunLock::holder(&config.lock_path()) {
        println!(
            "{:<20} {} (pid {}, {})",
            "Last locked run:", holder.command, holder.pid, holder.acquired_at
        );
    }

    Ok(())
}

fn handle_config(project_dir: &Option<PathBuf>, env_file: &Option<PathBuf>, command: ConfigCommands) -> Result<()> {
    let (_, config) = load_env(project_dir, env_file)?;

    match command {
        ConfigCommands::View => {
            println!("Configuration ({}):\n", config.env_file().display());
            for key in config.keys() {
                if let Some(value) = config.get(&key) {
                    let display_value = if is_sensitive_key(&key) {
                        mask_sensitive(value, 4)
                    } else {
                        value.to_string()
                    };
                    println!("{}: {}", key, display_value);
                }
            }
        }
        ConfigCommands::Validate => {
            let errors = config.validate();

            if errors.is_empty() {
                println!("✓ Configuration is valid");
            } else {
                println!("✗ Configuration errors:");
                for error in &errors {
                    println!("  - {}", error);
                }
                return Err(OpsError::Config(format!("{} error(s) in {}", errors.len(), config.env_file().display())).into());
            }
        }
    }

    Ok(())
}
