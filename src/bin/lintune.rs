use std::io::BufRead;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use lintune::configurator::{RollbackReport, SystemConfigurator};
use lintune::installer::{InstallProgress, Installer, RunLog};
use lintune::preflight::{self, BUILD_TOOLS};
use lintune::privilege::{ElevationMode, PrivilegeSession};
use lintune::process::SystemRunner;
use lintune::validator::{SystemStatus, SystemValidator};
use lintune::{HostPaths, Settings};
use tracing_subscriber::EnvFilter;

const PROGRESS_POLL: Duration = Duration::from_millis(200);

fn usage() -> &'static str {
    "Usage:\n  lintune [--debug] [--password-stdin] status [--json]\n  lintune [--debug] [--password-stdin] install <domain> [--no-sudo] [--rollback-on-failure]\n  lintune [--debug] [--password-stdin] rollback\n  lintune [--debug] [--password-stdin] restore\n  lintune [--debug] [--password-stdin] uninstall\n  lintune [--debug] [--password-stdin] doctor\n  lintune [--debug] logs [lines]"
}

struct Globals {
    debug: bool,
    password_stdin: bool,
}

fn split_globals(args: Vec<String>) -> (Globals, Vec<String>) {
    let mut globals = Globals {
        debug: false,
        password_stdin: false,
    };
    let rest = args
        .into_iter()
        .filter(|arg| match arg.as_str() {
            "--debug" => {
                globals.debug = true;
                false
            }
            "--password-stdin" => {
                globals.password_stdin = true;
                false
            }
            _ => true,
        })
        .collect();
    (globals, rest)
}

fn init_logging(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let (globals, args) = split_globals(std::env::args().skip(1).collect());
    init_logging(globals.debug);

    let settings = Settings::load()?;
    let paths = HostPaths::default();

    match args.as_slice() {
        [cmd] if cmd == "status" => status(&settings, paths, false),
        [cmd, json] if cmd == "status" && json == "--json" => status(&settings, paths, true),
        [cmd, domain, flags @ ..] if cmd == "install" && !domain.starts_with('-') => {
            let mut grant_sudo = true;
            let mut rollback_on_failure = false;
            for flag in flags {
                match flag.as_str() {
                    "--no-sudo" => grant_sudo = false,
                    "--rollback-on-failure" => rollback_on_failure = true,
                    other => bail!("unknown install flag '{other}'\n{}", usage()),
                }
            }
            let session = open_session(&globals, &settings)?;
            install(session, paths, settings, domain, grant_sudo, rollback_on_failure)
        }
        [cmd] if cmd == "rollback" => {
            let session = open_session(&globals, &settings)?;
            let report = SystemConfigurator::new(session, paths, &settings).rollback();
            finish_rollback("rollback", &report)
        }
        [cmd] if cmd == "uninstall" => {
            let session = open_session(&globals, &settings)?;
            let report = SystemConfigurator::new(session, paths, &settings).full_uninstall();
            finish_rollback("uninstall", &report)
        }
        [cmd] if cmd == "restore" => {
            let session = open_session(&globals, &settings)?;
            SystemConfigurator::new(session, paths, &settings)
                .restore_backups()
                .context("restoring backups")?;
            println!("Backups restored");
            Ok(())
        }
        [cmd] if cmd == "doctor" => {
            let session = open_session(&globals, &settings)?;
            doctor(session, paths, &settings)
        }
        [cmd] if cmd == "logs" => logs(&settings, paths, settings.journal_lines),
        [cmd, lines] if cmd == "logs" => {
            let lines: u32 = lines
                .parse()
                .with_context(|| format!("invalid line count '{lines}'"))?;
            logs(&settings, paths, lines)
        }
        _ => bail!(usage()),
    }
}

/// Session for this invocation. With `--password-stdin` the sudo secret is
/// read from the first line of stdin and validated once.
fn open_session(globals: &Globals, settings: &Settings) -> Result<Arc<PrivilegeSession>> {
    let session = PrivilegeSession::for_host(Arc::new(SystemRunner), settings.elevation);
    if globals.password_stdin && session.mode() == ElevationMode::Sudo {
        let mut secret = String::new();
        std::io::stdin()
            .lock()
            .read_line(&mut secret)
            .context("reading password from stdin")?;
        if !session.validate(secret.trim_end_matches(['\r', '\n'])) {
            bail!("sudo rejected the supplied password");
        }
    }
    Ok(Arc::new(session))
}

fn unprivileged_session(settings: &Settings) -> Arc<PrivilegeSession> {
    Arc::new(PrivilegeSession::for_host(Arc::new(SystemRunner), settings.elevation))
}

fn status(settings: &Settings, paths: HostPaths, json: bool) -> Result<()> {
    let validator = SystemValidator::new(unprivileged_session(settings), paths, settings);
    let status = validator.validate();
    if json {
        let out = serde_json::to_string_pretty(&status).context("serializing status")?;
        println!("{out}");
        return Ok(());
    }
    print_status(&status);
    if let Some(log) = RunLog::for_user() {
        if let Some(run) = log.latest()? {
            println!("Last install:     {} ({})", run.status, run.created_at_utc);
            if !run.message.is_empty() {
                println!("                  {}", run.message);
            }
        }
    }
    Ok(())
}

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "yes"
    } else {
        "no"
    }
}

fn print_status(status: &SystemStatus) {
    println!("Status:           {}", status.enrollment_status());
    println!(
        "Himmelblau:       {}",
        status.himmelblau_version.as_deref().unwrap_or("not installed")
    );
    println!("NSS configured:   {}", yes_no(status.nss_configured));
    println!("PAM configured:   {}", yes_no(status.pam_configured));
    println!("Services:         {}", yes_no(status.services_installed));
    println!("Daemon running:   {}", yes_no(status.daemon_running));
    println!("Tasks running:    {}", yes_no(status.tasks_running));
    println!(
        "Domain:           {}",
        status.configured_domain.as_deref().unwrap_or("-")
    );
    println!(
        "Display manager:  {}",
        status.current_display_manager.as_deref().unwrap_or("-")
    );
    println!("Enrollment:       {}", status.intune.enrollment_state.display());
    if let Some(err) = &status.intune.enrollment_error {
        println!("                  {err}");
    }
    println!("Compliance:       {}", status.intune.compliance_state.display());
    if let Some(at) = &status.intune.last_activity {
        println!("Last activity:    {at}");
    }
    println!("Backups:          {}", yes_no(status.has_backups));
}

fn print_progress(p: &InstallProgress) {
    println!(
        "[{}/{}] {:>3}% {}",
        p.step_number, p.total_steps, p.percent, p.message
    );
    if let Some(error) = &p.error {
        println!("        {error}");
    }
}

fn install(
    session: Arc<PrivilegeSession>,
    paths: HostPaths,
    settings: Settings,
    domain: &str,
    grant_sudo: bool,
    rollback_on_failure: bool,
) -> Result<()> {
    preflight::check_required_tools(&preflight::required_tools(session.mode()))?;

    let mut installer = Installer::new(session, paths, settings);
    if let Some(log) = RunLog::for_user() {
        installer = installer.with_run_log(log);
    }
    let rx = installer.progress().subscribe();
    let handle = installer
        .spawn_install(domain.to_string(), grant_sudo)
        .context("starting install worker")?;

    loop {
        match rx.recv_timeout(PROGRESS_POLL) {
            Ok(p) => print_progress(&p),
            Err(RecvTimeoutError::Timeout) if handle.is_finished() => break,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    for p in rx.try_iter() {
        print_progress(&p);
    }

    let (installer, ok) = handle
        .join()
        .map_err(|_| anyhow!("install worker terminated abnormally"))?;
    if ok {
        return Ok(());
    }

    let last = installer.current();
    if rollback_on_failure {
        match installer.rollback_report() {
            Some(report) => print_rollback(&report),
            None => println!("Nothing to roll back"),
        }
    }
    match last.error {
        Some(error) => bail!("{}: {error}", last.message),
        None => bail!("{}", last.message),
    }
}

fn print_rollback(report: &RollbackReport) {
    for failure in &report.failures {
        println!("FAILED  {failure}");
    }
    for warning in &report.warnings {
        println!("warning {warning}");
    }
    println!(
        "{} of {} steps succeeded",
        report.attempted.len() - report.failures.len() - report.warnings.len(),
        report.attempted.len()
    );
}

fn finish_rollback(what: &str, report: &RollbackReport) -> Result<()> {
    print_rollback(report);
    if !report.restored() {
        bail!("{what} could not restore every file");
    }
    Ok(())
}

fn doctor(session: Arc<PrivilegeSession>, paths: HostPaths, settings: &Settings) -> Result<()> {
    let mut tools = preflight::required_tools(session.mode());
    tools.extend_from_slice(BUILD_TOOLS);
    let missing = preflight::missing_tools(&tools);
    if missing.is_empty() {
        println!("Host tools:       ok");
    } else {
        for (tool, package) in &missing {
            println!("Missing tool:     {tool} (install: {package})");
        }
    }

    let configurator = SystemConfigurator::new(Arc::clone(&session), paths.clone(), settings);
    for entry in configurator.backup_inventory() {
        println!(
            "{} backup:       {}",
            entry.label,
            if entry.present {
                entry.backup.display().to_string()
            } else {
                "none".to_string()
            }
        );
    }

    let validator = SystemValidator::new(session, paths, settings);
    let daemon = validator.check_aad_tool_status();
    println!("Daemon:           {}", daemon.message);
    let tpm = validator.get_tpm_status();
    println!("TPM:              {}", tpm.message);
    println!("Version:          {}", validator.get_version());
    Ok(())
}

fn logs(settings: &Settings, paths: HostPaths, lines: u32) -> Result<()> {
    let validator = SystemValidator::new(unprivileged_session(settings), paths, settings);
    let journal = validator
        .read_journal(lintune::validator::DAEMON_SERVICE, lines)
        .ok_or_else(|| anyhow!("cannot read the daemon journal"))?;
    print!("{journal}");
    Ok(())
}
