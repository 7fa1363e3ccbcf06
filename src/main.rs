pub mod models {
    pub mod emporia;
    pub mod usage;
}

pub mod client;
pub mod config;
pub mod db {
    pub mod models;
    pub mod store;
}
pub mod schema;
pub mod utils;
pub mod services {
    pub mod catalog;
    pub mod extract;
    pub mod gaps;
    pub mod planner;
    pub mod scheduler;
}
#[cfg(test)]
mod testing;

use crate::client::EmporiaClient;
use crate::config::{load_accounts, Config};
use crate::db::store::PgStore;
use crate::services::catalog::Account;
use crate::services::extract::CollectOptions;
use crate::services::scheduler::{ScheduleOptions, Scheduler, HISTORY_PAUSE};
use crate::utils::CancelToken;
use chrono::Utc;
use log::{error, info, warn};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

#[derive(Debug)]
struct LoadedEnvFile {
    path: PathBuf,
    explicit: bool,
}

#[derive(Debug, Default, PartialEq)]
struct CliArgs {
    env_file: Option<PathBuf>,
    history_days: u32,
    dry_run: bool,
    reset_database: bool,
}

fn run(cli: &CliArgs, cancel: CancelToken) -> Result<(), String> {
    // 1) Load config
    let cfg = Config::from_env()?;
    info!(
        "Config loaded (update_interval={}s, detailed_enabled={}, detailed_interval={}s, seconds/hours/days={}/{}/{}, lag={}s, timezone={})",
        cfg.update_interval.as_secs(),
        cfg.detailed_enabled,
        cfg.detailed_interval.num_seconds(),
        cfg.seconds_enabled,
        cfg.hours_enabled,
        cfg.days_enabled,
        cfg.lag.num_seconds(),
        cfg.timezone.map(|tz| tz.name().to_string()).unwrap_or_else(|| "UTC".to_string()),
    );

    let history_days = if cli.history_days > cfg.max_history_days {
        warn!(
            "--history-days {} exceeds MAX_HISTORY_DAYS={}; clamping",
            cli.history_days, cfg.max_history_days
        );
        cfg.max_history_days
    } else {
        cli.history_days
    };

    let account_configs = load_accounts(&cfg.accounts_file)?;
    info!(
        "Loaded {} account(s) from {}",
        account_configs.len(),
        cfg.accounts_file.display()
    );

    // 2) Connect DB
    let store = PgStore::connect(&cfg.database_url).map_err(|e| format!("DB connection failed: {}", e))?;
    info!("Connected to database");

    // 3) Apply pending database migrations
    store.apply_migrations()?;

    if cli.reset_database {
        if cli.dry_run {
            warn!("--reset-database ignored in dry-run mode");
        } else {
            let deleted = store.reset().map_err(|e| format!("Resetting database failed: {}", e))?;
            warn!("Database reset: deleted {} usage row(s)", deleted);
        }
    }

    // 4) Log in to every account and load its devices
    let mut accounts = Vec::with_capacity(account_configs.len());
    for ac in account_configs {
        let token = ac.refresh_token()?;
        let client = EmporiaClient::new(token)
            .map_err(|e| format!("[{}] Emporia auth failed (refresh token invalid/expired?): {}", ac.name, e))?;
        let mut account = Account::new(ac.name.clone(), Box::new(client), ac.devices);
        let devices = account
            .refresh_catalog()
            .map_err(|e| format!("[{}] Listing devices failed: {}", ac.name, e))?;
        info!("[{}] Authenticated; {} device(s)", account.name, devices);
        accounts.push(account);
    }

    // 5) Collection loop
    let options = ScheduleOptions {
        collect: CollectOptions {
            timezone: cfg.zone(),
            seconds_enabled: cfg.seconds_enabled,
            detailed_interval: cfg.detailed_interval,
        },
        detailed_enabled: cfg.detailed_enabled,
        hours_enabled: cfg.detailed_enabled && cfg.hours_enabled,
        days_enabled: cfg.detailed_enabled && cfg.days_enabled,
        lag: cfg.lag,
        update_interval: cfg.update_interval,
        history_days,
        history_pause: HISTORY_PAUSE,
        dry_run: cli.dry_run,
    };
    if cli.dry_run {
        info!("Dry run: points will be logged, not written");
    }
    let mut scheduler = Scheduler::new(options, &store, cancel, Utc::now());
    scheduler.run(&mut accounts);

    Ok(())
}

fn parse_args(args: impl IntoIterator<Item = OsString>) -> Result<CliArgs, String> {
    let mut args = args.into_iter();
    let mut out = CliArgs::default();
    let mut history_days: Option<u32> = None;

    while let Some(arg) = args.next() {
        let Some(arg) = arg.to_str().map(str::to_string) else {
            return Err("argument contains invalid UTF-8".to_string());
        };
        let (flag, inline) = match arg.split_once('=') {
            Some((f, v)) if f.starts_with("--") => (f.to_string(), Some(v.to_string())),
            _ => (arg.clone(), None),
        };
        let mut value = |name: &str| -> Result<String, String> {
            let v = match inline.clone() {
                Some(v) => v,
                None => args
                    .next()
                    .and_then(|v| v.into_string().ok())
                    .ok_or_else(|| format!("`{}` requires a value", name))?,
            };
            if v.is_empty() {
                return Err(format!("`{}` requires a value", name));
            }
            Ok(v)
        };
        match flag.as_str() {
            "--env-file" => {
                if out.env_file.is_some() {
                    return Err("`--env-file` provided more than once".to_string());
                }
                out.env_file = Some(PathBuf::from(value("--env-file")?));
            }
            "--history-days" => {
                if history_days.is_some() {
                    return Err("`--history-days` provided more than once".to_string());
                }
                let raw = value("--history-days")?;
                let days = raw
                    .parse::<u32>()
                    .map_err(|_| format!("`--history-days` must be a non-negative integer, got {}", raw))?;
                history_days = Some(days);
            }
            "--dry-run" if inline.is_none() => out.dry_run = true,
            "--reset-database" if inline.is_none() => out.reset_database = true,
            "--" => break,
            other => return Err(format!("unrecognised argument: {}", other)),
        }
    }

    out.history_days = history_days.unwrap_or(0);
    Ok(out)
}

fn load_env(cli: &CliArgs) -> Result<Option<LoadedEnvFile>, String> {
    if let Some(path) = &cli.env_file {
        if !path.is_file() {
            return Err(format!("env file not found: {}", path.display()));
        }
        load_env_file(path)?;
        return Ok(Some(LoadedEnvFile {
            path: path.clone(),
            explicit: true,
        }));
    }

    let cwd = std::env::current_dir().map_err(|e| format!("unable to read current directory: {}", e))?;
    let default_path = cwd.join(".env");
    if !default_path.is_file() {
        return Ok(None);
    }
    load_env_file(&default_path)?;
    Ok(Some(LoadedEnvFile {
        path: default_path,
        explicit: false,
    }))
}

fn load_env_file(path: &Path) -> Result<(), String> {
    let raw = std::fs::read_to_string(path).map_err(|e| format!("failed to read {}: {}", path.display(), e))?;

    for (index, line) in raw.lines().enumerate() {
        let parsed = parse_env_assignment(line).map_err(|e| format!("{}:{}: {}", path.display(), index + 1, e))?;
        let Some((key, value)) = parsed else { continue };
        // Values already in the process environment win.
        if std::env::var_os(&key).is_none() {
            // Updating process-level environment variables is unsafe on some targets.
            unsafe {
                std::env::set_var(key, value);
            }
        }
    }

    Ok(())
}

fn parse_env_assignment(line: &str) -> Result<Option<(String, String)>, String> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }

    let assignment = trimmed
        .strip_prefix("export ")
        .map(str::trim_start)
        .unwrap_or(trimmed);
    let (key, raw_value) = assignment
        .split_once('=')
        .ok_or_else(|| "missing '=' in assignment".to_string())?;
    let key = key.trim();

    if key.is_empty() {
        return Err("environment variable name cannot be empty".to_string());
    }
    if key.chars().any(char::is_whitespace) {
        return Err(format!("environment variable name contains whitespace: {}", key));
    }

    Ok(Some((key.to_string(), parse_env_value(raw_value)?)))
}

fn parse_env_value(raw: &str) -> Result<String, String> {
    let trimmed = raw.trim();
    let quote = match trimmed.chars().next() {
        Some(q @ ('"' | '\'')) => q,
        _ => {
            let unquoted = trimmed.split('#').next().unwrap_or_default().trim_end();
            return Ok(unquoted.to_string());
        }
    };

    let mut value = String::new();
    let mut chars = trimmed[1..].chars();
    while let Some(ch) = chars.next() {
        match ch {
            // Escapes only apply inside double quotes.
            '\\' if quote == '"' => {
                let escaped = chars
                    .next()
                    .ok_or_else(|| "unterminated escape sequence in double-quoted value".to_string())?;
                value.push(match escaped {
                    'n' => '\n',
                    'r' => '\r',
                    't' => '\t',
                    other => other,
                });
            }
            c if c == quote => {
                let rest = chars.as_str().trim();
                if rest.is_empty() || rest.starts_with('#') {
                    return Ok(value);
                }
                return Err("unexpected characters after closing quote".to_string());
            }
            c => value.push(c),
        }
    }
    Err("unterminated quoted value".to_string())
}

fn main() {
    let (cli, loaded_env) = match parse_args(std::env::args_os().skip(1)).and_then(|cli| {
        let loaded = load_env(&cli)?;
        Ok((cli, loaded))
    }) {
        Ok(v) => v,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    // Init logging after environment so RUST_LOG from .env is respected.
    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    if let Some(info) = loaded_env.as_ref() {
        let origin = if info.explicit { "CLI-specified" } else { "default" };
        info!("Environment loaded from {} .env file: {}", origin, info.path.display());
    }

    info!(
        "emporia-timescale {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        warn!("Caught exit signal; finishing current work");
        handler_token.cancel();
    }) {
        error!("fatal: installing signal handler failed: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = run(&cli, cancel) {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
    info!("Finished");
}
