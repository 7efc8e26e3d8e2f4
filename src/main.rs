pub mod models {
    pub mod fermentation;
}

pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod utils;
pub mod services {
    pub mod live;
    pub mod orchestrator;
    pub mod reconciler;
    pub mod series;
    pub mod snapshot;
}

use crate::channel::WsConnector;
use crate::client::FermenterClient;
use crate::config::Config;
use crate::models::fermentation::{BatchId, BatchStatusSnapshot, UnitSystem};
use crate::services::orchestrator::SyncOrchestrator;
use crate::services::reconciler::Reconciler;
use crate::services::series::{format_duration, format_temp, prepare_series};
use crate::utils::serde_enum_name;
use log::{error, info};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug)]
struct LoadedEnvFile {
    path: PathBuf,
    explicit: bool,
}

#[derive(Debug, Clone, PartialEq)]
enum Command {
    /// Keep a live view of every batch and log each change.
    Watch,
    /// Print the chart series for one batch as JSON.
    Series {
        batch_id: BatchId,
        hours: Option<u32>,
        limit: Option<u32>,
    },
    /// Download the CSV export of one batch.
    Export { batch_id: BatchId, out: Option<PathBuf> },
}

#[derive(Debug, Default)]
struct CliArgs {
    env_file: Option<PathBuf>,
    command: Option<Command>,
}

fn build_client(cfg: &Config) -> FermenterClient {
    FermenterClient::new(cfg.api_url.clone(), cfg.api_token.clone(), cfg.request_timeout)
}

fn describe(snapshot: &BatchStatusSnapshot, units: UnitSystem) -> String {
    let temp = |v: Option<f64>| v.map(|t| format_temp(t, units)).unwrap_or_else(|| "-".to_string());
    let state = snapshot
        .control_state
        .as_ref()
        .and_then(serde_enum_name)
        .unwrap_or_else(|| "-".to_string());
    let phase = snapshot
        .current_phase
        .map(|p| (p + 1).to_string())
        .unwrap_or_else(|| "-".to_string());
    let progress = snapshot
        .phase_progress
        .map(|p| format!("{:.0}%", p))
        .unwrap_or_else(|| "-".to_string());
    let elapsed = snapshot.elapsed_hours.map(format_duration).unwrap_or_else(|| "-".to_string());
    format!(
        "batch {} ({} on {}): {} -> {}, {}, phase {} at {}, elapsed {}, {} chart points",
        snapshot.id().0,
        snapshot.batch.name,
        snapshot.batch.fermenter.name,
        temp(snapshot.current_temp),
        temp(snapshot.target_temp),
        state,
        phase,
        progress,
        elapsed,
        prepare_series(&snapshot.recent_logs, units).len()
    )
}

fn run_watch(cfg: &Config) -> Result<(), String> {
    let client = Arc::new(build_client(cfg));
    let connector = Arc::new(WsConnector::new(cfg.ws_url.clone(), cfg.api_token.clone()));
    let mut orch = SyncOrchestrator::new(
        client,
        connector,
        Reconciler::new(cfg.recent_log_limit),
        cfg.sync_settings(),
    );

    let units = cfg.units;
    orch.subscribe(move |snapshots| {
        info!("Dashboard view now holds {} batch(es)", snapshots.len());
        for snapshot in snapshots {
            info!("{}", describe(snapshot, units));
        }
    });

    info!(
        "Starting live sync: api={}, push={}, fallback_poll={}s",
        cfg.api_url,
        cfg.ws_url,
        cfg.poll_interval.as_secs()
    );
    orch.run()
}

fn run_series(cfg: &Config, batch_id: BatchId, hours: Option<u32>, limit: Option<u32>) -> Result<(), String> {
    let client = build_client(cfg);
    let logs = client
        .get_batch_logs(batch_id, hours, limit)
        .map_err(|e| format!("fetching logs for batch {} failed: {}", batch_id.0, e))?;
    let series = prepare_series(&logs, cfg.units);
    info!("Prepared {} chart point(s) for batch {}", series.len(), batch_id.0);
    let json = serde_json::to_string_pretty(&series).map_err(|e| format!("serialising series failed: {}", e))?;
    println!("{}", json);
    Ok(())
}

fn run_export(cfg: &Config, batch_id: BatchId, out: Option<PathBuf>) -> Result<(), String> {
    let client = build_client(cfg);
    let bytes = client
        .export_batch_csv(batch_id)
        .map_err(|e| format!("exporting batch {} failed: {}", batch_id.0, e))?;
    let path = out.unwrap_or_else(|| PathBuf::from(format!("batch_{}_logs.csv", batch_id.0)));
    std::fs::write(&path, &bytes).map_err(|e| format!("writing {} failed: {}", path.display(), e))?;
    info!("Wrote {} byte(s) to {}", bytes.len(), path.display());
    Ok(())
}

fn run(command: Command) -> Result<(), String> {
    let cfg = Config::from_env()?;
    info!(
        "Config loaded (api={}, units={}, fallback_poll={}s, reconnect={}ms..{}s, recent_log_limit={}, auth={})",
        cfg.api_url,
        serde_enum_name(&cfg.units).unwrap_or_default(),
        cfg.poll_interval.as_secs(),
        cfg.reconnect_min.as_millis(),
        cfg.reconnect_max.as_secs(),
        cfg.recent_log_limit,
        if cfg.api_token.is_some() { "token" } else { "none" }
    );

    match command {
        Command::Watch => run_watch(&cfg),
        Command::Series { batch_id, hours, limit } => run_series(&cfg, batch_id, hours, limit),
        Command::Export { batch_id, out } => run_export(&cfg, batch_id, out),
    }
}

fn parse_cli<I: IntoIterator<Item = String>>(args: I) -> Result<CliArgs, String> {
    let mut args = args.into_iter();
    let mut cli = CliArgs::default();
    let mut positional: Vec<String> = Vec::new();
    let mut hours: Option<u32> = None;
    let mut limit: Option<u32> = None;
    let mut out: Option<PathBuf> = None;

    while let Some(arg) = args.next() {
        let (flag, inline) = match arg.split_once('=') {
            Some((f, v)) if f.starts_with("--") => (f.to_string(), Some(v.to_string())),
            _ => (arg.clone(), None),
        };
        let mut value = |name: &str| -> Result<String, String> {
            let v = match inline.clone() {
                Some(v) => v,
                None => args.next().ok_or_else(|| format!("`{}` requires a value", name))?,
            };
            if v.is_empty() {
                return Err(format!("`{}` requires a value", name));
            }
            Ok(v)
        };
        match flag.as_str() {
            "--env-file" => {
                if cli.env_file.is_some() {
                    return Err("`--env-file` provided more than once".to_string());
                }
                cli.env_file = Some(PathBuf::from(value("--env-file")?));
            }
            "--hours" => hours = Some(parse_u32("--hours", &value("--hours")?)?),
            "--limit" => limit = Some(parse_u32("--limit", &value("--limit")?)?),
            "--out" => out = Some(PathBuf::from(value("--out")?)),
            "--" => break,
            s if s.starts_with("--") => return Err(format!("unrecognised argument: {}", s)),
            _ => positional.push(arg),
        }
    }

    let mut positional = positional.into_iter();
    let command = match positional.next().as_deref() {
        None | Some("watch") => Command::Watch,
        Some("series") => Command::Series {
            batch_id: parse_batch_id(positional.next())?,
            hours,
            limit,
        },
        Some("export") => Command::Export {
            batch_id: parse_batch_id(positional.next())?,
            out: out.take(),
        },
        Some(other) => return Err(format!("unknown command: {} (expected watch, series or export)", other)),
    };
    if let Some(extra) = positional.next() {
        return Err(format!("unexpected argument: {}", extra));
    }
    match command {
        Command::Series { .. } if out.is_some() => return Err("`--out` only applies to export".to_string()),
        Command::Export { .. } | Command::Watch if hours.is_some() || limit.is_some() => {
            return Err("`--hours` and `--limit` only apply to series".to_string());
        }
        Command::Watch if out.is_some() => return Err("`--out` only applies to export".to_string()),
        _ => {}
    }
    cli.command = Some(command);
    Ok(cli)
}

fn parse_u32(name: &str, raw: &str) -> Result<u32, String> {
    raw.parse::<u32>()
        .map_err(|_| format!("`{}` must be a non-negative integer, got {:?}", name, raw))
}

fn parse_batch_id(raw: Option<String>) -> Result<BatchId, String> {
    let raw = raw.ok_or_else(|| "missing batch id".to_string())?;
    raw.parse::<i64>()
        .map(BatchId)
        .map_err(|_| format!("batch id must be an integer, got {:?}", raw))
}

fn configure_env_from_cli() -> Result<(Command, Option<LoadedEnvFile>), String> {
    let args = std::env::args_os()
        .skip(1)
        .map(|a| a.into_string().map_err(|_| "argument contains invalid UTF-8".to_string()))
        .collect::<Result<Vec<_>, _>>()?;
    let cli = parse_cli(args)?;
    let command = cli.command.unwrap_or(Command::Watch);

    if let Some(path) = cli.env_file {
        if !path.is_file() {
            return Err(format!("env file not found: {}", path.display()));
        }
        load_env_file(&path)?;
        Ok((command, Some(LoadedEnvFile { path, explicit: true })))
    } else {
        let cwd = std::env::current_dir().map_err(|e| format!("unable to read current directory: {}", e))?;
        let default_path = cwd.join(".env");
        if default_path.is_file() {
            load_env_file(&default_path)?;
            Ok((
                command,
                Some(LoadedEnvFile {
                    path: default_path,
                    explicit: false,
                }),
            ))
        } else {
            Ok((command, None))
        }
    }
}

fn load_env_file(path: &Path) -> Result<(), String> {
    use std::fs::File;
    use std::io::{BufRead, BufReader};

    let file = File::open(path).map_err(|e| format!("failed to open {}: {}", path.display(), e))?;
    let reader = BufReader::new(file);

    for (index, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| format!("failed to read {} at line {}: {}", path.display(), index + 1, e))?;
        match parse_env_assignment(&line) {
            Ok(Some((key, value))) => {
                // Values already in the process environment win over the file.
                if std::env::var_os(&key).is_none() {
                    // Updating process-level environment variables is unsafe on some targets.
                    unsafe {
                        std::env::set_var(key, value);
                    }
                }
            }
            Ok(None) => {}
            Err(e) => {
                return Err(format!("{}:{}: {}", path.display(), index + 1, e));
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

    let without_export = trimmed
        .strip_prefix("export ")
        .map(|s| s.trim_start())
        .unwrap_or(trimmed);

    let (key, value_part) = without_export
        .split_once('=')
        .ok_or_else(|| "missing '=' in assignment".to_string())?;
    let key = key.trim();
    if key.is_empty() {
        return Err("environment variable name cannot be empty".to_string());
    }
    if key.chars().any(|c| c.is_whitespace()) {
        return Err(format!("environment variable name contains whitespace: {}", key));
    }

    let value = parse_env_value(value_part)?;
    Ok(Some((key.to_string(), value)))
}

fn parse_env_value(raw: &str) -> Result<String, String> {
    let trimmed = raw.trim();
    if let Some(rest) = trimmed.strip_prefix('"') {
        parse_quoted(rest, '"', true)
    } else if let Some(rest) = trimmed.strip_prefix('\'') {
        parse_quoted(rest, '\'', false)
    } else {
        let value = trimmed.split('#').next().unwrap_or_default().trim_end();
        Ok(value.to_string())
    }
}

/// Reads up to the closing `quote`; only double quotes process backslash escapes.
fn parse_quoted(input: &str, quote: char, escapes: bool) -> Result<String, String> {
    let mut result = String::new();
    let mut chars = input.chars();
    let mut escape = false;

    while let Some(ch) = chars.next() {
        if escape {
            result.push(match ch {
                'n' => '\n',
                'r' => '\r',
                't' => '\t',
                other => other,
            });
            escape = false;
        } else if escapes && ch == '\\' {
            escape = true;
        } else if ch == quote {
            let remainder = chars.as_str().trim();
            return if remainder.is_empty() || remainder.starts_with('#') {
                Ok(result)
            } else {
                Err(format!("unexpected characters after closing {} quote", quote))
            };
        } else {
            result.push(ch);
        }
    }

    Err(format!("unterminated {}-quoted value", quote))
}

fn main() {
    let (command, loaded_env) = match configure_env_from_cli() {
        Ok(parsed) => parsed,
        Err(err) => {
            eprintln!("fatal: {}", err);
            eprintln!("usage: fermenter-sync [--env-file PATH] [watch | series <batch_id> [--hours N] [--limit N] | export <batch_id> [--out PATH]]");
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
        "fermenter-sync {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );
    if let Err(e) = run(command) {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}
