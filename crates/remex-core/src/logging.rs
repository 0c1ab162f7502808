//! Tracing setup for processes hosting an engine.
//!
//! Verbosity comes from `RUST_LOG` when set, otherwise from
//! `REMEX_LOG_LEVEL` (`error` .. `trace`), otherwise `info`.

use crate::config::LoggingConfig;
use crate::constants::env as env_vars;
use crate::errors::ConfigError;
use chrono::{DateTime, Local, NaiveDate};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;
use std::sync::Mutex;
use tracing::Level;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const SESSION_LOG_PREFIX: &str = "remex-engine";

/// Level named by `REMEX_LOG_LEVEL`, if it is set and valid.
pub fn log_level_from_env() -> Option<Level> {
    std::env::var(env_vars::LOG_LEVEL)
        .ok()
        .and_then(|value| Level::from_str(value.trim()).ok())
}

fn env_filter() -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let level = log_level_from_env().unwrap_or(Level::INFO);
    EnvFilter::new(level.to_string().to_lowercase())
}

struct LocalTime;

impl FormatTime for LocalTime {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%d %H:%M:%S%.3f"))
    }
}

fn session_log_name(now: DateTime<Local>, pid: u32) -> String {
    format!(
        "{}_{}_{}.log",
        SESSION_LOG_PREFIX,
        now.format("%Y-%m-%d_%H-%M-%S"),
        pid
    )
}

/// Start date of a session log named by [`session_log_name`].
fn session_log_date(path: &Path) -> Option<NaiveDate> {
    let name = path.file_name()?.to_str()?;
    let rest = name.strip_prefix(SESSION_LOG_PREFIX)?.strip_prefix('_')?;
    NaiveDate::parse_from_str(rest.get(..10)?, "%Y-%m-%d").ok()
}

/// Deletes session logs older than `max_age_days`, then the oldest ones
/// beyond `max_files`. A zero limit disables that rule. Returns the
/// removed paths.
fn prune_session_logs(
    log_dir: &Path,
    config: &LoggingConfig,
    today: NaiveDate,
) -> Result<Vec<PathBuf>, ConfigError> {
    let mut logs: Vec<(PathBuf, NaiveDate)> = fs_err::read_dir(log_dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter_map(|path| session_log_date(&path).map(|date| (path, date)))
        .collect();
    logs.sort();

    let mut removed = Vec::new();
    if config.max_age_days > 0 {
        let (expired, kept): (Vec<_>, Vec<_>) = logs.into_iter().partition(|(_, date)| {
            (today - *date).num_days() > config.max_age_days as i64
        });
        removed.extend(expired.into_iter().map(|(path, _)| path));
        logs = kept;
    }
    if config.max_files > 0 && logs.len() > config.max_files {
        let surplus = logs.len() - config.max_files;
        removed.extend(logs.drain(..surplus).map(|(path, _)| path));
    }

    for path in &removed {
        if let Err(e) = fs_err::remove_file(path) {
            tracing::warn!("Could not remove old session log: {}", e);
        }
    }
    Ok(removed)
}

/// Installs a global subscriber writing to a new session log under
/// `log_dir`. Old session logs are pruned first. Returns the log path.
pub fn init_session_logger(log_dir: &Path, config: &LoggingConfig) -> Result<PathBuf, ConfigError> {
    fs_err::create_dir_all(log_dir)?;
    let pruned = prune_session_logs(log_dir, config, Local::now().date_naive())?;

    let log_path = log_dir.join(session_log_name(Local::now(), std::process::id()));
    let log_file = fs_err::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?
        .into_parts()
        .0;

    tracing_subscriber::registry()
        .with(env_filter())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(Mutex::new(log_file))
                .with_ansi(false)
                .with_timer(LocalTime)
                .with_target(true)
                .with_line_number(true),
        )
        .try_init()
        .map_err(|e| ConfigError::General(format!("logger already initialized: {}", e)))?;

    tracing::info!(
        "Engine session log started at {} ({} old logs pruned)",
        log_path.display(),
        pruned.len()
    );
    Ok(log_path)
}

/// Installs a stderr subscriber. Does nothing if one is already set.
pub fn init_stderr_logger() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .with_timer(LocalTime)
        .with_target(false)
        .try_init();
}

fn display_arg(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c))
    {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

fn command_line(command: &Command) -> String {
    std::iter::once(command.get_program())
        .chain(command.get_args())
        .map(|part| display_arg(&part.to_string_lossy()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Logs a backend command line at debug level before it is spawned.
pub fn log_command(command: &Command) {
    tracing::debug!("[CMD] {}", command_line(command));
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, b"").unwrap();
        path
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_prune_keeps_newest_files() {
        let dir = tempdir().unwrap();
        let oldest = touch(dir.path(), "remex-engine_2026-01-01_10-00-00_1.log");
        let older = touch(dir.path(), "remex-engine_2026-01-02_10-00-00_1.log");
        let newer = touch(dir.path(), "remex-engine_2026-01-03_10-00-00_1.log");
        let other = touch(dir.path(), "notes.txt");

        let config = LoggingConfig {
            max_files: 1,
            max_age_days: 0,
        };
        let removed = prune_session_logs(dir.path(), &config, date("2026-01-03")).unwrap();

        assert_eq!(removed, vec![oldest.clone(), older.clone()]);
        assert!(!oldest.exists() && !older.exists());
        assert!(newer.exists() && other.exists());
    }

    #[test]
    fn test_prune_by_age() {
        let dir = tempdir().unwrap();
        let stale = touch(dir.path(), "remex-engine_2026-03-01_08-00-00_7.log");
        let fresh = touch(dir.path(), "remex-engine_2026-03-08_08-00-00_7.log");

        let config = LoggingConfig {
            max_files: 0,
            max_age_days: 7,
        };
        prune_session_logs(dir.path(), &config, date("2026-03-09")).unwrap();

        assert!(!stale.exists());
        assert!(fresh.exists());
    }

    #[test]
    fn test_session_log_name_round_trips_date() {
        let now = Local::now();
        let name = session_log_name(now, 42);
        assert!(name.ends_with("_42.log"));
        assert_eq!(
            session_log_date(Path::new(&name)),
            Some(now.date_naive())
        );
        assert_eq!(session_log_date(Path::new("remex-engine.log")), None);
    }

    #[test]
    fn test_command_line_quotes_unsafe_args() {
        let mut cmd = Command::new("docker");
        cmd.args(["run", "-d", "--label", "remex.job-name=x", "echo it's", ""]);
        assert_eq!(
            command_line(&cmd),
            r"docker run -d --label remex.job-name=x 'echo it'\''s' ''"
        );
    }
}
