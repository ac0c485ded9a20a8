use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use log::LevelFilter;
use std::fmt::Arguments;
use std::fs;
use std::path::{Path, PathBuf};

const LOG_PREFIX: &str = "server_relay_";

/// Where and how verbosely the relay logs.
#[derive(Debug, Clone, PartialEq)]
pub struct LogSettings {
    pub dir: PathBuf,
    pub level: LevelFilter,
}

impl LogSettings {
    pub fn new(dir: &Path, level: &str) -> Self {
        Self {
            dir: dir.to_path_buf(),
            level: parse_level(level),
        }
    }

    fn file_for(&self, started: DateTime<Local>) -> PathBuf {
        self.dir
            .join(format!("{}{}.log", LOG_PREFIX, started.format("%Y-%m-%d_%H-%M-%S")))
    }

    /// Installs the global logger (stdout + a fresh file) and returns the file path.
    /// Earlier relay logs in the directory are pruned down to the newest one.
    pub fn install(&self) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Cannot create log directory {}", self.dir.display()))?;
        cleanup_old_logs(&self.dir)?;

        let path = self.file_for(Local::now());
        let file = fern::log_file(&path)
            .with_context(|| format!("Cannot open log file {}", path.display()))?;

        fern::Dispatch::new()
            .format(format_line)
            .level(self.level)
            // rumqttc traces every packet at debug.
            .level_for("rumqttc", LevelFilter::Warn)
            .chain(std::io::stdout())
            .chain(file)
            .apply()
            .context("A global logger is already installed")?;

        Ok(path)
    }
}

fn format_line(out: fern::FormatCallback<'_>, message: &Arguments<'_>, record: &log::Record<'_>) {
    out.finish(format_args!(
        "{} {:<5} [{}] {}",
        Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
        record.level(),
        record.target(),
        message
    ))
}

fn parse_level(log_level: &str) -> LevelFilter {
    log_level.trim().parse().unwrap_or(LevelFilter::Info)
}

fn cleanup_old_logs(log_dir: &Path) -> Result<()> {
    let mut logs: Vec<_> = fs::read_dir(log_dir)?
        .flatten()
        .filter(|entry| {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            name.starts_with(LOG_PREFIX) && name.ends_with(".log")
        })
        .filter_map(|entry| {
            let modified = entry.metadata().and_then(|m| m.modified()).ok()?;
            Some((modified, entry.path()))
        })
        .collect();

    logs.sort_by(|a, b| b.0.cmp(&a.0));
    for (_, stale) in logs.into_iter().skip(1) {
        if let Err(e) = fs::remove_file(&stale) {
            eprintln!("Failed to delete old log file {}: {}", stale.display(), e);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::{Duration, SystemTime};

    #[test]
    fn unknown_levels_fall_back_to_info() {
        assert_eq!(parse_level("DEBUG"), LevelFilter::Debug);
        assert_eq!(parse_level(" warn "), LevelFilter::Warn);
        assert_eq!(parse_level("fatal"), LevelFilter::Info);
    }

    #[test]
    fn log_file_is_named_after_the_start_time() {
        let settings = LogSettings::new(Path::new("/var/log/relay"), "info");
        let started = Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(
            settings.file_for(started),
            PathBuf::from("/var/log/relay/server_relay_2024-03-09_07-05-01.log")
        );
        assert_eq!(settings.level, LevelFilter::Info);
    }

    #[test]
    fn cleanup_keeps_only_the_newest_relay_log() {
        let dir = tempfile::tempdir().unwrap();
        let now = SystemTime::now();
        for (i, name) in ["server_relay_a.log", "server_relay_b.log", "server_relay_c.log"]
            .iter()
            .enumerate()
        {
            let path = dir.path().join(name);
            let file = fs::File::create(&path).unwrap();
            file.set_modified(now - Duration::from_secs(60 * (3 - i as u64)))
                .unwrap();
        }
        fs::write(dir.path().join("other.log"), "x").unwrap();

        cleanup_old_logs(dir.path()).unwrap();

        let mut left: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        left.sort();
        assert_eq!(left, vec!["other.log", "server_relay_c.log"]);
    }
}
