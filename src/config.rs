use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::calendar::{BlockParseError, Schedule, TimeBlock, WeekdayClass, parse_clock};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading schedule {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("schedule is not valid TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("bad block in schedule: {0}")]
    Block(#[from] BlockParseError),
    #[error("{class:?} blocks {first} and {second} overlap")]
    OverlappingBlocks {
        class: WeekdayClass,
        first: TimeBlock,
        second: TimeBlock,
    },
    #[error("too many {0:?} blocks")]
    TooManyBlocks(WeekdayClass),
    #[error("horizon_days {0} out of range")]
    Horizon(u32),
}

/// On-disk schedule shape. Every section is optional and falls back to the
/// built-in default.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ScheduleFile {
    horizon_days: Option<u32>,
    weekday: Option<DayFile>,
    saturday: Option<DayFile>,
    sunday: Option<DayFile>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DayFile {
    blocks: Vec<(String, String)>,
}

impl DayFile {
    fn into_blocks(self) -> Result<Vec<TimeBlock>, ConfigError> {
        self.blocks
            .into_iter()
            .map(|(start, end)| {
                let block = format!("{start}-{end}");
                let start = parse_clock(&start)?;
                let end = parse_clock(&end)?;
                if start >= end {
                    return Err(BlockParseError::Inverted(block).into());
                }
                Ok(TimeBlock::new(start, end))
            })
            .collect()
    }
}

pub fn parse_schedule(text: &str) -> Result<Schedule, ConfigError> {
    let file: ScheduleFile = toml::from_str(text)?;
    let defaults = Schedule::default();
    let section = |day: Option<DayFile>, class: WeekdayClass| match day {
        Some(day) => day.into_blocks(),
        None => Ok(defaults.blocks_for_class(class).to_vec()),
    };
    Schedule::new(
        section(file.weekday, WeekdayClass::Weekday)?,
        section(file.saturday, WeekdayClass::Saturday)?,
        section(file.sunday, WeekdayClass::Sunday)?,
        file.horizon_days.unwrap_or(defaults.horizon_days()),
    )
}

pub fn load_schedule(path: &Path) -> Result<Schedule, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_schedule(&text)
}

/// Server settings, read from `FLEETBAY_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: String,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub schedule_path: Option<PathBuf>,
    pub pending_ttl_days: Option<u32>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: std::env::var("FLEETBAY_PORT").unwrap_or_else(|_| "5433".into()),
            bind: std::env::var("FLEETBAY_BIND").unwrap_or_else(|_| "0.0.0.0".into()),
            data_dir: std::env::var("FLEETBAY_DATA_DIR")
                .unwrap_or_else(|_| "./data".into())
                .into(),
            password: std::env::var("FLEETBAY_PASSWORD").unwrap_or_else(|_| "fleetbay".into()),
            max_connections: env_parsed("FLEETBAY_MAX_CONNECTIONS").unwrap_or(256),
            schedule_path: std::env::var("FLEETBAY_SCHEDULE").ok().map(PathBuf::from),
            pending_ttl_days: env_parsed("FLEETBAY_PENDING_TTL_DAYS"),
            tls_cert: std::env::var("FLEETBAY_TLS_CERT").ok(),
            tls_key: std::env::var("FLEETBAY_TLS_KEY").ok(),
            metrics_port: env_parsed("FLEETBAY_METRICS_PORT"),
        }
    }

    /// The configured schedule, or the built-in default when no file is set.
    pub fn schedule(&self) -> Result<Schedule, ConfigError> {
        match &self.schedule_path {
            Some(path) => load_schedule(path),
            None => Ok(Schedule::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_default_schedule() {
        assert_eq!(parse_schedule("").unwrap(), Schedule::default());
    }

    #[test]
    fn sections_override_defaults() {
        let text = r#"
            horizon_days = 14

            [saturday]
            blocks = [["09:00", "13:00"]]

            [sunday]
            blocks = [["10:00", "12:00"]]
        "#;
        let s = parse_schedule(text).unwrap();
        assert_eq!(s.horizon_days(), 14);
        assert_eq!(s.blocks_for_class(WeekdayClass::Weekday).len(), 4);
        assert_eq!(
            s.blocks_for_class(WeekdayClass::Saturday),
            &[TimeBlock::new(540, 780)]
        );
        assert_eq!(s.blocks_for_class(WeekdayClass::Sunday).len(), 1);
    }

    #[test]
    fn inverted_block_rejected() {
        let text = r#"
            [weekday]
            blocks = [["10:00", "08:00"]]
        "#;
        assert!(matches!(
            parse_schedule(text),
            Err(ConfigError::Block(BlockParseError::Inverted(_)))
        ));
    }

    #[test]
    fn overlapping_blocks_rejected() {
        let text = r#"
            [weekday]
            blocks = [["08:00", "10:00"], ["09:00", "11:00"]]
        "#;
        assert!(matches!(
            parse_schedule(text),
            Err(ConfigError::OverlappingBlocks { .. })
        ));
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(matches!(
            parse_schedule("holidays = true"),
            Err(ConfigError::Toml(_))
        ));
    }

    #[test]
    fn missing_file_reports_path() {
        let path = std::env::temp_dir().join("fleetbay_no_such_schedule.toml");
        let err = load_schedule(&path).unwrap_err();
        assert!(err.to_string().contains("fleetbay_no_such_schedule.toml"));
    }
}
