//! Weekly schedule: which time blocks are bookable on which dates, and how far
//! ahead requests may be made. Pure calendar arithmetic, no I/O.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Days, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::limits::*;

/// Minutes since local midnight.
pub type Minute = u16;

const MINUTES_PER_DAY: Minute = 24 * 60;

/// Grouping of dates that share one block template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeekdayClass {
    /// Monday through Friday.
    Weekday,
    Saturday,
    Sunday,
}

impl WeekdayClass {
    pub fn of(date: NaiveDate) -> Self {
        match date.weekday() {
            Weekday::Sat => WeekdayClass::Saturday,
            Weekday::Sun => WeekdayClass::Sunday,
            _ => WeekdayClass::Weekday,
        }
    }
}

/// A bookable interval within a day, `[start, end)` in minutes since midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimeBlock {
    pub start: Minute,
    pub end: Minute,
}

impl TimeBlock {
    pub fn new(start: Minute, end: Minute) -> Self {
        debug_assert!(start < end, "TimeBlock start must be before end");
        Self { start, end }
    }

    pub fn overlaps(&self, other: &TimeBlock) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for TimeBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02}:{:02}-{:02}:{:02}",
            self.start / 60,
            self.start % 60,
            self.end / 60,
            self.end % 60
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BlockParseError {
    #[error("expected HH:MM-HH:MM, got {0:?}")]
    Format(String),
    #[error("bad clock time {0:?}")]
    Clock(String),
    #[error("block {0} ends before it starts")]
    Inverted(String),
}

/// Parse `HH:MM` into minutes since midnight.
pub fn parse_clock(s: &str) -> Result<Minute, BlockParseError> {
    let (h, m) = s
        .trim()
        .split_once(':')
        .ok_or_else(|| BlockParseError::Clock(s.to_string()))?;
    let h: u32 = h.trim().parse().map_err(|_| BlockParseError::Clock(s.to_string()))?;
    let m: u32 = m.trim().parse().map_err(|_| BlockParseError::Clock(s.to_string()))?;
    // 24:00 is allowed as an end-of-day marker.
    if h > 24 || m >= 60 || h * 60 + m > u32::from(MINUTES_PER_DAY) {
        return Err(BlockParseError::Clock(s.to_string()));
    }
    Ok((h * 60 + m) as Minute)
}

impl FromStr for TimeBlock {
    type Err = BlockParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s
            .split_once('-')
            .ok_or_else(|| BlockParseError::Format(s.to_string()))?;
        let start = parse_clock(start)?;
        let end = parse_clock(end)?;
        if start >= end {
            return Err(BlockParseError::Inverted(s.to_string()));
        }
        Ok(TimeBlock { start, end })
    }
}

/// The block template and booking horizon for a workshop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    weekday: Vec<TimeBlock>,
    saturday: Vec<TimeBlock>,
    sunday: Vec<TimeBlock>,
    horizon_days: u32,
}

pub const DEFAULT_HORIZON_DAYS: u32 = 30;

impl Default for Schedule {
    /// Four weekday blocks around a 12:00–14:00 lunch break, two Saturday
    /// morning blocks, closed on Sunday.
    fn default() -> Self {
        Self {
            weekday: vec![
                TimeBlock::new(8 * 60, 10 * 60),
                TimeBlock::new(10 * 60, 12 * 60),
                TimeBlock::new(14 * 60, 16 * 60),
                TimeBlock::new(16 * 60, 18 * 60),
            ],
            saturday: vec![
                TimeBlock::new(8 * 60, 10 * 60),
                TimeBlock::new(10 * 60, 12 * 60),
            ],
            sunday: Vec::new(),
            horizon_days: DEFAULT_HORIZON_DAYS,
        }
    }
}

impl Schedule {
    /// Build a schedule, sorting each class's blocks and rejecting overlaps.
    pub fn new(
        mut weekday: Vec<TimeBlock>,
        mut saturday: Vec<TimeBlock>,
        mut sunday: Vec<TimeBlock>,
        horizon_days: u32,
    ) -> Result<Self, ConfigError> {
        if horizon_days == 0 || horizon_days > MAX_HORIZON_DAYS {
            return Err(ConfigError::Horizon(horizon_days));
        }
        for (class, blocks) in [
            (WeekdayClass::Weekday, &mut weekday),
            (WeekdayClass::Saturday, &mut saturday),
            (WeekdayClass::Sunday, &mut sunday),
        ] {
            if blocks.len() > MAX_BLOCKS_PER_DAY {
                return Err(ConfigError::TooManyBlocks(class));
            }
            blocks.sort();
            for pair in blocks.windows(2) {
                if pair[0].overlaps(&pair[1]) || pair[0] == pair[1] {
                    return Err(ConfigError::OverlappingBlocks {
                        class,
                        first: pair[0],
                        second: pair[1],
                    });
                }
            }
        }
        Ok(Self {
            weekday,
            saturday,
            sunday,
            horizon_days,
        })
    }

    pub fn horizon_days(&self) -> u32 {
        self.horizon_days
    }

    pub fn blocks_for_class(&self, class: WeekdayClass) -> &[TimeBlock] {
        match class {
            WeekdayClass::Weekday => &self.weekday,
            WeekdayClass::Saturday => &self.saturday,
            WeekdayClass::Sunday => &self.sunday,
        }
    }

    /// Ordered bookable blocks for `date`.
    pub fn blocks_for(&self, date: NaiveDate) -> &[TimeBlock] {
        self.blocks_for_class(WeekdayClass::of(date))
    }

    pub fn has_block(&self, date: NaiveDate, block: TimeBlock) -> bool {
        self.blocks_for(date).binary_search(&block).is_ok()
    }

    /// `(today, today + horizon_days)`, both inclusive.
    pub fn horizon(&self, today: NaiveDate) -> (NaiveDate, NaiveDate) {
        let max = today
            .checked_add_days(Days::new(u64::from(self.horizon_days)))
            .unwrap_or(NaiveDate::MAX);
        (today, max)
    }

    pub fn in_horizon(&self, date: NaiveDate, today: NaiveDate) -> bool {
        let (min, max) = self.horizon(today);
        min <= date && date <= max
    }

    /// Every date in the horizon, ascending.
    pub fn horizon_dates(&self, today: NaiveDate) -> impl Iterator<Item = NaiveDate> {
        let (min, max) = self.horizon(today);
        min.iter_days().take_while(move |d| *d <= max)
    }
}
