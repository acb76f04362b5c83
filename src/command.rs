//! Booking command grammar — parsing and validation of subject lines.
//!
//! A reservation command arrives as an email subject of the form
//! `订场-<day>-<start>-<end>`, e.g. `订场-3-20-21` for day 3, 20:00–21:00.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use tracing::warn;

/// Subject pattern. Day is an unconstrained integer literal; hours are one
/// or two digits. Range validation happens after the match.
static COMMAND_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"订场-(\d+)-(\d{1,2})-(\d{1,2})").expect("valid regex"));

/// A validated reservation command parsed from a subject line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookingCommand {
    /// Day to book, 1 = today, 2 = tomorrow, up to 7.
    pub day: u8,
    /// Start hour, 24h clock.
    pub start_hour: u8,
    /// End hour, 24h clock, strictly after `start_hour`.
    pub end_hour: u8,
}

/// Structured duplicate-suppression key for a command.
///
/// A composite of the raw fields rather than a hash of their concatenation,
/// so `(1, 12, 13)` and `(11, 2, 13)` can never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    day: u8,
    start_hour: u8,
    end_hour: u8,
}

impl BookingCommand {
    /// The command's duplicate-suppression key.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint {
            day: self.day,
            start_hour: self.start_hour,
            end_hour: self.end_hour,
        }
    }
}

impl fmt::Display for BookingCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "day {} {:02}:00-{:02}:00",
            self.day, self.start_hour, self.end_hour
        )
    }
}

/// Parse a subject line against the command grammar.
///
/// Returns `None` for non-matching subjects and for out-of-range fields;
/// rejections are logged with the offending value, never fatal.
pub fn parse_booking_command(subject: &str) -> Option<BookingCommand> {
    let caps = COMMAND_RE.captures(subject)?;

    // Day may exceed u8 ("订场-999-..."); treat overflow as out of range.
    let day: u64 = caps[1].parse().ok()?;
    if !(1..=7).contains(&day) {
        warn!(day, subject, "Booking command day out of range");
        return None;
    }

    let start_hour: u8 = caps[2].parse().ok()?;
    let end_hour: u8 = caps[3].parse().ok()?;
    if start_hour >= end_hour || end_hour > 24 {
        warn!(start_hour, end_hour, subject, "Booking command time range invalid");
        return None;
    }

    Some(BookingCommand {
        day: day as u8,
        start_hour,
        end_hour,
    })
}
