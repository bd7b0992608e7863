//! Five-field cron expressions with a per-schedule hash token.
//!
//! Supported syntax, per field (`minute hour day-of-month month day-of-week`):
//!
//! - `*`, `N`, `A-B`, `*/S`, `A-B/S` and comma separated lists of these.
//! - `H`, `H/S`, `H(A-B)` and `H(A-B)/S`: a value (or step offset) derived from
//!   a hash of the owning schedule's identity. The same identity always
//!   resolves to the same value, so a schedule does not drift tick to tick.
//! - Aliases `@yearly`, `@annually`, `@monthly`, `@weekly`, `@daily`,
//!   `@midnight` and `@hourly`, which expand to hashed expressions.
//!
//! Day-of-week accepts `0-7` where both `0` and `7` mean Sunday. When both
//! day-of-month and day-of-week are restricted, a day has to satisfy both.
//!
//! Fire times keep the reference instant's sub-minute offset: evaluating
//! `5 10 * * *` at `10:04:30` yields `10:05:30`. Delays between a reference and
//! its next fire time are therefore always whole minutes, and a schedule is
//! at zero delay exactly while its minute is current.

use crate::error::ExpressionError;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate, Timelike, Utc};
use cron::Schedule as CronSchedule;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
  Minute,
  Hour,
  DayOfMonth,
  Month,
  DayOfWeek,
}

impl Field {
  const ORDER: [Field; 5] = [
    Field::Minute,
    Field::Hour,
    Field::DayOfMonth,
    Field::Month,
    Field::DayOfWeek,
  ];

  fn name(self) -> &'static str {
    match self {
      Field::Minute => "minute",
      Field::Hour => "hour",
      Field::DayOfMonth => "day-of-month",
      Field::Month => "month",
      Field::DayOfWeek => "day-of-week",
    }
  }

  /// Values a literal may take.
  fn bounds(self) -> (u32, u32) {
    match self {
      Field::Minute => (0, 59),
      Field::Hour => (0, 23),
      Field::DayOfMonth => (1, 31),
      Field::Month => (1, 12),
      Field::DayOfWeek => (0, 7),
    }
  }

  /// Values covered by `*`.
  fn star_bounds(self) -> (u32, u32) {
    match self {
      Field::DayOfWeek => (0, 6),
      other => other.bounds(),
    }
  }

  /// Values a bare `H` may resolve to. Day-of-month stops at 28 so the
  /// hashed day exists in every month.
  fn hash_bounds(self) -> (u32, u32) {
    match self {
      Field::DayOfMonth => (1, 28),
      other => other.star_bounds(),
    }
  }

  fn tag(self) -> u8 {
    self as u8
  }
}

/// Resolves `H` tokens from a schedule identity.
#[derive(Debug, Clone, Copy)]
struct Jitter {
  seed: Option<u32>,
}

impl Jitter {
  fn new(identity: Option<&str>) -> Self {
    Self {
      seed: identity.map(|id| crc32fast::hash(id.as_bytes())),
    }
  }

  /// Returns a value in `0..modulus`. Without an identity every `H` resolves
  /// to the lowest value of its range.
  fn pick(&self, field: Field, ordinal: u32, modulus: u32) -> u32 {
    let Some(seed) = self.seed else {
      return 0;
    };
    if modulus == 0 {
      return 0;
    }
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&seed.to_le_bytes());
    hasher.update(&[field.tag()]);
    hasher.update(&ordinal.to_le_bytes());
    hasher.finalize() % modulus
  }
}

/// A parsed five-field cron expression.
///
/// Each field is held as a bitset of the values it fires on. Once `H` tokens
/// are resolved the bitsets are handed to [`cron::Schedule`] as explicit
/// lists, which does the fire-time search.
#[derive(Clone)]
pub struct CronExpression {
  source: String,
  minutes: u64,
  hours: u64,
  days_of_month: u64,
  months: u64,
  days_of_week: u64,
  timetable: CronSchedule,
}

impl CronExpression {
  /// Parses an expression without a hash identity (`H` resolves to the
  /// lowest value of its range).
  pub fn parse(expression: &str) -> Result<Self, ExpressionError> {
    Self::parse_with(expression, Jitter::new(None))
  }

  /// Parses an expression, resolving `H` tokens from `identity`.
  pub fn parse_seeded(expression: &str, identity: &str) -> Result<Self, ExpressionError> {
    Self::parse_with(expression, Jitter::new(Some(identity)))
  }

  fn parse_with(expression: &str, jitter: Jitter) -> Result<Self, ExpressionError> {
    let trimmed = expression.trim();
    if trimmed.is_empty() {
      return Err(ExpressionError::Empty);
    }
    let body = if trimmed.starts_with('@') {
      expand_alias(trimmed)?
    } else {
      trimmed
    };

    let tokens: Vec<&str> = body.split_whitespace().collect();
    if tokens.len() != Field::ORDER.len() {
      return Err(ExpressionError::FieldCount {
        found: tokens.len(),
      });
    }

    let mut bits = [0u64; 5];
    for (slot, (field, token)) in bits.iter_mut().zip(Field::ORDER.iter().zip(tokens.iter())) {
      *slot = parse_field(*field, token, &jitter)?;
    }

    let [minutes, hours, days_of_month, months, days_of_week] = bits;
    // seconds pinned to 0; cron numbers weekdays 1-7 from Sunday
    let rendered = format!(
      "0 {} {} {} {} {}",
      render(minutes, 0),
      render(hours, 0),
      render(days_of_month, 0),
      render(months, 0),
      render(days_of_week, 1),
    );
    let timetable =
      CronSchedule::from_str(&rendered).map_err(|e| ExpressionError::Rejected {
        expression: trimmed.to_string(),
        reason: e.to_string(),
      })?;

    Ok(Self {
      source: trimmed.to_string(),
      minutes,
      hours,
      days_of_month,
      months,
      days_of_week,
      timetable,
    })
  }

  /// The expression text as written (trimmed).
  pub fn source(&self) -> &str {
    &self.source
  }

  /// Whether the minute containing `instant` is a fire minute.
  pub fn matches(&self, instant: DateTime<Utc>) -> bool {
    let naive = instant.naive_utc();
    self.day_matches(naive.date())
      && has(self.hours, naive.hour())
      && has(self.minutes, naive.minute())
  }

  /// Computes the first fire time at or after `reference`.
  ///
  /// The result carries the sub-minute offset of `reference`; if the
  /// reference minute itself fires, `reference` is returned unchanged.
  pub fn next_at_or_after(
    &self,
    reference: DateTime<Utc>,
  ) -> Result<DateTime<Utc>, ExpressionError> {
    let (minute_start, sub_minute) = split_minute(reference);
    self
      .timetable
      .after(&(minute_start - ChronoDuration::seconds(1)))
      .next()
      .map(|fire| fire + sub_minute)
      .ok_or_else(|| self.no_fire_time())
  }

  /// Computes the start of the latest fire minute strictly before the minute
  /// containing `reference`.
  pub fn previous(
    &self,
    reference: DateTime<Utc>,
  ) -> Result<DateTime<Utc>, ExpressionError> {
    let (minute_start, _) = split_minute(reference);
    self
      .timetable
      .after(&minute_start)
      .next_back()
      .ok_or_else(|| self.no_fire_time())
  }

  /// Lists up to `count` consecutive fire times starting at `from`.
  pub fn upcoming(&self, from: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
    let (minute_start, sub_minute) = split_minute(from);
    self
      .timetable
      .after(&(minute_start - ChronoDuration::seconds(1)))
      .take(count)
      .map(|fire| fire + sub_minute)
      .collect()
  }

  fn day_matches(&self, date: NaiveDate) -> bool {
    has(self.months, date.month())
      && has(self.days_of_month, date.day())
      && has(self.days_of_week, date.weekday().num_days_from_sunday())
  }

  fn no_fire_time(&self) -> ExpressionError {
    ExpressionError::NoFireTime {
      expression: self.source.clone(),
    }
  }
}

impl PartialEq for CronExpression {
  fn eq(&self, other: &Self) -> bool {
    self.source == other.source
      && self.minutes == other.minutes
      && self.hours == other.hours
      && self.days_of_month == other.days_of_month
      && self.months == other.months
      && self.days_of_week == other.days_of_week
  }
}

impl Eq for CronExpression {}

impl fmt::Debug for CronExpression {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CronExpression")
      .field("source", &self.source)
      .field("minutes", &format_args!("{:#x}", self.minutes))
      .field("hours", &format_args!("{:#x}", self.hours))
      .field("days_of_month", &format_args!("{:#x}", self.days_of_month))
      .field("months", &format_args!("{:#x}", self.months))
      .field("days_of_week", &format_args!("{:#x}", self.days_of_week))
      .finish()
  }
}

impl FromStr for CronExpression {
  type Err = ExpressionError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::parse(s)
  }
}

impl fmt::Display for CronExpression {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.source)
  }
}

fn has(bits: u64, value: u32) -> bool {
  value < 64 && bits & (1u64 << value) != 0
}

/// Joins the set values of `bits` as a comma list, shifted by `offset`.
fn render(bits: u64, offset: u32) -> String {
  (0..64u32)
    .filter(|value| has(bits, *value))
    .map(|value| (value + offset).to_string())
    .collect::<Vec<_>>()
    .join(",")
}

/// Splits a timestamp into the start of its minute and the offset into it.
fn split_minute(instant: DateTime<Utc>) -> (DateTime<Utc>, ChronoDuration) {
  let sub_minute = ChronoDuration::seconds(i64::from(instant.second()))
    + ChronoDuration::nanoseconds(i64::from(instant.nanosecond()));
  (instant - sub_minute, sub_minute)
}

fn expand_alias(alias: &str) -> Result<&'static str, ExpressionError> {
  match alias {
    "@yearly" | "@annually" => Ok("H H H H *"),
    "@monthly" => Ok("H H H * *"),
    "@weekly" => Ok("H H * * H"),
    "@daily" => Ok("H H * * *"),
    "@midnight" => Ok("H H(0-2) * * *"),
    "@hourly" => Ok("H * * * *"),
    other => Err(ExpressionError::UnknownAlias(other.to_string())),
  }
}

fn parse_field(field: Field, text: &str, jitter: &Jitter) -> Result<u64, ExpressionError> {
  let mut bits = 0u64;
  for (ordinal, term) in text.split(',').enumerate() {
    let ordinal = u32::try_from(ordinal).unwrap_or(u32::MAX);
    bits |= parse_term(field, term, jitter, ordinal)?;
  }
  if field == Field::DayOfWeek && has(bits, 7) {
    // 7 is an alias for Sunday
    bits = (bits & !(1u64 << 7)) | 1;
  }
  Ok(bits)
}

fn parse_term(
  field: Field,
  term: &str,
  jitter: &Jitter,
  ordinal: u32,
) -> Result<u64, ExpressionError> {
  let invalid = |reason: &'static str| ExpressionError::InvalidField {
    field: field.name(),
    token: term.to_string(),
    reason,
  };
  if term.is_empty() {
    return Err(invalid("empty list element"));
  }

  let (base, step) = match term.split_once('/') {
    Some((base, step)) => (base, Some(parse_step(field, term, step)?)),
    None => (term, None),
  };

  if base == "*" {
    let (lo, hi) = field.star_bounds();
    return Ok(fill(lo, hi, step.unwrap_or(1)));
  }

  if let Some(rest) = base.strip_prefix('H') {
    let (lo, hi) = if rest.is_empty() {
      field.hash_bounds()
    } else {
      let inner = rest
        .strip_prefix('(')
        .and_then(|r| r.strip_suffix(')'))
        .ok_or_else(|| invalid("expected `H` or `H(a-b)`"))?;
      let (a, b) = inner
        .split_once('-')
        .ok_or_else(|| invalid("hash range must be `a-b`"))?;
      let lo = parse_value(field, term, a)?;
      let hi = parse_value(field, term, b)?;
      if lo > hi {
        return Err(invalid("range start exceeds range end"));
      }
      (lo, hi)
    };
    let span = hi - lo + 1;
    return Ok(match step {
      None => 1u64 << (lo + jitter.pick(field, ordinal, span)),
      Some(step) => fill(lo + jitter.pick(field, ordinal, step.min(span)), hi, step),
    });
  }

  let (lo, hi) = match base.split_once('-') {
    Some((a, b)) => (parse_value(field, term, a)?, parse_value(field, term, b)?),
    None => {
      if step.is_some() {
        return Err(invalid("a step needs a range, `*` or `H`"));
      }
      let value = parse_value(field, term, base)?;
      (value, value)
    }
  };
  if lo > hi {
    return Err(invalid("range start exceeds range end"));
  }
  Ok(fill(lo, hi, step.unwrap_or(1)))
}

fn parse_value(field: Field, term: &str, text: &str) -> Result<u32, ExpressionError> {
  if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
    return Err(ExpressionError::InvalidField {
      field: field.name(),
      token: term.to_string(),
      reason: "expected a number",
    });
  }
  let (min, max) = field.bounds();
  // Anything that overflows u32 is out of range anyway.
  let value = text.parse::<u32>().unwrap_or(u32::MAX);
  if value < min || value > max {
    return Err(ExpressionError::OutOfRange {
      field: field.name(),
      value,
      min,
      max,
    });
  }
  Ok(value)
}

fn parse_step(field: Field, term: &str, text: &str) -> Result<u32, ExpressionError> {
  let invalid = |reason: &'static str| ExpressionError::InvalidField {
    field: field.name(),
    token: term.to_string(),
    reason,
  };
  if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
    return Err(invalid("step must be a number"));
  }
  match text.parse::<u32>() {
    Ok(0) => Err(invalid("step must be positive")),
    Ok(step) => Ok(step),
    Err(_) => Err(invalid("step is too large")),
  }
}

fn fill(lo: u32, hi: u32, step: u32) -> u64 {
  let mut bits = 0u64;
  let mut value = lo;
  while value <= hi {
    bits |= 1u64 << value;
    value = match value.checked_add(step) {
      Some(next) => next,
      None => break,
    };
  }
  bits
}
