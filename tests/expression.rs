//! tests/expression.rs
//! Cron expression parsing and fire-time computation.

mod common;

use crate::common::at;
use labelkeeper::{CronExpression, ExpressionError};

#[test]
fn test_every_minute_fires_at_reference() {
  let cron = CronExpression::parse("* * * * *").unwrap();
  let now = at("2024-03-04T10:04:30Z");
  assert_eq!(cron.next_at_or_after(now).unwrap(), now);
  assert!(cron.matches(now));
}

#[test]
fn test_next_keeps_sub_minute_offset() {
  let cron = CronExpression::parse("5 10 * * *").unwrap();
  assert_eq!(
    cron.next_at_or_after(at("2024-03-04T10:04:30Z")).unwrap(),
    at("2024-03-04T10:05:30Z")
  );
  // Same minute: the reference itself.
  assert_eq!(
    cron.next_at_or_after(at("2024-03-04T10:05:59Z")).unwrap(),
    at("2024-03-04T10:05:59Z")
  );
}

#[test]
fn test_rolls_over_to_next_day() {
  let cron = CronExpression::parse("0 9 * * *").unwrap();
  assert_eq!(
    cron.next_at_or_after(at("2024-03-04T10:00:00Z")).unwrap(),
    at("2024-03-05T09:00:00Z")
  );
}

#[test]
fn test_steps_ranges_and_lists() {
  let quarter = CronExpression::parse("*/15 * * * *").unwrap();
  assert_eq!(
    quarter.next_at_or_after(at("2024-03-04T10:01:00Z")).unwrap(),
    at("2024-03-04T10:15:00Z")
  );

  let cron = CronExpression::parse("0,30 8-9 * * *").unwrap();
  let fires = cron.upcoming(at("2024-03-04T07:00:00Z"), 5);
  assert_eq!(
    fires,
    vec![
      at("2024-03-04T08:00:00Z"),
      at("2024-03-04T08:30:00Z"),
      at("2024-03-04T09:00:00Z"),
      at("2024-03-04T09:30:00Z"),
      at("2024-03-05T08:00:00Z"),
    ]
  );

  let stepped_range = CronExpression::parse("10-40/10 * * * *").unwrap();
  assert_eq!(
    stepped_range.upcoming(at("2024-03-04T10:00:00Z"), 4),
    vec![
      at("2024-03-04T10:10:00Z"),
      at("2024-03-04T10:20:00Z"),
      at("2024-03-04T10:30:00Z"),
      at("2024-03-04T10:40:00Z"),
    ]
  );
}

#[test]
fn test_day_of_week_seven_is_sunday() {
  let seven = CronExpression::parse("0 0 * * 7").unwrap();
  let zero = CronExpression::parse("0 0 * * 0").unwrap();
  let monday = at("2024-03-04T10:00:00Z");
  assert_eq!(seven.next_at_or_after(monday).unwrap(), at("2024-03-10T00:00:00Z"));
  assert_eq!(
    seven.next_at_or_after(monday).unwrap(),
    zero.next_at_or_after(monday).unwrap()
  );
}

#[test]
fn test_day_of_week_numbers_map_to_weekdays() {
  let monday = at("2024-03-04T10:00:00Z");
  let saturday = CronExpression::parse("0 0 * * 6").unwrap();
  assert_eq!(saturday.next_at_or_after(monday).unwrap(), at("2024-03-09T00:00:00Z"));
  let tuesday = CronExpression::parse("0 0 * * 2").unwrap();
  assert_eq!(tuesday.next_at_or_after(monday).unwrap(), at("2024-03-05T00:00:00Z"));
  let weekend = CronExpression::parse("0 12 * * 6-7").unwrap();
  assert_eq!(
    weekend.upcoming(monday, 2),
    vec![at("2024-03-09T12:00:00Z"), at("2024-03-10T12:00:00Z")]
  );
}

#[test]
fn test_day_of_month_and_week_must_both_match() {
  // Friday the 13th.
  let cron = CronExpression::parse("0 0 13 * 5").unwrap();
  assert_eq!(
    cron.next_at_or_after(at("2024-03-04T00:00:00Z")).unwrap(),
    at("2024-09-13T00:00:00Z")
  );
}

#[test]
fn test_leap_day_is_found_years_ahead() {
  let cron = CronExpression::parse("0 0 29 2 *").unwrap();
  assert_eq!(
    cron.next_at_or_after(at("2024-03-01T00:00:00Z")).unwrap(),
    at("2028-02-29T00:00:00Z")
  );
}

#[test]
fn test_impossible_date_never_fires() {
  let cron = CronExpression::parse("0 0 30 2 *").unwrap();
  let err = cron.next_at_or_after(at("2024-03-04T00:00:00Z")).unwrap_err();
  assert!(matches!(err, ExpressionError::NoFireTime { .. }), "{err:?}");
  assert!(cron.upcoming(at("2024-03-04T00:00:00Z"), 3).is_empty());
  assert!(cron.upcoming(at("2024-03-04T00:00:00Z"), usize::MAX).is_empty());
}

#[test]
fn test_upcoming_with_unbounded_count_stops_at_last_fire() {
  let cron = CronExpression::parse("0 0 29 2 *").unwrap();
  let fires = cron.upcoming(at("2024-03-01T00:00:00Z"), usize::MAX);
  assert!(!fires.is_empty());
  assert_eq!(fires[0], at("2028-02-29T00:00:00Z"));
  assert!(fires.windows(2).all(|w| w[0] < w[1]));
  assert!(fires.iter().all(|f| cron.matches(*f)));
}

#[test]
fn test_upcoming_keeps_sub_minute_offset() {
  let cron = CronExpression::parse("*/20 * * * *").unwrap();
  let fires = cron.upcoming(at("2024-03-04T10:05:15Z"), 3);
  assert_eq!(
    fires,
    vec![
      at("2024-03-04T10:20:15Z"),
      at("2024-03-04T10:40:15Z"),
      at("2024-03-04T11:00:15Z"),
    ]
  );
}

#[test]
fn test_rejects_malformed_expressions() {
  assert_eq!(CronExpression::parse("").unwrap_err(), ExpressionError::Empty);
  assert_eq!(CronExpression::parse("   ").unwrap_err(), ExpressionError::Empty);
  assert_eq!(
    CronExpression::parse("* * * *").unwrap_err(),
    ExpressionError::FieldCount { found: 4 }
  );
  assert_eq!(
    CronExpression::parse("* * * * * *").unwrap_err(),
    ExpressionError::FieldCount { found: 6 }
  );
  assert!(matches!(
    CronExpression::parse("60 * * * *").unwrap_err(),
    ExpressionError::OutOfRange { field: "minute", value: 60, .. }
  ));
  assert!(matches!(
    CronExpression::parse("* * 0 * *").unwrap_err(),
    ExpressionError::OutOfRange { field: "day-of-month", value: 0, .. }
  ));
  assert!(matches!(
    CronExpression::parse("* * * 13 *").unwrap_err(),
    ExpressionError::OutOfRange { field: "month", .. }
  ));
  assert!(matches!(
    CronExpression::parse("* * * * 8").unwrap_err(),
    ExpressionError::OutOfRange { field: "day-of-week", .. }
  ));

  for bad in [
    "*/0 * * * *",
    "5-1 * * * *",
    "5/2 * * * *",
    "a * * * *",
    "1,,2 * * * *",
    "H(5) * * * *",
    "-5 * * * *",
  ] {
    assert!(
      matches!(
        CronExpression::parse(bad).unwrap_err(),
        ExpressionError::InvalidField { .. }
      ),
      "`{bad}` should be rejected as an invalid field"
    );
  }

  assert_eq!(
    CronExpression::parse("@never").unwrap_err(),
    ExpressionError::UnknownAlias("@never".to_string())
  );
}

#[test]
fn test_hash_token_is_stable_per_identity() {
  let a = CronExpression::parse_seeded("H H * * *", "nightly").unwrap();
  let b = CronExpression::parse_seeded("H H * * *", "nightly").unwrap();
  assert_eq!(a, b);

  let from = at("2024-03-04T00:00:00Z");
  assert_eq!(a.upcoming(from, 3), b.upcoming(from, 3));
}

#[test]
fn test_hash_token_respects_its_range() {
  for identity in ["alpha", "beta", "gamma", "delta", "epsilon"] {
    let cron = CronExpression::parse_seeded("H(10-20) * * * *", identity).unwrap();
    for fire in cron.upcoming(at("2024-03-04T00:00:00Z"), 3) {
      let minute = fire.format("%M").to_string().parse::<u32>().unwrap();
      assert!((10..=20).contains(&minute), "{identity}: minute {minute}");
    }
  }
}

#[test]
fn test_unseeded_hash_takes_range_minimum() {
  let cron = CronExpression::parse("H * * * *").unwrap();
  assert_eq!(
    cron.next_at_or_after(at("2024-03-04T10:00:30Z")).unwrap(),
    at("2024-03-04T10:00:30Z")
  );

  let stepped = CronExpression::parse("H/20 * * * *").unwrap();
  assert_eq!(
    stepped.upcoming(at("2024-03-04T10:00:00Z"), 3),
    vec![
      at("2024-03-04T10:00:00Z"),
      at("2024-03-04T10:20:00Z"),
      at("2024-03-04T10:40:00Z"),
    ]
  );
}

#[test]
fn test_aliases() {
  let midnight = CronExpression::parse("@midnight").unwrap();
  assert_eq!(
    midnight.next_at_or_after(at("2024-03-04T10:00:00Z")).unwrap(),
    at("2024-03-05T00:00:00Z")
  );
  assert_eq!(midnight.source(), "@midnight");

  for alias in ["@hourly", "@daily", "@weekly", "@monthly", "@yearly", "@annually"] {
    let cron = CronExpression::parse_seeded(alias, "some-schedule").unwrap();
    assert!(cron.next_at_or_after(at("2024-03-04T10:00:00Z")).is_ok(), "{alias}");
  }
}

#[test]
fn test_previous_fire_time() {
  let hourly = CronExpression::parse("0 * * * *").unwrap();
  assert_eq!(
    hourly.previous(at("2024-03-04T10:30:00Z")).unwrap(),
    at("2024-03-04T10:00:00Z")
  );
  // Strictly before the reference minute.
  assert_eq!(
    hourly.previous(at("2024-03-04T10:00:20Z")).unwrap(),
    at("2024-03-04T09:00:00Z")
  );
  // Across a day boundary.
  let morning = CronExpression::parse("15 6 * * *").unwrap();
  assert_eq!(
    morning.previous(at("2024-03-04T05:00:00Z")).unwrap(),
    at("2024-03-03T06:15:00Z")
  );
}

#[test]
fn test_from_str_and_display() {
  let cron: CronExpression = " 0 12 * * 1-5 ".parse().unwrap();
  assert_eq!(cron.to_string(), "0 12 * * 1-5");
  assert!(cron.matches(at("2024-03-04T12:00:59Z")));
  assert!(!cron.matches(at("2024-03-09T12:00:00Z"))); // Saturday
}
