//! tests/selector.rs
//! Due-schedule selection: minimality, tie-break, threshold, exclusions.

mod common;

use std::time::Duration as StdDuration;

use crate::common::at;
use chrono::Duration as ChronoDuration;
use labelkeeper::{select_due, Candidate, LabelAction, Schedule, SelectError, Selection};

const TICK: StdDuration = StdDuration::from_secs(60);

fn schedule(name: &str, expression: &str) -> Schedule {
  Schedule::new(name, expression, LabelAction::Replace, "x", "n1")
}

fn candidate_in(name: &str, minutes: i64) -> Candidate {
  let now = at("2024-03-04T10:00:00Z");
  Candidate::new(
    schedule(name, "* * * * *"),
    now + ChronoDuration::minutes(minutes),
    now,
  )
  .unwrap()
}

#[test]
fn test_empty_collection_selects_nothing() {
  let now = at("2024-03-04T10:00:00Z");
  assert!(select_due(now, &[], TICK).unwrap().is_none());
}

#[test]
fn test_nothing_due_within_one_period() {
  let now = at("2024-03-04T10:00:00Z");
  let schedules = vec![
    schedule("soon", "1 10 * * *"),
    schedule("later", "30 10 * * *"),
    schedule("tomorrow", "0 9 * * *"),
  ];
  assert!(select_due(now, &schedules, TICK).unwrap().is_none());
}

#[test]
fn test_minimal_delay_wins() {
  let selection = Selection {
    candidates: vec![
      candidate_in("five", 5),
      candidate_in("one", 1),
      candidate_in("three", 3),
    ],
    excluded: Vec::new(),
  };
  assert_eq!(selection.earliest().unwrap().schedule().name(), "one");
  assert_eq!(
    selection
      .due(StdDuration::from_secs(10 * 60))
      .unwrap()
      .schedule()
      .name(),
    "one"
  );
  // One minute away is not strictly less than one tick.
  assert!(selection.due(TICK).is_none());
}

#[test]
fn test_equal_delays_resolve_to_first_encountered() {
  let selection = Selection {
    candidates: vec![candidate_in("first", 1), candidate_in("second", 1)],
    excluded: Vec::new(),
  };
  assert_eq!(selection.earliest().unwrap().schedule().name(), "first");
}

#[test]
fn test_minimal_delay_with_real_expressions() {
  let now = at("2024-03-04T10:00:00Z");
  let schedules = vec![
    schedule("five", "5 10 * * *"),
    schedule("one", "1 10 * * *"),
    schedule("three", "3 10 * * *"),
  ];
  let due = select_due(now, &schedules, StdDuration::from_secs(10 * 60))
    .unwrap()
    .unwrap();
  assert_eq!(due.schedule().name(), "one");
  assert_eq!(due.delay(), ChronoDuration::minutes(1));
  assert_eq!(due.next_fire(), at("2024-03-04T10:01:00Z"));
}

#[test]
fn test_due_in_current_minute() {
  let schedules = vec![schedule("ten", "0 10 * * *"), schedule("every", "* * * * *")];
  let due = select_due(at("2024-03-04T10:00:45Z"), &schedules, TICK)
    .unwrap()
    .unwrap();
  // Both fire now; configuration order breaks the tie.
  assert_eq!(due.schedule().name(), "ten");
  assert_eq!(due.delay(), ChronoDuration::zero());
}

#[test]
fn test_invalid_expressions_are_excluded_not_fatal() {
  let now = at("2024-03-04T10:00:00Z");
  let schedules = vec![
    schedule("broken", "61 * * * *"),
    schedule("empty", ""),
    schedule("fine", "* * * * *"),
  ];
  let selection = Selection::evaluate(now, &schedules).unwrap();
  assert_eq!(selection.candidates.len(), 1);
  let excluded: Vec<&str> = selection
    .excluded
    .iter()
    .map(|e| e.schedule.as_str())
    .collect();
  assert_eq!(excluded, vec!["broken", "empty"]);
  assert_eq!(selection.due(TICK).unwrap().schedule().name(), "fine");
}

#[test]
fn test_fire_time_in_the_past_is_a_clock_regression() {
  let now = at("2024-03-04T10:00:00Z");
  let err = Candidate::new(
    schedule("backwards", "* * * * *"),
    now - ChronoDuration::seconds(1),
    now,
  )
  .unwrap_err();
  assert!(matches!(
    err,
    SelectError::ClockRegression { ref schedule, .. } if schedule == "backwards"
  ));
}

#[test]
fn test_all_due_orders_by_delay_then_position() {
  let selection = Selection {
    candidates: vec![
      candidate_in("b", 2),
      candidate_in("a", 0),
      candidate_in("c", 0),
      candidate_in("late", 90),
    ],
    excluded: Vec::new(),
  };
  let names: Vec<&str> = selection
    .all_due(StdDuration::from_secs(5 * 60))
    .into_iter()
    .map(|c| c.schedule().name())
    .collect();
  assert_eq!(names, vec!["a", "c", "b"]);
}
