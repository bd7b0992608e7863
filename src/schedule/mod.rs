//! The schedule data model.
//!
//! A [`Schedule`] is a plain value record: it holds target *names* only and is
//! resolved against a [`TargetResolver`](crate::target::TargetResolver) at
//! mutation time. Identity is the schedule name; two schedules with the same
//! name compare equal even when every other field differs.

pub mod set;

pub use set::ScheduleSet;

use crate::error::ExpressionError;
use crate::expression::CronExpression;
use crate::target::{TargetResolver, MASTER_TARGET};

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// How a schedule's labels combine with a target's current labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "UPPERCASE"))]
pub enum LabelAction {
  /// Union with the current labels.
  Add,
  /// Difference from the current labels.
  Remove,
  /// Discard the current labels entirely.
  #[default]
  Replace,
}

impl fmt::Display for LabelAction {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      LabelAction::Add => "ADD",
      LabelAction::Remove => "REMOVE",
      LabelAction::Replace => "REPLACE",
    };
    f.write_str(s)
  }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown label action `{0}` (expected ADD, REMOVE or REPLACE)")]
pub struct ParseActionError(pub String);

impl FromStr for LabelAction {
  type Err = ParseActionError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_ascii_uppercase().as_str() {
      "ADD" => Ok(LabelAction::Add),
      "REMOVE" => Ok(LabelAction::Remove),
      "REPLACE" => Ok(LabelAction::Replace),
      _ => Err(ParseActionError(s.to_string())),
    }
  }
}

/// A reference to a target by name, with an optional requested slot count.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TargetRef {
  name: String,
  capacity: Option<usize>,
}

impl TargetRef {
  /// Builds a reference from a raw name. Surrounding whitespace and one pair
  /// of matching quotes are stripped.
  pub fn parse(raw: &str) -> Self {
    Self {
      name: unquote(raw.trim()).to_string(),
      capacity: None,
    }
  }

  /// Requests that the target's worker pool be resized to `count` slots.
  pub fn with_capacity(mut self, count: usize) -> Self {
    self.capacity = Some(count);
    self
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn capacity(&self) -> Option<usize> {
    self.capacity
  }

  /// Whether this reference names the controller (case-insensitive).
  pub fn is_master(&self) -> bool {
    self.name.eq_ignore_ascii_case(MASTER_TARGET)
  }
}

impl fmt::Display for TargetRef {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.name.chars().any(char::is_whitespace) {
      write!(f, "\"{}\"", self.name)
    } else {
      f.write_str(&self.name)
    }
  }
}

/// A problem found by [`Schedule::validate`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationIssue {
  #[error("Schedule name is empty")]
  EmptyName,
  #[error("Schedule name `{0}` contains whitespace")]
  NameContainsWhitespace(String),
  #[error("Invalid expression: {0}")]
  InvalidExpression(#[from] ExpressionError),
  #[error("No labels given")]
  NoLabels,
  #[error("No targets given")]
  NoTargets,
  #[error("Another schedule is already named `{0}`")]
  DuplicateName(String),
  #[error("Target `{0}` does not exist")]
  UnknownTarget(String),
}

/// A named rule mapping a cron trigger to a label mutation over a set of
/// named targets.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Schedule {
  name: String,
  expression: String,
  action: LabelAction,
  labels: Vec<String>,
  targets: Vec<TargetRef>,
}

impl Schedule {
  /// Builds a schedule from the strings a user would author.
  ///
  /// `labels` is whitespace separated; duplicates collapse and the first
  /// occurrence keeps its position. `targets` is whitespace separated too,
  /// but a name containing spaces can be wrapped in double or single quotes.
  pub fn new(
    name: impl Into<String>,
    expression: impl Into<String>,
    action: LabelAction,
    labels: &str,
    targets: &str,
  ) -> Self {
    let targets: Vec<TargetRef> = tokenize_targets(targets)
      .into_iter()
      .map(|name| TargetRef {
        name,
        capacity: None,
      })
      .collect();
    Self::from_parts(
      name,
      expression,
      action,
      crate::labels::tokenize(labels),
      targets,
    )
  }

  /// Builds a schedule from already separated parts.
  pub fn from_parts(
    name: impl Into<String>,
    expression: impl Into<String>,
    action: LabelAction,
    labels: impl IntoIterator<Item = String>,
    targets: impl IntoIterator<Item = TargetRef>,
  ) -> Self {
    let mut collapsed: Vec<String> = Vec::new();
    for label in labels {
      let label = label.trim();
      if !label.is_empty() && !collapsed.iter().any(|l| l == label) {
        collapsed.push(label.to_string());
      }
    }
    let mut unique_targets: Vec<TargetRef> = Vec::new();
    for target in targets {
      if target.name.is_empty() {
        continue;
      }
      match unique_targets.iter_mut().find(|t| t.name == target.name) {
        // a later duplicate only contributes a capacity request
        Some(existing) => {
          if target.capacity.is_some() {
            existing.capacity = target.capacity;
          }
        }
        None => unique_targets.push(target),
      }
    }
    Self {
      name: name.into().trim().to_string(),
      expression: expression.into().trim().to_string(),
      action,
      labels: collapsed,
      targets: unique_targets,
    }
  }

  /// Requests a slot count for the named target. Unknown names are ignored.
  pub fn with_target_capacity(mut self, target: &str, count: usize) -> Self {
    if let Some(t) = self.targets.iter_mut().find(|t| t.name == target) {
      t.capacity = Some(count);
    }
    self
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn expression(&self) -> &str {
    &self.expression
  }

  pub fn action(&self) -> LabelAction {
    self.action
  }

  pub fn labels(&self) -> &[String] {
    &self.labels
  }

  pub fn targets(&self) -> &[TargetRef] {
    &self.targets
  }

  /// Labels joined with single spaces.
  pub fn label_string(&self) -> String {
    self.labels.join(" ")
  }

  /// Target names joined with single spaces, quoting names that need it.
  pub fn target_string(&self) -> String {
    self
      .targets
      .iter()
      .map(ToString::to_string)
      .collect::<Vec<_>>()
      .join(" ")
  }

  /// Parses the expression with `H` tokens resolved from the schedule name.
  pub fn cron(&self) -> Result<CronExpression, ExpressionError> {
    CronExpression::parse_seeded(&self.expression, &self.name)
  }

  /// The first fire time at or after `reference`.
  pub fn next_fire(&self, reference: DateTime<Utc>) -> Result<DateTime<Utc>, ExpressionError> {
    self.cron()?.next_at_or_after(reference)
  }

  /// Checks the schedule's own fields, returning every problem found.
  pub fn validate(&self) -> Result<(), Vec<ValidationIssue>> {
    let mut issues = Vec::new();
    if self.name.is_empty() {
      issues.push(ValidationIssue::EmptyName);
    } else if self.name.chars().any(char::is_whitespace) {
      issues.push(ValidationIssue::NameContainsWhitespace(self.name.clone()));
    }
    if let Err(e) = self.cron() {
      issues.push(ValidationIssue::InvalidExpression(e));
    }
    if self.labels.is_empty() {
      issues.push(ValidationIssue::NoLabels);
    }
    if self.targets.is_empty() {
      issues.push(ValidationIssue::NoTargets);
    }
    if issues.is_empty() {
      Ok(())
    } else {
      Err(issues)
    }
  }

  /// Like [`validate`](Self::validate), and also checks that every target
  /// resolves.
  pub fn validate_with(&self, resolver: &dyn TargetResolver) -> Result<(), Vec<ValidationIssue>> {
    let mut issues = self.validate().err().unwrap_or_default();
    for target in &self.targets {
      if resolver.resolve(target.name()).is_none() {
        issues.push(ValidationIssue::UnknownTarget(target.name.clone()));
      }
    }
    if issues.is_empty() {
      Ok(())
    } else {
      Err(issues)
    }
  }
}

impl PartialEq for Schedule {
  fn eq(&self, other: &Self) -> bool {
    self.name == other.name
  }
}

impl Eq for Schedule {}

impl Hash for Schedule {
  fn hash<H: Hasher>(&self, state: &mut H) {
    self.name.hash(state);
  }
}

impl fmt::Display for Schedule {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{}[{}]->{}[{}]",
      self.name,
      self.target_string(),
      self.action,
      self.label_string()
    )
  }
}

fn unquote(raw: &str) -> &str {
  for quote in ['"', '\''] {
    if raw.len() >= 2 && raw.starts_with(quote) && raw.ends_with(quote) {
      return &raw[1..raw.len() - 1];
    }
  }
  raw
}

/// Splits a target string on whitespace, keeping quoted runs together.
fn tokenize_targets(input: &str) -> Vec<String> {
  let mut names = Vec::new();
  let mut chars = input.chars().peekable();
  while let Some(&c) = chars.peek() {
    if c.is_whitespace() {
      chars.next();
      continue;
    }
    let mut name = String::new();
    if c == '"' || c == '\'' {
      chars.next();
      for next in chars.by_ref() {
        if next == c {
          break;
        }
        name.push(next);
      }
    } else {
      while let Some(&next) = chars.peek() {
        if next.is_whitespace() || next == '"' || next == '\'' {
          break;
        }
        name.push(next);
        chars.next();
      }
    }
    let name = name.trim();
    if !name.is_empty() && !names.iter().any(|n: &String| n == name) {
      names.push(name.to_string());
    }
  }
  names
}
