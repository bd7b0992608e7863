//! Label set algebra.
//!
//! A target's labels are a whitespace separated string. Mutation treats them
//! as a set: duplicates collapse and the empty string is the empty set.
//! Output keeps a stable order (current labels first, in their original
//! order) so repeated runs produce byte-identical strings.

use crate::schedule::LabelAction;

/// Splits a label string on whitespace, dropping duplicates while keeping
/// the first occurrence's position.
pub fn tokenize(label_string: &str) -> Vec<String> {
  let mut tokens: Vec<String> = Vec::new();
  for token in label_string.split_whitespace() {
    if !tokens.iter().any(|t| t == token) {
      tokens.push(token.to_string());
    }
  }
  tokens
}

/// Applies `action` with `labels` to the current label string and returns the
/// new label string.
///
/// - `Replace`: `labels`, verbatim.
/// - `Add`: current labels followed by any of `labels` not already present.
/// - `Remove`: current labels that are not in `labels`.
///
/// The result is joined with single spaces. An empty result is `""`.
pub fn mutate<S: AsRef<str>>(current: &str, action: LabelAction, labels: &[S]) -> String {
  let requested = labels
    .iter()
    .flat_map(|l| l.as_ref().split_whitespace())
    .fold(Vec::<&str>::new(), |mut acc, token| {
      if !acc.contains(&token) {
        acc.push(token);
      }
      acc
    });

  let result: Vec<&str> = match action {
    LabelAction::Replace => requested,
    LabelAction::Add => {
      let mut merged = dedup(current.split_whitespace());
      for token in requested {
        if !merged.contains(&token) {
          merged.push(token);
        }
      }
      merged
    }
    LabelAction::Remove => dedup(current.split_whitespace())
      .into_iter()
      .filter(|token| !requested.contains(token))
      .collect(),
  };

  result.join(" ")
}

fn dedup<'a>(tokens: impl Iterator<Item = &'a str>) -> Vec<&'a str> {
  let mut out: Vec<&str> = Vec::new();
  for token in tokens {
    if !out.contains(&token) {
      out.push(token);
    }
  }
  out
}

