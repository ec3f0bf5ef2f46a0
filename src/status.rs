use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// How bad a status is. `Failed` means the quantity it is attached to is
/// undefined; it does not abort anything.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Failed,
}

/// A single keyed diagnostic.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    key: String,
    short: String,
    long: String,
    severity: Severity,
    /// Secondary priority, e.g. the number of standard errors that had to be
    /// allowed before a yield window qualified.
    nstderr: Option<u32>,
}

impl Status {
    pub fn new(
        key: impl Into<String>,
        short: impl Into<String>,
        long: impl Into<String>,
        severity: Severity,
    ) -> Self {
        Status {
            key: key.into(),
            short: short.into(),
            long: long.into(),
            severity,
            nstderr: None,
        }
    }

    pub fn with_nstderr(mut self, n: u32) -> Self {
        self.nstderr = Some(n);
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn short_message(&self) -> &str {
        &self.short
    }

    pub fn long_message(&self) -> &str {
        &self.long
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    fn nstderr_level(&self) -> u32 {
        self.nstderr.unwrap_or(0)
    }
}

/// A mergeable collection of [`Status`] diagnostics.
///
/// Aggregating operations (replicate groups, cls series) merge the statuses
/// of their children so that a group-level result still tells which well
/// failed and why. An empty `StatusMessage` means "nothing to report".
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusMessage {
    items: Vec<Status>,
}

impl StatusMessage {
    pub fn new() -> Self {
        StatusMessage::default()
    }

    pub fn single(status: Status) -> Self {
        StatusMessage {
            items: vec![status],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn push(&mut self, status: Status) {
        self.items.push(status);
    }

    /// Merge another status message into this one (union of diagnostics).
    pub fn merge(&mut self, other: &StatusMessage) {
        self.items.extend(other.items.iter().cloned());
    }

    pub fn statuses(&self) -> &[Status] {
        &self.items
    }

    pub fn statuses_with_key(&self, key: &str) -> StatusMessage {
        StatusMessage {
            items: self
                .items
                .iter()
                .filter(|s| s.key == key)
                .cloned()
                .collect(),
        }
    }

    /// Remove all diagnostics with the given key, returning how many were dropped.
    pub fn remove_statuses_with_key(&mut self, key: &str) -> usize {
        let before = self.items.len();
        self.items.retain(|s| s.key != key);
        before - self.items.len()
    }

    /// The highest severity over all diagnostics, `Info` when empty.
    pub fn severity(&self) -> Severity {
        self.items
            .iter()
            .map(|s| s.severity)
            .max()
            .unwrap_or(Severity::Info)
    }

    /// For each key keep only the highest-priority diagnostic
    /// (severity first, then the n-stderr level).
    pub fn by_key(&self) -> BTreeMap<&str, &Status> {
        let mut best: BTreeMap<&str, &Status> = BTreeMap::new();
        for status in &self.items {
            match best.get(status.key.as_str()) {
                Some(existing)
                    if (existing.severity, existing.nstderr_level())
                        >= (status.severity, status.nstderr_level()) => {}
                _ => {
                    best.insert(&status.key, status);
                }
            }
        }
        best
    }

    /// One line per key, highest priority diagnostic each.
    pub fn message(&self) -> String {
        let mut msg = String::new();
        for (key, status) in self.by_key() {
            if !msg.is_empty() {
                msg.push_str("; ");
            }
            msg.push_str(key);
            msg.push(' ');
            if status.severity == Severity::Warning {
                msg.push_str("WARNING ");
            }
            msg.push_str(&status.long);
        }
        msg
    }
}

impl fmt::Display for StatusMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl From<Status> for StatusMessage {
    fn from(status: Status) -> Self {
        StatusMessage::single(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(key: &str, long: &str) -> Status {
        Status::new(key, "short", long, Severity::Failed)
    }

    #[test]
    fn test_empty_status() {
        let status = StatusMessage::new();
        assert!(status.is_empty());
        assert_eq!(status.severity(), Severity::Info);
        assert_eq!(status.message(), "");
    }

    #[test]
    fn test_severity_order() {
        assert!(Severity::Info < Severity::Warning);
        assert!(Severity::Warning < Severity::Failed);
    }

    #[test]
    fn test_merge_keeps_all_items() {
        let mut a = StatusMessage::single(failed("growthyield", "no window"));
        let b = StatusMessage::single(failed("growthrate:", "no mu"));
        a.merge(&b);
        assert_eq!(a.statuses().len(), 2);
        assert_eq!(a.severity(), Severity::Failed);
    }

    #[test]
    fn test_by_key_picks_highest_priority() {
        let mut status = StatusMessage::new();
        status.push(Status::new("k", "s1", "warning msg", Severity::Warning));
        status.push(failed("k", "failed msg"));
        status.push(Status::new("k", "s3", "info msg", Severity::Info));
        let best = status.by_key();
        assert_eq!(best.len(), 1);
        assert_eq!(best["k"].short_message(), "short");
        assert_eq!(best["k"].long_message(), "failed msg");
    }

    #[test]
    fn test_nstderr_breaks_ties() {
        let mut status = StatusMessage::new();
        status.push(Status::new("k", "s", "two stderr", Severity::Warning).with_nstderr(2));
        status.push(Status::new("k", "s", "three stderr", Severity::Warning).with_nstderr(3));
        assert_eq!(status.by_key()["k"].long_message(), "three stderr");
    }

    #[test]
    fn test_message_prefixes_warnings() {
        let status = StatusMessage::single(Status::new(
            "growthyield",
            "growthyield:within2Stderr",
            "slope zero within 2 standard errors",
            Severity::Warning,
        ));
        assert_eq!(
            status.message(),
            "growthyield WARNING slope zero within 2 standard errors"
        );
    }

    #[test]
    fn test_statuses_with_key_filters() {
        let mut status = StatusMessage::new();
        status.push(failed("lag (exp. fit):", "negative"));
        status.push(failed("max. growth rate (exp. fit):", "no mu"));
        let lag = status.statuses_with_key("lag (exp. fit):");
        assert_eq!(lag.statuses().len(), 1);
        assert_eq!(status.remove_statuses_with_key("lag (exp. fit):"), 1);
        assert_eq!(status.statuses().len(), 1);
    }
}
