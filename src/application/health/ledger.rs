//! Bounded record of health issues.

use std::collections::VecDeque;
use std::sync::Mutex;

use metrics::counter;
use tracing::info;

use crate::util::lock::mutex_lock;

use super::{HealthIssue, HealthStatus, Severity};

const SOURCE: &str = "application::health::ledger";

/// Issues in arrival order, capped at `capacity`. At most one unresolved
/// issue exists per `(type, scope)`; a repeat overwrites it in place.
#[derive(Debug)]
pub struct IssueLedger {
    issues: Mutex<VecDeque<HealthIssue>>,
    capacity: usize,
}

impl IssueLedger {
    pub fn new(capacity: usize) -> Self {
        Self {
            issues: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, issue: HealthIssue) {
        counter!(
            "quire_health_issue_total",
            "type" => issue.issue_type.clone(),
            "severity" => issue.severity.as_str()
        )
        .increment(1);

        let mut issues = mutex_lock(&self.issues, SOURCE, "record");
        if let Some(existing) = issues
            .iter_mut()
            .find(|existing| !existing.resolved && existing.same_subject(&issue))
        {
            *existing = issue;
            return;
        }

        issues.push_back(issue);
        while issues.len() > self.capacity {
            issues.pop_front();
        }
    }

    /// Resolve the unresolved issue for `(issue_type, scope)`. Returns whether
    /// one was found.
    pub fn resolve(&self, issue_type: &str, scope: Option<&str>) -> bool {
        let mut issues = mutex_lock(&self.issues, SOURCE, "resolve");
        let found = issues.iter_mut().find(|issue| {
            !issue.resolved && issue.issue_type == issue_type && issue.scope.as_deref() == scope
        });
        match found {
            Some(issue) => {
                issue.resolved = true;
                info!(
                    target = "quire::health",
                    issue_type,
                    scope = scope.unwrap_or(""),
                    "health issue resolved"
                );
                true
            }
            None => false,
        }
    }

    /// Resolve every unresolved issue raised by `check`, except the subject
    /// of `keep`. Returns how many were resolved.
    pub fn resolve_from_check(&self, check: &str, keep: Option<&HealthIssue>) -> usize {
        let mut issues = mutex_lock(&self.issues, SOURCE, "resolve_from_check");
        let mut resolved = 0;
        for issue in issues.iter_mut() {
            if issue.resolved || issue.check.as_deref() != Some(check) {
                continue;
            }
            if keep.is_some_and(|keep| keep.same_subject(issue)) {
                continue;
            }
            issue.resolved = true;
            resolved += 1;
        }
        if resolved > 0 {
            info!(target = "quire::health", check, resolved, "health issues cleared");
        }
        resolved
    }

    /// Derived from unresolved issues; never stored.
    pub fn status(&self) -> HealthStatus {
        let issues = mutex_lock(&self.issues, SOURCE, "status");
        let worst = issues
            .iter()
            .filter(|issue| !issue.resolved)
            .map(|issue| issue.severity)
            .max();
        match worst {
            Some(Severity::Critical) => HealthStatus::Critical,
            Some(Severity::Warning) => HealthStatus::Warning,
            Some(Severity::Info) | None => HealthStatus::Healthy,
        }
    }

    pub fn snapshot(&self) -> Vec<HealthIssue> {
        mutex_lock(&self.issues, SOURCE, "snapshot")
            .iter()
            .cloned()
            .collect()
    }

    pub fn unresolved(&self) -> usize {
        mutex_lock(&self.issues, SOURCE, "unresolved")
            .iter()
            .filter(|issue| !issue.resolved)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue(issue_type: &str, severity: Severity, scope: Option<&str>) -> HealthIssue {
        let issue = HealthIssue::new(issue_type, severity, format!("{issue_type} problem"));
        match scope {
            Some(scope) => issue.scoped(scope),
            None => issue,
        }
    }

    #[test]
    fn repeats_overwrite_instead_of_accumulating() {
        let ledger = IssueLedger::new(100);
        for attempt in 0..10 {
            let mut repeat = issue("connectivity", Severity::Critical, None);
            repeat.message = format!("attempt {attempt}");
            ledger.record(repeat);
        }

        let issues = ledger.snapshot();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].message, "attempt 9");
    }

    #[test]
    fn scope_is_part_of_identity() {
        let ledger = IssueLedger::new(100);
        ledger.record(issue("configuration", Severity::Critical, Some("posts")));
        ledger.record(issue("configuration", Severity::Critical, Some("users")));
        assert_eq!(ledger.unresolved(), 2);

        assert!(ledger.resolve("configuration", Some("posts")));
        assert!(!ledger.resolve("configuration", Some("posts")));
        assert_eq!(ledger.unresolved(), 1);
    }

    #[test]
    fn resolved_issues_stay_as_history() {
        let ledger = IssueLedger::new(100);
        ledger.record(issue("resource", Severity::Warning, None));
        ledger.resolve("resource", None);
        ledger.record(issue("resource", Severity::Warning, None));

        let issues = ledger.snapshot();
        assert_eq!(issues.len(), 2);
        assert!(issues[0].resolved);
        assert!(!issues[1].resolved);
    }

    #[test]
    fn status_reflects_worst_unresolved() {
        let ledger = IssueLedger::new(100);
        assert_eq!(ledger.status(), HealthStatus::Healthy);

        ledger.record(issue("info", Severity::Info, None));
        assert_eq!(ledger.status(), HealthStatus::Healthy);

        ledger.record(issue("performance", Severity::Warning, None));
        assert_eq!(ledger.status(), HealthStatus::Warning);

        ledger.record(issue("connectivity", Severity::Critical, None));
        assert_eq!(ledger.status(), HealthStatus::Critical);

        ledger.resolve("connectivity", None);
        assert_eq!(ledger.status(), HealthStatus::Warning);
    }

    #[test]
    fn capacity_evicts_oldest() {
        let ledger = IssueLedger::new(3);
        for n in 0..5 {
            ledger.record(issue("configuration", Severity::Critical, Some(&format!("db{n}"))));
        }
        let scopes: Vec<_> = ledger
            .snapshot()
            .into_iter()
            .filter_map(|issue| issue.scope)
            .collect();
        assert_eq!(scopes, ["db2", "db3", "db4"]);
    }

    #[test]
    fn check_runs_supersede_their_own_issues() {
        let ledger = IssueLedger::new(100);
        ledger.record(issue("connectivity", Severity::Critical, None).from_check("store"));
        ledger.record(issue("resource", Severity::Warning, None).from_check("pool"));

        let slow = issue("performance", Severity::Warning, None).from_check("store");
        assert_eq!(ledger.resolve_from_check("store", Some(&slow)), 1);
        ledger.record(slow);

        assert_eq!(ledger.status(), HealthStatus::Warning);
        assert_eq!(ledger.resolve_from_check("store", None), 1);
        assert_eq!(ledger.unresolved(), 1);
    }
}
