use serde::Serialize;
use std::collections::BTreeMap;

/// A recorded mark for one component: either a numeric score or the PAT
/// override. The legacy wire forms `-1` and `"PAT"` both map to `PatOverride`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Mark {
    Numeric(f64),
    PatOverride,
}

impl Mark {
    pub fn from_wire(v: &serde_json::Value) -> Option<Mark> {
        if let Some(s) = v.as_str() {
            if s.eq_ignore_ascii_case("PAT") {
                return Some(Mark::PatOverride);
            }
            return None;
        }
        let n = v.as_f64()?;
        if n == -1.0 {
            return Some(Mark::PatOverride);
        }
        if n < 0.0 {
            return None;
        }
        Some(Mark::Numeric(n))
    }

    pub fn to_wire(self) -> serde_json::Value {
        match self {
            Mark::Numeric(v) => serde_json::json!(v),
            Mark::PatOverride => serde_json::json!("PAT"),
        }
    }
}

/// In-memory snapshot of one student's entry for one review.
#[derive(Debug, Clone, Default)]
pub struct ReviewEntry {
    pub marks: BTreeMap<String, Mark>,
    pub comments: String,
    pub attendance_value: bool,
    pub attendance_locked: bool,
    pub locked: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewStatus {
    Completed,
    Partial,
    Available,
    Locked,
    None,
}

impl ReviewStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReviewStatus::Completed => "completed",
            ReviewStatus::Partial => "partial",
            ReviewStatus::Available => "available",
            ReviewStatus::Locked => "locked",
            ReviewStatus::None => "none",
        }
    }
}

/// Sum of numeric marks; a PAT override contributes 0.
pub fn compute_total(entry: &ReviewEntry) -> f64 {
    entry
        .marks
        .values()
        .map(|m| match m {
            Mark::Numeric(v) => *v,
            Mark::PatOverride => 0.0,
        })
        .sum()
}

/// Same exclusion rule as `compute_total`. The two figures are reported
/// separately because the product labels them separately; a divergent
/// PAT-adjustment rule would land here.
pub fn pat_adjusted_total(entry: &ReviewEntry) -> f64 {
    compute_total(entry)
}

pub fn contains_pat(entry: &ReviewEntry) -> bool {
    entry.marks.values().any(|m| *m == Mark::PatOverride)
}

/// Status precedence: completed > partial > available > locked.
/// Callers report `ReviewStatus::None` themselves when no entry exists.
pub fn derive_status(entry: &ReviewEntry) -> ReviewStatus {
    if entry.locked && has_marks(entry) && entry.attendance_value {
        return ReviewStatus::Completed;
    }
    if has_marks(entry) || has_comments(entry) {
        return ReviewStatus::Partial;
    }
    if !entry.locked {
        return ReviewStatus::Available;
    }
    ReviewStatus::Locked
}

pub fn is_locked(entry: &ReviewEntry) -> bool {
    entry.locked
}

pub fn is_unlocked(entry: &ReviewEntry) -> bool {
    !entry.locked
}

pub fn has_marks(entry: &ReviewEntry) -> bool {
    !entry.marks.is_empty()
}

pub fn no_marks(entry: &ReviewEntry) -> bool {
    entry.marks.is_empty()
}

pub fn has_comments(entry: &ReviewEntry) -> bool {
    !entry.comments.trim().is_empty()
}

pub fn no_comments(entry: &ReviewEntry) -> bool {
    entry.comments.trim().is_empty()
}

pub fn attended(entry: &ReviewEntry) -> bool {
    entry.attendance_value
}

pub fn not_attended(entry: &ReviewEntry) -> bool {
    !entry.attendance_value
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_with_marks(pairs: &[(&str, Mark)]) -> ReviewEntry {
        let mut entry = ReviewEntry::default();
        for (name, mark) in pairs {
            entry.marks.insert(name.to_string(), *mark);
        }
        entry
    }

    #[test]
    fn wire_sentinels_map_to_pat_override() {
        assert_eq!(
            Mark::from_wire(&serde_json::json!(-1)),
            Some(Mark::PatOverride)
        );
        assert_eq!(
            Mark::from_wire(&serde_json::json!("PAT")),
            Some(Mark::PatOverride)
        );
        assert_eq!(
            Mark::from_wire(&serde_json::json!("pat")),
            Some(Mark::PatOverride)
        );
        assert_eq!(
            Mark::from_wire(&serde_json::json!(12.5)),
            Some(Mark::Numeric(12.5))
        );
        assert_eq!(Mark::from_wire(&serde_json::json!(-3)), None);
        assert_eq!(Mark::from_wire(&serde_json::json!("absent")), None);
    }

    #[test]
    fn totals_exclude_pat_marks() {
        let entry = entry_with_marks(&[
            ("a", Mark::Numeric(10.0)),
            ("b", Mark::PatOverride),
            ("c", Mark::Numeric(5.0)),
        ]);
        assert_eq!(compute_total(&entry), 15.0);
        // Current product behavior: the adjusted figure uses the same rule.
        assert_eq!(pat_adjusted_total(&entry), 15.0);
        assert!(contains_pat(&entry));
    }

    #[test]
    fn status_completed_requires_lock_marks_and_attendance() {
        let mut entry = entry_with_marks(&[("a", Mark::Numeric(5.0))]);
        entry.locked = true;
        entry.attendance_value = true;
        assert_eq!(derive_status(&entry), ReviewStatus::Completed);
    }

    #[test]
    fn status_available_on_empty_unlocked_entry() {
        let entry = ReviewEntry::default();
        assert_eq!(derive_status(&entry), ReviewStatus::Available);
    }

    #[test]
    fn status_partial_on_marks_without_lock() {
        let entry = entry_with_marks(&[("a", Mark::Numeric(3.0))]);
        assert_eq!(derive_status(&entry), ReviewStatus::Partial);
    }

    #[test]
    fn status_partial_on_comment_only() {
        let mut entry = ReviewEntry::default();
        entry.comments = "  needs another iteration  ".to_string();
        assert_eq!(derive_status(&entry), ReviewStatus::Partial);
    }

    #[test]
    fn status_locked_fallback_without_marks() {
        let mut entry = ReviewEntry::default();
        entry.locked = true;
        assert_eq!(derive_status(&entry), ReviewStatus::Locked);
    }

    #[test]
    fn locked_with_marks_but_absent_is_partial_not_completed() {
        let mut entry = entry_with_marks(&[("a", Mark::Numeric(8.0))]);
        entry.locked = true;
        entry.attendance_value = false;
        assert_eq!(derive_status(&entry), ReviewStatus::Partial);
    }

    #[test]
    fn predicates_are_independent() {
        let mut entry = entry_with_marks(&[("a", Mark::Numeric(1.0))]);
        entry.comments = "ok".to_string();
        entry.attendance_value = true;
        assert!(is_unlocked(&entry));
        assert!(!is_locked(&entry));
        assert!(has_marks(&entry));
        assert!(!no_marks(&entry));
        assert!(has_comments(&entry));
        assert!(!no_comments(&entry));
        assert!(attended(&entry));
        assert!(!not_attended(&entry));
    }

    #[test]
    fn whitespace_comment_counts_as_empty() {
        let mut entry = ReviewEntry::default();
        entry.comments = "   ".to_string();
        assert!(no_comments(&entry));
        assert_eq!(derive_status(&entry), ReviewStatus::Available);
    }
}
