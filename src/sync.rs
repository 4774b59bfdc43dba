//! Issue-sync engine: validation of client-pushed records, status-change
//! detection primitives, and the "ready" dependency closure.
//!
//! The client-side tracker is the authority; the server mirrors records
//! keyed by `(project_id, bead_id)` and reacts to transitions.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, SecondsFormat, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

use crate::types::{BeadRef, Issue};

pub const DEFAULT_BRANCH: &str = "main";
pub const MAX_BEAD_ID_LEN: usize = 64;

/// One claim row as reported by the client; the snapshot is authoritative
/// for the syncing workspace.
#[derive(Debug, Clone, Deserialize)]
pub struct ClaimSnapshotEntry {
    pub bead_id: String,
    #[serde(default)]
    pub apex_bead_id: Option<String>,
}

/// A detected `old -> new` status transition.
#[derive(Debug, Clone, Serialize)]
pub struct StatusChange {
    pub bead_id: String,
    pub repo: String,
    pub old_status: Option<String>,
    pub new_status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub changed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncOutcome {
    pub received: usize,
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    #[serde(skip)]
    pub status_changes: Vec<StatusChange>,
    pub notifications_queued: usize,
}

/// NFC-normalise and trim a synced string field.
pub fn normalize_text(s: &str) -> String {
    s.trim().nfc().collect()
}

/// Round to microsecond precision; sub-microsecond digits never survive a
/// round-trip through the store.
pub fn round_to_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    let micros = ts.nanosecond() / 1_000;
    ts.with_nanosecond(micros * 1_000).unwrap_or(ts)
}

/// Retry-dedupe fingerprint for one status transition.
pub fn status_change_fingerprint(change: &StatusChange) -> String {
    let mut hasher = Sha256::new();
    hasher.update(change.bead_id.as_bytes());
    hasher.update(b"|");
    hasher.update(change.old_status.as_deref().unwrap_or("").as_bytes());
    hasher.update(b"|");
    hasher.update(change.new_status.as_bytes());
    hasher.update(b"|");
    hasher.update(
        change
            .changed_at
            .to_rfc3339_opts(SecondsFormat::Micros, true)
            .as_bytes(),
    );
    hex_digest(hasher)
}

fn hex_digest(hasher: Sha256) -> String {
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

pub fn is_valid_bead_id(id: &str) -> bool {
    if id.is_empty() || id.len() > MAX_BEAD_ID_LEN {
        return false;
    }
    let mut chars = id.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':'))
}

fn parse_bead_ref(value: &Value) -> Result<BeadRef, String> {
    let obj = value
        .as_object()
        .ok_or_else(|| "reference must be an object".to_string())?;
    let repo = obj
        .get("repo")
        .and_then(Value::as_str)
        .ok_or_else(|| "reference missing repo".to_string())?;
    let branch = obj
        .get("branch")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_BRANCH);
    let bead_id = obj
        .get("bead_id")
        .and_then(Value::as_str)
        .ok_or_else(|| "reference missing bead_id".to_string())?;
    if !is_valid_bead_id(bead_id) {
        return Err(format!("invalid bead_id in reference: {bead_id}"));
    }
    Ok(BeadRef {
        repo: repo.to_string(),
        branch: branch.to_string(),
        bead_id: bead_id.to_string(),
    })
}

fn parse_timestamp(obj: &serde_json::Map<String, Value>, key: &str) -> Option<DateTime<Utc>> {
    obj.get(key)
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|dt| round_to_micros(dt.with_timezone(&Utc)))
}

/// Validate one JSONL record into an [`Issue`]. String fields are
/// NFC-normalised and trimmed; labels are deduplicated; malformed
/// `blocked_by`/`parent` tuples reject the record.
pub fn issue_from_record(
    project_id: &str,
    record: &serde_json::Map<String, Value>,
    default_repo: &str,
    now: DateTime<Utc>,
) -> Result<Issue, String> {
    let bead_id = record
        .get("id")
        .or_else(|| record.get("bead_id"))
        .and_then(Value::as_str)
        .ok_or_else(|| "record missing id".to_string())?;
    if !is_valid_bead_id(bead_id) {
        let shown: String = bead_id.chars().take(80).collect();
        return Err(format!("invalid bead id: {shown}"));
    }

    let status = record
        .get("status")
        .and_then(Value::as_str)
        .map(normalize_text)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "open".to_string());

    let priority = record
        .get("priority")
        .and_then(Value::as_i64)
        .unwrap_or(2);

    let mut labels: Vec<String> = Vec::new();
    if let Some(raw) = record.get("labels") {
        let items = raw
            .as_array()
            .ok_or_else(|| "labels must be an array".to_string())?;
        let mut seen = HashSet::new();
        for item in items {
            let label = item
                .as_str()
                .ok_or_else(|| "labels must be strings".to_string())?;
            let label = normalize_text(label);
            if !label.is_empty() && seen.insert(label.clone()) {
                labels.push(label);
            }
        }
    }

    let mut blocked_by = Vec::new();
    if let Some(raw) = record.get("blocked_by") {
        let items = raw
            .as_array()
            .ok_or_else(|| "blocked_by must be an array".to_string())?;
        for item in items {
            blocked_by.push(parse_bead_ref(item)?);
        }
    }

    let parent = match record.get("parent") {
        Some(Value::Null) | None => None,
        Some(raw) => Some(parse_bead_ref(raw)?),
    };

    let text = |key: &str| {
        record
            .get(key)
            .and_then(Value::as_str)
            .map(normalize_text)
            .unwrap_or_default()
    };
    let opt_text = |key: &str| {
        record
            .get(key)
            .and_then(Value::as_str)
            .map(normalize_text)
            .filter(|s| !s.is_empty())
    };

    Ok(Issue {
        project_id: project_id.to_string(),
        bead_id: bead_id.to_string(),
        repo: record
            .get("repo")
            .and_then(Value::as_str)
            .map(normalize_text)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| default_repo.to_string()),
        branch: record
            .get("branch")
            .and_then(Value::as_str)
            .map(normalize_text)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_BRANCH.to_string()),
        title: text("title"),
        description: text("description"),
        status,
        priority,
        issue_type: opt_text("type").or_else(|| opt_text("issue_type")),
        assignee: opt_text("assignee"),
        created_by: opt_text("created_by"),
        labels,
        blocked_by,
        parent,
        created_at: parse_timestamp(record, "created_at"),
        updated_at: parse_timestamp(record, "updated_at").or(Some(round_to_micros(now))),
    })
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Visiting,
    Ready,
    Blocked,
}

/// Compute the ready set: open issues whose transitive blocker closure
/// contains nothing `open`/`in_progress`. Blockers missing from the mirror
/// block (they may simply not be synced yet), and any dependency cycle
/// makes every bead on it not-ready.
pub fn ready_issues<'a>(
    issues: &'a [Issue],
    repo: Option<&str>,
    branch: Option<&str>,
    limit: usize,
) -> Vec<&'a Issue> {
    let by_id: HashMap<&str, &Issue> = issues.iter().map(|i| (i.bead_id.as_str(), i)).collect();
    let mut marks: HashMap<&str, Mark> = HashMap::new();

    fn closure_clear<'a>(
        bead_id: &'a str,
        by_id: &HashMap<&'a str, &'a Issue>,
        marks: &mut HashMap<&'a str, Mark>,
    ) -> bool {
        match marks.get(bead_id) {
            Some(Mark::Visiting) => return false, // cycle
            Some(Mark::Ready) => return true,
            Some(Mark::Blocked) => return false,
            None => {}
        }
        let Some(&issue) = by_id.get(bead_id) else {
            return false;
        };
        marks.insert(issue.bead_id.as_str(), Mark::Visiting);
        let mut clear = true;
        for blocker in &issue.blocked_by {
            let Some(&target) = by_id.get(blocker.bead_id.as_str()) else {
                clear = false;
                break;
            };
            if target.status == "open" || target.status == "in_progress" {
                clear = false;
                break;
            }
            if !closure_clear(target.bead_id.as_str(), by_id, marks) {
                clear = false;
                break;
            }
        }
        marks.insert(
            issue.bead_id.as_str(),
            if clear { Mark::Ready } else { Mark::Blocked },
        );
        clear
    }

    let mut ready: Vec<&Issue> = issues
        .iter()
        .filter(|i| i.status == "open")
        .filter(|i| repo.is_none_or(|r| i.repo == r))
        .filter(|i| branch.is_none_or(|b| i.branch == b))
        .filter(|i| {
            i.blocked_by.iter().all(|blocker| {
                by_id
                    .get(blocker.bead_id.as_str())
                    .is_some_and(|&target| {
                        target.status != "open"
                            && target.status != "in_progress"
                            && closure_clear(target.bead_id.as_str(), &by_id, &mut marks)
                    })
            })
        })
        .collect();

    ready.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then_with(|| a.bead_id.cmp(&b.bead_id))
    });
    ready.truncate(limit);
    ready
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(v: Value) -> serde_json::Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    fn issue(id: &str, status: &str, blocked_by: &[&str]) -> Issue {
        Issue {
            project_id: "p1".to_string(),
            bead_id: id.to_string(),
            repo: "github.com/acme/widgets".to_string(),
            branch: DEFAULT_BRANCH.to_string(),
            title: String::new(),
            description: String::new(),
            status: status.to_string(),
            priority: 2,
            issue_type: None,
            assignee: None,
            created_by: None,
            labels: Vec::new(),
            blocked_by: blocked_by
                .iter()
                .map(|b| BeadRef {
                    repo: "github.com/acme/widgets".to_string(),
                    branch: DEFAULT_BRANCH.to_string(),
                    bead_id: b.to_string(),
                })
                .collect(),
            parent: None,
            created_at: None,
            updated_at: None,
        }
    }

    #[test]
    fn record_defaults_and_normalisation() {
        let rec = record(json!({
            "id": "bd-1",
            "title": "  fix\u{0065}\u{0301}  ",
            "labels": ["a", "a", "b"]
        }));
        let issue = issue_from_record("p1", &rec, "github.com/acme/widgets", Utc::now()).unwrap();
        assert_eq!(issue.status, "open");
        assert_eq!(issue.priority, 2);
        assert_eq!(issue.title, "fix\u{00e9}");
        assert_eq!(issue.labels, vec!["a", "b"]);
    }

    #[test]
    fn malformed_blocker_rejects_record() {
        let rec = record(json!({
            "id": "bd-1",
            "blocked_by": [{"repo": "r"}]
        }));
        assert!(issue_from_record("p1", &rec, "r", Utc::now()).is_err());
    }

    #[test]
    fn bead_id_limits() {
        assert!(is_valid_bead_id("bd-12"));
        assert!(is_valid_bead_id("repo:bd-12"));
        assert!(!is_valid_bead_id(""));
        assert!(!is_valid_bead_id("-leading"));
        assert!(!is_valid_bead_id(&"x".repeat(MAX_BEAD_ID_LEN + 1)));
    }

    #[test]
    fn fingerprint_is_stable() {
        let change = StatusChange {
            bead_id: "bd-42".to_string(),
            repo: "r".to_string(),
            old_status: Some("open".to_string()),
            new_status: "in_progress".to_string(),
            title: None,
            changed_at: DateTime::parse_from_rfc3339("2026-01-02T03:04:05.123456Z")
                .unwrap()
                .with_timezone(&Utc),
        };
        assert_eq!(
            status_change_fingerprint(&change),
            status_change_fingerprint(&change.clone())
        );
    }

    #[test]
    fn ready_respects_open_blockers() {
        let issues = vec![
            issue("a", "open", &["b"]),
            issue("b", "open", &[]),
            issue("c", "open", &[]),
        ];
        let ready: Vec<&str> = ready_issues(&issues, None, None, 10)
            .iter()
            .map(|i| i.bead_id.as_str())
            .collect();
        assert_eq!(ready, vec!["b", "c"]);
    }

    #[test]
    fn closed_blockers_unblock() {
        let issues = vec![issue("a", "open", &["b"]), issue("b", "closed", &[])];
        let ready: Vec<&str> = ready_issues(&issues, None, None, 10)
            .iter()
            .map(|i| i.bead_id.as_str())
            .collect();
        assert_eq!(ready, vec!["a"]);
    }

    #[test]
    fn missing_blocker_blocks() {
        let issues = vec![issue("a", "open", &["ghost"])];
        assert!(ready_issues(&issues, None, None, 10).is_empty());
    }

    #[test]
    fn cycles_are_never_ready() {
        // a depends on b, b on c, c on b: the b<->c cycle poisons a even
        // though every node is individually closed except a.
        let issues = vec![
            issue("a", "open", &["b"]),
            issue("b", "closed", &["c"]),
            issue("c", "closed", &["b"]),
        ];
        assert!(ready_issues(&issues, None, None, 10).is_empty());
    }

    #[test]
    fn micros_rounding_truncates_nanos() {
        let ts = DateTime::parse_from_rfc3339("2026-01-02T03:04:05.123456789Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(round_to_micros(ts).nanosecond(), 123_456_000);
    }
}
