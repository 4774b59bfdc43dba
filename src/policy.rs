//! Policy defaults and bootstrap.
//!
//! The default invariants and role playbooks ship as markdown assets
//! embedded at build time. Resetting a project to defaults snapshots the
//! current default bundle into a new version through the normal create
//! path; hot reload re-reads the assets from disk into the in-memory
//! snapshot.

use std::path::Path;
use std::sync::RwLock;

use chrono::Utc;
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::store::Store;
use crate::types::{Invariant, Policy, PolicyBundle, RolePlaybook};

const EMBEDDED_INVARIANTS: &[(&str, &str)] = &[
    (
        "claim-before-work",
        include_str!("../assets/policy/invariants/claim-before-work.md"),
    ),
    (
        "reserve-files",
        include_str!("../assets/policy/invariants/reserve-files.md"),
    ),
    (
        "communicate-status",
        include_str!("../assets/policy/invariants/communicate-status.md"),
    ),
];

const EMBEDDED_ROLES: &[(&str, &str)] = &[
    (
        "implementer",
        include_str!("../assets/policy/roles/implementer.md"),
    ),
    ("reviewer", include_str!("../assets/policy/roles/reviewer.md")),
    (
        "coordinator",
        include_str!("../assets/policy/roles/coordinator.md"),
    ),
];

/// Split a markdown asset into its `# Title` heading and body.
fn parse_markdown_asset(raw: &str) -> (String, String) {
    let mut title = String::new();
    let mut body_lines = Vec::new();
    for line in raw.lines() {
        if title.is_empty() {
            if let Some(heading) = line.strip_prefix("# ") {
                title = heading.trim().to_string();
                continue;
            }
        }
        body_lines.push(line);
    }
    (title, body_lines.join("\n").trim().to_string())
}

fn bundle_from_assets(invariants: &[(String, String)], roles: &[(String, String)]) -> PolicyBundle {
    let mut bundle = PolicyBundle::default();
    for (id, raw) in invariants {
        let (title, body_md) = parse_markdown_asset(raw);
        bundle.invariants.push(Invariant {
            id: id.clone(),
            title,
            body_md,
        });
    }
    for (key, raw) in roles {
        let (title, playbook_md) = parse_markdown_asset(raw);
        bundle
            .roles
            .insert(key.clone(), RolePlaybook { title, playbook_md });
    }
    bundle
}

/// The default bundle compiled into the binary.
pub fn embedded_default_bundle() -> PolicyBundle {
    let invariants: Vec<(String, String)> = EMBEDDED_INVARIANTS
        .iter()
        .map(|(id, raw)| (id.to_string(), raw.to_string()))
        .collect();
    let roles: Vec<(String, String)> = EMBEDDED_ROLES
        .iter()
        .map(|(id, raw)| (id.to_string(), raw.to_string()))
        .collect();
    bundle_from_assets(&invariants, &roles)
}

fn read_dir_assets(dir: &Path) -> Result<Vec<(String, String)>> {
    let mut assets = Vec::new();
    if !dir.is_dir() {
        return Ok(assets);
    }
    let mut entries: Vec<_> = std::fs::read_dir(dir)?.collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("md") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        assets.push((stem.to_string(), std::fs::read_to_string(&path)?));
    }
    Ok(assets)
}

/// Load a bundle from an on-disk asset directory laid out like
/// `assets/policy/{invariants,roles}/*.md`.
pub fn load_bundle_from_dir(dir: &Path) -> Result<PolicyBundle> {
    let invariants = read_dir_assets(&dir.join("invariants"))?;
    let roles = read_dir_assets(&dir.join("roles"))?;
    Ok(bundle_from_assets(&invariants, &roles))
}

/// The live default-bundle snapshot, read once at startup and replaceable
/// via hot reload.
pub struct PolicyDefaults {
    bundle: RwLock<PolicyBundle>,
}

impl Default for PolicyDefaults {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyDefaults {
    pub fn new() -> Self {
        Self {
            bundle: RwLock::new(embedded_default_bundle()),
        }
    }

    pub fn snapshot(&self) -> PolicyBundle {
        self.bundle.read().expect("policy defaults lock").clone()
    }

    /// Re-read assets from disk. Falls back to the embedded bundle when the
    /// directory yields nothing.
    pub fn reload_from_disk(&self, dir: &Path) -> Result<PolicyBundle> {
        let loaded = load_bundle_from_dir(dir)?;
        let fresh = if loaded.invariants.is_empty() && loaded.roles.is_empty() {
            embedded_default_bundle()
        } else {
            loaded
        };
        *self.bundle.write().expect("policy defaults lock") = fresh.clone();
        Ok(fresh)
    }
}

/// Fetch the active policy, bootstrapping version 1 from the defaults for
/// projects that have none yet.
pub fn get_or_bootstrap_active(
    store: &dyn Store,
    defaults: &PolicyDefaults,
    project_id: &str,
) -> Result<Policy> {
    if let Some(policy) = store.get_active_policy(project_id)? {
        return Ok(policy);
    }
    tracing::info!(project_id, "bootstrapping default policy");
    let (policy, _created) =
        store.create_policy_version(project_id, &defaults.snapshot(), None, None, Utc::now())?;
    store.activate_policy(project_id, &policy.policy_id)?;
    Ok(policy)
}

/// Strong ETag over `(policy_id, updated_at)` for conditional GETs.
pub fn policy_etag(policy: &Policy) -> String {
    let mut hasher = Sha256::new();
    hasher.update(policy.policy_id.as_bytes());
    hasher.update(b":");
    hasher.update(policy.updated_at.to_rfc3339().as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        out.push_str(&format!("{byte:02x}"));
    }
    format!("\"{out}\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use crate::types::{Project, Visibility};
    use uuid::Uuid;

    #[test]
    fn embedded_bundle_has_content() {
        let bundle = embedded_default_bundle();
        assert_eq!(bundle.invariants.len(), 3);
        assert_eq!(bundle.roles.len(), 3);
        let invariant = bundle
            .invariants
            .iter()
            .find(|i| i.id == "claim-before-work")
            .unwrap();
        assert_eq!(invariant.title, "Claim before you work");
        assert!(!invariant.body_md.is_empty());
        assert!(bundle.roles.contains_key("implementer"));
    }

    #[test]
    fn markdown_parsing_splits_title_and_body() {
        let (title, body) = parse_markdown_asset("# Hello\n\nBody text\nmore\n");
        assert_eq!(title, "Hello");
        assert_eq!(body, "Body text\nmore");
    }

    #[test]
    fn bootstrap_creates_and_activates_version_one() {
        let store = SqliteStore::in_memory().unwrap();
        store.initialize().unwrap();
        let now = Utc::now();
        let project = Project {
            id: Uuid::new_v4().to_string(),
            tenant_id: None,
            slug: "demo".to_string(),
            visibility: Visibility::Private,
            active_policy_id: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        store.create_project(&project).unwrap();

        let defaults = PolicyDefaults::new();
        let policy = get_or_bootstrap_active(&store, &defaults, &project.id).unwrap();
        assert_eq!(policy.version, 1);

        // Second call returns the same policy without a new version.
        let again = get_or_bootstrap_active(&store, &defaults, &project.id).unwrap();
        assert_eq!(again.policy_id, policy.policy_id);
    }

    #[test]
    fn etag_changes_with_policy_identity() {
        let now = Utc::now();
        let policy = Policy {
            policy_id: "a".to_string(),
            project_id: "p".to_string(),
            version: 1,
            bundle: PolicyBundle::default(),
            created_by_workspace_id: None,
            created_at: now,
            updated_at: now,
        };
        let mut other = policy.clone();
        other.policy_id = "b".to_string();
        assert_ne!(policy_etag(&policy), policy_etag(&other));
        assert!(policy_etag(&policy).starts_with('"'));
    }
}
