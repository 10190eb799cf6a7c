//! Pattern manager: reconciles the served-pattern set against generated
//! policy files.
//!
//! Every pass rebuilds the entry map from the served set, deletes entries
//! (and their files) that are no longer served, and creates or regenerates
//! policy files for defined patterns using content-addressed change
//! detection. The policy directory is owned exclusively by this component.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;

use agbot_common::crypto::Hash;
use agbot_common::pattern::{Pattern, PatternWorkload, ServedPattern};
use agbot_common::policy::{
    AgreementProtocol, Policy, PolicyHeader, Workload, PROTOCOL_VERSION_1,
};
use agbot_common::time::{get_current_time_in_seconds, TimestampSeconds};

use crate::config::{DEFAULT_PROTOCOL, POLICY_FILE_EXT};
use crate::error::BotError;

/// One served pattern the manager has materialized.
#[derive(Clone, Debug)]
pub struct PatternEntry {
    pub pattern: Pattern,
    pub hash: Hash,
    pub updated_at: TimestampSeconds,
    pub policy_filenames: Vec<PathBuf>,
}

/// What one reconciliation pass did. A pass over unchanged input reports
/// zero writes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
    pub files_written: usize,
    pub files_removed: usize,
}

pub struct PatternManager {
    policy_dir: PathBuf,
    entries: IndexMap<(String, String), Option<PatternEntry>>,
}

impl PatternManager {
    pub fn new(policy_dir: &Path) -> Result<Self, BotError> {
        fs::create_dir_all(policy_dir)?;
        Ok(Self {
            policy_dir: policy_dir.to_path_buf(),
            entries: IndexMap::new(),
        })
    }

    /// Entry for one `(org, patternId)`, if materialized.
    pub fn entry(&self, org: &str, pattern_id: &str) -> Option<&PatternEntry> {
        self.entries
            .get(&(org.to_string(), pattern_id.to_string()))
            .and_then(|e| e.as_ref())
    }

    /// Run one reconciliation pass against the served set and the defined
    /// patterns fetched from the exchange (per org).
    pub fn reconcile(
        &mut self,
        served: &[ServedPattern],
        defined: &HashMap<String, HashMap<String, Pattern>>,
    ) -> Result<ReconcileStats, BotError> {
        let mut stats = ReconcileStats::default();

        // Rebuild the map from the served set, transferring existing
        // entries unchanged and marking new ones unmaterialized.
        let mut next: IndexMap<(String, String), Option<PatternEntry>> = IndexMap::new();
        for sp in served {
            let key = (sp.org.clone(), sp.pattern.clone());
            let transferred = self.entries.shift_remove(&key).flatten();
            next.entry(key).or_insert(transferred);
        }

        // Whatever was not transferred is no longer served: delete it and
        // its policy files. Filesystem errors here are logged, not fatal;
        // the next pass repairs the on-disk set.
        for ((org, pattern_id), entry) in self.entries.drain(..) {
            if let Some(entry) = entry {
                stats.files_removed += remove_files(&entry.policy_filenames);
            }
            debug!("pattern {}/{} no longer served", org, pattern_id);
            stats.deleted += 1;
        }
        self.entries = next;

        // Materialize or refresh entries for every defined pattern.
        let keys: Vec<(String, String)> = self.entries.keys().cloned().collect();
        for key in keys {
            let (org, pattern_id) = &key;
            let Some(pattern) = defined.get(org).and_then(|m| m.get(pattern_id)) else {
                continue;
            };
            let hash = pattern.fingerprint()?;

            match self.entries.get(&key).and_then(|e| e.as_ref()) {
                None => {
                    let filenames =
                        self.write_policy_files(org, pattern_id, pattern, &mut stats)?;
                    info!("pattern {}/{} materialized", org, pattern_id);
                    self.entries.insert(
                        key.clone(),
                        Some(PatternEntry {
                            pattern: pattern.clone(),
                            hash,
                            updated_at: get_current_time_in_seconds(),
                            policy_filenames: filenames,
                        }),
                    );
                    stats.created += 1;
                }
                Some(entry) if entry.hash == hash => {
                    stats.unchanged += 1;
                }
                Some(entry) => {
                    // Changed: drop the old files, then regenerate. If
                    // generation fails the pass aborts with the entry left
                    // in its pre-update state.
                    stats.files_removed += remove_files(&entry.policy_filenames);
                    let filenames =
                        self.write_policy_files(org, pattern_id, pattern, &mut stats)?;
                    info!("pattern {}/{} changed, policies regenerated", org, pattern_id);
                    self.entries.insert(
                        key.clone(),
                        Some(PatternEntry {
                            pattern: pattern.clone(),
                            hash,
                            updated_at: get_current_time_in_seconds(),
                            policy_filenames: filenames,
                        }),
                    );
                    stats.updated += 1;
                }
            }
        }

        Ok(stats)
    }

    fn write_policy_files(
        &self,
        org: &str,
        pattern_id: &str,
        pattern: &Pattern,
        stats: &mut ReconcileStats,
    ) -> Result<Vec<PathBuf>, BotError> {
        let mut filenames = Vec::with_capacity(pattern.workloads.len());
        for workload in &pattern.workloads {
            let policy = policy_for_workload(org, pattern_id, pattern, workload);
            let path = self.policy_dir.join(policy_file_name(
                org,
                pattern_id,
                &policy.header.name,
            ));
            let rendered = serde_json::to_string_pretty(&policy)?;
            fs::write(&path, rendered)?;
            stats.files_written += 1;
            filenames.push(path);
        }
        Ok(filenames)
    }
}

fn remove_files(paths: &[PathBuf]) -> usize {
    let mut removed = 0;
    for path in paths {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => warn!("could not remove policy file {}: {}", path.display(), e),
        }
    }
    removed
}

/// Generate the policy document offered for one workload of a pattern.
fn policy_for_workload(
    org: &str,
    pattern_id: &str,
    pattern: &Pattern,
    workload: &PatternWorkload,
) -> Policy {
    let protocols = if pattern.agreement_protocols.is_empty() {
        vec![AgreementProtocol {
            name: DEFAULT_PROTOCOL.to_string(),
            protocol_version: PROTOCOL_VERSION_1,
            blockchains: Vec::new(),
        }]
    } else {
        pattern.agreement_protocols.clone()
    };
    Policy {
        header: PolicyHeader {
            name: format!("{} {}", pattern_id, workload_basename(&workload.workload_url)),
            version: "1.0".to_string(),
        },
        pattern_id: format!("{}/{}", org, pattern_id),
        agreement_protocols: protocols,
        data_verification: pattern.data_verification.clone(),
        metering: pattern.metering.clone(),
        workloads: vec![Workload {
            url: workload.workload_url.clone(),
            org: workload.workload_org.clone(),
            version: workload.workload_version.clone(),
            deployment: workload.deployment.clone(),
        }],
        max_agreements: None,
    }
}

fn workload_basename(url: &str) -> &str {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(url)
}

/// Deterministic policy file name from `(org, pattern, policy name)`.
fn policy_file_name(org: &str, pattern_id: &str, policy_name: &str) -> String {
    format!(
        "{}_{}_{}.{}",
        sanitize(org),
        sanitize(pattern_id),
        sanitize(policy_name),
        POLICY_FILE_EXT
    )
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use agbot_common::policy::Deployment;
    use serde_json::json;
    use tempdir::TempDir;

    fn pattern(version: &str) -> Pattern {
        Pattern {
            label: "netspeed".to_string(),
            public: true,
            workloads: vec![PatternWorkload {
                workload_url: "https://exchange.example/workloads/netspeed".to_string(),
                workload_org: "acme".to_string(),
                workload_version: version.to_string(),
                deployment: Deployment::Inline(json!({"services": {"netspeed": {}}})),
            }],
            ..Pattern::default()
        }
    }

    fn defined(
        org: &str,
        pattern_id: &str,
        pattern: Pattern,
    ) -> HashMap<String, HashMap<String, Pattern>> {
        let mut by_id = HashMap::new();
        by_id.insert(pattern_id.to_string(), pattern);
        let mut by_org = HashMap::new();
        by_org.insert(org.to_string(), by_id);
        by_org
    }

    fn on_disk(dir: &Path) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = fs::read_dir(dir)
            .expect("read policy dir")
            .map(|e| e.expect("dir entry").path())
            .collect();
        files.sort();
        files
    }

    #[test]
    fn test_create_update_idempotent_delete() {
        let dir = TempDir::new("agbot-policies").expect("tempdir");
        let mut manager = PatternManager::new(dir.path()).expect("manager");
        let served = vec![ServedPattern::new("acme", "netspeed")];

        // First pass materializes the entry and generates its file
        let stats = manager
            .reconcile(&served, &defined("acme", "netspeed", pattern("1.0.0")))
            .expect("first pass");
        assert_eq!(stats.created, 1);
        assert_eq!(stats.files_written, 1);
        let first_files = on_disk(dir.path());
        assert_eq!(first_files.len(), 1);
        let entry_hash = manager.entry("acme", "netspeed").expect("entry").hash;
        assert_eq!(
            entry_hash,
            pattern("1.0.0").fingerprint().expect("fingerprint")
        );

        // Mutated pattern: hash mismatch, file replaced
        let stats = manager
            .reconcile(&served, &defined("acme", "netspeed", pattern("1.0.1")))
            .expect("second pass");
        assert_eq!(stats.updated, 1);
        assert_eq!(stats.files_removed, 1);
        assert_eq!(stats.files_written, 1);

        // Identical pattern: zero filesystem writes
        let stats = manager
            .reconcile(&served, &defined("acme", "netspeed", pattern("1.0.1")))
            .expect("third pass");
        assert_eq!(stats.unchanged, 1);
        assert_eq!(stats.files_written, 0);
        assert_eq!(stats.files_removed, 0);

        // Dropped from the served set: entry and files deleted
        let stats = manager
            .reconcile(&[], &HashMap::new())
            .expect("fourth pass");
        assert_eq!(stats.deleted, 1);
        assert_eq!(stats.files_removed, 1);
        assert!(on_disk(dir.path()).is_empty());
        assert!(manager.entry("acme", "netspeed").is_none());
    }

    #[test]
    fn test_on_disk_set_matches_live_entries() {
        let dir = TempDir::new("agbot-policies").expect("tempdir");
        let mut manager = PatternManager::new(dir.path()).expect("manager");
        let served = vec![
            ServedPattern::new("acme", "netspeed"),
            ServedPattern::new("acme", "gps"),
        ];
        let mut by_id = HashMap::new();
        by_id.insert("netspeed".to_string(), pattern("1.0.0"));
        let mut gps = pattern("2.0.0");
        gps.workloads[0].workload_url = "https://exchange.example/workloads/gps".to_string();
        by_id.insert("gps".to_string(), gps);
        let mut by_org = HashMap::new();
        by_org.insert("acme".to_string(), by_id);

        manager.reconcile(&served, &by_org).expect("pass");

        let mut expected: Vec<PathBuf> = Vec::new();
        for (org, pattern_id) in [("acme", "netspeed"), ("acme", "gps")] {
            expected.extend(
                manager
                    .entry(org, pattern_id)
                    .expect("entry")
                    .policy_filenames
                    .clone(),
            );
        }
        expected.sort();
        assert_eq!(on_disk(dir.path()), expected);
    }

    #[test]
    fn test_served_without_definition_stays_unmaterialized() {
        let dir = TempDir::new("agbot-policies").expect("tempdir");
        let mut manager = PatternManager::new(dir.path()).expect("manager");
        let served = vec![ServedPattern::new("acme", "unknown")];

        let stats = manager.reconcile(&served, &HashMap::new()).expect("pass");
        assert_eq!(stats, ReconcileStats::default());
        assert!(manager.entry("acme", "unknown").is_none());
        assert!(on_disk(dir.path()).is_empty());
    }
}
