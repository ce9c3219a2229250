//! Doctor: chain verification, store/lock state, invariant checks, and the
//! system health aggregate consumed by the admission gate.
//!
//! Health is modelled as a capability per component, `{ name, level,
//! importance }`, and the aggregate is a pure fold over the set.

use std::fs;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use apex_store::{ActionWal, LockState, RuntimeLock, RuntimeStore, WalStatus, LOCK_FILE};

use crate::audit::{AuditChain, ChainReport, DailyAnchor};
use crate::config::ApexHome;
use crate::error::Result;
use crate::manifest::MANIFEST_FILE;
use crate::redact::Redactor;

/// Health tier of a component, or of the whole system.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthLevel {
    #[default]
    Green,
    Yellow,
    Red,
}

impl std::fmt::Display for HealthLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HealthLevel::Green => "GREEN",
            HealthLevel::Yellow => "YELLOW",
            HealthLevel::Red => "RED",
        };
        write!(f, "{s}")
    }
}

/// How much a component's health weighs in the aggregate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Importance {
    Critical,
    Important,
    Informational,
}

/// One component's health capability.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComponentHealth {
    pub name: String,
    pub level: HealthLevel,
    pub importance: Importance,
    pub detail: String,
}

/// Fold the component set into the system level.
///
/// Any critical RED ⇒ RED; any important RED or critical YELLOW ⇒ YELLOW;
/// informational components never degrade the aggregate.
pub fn aggregate(components: &[ComponentHealth]) -> HealthLevel {
    let mut level = HealthLevel::Green;
    for component in components {
        match (component.importance, component.level) {
            (Importance::Critical, HealthLevel::Red) => return HealthLevel::Red,
            (Importance::Critical, HealthLevel::Yellow)
            | (Importance::Important, HealthLevel::Red) => {
                level = level.max(HealthLevel::Yellow);
            }
            _ => {}
        }
    }
    level
}

/// One named invariant and whether it held.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvariantCheck {
    pub name: String,
    pub ok: bool,
    pub detail: String,
}

/// Everything `doctor` observed.
#[derive(Debug)]
pub struct DoctorReport {
    pub chain: ChainReport,
    pub db_present: bool,
    pub schema_version: Option<i64>,
    pub lock: LockState,
    pub wal_orphans: usize,
    pub anchors: Vec<DailyAnchor>,
    pub policy_drift: Vec<String>,
    pub invariants: Vec<InvariantCheck>,
    pub components: Vec<ComponentHealth>,
    pub health: HealthLevel,
}

/// Inspect the installation without mutating it.
pub fn diagnose(home: &ApexHome, redactor: Arc<Redactor>) -> Result<DoctorReport> {
    let chain_store = AuditChain::new(home.audit_dir(), redactor);
    let chain = chain_store.verify(None)?;
    let anchors = chain_store.anchors()?;

    let runtime_dir = home.runtime_dir();
    let db_present = RuntimeStore::exists(&runtime_dir);
    let lock = RuntimeLock::state(runtime_dir.join(LOCK_FILE));

    let mut schema_version = None;
    let mut store_detail = "not initialized".to_string();
    let mut store_level = HealthLevel::Green;
    let mut policy_drift = Vec::new();
    let mut staging_count = 0usize;
    let mut run_rows = Vec::new();
    if db_present {
        match RuntimeStore::open_read_only(&runtime_dir) {
            Ok(store) => {
                schema_version = store.schema_version().ok();
                staging_count = store.staging_count().unwrap_or(0);
                run_rows = store.list_runs(10_000).unwrap_or_default();
                policy_drift = store
                    .check_policy_drift()
                    .unwrap_or_default()
                    .into_iter()
                    .map(|d| d.path)
                    .collect();
                store_detail = format!("schema v{}", schema_version.unwrap_or(0));
            }
            Err(e) => {
                store_level = HealthLevel::Red;
                store_detail = format!("unreadable: {e}");
            }
        }
    }
    if matches!(lock, LockState::Stale(_)) {
        store_level = store_level.max(HealthLevel::Yellow);
        store_detail = format!("{store_detail}; stale lock");
    }

    let wal = ActionWal::open(&runtime_dir)?;
    let (wal_orphans, wal_level, wal_detail, wal_terminal_without_start) = match wal.records() {
        Ok(records) => {
            let orphans = wal.orphans()?.len();
            let mut started = std::collections::HashSet::new();
            let mut dangling = 0usize;
            for record in &records {
                match record.status {
                    WalStatus::Started => {
                        started.insert(record.action_id);
                    }
                    WalStatus::Completed | WalStatus::Failed => {
                        if !started.contains(&record.action_id) {
                            dangling += 1;
                        }
                    }
                }
            }
            let level = if orphans > 0 {
                HealthLevel::Yellow
            } else {
                HealthLevel::Green
            };
            (orphans, level, format!("{orphans} orphan(s)"), dangling)
        }
        Err(e) => (0, HealthLevel::Red, format!("corrupt: {e}"), 0),
    };

    // -- invariants -------------------------------------------------------

    let mut invariants = Vec::new();

    let mut seen_dates = std::collections::HashSet::new();
    let duplicate_anchor = anchors.iter().any(|a| !seen_dates.insert(a.date));
    invariants.push(InvariantCheck {
        name: "anchors-unique-per-date".to_string(),
        ok: !duplicate_anchor,
        detail: format!("{} anchor row(s)", anchors.len()),
    });

    let manifest_ids = manifest_run_ids(home)?;
    let terminal_rows: Vec<&apex_store::RunRow> =
        run_rows.iter().filter(|r| r.outcome.is_some()).collect();
    let missing_manifest = terminal_rows
        .iter()
        .filter(|r| !manifest_ids.contains(&r.run_id))
        .count();
    let missing_row = manifest_ids
        .iter()
        .filter(|id| db_present && !run_rows.iter().any(|r| &r.run_id == *id))
        .count();
    invariants.push(InvariantCheck {
        name: "manifest-matches-runs-table".to_string(),
        ok: missing_manifest == 0 && missing_row == 0,
        detail: format!(
            "{} manifest(s), {} terminal row(s), {missing_manifest} without manifest, {missing_row} without row",
            manifest_ids.len(),
            terminal_rows.len(),
        ),
    });

    let in_flight = run_rows.iter().any(|r| r.outcome.is_none());
    invariants.push(InvariantCheck {
        name: "staging-empty-between-runs".to_string(),
        ok: staging_count == 0 || in_flight,
        detail: format!("{staging_count} staged row(s)"),
    });

    invariants.push(InvariantCheck {
        name: "wal-terminal-follows-started".to_string(),
        ok: wal_terminal_without_start == 0,
        detail: format!("{wal_terminal_without_start} terminal record(s) without STARTED"),
    });

    // -- components -------------------------------------------------------

    let components = vec![
        ComponentHealth {
            name: "audit_chain".to_string(),
            level: if chain.ok() {
                HealthLevel::Green
            } else {
                HealthLevel::Red
            },
            importance: Importance::Critical,
            detail: if chain.ok() {
                format!("{} record(s)", chain.records)
            } else {
                format!("broken at {} file(s)", chain.broken.len())
            },
        },
        ComponentHealth {
            name: "runtime_store".to_string(),
            level: store_level,
            importance: Importance::Critical,
            detail: store_detail,
        },
        ComponentHealth {
            name: "action_wal".to_string(),
            level: wal_level,
            importance: Importance::Important,
            detail: wal_detail,
        },
        ComponentHealth {
            name: "policy_checksums".to_string(),
            level: if policy_drift.is_empty() {
                HealthLevel::Green
            } else {
                HealthLevel::Yellow
            },
            importance: Importance::Informational,
            detail: if policy_drift.is_empty() {
                "no drift".to_string()
            } else {
                format!("drifted: {}", policy_drift.join(", "))
            },
        },
    ];

    let invariant_failures = invariants.iter().filter(|i| !i.ok).count();
    let mut components = components;
    components.push(ComponentHealth {
        name: "invariants".to_string(),
        level: if invariant_failures == 0 {
            HealthLevel::Green
        } else {
            HealthLevel::Yellow
        },
        importance: Importance::Important,
        detail: format!("{invariant_failures} failed"),
    });

    let health = aggregate(&components);

    Ok(DoctorReport {
        chain,
        db_present,
        schema_version,
        lock,
        wal_orphans,
        anchors,
        policy_drift,
        invariants,
        components,
        health,
    })
}

/// Quick health probe for the admission gate.
pub fn system_health(home: &ApexHome, redactor: Arc<Redactor>) -> HealthLevel {
    diagnose(home, redactor)
        .map(|report| report.health)
        .unwrap_or(HealthLevel::Red)
}

fn manifest_run_ids(home: &ApexHome) -> Result<Vec<String>> {
    let runs_dir = home.runs_dir();
    if !runs_dir.exists() {
        return Ok(Vec::new());
    }
    let mut ids = Vec::new();
    for entry in fs::read_dir(&runs_dir)? {
        let entry = entry?;
        if entry.path().join(MANIFEST_FILE).exists() {
            ids.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    Ok(ids)
}

impl DoctorReport {
    /// Human-readable report, one stable lexeme per fact.
    pub fn render(&self) -> String {
        let mut out = String::new();

        if self.chain.ok() {
            out.push_str(&format!(
                "Audit chain: OK ({} records)\n",
                self.chain.records
            ));
        } else {
            let first = &self.chain.broken[0];
            out.push_str(&format!(
                "Audit chain: BROKEN at {}:{} ({})\n",
                first.file, first.line, first.reason
            ));
        }

        if self.db_present {
            out.push_str(&format!(
                "Runtime DB: present (Schema version {})\n",
                self.schema_version.unwrap_or(0)
            ));
        } else {
            out.push_str("Runtime DB: not initialized\n");
        }
        out.push_str(&format!("Runtime lock: {}\n", self.lock));
        out.push_str(&format!("WAL orphans: {}\n", self.wal_orphans));
        out.push_str(&format!(
            "Anchors: {} date(s), git tags apex-audit-anchor-*\n",
            self.anchors.len()
        ));

        out.push_str("\nInvariant checks:\n");
        for check in &self.invariants {
            let mark = if check.ok { "ok" } else { "FAIL" };
            out.push_str(&format!(
                "  [{mark}] {} ({})\n",
                check.name, check.detail
            ));
        }

        out.push_str("\nComponents:\n");
        for component in &self.components {
            out.push_str(&format!(
                "  {:<20} {:<14} {:<7} {}\n",
                component.name,
                format!("{:?}", component.importance).to_lowercase(),
                component.level,
                component.detail
            ));
        }

        out.push_str(&format!("\nSystem Health: {}\n", self.health));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn component(name: &str, level: HealthLevel, importance: Importance) -> ComponentHealth {
        ComponentHealth {
            name: name.to_string(),
            level,
            importance,
            detail: String::new(),
        }
    }

    #[test]
    fn aggregate_all_green() {
        let components = vec![
            component("a", HealthLevel::Green, Importance::Critical),
            component("b", HealthLevel::Green, Importance::Important),
        ];
        assert_eq!(aggregate(&components), HealthLevel::Green);
    }

    #[test]
    fn aggregate_critical_red_is_red() {
        let components = vec![
            component("a", HealthLevel::Red, Importance::Critical),
            component("b", HealthLevel::Green, Importance::Important),
        ];
        assert_eq!(aggregate(&components), HealthLevel::Red);
    }

    #[test]
    fn aggregate_important_red_is_yellow() {
        let components = vec![
            component("a", HealthLevel::Green, Importance::Critical),
            component("b", HealthLevel::Red, Importance::Important),
        ];
        assert_eq!(aggregate(&components), HealthLevel::Yellow);
    }

    #[test]
    fn aggregate_critical_yellow_is_yellow() {
        let components = vec![component("a", HealthLevel::Yellow, Importance::Critical)];
        assert_eq!(aggregate(&components), HealthLevel::Yellow);
    }

    #[test]
    fn aggregate_ignores_informational() {
        let components = vec![
            component("a", HealthLevel::Green, Importance::Critical),
            component("b", HealthLevel::Red, Importance::Informational),
        ];
        assert_eq!(aggregate(&components), HealthLevel::Green);
    }

    #[test]
    fn fresh_home_diagnoses_green() {
        let dir = tempfile::tempdir().unwrap();
        let home = ApexHome::at(dir.path());
        let report =
            diagnose(&home, Arc::new(Redactor::with_env_values(vec![]))).unwrap();

        assert_eq!(report.health, HealthLevel::Green);
        assert!(report.chain.ok());
        assert!(!report.db_present);
        assert_eq!(report.lock, LockState::Free);
        assert_eq!(report.wal_orphans, 0);
        assert!(report.invariants.iter().all(|i| i.ok));

        let rendered = report.render();
        assert!(rendered.contains("Audit chain: OK"));
        assert!(rendered.contains("Runtime lock: FREE"));
        assert!(rendered.contains("Invariant checks:"));
        assert!(rendered.contains("System Health: GREEN"));
    }

    #[test]
    fn corrupted_chain_degrades_to_red() {
        let dir = tempfile::tempdir().unwrap();
        let home = ApexHome::at(dir.path());
        let redactor = Arc::new(Redactor::with_env_values(vec![]));

        let chain = AuditChain::new(home.audit_dir(), redactor.clone());
        chain
            .append("run.started", serde_json::json!({}), None)
            .unwrap();

        // Prepend a corruption marker to the day file.
        let day_file = fs::read_dir(home.audit_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .find(|p| p.extension().map(|e| e == "jsonl").unwrap_or(false))
            .unwrap();
        let content = fs::read_to_string(&day_file).unwrap();
        fs::write(&day_file, format!("CORRUPTED\n{content}")).unwrap();

        let report = diagnose(&home, redactor).unwrap();
        assert_eq!(report.health, HealthLevel::Red);
        assert!(report.render().contains("BROKEN"));
    }
}
