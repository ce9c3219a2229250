//! Admission gate: kill switch, health level, sandbox fail-closed.
//!
//! Consulted by the coordinator before anything is scheduled. A veto here
//! is a gated reject, not an execution failure: the run never starts and
//! no manifest is written.

use std::fs;

use crate::config::{ApexConfig, ApexHome, SandboxLevel};
use crate::doctor::HealthLevel;
use crate::error::Result;
use crate::risk::RiskLevel;

/// Why the gate refused a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateReject {
    KillSwitch { reason: Option<String> },
    HealthRed,
    FailClosed { risk: RiskLevel, level: SandboxLevel },
}

impl GateReject {
    /// Stable, parseable line for stdout.
    pub fn message(&self) -> String {
        match self {
            GateReject::KillSwitch { reason } => match reason {
                Some(reason) => {
                    format!("[KILL-SWITCH] Kill switch is active ({reason}); run refused")
                }
                None => "[KILL-SWITCH] Kill switch is active; run refused".to_string(),
            },
            GateReject::HealthRed => "[HEALTH] System health RED".to_string(),
            GateReject::FailClosed { risk, level } => format!(
                "[SANDBOX] fail-closed: risk {risk} requires a sandbox but level is {level}"
            ),
        }
    }

    /// Health RED is a gated reject with exit 0; the others are refusals.
    pub fn exit_code(&self) -> i32 {
        match self {
            GateReject::HealthRed => 0,
            GateReject::KillSwitch { .. } | GateReject::FailClosed { .. } => 1,
        }
    }
}

/// Outcome of the admission checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Admit { warnings: Vec<String> },
    Reject(GateReject),
}

/// Run the admission checks in order: kill switch, health, sandbox policy.
pub fn admit(
    config: &ApexConfig,
    home: &ApexHome,
    risk: RiskLevel,
    health: HealthLevel,
) -> GateDecision {
    if kill_switch_active(home) {
        return GateDecision::Reject(GateReject::KillSwitch {
            reason: kill_switch_reason(home),
        });
    }

    let mut warnings = Vec::new();
    match health {
        HealthLevel::Red if risk > RiskLevel::Low => {
            return GateDecision::Reject(GateReject::HealthRed);
        }
        HealthLevel::Red => {
            warnings.push("[HEALTH] System health RED; LOW-risk run permitted".to_string());
        }
        HealthLevel::Yellow => {
            warnings.push("[HEALTH] System health YELLOW; proceeding".to_string());
        }
        HealthLevel::Green => {}
    }

    if config.sandbox.level == SandboxLevel::None && config.sandbox.require_for.contains(&risk) {
        return GateDecision::Reject(GateReject::FailClosed {
            risk,
            level: config.sandbox.level,
        });
    }

    GateDecision::Admit { warnings }
}

// -- kill switch file ----------------------------------------------------

/// Result of a kill-switch state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillSwitchStatus {
    Activated,
    AlreadyActive,
    Deactivated,
    NotActive,
}

pub fn kill_switch_active(home: &ApexHome) -> bool {
    home.kill_switch_path().exists()
}

/// Reason recorded when the switch was thrown, if any.
pub fn kill_switch_reason(home: &ApexHome) -> Option<String> {
    let raw = fs::read_to_string(home.kill_switch_path()).ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Create the kill-switch file. Idempotent.
pub fn activate_kill_switch(home: &ApexHome, reason: Option<&str>) -> Result<KillSwitchStatus> {
    let path = home.kill_switch_path();
    if path.exists() {
        return Ok(KillSwitchStatus::AlreadyActive);
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, reason.unwrap_or(""))?;
    Ok(KillSwitchStatus::Activated)
}

/// Remove the kill-switch file. Idempotent.
pub fn deactivate_kill_switch(home: &ApexHome) -> Result<KillSwitchStatus> {
    let path = home.kill_switch_path();
    if !path.exists() {
        return Ok(KillSwitchStatus::NotActive);
    }
    fs::remove_file(path)?;
    Ok(KillSwitchStatus::Deactivated)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_home() -> (tempfile::TempDir, ApexHome) {
        let dir = tempfile::tempdir().unwrap();
        let home = ApexHome::at(dir.path());
        (dir, home)
    }

    #[test]
    fn green_low_risk_is_admitted_cleanly() {
        let (_dir, home) = make_home();
        let decision = admit(
            &ApexConfig::default(),
            &home,
            RiskLevel::Low,
            HealthLevel::Green,
        );
        assert_eq!(decision, GateDecision::Admit { warnings: vec![] });
    }

    #[test]
    fn kill_switch_vetoes_first() {
        let (_dir, home) = make_home();
        activate_kill_switch(&home, Some("testing")).unwrap();

        let decision = admit(
            &ApexConfig::default(),
            &home,
            RiskLevel::Low,
            HealthLevel::Green,
        );
        match decision {
            GateDecision::Reject(reject @ GateReject::KillSwitch { .. }) => {
                assert!(reject.message().contains("testing"));
                assert_ne!(reject.exit_code(), 0);
            }
            other => panic!("expected kill-switch reject, got {other:?}"),
        }
    }

    #[test]
    fn red_health_blocks_non_low_with_exit_zero() {
        let (_dir, home) = make_home();
        let decision = admit(
            &ApexConfig::default(),
            &home,
            RiskLevel::Medium,
            HealthLevel::Red,
        );
        match decision {
            GateDecision::Reject(reject @ GateReject::HealthRed) => {
                assert_eq!(reject.message(), "[HEALTH] System health RED");
                assert_eq!(reject.exit_code(), 0);
            }
            other => panic!("expected health reject, got {other:?}"),
        }
    }

    #[test]
    fn red_health_permits_low_risk_with_warning() {
        let (_dir, home) = make_home();
        let decision = admit(
            &ApexConfig::default(),
            &home,
            RiskLevel::Low,
            HealthLevel::Red,
        );
        match decision {
            GateDecision::Admit { warnings } => {
                assert_eq!(warnings.len(), 1);
                assert!(warnings[0].contains("RED"));
            }
            other => panic!("expected admit, got {other:?}"),
        }
    }

    #[test]
    fn yellow_health_warns_but_admits() {
        let (_dir, home) = make_home();
        let decision = admit(
            &ApexConfig::default(),
            &home,
            RiskLevel::High,
            HealthLevel::Yellow,
        );
        match decision {
            GateDecision::Admit { warnings } => assert!(warnings[0].contains("YELLOW")),
            other => panic!("expected admit, got {other:?}"),
        }
    }

    #[test]
    fn sandbox_fail_closed_for_required_risk() {
        let (_dir, home) = make_home();
        let mut config = ApexConfig::default();
        config.sandbox.level = SandboxLevel::None;
        config.sandbox.require_for = vec![RiskLevel::High];

        let decision = admit(&config, &home, RiskLevel::High, HealthLevel::Green);
        match decision {
            GateDecision::Reject(reject @ GateReject::FailClosed { .. }) => {
                assert!(reject.message().contains("fail-closed"));
                assert_ne!(reject.exit_code(), 0);
            }
            other => panic!("expected fail-closed reject, got {other:?}"),
        }
    }

    #[test]
    fn sandbox_level_above_none_satisfies_requirement() {
        let (_dir, home) = make_home();
        let mut config = ApexConfig::default();
        config.sandbox.level = SandboxLevel::Ulimit;
        config.sandbox.require_for = vec![RiskLevel::High];

        let decision = admit(&config, &home, RiskLevel::High, HealthLevel::Green);
        assert!(matches!(decision, GateDecision::Admit { .. }));
    }

    #[test]
    fn kill_switch_lifecycle_is_idempotent() {
        let (_dir, home) = make_home();
        assert_eq!(
            activate_kill_switch(&home, Some("maintenance")).unwrap(),
            KillSwitchStatus::Activated
        );
        assert_eq!(
            activate_kill_switch(&home, None).unwrap(),
            KillSwitchStatus::AlreadyActive
        );
        assert_eq!(
            kill_switch_reason(&home).as_deref(),
            Some("maintenance")
        );
        assert_eq!(
            deactivate_kill_switch(&home).unwrap(),
            KillSwitchStatus::Deactivated
        );
        assert_eq!(
            deactivate_kill_switch(&home).unwrap(),
            KillSwitchStatus::NotActive
        );
    }
}
