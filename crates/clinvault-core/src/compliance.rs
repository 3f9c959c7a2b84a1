//! Compliance scoring over a point-in-time snapshot of vault state.
//!
//! [`evaluate`] is pure: the facade gathers a [`ComplianceSnapshot`] and this
//! module turns it into per-framework control results. Every control is worth
//! 10 points; `Pass` scores 10, `Partial` 5 and `Fail` 0.

use chrono::{DateTime, Utc};
use serde::Serialize;

const MAX_CONTROL_SCORE: u32 = 10;

/// Facts about the vault that controls are scored against.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ComplianceSnapshot {
    pub taken_at: DateTime<Utc>,
    pub provider_count: usize,
    /// Providers other than the password-derived one (KMS, Shamir).
    pub non_password_providers: usize,
    /// Age in days of the oldest current DEK.
    pub oldest_dek_age_days: i64,
    /// Purposes whose DEK has been rotated at least once.
    pub rotated_dek_purposes: usize,
    pub secret_count: usize,
    pub versioned_secret_count: usize,
    pub active_rotation_schedules: usize,
    pub overdue_rotations: usize,
    pub active_leases: usize,
    pub expired_unrevoked_leases: usize,
    pub active_tokens: usize,
    pub stale_tokens: usize,
    pub custom_policy_count: usize,
    pub policy_assignment_count: usize,
    pub audit_entry_count: usize,
    pub audit_backend_count: usize,
    pub field_policy_count: usize,
    pub enabled_encryption_configs: usize,
    pub incomplete_reencryptions: usize,
    pub db_rotation_configured: bool,
    pub db_rotation_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlStatus {
    Pass,
    Partial,
    Fail,
}

impl ControlStatus {
    fn score(self) -> u32 {
        match self {
            Self::Pass => MAX_CONTROL_SCORE,
            Self::Partial => MAX_CONTROL_SCORE / 2,
            Self::Fail => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Framework {
    #[serde(rename = "HIPAA")]
    Hipaa,
    #[serde(rename = "SOC2")]
    Soc2,
    #[serde(rename = "GDPR")]
    Gdpr,
}

#[derive(Debug, Clone, Serialize)]
pub struct ControlResult {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub status: ControlStatus,
    pub score: u32,
    pub max_score: u32,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FrameworkScore {
    pub framework: Framework,
    pub score: u32,
    pub max_score: u32,
    pub percentage: f64,
    pub controls: Vec<ControlResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComplianceReport {
    pub generated_at: DateTime<Utc>,
    pub score: u32,
    pub max_score: u32,
    pub percentage: f64,
    pub grade: &'static str,
    pub frameworks: Vec<FrameworkScore>,
}

/// Score `snapshot` against HIPAA, SOC 2 and GDPR.
#[must_use]
pub fn evaluate(snapshot: &ComplianceSnapshot) -> ComplianceReport {
    let frameworks: Vec<FrameworkScore> = [
        (Framework::Hipaa, hipaa(snapshot)),
        (Framework::Soc2, soc2(snapshot)),
        (Framework::Gdpr, gdpr(snapshot)),
    ]
    .into_iter()
    .map(|(framework, controls)| {
        let score = controls.iter().map(|c| c.score).sum();
        let max_score = controls.iter().map(|c| c.max_score).sum();
        FrameworkScore {
            framework,
            score,
            max_score,
            percentage: percentage(score, max_score),
            controls,
        }
    })
    .collect();

    let score = frameworks.iter().map(|f| f.score).sum();
    let max_score = frameworks.iter().map(|f| f.max_score).sum();
    let pct = percentage(score, max_score);
    ComplianceReport {
        generated_at: snapshot.taken_at,
        score,
        max_score,
        percentage: pct,
        grade: grade(pct),
        frameworks,
    }
}

/// Letter grade for a percentage.
#[must_use]
pub fn grade(percentage: f64) -> &'static str {
    const BANDS: [(f64, &str); 9] = [
        (95.0, "A+"),
        (90.0, "A"),
        (85.0, "A-"),
        (80.0, "B+"),
        (75.0, "B"),
        (70.0, "B-"),
        (65.0, "C+"),
        (60.0, "C"),
        (50.0, "D"),
    ];
    BANDS
        .iter()
        .find(|(floor, _)| percentage >= *floor)
        .map_or("F", |(_, g)| g)
}

/// Rounded to one decimal.
fn percentage(score: u32, max: u32) -> f64 {
    if max == 0 {
        return 0.0;
    }
    (f64::from(score) * 1000.0 / f64::from(max)).round() / 10.0
}

fn control(
    id: &'static str,
    name: &'static str,
    description: &'static str,
    status: ControlStatus,
    detail: String,
) -> ControlResult {
    ControlResult {
        id,
        name,
        description,
        status,
        score: status.score(),
        max_score: MAX_CONTROL_SCORE,
        detail,
    }
}

fn pass_if(cond: bool, otherwise: ControlStatus) -> ControlStatus {
    if cond { ControlStatus::Pass } else { otherwise }
}

fn both_either(a: bool, b: bool) -> ControlStatus {
    match (a, b) {
        (true, true) => ControlStatus::Pass,
        (false, false) => ControlStatus::Fail,
        _ => ControlStatus::Partial,
    }
}

fn dek_age_status(days: i64) -> ControlStatus {
    match days {
        ..=90 => ControlStatus::Pass,
        91..=365 => ControlStatus::Partial,
        _ => ControlStatus::Fail,
    }
}

fn rotation_status(s: &ComplianceSnapshot) -> ControlStatus {
    match (s.active_rotation_schedules, s.overdue_rotations) {
        (0, _) => ControlStatus::Fail,
        (_, 0) => ControlStatus::Pass,
        _ => ControlStatus::Partial,
    }
}

fn hipaa(s: &ComplianceSnapshot) -> Vec<ControlResult> {
    use ControlStatus::{Fail, Partial};
    vec![
        control(
            "HIPAA-1",
            "Encryption at Rest",
            "ePHI fields are encrypted with AES-256-GCM",
            pass_if(s.enabled_encryption_configs > 0, Fail),
            format!("{} table(s) with field encryption", s.enabled_encryption_configs),
        ),
        control(
            "HIPAA-2",
            "Audit Controls",
            "Activity on systems holding ePHI is recorded",
            pass_if(s.audit_entry_count > 0 && s.audit_backend_count > 0, Fail),
            format!(
                "{} entries across {} backend(s)",
                s.audit_entry_count, s.audit_backend_count
            ),
        ),
        control(
            "HIPAA-3",
            "Data Integrity",
            "Secrets are versioned and AEAD-protected",
            pass_if(s.secret_count > 0, Partial),
            format!(
                "{} secret(s), {} with more than one version",
                s.secret_count, s.versioned_secret_count
            ),
        ),
        control(
            "HIPAA-4",
            "Access Control",
            "Access to ePHI is restricted by policy",
            both_either(s.custom_policy_count > 0, s.policy_assignment_count > 0),
            format!(
                "{} custom policies, {} user assignments",
                s.custom_policy_count, s.policy_assignment_count
            ),
        ),
        control(
            "HIPAA-5",
            "Access Token Management",
            "Tokens are expired and cleaned up",
            pass_if(s.stale_tokens == 0, Partial),
            format!(
                "{} active token(s), {} expired or exhausted awaiting sweep",
                s.active_tokens, s.stale_tokens
            ),
        ),
        control(
            "HIPAA-6",
            "Secret Rotation",
            "Credentials are rotated on a schedule",
            rotation_status(s),
            format!(
                "{} active schedule(s), {} overdue",
                s.active_rotation_schedules, s.overdue_rotations
            ),
        ),
        control(
            "HIPAA-7",
            "Field-Level Access Control",
            "Sensitive fields are masked by role",
            pass_if(s.field_policy_count > 0, Partial),
            format!("{} field access policies", s.field_policy_count),
        ),
        control(
            "HIPAA-8",
            "Key Protection",
            "The master key is recoverable without a single password",
            pass_if(s.non_password_providers > 0, Partial),
            format!(
                "{} unseal provider(s), {} not password-derived",
                s.provider_count, s.non_password_providers
            ),
        ),
        control(
            "HIPAA-9",
            "Lease Management",
            "Access grants are time-bounded and revoked on expiry",
            pass_if(s.expired_unrevoked_leases == 0, Partial),
            format!(
                "{} active lease(s), {} expired but not revoked",
                s.active_leases, s.expired_unrevoked_leases
            ),
        ),
        control(
            "HIPAA-10",
            "Key Rotation",
            "Data encryption keys are rotated regularly",
            dek_age_status(s.oldest_dek_age_days),
            format!("oldest current DEK is {} day(s) old", s.oldest_dek_age_days),
        ),
    ]
}

fn soc2(s: &ComplianceSnapshot) -> Vec<ControlResult> {
    use ControlStatus::{Fail, Partial};
    let monitoring = match s.audit_entry_count {
        0 => Fail,
        1..=100 => Partial,
        _ => ControlStatus::Pass,
    };
    let encryption = if s.enabled_encryption_configs == 0 {
        Fail
    } else if dek_age_status(s.oldest_dek_age_days) == Fail {
        Partial
    } else {
        ControlStatus::Pass
    };
    let credentials = match (s.db_rotation_configured, s.db_rotation_count) {
        (true, 1..) => ControlStatus::Pass,
        _ => Partial,
    };
    vec![
        control(
            "SOC2-CC6.1",
            "Logical Access Security",
            "Path policies restrict access to protected resources",
            pass_if(s.custom_policy_count > 0, Partial),
            format!("{} custom policies", s.custom_policy_count),
        ),
        control(
            "SOC2-CC6.3",
            "Encryption Controls",
            "Data is envelope-encrypted under current keys",
            encryption,
            format!(
                "{} encrypted table(s), oldest DEK {} day(s)",
                s.enabled_encryption_configs, s.oldest_dek_age_days
            ),
        ),
        control(
            "SOC2-CC6.6",
            "Credential Lifecycle",
            "Application database credentials rotate without downtime",
            credentials,
            if s.db_rotation_configured {
                format!("{} A/B rotation(s) performed", s.db_rotation_count)
            } else {
                "A/B rotation not configured".to_owned()
            },
        ),
        control(
            "SOC2-CC7.2",
            "Monitoring Activities",
            "Security events are logged and reviewable",
            monitoring,
            format!("{} audit entries", s.audit_entry_count),
        ),
        control(
            "SOC2-CC8.1",
            "Change Management",
            "Secret changes are versioned",
            pass_if(s.versioned_secret_count > 0, Partial),
            format!("{} versioned secret(s)", s.versioned_secret_count),
        ),
        control(
            "SOC2-A1.2",
            "Recovery Mechanisms",
            "More than one way to recover the master key exists",
            pass_if(s.provider_count >= 2, Partial),
            format!("{} unseal provider(s)", s.provider_count),
        ),
        control(
            "SOC2-C1.1",
            "Confidentiality",
            "Confidential fields are masked for non-privileged roles",
            pass_if(s.field_policy_count > 0, Partial),
            format!("{} field access policies", s.field_policy_count),
        ),
    ]
}

fn gdpr(s: &ComplianceSnapshot) -> Vec<ControlResult> {
    use ControlStatus::{Fail, Partial};
    vec![
        control(
            "GDPR-32a",
            "Pseudonymisation & Encryption",
            "Personal data is encrypted at rest",
            pass_if(s.enabled_encryption_configs > 0, Fail),
            format!("{} table(s) with field encryption", s.enabled_encryption_configs),
        ),
        control(
            "GDPR-32b",
            "Confidentiality",
            "Path and field policies limit who sees personal data",
            both_either(s.custom_policy_count > 0, s.field_policy_count > 0),
            format!(
                "{} custom policies, {} field policies",
                s.custom_policy_count, s.field_policy_count
            ),
        ),
        control(
            "GDPR-32c",
            "Resilience",
            "The vault can be unsealed through more than one provider",
            pass_if(s.provider_count >= 2, Partial),
            format!("{} unseal provider(s)", s.provider_count),
        ),
        control(
            "GDPR-32d",
            "Regular Testing",
            "Key rotation and re-encryption are exercised",
            pass_if(
                s.rotated_dek_purposes > 0 && s.incomplete_reencryptions == 0,
                Partial,
            ),
            format!(
                "{} purpose(s) rotated, {} re-encryption(s) incomplete",
                s.rotated_dek_purposes, s.incomplete_reencryptions
            ),
        ),
        control(
            "GDPR-5f",
            "Integrity & Confidentiality",
            "Personal data is both encrypted and access-controlled",
            pass_if(
                s.field_policy_count > 0 && s.enabled_encryption_configs > 0,
                Partial,
            ),
            format!(
                "{} field policies, {} encrypted table(s)",
                s.field_policy_count, s.enabled_encryption_configs
            ),
        ),
        control(
            "GDPR-25",
            "Privacy by Design",
            "Credentials have a bounded lifetime by default",
            pass_if(s.active_rotation_schedules > 0, Partial),
            format!("{} active rotation schedule(s)", s.active_rotation_schedules),
        ),
        control(
            "GDPR-30",
            "Processing Records",
            "Processing activity is recorded",
            pass_if(s.audit_entry_count > 0, Fail),
            format!("{} audit entries", s.audit_entry_count),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn healthy() -> ComplianceSnapshot {
        ComplianceSnapshot {
            taken_at: Utc::now(),
            provider_count: 2,
            non_password_providers: 1,
            oldest_dek_age_days: 10,
            rotated_dek_purposes: 1,
            secret_count: 5,
            versioned_secret_count: 2,
            active_rotation_schedules: 3,
            overdue_rotations: 0,
            active_leases: 4,
            expired_unrevoked_leases: 0,
            active_tokens: 2,
            stale_tokens: 0,
            custom_policy_count: 2,
            policy_assignment_count: 1,
            audit_entry_count: 500,
            audit_backend_count: 1,
            field_policy_count: 3,
            enabled_encryption_configs: 2,
            incomplete_reencryptions: 0,
            db_rotation_configured: true,
            db_rotation_count: 4,
        }
    }

    #[test]
    fn grade_bands() {
        assert_eq!(grade(100.0), "A+");
        assert_eq!(grade(95.0), "A+");
        assert_eq!(grade(94.9), "A");
        assert_eq!(grade(85.0), "A-");
        assert_eq!(grade(72.3), "B-");
        assert_eq!(grade(60.0), "C");
        assert_eq!(grade(50.0), "D");
        assert_eq!(grade(49.9), "F");
    }

    #[test]
    fn healthy_vault_scores_full_marks() {
        let report = evaluate(&healthy());
        assert_eq!(report.frameworks.len(), 3);
        assert_eq!(report.score, report.max_score);
        assert!((report.percentage - 100.0).abs() < f64::EPSILON);
        assert_eq!(report.grade, "A+");
        assert_eq!(report.frameworks[0].controls.len(), 10);
    }

    #[test]
    fn empty_vault_fails() {
        let report = evaluate(&ComplianceSnapshot::default());
        assert_eq!(report.grade, "F");
        let hipaa = &report.frameworks[0];
        assert_eq!(hipaa.framework, Framework::Hipaa);
        assert_eq!(hipaa.controls[0].status, ControlStatus::Fail);
    }

    #[test]
    fn percentages_round_to_one_decimal() {
        assert!((percentage(2, 3) - 66.7).abs() < 1e-9);
        assert!((percentage(0, 0)).abs() < f64::EPSILON);
    }

    #[test]
    fn overdue_rotation_is_partial() {
        let mut s = healthy();
        s.overdue_rotations = 1;
        let report = evaluate(&s);
        let control = report.frameworks[0]
            .controls
            .iter()
            .find(|c| c.id == "HIPAA-6")
            .map(|c| c.status);
        assert_eq!(control, Some(ControlStatus::Partial));
        assert_eq!(report.score, report.max_score - 5);
    }
}
