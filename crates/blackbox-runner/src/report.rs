use std::path::Path;

use serde::Serialize;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CaseReport {
    pub name: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct GroupReport {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setup_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub teardown_error: Option<String>,
    pub cases: Vec<CaseReport>,
}

impl GroupReport {
    pub fn passed(&self) -> bool {
        self.setup_error.is_none()
            && self.teardown_error.is_none()
            && self.cases.iter().all(|c| c.passed)
    }

    pub fn failed_cases(&self) -> impl Iterator<Item = &CaseReport> {
        self.cases.iter().filter(|c| !c.passed)
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct RunReport {
    pub groups: Vec<GroupReport>,
}

impl RunReport {
    pub fn failed_groups(&self) -> usize {
        self.groups.iter().filter(|g| !g.passed()).count()
    }

    /// Process exit code: the number of failed groups, saturated at 255.
    pub fn exit_code(&self) -> u8 {
        u8::try_from(self.failed_groups()).unwrap_or(u8::MAX)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn write_json(&self, path: &Path) -> anyhow::Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn log_summary(&self) {
        for group in &self.groups {
            if group.passed() {
                tracing::info!(group = %group.name, cases = group.cases.len(), "group passed");
                continue;
            }
            if let Some(e) = &group.setup_error {
                tracing::error!(group = %group.name, error = %e, "group setup failed");
            }
            if let Some(e) = &group.teardown_error {
                tracing::error!(group = %group.name, error = %e, "group teardown failed");
            }
            for case in group.failed_cases() {
                tracing::error!(
                    group = %group.name,
                    case = %case.name,
                    error = case.error.as_deref().unwrap_or(""),
                    "case failed"
                );
            }
        }
        tracing::info!(
            groups = self.groups.len(),
            failed = self.failed_groups(),
            "black-box run finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn case(name: &str, passed: bool) -> CaseReport {
        CaseReport {
            name: name.into(),
            passed,
            error: (!passed).then(|| "boom".to_string()),
            duration_ms: 3,
        }
    }

    #[test]
    fn group_fails_on_any_failure_source() {
        let mut g = GroupReport {
            name: "g".into(),
            setup_error: None,
            teardown_error: None,
            cases: vec![case("a", true), case("b", true)],
        };
        assert!(g.passed());
        g.teardown_error = Some("leftover container".into());
        assert!(!g.passed());
        g.teardown_error = None;
        g.cases.push(case("c", false));
        assert!(!g.passed());
        assert_eq!(g.failed_cases().count(), 1);
    }

    #[test]
    fn exit_code_counts_failed_groups() {
        let ok = GroupReport {
            name: "ok".into(),
            setup_error: None,
            teardown_error: None,
            cases: vec![case("a", true)],
        };
        let bad = GroupReport {
            name: "bad".into(),
            setup_error: Some("no lxc".into()),
            teardown_error: None,
            cases: vec![],
        };
        let report = RunReport {
            groups: vec![ok, bad.clone(), bad],
        };
        assert_eq!(report.failed_groups(), 2);
        assert_eq!(report.exit_code(), 2);
        assert_eq!(RunReport::default().exit_code(), 0);
    }

    #[test]
    fn json_omits_absent_errors() {
        let report = RunReport {
            groups: vec![GroupReport {
                name: "provisioning".into(),
                setup_error: None,
                teardown_error: None,
                cases: vec![case("containers_get_addresses", true)],
            }],
        };
        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(json["groups"][0]["name"], "provisioning");
        assert!(json["groups"][0].get("setup_error").is_none());
        assert_eq!(json["groups"][0]["cases"][0]["passed"], true);
        assert!(json["groups"][0]["cases"][0].get("error").is_none());
    }
}
