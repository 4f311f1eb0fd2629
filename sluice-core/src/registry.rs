//! Stage-based service registry.
//!
//! A ready-made [`Capabilities`] implementation for deployments that
//! describe their analyzer fleet as services grouped into ordered stages:
//! the schedule for any file is the stage sequence filtered down to the
//! submission's selected services. Enablement is runtime-togglable so
//! operators can drain a misbehaving service while the plumber clears its
//! queue.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use sluice_model::SubmissionRecord;

use crate::capabilities::{Capabilities, Schedule};

/// One analyzer service as the registry sees it.
#[derive(Debug, Clone)]
pub struct ServiceDef {
    pub name: String,
    pub stage: String,
    pub timeout: Option<Duration>,
    pub failure_limit: Option<u32>,
    pub enabled: bool,
}

struct RegisteredService {
    def: ServiceDef,
    enabled: AtomicBool,
}

/// Registry mapping ordered stages to services.
pub struct StageRegistry {
    stages: Vec<String>,
    services: BTreeMap<String, Arc<RegisteredService>>,
}

impl std::fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageRegistry")
            .field("stages", &self.stages)
            .field("services", &self.services.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl StageRegistry {
    pub fn new(stages: Vec<String>, services: Vec<ServiceDef>) -> Self {
        let services = services
            .into_iter()
            .map(|def| {
                let enabled = AtomicBool::new(def.enabled);
                (
                    def.name.clone(),
                    Arc::new(RegisteredService { def, enabled }),
                )
            })
            .collect();
        StageRegistry { stages, services }
    }

    pub fn set_enabled(&self, service: &str, enabled: bool) {
        if let Some(registered) = self.services.get(service) {
            registered.enabled.store(enabled, Ordering::SeqCst);
        }
    }
}

impl Capabilities for StageRegistry {
    fn services(&self) -> Vec<String> {
        self.services.keys().cloned().collect()
    }

    /// Stage order filtered by the submission's service selection; an
    /// empty selection means every service. Empty stages are elided.
    fn build_schedule(
        &self,
        record: &SubmissionRecord,
        _file_type: &str,
    ) -> Schedule {
        let selected = &record.params.selected;
        let mut schedule = Vec::new();
        for stage in &self.stages {
            let group: Vec<String> = self
                .services
                .values()
                .filter(|registered| registered.def.stage == *stage)
                .filter(|registered| {
                    selected.is_empty()
                        || selected.contains(&registered.def.name)
                })
                .map(|registered| registered.def.name.clone())
                .collect();
            if !group.is_empty() {
                schedule.push(group);
            }
        }
        schedule
    }

    fn service_timeout(&self, service: &str) -> Option<Duration> {
        self.services
            .get(service)
            .and_then(|registered| registered.def.timeout)
    }

    fn service_failure_limit(&self, service: &str) -> Option<u32> {
        self.services
            .get(service)
            .and_then(|registered| registered.def.failure_limit)
    }

    fn service_enabled(&self, service: &str) -> bool {
        self.services
            .get(service)
            .map(|registered| registered.enabled.load(Ordering::SeqCst))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sluice_model::{
        ScanKey, Sha256, SubmissionParams, SubmissionState,
    };

    fn registry() -> StageRegistry {
        let service = |name: &str, stage: &str| ServiceDef {
            name: name.to_string(),
            stage: stage.to_string(),
            timeout: None,
            failure_limit: None,
            enabled: true,
        };
        StageRegistry::new(
            vec!["pre".into(), "core".into(), "post".into()],
            vec![
                service("extract", "pre"),
                service("av-a", "core"),
                service("av-b", "core"),
                service("report", "post"),
            ],
        )
    }

    fn record(selected: Vec<String>) -> SubmissionRecord {
        let mut params = SubmissionParams::new("user");
        params.selected = selected;
        let scan_key: ScanKey =
            params.scan_key(&Sha256::of_bytes(b"sample"));
        SubmissionRecord {
            sid: sluice_model::Sid::new(),
            scan_key,
            files: Vec::new(),
            params,
            metadata: Default::default(),
            notification: None,
            results: Vec::new(),
            errors: Vec::new(),
            state: SubmissionState::Submitted,
            score: None,
            submitted_at: Utc::now(),
            completed_at: None,
        }
    }

    #[test]
    fn empty_selection_schedules_everything() {
        let schedule = registry().build_schedule(&record(Vec::new()), "any");
        assert_eq!(
            schedule,
            vec![
                vec!["extract".to_string()],
                vec!["av-a".to_string(), "av-b".to_string()],
                vec!["report".to_string()],
            ]
        );
    }

    #[test]
    fn selection_filters_and_elides_stages() {
        let schedule = registry().build_schedule(
            &record(vec!["av-b".into(), "report".into()]),
            "any",
        );
        assert_eq!(
            schedule,
            vec![vec!["av-b".to_string()], vec!["report".to_string()]]
        );
    }

    #[test]
    fn enablement_toggles_at_runtime() {
        let registry = registry();
        assert!(registry.service_enabled("av-a"));
        registry.set_enabled("av-a", false);
        assert!(!registry.service_enabled("av-a"));
        assert!(!registry.service_enabled("unknown"));
    }
}
