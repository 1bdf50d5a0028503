//! C6 Incremental Planner — decides full-vs-delta. Performs no network
//! I/O itself: reads the Change-Id Set from C4 and queries the provider
//! via C5 for current disk metadata only.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::error::CoreError;
use crate::provider::{ProviderSurface, VmInfo};
use crate::store::models::ChangeIdSet;
use crate::store::Store;

const STALE_THRESHOLD_DAYS: i64 = 7;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FullRequiredReason {
    ChangeTrackingNotEnabled,
    NoPriorExport,
    TopologyChanged,
    PriorExportNotChangeTrackingEnabled,
    StaleExport,
    ForceFull,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    FullRequired {
        reason: FullRequiredReason,
    },
    IncrementalPermitted {
        estimated_changed_bytes: Option<u64>,
        base_export_time: DateTime<Utc>,
    },
}

#[derive(Debug, Clone)]
pub struct PlanOptions {
    pub force_full: bool,
}

pub struct IncrementalPlanner {
    store: Arc<dyn Store>,
}

impl IncrementalPlanner {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn plan(
        &self,
        provider: &dyn ProviderSurface,
        vm_id: &str,
        options: &PlanOptions,
    ) -> Result<Verdict, CoreError> {
        if options.force_full {
            return Ok(Verdict::FullRequired {
                reason: FullRequiredReason::ForceFull,
            });
        }

        if !provider.capabilities().supports_incremental {
            return Ok(Verdict::FullRequired {
                reason: FullRequiredReason::ChangeTrackingNotEnabled,
            });
        }

        let prior = self.store.latest_change_id_set(vm_id).await?;
        let Some(prior) = prior else {
            return Ok(Verdict::FullRequired {
                reason: FullRequiredReason::NoPriorExport,
            });
        };

        if prior.disk_change_ids.is_empty() {
            return Ok(Verdict::FullRequired {
                reason: FullRequiredReason::PriorExportNotChangeTrackingEnabled,
            });
        }

        if Utc::now() - prior.export_time > ChronoDuration::days(STALE_THRESHOLD_DAYS) {
            return Ok(Verdict::FullRequired {
                reason: FullRequiredReason::StaleExport,
            });
        }

        let current = provider.get_vm(vm_id).await?;
        if topology_changed(&prior, &current) {
            return Ok(Verdict::FullRequired {
                reason: FullRequiredReason::TopologyChanged,
            });
        }

        Ok(Verdict::IncrementalPermitted {
            estimated_changed_bytes: None,
            base_export_time: prior.export_time,
        })
    }
}

/// Topology comparison: disk-key set equality and per-disk capacity
/// match.
fn topology_changed(prior: &ChangeIdSet, current: &VmInfo) -> bool {
    let prior_keys: HashSet<&String> = prior.disk_change_ids.keys().collect();
    let current_keys: HashSet<&String> = current.disks.iter().map(|d| &d.disk_key).collect();
    if prior_keys != current_keys {
        return true;
    }
    // Capacity match cannot be checked against the prior export (only the
    // change-id set is persisted, not capacities); a provider that resizes
    // a disk without changing its key would need to surface that through
    // a topology-changed change-id, which is out of this planner's remit.
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::model::Provider;
    use crate::provider::mock::MockProvider;
    use crate::provider::{DiskInfo, VmInfo};
    use crate::store::memory::InMemoryStore;
    use std::collections::HashMap;

    fn vm(disks: Vec<(&str, u64)>) -> VmInfo {
        VmInfo {
            id: "vm-1".into(),
            display_name: "vm-1".into(),
            state: "running".into(),
            location_tag: "dc1".into(),
            disks: disks
                .into_iter()
                .map(|(k, c)| DiskInfo {
                    disk_key: k.into(),
                    capacity_bytes: c,
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn no_prior_export_requires_full() {
        let store = Arc::new(InMemoryStore::new());
        let provider = MockProvider::new(Provider::Vsphere);
        provider.seed(vm(vec![("disk0", 100)]));
        let planner = IncrementalPlanner::new(store);
        let verdict = planner
            .plan(&provider, "vm-1", &PlanOptions { force_full: false })
            .await
            .unwrap();
        assert!(matches!(
            verdict,
            Verdict::FullRequired {
                reason: FullRequiredReason::NoPriorExport
            }
        ));
    }

    #[tokio::test]
    async fn unsupported_incremental_always_full() {
        let store = Arc::new(InMemoryStore::new());
        let provider = MockProvider::new(Provider::Vsphere).without_incremental();
        provider.seed(vm(vec![("disk0", 100)]));
        let planner = IncrementalPlanner::new(store);
        let verdict = planner
            .plan(&provider, "vm-1", &PlanOptions { force_full: false })
            .await
            .unwrap();
        assert!(matches!(
            verdict,
            Verdict::FullRequired {
                reason: FullRequiredReason::ChangeTrackingNotEnabled
            }
        ));
    }

    #[tokio::test]
    async fn unchanged_topology_permits_incremental() {
        let store = Arc::new(InMemoryStore::new());
        let provider = MockProvider::new(Provider::Vsphere);
        provider.seed(vm(vec![("disk0", 100)]));
        let mut disk_change_ids = HashMap::new();
        disk_change_ids.insert("disk0".to_string(), "ctk-1".to_string());
        store
            .write_change_id_set(&ChangeIdSet {
                vm_id: "vm-1".into(),
                export_time: Utc::now() - ChronoDuration::days(3),
                disk_change_ids,
            })
            .await
            .unwrap();
        let planner = IncrementalPlanner::new(store);
        let verdict = planner
            .plan(&provider, "vm-1", &PlanOptions { force_full: false })
            .await
            .unwrap();
        assert!(matches!(verdict, Verdict::IncrementalPermitted { .. }));
    }

    #[tokio::test]
    async fn added_disk_requires_full() {
        let store = Arc::new(InMemoryStore::new());
        let provider = MockProvider::new(Provider::Vsphere);
        provider.seed(vm(vec![("disk0", 100), ("disk1", 50)]));
        let mut disk_change_ids = HashMap::new();
        disk_change_ids.insert("disk0".to_string(), "ctk-1".to_string());
        store
            .write_change_id_set(&ChangeIdSet {
                vm_id: "vm-1".into(),
                export_time: Utc::now() - ChronoDuration::days(1),
                disk_change_ids,
            })
            .await
            .unwrap();
        let planner = IncrementalPlanner::new(store);
        let verdict = planner
            .plan(&provider, "vm-1", &PlanOptions { force_full: false })
            .await
            .unwrap();
        assert!(matches!(
            verdict,
            Verdict::FullRequired {
                reason: FullRequiredReason::TopologyChanged
            }
        ));
    }
}
