//! In-memory provider used by tests and, until real hypervisor/cloud SDKs
//! are wired in, as the runtime default — the hypervisor wire protocols
//! themselves are out of scope (spec §1).

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use super::{
    Capabilities, ExportOptions, ExportResult, ProviderConfig, ProviderSurface, VmFilter, VmInfo,
};
use crate::error::CoreError;
use crate::jobs::model::{ExportFormat, Provider};
use crate::progress::ProgressSink;

pub struct MockProvider {
    variant: Provider,
    vms: Mutex<HashMap<String, VmInfo>>,
    supports_incremental: bool,
}

impl MockProvider {
    pub fn new(variant: Provider) -> Self {
        Self {
            variant,
            vms: Mutex::new(HashMap::new()),
            supports_incremental: true,
        }
    }

    pub fn without_incremental(mut self) -> Self {
        self.supports_incremental = false;
        self
    }

    pub fn seed(&self, vm: VmInfo) {
        self.vms.lock().unwrap().insert(vm.id.clone(), vm);
    }
}

#[async_trait]
impl ProviderSurface for MockProvider {
    fn variant(&self) -> Provider {
        self.variant
    }

    async fn connect(&self, _config: &ProviderConfig) -> Result<(), CoreError> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), CoreError> {
        Ok(())
    }

    async fn validate_credentials(&self) -> Result<(), CoreError> {
        Ok(())
    }

    async fn list_vms(&self, filter: &VmFilter) -> Result<Vec<VmInfo>, CoreError> {
        let vms = self.vms.lock().unwrap();
        Ok(vms
            .values()
            .filter(|vm| {
                filter
                    .name_contains
                    .as_ref()
                    .map(|needle| vm.display_name.contains(needle.as_str()))
                    .unwrap_or(true)
            })
            .cloned()
            .collect())
    }

    async fn get_vm(&self, id: &str) -> Result<VmInfo, CoreError> {
        self.vms
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("vm {id}")))
    }

    async fn search_vms(&self, query: &str) -> Result<Vec<VmInfo>, CoreError> {
        self.list_vms(&VmFilter {
            name_contains: Some(query.to_string()),
            location_tag: None,
        })
        .await
    }

    async fn export_vm(
        &self,
        id: &str,
        options: &ExportOptions,
        progress: ProgressSink,
    ) -> Result<ExportResult, CoreError> {
        let vm = self.get_vm(id).await?;
        let total_bytes: u64 = vm.disks.iter().map(|d| d.capacity_bytes).sum();

        let phases = ["discovering", "streaming", "packaging"];
        for (i, phase) in phases.iter().enumerate() {
            let percent = (((i + 1) * 100) / phases.len()) as u8;
            progress
                .emit(*phase, percent, total_bytes * percent as u64 / 100, total_bytes)
                .await;
        }

        let change_ids = if options.incremental && self.supports_incremental {
            Some(
                vm.disks
                    .iter()
                    .map(|d| (d.disk_key.clone(), uuid::Uuid::new_v4().to_string()))
                    .collect(),
            )
        } else {
            None
        };

        Ok(ExportResult {
            artifact_path: format!("/out/{id}.artifact"),
            total_bytes,
            disk_count: vm.disks.len() as u32,
            checksum: None,
            change_ids,
            exported_at: Utc::now(),
        })
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supported_formats: vec![
                ExportFormat::Ova,
                ExportFormat::Ovf,
                ExportFormat::Vmdk,
                ExportFormat::Qcow2,
            ],
            supports_compression: true,
            supports_streaming: true,
            supports_incremental: self.supports_incremental,
            supports_snapshots: true,
        }
    }
}
