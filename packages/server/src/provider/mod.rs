//! C5 Provider Surface — a capability-typed adapter from core operations
//! to a specific hypervisor/cloud backend. The core never branches on the
//! variant; it consults `capabilities()` to reject incompatible options
//! early.

pub mod mock;
pub mod registry;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::CoreError;
use crate::jobs::model::{ExportFormat, JobDefinition, Provider};
use crate::progress::ProgressSink;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmFilter {
    pub name_contains: Option<String>,
    pub location_tag: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskInfo {
    pub disk_key: String,
    pub capacity_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmInfo {
    pub id: String,
    pub display_name: String,
    pub state: String,
    pub location_tag: String,
    pub disks: Vec<DiskInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capabilities {
    pub supported_formats: Vec<ExportFormat>,
    pub supports_compression: bool,
    pub supports_streaming: bool,
    pub supports_incremental: bool,
    pub supports_snapshots: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportOptions {
    pub incremental: bool,
    pub force_full: bool,
    pub compression: crate::jobs::model::CompressionChoice,
    pub parallel_streams: u8,
    pub remove_removable_media: bool,
}

impl From<&JobDefinition> for ExportOptions {
    fn from(def: &JobDefinition) -> Self {
        Self {
            incremental: def.incremental,
            force_full: def.force_full,
            compression: def.compression,
            parallel_streams: def.parallel_streams,
            remove_removable_media: def.remove_removable_media,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportResult {
    pub artifact_path: String,
    pub total_bytes: u64,
    pub disk_count: u32,
    pub checksum: Option<String>,
    /// per-disk change identifiers, present iff change tracking was used
    pub change_ids: Option<HashMap<String, String>>,
    pub exported_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub endpoint: String,
    pub credentials: HashMap<String, String>,
}

#[async_trait]
pub trait ProviderSurface: Send + Sync {
    fn variant(&self) -> Provider;

    async fn connect(&self, config: &ProviderConfig) -> Result<(), CoreError>;
    async fn disconnect(&self) -> Result<(), CoreError>;
    async fn validate_credentials(&self) -> Result<(), CoreError>;

    async fn list_vms(&self, filter: &VmFilter) -> Result<Vec<VmInfo>, CoreError>;
    async fn get_vm(&self, id: &str) -> Result<VmInfo, CoreError>;
    async fn search_vms(&self, query: &str) -> Result<Vec<VmInfo>, CoreError>;

    async fn export_vm(
        &self,
        id: &str,
        options: &ExportOptions,
        progress: ProgressSink,
    ) -> Result<ExportResult, CoreError>;

    fn capabilities(&self) -> Capabilities;
}
