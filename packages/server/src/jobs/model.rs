//! Data model (spec §3): Job Definition, Job, and the terminal state
//! machine. A Job never reverts to an earlier phase.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Vsphere,
    Aws,
    Azure,
    Gcp,
    Hyperv,
    Proxmox,
    Oci,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Vsphere => "vsphere",
            Provider::Aws => "aws",
            Provider::Azure => "azure",
            Provider::Gcp => "gcp",
            Provider::Hyperv => "hyperv",
            Provider::Proxmox => "proxmox",
            Provider::Oci => "oci",
        }
    }

    pub fn all() -> [Provider; 7] {
        [
            Provider::Vsphere,
            Provider::Aws,
            Provider::Azure,
            Provider::Gcp,
            Provider::Hyperv,
            Provider::Proxmox,
            Provider::Oci,
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    Ovf,
    Ova,
    Vmdk,
    Qcow2,
    Vhd,
    Vhdx,
    Vdi,
    Raw,
    Vzdump,
}

impl ExportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportFormat::Ovf => "ovf",
            ExportFormat::Ova => "ova",
            ExportFormat::Vmdk => "vmdk",
            ExportFormat::Qcow2 => "qcow2",
            ExportFormat::Vhd => "vhd",
            ExportFormat::Vhdx => "vhdx",
            ExportFormat::Vdi => "vdi",
            ExportFormat::Raw => "raw",
            ExportFormat::Vzdump => "vzdump",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CompressionChoice {
    Disabled,
    Enabled { level: u8 },
}

impl Default for CompressionChoice {
    fn default() -> Self {
        CompressionChoice::Disabled
    }
}

/// Immutable specification an operator submits.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
pub struct JobDefinition {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,
    #[builder(setter(into))]
    pub display_name: String,
    pub provider: Provider,
    #[builder(setter(into))]
    pub source_id: String,
    #[builder(setter(into))]
    pub destination: String,
    pub format: ExportFormat,
    #[builder(default)]
    pub compression: CompressionChoice,
    #[builder(default = 1)]
    pub parallel_streams: u8,
    #[builder(default = false)]
    pub remove_removable_media: bool,
    #[builder(default = false)]
    pub incremental: bool,
    #[builder(default = false)]
    pub force_full: bool,
    #[builder(default)]
    pub metadata: HashMap<String, String>,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultArtifact {
    pub path: String,
    pub size_bytes: u64,
    pub checksum: Option<String>,
}

/// A Job Definition plus mutable runtime state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub definition: JobDefinition,
    pub fingerprint: String,
    pub status: JobStatus,
    pub percent: u8,
    pub phase: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub result: Option<ResultArtifact>,
    pub retry_attempt: u32,
    pub priority: i32,
}

impl Job {
    pub fn new(definition: JobDefinition, fingerprint: String, priority: i32) -> Self {
        Self {
            definition,
            fingerprint,
            status: JobStatus::Pending,
            percent: 0,
            phase: "pending".to_string(),
            started_at: None,
            completed_at: None,
            last_error: None,
            result: None,
            retry_attempt: 0,
            priority,
        }
    }

    pub fn id(&self) -> Uuid {
        self.definition.id
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub id: Uuid,
    pub display_name: String,
    pub status: JobStatus,
    pub percent: u8,
    pub fingerprint: String,
}

impl From<&Job> for JobSummary {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id(),
            display_name: job.definition.display_name.clone(),
            status: job.status,
            percent: job.percent,
            fingerprint: job.fingerprint.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub ids: Option<Vec<Uuid>>,
    pub status: Option<JobStatus>,
}

impl JobFilter {
    pub fn matches(&self, job: &Job) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.contains(&job.id()) {
                return false;
            }
        }
        if let Some(status) = self.status {
            if job.status != status {
                return false;
            }
        }
        true
    }
}
