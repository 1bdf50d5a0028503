//! Fingerprint — stable hash of (provider, source id, destination, format,
//! compression) identifying a logically equivalent export; the dedup key
//! the Job Manager enforces at-most-one-Running-per-fingerprint over.

use sha2::{Digest, Sha256};

use crate::jobs::model::{CompressionChoice, JobDefinition};

pub fn compute(def: &JobDefinition) -> String {
    let mut hasher = Sha256::new();
    hasher.update(def.provider.as_str().as_bytes());
    hasher.update(b"\0");
    hasher.update(def.source_id.as_bytes());
    hasher.update(b"\0");
    hasher.update(def.destination.as_bytes());
    hasher.update(b"\0");
    hasher.update(def.format.as_str().as_bytes());
    hasher.update(b"\0");
    hasher.update(compression_key(&def.compression).as_bytes());
    format!("{:x}", hasher.finalize())
}

fn compression_key(c: &CompressionChoice) -> String {
    match c {
        CompressionChoice::Disabled => "off".to_string(),
        CompressionChoice::Enabled { level } => format!("on:{level}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::model::{ExportFormat, Provider};

    fn def() -> JobDefinition {
        JobDefinition::builder()
            .display_name("testA")
            .provider(Provider::Vsphere)
            .source_id("/dc/vm/testA")
            .destination("/out/A")
            .format(ExportFormat::Ova)
            .compression(CompressionChoice::Enabled { level: 6 })
            .build()
    }

    #[test]
    fn fingerprint_is_stable_across_reencoding() {
        let a = def();
        let json = serde_json::to_string(&a).unwrap();
        let b: JobDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(compute(&a), compute(&b));
    }

    #[test]
    fn fingerprint_changes_with_destination() {
        let a = def();
        let mut b = def();
        b.destination = "/out/B".to_string();
        assert_ne!(compute(&a), compute(&b));
    }

    #[test]
    fn fingerprint_ignores_metadata_and_parallelism() {
        let mut a = def();
        let mut b = def();
        a.metadata.insert("k".into(), "v".into());
        b.parallel_streams = 16;
        assert_eq!(compute(&a), compute(&b));
    }
}
