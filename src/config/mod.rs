//! YAML patch files.
//!
//! ```yaml
//! process: tf_linux64
//! module: client.so
//! timeout_secs: 300
//! interval_ms: 1000
//! patches:
//!   - name: example
//!     pattern: "66 0F D6 83 ?? 02 00 00"
//!     replacement: "90 90 90 90 90 90 90 90"
//! ```

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Duration;

use crate::engine::PatchSpec;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PatchFile {
    #[serde(default)]
    pub process: Option<String>,

    #[serde(default)]
    pub module: Option<String>,

    #[serde(default)]
    pub timeout_secs: Option<u64>,

    #[serde(default)]
    pub interval_ms: Option<u64>,

    pub patches: Vec<PatchEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PatchEntry {
    #[serde(default)]
    pub name: Option<String>,
    /// IDA-style, `??` for wildcards
    pub pattern: String,
    /// Hex bytes, no wildcards
    pub replacement: String,
}

impl PatchFile {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("failed to open patch file {}", path.to_string_lossy()))?;

        let patch_file: PatchFile = serde_yaml::from_reader(BufReader::new(file))
            .with_context(|| format!("failed to parse patch file {}", path.to_string_lossy()))?;

        log::debug!(
            "Loaded {} patch(es) from {}",
            patch_file.patches.len(),
            path.to_string_lossy()
        );
        Ok(patch_file)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(content).context("failed to parse patch file")
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval_ms.map(Duration::from_millis)
    }

    /// Compiles every entry, failing on the first invalid one.
    pub fn specs(&self) -> anyhow::Result<Vec<PatchSpec>> {
        if self.patches.is_empty() {
            anyhow::bail!("patch file contains no patches");
        }

        self.patches
            .iter()
            .enumerate()
            .map(|(index, entry)| {
                let spec = PatchSpec::parse(&entry.pattern, &entry.replacement)
                    .map_err(|err| anyhow::anyhow!(err.root_cause_string()))
                    .with_context(|| format!("invalid patch #{}", index + 1))?;

                Ok(match &entry.name {
                    Some(name) => spec.with_name(name.clone()),
                    None => spec,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
process: tf_linux64
module: client.so
interval_ms: 250
patches:
  - name: first
    pattern: "66 0F D6 83 ?? 02 00 00"
    replacement: "90 90 90 90 90 90 90 90"
  - pattern: "E8 46 60 EF"
    replacement: "EB 07"
"#;

    #[test]
    fn test_parse_sample() {
        let file = PatchFile::parse(SAMPLE).unwrap();
        assert_eq!(file.process.as_deref(), Some("tf_linux64"));
        assert_eq!(file.timeout(), None);
        assert_eq!(file.interval(), Some(Duration::from_millis(250)));

        let specs = file.specs().unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].label(), "first");
        assert_eq!(specs[0].pattern.as_slice()[4], None);
        assert_eq!(specs[1].replacement, vec![0xEB, 0x07]);
    }

    #[test]
    fn test_invalid_entry_names_index() {
        let file = PatchFile::parse(
            r#"
patches:
  - pattern: "66 0F"
    replacement: "90 XY"
"#,
        )
        .unwrap();

        let err = file.specs().unwrap_err();
        assert!(format!("{:#}", err).contains("invalid patch #1"));
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(PatchFile::parse("patches: []\nretries: 3\n").is_err());
    }

    #[test]
    fn test_empty_patch_list_rejected() {
        let file = PatchFile::parse("patches: []\n").unwrap();
        assert!(file.specs().is_err());
    }
}
