//! Inputs and outputs of a build.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use super::progress::LogSink;
use crate::digest::Digest;
use crate::oci::manifest::{Compression, ManifestFormat};
use crate::sandbox::{NetworkMode, TransientMount};
use crate::script::Script;
use crate::store::image::{ImageId, PullPolicy};

/// Where the build context comes from.
pub enum ContextSource {
    /// A directory on the host
    Dir(PathBuf),
    /// A tar stream, extracted to a private directory first
    Tar(Box<dyn Read + Send>),
}

impl std::fmt::Debug for ContextSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContextSource::Dir(path) => f.debug_tuple("Dir").field(path).finish(),
            ContextSource::Tar(_) => f.write_str("Tar(..)"),
        }
    }
}

/// A build request.
#[derive(Debug)]
pub struct BuildRequest {
    /// Parsed scripts; the first is the primary one, the others only
    /// contribute stages
    pub scripts: Vec<Script>,
    pub context: ContextSource,
    /// `--build-arg` values
    pub build_args: BTreeMap<String, String>,
    /// Stage to build, by name or index; defaults to the last stage of the
    /// primary script
    pub target: Option<String>,
    /// Name the image is tagged with
    pub output_name: Option<String>,
    pub additional_tags: Vec<String>,
    pub pull_policy: PullPolicy,
    pub cache_enabled: bool,
    pub compression: Compression,
    pub manifest_format: ManifestFormat,
    /// Bind mounts present only while RUN commands execute
    pub transient_mounts: Vec<TransientMount>,
    pub network: NetworkMode,
    pub log_sink: Option<LogSink>,
    pub cancel: CancellationToken,
    /// Pins every `created` time of the image
    pub timestamp: Option<DateTime<Utc>>,
}

impl BuildRequest {
    /// Request with default options.
    pub fn new(scripts: Vec<Script>, context: ContextSource) -> Self {
        Self {
            scripts,
            context,
            build_args: BTreeMap::new(),
            target: None,
            output_name: None,
            additional_tags: Vec::new(),
            pull_policy: PullPolicy::IfMissing,
            cache_enabled: true,
            compression: Compression::Gzip,
            manifest_format: ManifestFormat::OciV1,
            transient_mounts: Vec::new(),
            network: NetworkMode::Enabled,
            log_sink: None,
            cancel: CancellationToken::new(),
            timestamp: None,
        }
    }

    /// Every name the image is tagged with, output name first.
    pub fn names(&self) -> Vec<String> {
        self.output_name
            .iter()
            .chain(self.additional_tags.iter())
            .cloned()
            .collect()
    }
}

/// Result of a successful build.
#[derive(Debug, Clone)]
pub struct BuildResult {
    pub image_id: ImageId,
    pub manifest_digest: Digest,
    /// Output name if one was given, else the image id
    pub reference: String,
    /// Names the image is tagged with
    pub tags: Vec<String>,
    pub layer_count: usize,
    /// Sum of the uncompressed layer diffs
    pub size: u64,
    /// RUN commands actually executed
    pub runs_executed: usize,
    /// Steps satisfied from the layer cache
    pub cache_hits: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_output_first() {
        let script = Script::parse("FROM scratch\n").unwrap();
        let mut request = BuildRequest::new(vec![script], ContextSource::Dir("/ctx".into()));
        assert!(request.names().is_empty());
        request.output_name = Some("app:1".into());
        request.additional_tags = vec!["app:latest".into()];
        assert_eq!(request.names(), vec!["app:1", "app:latest"]);
        assert!(request.cache_enabled);
        assert_eq!(request.pull_policy, PullPolicy::IfMissing);
    }
}
