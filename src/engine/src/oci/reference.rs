//! Image reference parsing.
//!
//! `alpine` expands to `docker.io/library/alpine:latest`; a first path
//! component containing `.` or `:`, or equal to `localhost`, names the
//! registry.

use kiln_core::error::{BuildError, Result};

pub const DEFAULT_REGISTRY: &str = "docker.io";
const DEFAULT_TAG: &str = "latest";

/// Parsed registry image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageReference {
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(invalid(reference, "empty reference"));
        }

        let (name_tag, digest) = match reference.rsplit_once('@') {
            Some((name, digest)) => {
                if !digest.contains(':') {
                    return Err(invalid(reference, "digest must be algorithm:hex"));
                }
                (name, Some(digest.to_string()))
            }
            None => (reference, None),
        };

        // A tag can only follow the last '/'; a purely numeric suffix on a
        // single-component name is a registry port.
        let last_slash = name_tag.rfind('/').map(|p| p + 1).unwrap_or(0);
        let (name, tag) = match name_tag[last_slash..].rfind(':') {
            Some(colon) => {
                let split = last_slash + colon;
                let tag = &name_tag[split + 1..];
                let is_port = last_slash == 0
                    && digest.is_none()
                    && !tag.is_empty()
                    && tag.chars().all(|c| c.is_ascii_digit());
                if is_port {
                    (name_tag, None)
                } else {
                    (&name_tag[..split], Some(tag.to_string()))
                }
            }
            None => (name_tag, None),
        };
        if name.is_empty() || tag.as_deref() == Some("") {
            return Err(invalid(reference, "missing name or tag"));
        }
        if name.chars().any(|c| c.is_ascii_uppercase() || c.is_whitespace()) {
            return Err(invalid(reference, "repository names must be lowercase"));
        }

        let (registry, repository) = split_registry(name, reference)?;
        let tag = match (&tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            _ => tag,
        };
        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// `registry/repository[:tag][@digest]`
    pub fn full_reference(&self) -> String {
        let mut s = format!("{}/{}", self.registry, self.repository);
        if let Some(tag) = &self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(digest) = &self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }

    /// Short form used in listings: Docker Hub prefixes are dropped.
    pub fn familiar(&self) -> String {
        let full = self.full_reference();
        full.strip_prefix("docker.io/library/")
            .or_else(|| full.strip_prefix("docker.io/"))
            .map(str::to_string)
            .unwrap_or(full)
    }

    /// Same repository with a different tag.
    pub fn with_tag(&self, tag: &str) -> Self {
        Self {
            tag: Some(tag.to_string()),
            digest: None,
            ..self.clone()
        }
    }
}

fn split_registry(name: &str, reference: &str) -> Result<(String, String)> {
    if let Some((first, rest)) = name.split_once('/') {
        if first.contains('.') || first.contains(':') || first == "localhost" {
            if rest.is_empty() {
                return Err(invalid(reference, "empty repository"));
            }
            return Ok((first.to_string(), rest.to_string()));
        }
        return Ok((DEFAULT_REGISTRY.to_string(), name.to_string()));
    }
    Ok((DEFAULT_REGISTRY.to_string(), format!("library/{}", name)))
}

fn invalid(reference: &str, why: &str) -> BuildError {
    BuildError::Usage(format!("invalid image reference '{}': {}", reference, why))
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

impl std::str::FromStr for ImageReference {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_name() {
        let r = ImageReference::parse("alpine").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "library/alpine");
        assert_eq!(r.tag.as_deref(), Some("latest"));
        assert_eq!(r.digest, None);
    }

    #[test]
    fn test_parse_user_repo_with_tag() {
        let r = ImageReference::parse("team/tool:v1.0").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "team/tool");
        assert_eq!(r.tag.as_deref(), Some("v1.0"));
    }

    #[test]
    fn test_parse_registry_with_port() {
        let r = ImageReference::parse("registry.local:5000/app:v1").unwrap();
        assert_eq!(r.registry, "registry.local:5000");
        assert_eq!(r.repository, "app");
        assert_eq!(r.tag.as_deref(), Some("v1"));

        let r = ImageReference::parse("localhost:5000/app").unwrap();
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.tag.as_deref(), Some("latest"));
    }

    #[test]
    fn test_parse_digest_without_tag() {
        let digest = format!("sha256:{}", "ab".repeat(32));
        let r = ImageReference::parse(&format!("ghcr.io/org/app@{}", digest)).unwrap();
        assert_eq!(r.registry, "ghcr.io");
        assert_eq!(r.repository, "org/app");
        assert_eq!(r.tag, None);
        assert_eq!(r.digest.as_deref(), Some(digest.as_str()));
    }

    #[test]
    fn test_parse_tag_and_digest() {
        let r = ImageReference::parse("ghcr.io/org/app:v2@sha256:abc").unwrap();
        assert_eq!(r.tag.as_deref(), Some("v2"));
        assert_eq!(r.digest.as_deref(), Some("sha256:abc"));
        assert_eq!(r.full_reference(), "ghcr.io/org/app:v2@sha256:abc");
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(ImageReference::parse("").is_err());
        assert!(ImageReference::parse("app@nodigest").is_err());
        assert!(ImageReference::parse("App:latest").is_err());
        assert!(ImageReference::parse("app:").is_err());
    }

    #[test]
    fn test_familiar() {
        assert_eq!(ImageReference::parse("alpine:3").unwrap().familiar(), "alpine:3");
        assert_eq!(ImageReference::parse("team/tool").unwrap().familiar(), "team/tool:latest");
        assert_eq!(
            ImageReference::parse("ghcr.io/org/app:v1").unwrap().familiar(),
            "ghcr.io/org/app:v1"
        );
    }

    #[test]
    fn test_with_tag() {
        let r = ImageReference::parse("ghcr.io/org/app@sha256:abc").unwrap();
        assert_eq!(r.with_tag("v3").full_reference(), "ghcr.io/org/app:v3");
    }
}
