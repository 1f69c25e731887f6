//! Image reference parsing and pinning checks.
//!
//! Parses references like `python:3.11-slim` or
//! `ghcr.io/org/runtime:1.2@sha256:...` into their components. A base
//! image is only accepted when it is pinned to an exact tag or digest.

use relaybox_core::error::{RelayError, Result};

/// Default registry when none is specified.
const DEFAULT_REGISTRY: &str = "docker.io";

/// Floating tag that never counts as pinned.
const FLOATING_TAG: &str = "latest";

/// Parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry hostname (e.g., "docker.io", "ghcr.io")
    pub registry: String,
    /// Repository path (e.g., "library/python")
    pub repository: String,
    /// Tag as written, if any (e.g., "3.11-slim")
    pub tag: Option<String>,
    /// Digest (e.g., "sha256:abc123...")
    pub digest: Option<String>,
    /// The reference exactly as written
    raw: String,
}

impl ImageReference {
    /// Parse an image reference string.
    ///
    /// - `python` → docker.io/library/python (no tag)
    /// - `python:3.11-slim` → docker.io/library/python:3.11-slim
    /// - `localhost:5000/runtime:1` → localhost:5000/runtime:1
    /// - `ghcr.io/org/img@sha256:abc` → digest only
    pub fn parse(reference: &str) -> Result<Self> {
        let raw = reference.trim();
        if raw.is_empty() {
            return Err(RelayError::OciImageError(
                "Empty image reference".to_string(),
            ));
        }

        let (name_tag, digest) = match raw.rsplit_once('@') {
            Some((name_tag, digest)) => {
                if !digest.contains(':') {
                    return Err(RelayError::OciImageError(format!(
                        "Invalid digest format in reference '{}': expected algorithm:hex",
                        raw
                    )));
                }
                (name_tag, Some(digest.to_string()))
            }
            None => (raw, None),
        };

        let (name, tag) = split_tag(name_tag);
        if let Some(ref tag) = tag {
            if tag.is_empty() {
                return Err(RelayError::OciImageError(format!(
                    "Empty tag in reference '{}'",
                    raw
                )));
            }
        }
        let (registry, repository) = split_registry_repository(name)?;

        Ok(ImageReference {
            registry,
            repository,
            tag,
            digest,
            raw: raw.to_string(),
        })
    }

    /// True when the reference names exactly one image version.
    ///
    /// A digest always pins. A tag pins unless it is the floating
    /// `latest`. No tag and no digest never pins.
    pub fn is_pinned(&self) -> bool {
        if self.digest.is_some() {
            return true;
        }
        matches!(self.tag.as_deref(), Some(tag) if tag != FLOATING_TAG)
    }

    /// Parse and require a pinned reference.
    pub fn parse_pinned(reference: &str) -> Result<Self> {
        let parsed = Self::parse(reference)?;
        if !parsed.is_pinned() {
            return Err(RelayError::RecipeError(format!(
                "Base image '{}' is not pinned: use an exact version tag or a digest (not '{}')",
                parsed.raw, FLOATING_TAG
            )));
        }
        Ok(parsed)
    }

    /// The reference exactly as written.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Fully-qualified reference string.
    pub fn full_reference(&self) -> String {
        let mut s = format!("{}/{}", self.registry, self.repository);
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

/// Split `name[:tag]`.
///
/// Only a colon in the last path component starts a tag; one in an
/// earlier component is a registry port. A name with no `/` has no
/// registry, so `python:3` is tag `3`.
fn split_tag(name_tag: &str) -> (&str, Option<String>) {
    let last_component_start = name_tag.rfind('/').map(|p| p + 1).unwrap_or(0);
    let last_component = &name_tag[last_component_start..];

    match last_component.rfind(':') {
        Some(colon) => (
            &name_tag[..last_component_start + colon],
            Some(last_component[colon + 1..].to_string()),
        ),
        None => (name_tag, None),
    }
}

/// Split a name into registry and repository components.
fn split_registry_repository(name: &str) -> Result<(String, String)> {
    if let Some((first, rest)) = name.split_once('/') {
        if first.contains('.') || first.contains(':') || first == "localhost" {
            if rest.is_empty() {
                return Err(RelayError::OciImageError(format!(
                    "Empty repository in reference '{}'",
                    name
                )));
            }
            return Ok((first.to_string(), rest.to_string()));
        }
    }

    if name.is_empty() {
        return Err(RelayError::OciImageError(
            "Empty repository in image reference".to_string(),
        ));
    }

    let repository = if name.contains('/') {
        name.to_string()
    } else {
        format!("library/{}", name)
    };
    Ok((DEFAULT_REGISTRY.to_string(), repository))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_official_image_with_tag() {
        let r = ImageReference::parse("python:3.11-slim").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "library/python");
        assert_eq!(r.tag, Some("3.11-slim".to_string()));
        assert_eq!(r.digest, None);
        assert_eq!(r.as_str(), "python:3.11-slim");
    }

    #[test]
    fn test_parse_no_tag_is_not_defaulted() {
        let r = ImageReference::parse("python").unwrap();
        assert_eq!(r.tag, None);
        assert!(!r.is_pinned());
    }

    #[test]
    fn test_parse_custom_registry() {
        let r = ImageReference::parse("ghcr.io/org/runtime:v0.1.0").unwrap();
        assert_eq!(r.registry, "ghcr.io");
        assert_eq!(r.repository, "org/runtime");
        assert_eq!(r.tag, Some("v0.1.0".to_string()));
    }

    #[test]
    fn test_parse_registry_with_port() {
        let r = ImageReference::parse("registry.local:5000/python:3.12").unwrap();
        assert_eq!(r.registry, "registry.local:5000");
        assert_eq!(r.repository, "python");
        assert_eq!(r.tag, Some("3.12".to_string()));
    }

    #[test]
    fn test_parse_numeric_tag_without_registry() {
        let r = ImageReference::parse("python:3").unwrap();
        assert_eq!(r.repository, "library/python");
        assert_eq!(r.tag, Some("3".to_string()));
        assert!(r.is_pinned());
        assert_eq!(r.full_reference(), "docker.io/library/python:3");

        let r = ImageReference::parse_pinned("node:20").unwrap();
        assert_eq!(r.repository, "library/node");
        assert_eq!(r.tag, Some("20".to_string()));

        let r = ImageReference::parse("localhost:5000/node:20").unwrap();
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.repository, "node");
        assert_eq!(r.tag, Some("20".to_string()));
    }

    #[test]
    fn test_parse_digest_only() {
        let r = ImageReference::parse("python@sha256:0123456789abcdef").unwrap();
        assert_eq!(r.repository, "library/python");
        assert_eq!(r.tag, None);
        assert_eq!(r.digest, Some("sha256:0123456789abcdef".to_string()));
        assert!(r.is_pinned());
    }

    #[test]
    fn test_parse_tag_and_digest() {
        let r = ImageReference::parse("ghcr.io/org/runtime:v1@sha256:abc").unwrap();
        assert_eq!(r.tag, Some("v1".to_string()));
        assert_eq!(r.digest, Some("sha256:abc".to_string()));
    }

    #[test]
    fn test_parse_invalid_digest() {
        assert!(ImageReference::parse("python@nodigest").is_err());
    }

    #[test]
    fn test_parse_empty() {
        assert!(ImageReference::parse("").is_err());
        assert!(ImageReference::parse("   ").is_err());
    }

    #[test]
    fn test_parse_empty_tag() {
        assert!(ImageReference::parse("python:").is_err());
    }

    #[test]
    fn test_latest_is_not_pinned() {
        let r = ImageReference::parse("python:latest").unwrap();
        assert!(!r.is_pinned());
        let err = ImageReference::parse_pinned("python:latest").unwrap_err();
        assert!(matches!(err, RelayError::RecipeError(_)));
    }

    #[test]
    fn test_parse_pinned_accepts_exact_tag() {
        let r = ImageReference::parse_pinned("python:3.11-slim").unwrap();
        assert!(r.is_pinned());
    }

    #[test]
    fn test_parse_pinned_rejects_missing_tag() {
        assert!(ImageReference::parse_pinned("python").is_err());
    }

    #[test]
    fn test_full_reference_and_display() {
        let r = ImageReference::parse("python:3.11-slim").unwrap();
        assert_eq!(r.full_reference(), "docker.io/library/python:3.11-slim");
        assert_eq!(format!("{}", r), "docker.io/library/python:3.11-slim");
    }

    #[test]
    fn test_deep_repository_path() {
        let r = ImageReference::parse("ghcr.io/org/sub/image:v1").unwrap();
        assert_eq!(r.repository, "org/sub/image");
        assert_eq!(r.tag, Some("v1".to_string()));
    }
}
