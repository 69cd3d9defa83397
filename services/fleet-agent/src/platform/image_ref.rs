//! Image reference parsing.
//!
//! A worker service may name its image by tag or pin it to a digest
//! (`repo:tag@sha256:...`). Rollouts match services by repository and tag
//! and redeploy them on the unpinned tag.

use std::fmt;

/// A parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    /// Registry host and repository path, e.g. `ghcr.io/org/bot`.
    pub repository: String,

    /// Tag, `latest` when the reference has none.
    pub tag: String,

    /// Pinned digest, e.g. `sha256:abc...`.
    pub digest: Option<String>,
}

impl ImageRef {
    /// Parse an image reference.
    pub fn parse(image: &str) -> Self {
        let (name_part, digest) = match image.rsplit_once('@') {
            Some((name, digest)) => (name, Some(digest.to_string())),
            None => (image, None),
        };

        let (repository, tag) = match name_part.rsplit_once(':') {
            // A colon followed by a slash belongs to a registry port, not a tag.
            Some((name, tag)) if !tag.contains('/') => (name, tag),
            _ => (name_part, "latest"),
        };

        Self {
            repository: repository.to_string(),
            tag: tag.to_string(),
            digest,
        }
    }

    /// Query parameters for a pull: (`fromImage`, `tag`).
    pub fn pull_params(&self) -> (String, String) {
        (self.repository.clone(), self.tag.clone())
    }

    /// The same repository and tag with any pinned digest dropped.
    pub fn unpinned(&self) -> ImageRef {
        ImageRef {
            digest: None,
            ..self.clone()
        }
    }

    /// True if both references name the same repository and tag,
    /// regardless of any pinned digest.
    pub fn same_image(&self, other: &ImageRef) -> bool {
        self.repository == other.repository && self.tag == other.tag
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)?;
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}
