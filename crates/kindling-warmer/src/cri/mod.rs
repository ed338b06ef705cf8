//! Container runtime image surface
//!
//! The warmer consumes the runtime through exactly three operations: pull
//! (returning a progress stream), list, and remove. Everything else — the
//! existence checks, reference parsing, and registry normalization — is
//! runtime-agnostic and lives here.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use kindling_common::Result;

use crate::creds::RegistryAuth;

pub mod docker;

pub use docker::{DockerImageService, DEFAULT_RUNTIME_ENDPOINT};

/// One decoded progress event from an in-flight pull
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PullProgress {
    /// Layer or object id the event refers to, when present
    pub id: Option<String>,
    /// Status line ("Downloading", "Extracting", ...)
    pub status: String,
    /// Rendered progress detail ("[=====>   ] 12MB/34MB"), when present
    pub detail: Option<String>,
}

impl PullProgress {
    /// Render the event as a single log-friendly line
    pub fn render(&self) -> String {
        let mut line = String::new();
        if let Some(id) = &self.id {
            line.push_str(id);
            line.push_str(": ");
        }
        line.push_str(&self.status);
        if let Some(detail) = &self.detail {
            line.push(' ');
            line.push_str(detail);
        }
        line
    }
}

/// Stream of progress events terminated by end-of-pull or an error
pub type ProgressStream = Pin<Box<dyn Stream<Item = Result<PullProgress>> + Send>>;

/// An image present on the node, as reported by the runtime
#[derive(Clone, Debug, Default)]
pub struct ImageInfo {
    /// Runtime image id
    pub id: String,
    /// Repository:tag references
    pub repo_tags: Vec<String>,
    /// Repository@digest references
    pub repo_digests: Vec<String>,
    /// Disk size in bytes
    pub size: i64,
}

impl ImageInfo {
    /// True when any repo tag parses to exactly (name, tag)
    pub fn contains_image(&self, name: &str, tag: &str) -> bool {
        self.repo_tags.iter().any(|repo_tag| {
            let (repo, parsed_tag) = parse_repository_tag(repo_tag);
            repo == name && parsed_tag == tag
        })
    }

    /// True when any repo digest equals the digest-qualified reference
    pub fn contains_digest(&self, image_ref: &str) -> bool {
        self.repo_digests.iter().any(|digest| digest == image_ref)
    }
}

/// The three-operation runtime surface consumed by the pull pipeline
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ImageService: Send + Sync {
    /// Initiate a pull with the given credential (or anonymously) and
    /// return the runtime's progress stream
    async fn pull(&self, image_ref: &str, auth: Option<RegistryAuth>) -> Result<ProgressStream>;

    /// List the images present on the node
    async fn list(&self) -> Result<Vec<ImageInfo>>;

    /// Remove an image from the node
    async fn remove(&self, image_ref: &str) -> Result<()>;
}

/// Split a reference into (repository, tag-or-digest).
///
/// The tag is confusing because of ports in repository names:
///   `localhost:5000/samalba/hipache:latest` → (`localhost:5000/samalba/hipache`, `latest`)
///   `localhost:5000/foo/bar@sha256:bc88...` → (`localhost:5000/foo/bar`, `sha256:bc88...`)
/// An `@` digest delimiter takes precedence over colon-splitting; the last
/// `:` only delimits a tag when not followed by a `/`.
pub fn parse_repository_tag(repos: &str) -> (&str, &str) {
    if let Some(idx) = repos.find('@') {
        return (&repos[..idx], &repos[idx + 1..]);
    }
    if let Some(idx) = repos.rfind(':') {
        let tag = &repos[idx + 1..];
        if !tag.contains('/') {
            return (&repos[..idx], tag);
        }
    }
    (repos, "")
}

/// Registry host of an image reference (everything before the first `/`)
pub fn parse_registry(image_ref: &str) -> &str {
    match image_ref.find('/') {
        Some(idx) => &image_ref[..idx],
        None => image_ref,
    }
}

/// Strip a default-registry prefix so references compare equal to the
/// runtime's unprefixed repo tags
pub fn strip_default_registry(image_ref: &str) -> &str {
    image_ref
        .strip_prefix("docker.io/")
        .or_else(|| image_ref.strip_prefix("index.docker.io/"))
        .unwrap_or(image_ref)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_repository_tag_plain() {
        assert_eq!(parse_repository_tag("library/redis:7"), ("library/redis", "7"));
    }

    #[test]
    fn parse_repository_tag_untagged() {
        assert_eq!(parse_repository_tag("library/redis"), ("library/redis", ""));
    }

    #[test]
    fn parse_repository_tag_with_registry_port() {
        assert_eq!(
            parse_repository_tag("localhost.localdomain:5000/samalba/hipache:latest"),
            ("localhost.localdomain:5000/samalba/hipache", "latest")
        );
        // The port colon must not be mistaken for a tag delimiter
        assert_eq!(
            parse_repository_tag("localhost:5000/foo/bar"),
            ("localhost:5000/foo/bar", "")
        );
    }

    #[test]
    fn parse_repository_tag_digest_takes_precedence() {
        assert_eq!(
            parse_repository_tag("localhost:5000/foo/bar@sha256:bc8813ea7b36"),
            ("localhost:5000/foo/bar", "sha256:bc8813ea7b36")
        );
    }

    #[test]
    fn parse_registry_variants() {
        assert_eq!(parse_registry("quay.io/team/app:v1"), "quay.io");
        assert_eq!(parse_registry("localhost:5000/app"), "localhost:5000");
        assert_eq!(parse_registry("redis"), "redis");
    }

    #[test]
    fn strip_default_registry_variants() {
        assert_eq!(strip_default_registry("docker.io/library/redis:7"), "library/redis:7");
        assert_eq!(
            strip_default_registry("index.docker.io/library/redis:7"),
            "library/redis:7"
        );
        assert_eq!(strip_default_registry("quay.io/team/app:v1"), "quay.io/team/app:v1");
    }

    #[test]
    fn image_info_tag_matching() {
        let info = ImageInfo {
            repo_tags: vec!["library/redis:7".to_string(), "library/redis:latest".to_string()],
            ..Default::default()
        };
        assert!(info.contains_image("library/redis", "7"));
        assert!(info.contains_image("library/redis", "latest"));
        assert!(!info.contains_image("library/redis", "6"));
        assert!(!info.contains_image("library/postgres", "7"));
    }

    #[test]
    fn image_info_digest_matching_ignores_tags() {
        let info = ImageInfo {
            repo_tags: vec!["repo:latest".to_string()],
            repo_digests: vec!["repo@sha256:abcd".to_string()],
            ..Default::default()
        };
        assert!(info.contains_digest("repo@sha256:abcd"));
        assert!(!info.contains_digest("repo@sha256:ffff"));
    }

    #[test]
    fn pull_progress_render() {
        let event = PullProgress {
            id: Some("a1b2c3".to_string()),
            status: "Downloading".to_string(),
            detail: Some("[=>   ] 1MB/5MB".to_string()),
        };
        assert_eq!(event.render(), "a1b2c3: Downloading [=>   ] 1MB/5MB");

        let bare = PullProgress {
            id: None,
            status: "Pulling from library/redis".to_string(),
            detail: None,
        };
        assert_eq!(bare.render(), "Pulling from library/redis");
    }
}
