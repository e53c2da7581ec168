//! Canonical collection identifiers and dependency specs.
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::RuleError;

/// A normalized collection identifier, `host/owner/name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CollectionId(String);

impl CollectionId {
    /// Normalize `raw` into canonical form.
    ///
    /// A bare `owner/name` gets `default_host` prepended. Otherwise the
    /// scheme, a leading `www.`, trailing slashes and a `.git` suffix are
    /// stripped; scp-style `git@host:owner/name` is accepted too.
    ///
    /// # Errors
    ///
    /// Returns [`RuleError::InvalidIdentifier`] if fewer than three path
    /// segments remain or a segment is empty, `.` or `..`.
    pub fn normalize(raw: &str, default_host: &str) -> Result<Self, RuleError> {
        let invalid = || RuleError::InvalidIdentifier(raw.to_string());
        let mut rest = raw.trim();

        let had_scheme = if let Some((_, after)) = rest.split_once("://") {
            rest = after;
            true
        } else {
            false
        };
        let scp;
        if !had_scheme
            && let Some(after_user) = rest.strip_prefix("git@")
            && let Some((host, path)) = after_user.split_once(':')
        {
            scp = format!("{host}/{path}");
            rest = &scp;
        }
        if let Some((user, after)) = rest.split_once('@')
            && !user.contains('/')
        {
            rest = after;
        }

        let mut rest = rest.strip_prefix("www.").unwrap_or(rest);
        rest = rest.trim_end_matches('/');
        rest = rest.strip_suffix(".git").unwrap_or(rest);
        rest = rest.trim_end_matches('/');

        let segments: Vec<&str> = rest.split('/').collect();
        if segments
            .iter()
            .any(|s| s.is_empty() || *s == "." || *s == "..")
        {
            return Err(invalid());
        }
        let canonical = match segments.len() {
            2 if !had_scheme => format!("{default_host}/{rest}"),
            n if n >= 3 => rest.to_string(),
            _ => return Err(invalid()),
        };
        Ok(Self(canonical.to_lowercase()))
    }

    /// Canonical form, `host/owner/name`.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// URL to clone the collection from.
    #[must_use]
    pub fn clone_url(&self) -> String {
        format!("https://{}", self.0)
    }

    /// Local checkout directory under `rulesets_dir`.
    #[must_use]
    pub fn local_dir(&self, rulesets_dir: &Path) -> PathBuf {
        self.0.split('/').fold(rulesets_dir.to_path_buf(), |dir, s| dir.join(s))
    }
}

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A declared dependency: `identifier[@version]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DependencySpec {
    /// The collection.
    pub collection: CollectionId,
    /// Tag, branch or commit to check out.
    pub version: Option<String>,
}

impl DependencySpec {
    /// Parse `raw`, splitting a trailing `@version` off the identifier.
    ///
    /// The `@` of an scp-style `git@host:` prefix is not a version separator.
    ///
    /// # Errors
    ///
    /// Returns [`RuleError::InvalidIdentifier`] if the identifier is invalid
    /// or the version is empty.
    pub fn parse(raw: &str, default_host: &str) -> Result<Self, RuleError> {
        let raw = raw.trim();
        let (identifier, version) = match raw.rsplit_once('@') {
            Some((id, version)) if !version.contains('/') && !version.contains(':') => {
                if version.is_empty() {
                    return Err(RuleError::InvalidIdentifier(raw.to_string()));
                }
                (id, Some(version.to_string()))
            }
            _ => (raw, None),
        };
        Ok(Self {
            collection: CollectionId::normalize(identifier, default_host)?,
            version,
        })
    }
}

impl fmt::Display for DependencySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(v) => write!(f, "{}@{v}", self.collection),
            None => write!(f, "{}", self.collection),
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    fn norm(raw: &str) -> String {
        CollectionId::normalize(raw, "github.com").unwrap().to_string()
    }

    #[test]
    fn bare_owner_name_gets_default_host() {
        assert_eq!(norm("avorty/spito-ruleset"), "github.com/avorty/spito-ruleset");
    }

    #[test]
    fn scheme_www_slash_and_git_are_stripped() {
        assert_eq!(norm("https://www.github.com/o/n.git/"), "github.com/o/n");
        assert_eq!(norm("http://gitlab.com/o/n/"), "gitlab.com/o/n");
        assert_eq!(norm("git@github.com:o/n.git"), "github.com/o/n");
        assert_eq!(norm("ssh://git@github.com/o/n"), "github.com/o/n");
    }

    #[test]
    fn host_paths_are_kept() {
        assert_eq!(norm("codeberg.org/o/n"), "codeberg.org/o/n");
        assert_eq!(norm("gitlab.com/group/sub/n"), "gitlab.com/group/sub/n");
    }

    #[test]
    fn invalid_identifiers_are_rejected() {
        for raw in ["", "single", "https://github.com/only", "o//n", "o/../n"] {
            assert!(
                CollectionId::normalize(raw, "github.com").is_err(),
                "{raw} should be rejected"
            );
        }
    }

    #[test]
    fn clone_url_and_local_dir() {
        let id = CollectionId::normalize("o/n", "github.com").unwrap();
        assert_eq!(id.clone_url(), "https://github.com/o/n");
        assert_eq!(
            id.local_dir(Path::new("/r")),
            PathBuf::from("/r/github.com/o/n")
        );
    }

    #[test]
    fn dependency_version_is_split() {
        let spec = DependencySpec::parse("o/n@v1.2.0", "github.com").unwrap();
        assert_eq!(spec.collection.as_str(), "github.com/o/n");
        assert_eq!(spec.version.as_deref(), Some("v1.2.0"));
        assert_eq!(spec.to_string(), "github.com/o/n@v1.2.0");
    }

    #[test]
    fn scp_prefix_is_not_a_version() {
        let spec = DependencySpec::parse("git@github.com:o/n", "github.com").unwrap();
        assert_eq!(spec.collection.as_str(), "github.com/o/n");
        assert!(spec.version.is_none());
    }

    #[test]
    fn empty_version_is_rejected() {
        assert!(DependencySpec::parse("o/n@", "github.com").is_err());
    }
}
