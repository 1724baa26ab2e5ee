//! Resource paths.
//!
//! A path is a sequence of segments relative to a database's `documents`
//! root. Documents sit at even depths (`users/alice`), collections at odd
//! depths (`users`, `users/alice/posts`).

use std::cmp::Ordering;
use std::fmt;

use thiserror::Error;

/// Result type for path parsing.
pub type PathResult<T> = Result<T, PathError>;

/// Errors raised while parsing or navigating resource paths.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("Path must not be empty")]
    Empty,

    #[error("Path \"{0}\" contains an empty segment")]
    EmptySegment(String),

    #[error("Path \"{0}\" must point to a document (even number of segments)")]
    NotADocument(String),

    #[error("Path \"{0}\" must point to a collection (odd number of segments)")]
    NotACollection(String),

    #[error("Resource name \"{name}\" is not within database \"{database}\"")]
    ForeignResource { name: String, database: String },
}

/// Immutable slash-separated resource path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourcePath {
    segments: Vec<String>,
}

impl ResourcePath {
    /// Parse a relative path such as `users/alice/posts`.
    ///
    /// Leading and trailing slashes are tolerated; empty inner segments
    /// (`a//b`) are rejected.
    pub fn parse(path: &str) -> PathResult<Self> {
        let trimmed = path.trim_matches('/');
        if trimmed.is_empty() {
            return Err(PathError::Empty);
        }

        let segments: Vec<String> = trimmed.split('/').map(str::to_string).collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(PathError::EmptySegment(path.to_string()));
        }

        Ok(Self { segments })
    }

    /// Build a path from pre-split segments.
    pub fn from_segments<I, S>(segments: I) -> PathResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.is_empty() {
            return Err(PathError::Empty);
        }
        if segments.iter().any(|s| s.is_empty() || s.contains('/')) {
            return Err(PathError::EmptySegment(segments.join("/")));
        }
        Ok(Self { segments })
    }

    /// Return a new path with `child` (which may itself contain slashes) appended.
    pub fn append(&self, child: &str) -> PathResult<Self> {
        let child = Self::parse(child)?;
        let mut segments = self.segments.clone();
        segments.extend(child.segments);
        Ok(Self { segments })
    }

    /// Parent path, or `None` for a top-level collection.
    pub fn parent(&self) -> Option<Self> {
        if self.segments.len() <= 1 {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// Final segment (the document or collection id).
    pub fn last_segment(&self) -> &str {
        // Construction guarantees at least one segment.
        self.segments.last().map(String::as_str).unwrap_or_default()
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn is_document(&self) -> bool {
        self.segments.len() % 2 == 0
    }

    pub fn is_collection(&self) -> bool {
        self.segments.len() % 2 == 1
    }

    /// True if `self` equals `other` or is one of its ancestors.
    pub fn is_prefix_of(&self, other: &ResourcePath) -> bool {
        other.segments.len() >= self.segments.len()
            && self.segments.iter().zip(&other.segments).all(|(a, b)| a == b)
    }

    /// Slash-joined relative name, e.g. `users/alice`.
    pub fn relative_name(&self) -> String {
        self.segments.join("/")
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.relative_name())
    }
}

impl PartialOrd for ResourcePath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ResourcePath {
    /// Segment-wise ordering, matching how the backend orders `__name__`.
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.segments.iter().zip(&other.segments) {
            match a.cmp(b) {
                Ordering::Equal => continue,
                non_eq => return non_eq,
            }
        }
        self.segments.len().cmp(&other.segments.len())
    }
}

/// Identifies a database within a project.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DatabaseId {
    pub project_id: String,
    pub database_id: String,
}

impl DatabaseId {
    /// Default database id used when none is configured.
    pub const DEFAULT: &'static str = "(default)";

    pub fn new(project_id: impl Into<String>, database_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            database_id: database_id.into(),
        }
    }

    /// `projects/{project}/databases/{database}`
    pub fn database_root(&self) -> String {
        format!(
            "projects/{}/databases/{}",
            self.project_id, self.database_id
        )
    }

    /// `projects/{project}/databases/{database}/documents`
    pub fn documents_root(&self) -> String {
        format!("{}/documents", self.database_root())
    }

    /// Full resource name for a relative path.
    pub fn full_name(&self, path: &ResourcePath) -> String {
        format!("{}/{}", self.documents_root(), path.relative_name())
    }

    /// Parse a full resource name back into a relative path.
    pub fn relative_path(&self, full_name: &str) -> PathResult<ResourcePath> {
        let prefix = format!("{}/", self.documents_root());
        match full_name.strip_prefix(&prefix) {
            Some(rest) => ResourcePath::parse(rest),
            None => Err(PathError::ForeignResource {
                name: full_name.to_string(),
                database: self.database_root(),
            }),
        }
    }
}

impl fmt::Display for DatabaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.database_root())
    }
}
