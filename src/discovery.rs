//! Workflow discovery across ranked locations.
//!
//! Three sources are scanned, lowest precedence first:
//!
//! | Source  | Location                                  |
//! |---------|-------------------------------------------|
//! | builtin | configurable, none by default             |
//! | user    | `<config_dir>/maverick/workflows`         |
//! | project | `<project_root>/.maverick/workflows`      |
//!
//! A workflow found in a higher source shadows same-named workflows from
//! lower ones. Two files defining the same name within one source are a
//! conflict and fail discovery.

use crate::serialization::parse_unresolved;
use crate::workflow::{deserialize_version, WorkflowDefinition};
use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Where a workflow came from. Ordered by precedence, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowSource {
    Builtin,
    User,
    Project,
}

impl fmt::Display for WorkflowSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkflowSource::Builtin => "builtin",
            WorkflowSource::User => "user",
            WorkflowSource::Project => "project",
        };
        f.write_str(name)
    }
}

/// Two or more files in one source defining the same workflow name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowConflict {
    pub name: String,
    pub source: WorkflowSource,
    /// Sorted
    pub paths: Vec<PathBuf>,
}

impl fmt::Display for WorkflowConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let paths: Vec<String> = self.paths.iter().map(|p| p.display().to_string()).collect();
        write!(
            f,
            "workflow '{}' is defined more than once in {} workflows: {}",
            self.name,
            self.source,
            paths.join(", ")
        )
    }
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("conflicting workflow definitions:\n{}", describe_conflicts(.0))]
    Conflict(Vec<WorkflowConflict>),
}

fn describe_conflicts(conflicts: &[WorkflowConflict]) -> String {
    conflicts
        .iter()
        .map(|c| format!("  {c}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// The cheap part of a document, read before the full parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowMetadata {
    pub name: String,
    pub version: String,
    pub description: String,
    /// Declared input names, sorted
    pub inputs: Vec<String>,
}

#[derive(Deserialize)]
struct RawMetadata {
    name: String,
    #[serde(deserialize_with = "deserialize_version")]
    version: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    inputs: BTreeMap<String, IgnoredAny>,
}

impl WorkflowMetadata {
    /// Read metadata without interpreting steps.
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        let raw: RawMetadata = serde_yaml::from_str(text)?;
        Ok(Self {
            name: raw.name,
            version: raw.version,
            description: raw.description,
            inputs: raw.inputs.into_keys().collect(),
        })
    }
}

/// A workflow selected by discovery.
#[derive(Debug, Clone)]
pub struct DiscoveredWorkflow {
    pub workflow: Arc<WorkflowDefinition>,
    pub metadata: WorkflowMetadata,
    pub file_path: PathBuf,
    pub source: WorkflowSource,
    /// Same-named files this one shadows, nearest source first
    pub overrides: Vec<PathBuf>,
}

/// A file that could not be loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedWorkflow {
    pub file_path: PathBuf,
    pub source: WorkflowSource,
    pub error: String,
}

/// Outcome of [`WorkflowDiscovery::discover`].
#[derive(Debug, Clone, Default)]
pub struct DiscoveryResult {
    workflows: BTreeMap<String, DiscoveredWorkflow>,
    skipped: Vec<SkippedWorkflow>,
    locations: Vec<(WorkflowSource, PathBuf)>,
}

impl DiscoveryResult {
    pub fn get_workflow(&self, name: &str) -> Option<&DiscoveredWorkflow> {
        self.workflows.get(name)
    }

    /// Names of every selected workflow, sorted.
    pub fn workflow_names(&self) -> Vec<String> {
        self.workflows.keys().cloned().collect()
    }

    /// Selected workflows, sorted by name.
    pub fn workflows(&self) -> impl Iterator<Item = &DiscoveredWorkflow> {
        self.workflows.values()
    }

    /// Selected workflows that came from `source`.
    pub fn workflows_from(&self, source: WorkflowSource) -> Vec<&DiscoveredWorkflow> {
        self.workflows.values().filter(|w| w.source == source).collect()
    }

    pub fn skipped(&self) -> &[SkippedWorkflow] {
        &self.skipped
    }

    /// Directories that were scanned, lowest precedence first.
    pub fn locations(&self) -> &[(WorkflowSource, PathBuf)] {
        &self.locations
    }

    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }
}

/// Scans workflow directories.
///
/// # Example
///
/// ```rust,no_run
/// use maverick_workflow::WorkflowDiscovery;
///
/// let found = WorkflowDiscovery::for_project(".").discover()?;
/// for name in found.workflow_names() {
///     println!("{name}");
/// }
/// # Ok::<(), maverick_workflow::DiscoveryError>(())
/// ```
#[derive(Debug, Clone, Default)]
pub struct WorkflowDiscovery {
    builtin_dir: Option<PathBuf>,
    user_dir: Option<PathBuf>,
    project_dir: Option<PathBuf>,
}

impl WorkflowDiscovery {
    /// Discovery with no locations configured.
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard user and project locations for `project_root`.
    pub fn for_project(project_root: impl AsRef<Path>) -> Self {
        Self {
            builtin_dir: None,
            user_dir: dirs::config_dir().map(|dir| dir.join("maverick").join("workflows")),
            project_dir: Some(project_root.as_ref().join(".maverick").join("workflows")),
        }
    }

    pub fn with_builtin_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.builtin_dir = Some(dir.into());
        self
    }

    pub fn with_user_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.user_dir = Some(dir.into());
        self
    }

    pub fn with_project_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.project_dir = Some(dir.into());
        self
    }

    /// Configured locations, lowest precedence first.
    pub fn locations(&self) -> Vec<(WorkflowSource, PathBuf)> {
        [
            (WorkflowSource::Builtin, &self.builtin_dir),
            (WorkflowSource::User, &self.user_dir),
            (WorkflowSource::Project, &self.project_dir),
        ]
        .into_iter()
        .filter_map(|(source, dir)| dir.clone().map(|d| (source, d)))
        .collect()
    }

    /// Scan every location and apply precedence.
    ///
    /// Precedence and conflicts are decided from metadata alone; only the
    /// selected file for each name is parsed in full. If that parse fails the
    /// file is skipped and the next shadowed file is tried.
    pub fn discover(&self) -> Result<DiscoveryResult, DiscoveryError> {
        let mut result = DiscoveryResult {
            locations: self.locations(),
            ..DiscoveryResult::default()
        };
        let mut conflicts = Vec::new();
        // nearest source first
        let mut ranked: BTreeMap<String, Vec<Candidate>> = BTreeMap::new();

        for (source, dir) in self.locations() {
            let mut by_name: BTreeMap<String, Vec<Candidate>> = BTreeMap::new();
            for path in workflow_files(&dir) {
                match Candidate::read(path.clone(), source) {
                    Ok(found) => by_name
                        .entry(found.metadata.name.clone())
                        .or_default()
                        .push(found),
                    Err(error) => result.skip(path, source, error),
                }
            }

            for (name, mut found) in by_name {
                if found.len() > 1 {
                    let mut paths: Vec<PathBuf> = found.into_iter().map(|f| f.file_path).collect();
                    paths.sort();
                    conflicts.push(WorkflowConflict { name, source, paths });
                    continue;
                }
                if let Some(candidate) = found.pop() {
                    ranked.entry(name).or_default().insert(0, candidate);
                }
            }
        }

        if !conflicts.is_empty() {
            return Err(DiscoveryError::Conflict(conflicts));
        }

        for (name, candidates) in ranked {
            let mut candidates = candidates.into_iter();
            while let Some(candidate) = candidates.next() {
                let (path, source) = (candidate.file_path.clone(), candidate.source);
                match candidate.load() {
                    Ok(mut selected) => {
                        selected.overrides =
                            candidates.map(|shadowed| shadowed.file_path).collect();
                        if !selected.overrides.is_empty() {
                            tracing::debug!(
                                workflow = %name,
                                %source,
                                shadowed = selected.overrides.len(),
                                "workflow overridden"
                            );
                        }
                        result.workflows.insert(name, selected);
                        break;
                    }
                    Err(error) => result.skip(path, source, error),
                }
            }
        }

        tracing::info!(
            workflows = result.workflows.len(),
            skipped = result.skipped.len(),
            "workflow discovery finished"
        );
        Ok(result)
    }
}

/// `*.yaml` and `*.yml` files directly under `dir`, sorted. A missing or
/// unreadable directory yields nothing.
fn workflow_files(dir: &Path) -> Vec<PathBuf> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            tracing::warn!(path = %dir.display(), error = %e, "cannot read workflow directory");
            return Vec::new();
        }
    };

    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml")
            )
        })
        .collect();
    files.sort();
    files
}

/// A file whose metadata has been read but whose steps have not.
struct Candidate {
    metadata: WorkflowMetadata,
    file_path: PathBuf,
    source: WorkflowSource,
    text: String,
}

impl Candidate {
    fn read(file_path: PathBuf, source: WorkflowSource) -> Result<Self, String> {
        let text = std::fs::read_to_string(&file_path).map_err(|e| e.to_string())?;
        let metadata = WorkflowMetadata::from_yaml(&text)
            .map_err(|e| format!("invalid workflow metadata: {e}"))?;
        Ok(Self {
            metadata,
            file_path,
            source,
            text,
        })
    }

    fn load(self) -> Result<DiscoveredWorkflow, String> {
        let workflow = parse_unresolved(&self.text).map_err(|e| e.to_string())?;
        Ok(DiscoveredWorkflow {
            workflow: Arc::new(workflow),
            metadata: self.metadata,
            file_path: self.file_path,
            source: self.source,
            overrides: Vec::new(),
        })
    }
}

impl DiscoveryResult {
    fn skip(&mut self, file_path: PathBuf, source: WorkflowSource, error: String) {
        tracing::warn!(path = %file_path.display(), %source, %error, "skipping workflow file");
        self.skipped.push(SkippedWorkflow {
            file_path,
            source,
            error,
        });
    }
}
