//! Creating new instance directories from templates.
//!
//! A template is a JSON file like:
//!
//! ```json
//! {
//!   "name": "survival",
//!   "directories": ["world", "plugins"],
//!   "files": [
//!     {"path": "config.json", "content": "{\"startCommand\": \"run.sh\"}"},
//!     {"path": "run.sh", "from_file": "scripts/run.sh"}
//!   ]
//! }
//! ```
//!
//! `from_file` paths are relative to the template file, and are read when the template is
//! loaded.

use crate::instances::valid_name;
use serde::Deserialize;
use slog_scope::{debug, info};
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScaffoldError {
    #[error("could not read template {path:?}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("template {path:?} is malformed")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{0:?} can't be used as an instance name")]
    InvalidName(String),

    #[error("path {0:?} points outside the instance directory")]
    EscapingPath(PathBuf),

    #[error("file {0:?} needs either `content` or `from_file`")]
    MissingContent(PathBuf),

    #[error("instance {0:?} already exists")]
    AlreadyExists(String),

    #[error("could not write {path:?}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct TemplateFile {
    name: String,
    #[serde(default)]
    directories: Vec<PathBuf>,
    #[serde(default)]
    files: Vec<FileEntry>,
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct FileEntry {
    path: PathBuf,
    content: Option<String>,
    from_file: Option<PathBuf>,
}

/// The layout of a new instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    name: String,
    directories: Vec<PathBuf>,
    files: Vec<(PathBuf, Vec<u8>)>,
}

/// Makes sure `path` stays below the directory it gets joined to.
fn contained(path: &Path) -> Result<&Path, ScaffoldError> {
    let escapes = path.as_os_str().is_empty()
        || path
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(ScaffoldError::EscapingPath(path.to_owned()));
    }
    Ok(path)
}

impl Template {
    pub fn new(name: &str) -> Result<Template, ScaffoldError> {
        if !valid_name(name) {
            return Err(ScaffoldError::InvalidName(name.to_string()));
        }
        Ok(Template {
            name: name.to_string(),
            directories: vec![],
            files: vec![],
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_directory(mut self, path: impl AsRef<Path>) -> Result<Template, ScaffoldError> {
        self.directories.push(contained(path.as_ref())?.to_owned());
        Ok(self)
    }

    pub fn add_file(
        mut self,
        path: impl AsRef<Path>,
        content: impl Into<Vec<u8>>,
    ) -> Result<Template, ScaffoldError> {
        let path = contained(path.as_ref())?.to_owned();
        self.files.push((path, content.into()));
        Ok(self)
    }

    /// Loads a template from a JSON file, reading the contents of every `from_file` entry.
    pub fn from_json(path: &Path) -> Result<Template, ScaffoldError> {
        let read_error = |path: &Path| {
            let path = path.to_owned();
            move |source| ScaffoldError::Read { path, source }
        };
        let contents = fs::read_to_string(path).map_err(read_error(path))?;
        let parsed: TemplateFile =
            serde_json::from_str(&contents).map_err(|source| ScaffoldError::Malformed {
                path: path.to_owned(),
                source,
            })?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));

        let mut template = Template::new(&parsed.name)?;
        for dir in parsed.directories {
            template = template.add_directory(dir)?;
        }
        for file in parsed.files {
            let content = match (file.content, file.from_file) {
                (Some(content), _) => content.into_bytes(),
                (None, Some(source)) => {
                    let source = base.join(source);
                    debug!("reading template file"; "source" => ?source);
                    fs::read(&source).map_err(read_error(source.as_path()))?
                }
                (None, None) => return Err(ScaffoldError::MissingContent(file.path)),
            };
            template = template.add_file(file.path, content)?;
        }
        Ok(template)
    }

    /// Creates the instance below `root` and returns its directory. Refuses to touch an
    /// existing instance.
    pub fn generate(&self, root: &Path) -> Result<PathBuf, ScaffoldError> {
        let base = root.join(&self.name);
        if base.exists() {
            return Err(ScaffoldError::AlreadyExists(self.name.clone()));
        }
        let create_dir = |dir: &Path| {
            fs::create_dir_all(dir).map_err(|source| ScaffoldError::Write {
                path: dir.to_owned(),
                source,
            })
        };

        create_dir(&base)?;
        for dir in &self.directories {
            create_dir(&base.join(dir))?;
        }
        for (path, content) in &self.files {
            let path = base.join(path);
            if let Some(parent) = path.parent() {
                create_dir(parent)?;
            }
            fs::write(&path, content).map_err(|source| ScaffoldError::Write {
                path: path.clone(),
                source,
            })?;
        }
        info!("created instance"; "instance" => &self.name, "path" => ?base,
              "directories" => self.directories.len(), "files" => self.files.len());
        Ok(base)
    }
}
