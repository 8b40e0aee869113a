//! Application runtime snapshot the worker answers queries from.
//!
//! The worker boots from a manifest describing what the application knows
//! about itself: its models, the other constants it has loaded, and its
//! routing table.
//!
//! ```json
//! {
//!   "schema_file": "db/schema.rb",
//!   "models": [
//!     {"name": "ApplicationRecord", "abstract": true},
//!     {"name": "User", "columns": [["id", "integer"], ["name", "string"]]}
//!   ],
//!   "classes": ["Time"],
//!   "routes": [
//!     {"controller": "users", "action": "index", "verb": "GET",
//!      "path": "/users(.:format)", "source_location": ["config/routes.rb", 4]}
//!   ]
//! }
//! ```
//!
//! Relative paths are resolved against the directory holding the manifest.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use introspect::{ModelInfo, RouteInfo, SourceLocation};
use serde::Deserialize;

use crate::error::{Result, WorkerError};

#[derive(Debug, Deserialize)]
struct Manifest {
    schema_file: PathBuf,
    #[serde(default)]
    models: Vec<ModelEntry>,
    #[serde(default)]
    classes: Vec<String>,
    #[serde(default)]
    routes: Vec<RouteEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    name: String,
    #[serde(default, rename = "abstract")]
    is_abstract: bool,
    #[serde(default)]
    columns: Vec<(String, String)>,
}

#[derive(Debug, Deserialize)]
struct RouteEntry {
    controller: String,
    action: String,
    verb: String,
    path: String,
    source_location: SourceLocation,
}

#[derive(Debug)]
struct Model {
    is_abstract: bool,
    columns: Vec<(String, String)>,
}

/// Loaded application: answers model and route lookups.
#[derive(Debug)]
pub struct AppRuntime {
    root: PathBuf,
    schema_file: PathBuf,
    models: HashMap<String, Model>,
    classes: HashSet<String>,
    /// Keyed by (controller path, action).
    routes: HashMap<(String, String), RouteInfo>,
}

impl AppRuntime {
    /// Read and validate the manifest at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let read_error = |source| WorkerError::ManifestRead {
            path: path.to_path_buf(),
            source,
        };
        let source = fs::read_to_string(path).map_err(read_error)?;
        let manifest: Manifest =
            serde_json::from_str(&source).map_err(|source| WorkerError::ManifestParse {
                path: path.to_path_buf(),
                source,
            })?;

        let absolute = path.canonicalize().map_err(read_error)?;
        let root = absolute
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));

        let runtime = Self::from_manifest(manifest, root)?;
        tracing::info!(
            root = %runtime.root.display(),
            models = runtime.models.len(),
            routes = runtime.routes.len(),
            "Application runtime loaded"
        );
        Ok(runtime)
    }

    fn from_manifest(manifest: Manifest, root: PathBuf) -> Result<Self> {
        let mut models = HashMap::with_capacity(manifest.models.len());
        for entry in manifest.models {
            let model = Model {
                is_abstract: entry.is_abstract,
                columns: entry.columns,
            };
            if models.insert(entry.name.clone(), model).is_some() {
                return Err(WorkerError::DuplicateModel(entry.name));
            }
        }

        let mut routes = HashMap::with_capacity(manifest.routes.len());
        for entry in manifest.routes {
            let controller = controller_path(&entry.controller);
            let SourceLocation(file, line) = entry.source_location;
            let info = RouteInfo {
                path: entry.path,
                verb: entry.verb,
                source_location: SourceLocation(root.join(file), line),
            };
            if routes
                .insert((controller.clone(), entry.action.clone()), info)
                .is_some()
            {
                return Err(WorkerError::DuplicateRoute {
                    controller,
                    action: entry.action,
                });
            }
        }

        Ok(Self {
            schema_file: root.join(manifest.schema_file),
            classes: manifest.classes.into_iter().collect(),
            root,
            models,
            routes,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Columns of a concrete model. Unknown names, constants that are not
    /// models, and abstract models all yield `None`.
    pub fn model(&self, name: &str) -> Option<ModelInfo> {
        if self.classes.contains(name) {
            return None;
        }
        let model = self.models.get(name)?;
        if model.is_abstract {
            return None;
        }
        Some(ModelInfo {
            columns: model.columns.clone(),
            schema_file: self.schema_file.clone(),
        })
    }

    /// Route for `controller#action`; the controller may be given as a class
    /// name (`Admin::UsersController`) or as a path (`admin/users`).
    pub fn route(&self, controller: &str, action: &str) -> Option<RouteInfo> {
        self.routes
            .get(&(controller_path(controller), action.to_string()))
            .cloned()
    }
}

/// `Admin::UsersController` -> `admin/users`, the form route tables use.
pub fn controller_path(name: &str) -> String {
    let name = name.trim_start_matches("::");
    let name = name.strip_suffix("Controller").unwrap_or(name);
    name.split("::").map(underscore).collect::<Vec<_>>().join("/")
}

fn underscore(segment: &str) -> String {
    let chars: Vec<char> = segment.chars().collect();
    let mut out = String::with_capacity(segment.len() + 4);
    for (i, &c) in chars.iter().enumerate() {
        if c.is_uppercase() {
            if i > 0 {
                let prev = chars[i - 1];
                let next_is_lower = chars.get(i + 1).is_some_and(|n| n.is_lowercase());
                // `UserProfiles` splits before P; `HTMLPages` splits before the last capital.
                if prev.is_lowercase() || prev.is_ascii_digit() || (prev.is_uppercase() && next_is_lower) {
                    out.push('_');
                }
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}
