//! TOML-file backed `StateStore`.
//!
//! The whole project table lives in one small TOML file. Reads go through an
//! `arc-swap` snapshot so they never block; mutations rewrite the file and
//! swap the snapshot under a write lock.

use super::{Instance, Project, StateStore};
use crate::error::{Result, StateError};

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// On-disk shape of the state file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(default)]
    projects: BTreeMap<String, Project>,
    /// Channel bindings that point at an instance other than its default
    /// channel (threads, remapped channels).
    #[serde(default)]
    channels: BTreeMap<String, ChannelBinding>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChannelBinding {
    project: String,
    instance_id: String,
}

/// `StateStore` implementation over a single TOML file.
pub struct FileStateStore {
    path: PathBuf,
    snapshot: ArcSwap<StateFile>,
    /// Serializes mutate-and-persist sequences.
    write_lock: Mutex<()>,
}

impl FileStateStore {
    /// Default state file location: `<data_dir>/muxbot/projects.toml`.
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .map(|dir| dir.join("muxbot"))
            .unwrap_or_else(|| PathBuf::from("./data"))
            .join("projects.toml")
    }

    /// Open a store, creating an empty state file if none exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = if path.exists() {
            read_state_file(&path)?
        } else {
            StateFile::default()
        };
        Ok(Self {
            path,
            snapshot: ArcSwap::from_pointee(state),
            write_lock: Mutex::new(()),
        })
    }

    fn mutate(&self, apply: impl FnOnce(&mut StateFile) -> Result<()>) -> Result<()> {
        let _guard = self.write_lock.lock().expect("state write lock");
        let mut state = StateFile::clone(&self.snapshot.load());
        apply(&mut state)?;
        write_state_file(&self.path, &state)?;
        self.snapshot.store(Arc::new(state));
        Ok(())
    }
}

impl StateStore for FileStateStore {
    fn projects(&self) -> BTreeMap<String, Project> {
        self.snapshot.load().projects.clone()
    }

    fn project(&self, name: &str) -> Option<Project> {
        self.snapshot.load().projects.get(name).cloned()
    }

    fn instance(&self, project: &str, instance_id: &str) -> Option<Instance> {
        self.snapshot
            .load()
            .projects
            .get(project)?
            .instances
            .get(instance_id)
            .cloned()
    }

    fn route_for_channel(&self, channel_id: &str) -> Option<(String, String)> {
        let state = self.snapshot.load();
        if let Some(binding) = state.channels.get(channel_id) {
            return Some((binding.project.clone(), binding.instance_id.clone()));
        }
        for (name, project) in &state.projects {
            if let Some((instance_id, _)) = project.instance_for_channel(channel_id) {
                return Some((name.clone(), instance_id.to_string()));
            }
        }
        None
    }

    fn bind_channel(&self, channel_id: &str, project: &str, instance_id: &str) -> Result<()> {
        self.mutate(|state| {
            if !state
                .projects
                .get(project)
                .is_some_and(|p| p.instances.contains_key(instance_id))
            {
                return Err(StateError::InstanceNotFound {
                    project: project.to_string(),
                    instance_id: instance_id.to_string(),
                }
                .into());
            }
            state.channels.insert(
                channel_id.to_string(),
                ChannelBinding {
                    project: project.to_string(),
                    instance_id: instance_id.to_string(),
                },
            );
            Ok(())
        })
    }

    fn remove_instance(&self, project: &str, instance_id: &str) -> Result<()> {
        self.mutate(|state| {
            let entry = state
                .projects
                .get_mut(project)
                .ok_or_else(|| StateError::ProjectNotFound(project.to_string()))?;
            if entry.instances.remove(instance_id).is_none() {
                return Err(StateError::InstanceNotFound {
                    project: project.to_string(),
                    instance_id: instance_id.to_string(),
                }
                .into());
            }
            if entry.instances.is_empty() {
                state.projects.remove(project);
            }
            state.channels.retain(|_, binding| {
                binding.project != project || binding.instance_id != instance_id
            });
            Ok(())
        })
    }

    fn touch_project(&self, project: &str) -> Result<()> {
        self.mutate(|state| {
            let entry = state
                .projects
                .get_mut(project)
                .ok_or_else(|| StateError::ProjectNotFound(project.to_string()))?;
            entry.last_active = chrono::Utc::now();
            Ok(())
        })
    }

    fn reload(&self) -> Result<()> {
        let _guard = self.write_lock.lock().expect("state write lock");
        let state = if self.path.exists() {
            read_state_file(&self.path)?
        } else {
            StateFile::default()
        };
        self.snapshot.store(Arc::new(state));
        Ok(())
    }
}

fn read_state_file(path: &Path) -> Result<StateFile> {
    let raw = std::fs::read_to_string(path).map_err(|error| StateError::Load {
        path: path.display().to_string(),
        reason: error.to_string(),
    })?;
    toml::from_str(&raw).map_err(|error| {
        StateError::Load {
            path: path.display().to_string(),
            reason: error.to_string(),
        }
        .into()
    })
}

fn write_state_file(path: &Path, state: &StateFile) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|error| StateError::Persist {
            path: path.display().to_string(),
            reason: error.to_string(),
        })?;
    }
    let rendered = toml::to_string_pretty(state).map_err(|error| StateError::Persist {
        path: path.display().to_string(),
        reason: error.to_string(),
    })?;
    // Write-then-rename so /reload never reads a torn file.
    let tmp = path.with_extension("toml.tmp");
    std::fs::write(&tmp, rendered).map_err(|error| StateError::Persist {
        path: tmp.display().to_string(),
        reason: error.to_string(),
    })?;
    std::fs::rename(&tmp, path).map_err(|error| {
        StateError::Persist {
            path: path.display().to_string(),
            reason: error.to_string(),
        }
        .into()
    })
}
