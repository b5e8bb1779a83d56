//! Durable task list.
//!
//! The whole list is rewritten on every commit. The JSON store writes a temp
//! file, fsyncs it and renames it over the old one, so a crash mid-write
//! leaves either the previous or the new list, never a mix.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::task::ImportTask;

const STORE_VERSION: u32 = 1;

pub trait TaskStore: Send + Sync {
    fn load(&self) -> Result<Vec<ImportTask>>;

    /// Replace the stored list with `tasks`.
    fn save(&self, tasks: &[ImportTask]) -> Result<()>;
}

#[derive(Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    tasks: Vec<ImportTask>,
}

pub struct JsonTaskStore {
    path: PathBuf,
}

impl JsonTaskStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TaskStore for JsonTaskStore {
    fn load(&self) -> Result<Vec<ImportTask>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let data = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading task list: {}", self.path.display()))?;
        let file: StoreFile = serde_json::from_str(&data)
            .with_context(|| format!("parsing task list: {}", self.path.display()))?;
        if file.version != STORE_VERSION {
            anyhow::bail!(
                "task list {} has unsupported version {}",
                self.path.display(),
                file.version
            );
        }
        Ok(file.tasks)
    }

    fn save(&self, tasks: &[ImportTask]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating task list dir: {}", parent.display()))?;
        }

        let file = StoreFile {
            version: STORE_VERSION,
            tasks: tasks.to_vec(),
        };
        let json = serde_json::to_vec_pretty(&file).context("serializing task list")?;

        let tmp_path = self.path.with_extension("tmp");
        let mut tmp = std::fs::File::create(&tmp_path)
            .with_context(|| format!("writing task list temp: {}", tmp_path.display()))?;
        tmp.write_all(&json)
            .and_then(|()| tmp.sync_all())
            .with_context(|| format!("writing task list temp: {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("renaming task list: {}", self.path.display()))?;
        Ok(())
    }
}

/// Volatile store for tests and one-shot tools.
#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: Mutex<Vec<ImportTask>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskStore for MemoryTaskStore {
    fn load(&self) -> Result<Vec<ImportTask>> {
        Ok(self.tasks.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn save(&self, tasks: &[ImportTask]) -> Result<()> {
        *self.tasks.lock().unwrap_or_else(|e| e.into_inner()) = tasks.to_vec();
        Ok(())
    }
}
