// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Local model discovery

use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// File extension of a loadable model artifact
pub const ARTIFACT_EXTENSION: &str = "gguf";

/// A model directory under the local models root
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalModel {
    /// Subdirectory name; the address clients use
    pub name: String,
    pub artifact: PathBuf,
}

fn artifact_in(dir: &Path) -> Option<PathBuf> {
    let mut artifacts: Vec<PathBuf> = fs::read_dir(dir)
        .ok()?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| e.eq_ignore_ascii_case(ARTIFACT_EXTENSION))
                    .unwrap_or(false)
        })
        .collect();
    // split models ship as `-00001-of-0000N`; the first shard sorts first
    artifacts.sort();
    artifacts.into_iter().next()
}

/// Every subdirectory of `models_dir` holding an artifact, sorted by name
pub fn discover(models_dir: &Path) -> Vec<LocalModel> {
    let Ok(entries) = fs::read_dir(models_dir) else {
        debug!(path = %models_dir.display(), "Local models directory not readable");
        return Vec::new();
    };

    let mut models: Vec<LocalModel> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| {
            let name = entry.file_name().to_str()?.to_string();
            let artifact = artifact_in(&entry.path())?;
            Some(LocalModel { name, artifact })
        })
        .collect();
    models.sort_by(|a, b| a.name.cmp(&b.name));
    models
}

pub fn find(models_dir: &Path, name: &str) -> Option<LocalModel> {
    if name.is_empty() || name.contains('/') || name.contains('\\') || name == ".." {
        return None;
    }
    let dir = models_dir.join(name);
    let artifact = artifact_in(&dir)?;
    Some(LocalModel {
        name: name.to_string(),
        artifact,
    })
}
