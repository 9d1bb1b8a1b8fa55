// Copyright 2025 STARGA Inc.
// Licensed under the Apache License, Version 2.0 (the “License”);
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at:
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an “AS IS” BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Part of the modelbridge project (models as native external functions).

//! On-disk artifact layout and the build manifest.
//!
//! Every path is derived from the build identity and the build directory.
//! Two builds sharing both write the same files; nothing here locks or
//! deduplicates.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{BridgeError, ConfigError};
use crate::model::Transform;
use crate::shapes::ShapeMetadata;
use crate::symbolic::LoadError;
use crate::trace::{DerivativeAvailability, SerializationTier};

/// Name keying all artifacts of one build; doubles as the exported symbol.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BuildIdentity(String);

impl BuildIdentity {
    pub fn new(name: impl Into<String>) -> Result<Self, ConfigError> {
        let name = name.into();
        let mut chars = name.chars();
        let valid = match chars.next() {
            Some(first) => {
                (first.is_ascii_alphabetic() || first == '_')
                    && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
            }
            None => false,
        };
        if valid {
            Ok(Self(name))
        } else {
            Err(ConfigError::InvalidName(name))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BuildIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Shared library extension for the host OS family.
pub fn dynamic_lib_suffix() -> &'static str {
    if cfg!(target_os = "macos") {
        "dylib"
    } else {
        "so"
    }
}

/// Paths of every artifact belonging to one build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    dir: PathBuf,
    name: BuildIdentity,
}

impl ArtifactPaths {
    pub fn new(dir: impl Into<PathBuf>, name: BuildIdentity) -> Self {
        Self {
            dir: dir.into(),
            name,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn name(&self) -> &BuildIdentity {
        &self.name
    }

    /// `<name>.cpp`
    pub fn source(&self) -> PathBuf {
        self.dir.join(format!("{}.cpp", self.name))
    }

    /// `<name>_forward.pt`, `<name>_jacrev.pt` or `<name>_hess.pt`.
    pub fn trace(&self, transform: Transform) -> PathBuf {
        self.dir
            .join(format!("{}_{}.pt", self.name, transform.artifact_suffix()))
    }

    /// `lib<name>.so` or `lib<name>.dylib`.
    pub fn library_file_name(&self) -> String {
        format!("lib{}.{}", self.name, dynamic_lib_suffix())
    }

    pub fn library(&self) -> PathBuf {
        self.dir.join(self.library_file_name())
    }

    pub fn manifest(&self) -> PathBuf {
        self.dir.join(format!("{}.toml", self.name))
    }

    /// Absolute build directory, the default trace search path baked into
    /// generated sources.
    pub fn absolute_dir(&self) -> Result<PathBuf, BridgeError> {
        if self.dir.is_absolute() {
            Ok(self.dir.clone())
        } else {
            Ok(std::env::current_dir()?.join(&self.dir))
        }
    }
}

/// Serialization tier recorded for each written trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceTiers {
    pub forward: SerializationTier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jacobian: Option<SerializationTier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hessian: Option<SerializationTier>,
}

/// Record of a completed compiled build, stored as `<name>.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildManifest {
    pub name: String,
    pub device: String,
    pub expects_batch_dim: bool,
    pub model_path: String,
    pub shapes: ShapeMetadata,
    pub availability: DerivativeAvailability,
    pub tiers: TraceTiers,
    /// File name to SHA-256 hex digest.
    #[serde(default)]
    pub digests: BTreeMap<String, String>,
}

impl BuildManifest {
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Hashes the library and every trace the manifest claims exists.
    pub fn record_digests(&mut self, paths: &ArtifactPaths) -> Result<(), BridgeError> {
        self.digests.clear();
        for file in self.tracked_files(paths) {
            let digest = sha256_file(&file)?;
            self.digests.insert(file_name(&file), digest);
        }
        Ok(())
    }

    pub fn write(&self, paths: &ArtifactPaths) -> Result<PathBuf, BridgeError> {
        let path = paths.manifest();
        let text = self.to_toml().map_err(|err| BridgeError::Manifest {
            path: path.clone(),
            message: err.to_string(),
        })?;
        fs::write(&path, text)?;
        Ok(path)
    }

    pub fn load(paths: &ArtifactPaths) -> Result<Self, BridgeError> {
        let path = paths.manifest();
        let text = fs::read_to_string(&path).map_err(|err| BridgeError::Manifest {
            path: path.clone(),
            message: err.to_string(),
        })?;
        toml::from_str(&text).map_err(|err| BridgeError::Manifest {
            path,
            message: err.to_string(),
        })
    }

    /// Checks that the on-disk artifacts are the ones this manifest recorded.
    pub fn verify(&self, paths: &ArtifactPaths) -> Result<(), LoadError> {
        for file in self.tracked_files(paths) {
            let key = file_name(&file);
            let Some(expected) = self.digests.get(&key) else {
                continue;
            };
            let actual = sha256_file(&file).map_err(|_| LoadError::LibraryMissing(file.clone()))?;
            if &actual != expected {
                return Err(LoadError::DigestMismatch(file));
            }
        }
        Ok(())
    }

    fn tracked_files(&self, paths: &ArtifactPaths) -> Vec<PathBuf> {
        let mut files = vec![paths.trace(Transform::Forward)];
        if self.availability.has_jacobian {
            files.push(paths.trace(Transform::Jacobian));
        }
        if self.availability.has_hessian {
            files.push(paths.trace(Transform::Hessian));
        }
        files.push(paths.library());
        files
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let data = fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&data);
    Ok(format!("{:x}", hasher.finalize()))
}
