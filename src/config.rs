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

//! Build configuration, loadable from `modelbridge.toml`.
//!
//! ```toml
//! name = "pendulum_dyn"
//! build_dir = "./_generated"
//! expects_batch_dim = true
//! with_hessian = false
//!
//! [toolchain]
//! compiler = "g++"
//! runtime_dir = "/opt/modelbridge"
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_NAME: &str = "modelbridge_f";
pub const DEFAULT_BUILD_DIR: &str = "./_modelbridge_generated";

/// Options for one model build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Build identity. Reusing a name in the same build directory
    /// overwrites the previous artifacts.
    pub name: String,
    pub build_dir: PathBuf,
    /// Where the generated library looks for traces at run time. Defaults to
    /// the absolute build directory; set it when artifacts will be moved.
    pub model_search_path: Option<String>,
    pub device: String,
    pub expects_batch_dim: bool,
    pub with_jacobian: bool,
    pub with_hessian: bool,
    /// Custom native source template; the bundled one is used when unset.
    pub template: Option<PathBuf>,
    pub toolchain: ToolchainConfig,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            build_dir: PathBuf::from(DEFAULT_BUILD_DIR),
            model_search_path: None,
            device: "cpu".to_string(),
            expects_batch_dim: true,
            with_jacobian: true,
            with_hessian: true,
            template: None,
            toolchain: ToolchainConfig::default(),
        }
    }
}

impl BuildConfig {
    pub fn from_toml_str(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|err| ConfigError::Parse {
            path: origin.to_path_buf(),
            message: err.to_string(),
        })
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|err| ConfigError::Parse {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        Self::from_toml_str(&text, path)
    }
}

/// Compiler and runtime-library settings. Unset fields fall back to
/// environment variables, then to built-in defaults, when resolved by
/// [`crate::toolchain::resolve`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolchainConfig {
    /// Compiler driver; `$CXX`, then the first of gcc/g++/c++/clang++.
    pub compiler: Option<String>,
    /// Root holding `include/` and `lib/` of the runtime support library;
    /// `$MODELBRIDGE_RUNTIME_DIR`, then `~/.modelbridge`.
    pub runtime_dir: Option<PathBuf>,
    /// Extra include directories searched before the runtime's.
    pub include_dirs: Vec<PathBuf>,
    pub runtime_lib: String,
    pub link_runtime: bool,
    pub cxx_std: String,
    /// `_GLIBCXX_USE_CXX11_ABI`; `$MODELBRIDGE_CXX11_ABI`, then enabled.
    pub cxx11_abi: Option<bool>,
    pub extra_args: Vec<String>,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            compiler: None,
            runtime_dir: None,
            include_dirs: Vec::new(),
            runtime_lib: "modelbridge_rt".to_string(),
            link_runtime: true,
            cxx_std: "c++17".to_string(),
            cxx11_abi: None,
            extra_args: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg = BuildConfig::from_toml_str(
            "name = \"pend\"\nwith_hessian = false\n[toolchain]\ncompiler = \"g++\"\n",
            Path::new("modelbridge.toml"),
        )
        .unwrap();
        assert_eq!(cfg.name, "pend");
        assert!(!cfg.with_hessian);
        assert!(cfg.with_jacobian);
        assert_eq!(cfg.toolchain.compiler.as_deref(), Some("g++"));
        assert_eq!(cfg.toolchain.cxx_std, "c++17");
        assert!(cfg.toolchain.link_runtime);
    }

    #[test]
    fn parse_error_names_the_file() {
        let err = BuildConfig::from_toml_str("name = ", Path::new("bad.toml")).unwrap_err();
        assert!(err.to_string().contains("bad.toml"));
    }
}
