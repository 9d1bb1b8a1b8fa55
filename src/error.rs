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

//! Error taxonomy for the build pipeline.
//!
//! Fatal failures surface as [`BridgeError`]. Non-fatal failures (derivative
//! tracing, optional trace serialization) never reach this type: they are
//! converted into availability flags plus a
//! [`Diagnostic`](crate::diagnostics::Diagnostic) at the component boundary.

use std::path::PathBuf;

use crate::codegen::RenderError;
use crate::model::{ModelError, Transform};
use crate::symbolic::{EvalError, LoadError};
use crate::trace::TierFailure;

/// Caller misuse, detected before (or instead of) doing any work.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Batched models only accept column vectors.
    #[error("batched models accept only vector inputs, got a {rows}x{cols} input")]
    BatchedNonVector { rows: usize, cols: usize },
    /// Input placeholders must have at least one row and one column.
    #[error("input shape {rows}x{cols} has a zero-sized dimension")]
    EmptyInput { rows: usize, cols: usize },
    /// Evaluation requested before a build completed.
    #[error("model `{name}` has not been built yet; call `build` first")]
    NotBuilt { name: String },
    /// A previous build of this handle failed to compile.
    #[error("model `{name}` failed to build; fix the toolchain error and call `build` again")]
    BuildFailed { name: String },
    /// The probe evaluation produced an output with a zero-sized dimension.
    #[error("model produced an empty output of shape {shape:?}")]
    EmptyOutput { shape: Vec<usize> },
    /// A derivative entry point was requested that the build did not export.
    #[error("{transform} is not available for model `{name}`")]
    DerivativeUnavailable { name: String, transform: Transform },
    /// The build identity cannot be used as a file stem and C symbol.
    #[error("invalid build name `{0}`: expected [A-Za-z_][A-Za-z0-9_]*")]
    InvalidName(String),
    /// A configuration file could not be parsed.
    #[error("failed to parse {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },
}

/// Top-level error returned by build and evaluation entry points.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The model failed its concrete probe evaluation.
    #[error("probe evaluation failed: {0}")]
    Probe(#[source] ModelError),
    /// The mandatory forward graph could not be captured.
    #[error("{transform} tracing failed: {source}")]
    Tracing {
        transform: Transform,
        #[source]
        source: ModelError,
    },
    /// Every serialization tier failed for a mandatory trace.
    #[error("could not serialize {}: {}", artifact.display(), describe_failures(failures))]
    Serialization {
        artifact: PathBuf,
        failures: Vec<TierFailure>,
    },
    #[error(transparent)]
    Render(#[from] RenderError),
    /// The toolchain exited with a non-zero status.
    #[error("Compilation failed!\n\nAttempted to execute command:\n{command}\n\nexit status: {status}\n{stderr}")]
    Compilation {
        command: String,
        status: String,
        stderr: String,
    },
    /// No usable compiler could be resolved.
    #[error("tool not found: {0}")]
    ToolMissing(String),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Eval(#[from] EvalError),
    /// The build manifest could not be read or written.
    #[error("manifest {}: {message}", path.display())]
    Manifest { path: PathBuf, message: String },
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

fn describe_failures(failures: &[TierFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;
