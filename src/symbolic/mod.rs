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

//! The symbolic framework a compiled model is bound into.

use std::path::{Path, PathBuf};

use crate::model::{ModelError, Transform};

#[cfg(feature = "native")]
mod native;

#[cfg(feature = "native")]
pub use native::{ExternalFunction, NativeFramework};

/// Failure to bind a compiled library. Reported at first use, not at build.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("shared library not found: {}", .0.display())]
    LibraryMissing(PathBuf),
    #[error("failed to open {}: {message}", path.display())]
    Open { path: PathBuf, message: String },
    #[error("symbol `{symbol}` not found in {}", path.display())]
    MissingSymbol { symbol: String, path: PathBuf },
    #[error("entry `{symbol}` declares a sparse or malformed pattern; only dense matrices are supported")]
    UnsupportedSparsity { symbol: String },
    #[error("artifact {} does not match the digest recorded at build time", .0.display())]
    DigestMismatch(PathBuf),
}

/// Failure while applying a bound function.
#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error("`{entry}` expects a {}x{} input, got {}x{}", expected.0, expected.1, actual.0, actual.1)]
    ShapeMismatch {
        entry: String,
        expected: (usize, usize),
        actual: (usize, usize),
    },
    #[error("`{entry}` returned status {code}")]
    EntryFailed { entry: String, code: i32 },
    #[error("naive model evaluation failed: {0}")]
    Model(#[from] ModelError),
    #[error("failed to export {}: {message}", path.display())]
    Export { path: PathBuf, message: String },
    #[error(transparent)]
    Load(#[from] LoadError),
}

/// Operations the pipeline needs from a symbolic computation framework.
pub trait SymbolicFramework {
    type Expr: Clone;
    type Function;

    /// `(rows, cols)` of an expression.
    fn shape(&self, expr: &Self::Expr) -> (usize, usize);

    /// Fresh placeholder of the given shape.
    fn symbol(&self, name: &str, rows: usize, cols: usize) -> Self::Expr;

    /// Binds the function exported as `name` from the library at `library`.
    fn external(&self, name: &str, library: &Path) -> Result<Self::Function, LoadError>;

    /// Applies the forward function, or one of its derivative entries.
    fn call_entry(
        &self,
        function: &Self::Function,
        transform: Transform,
        input: &Self::Expr,
    ) -> Result<Self::Expr, EvalError>;

    fn call(&self, function: &Self::Function, input: &Self::Expr) -> Result<Self::Expr, EvalError> {
        self.call_entry(function, Transform::Forward, input)
    }

    /// Persists a naive model's `input -> output` graph under `dir` and
    /// returns the written file.
    fn export(
        &self,
        name: &str,
        input: &Self::Expr,
        output: &Self::Expr,
        dir: &Path,
    ) -> Result<PathBuf, EvalError>;
}
