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

//! Interfaces to the differentiable model and its execution engine.
//!
//! The pipeline never differentiates anything itself. It asks the engine for
//! a concrete forward evaluation and for captured graphs of the forward,
//! Jacobian and Hessian functions, and it asks each captured graph to write
//! itself to disk.

use std::fmt;
use std::path::Path;

use crate::symbolic::SymbolicFramework;
use crate::tensor::{Tensor, TensorError};

/// Failure reported by the model engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ModelError {
    message: String,
}

impl ModelError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<TensorError> for ModelError {
    fn from(err: TensorError) -> Self {
        Self::new(err.to_string())
    }
}

/// Function whose graph is captured: the model or one of its derivatives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transform {
    Forward,
    Jacobian,
    Hessian,
}

impl Transform {
    pub const ALL: [Transform; 3] = [Transform::Forward, Transform::Jacobian, Transform::Hessian];

    /// Suffix of the serialized trace file, `<name>_<suffix>.pt`.
    pub fn artifact_suffix(self) -> &'static str {
        match self {
            Transform::Forward => "forward",
            Transform::Jacobian => "jacrev",
            Transform::Hessian => "hess",
        }
    }

    /// Exported symbol for this function in a library built as `name`.
    pub fn entry_name(self, name: &str) -> String {
        match self {
            Transform::Forward => name.to_string(),
            Transform::Jacobian => format!("jac_{name}"),
            Transform::Hessian => format!("jac_jac_{name}"),
        }
    }
}

impl fmt::Display for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transform::Forward => write!(f, "forward"),
            Transform::Jacobian => write!(f, "Jacobian"),
            Transform::Hessian => write!(f, "Hessian"),
        }
    }
}

/// A captured computational graph that can persist itself.
///
/// The two methods are the two serialization tiers: `script` resolves control
/// flow structurally, `trace` replays the execution path taken by `probe`.
pub trait CapturedGraph {
    fn script(&self, path: &Path) -> Result<(), ModelError>;
    fn trace(&self, probe: &Tensor, path: &Path) -> Result<(), ModelError>;
}

/// A differentiable model backed by an external execution engine.
///
/// Implementations must not mutate learnable state: the pipeline evaluates
/// and captures the same model several times per build and assumes the
/// results agree.
pub trait Model {
    fn forward(&self, input: &Tensor) -> Result<Tensor, ModelError>;

    fn capture(
        &self,
        transform: Transform,
        probe: &Tensor,
    ) -> Result<Box<dyn CapturedGraph + '_>, ModelError>;
}

/// A model already written in the symbolic framework's own algebra.
pub trait NaiveModel<F: SymbolicFramework> {
    fn apply(&self, framework: &F, input: &F::Expr) -> Result<F::Expr, ModelError>;
}

impl<F, Func> NaiveModel<F> for Func
where
    F: SymbolicFramework,
    Func: Fn(&F, &F::Expr) -> Result<F::Expr, ModelError>,
{
    fn apply(&self, framework: &F, input: &F::Expr) -> Result<F::Expr, ModelError> {
        self(framework, input)
    }
}

/// The two ways a model can enter the pipeline, fixed at construction.
pub enum ModelKind<F: SymbolicFramework> {
    /// Traced, rendered and compiled into a shared library.
    Compiled(Box<dyn Model>),
    /// Applied directly to framework expressions, never compiled.
    Naive(Box<dyn NaiveModel<F>>),
}

impl<F: SymbolicFramework> ModelKind<F> {
    pub fn compiled(model: impl Model + 'static) -> Self {
        ModelKind::Compiled(Box::new(model))
    }

    pub fn naive(model: impl NaiveModel<F> + 'static) -> Self {
        ModelKind::Naive(Box::new(model))
    }

    pub fn is_naive(&self) -> bool {
        matches!(self, ModelKind::Naive(_))
    }
}

impl<F: SymbolicFramework> fmt::Debug for ModelKind<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelKind::Compiled(_) => write!(f, "Compiled"),
            ModelKind::Naive(_) => write!(f, "Naive"),
        }
    }
}
