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

//! modelbridge: compile differentiable models into native external functions
//! that a symbolic computation framework can call, differentiate and embed.
pub mod artifacts;
pub mod codegen;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod shapes;
pub mod symbolic;
pub mod tensor;
pub mod toolchain;
pub mod trace;

pub use config::{BuildConfig, ToolchainConfig};
pub use error::{BridgeError, ConfigError, Result};
pub use model::{CapturedGraph, Model, ModelError, ModelKind, NaiveModel, Transform};
pub use pipeline::{BuildArtifacts, BuildReport, BuildStatus, ModelHandle};
pub use symbolic::SymbolicFramework;
pub use tensor::{DenseMatrix, Tensor};

#[cfg(feature = "native")]
pub use symbolic::{ExternalFunction, NativeFramework};
