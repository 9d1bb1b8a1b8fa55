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

#![allow(dead_code)]

use std::cell::Cell;
use std::fs;
use std::path::{Path, PathBuf};

use modelbridge::codegen::Template;
use modelbridge::toolchain;
use modelbridge::{BuildConfig, CapturedGraph, Model, ModelError, Tensor, ToolchainConfig, Transform};

/// Which stages of the mock model refuse to cooperate.
#[derive(Debug, Clone, Copy, Default)]
pub struct Faults {
    pub capture_jacobian: bool,
    pub capture_hessian: bool,
    pub script: bool,
    pub trace: bool,
    pub forward: bool,
    /// Capture of this transform panics instead of returning an error.
    pub panic_capture: Option<Transform>,
    /// Both serialization tiers fail, but only for this transform's graph.
    pub unserializable: Option<Transform>,
}

/// Elementwise `scale * x`, optionally reshaped to `output_shape`.
pub struct MockModel {
    pub scale: f64,
    pub output_shape: Option<Vec<usize>>,
    pub faults: Faults,
    pub forward_calls: Cell<usize>,
}

impl MockModel {
    pub fn identity() -> Self {
        Self::scaled(1.0)
    }

    pub fn scaled(scale: f64) -> Self {
        Self {
            scale,
            output_shape: None,
            faults: Faults::default(),
            forward_calls: Cell::new(0),
        }
    }

    pub fn with_output_shape(mut self, shape: &[usize]) -> Self {
        self.output_shape = Some(shape.to_vec());
        self
    }

    pub fn with_faults(mut self, faults: Faults) -> Self {
        self.faults = faults;
        self
    }
}

impl Model for MockModel {
    fn forward(&self, input: &Tensor) -> Result<Tensor, ModelError> {
        self.forward_calls.set(self.forward_calls.get() + 1);
        if self.faults.forward {
            return Err(ModelError::new("forward pass raised"));
        }
        match &self.output_shape {
            Some(shape) => Ok(Tensor::zeros(shape)),
            None => {
                let data = input.data().iter().map(|v| v * self.scale).collect();
                Ok(Tensor::from_vec(input.shape(), data)?)
            }
        }
    }

    fn capture(&self, transform: Transform, _probe: &Tensor) -> Result<Box<dyn CapturedGraph + '_>, ModelError> {
        let refused = match transform {
            Transform::Forward => false,
            Transform::Jacobian => self.faults.capture_jacobian,
            Transform::Hessian => self.faults.capture_hessian,
        };
        if refused {
            return Err(ModelError::new(format!("{transform} capture raised")));
        }
        if self.faults.panic_capture == Some(transform) {
            panic!("unsupported op in {transform} graph");
        }
        Ok(Box::new(JsonGraph {
            transform,
            scale: self.scale,
            faults: self.faults,
        }))
    }
}

/// Writes a small JSON document standing in for a serialized graph.
pub struct JsonGraph {
    pub transform: Transform,
    pub scale: f64,
    pub faults: Faults,
}

impl JsonGraph {
    fn unserializable(&self) -> bool {
        self.faults.unserializable == Some(self.transform)
    }

    fn write(&self, tier: &str, path: &Path) -> Result<(), ModelError> {
        let doc = serde_json::json!({
            "transform": self.transform,
            "tier": tier,
            "scale": self.scale,
        });
        fs::write(path, doc.to_string()).map_err(|err| ModelError::new(err.to_string()))
    }
}

impl CapturedGraph for JsonGraph {
    fn script(&self, path: &Path) -> Result<(), ModelError> {
        if self.faults.script || self.unserializable() {
            return Err(ModelError::new("data-dependent control flow"));
        }
        self.write("scripted", path)
    }

    fn trace(&self, _probe: &Tensor, path: &Path) -> Result<(), ModelError> {
        if self.faults.trace || self.unserializable() {
            return Err(ModelError::new("unsupported operator"));
        }
        self.write("traced", path)
    }
}

/// Self-contained identity external function: no runtime header or library.
pub const IDENTITY_TEMPLATE: &str = r#"// test build of {{ name }} on {{ device }} from {{ model_path }}, batched: {{ model_expects_batch_dim }}
typedef double casadi_real;
typedef long long int casadi_int;

#define EXPORT __attribute__((visibility("default")))

static const casadi_int ROWS_IN = {{ rows_in }};
static const casadi_int COLS_IN = {{ cols_in }};
static const casadi_int ROWS_OUT = {{ rows_out }};
static const casadi_int COLS_OUT = {{ cols_out }};
static const bool HAS_JAC = {{ has_jac }};
static const bool HAS_HESS = {{ has_hess }};

static const casadi_int* dense(casadi_int* buf, casadi_int r, casadi_int c) {
  casadi_int k = 0;
  buf[k++] = r;
  buf[k++] = c;
  for (casadi_int j = 0; j <= c; ++j) buf[k++] = j * r;
  for (casadi_int j = 0; j < c; ++j)
    for (casadi_int i = 0; i < r; ++i) buf[k++] = i;
  return buf;
}

static casadi_int buf_x[512], buf_f[512], buf_j[512], buf_h[512];

extern "C" {

EXPORT int {{ name }}(const casadi_real** arg, casadi_real** res, casadi_int* iw, casadi_real* w, int mem) {
  for (casadi_int i = 0; i < ROWS_OUT * COLS_OUT; ++i) res[0][i] = arg[0][i];
  return 0;
}
EXPORT casadi_int {{ name }}_n_in(void) { return 1; }
EXPORT casadi_int {{ name }}_n_out(void) { return 1; }
EXPORT const casadi_int* {{ name }}_sparsity_in(casadi_int i) { return i == 0 ? dense(buf_x, ROWS_IN, COLS_IN) : 0; }
EXPORT const casadi_int* {{ name }}_sparsity_out(casadi_int i) { return i == 0 ? dense(buf_f, ROWS_OUT, COLS_OUT) : 0; }

EXPORT int jac_{{ name }}(const casadi_real** arg, casadi_real** res, casadi_int* iw, casadi_real* w, int mem) {
  if (!HAS_JAC) return 1;
  casadi_int n_out = ROWS_OUT * COLS_OUT, n_in = ROWS_IN * COLS_IN;
  for (casadi_int c = 0; c < n_in; ++c)
    for (casadi_int r = 0; r < n_out; ++r) res[0][c * n_out + r] = r == c ? 1.0 : 0.0;
  return 0;
}
EXPORT casadi_int jac_{{ name }}_n_in(void) { return 2; }
EXPORT const casadi_int* jac_{{ name }}_sparsity_out(casadi_int i) {
  return i == 0 ? dense(buf_j, ROWS_OUT * COLS_OUT, ROWS_IN * COLS_IN) : 0;
}

EXPORT int jac_jac_{{ name }}(const casadi_real** arg, casadi_real** res, casadi_int* iw, casadi_real* w, int mem) {
  if (!HAS_HESS) return 1;
  casadi_int n = ROWS_OUT * COLS_OUT * ROWS_IN * COLS_IN * ROWS_IN * COLS_IN;
  for (casadi_int i = 0; i < n; ++i) res[0][i] = 0.0;
  return 0;
}
EXPORT casadi_int jac_jac_{{ name }}_n_in(void) { return 3; }
EXPORT const casadi_int* jac_jac_{{ name }}_sparsity_out(casadi_int i) {
  return i == 0 ? dense(buf_h, ROWS_OUT * COLS_OUT * ROWS_IN * COLS_IN, ROWS_IN * COLS_IN) : 0;
}

}
"#;

pub fn identity_template() -> Template {
    Template::from_string(IDENTITY_TEMPLATE)
}

/// Build configuration rooted in `dir`, linking no runtime library.
pub fn config_in(dir: &Path, name: &str) -> BuildConfig {
    BuildConfig {
        name: name.to_string(),
        build_dir: dir.join("gen"),
        toolchain: ToolchainConfig {
            runtime_dir: Some(dir.join("runtime")),
            link_runtime: false,
            ..ToolchainConfig::default()
        },
        ..BuildConfig::default()
    }
}

/// Returns `None` (and says so) when no C++ compiler can be found.
pub fn compiler_or_skip(cfg: &BuildConfig) -> Option<PathBuf> {
    match toolchain::resolve(&cfg.toolchain) {
        Ok(tools) => Some(tools.compiler),
        Err(err) => {
            eprintln!("Skipping native build test: {err}");
            None
        }
    }
}

pub fn files_in(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = match fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect(),
        Err(_) => Vec::new(),
    };
    names.sort();
    names
}
