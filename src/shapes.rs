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

//! Shape probing: input dimensions come from the symbolic placeholder,
//! output dimensions from one concrete forward evaluation.

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, ConfigError};
use crate::model::Model;
use crate::tensor::Tensor;

/// Matrix dimensions of the compiled function's input and output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShapeMetadata {
    pub rows_in: usize,
    pub cols_in: usize,
    pub rows_out: usize,
    pub cols_out: usize,
}

/// Rejects inputs a model cannot accept. Runs before any file I/O.
pub fn check_input(rows: usize, cols: usize, expects_batch_dim: bool) -> Result<(), ConfigError> {
    if rows == 0 || cols == 0 {
        return Err(ConfigError::EmptyInput { rows, cols });
    }
    if expects_batch_dim && cols != 1 {
        return Err(ConfigError::BatchedNonVector { rows, cols });
    }
    Ok(())
}

/// Zero-filled probe input; batched models see a `(1, rows)` row batch.
pub fn probe_input(rows: usize, cols: usize, expects_batch_dim: bool) -> Tensor {
    if expects_batch_dim {
        Tensor::zeros(&[1, rows])
    } else {
        Tensor::zeros(&[rows, cols])
    }
}

/// Maps a concrete output shape to `(rows_out, cols_out)`.
pub fn output_dims(shape: &[usize], expects_batch_dim: bool) -> Result<(usize, usize), ConfigError> {
    let dims = if expects_batch_dim {
        (shape.last().copied().unwrap_or(1), 1)
    } else {
        match shape {
            [] => (1, 1),
            [n] => (*n, 1),
            [.., r, c] => (*r, *c),
        }
    };
    if dims.0 == 0 || dims.1 == 0 {
        return Err(ConfigError::EmptyOutput {
            shape: shape.to_vec(),
        });
    }
    Ok(dims)
}

/// Probes `model` for a `rows x cols` input and returns the shape metadata
/// together with the probe tensor used, so tracing can reuse it.
pub fn probe(
    model: &dyn Model,
    rows: usize,
    cols: usize,
    expects_batch_dim: bool,
) -> Result<(ShapeMetadata, Tensor), BridgeError> {
    check_input(rows, cols, expects_batch_dim)?;
    let input = probe_input(rows, cols, expects_batch_dim);
    let output = model.forward(&input).map_err(BridgeError::Probe)?;
    let (rows_out, cols_out) = output_dims(output.shape(), expects_batch_dim)?;
    tracing::debug!(rows, cols, rows_out, cols_out, "probed model output shape");
    Ok((
        ShapeMetadata {
            rows_in: rows,
            cols_in: cols,
            rows_out,
            cols_out,
        },
        input,
    ))
}
