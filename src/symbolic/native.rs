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

//! Numeric framework over shared libraries speaking the CasADi
//! external-function C ABI.
//!
//! An entry `e` is `int e(const double** arg, double** res, long long* iw,
//! double* w, int mem)`. Its output shape comes from `e_sparsity_out(0)`;
//! `e_sparsity_in`, `e_n_in`, `e_n_out` and `e_work` are optional.

use std::os::raw::c_int;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use libloading::Library;
use serde::Serialize;

use super::{EvalError, LoadError, SymbolicFramework};
use crate::model::Transform;
use crate::tensor::DenseMatrix;

type CasadiInt = i64;
type EvalFn = unsafe extern "C" fn(
    *const *const f64,
    *mut *mut f64,
    *mut CasadiInt,
    *mut f64,
    c_int,
) -> c_int;
type SparsityFn = unsafe extern "C" fn(CasadiInt) -> *const CasadiInt;
type CountFn = unsafe extern "C" fn() -> CasadiInt;
type WorkFn = unsafe extern "C" fn(*mut CasadiInt, *mut CasadiInt, *mut CasadiInt, *mut CasadiInt) -> c_int;

/// One resolved entry point and its buffer requirements.
#[derive(Clone, Copy)]
struct Entry {
    eval: EvalFn,
    input: Option<(usize, usize)>,
    output: (usize, usize),
    sz_arg: usize,
    sz_res: usize,
    sz_iw: usize,
    sz_w: usize,
}

/// A loaded shared library bound to the function exported as `name`.
pub struct ExternalFunction {
    name: String,
    path: PathBuf,
    forward: Entry,
    jacobian: OnceLock<Entry>,
    hessian: OnceLock<Entry>,
    // Declared last: entries hold pointers into the library.
    lib: Library,
}

impl std::fmt::Debug for ExternalFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalFunction")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("output", &self.forward.output)
            .finish()
    }
}

impl ExternalFunction {
    pub fn load(name: &str, path: &Path) -> Result<Self, LoadError> {
        if !path.exists() {
            return Err(LoadError::LibraryMissing(path.to_path_buf()));
        }
        // SAFETY: loading runs the library's initializers; the library is
        // one we compiled from a rendered template.
        let lib = unsafe { Library::new(path) }.map_err(|err| LoadError::Open {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        let forward = resolve_entry(&lib, name, path)?;
        tracing::debug!(name, path = %path.display(), "bound external function");
        Ok(Self {
            name: name.to_string(),
            path: path.to_path_buf(),
            forward,
            jacobian: OnceLock::new(),
            hessian: OnceLock::new(),
            lib,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `(rows, cols)` of the forward output.
    pub fn output_shape(&self) -> (usize, usize) {
        self.forward.output
    }

    /// Whether the entry for `transform` has been resolved. Derivative
    /// entries resolve on their first call and are reused afterwards.
    pub fn is_resolved(&self, transform: Transform) -> bool {
        match transform {
            Transform::Forward => true,
            Transform::Jacobian => self.jacobian.get().is_some(),
            Transform::Hessian => self.hessian.get().is_some(),
        }
    }

    pub fn call(&self, transform: Transform, input: &DenseMatrix) -> Result<DenseMatrix, EvalError> {
        let symbol = transform.entry_name(&self.name);
        let entry = match transform {
            Transform::Forward => self.forward,
            Transform::Jacobian => self.derivative(&self.jacobian, &symbol)?,
            Transform::Hessian => self.derivative(&self.hessian, &symbol)?,
        };
        invoke(&symbol, &entry, input)
    }

    // Failed lookups are not cached; a later call retries.
    fn derivative(&self, slot: &OnceLock<Entry>, symbol: &str) -> Result<Entry, LoadError> {
        if let Some(entry) = slot.get() {
            return Ok(*entry);
        }
        let entry = resolve_entry(&self.lib, symbol, &self.path)?;
        Ok(*slot.get_or_init(|| entry))
    }
}

fn symbol_name(name: &str) -> Vec<u8> {
    let mut bytes = name.as_bytes().to_vec();
    bytes.push(0);
    bytes
}

fn required<T: Copy>(lib: &Library, symbol: &str, path: &Path) -> Result<T, LoadError> {
    // SAFETY: `T` is the C signature the ABI documents for this symbol.
    unsafe { lib.get::<T>(&symbol_name(symbol)) }
        .map(|sym| *sym)
        .map_err(|_| LoadError::MissingSymbol {
            symbol: symbol.to_string(),
            path: path.to_path_buf(),
        })
}

fn optional<T: Copy>(lib: &Library, symbol: &str) -> Option<T> {
    // SAFETY: as in `required`.
    unsafe { lib.get::<T>(&symbol_name(symbol)) }.ok().map(|sym| *sym)
}

fn resolve_entry(lib: &Library, symbol: &str, path: &Path) -> Result<Entry, LoadError> {
    let eval: EvalFn = required(lib, symbol, path)?;
    let sparsity_out: SparsityFn = required(lib, &format!("{symbol}_sparsity_out"), path)?;
    let output = dense_shape(sparsity_out, symbol)?;
    let input = match optional::<SparsityFn>(lib, &format!("{symbol}_sparsity_in")) {
        Some(f) => Some(dense_shape(f, symbol)?),
        None => None,
    };

    let count = |suffix: &str| -> usize {
        optional::<CountFn>(lib, &format!("{symbol}_{suffix}"))
            // SAFETY: count functions take no arguments and only return.
            .map(|f| unsafe { f() })
            .map_or(1, |n| usize::try_from(n).unwrap_or(1))
    };
    let n_in = count("n_in");
    let n_out = count("n_out");

    let (mut sz_arg, mut sz_res, mut sz_iw, mut sz_w): (CasadiInt, CasadiInt, CasadiInt, CasadiInt) =
        (0, 0, 0, 0);
    if let Some(work) = optional::<WorkFn>(lib, &format!("{symbol}_work")) {
        // SAFETY: all four out-pointers are valid for the duration of the call.
        unsafe { work(&mut sz_arg, &mut sz_res, &mut sz_iw, &mut sz_w) };
    }
    let size = |n: CasadiInt| usize::try_from(n).unwrap_or(0);

    Ok(Entry {
        eval,
        input,
        output,
        sz_arg: size(sz_arg).max(n_in).max(1),
        sz_res: size(sz_res).max(n_out).max(1),
        sz_iw: size(sz_iw),
        sz_w: size(sz_w),
    })
}

/// Reads `[nrow, ncol, colind[0..=ncol], row[..]]` and requires it dense.
fn dense_shape(sparsity: SparsityFn, symbol: &str) -> Result<(usize, usize), LoadError> {
    let unsupported = || LoadError::UnsupportedSparsity {
        symbol: symbol.to_string(),
    };
    // SAFETY: the ABI returns either null or a pattern of length
    // 2 + ncol + 1 + nnz that lives as long as the library.
    unsafe {
        let pattern = sparsity(0);
        if pattern.is_null() {
            return Err(unsupported());
        }
        let nrow = usize::try_from(*pattern).map_err(|_| unsupported())?;
        let ncol = usize::try_from(*pattern.add(1)).map_err(|_| unsupported())?;
        let nnz = usize::try_from(*pattern.add(2 + ncol)).map_err(|_| unsupported())?;
        if nrow.checked_mul(ncol) != Some(nnz) {
            return Err(unsupported());
        }
        Ok((nrow, ncol))
    }
}

fn invoke(symbol: &str, entry: &Entry, input: &DenseMatrix) -> Result<DenseMatrix, EvalError> {
    if let Some(expected) = entry.input {
        if expected != input.shape() {
            return Err(EvalError::ShapeMismatch {
                entry: symbol.to_string(),
                expected,
                actual: input.shape(),
            });
        }
    }

    let (rows, cols) = entry.output;
    let mut output = DenseMatrix::zeros(rows, cols);

    let mut args: Vec<*const f64> = vec![std::ptr::null(); entry.sz_arg];
    args[0] = input.as_slice().as_ptr();
    let mut res: Vec<*mut f64> = vec![std::ptr::null_mut(); entry.sz_res];
    res[0] = output.as_mut_slice().as_mut_ptr();
    let mut iw: Vec<CasadiInt> = vec![0; entry.sz_iw];
    let mut w: Vec<f64> = vec![0.0; entry.sz_w];

    // SAFETY: `args[0]` and `res[0]` point at buffers sized by the entry's
    // declared patterns; the work vectors are sized by `_work`.
    let code = unsafe {
        (entry.eval)(
            args.as_ptr(),
            res.as_mut_ptr(),
            iw.as_mut_ptr(),
            w.as_mut_ptr(),
            0,
        )
    };
    if code != 0 {
        return Err(EvalError::EntryFailed {
            entry: symbol.to_string(),
            code,
        });
    }
    Ok(output)
}

/// Numeric [`SymbolicFramework`]: expressions are dense matrices and
/// functions are dlopen'ed libraries.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeFramework;

#[derive(Serialize)]
struct NaiveExport<'a> {
    name: &'a str,
    input_shape: (usize, usize),
    output_shape: (usize, usize),
    input: &'a [f64],
    output: &'a [f64],
}

impl SymbolicFramework for NativeFramework {
    type Expr = DenseMatrix;
    type Function = ExternalFunction;

    fn shape(&self, expr: &DenseMatrix) -> (usize, usize) {
        expr.shape()
    }

    fn symbol(&self, _name: &str, rows: usize, cols: usize) -> DenseMatrix {
        DenseMatrix::zeros(rows, cols)
    }

    fn external(&self, name: &str, library: &Path) -> Result<ExternalFunction, LoadError> {
        ExternalFunction::load(name, library)
    }

    fn call_entry(
        &self,
        function: &ExternalFunction,
        transform: Transform,
        input: &DenseMatrix,
    ) -> Result<DenseMatrix, EvalError> {
        function.call(transform, input)
    }

    /// Writes `<name>_naive.json` with the placeholder and its image.
    fn export(
        &self,
        name: &str,
        input: &DenseMatrix,
        output: &DenseMatrix,
        dir: &Path,
    ) -> Result<PathBuf, EvalError> {
        let path = dir.join(format!("{name}_naive.json"));
        let record = NaiveExport {
            name,
            input_shape: input.shape(),
            output_shape: output.shape(),
            input: input.as_slice(),
            output: output.as_slice(),
        };
        let text = serde_json::to_string_pretty(&record).map_err(|err| EvalError::Export {
            path: path.clone(),
            message: err.to_string(),
        })?;
        std::fs::write(&path, text).map_err(|err| EvalError::Export {
            path: path.clone(),
            message: err.to_string(),
        })?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static DENSE_3X2: [CasadiInt; 11] = [3, 2, 0, 3, 6, 0, 1, 2, 0, 1, 2];
    static SPARSE_DIAG: [CasadiInt; 7] = [2, 2, 0, 1, 2, 0, 1];
    // nrow * ncol does not fit in usize; colind is short enough to read.
    static HUGE: [CasadiInt; 6] = [CasadiInt::MAX, 3, 0, 0, 0, 7];

    unsafe extern "C" fn dense(_i: CasadiInt) -> *const CasadiInt {
        DENSE_3X2.as_ptr()
    }

    unsafe extern "C" fn sparse(_i: CasadiInt) -> *const CasadiInt {
        SPARSE_DIAG.as_ptr()
    }

    unsafe extern "C" fn huge(_i: CasadiInt) -> *const CasadiInt {
        HUGE.as_ptr()
    }

    unsafe extern "C" fn null(_i: CasadiInt) -> *const CasadiInt {
        std::ptr::null()
    }

    #[test]
    fn dense_pattern_yields_its_shape() {
        assert_eq!(dense_shape(dense, "f").unwrap(), (3, 2));
    }

    #[test]
    fn sparse_and_null_patterns_are_rejected() {
        assert!(matches!(
            dense_shape(sparse, "f"),
            Err(LoadError::UnsupportedSparsity { ref symbol }) if symbol == "f"
        ));
        assert!(matches!(dense_shape(null, "f"), Err(LoadError::UnsupportedSparsity { .. })));
    }

    #[test]
    fn overflowing_dimensions_are_rejected() {
        assert!(matches!(
            dense_shape(huge, "jac_f"),
            Err(LoadError::UnsupportedSparsity { ref symbol }) if symbol == "jac_f"
        ));
    }
}
