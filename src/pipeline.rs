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

//! Build pipeline: probe, trace, render, compile, then bind on first use.
//!
//! A [`ModelHandle`] moves through `NotBuilt -> Built -> Bound`. A fatal
//! build error moves it to `Failed` instead; only an explicit
//! [`ModelHandle::build`] leaves that state. Naive models skip tracing and
//! compilation entirely and are applied directly to framework expressions.

use std::fmt;
use std::fs;
use std::path::PathBuf;

use crate::artifacts::{ArtifactPaths, BuildIdentity, BuildManifest, TraceTiers};
use crate::codegen::{self, Template, TemplateVars};
use crate::config::BuildConfig;
use crate::diagnostics::{Diagnostic, Stage};
use crate::error::{BridgeError, ConfigError};
use crate::model::{Model, ModelKind, NaiveModel, Transform};
use crate::shapes::{self, ShapeMetadata};
use crate::symbolic::{EvalError, SymbolicFramework};
use crate::toolchain;
use crate::trace::{self, DerivativeAvailability, TraceRequest};

/// Files written by a compiled build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildArtifactSet {
    pub forward_trace: PathBuf,
    pub jacobian_trace: Option<PathBuf>,
    pub hessian_trace: Option<PathBuf>,
    pub source: PathBuf,
    pub library: PathBuf,
    pub manifest: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildArtifacts {
    Compiled(BuildArtifactSet),
    /// Provenance export of a naive model; nothing is compiled.
    Naive { export: PathBuf },
}

/// Result of a successful build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildReport {
    pub shapes: ShapeMetadata,
    pub availability: DerivativeAvailability,
    pub artifacts: BuildArtifacts,
    pub diagnostics: Vec<Diagnostic>,
}

impl BuildReport {
    pub fn library(&self) -> Option<&PathBuf> {
        match &self.artifacts {
            BuildArtifacts::Compiled(set) => Some(&set.library),
            BuildArtifacts::Naive { .. } => None,
        }
    }
}

enum BuildState<Func> {
    NotBuilt,
    Failed,
    Built(BuildReport),
    Bound(BuildReport, Func),
}

/// Observable build state of a [`ModelHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    NotBuilt,
    Failed,
    Built,
    Bound,
}

/// A model wrapped for use inside a symbolic framework.
pub struct ModelHandle<F: SymbolicFramework> {
    kind: ModelKind<F>,
    framework: F,
    config: BuildConfig,
    paths: ArtifactPaths,
    template: Template,
    state: BuildState<F::Function>,
}

impl<F: SymbolicFramework> fmt::Debug for ModelHandle<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("name", &self.name())
            .field("kind", &self.kind)
            .field("status", &self.status())
            .finish()
    }
}

impl<F: SymbolicFramework> ModelHandle<F> {
    pub fn new(kind: ModelKind<F>, framework: F, config: BuildConfig) -> Result<Self, BridgeError> {
        let identity = BuildIdentity::new(config.name.clone())?;
        let template = match &config.template {
            Some(path) => Template::from_file(path)?,
            None => Template::default(),
        };
        let paths = ArtifactPaths::new(config.build_dir.clone(), identity);
        Ok(Self {
            kind,
            framework,
            config,
            paths,
            template,
            state: BuildState::NotBuilt,
        })
    }

    pub fn compiled(model: impl Model + 'static, framework: F, config: BuildConfig) -> Result<Self, BridgeError> {
        Self::new(ModelKind::compiled(model), framework, config)
    }

    pub fn naive(model: impl NaiveModel<F> + 'static, framework: F, config: BuildConfig) -> Result<Self, BridgeError> {
        Self::new(ModelKind::naive(model), framework, config)
    }

    /// Restores a compiled handle from the manifest of an earlier build in
    /// the configured build directory, skipping tracing and compilation.
    pub fn open(kind: ModelKind<F>, framework: F, config: BuildConfig) -> Result<Self, BridgeError> {
        let mut handle = Self::new(kind, framework, config)?;
        if handle.kind.is_naive() {
            return Ok(handle);
        }
        let manifest = BuildManifest::load(&handle.paths)?;
        manifest.verify(&handle.paths)?;
        let paths = &handle.paths;
        let artifacts = BuildArtifactSet {
            forward_trace: paths.trace(Transform::Forward),
            jacobian_trace: manifest
                .availability
                .has_jacobian
                .then(|| paths.trace(Transform::Jacobian)),
            hessian_trace: manifest
                .availability
                .has_hessian
                .then(|| paths.trace(Transform::Hessian)),
            source: paths.source(),
            library: paths.library(),
            manifest: paths.manifest(),
        };
        handle.state = BuildState::Built(BuildReport {
            shapes: manifest.shapes,
            availability: manifest.availability,
            artifacts: BuildArtifacts::Compiled(artifacts),
            diagnostics: Vec::new(),
        });
        Ok(handle)
    }

    /// Replaces the native source template used by subsequent builds.
    pub fn with_template(mut self, template: Template) -> Self {
        self.template = template;
        self
    }

    pub fn name(&self) -> &str {
        self.paths.name().as_str()
    }

    pub fn paths(&self) -> &ArtifactPaths {
        &self.paths
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    pub fn framework(&self) -> &F {
        &self.framework
    }

    pub fn is_naive(&self) -> bool {
        self.kind.is_naive()
    }

    pub fn status(&self) -> BuildStatus {
        match self.state {
            BuildState::NotBuilt => BuildStatus::NotBuilt,
            BuildState::Failed => BuildStatus::Failed,
            BuildState::Built(_) => BuildStatus::Built,
            BuildState::Bound(..) => BuildStatus::Bound,
        }
    }

    pub fn report(&self) -> Option<&BuildReport> {
        match &self.state {
            BuildState::Built(report) | BuildState::Bound(report, _) => Some(report),
            BuildState::NotBuilt | BuildState::Failed => None,
        }
    }

    fn check_input(&self, input: &F::Expr) -> Result<(usize, usize), ConfigError> {
        let (rows, cols) = self.framework.shape(input);
        shapes::check_input(rows, cols, self.config.expects_batch_dim)?;
        Ok((rows, cols))
    }

    /// Builds the model for inputs shaped like `input`.
    ///
    /// Input validation happens before any file is touched. Any later fatal
    /// error leaves the handle `Failed`.
    pub fn build(&mut self, input: &F::Expr) -> Result<&BuildReport, BridgeError> {
        let (rows, cols) = self.check_input(input)?;
        self.state = BuildState::NotBuilt;

        let result = fs::create_dir_all(self.paths.dir())
            .map_err(BridgeError::from)
            .and_then(|()| match &self.kind {
                ModelKind::Compiled(model) => self.build_compiled(model.as_ref(), rows, cols),
                ModelKind::Naive(model) => self.build_naive(model.as_ref(), rows, cols),
            });

        let report = match result {
            Ok(report) => report,
            Err(err) => {
                tracing::error!(name = self.name(), error = %err, "model build failed");
                self.state = BuildState::Failed;
                return Err(err);
            }
        };
        tracing::info!(
            name = self.name(),
            has_jacobian = report.availability.has_jacobian,
            has_hessian = report.availability.has_hessian,
            "model built"
        );
        self.state = BuildState::Built(report);
        self.report().ok_or_else(|| {
            ConfigError::NotBuilt {
                name: self.name().to_string(),
            }
            .into()
        })
    }

    fn build_compiled(&self, model: &dyn Model, rows: usize, cols: usize) -> Result<BuildReport, BridgeError> {
        let batch = self.config.expects_batch_dim;
        let (shapes, probe) = shapes::probe(model, rows, cols, batch)?;

        let request = TraceRequest {
            with_jacobian: self.config.with_jacobian,
            with_hessian: self.config.with_hessian,
        };
        let traces = trace::export_traces(model, &probe, &self.paths, request)?;

        let model_path = match &self.config.model_search_path {
            Some(path) => path.clone(),
            None => self.paths.absolute_dir()?.to_string_lossy().into_owned(),
        };
        let vars = TemplateVars {
            model_path: model_path.clone(),
            device: self.config.device.clone(),
            name: self.name().to_string(),
            shapes,
            availability: traces.availability,
            model_expects_batch_dim: batch,
        };
        let source = codegen::render_to_file(&self.template, &vars, &self.paths)?;

        let toolchain = toolchain::resolve(&self.config.toolchain)?;
        let library = toolchain::compile(&toolchain, &self.paths)?;
        let mut diagnostics = traces.diagnostics;
        if !toolchain.link_runtime {
            diagnostics.push(Diagnostic::note(
                Stage::Compile,
                format!("`{}` was not linked; the library must resolve its runtime symbols on its own", toolchain.runtime_lib),
            ));
        }

        let mut manifest = BuildManifest {
            name: self.name().to_string(),
            device: self.config.device.clone(),
            expects_batch_dim: batch,
            model_path,
            shapes,
            availability: traces.availability,
            tiers: TraceTiers {
                forward: traces.forward_tier,
                jacobian: traces.jacobian_tier,
                hessian: traces.hessian_tier,
            },
            digests: Default::default(),
        };
        manifest.record_digests(&self.paths)?;
        let manifest_path = manifest.write(&self.paths)?;

        let availability = traces.availability;
        Ok(BuildReport {
            shapes,
            availability,
            artifacts: BuildArtifacts::Compiled(BuildArtifactSet {
                forward_trace: self.paths.trace(Transform::Forward),
                jacobian_trace: availability
                    .has_jacobian
                    .then(|| self.paths.trace(Transform::Jacobian)),
                hessian_trace: availability
                    .has_hessian
                    .then(|| self.paths.trace(Transform::Hessian)),
                source,
                library,
                manifest: manifest_path,
            }),
            diagnostics,
        })
    }

    fn build_naive(&self, model: &dyn NaiveModel<F>, rows: usize, cols: usize) -> Result<BuildReport, BridgeError> {
        let placeholder = self.framework.symbol("inp", rows, cols);
        let output = model
            .apply(&self.framework, &placeholder)
            .map_err(|source| BridgeError::Tracing {
                transform: Transform::Forward,
                source,
            })?;
        let (rows_out, cols_out) = self.framework.shape(&output);
        let export = self
            .framework
            .export(self.name(), &placeholder, &output, self.paths.dir())?;
        tracing::debug!(path = %export.display(), "exported naive model");
        Ok(BuildReport {
            shapes: ShapeMetadata {
                rows_in: rows,
                cols_in: cols,
                rows_out,
                cols_out,
            },
            availability: DerivativeAvailability::default(),
            artifacts: BuildArtifacts::Naive { export },
            diagnostics: vec![Diagnostic::note(
                Stage::Compile,
                "naive model exported without compilation; derivatives come from the framework",
            )],
        })
    }

    /// Binds the compiled library on first use.
    fn ensure_bound(&mut self) -> Result<(), BridgeError> {
        let name = self.name().to_string();
        let report = match std::mem::replace(&mut self.state, BuildState::NotBuilt) {
            BuildState::NotBuilt => return Err(ConfigError::NotBuilt { name }.into()),
            BuildState::Failed => {
                self.state = BuildState::Failed;
                return Err(ConfigError::BuildFailed { name }.into());
            }
            bound @ BuildState::Bound(..) => {
                self.state = bound;
                return Ok(());
            }
            BuildState::Built(report) => report,
        };
        let Some(library) = report.library().cloned() else {
            self.state = BuildState::Built(report);
            return Err(ConfigError::NotBuilt { name }.into());
        };
        match self.framework.external(&name, &library) {
            Ok(function) => {
                self.state = BuildState::Bound(report, function);
                Ok(())
            }
            Err(err) => {
                self.state = BuildState::Built(report);
                Err(err.into())
            }
        }
    }

    /// Evaluates a built model. Fails with [`ConfigError::NotBuilt`] before
    /// the first successful build.
    pub fn evaluate(&mut self, input: &F::Expr) -> Result<F::Expr, BridgeError> {
        self.check_input(input)?;
        if let ModelKind::Naive(model) = &self.kind {
            return model
                .apply(&self.framework, input)
                .map_err(|err| BridgeError::Eval(EvalError::Model(err)));
        }
        self.ensure_bound()?;
        self.call_bound(Transform::Forward, input)
    }

    /// Builds on first call, then evaluates.
    pub fn forward(&mut self, input: &F::Expr) -> Result<F::Expr, BridgeError> {
        if !self.is_naive() && matches!(self.state, BuildState::NotBuilt) {
            self.build(input)?;
        }
        self.evaluate(input)
    }

    /// Evaluates the Jacobian or Hessian entry of a built model. Naive models
    /// have none; differentiate their expressions in the framework instead.
    pub fn evaluate_derivative(&mut self, transform: Transform, input: &F::Expr) -> Result<F::Expr, BridgeError> {
        self.check_input(input)?;
        if self.is_naive() {
            return Err(ConfigError::DerivativeUnavailable {
                name: self.name().to_string(),
                transform,
            }
            .into());
        }
        self.ensure_bound()?;
        let available = self
            .report()
            .map_or(false, |report| report.availability.has(transform));
        if !available {
            return Err(ConfigError::DerivativeUnavailable {
                name: self.name().to_string(),
                transform,
            }
            .into());
        }
        self.call_bound(transform, input)
    }

    fn call_bound(&self, transform: Transform, input: &F::Expr) -> Result<F::Expr, BridgeError> {
        match &self.state {
            BuildState::Bound(_, function) => Ok(self.framework.call_entry(function, transform, input)?),
            _ => Err(ConfigError::NotBuilt {
                name: self.name().to_string(),
            }
            .into()),
        }
    }
}
