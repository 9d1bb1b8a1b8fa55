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

//! Derivative tracing and trace serialization.
//!
//! Serialization walks an ordered list of tiers and keeps the first success.
//! The forward trace is mandatory; the Jacobian and Hessian are best-effort
//! and degrade into `false` availability flags plus a diagnostic.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::artifacts::ArtifactPaths;
use crate::diagnostics::{Diagnostic, Stage};
use crate::error::BridgeError;
use crate::model::{CapturedGraph, Model, ModelError, Transform};
use crate::tensor::Tensor;

/// Serialization strategy, in the order they are attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializationTier {
    Scripted,
    Traced,
}

impl SerializationTier {
    pub const ORDER: [SerializationTier; 2] = [SerializationTier::Scripted, SerializationTier::Traced];
}

impl fmt::Display for SerializationTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SerializationTier::Scripted => write!(f, "scripted"),
            SerializationTier::Traced => write!(f, "traced"),
        }
    }
}

/// Why one tier did not produce an artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierFailure {
    pub tier: SerializationTier,
    pub reason: String,
}

impl fmt::Display for TierFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} serialization failed: {}", self.tier, self.reason)
    }
}

/// Outcome of a single serialization attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt {
    Success(PathBuf),
    Failed(TierFailure),
}

/// Outcome of serializing one graph across all tiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Serialized {
    Exported {
        path: PathBuf,
        tier: SerializationTier,
    },
    Unavailable(Vec<TierFailure>),
}

impl Serialized {
    pub fn tier(&self) -> Option<SerializationTier> {
        match self {
            Serialized::Exported { tier, .. } => Some(*tier),
            Serialized::Unavailable(_) => None,
        }
    }
}

fn attempt(graph: &dyn CapturedGraph, tier: SerializationTier, probe: &Tensor, path: &Path) -> Attempt {
    let result = match tier {
        SerializationTier::Scripted => graph.script(path),
        SerializationTier::Traced => graph.trace(probe, path),
    };
    match result {
        Ok(()) => Attempt::Success(path.to_path_buf()),
        Err(err) => Attempt::Failed(TierFailure {
            tier,
            reason: err.to_string(),
        }),
    }
}

/// Persists `graph` to `path`, scripted first, traced second.
pub fn serialize(graph: &dyn CapturedGraph, probe: &Tensor, path: &Path) -> Serialized {
    let mut failures = Vec::new();
    for tier in SerializationTier::ORDER {
        match attempt(graph, tier, probe, path) {
            Attempt::Success(path) => {
                tracing::debug!(path = %path.display(), %tier, "serialized trace");
                return Serialized::Exported { path, tier };
            }
            Attempt::Failed(failure) => {
                tracing::debug!(path = %path.display(), %tier, reason = %failure.reason, "serialization tier failed");
                failures.push(failure);
            }
        }
    }
    Serialized::Unavailable(failures)
}

/// Which derivatives to attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceRequest {
    pub with_jacobian: bool,
    pub with_hessian: bool,
}

/// Derivative availability, baked into the generated source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivativeAvailability {
    pub has_jacobian: bool,
    pub has_hessian: bool,
}

impl DerivativeAvailability {
    pub fn has(&self, transform: Transform) -> bool {
        match transform {
            Transform::Forward => true,
            Transform::Jacobian => self.has_jacobian,
            Transform::Hessian => self.has_hessian,
        }
    }
}

/// Traces written for one build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceOutcome {
    pub availability: DerivativeAvailability,
    pub forward_tier: SerializationTier,
    pub jacobian_tier: Option<SerializationTier>,
    pub hessian_tier: Option<SerializationTier>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Captures and serializes the forward trace and the requested derivatives.
pub fn export_traces(
    model: &dyn Model,
    probe: &Tensor,
    paths: &ArtifactPaths,
    request: TraceRequest,
) -> Result<TraceOutcome, BridgeError> {
    let forward = model
        .capture(Transform::Forward, probe)
        .map_err(|source| BridgeError::Tracing {
            transform: Transform::Forward,
            source,
        })?;
    let forward_path = paths.trace(Transform::Forward);
    let forward_tier = match serialize(forward.as_ref(), probe, &forward_path) {
        Serialized::Exported { tier, .. } => tier,
        Serialized::Unavailable(failures) => {
            return Err(BridgeError::Serialization {
                artifact: forward_path,
                failures,
            })
        }
    };

    let mut diagnostics = Vec::new();

    let jacobian = if request.with_jacobian {
        optional_trace(model, Transform::Jacobian, probe, paths, &mut diagnostics)
    } else {
        None
    };
    let hessian = if request.with_hessian {
        optional_trace(model, Transform::Hessian, probe, paths, &mut diagnostics)
    } else {
        None
    };

    Ok(TraceOutcome {
        availability: DerivativeAvailability {
            has_jacobian: jacobian.is_some(),
            has_hessian: hessian.is_some(),
        },
        forward_tier,
        jacobian_tier: jacobian,
        hessian_tier: hessian,
        diagnostics,
    })
}

fn optional_trace(
    model: &dyn Model,
    transform: Transform,
    probe: &Tensor,
    paths: &ArtifactPaths,
    diagnostics: &mut Vec<Diagnostic>,
) -> Option<SerializationTier> {
    // A model that panics inside capture or serialization only loses this derivative.
    let attempt = panic::catch_unwind(AssertUnwindSafe(|| capture_and_serialize(model, transform, probe, paths)));
    let reason = match attempt {
        Ok(Ok(tier)) => return Some(tier),
        Ok(Err(reason)) => reason,
        Err(payload) => format!("graph capture panicked: {}", panic_message(payload.as_ref())),
    };

    let message = unavailable_message(transform);
    tracing::warn!(%transform, %reason, "{message}");
    diagnostics.push(Diagnostic::warning(Stage::Trace, message).with_note(reason));
    None
}

fn capture_and_serialize(
    model: &dyn Model,
    transform: Transform,
    probe: &Tensor,
    paths: &ArtifactPaths,
) -> Result<SerializationTier, String> {
    let graph = model.capture(transform, probe).map_err(capture_failure)?;
    match serialize(graph.as_ref(), probe, &paths.trace(transform)) {
        Serialized::Exported { tier, .. } => Ok(tier),
        Serialized::Unavailable(failures) => Err(failures
            .iter()
            .map(|f| f.to_string())
            .collect::<Vec<_>>()
            .join("; ")),
    }
}

fn capture_failure(err: ModelError) -> String {
    format!("graph capture failed: {err}")
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(text) = payload.downcast_ref::<&'static str>() {
        text
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.as_str()
    } else {
        "non-string panic payload"
    }
}

fn unavailable_message(transform: Transform) -> String {
    let order = match transform {
        Transform::Hessian => "Second-order",
        _ => "First-order",
    };
    format!("{transform} trace could not be generated. {order} sensitivities will not be available.")
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;

    struct Scripted(RefCell<Vec<&'static str>>, bool, bool);

    impl CapturedGraph for Scripted {
        fn script(&self, _path: &Path) -> Result<(), ModelError> {
            self.0.borrow_mut().push("script");
            if self.1 {
                Ok(())
            } else {
                Err(ModelError::new("control flow not scriptable"))
            }
        }

        fn trace(&self, _probe: &Tensor, _path: &Path) -> Result<(), ModelError> {
            self.0.borrow_mut().push("trace");
            if self.2 {
                Ok(())
            } else {
                Err(ModelError::new("tracer rejected op"))
            }
        }
    }

    #[test]
    fn scripted_tier_wins_when_it_succeeds() {
        let graph = Scripted(RefCell::new(Vec::new()), true, true);
        let out = serialize(&graph, &Tensor::zeros(&[1]), Path::new("x.pt"));
        assert_eq!(out.tier(), Some(SerializationTier::Scripted));
        assert_eq!(*graph.0.borrow(), vec!["script"]);
    }

    #[test]
    fn falls_back_to_traced() {
        let graph = Scripted(RefCell::new(Vec::new()), false, true);
        let out = serialize(&graph, &Tensor::zeros(&[1]), Path::new("x.pt"));
        assert_eq!(out.tier(), Some(SerializationTier::Traced));
        assert_eq!(*graph.0.borrow(), vec!["script", "trace"]);
    }

    #[test]
    fn reports_every_tier_failure() {
        let graph = Scripted(RefCell::new(Vec::new()), false, false);
        match serialize(&graph, &Tensor::zeros(&[1]), Path::new("x.pt")) {
            Serialized::Unavailable(failures) => {
                assert_eq!(failures.len(), 2);
                assert_eq!(failures[0].tier, SerializationTier::Scripted);
                assert_eq!(failures[1].tier, SerializationTier::Traced);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn panic_payloads_become_readable_notes() {
        let literal = panic::catch_unwind(|| panic!("static text")).unwrap_err();
        assert_eq!(panic_message(literal.as_ref()), "static text");
        let formatted = panic::catch_unwind(|| panic!("order {}", 2)).unwrap_err();
        assert_eq!(panic_message(formatted.as_ref()), "order 2");
        let opaque = panic::catch_unwind(|| std::panic::panic_any(7_u8)).unwrap_err();
        assert_eq!(panic_message(opaque.as_ref()), "non-string panic payload");
    }

    #[test]
    fn warning_texts_name_the_order() {
        assert!(unavailable_message(Transform::Jacobian).starts_with("Jacobian trace"));
        assert!(unavailable_message(Transform::Hessian).contains("Second-order"));
    }
}
