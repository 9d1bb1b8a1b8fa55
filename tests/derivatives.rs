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

mod common;

use std::fs;

use common::{Faults, MockModel};
use modelbridge::artifacts::{ArtifactPaths, BuildIdentity};
use modelbridge::diagnostics::{Severity, Stage};
use modelbridge::trace::{export_traces, SerializationTier, TraceRequest};
use modelbridge::{BridgeError, Tensor, Transform};
use tempfile::tempdir;

const BOTH: TraceRequest = TraceRequest {
    with_jacobian: true,
    with_hessian: true,
};

fn paths_in(dir: &std::path::Path) -> ArtifactPaths {
    ArtifactPaths::new(dir, BuildIdentity::new("f").expect("identity"))
}

#[test]
fn all_traces_use_the_scripted_tier_when_possible() {
    let dir = tempdir().expect("tempdir");
    let paths = paths_in(dir.path());
    let outcome = export_traces(&MockModel::identity(), &Tensor::zeros(&[1, 2]), &paths, BOTH).expect("traces");

    assert!(outcome.availability.has_jacobian);
    assert!(outcome.availability.has_hessian);
    assert_eq!(outcome.forward_tier, SerializationTier::Scripted);
    assert!(outcome.diagnostics.is_empty());
    for transform in Transform::ALL {
        let text = fs::read_to_string(paths.trace(transform)).expect("trace file");
        assert!(text.contains("\"scripted\""), "{transform}: {text}");
    }
}

#[test]
fn script_failure_falls_back_to_tracing() {
    let dir = tempdir().expect("tempdir");
    let paths = paths_in(dir.path());
    let model = MockModel::identity().with_faults(Faults {
        script: true,
        ..Faults::default()
    });
    let outcome = export_traces(&model, &Tensor::zeros(&[1, 2]), &paths, BOTH).expect("traces");
    assert_eq!(outcome.forward_tier, SerializationTier::Traced);
    assert_eq!(outcome.jacobian_tier, Some(SerializationTier::Traced));
    assert!(outcome.availability.has_jacobian);
}

#[test]
fn forward_serialization_failure_is_fatal() {
    let dir = tempdir().expect("tempdir");
    let paths = paths_in(dir.path());
    let model = MockModel::identity().with_faults(Faults {
        script: true,
        trace: true,
        ..Faults::default()
    });
    match export_traces(&model, &Tensor::zeros(&[1, 2]), &paths, BOTH) {
        Err(BridgeError::Serialization { artifact, failures }) => {
            assert_eq!(artifact, paths.trace(Transform::Forward));
            assert_eq!(failures.len(), 2);
        }
        other => panic!("expected a serialization error, got {other:?}"),
    }
}

#[test]
fn jacobian_capture_failure_degrades_with_a_warning() {
    let dir = tempdir().expect("tempdir");
    let paths = paths_in(dir.path());
    let model = MockModel::identity().with_faults(Faults {
        capture_jacobian: true,
        ..Faults::default()
    });
    let outcome = export_traces(&model, &Tensor::zeros(&[1, 2]), &paths, BOTH).expect("traces");

    assert!(!outcome.availability.has_jacobian);
    assert!(outcome.availability.has_hessian);
    assert!(paths.trace(Transform::Forward).exists());
    assert!(!paths.trace(Transform::Jacobian).exists());

    assert_eq!(outcome.diagnostics.len(), 1);
    let diag = &outcome.diagnostics[0];
    assert_eq!(diag.severity, Severity::Warning);
    assert_eq!(diag.stage, Stage::Trace);
    assert_eq!(
        diag.message,
        "Jacobian trace could not be generated. First-order sensitivities will not be available."
    );
    assert!(diag.notes[0].contains("Jacobian capture raised"));
}

#[test]
fn hessian_failure_never_propagates() {
    let dir = tempdir().expect("tempdir");
    let paths = paths_in(dir.path());
    let model = MockModel::identity().with_faults(Faults {
        capture_hessian: true,
        ..Faults::default()
    });
    let outcome = export_traces(&model, &Tensor::zeros(&[1, 2]), &paths, BOTH).expect("traces");
    assert!(outcome.availability.has_jacobian);
    assert!(!outcome.availability.has_hessian);
    assert_eq!(
        outcome.diagnostics[0].message,
        "Hessian trace could not be generated. Second-order sensitivities will not be available."
    );
}

#[test]
fn optional_capture_failures_count_as_unavailable() {
    let dir = tempdir().expect("tempdir");
    let paths = paths_in(dir.path());
    let flaky = MockModel::identity().with_faults(Faults {
        capture_jacobian: true,
        capture_hessian: true,
        ..Faults::default()
    });
    let outcome = export_traces(&flaky, &Tensor::zeros(&[1, 2]), &paths, BOTH).expect("traces");
    assert!(!outcome.availability.has_jacobian);
    assert!(!outcome.availability.has_hessian);
    assert_eq!(outcome.diagnostics.len(), 2);
}

#[test]
fn jacobian_serialization_failure_degrades_with_a_warning() {
    let dir = tempdir().expect("tempdir");
    let paths = paths_in(dir.path());
    // Capture succeeds, but neither tier can write the Jacobian graph.
    let model = MockModel::identity().with_faults(Faults {
        unserializable: Some(Transform::Jacobian),
        ..Faults::default()
    });
    let outcome = export_traces(&model, &Tensor::zeros(&[1, 2]), &paths, BOTH).expect("traces");

    assert!(!outcome.availability.has_jacobian);
    assert!(outcome.availability.has_hessian);
    assert_eq!(outcome.forward_tier, SerializationTier::Scripted);
    assert_eq!(outcome.jacobian_tier, None);
    assert_eq!(outcome.hessian_tier, Some(SerializationTier::Scripted));
    assert!(paths.trace(Transform::Forward).exists());
    assert!(!paths.trace(Transform::Jacobian).exists());
    assert!(paths.trace(Transform::Hessian).exists());

    assert_eq!(outcome.diagnostics.len(), 1);
    let diag = &outcome.diagnostics[0];
    assert_eq!(diag.severity, Severity::Warning);
    assert!(diag.message.starts_with("Jacobian trace could not be generated."));
    assert!(diag.notes[0].contains("scripted"), "{:?}", diag.notes);
    assert!(diag.notes[0].contains("traced"), "{:?}", diag.notes);
}

#[test]
fn hessian_capture_panic_degrades_with_a_warning() {
    let dir = tempdir().expect("tempdir");
    let paths = paths_in(dir.path());
    let model = MockModel::identity().with_faults(Faults {
        panic_capture: Some(Transform::Hessian),
        ..Faults::default()
    });
    let outcome = export_traces(&model, &Tensor::zeros(&[1, 2]), &paths, BOTH).expect("traces");

    assert!(outcome.availability.has_jacobian);
    assert!(!outcome.availability.has_hessian);
    assert!(paths.trace(Transform::Forward).exists());
    assert!(paths.trace(Transform::Jacobian).exists());

    assert_eq!(outcome.diagnostics.len(), 1);
    let diag = &outcome.diagnostics[0];
    assert_eq!(diag.severity, Severity::Warning);
    assert_eq!(
        diag.message,
        "Hessian trace could not be generated. Second-order sensitivities will not be available."
    );
    assert!(
        diag.notes[0].contains("panicked: unsupported op in Hessian graph"),
        "{:?}",
        diag.notes
    );
}

#[test]
fn jacobian_capture_panic_leaves_the_hessian_attempt_intact() {
    let dir = tempdir().expect("tempdir");
    let paths = paths_in(dir.path());
    let model = MockModel::identity().with_faults(Faults {
        panic_capture: Some(Transform::Jacobian),
        ..Faults::default()
    });
    let outcome = export_traces(&model, &Tensor::zeros(&[1, 2]), &paths, BOTH).expect("traces");
    assert!(!outcome.availability.has_jacobian);
    assert!(outcome.availability.has_hessian);
    assert_eq!(outcome.diagnostics.len(), 1);
}

#[test]
fn unrequested_derivatives_are_skipped_silently() {
    let dir = tempdir().expect("tempdir");
    let paths = paths_in(dir.path());
    let model = MockModel::identity().with_faults(Faults {
        capture_jacobian: true,
        capture_hessian: true,
        ..Faults::default()
    });
    let request = TraceRequest {
        with_jacobian: false,
        with_hessian: false,
    };
    let outcome = export_traces(&model, &Tensor::zeros(&[1, 2]), &paths, request).expect("traces");
    assert!(!outcome.availability.has_jacobian);
    assert!(!outcome.availability.has_hessian);
    assert!(outcome.diagnostics.is_empty());
}
