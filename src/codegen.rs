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

//! Source rendering: literal `{{ key }}` substitution over a fixed key set.

use std::borrow::Cow;
use std::fs;
use std::path::{Path, PathBuf};

use crate::artifacts::ArtifactPaths;
use crate::error::BridgeError;
use crate::shapes::ShapeMetadata;
use crate::trace::DerivativeAvailability;

const DEFAULT_TEMPLATE: &str = include_str!("../templates/external_function.cpp.in");

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("unknown template placeholder `{key}` on line {line}")]
    UnknownPlaceholder { key: String, line: usize },
    #[error("unterminated placeholder on line {line}")]
    Unterminated { line: usize },
    #[error("failed to read template {}: {source}", path.display())]
    Template {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Values substituted into the native source template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateVars {
    pub model_path: String,
    pub device: String,
    pub name: String,
    pub shapes: ShapeMetadata,
    pub availability: DerivativeAvailability,
    pub model_expects_batch_dim: bool,
}

impl TemplateVars {
    pub const KEYS: [&'static str; 10] = [
        "model_path",
        "device",
        "name",
        "rows_in",
        "cols_in",
        "rows_out",
        "cols_out",
        "has_jac",
        "has_hess",
        "model_expects_batch_dim",
    ];

    /// Text values land inside C string literals and come back escaped.
    pub fn get(&self, key: &str) -> Option<String> {
        let value = match key {
            "model_path" => c_string_escape(&self.model_path),
            "device" => c_string_escape(&self.device),
            "name" => c_string_escape(&self.name),
            "rows_in" => self.shapes.rows_in.to_string(),
            "cols_in" => self.shapes.cols_in.to_string(),
            "rows_out" => self.shapes.rows_out.to_string(),
            "cols_out" => self.shapes.cols_out.to_string(),
            "has_jac" => bool_literal(self.availability.has_jacobian).into(),
            "has_hess" => bool_literal(self.availability.has_hessian).into(),
            "model_expects_batch_dim" => bool_literal(self.model_expects_batch_dim).into(),
            _ => return None,
        };
        Some(value)
    }
}

fn c_string_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            // Octal keeps a fixed width, so a following digit is never absorbed.
            c if c.is_ascii_control() => out.push_str(&format!("\\{:03o}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

fn bool_literal(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

/// A native source template.
#[derive(Debug, Clone)]
pub struct Template {
    text: Cow<'static, str>,
}

impl Default for Template {
    fn default() -> Self {
        Self {
            text: Cow::Borrowed(DEFAULT_TEMPLATE),
        }
    }
}

impl Template {
    pub fn from_string(text: impl Into<String>) -> Self {
        Self {
            text: Cow::Owned(text.into()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, RenderError> {
        let text = fs::read_to_string(path).map_err(|source| RenderError::Template {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::from_string(text))
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn render(&self, vars: &TemplateVars) -> Result<String, RenderError> {
        render(&self.text, vars)
    }
}

/// Replaces every `{{ key }}` in `template` with its value.
pub fn render(template: &str, vars: &TemplateVars) -> Result<String, RenderError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    let mut consumed = 0usize;

    while let Some(start) = rest.find("{{") {
        let line = line_of(template, consumed + start);
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or(RenderError::Unterminated { line })?;
        let key = after[..end].trim();
        let value = vars.get(key).ok_or_else(|| RenderError::UnknownPlaceholder {
            key: key.to_string(),
            line,
        })?;
        out.push_str(&value);
        let advance = start + 2 + end + 2;
        consumed += advance;
        rest = &rest[advance..];
    }
    out.push_str(rest);
    Ok(out)
}

fn line_of(text: &str, offset: usize) -> usize {
    text[..offset].bytes().filter(|b| *b == b'\n').count() + 1
}

/// Renders `template` into `<build_dir>/<name>.cpp`.
pub fn render_to_file(
    template: &Template,
    vars: &TemplateVars,
    paths: &ArtifactPaths,
) -> Result<PathBuf, BridgeError> {
    let source = template.render(vars)?;
    let path = paths.source();
    fs::write(&path, source)?;
    tracing::debug!(path = %path.display(), "rendered native source");
    Ok(path)
}
