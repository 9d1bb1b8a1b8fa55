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

//! modelbridge command-line tool: render, compile, inspect and call
//! generated external functions without a model in the loop.

use std::path::{Path, PathBuf};
use std::process;

use anyhow::{bail, Context};
use clap::{ArgAction, Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use modelbridge::artifacts::{ArtifactPaths, BuildIdentity, BuildManifest};
use modelbridge::codegen::{self, Template, TemplateVars};
use modelbridge::shapes::ShapeMetadata;
use modelbridge::toolchain;
use modelbridge::trace::DerivativeAvailability;
use modelbridge::BuildConfig;

#[derive(Parser, Debug)]
#[command(name = "modelbridge", version, about = "Models as native external functions")]
struct Cli {
    /// Raise log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Render the native source for a configuration without tracing a model.
    Render {
        /// Build configuration (modelbridge.toml); defaults apply when omitted.
        #[arg(long, value_name = "TOML")]
        config: Option<PathBuf>,
        /// Input shape as ROWSxCOLS.
        #[arg(long, value_name = "RxC")]
        shape: String,
        /// Output shape as ROWSxCOLS.
        #[arg(long, value_name = "RxC")]
        output_shape: String,
        /// Render without Jacobian and Hessian entry points.
        #[arg(long)]
        forward_only: bool,
    },
    /// Recompile an existing `<name>.cpp` with the configured toolchain.
    Compile {
        #[command(flatten)]
        target: Target,
        #[arg(long, value_name = "TOML")]
        config: Option<PathBuf>,
    },
    /// Print a build manifest and verify artifact digests.
    Inspect {
        #[command(flatten)]
        target: Target,
    },
    /// Load a compiled library and evaluate one entry point.
    #[cfg(feature = "native")]
    Call {
        #[command(flatten)]
        target: Target,
        /// Comma-separated column vector, e.g. `3,-1`.
        #[arg(long, allow_hyphen_values = true)]
        input: String,
        /// Entry point (forward|jacobian|hessian).
        #[arg(long, default_value = "forward")]
        entry: String,
    },
}

#[derive(clap::Args, Debug)]
struct Target {
    #[arg(long, value_name = "DIR", default_value = modelbridge::config::DEFAULT_BUILD_DIR)]
    build_dir: PathBuf,
    #[arg(long, default_value = modelbridge::config::DEFAULT_NAME)]
    name: String,
}

impl Target {
    fn paths(&self) -> anyhow::Result<ArtifactPaths> {
        let identity = BuildIdentity::new(self.name.clone())?;
        Ok(ArtifactPaths::new(self.build_dir.clone(), identity))
    }
}

fn main() {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run(cli.command) {
        eprintln!("error: {err:#}");
        process::exit(1);
    }
}

fn run(command: Command) -> anyhow::Result<()> {
    match command {
        Command::Render {
            config,
            shape,
            output_shape,
            forward_only,
        } => render(config.as_deref(), &shape, &output_shape, forward_only),
        Command::Compile { target, config } => compile(&target, config.as_deref()),
        Command::Inspect { target } => inspect(&target),
        #[cfg(feature = "native")]
        Command::Call {
            target,
            input,
            entry,
        } => call(&target, &input, &entry),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<BuildConfig> {
    match path {
        Some(path) => BuildConfig::load(path)
            .with_context(|| format!("failed to load configuration {}", path.display())),
        None => Ok(BuildConfig::default()),
    }
}

fn parse_shape(text: &str) -> anyhow::Result<(usize, usize)> {
    let Some((rows, cols)) = text.split_once(['x', 'X']) else {
        bail!("expected a shape like 3x1, got `{text}`");
    };
    let rows = rows.trim().parse().with_context(|| format!("invalid row count in `{text}`"))?;
    let cols = cols.trim().parse().with_context(|| format!("invalid column count in `{text}`"))?;
    Ok((rows, cols))
}

fn render(config: Option<&Path>, shape: &str, output_shape: &str, forward_only: bool) -> anyhow::Result<()> {
    let cfg = load_config(config)?;
    let (rows_in, cols_in) = parse_shape(shape)?;
    let (rows_out, cols_out) = parse_shape(output_shape)?;
    modelbridge::shapes::check_input(rows_in, cols_in, cfg.expects_batch_dim)?;

    let paths = ArtifactPaths::new(cfg.build_dir.clone(), BuildIdentity::new(cfg.name.clone())?);
    std::fs::create_dir_all(paths.dir())
        .with_context(|| format!("failed to create {}", paths.dir().display()))?;
    let template = match &cfg.template {
        Some(path) => Template::from_file(path)?,
        None => Template::default(),
    };
    let model_path = match &cfg.model_search_path {
        Some(path) => path.clone(),
        None => paths.absolute_dir()?.to_string_lossy().into_owned(),
    };
    let vars = TemplateVars {
        model_path,
        device: cfg.device.clone(),
        name: cfg.name.clone(),
        shapes: ShapeMetadata {
            rows_in,
            cols_in,
            rows_out,
            cols_out,
        },
        availability: DerivativeAvailability {
            has_jacobian: !forward_only && cfg.with_jacobian,
            has_hessian: !forward_only && cfg.with_hessian,
        },
        model_expects_batch_dim: cfg.expects_batch_dim,
    };
    let source = codegen::render_to_file(&template, &vars, &paths)?;
    println!("{}", source.display());
    Ok(())
}

fn compile(target: &Target, config: Option<&Path>) -> anyhow::Result<()> {
    let cfg = load_config(config)?;
    let paths = target.paths()?;
    if !paths.source().exists() {
        bail!("no rendered source at {}", paths.source().display());
    }
    let toolchain = toolchain::resolve(&cfg.toolchain)?;
    let library = toolchain::compile(&toolchain, &paths)?;
    println!("{}", library.display());
    Ok(())
}

fn inspect(target: &Target) -> anyhow::Result<()> {
    let paths = target.paths()?;
    let manifest = BuildManifest::load(&paths)?;
    let text = manifest
        .to_toml()
        .context("failed to format manifest")?;
    print!("{text}");
    manifest
        .verify(&paths)
        .context("artifacts do not match the manifest")?;
    println!("# digests verified");
    Ok(())
}

#[cfg(feature = "native")]
fn call(target: &Target, input: &str, entry: &str) -> anyhow::Result<()> {
    use modelbridge::{DenseMatrix, ExternalFunction, Transform};

    let transform = match entry {
        "forward" => Transform::Forward,
        "jacobian" => Transform::Jacobian,
        "hessian" => Transform::Hessian,
        other => bail!("unknown entry `{other}` (expected forward|jacobian|hessian)"),
    };
    let values = input
        .split(',')
        .map(|v| v.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("invalid input vector `{input}`"))?;

    let paths = target.paths()?;
    let function = ExternalFunction::load(&target.name, &paths.library())?;
    let output = function.call(transform, &DenseMatrix::column(&values))?;
    println!("{output}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_shapes() {
        assert_eq!(parse_shape("3x1").unwrap(), (3, 1));
        assert_eq!(parse_shape("2X4").unwrap(), (2, 4));
        assert!(parse_shape("3").is_err());
        assert!(parse_shape("ax1").is_err());
    }
}
