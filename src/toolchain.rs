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

//! Native builder: compiles a rendered source into `lib<name>.<ext>`.
//!
//! The compiler runs synchronously with an explicit argument list. A
//! non-zero exit is fatal and carries the exact command line.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::artifacts::ArtifactPaths;
use crate::config::ToolchainConfig;
use crate::error::BridgeError;

const COMPILER_CANDIDATES: [&str; 4] = ["gcc", "g++", "c++", "clang++"];

/// A resolved toolchain, ready to compile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toolchain {
    pub compiler: PathBuf,
    pub include_dirs: Vec<PathBuf>,
    pub lib_dir: PathBuf,
    pub runtime_lib: String,
    pub link_runtime: bool,
    pub cxx_std: String,
    pub cxx11_abi: bool,
    pub extra_args: Vec<String>,
}

/// Resolves unset settings from the environment and PATH.
pub fn resolve(cfg: &ToolchainConfig) -> Result<Toolchain, BridgeError> {
    let compiler = resolve_compiler(cfg.compiler.as_deref())?;

    let runtime_dir = match &cfg.runtime_dir {
        Some(dir) => dir.clone(),
        None => default_runtime_dir()?,
    };

    let mut include_dirs = cfg.include_dirs.clone();
    include_dirs.push(runtime_dir.join("include"));

    let cxx11_abi = match cfg.cxx11_abi {
        Some(flag) => flag,
        None => env_flag("MODELBRIDGE_CXX11_ABI").unwrap_or(true),
    };

    Ok(Toolchain {
        compiler,
        include_dirs,
        lib_dir: runtime_dir.join("lib"),
        runtime_lib: cfg.runtime_lib.clone(),
        link_runtime: cfg.link_runtime,
        cxx_std: cfg.cxx_std.clone(),
        cxx11_abi,
        extra_args: cfg.extra_args.clone(),
    })
}

fn resolve_compiler(configured: Option<&str>) -> Result<PathBuf, BridgeError> {
    if let Some(value) = configured {
        return which::which(value).map_err(|_| BridgeError::ToolMissing(value.to_string()));
    }
    if let Ok(value) = std::env::var("CXX") {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            return which::which(trimmed).map_err(|_| BridgeError::ToolMissing(trimmed.to_string()));
        }
    }
    COMPILER_CANDIDATES
        .iter()
        .find_map(|candidate| which::which(candidate).ok())
        .ok_or_else(|| BridgeError::ToolMissing(COMPILER_CANDIDATES.join("/")))
}

fn default_runtime_dir() -> Result<PathBuf, BridgeError> {
    if let Ok(value) = std::env::var("MODELBRIDGE_RUNTIME_DIR") {
        if !value.trim().is_empty() {
            return Ok(PathBuf::from(value.trim()));
        }
    }
    let home = dirs::home_dir().ok_or_else(|| {
        BridgeError::ToolMissing("runtime directory (set MODELBRIDGE_RUNTIME_DIR)".to_string())
    })?;
    Ok(home.join(".modelbridge"))
}

fn env_flag(var: &str) -> Option<bool> {
    match std::env::var(var).ok()?.trim() {
        "1" | "true" | "TRUE" | "on" => Some(true),
        "0" | "false" | "FALSE" | "off" => Some(false),
        _ => None,
    }
}

/// Linker flag naming the library's self-declared identity.
fn soname_flag(library_file: &str) -> String {
    let flag = if cfg!(target_os = "macos") {
        "install_name"
    } else {
        "soname"
    };
    format!("-Wl,-{flag},{library_file}")
}

/// A compiler invocation as program plus argument list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl CompileCommand {
    pub fn new(toolchain: &Toolchain, paths: &ArtifactPaths) -> Self {
        let mut args: Vec<String> = vec!["-fPIC".into(), "-shared".into()];
        args.push(paths.source().to_string_lossy().into_owned());
        args.push("-o".into());
        args.push(paths.library().to_string_lossy().into_owned());
        for dir in &toolchain.include_dirs {
            args.push(format!("-I{}", dir.display()));
        }
        args.push(format!("-L{}", toolchain.lib_dir.display()));
        args.push(soname_flag(&paths.library_file_name()));
        if toolchain.link_runtime {
            args.push(format!("-l{}", toolchain.runtime_lib));
        }
        args.push("-lstdc++".into());
        args.push(format!("-std={}", toolchain.cxx_std));
        args.push(format!(
            "-D_GLIBCXX_USE_CXX11_ABI={}",
            u8::from(toolchain.cxx11_abi)
        ));
        args.extend(toolchain.extra_args.iter().cloned());
        Self {
            program: toolchain.compiler.clone(),
            args,
        }
    }
}

impl fmt::Display for CompileCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " '{arg}'")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

struct CommandOutput {
    stderr: Vec<u8>,
    status: std::process::ExitStatus,
}

fn run_command(cmd: &CompileCommand) -> Result<CommandOutput, BridgeError> {
    let output = Command::new(&cmd.program)
        .args(&cmd.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => {
                BridgeError::ToolMissing(cmd.program.display().to_string())
            }
            _ => BridgeError::Io(err),
        })?;
    Ok(CommandOutput {
        stderr: output.stderr,
        status: output.status,
    })
}

/// Compiles `<name>.cpp` into the shared library and returns its path.
///
/// Any library left from an earlier build is removed first, so a failed
/// compilation never leaves a library behind.
pub fn compile(toolchain: &Toolchain, paths: &ArtifactPaths) -> Result<PathBuf, BridgeError> {
    let library = paths.library();
    remove_if_exists(&library)?;

    let cmd = CompileCommand::new(toolchain, paths);
    tracing::debug!(command = %cmd, "invoking compiler");
    let output = run_command(&cmd)?;
    if !output.status.success() {
        remove_if_exists(&library)?;
        return Err(BridgeError::Compilation {
            command: cmd.to_string(),
            status: output.status.to_string(),
            stderr: decode_to_string(&output.stderr),
        });
    }
    Ok(library)
}

fn remove_if_exists(path: &Path) -> Result<(), BridgeError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(BridgeError::Io(err)),
    }
}

fn decode_to_string(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        String::new()
    } else {
        String::from_utf8_lossy(bytes).trim().to_string()
    }
}
