use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    path::{Path, PathBuf},
};

/// Where the build stage left the runnable benchmark artifact.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArtifactLocation {
    pub executable: PathBuf,
    pub binaries_dir: PathBuf,
    pub program_name: String,
}

/// Identity of the benchmark a launch belongs to, used for hooks and logging.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BenchmarkId {
    pub name: String,
}

impl BenchmarkId {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl fmt::Display for BenchmarkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Code-generation flag handed to an alternate VM.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum JitMode {
    Llvm,
    #[default]
    NoLlvm,
}

impl JitMode {
    fn flag(self) -> &'static str {
        match self {
            Self::Llvm => "--llvm",
            Self::NoLlvm => "--nollvm",
        }
    }
}

/// The kind of runtime environment the artifact must be launched under.
///
/// The union is closed: resolving anything else is a configuration error in
/// [`crate::config`], never a runtime fallback.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExecutionTargetVariant {
    /// Invoke the artifact executable directly.
    DirectNative,
    /// Invoke a separate VM executable with the artifact path as an argument.
    AlternateVm {
        engine: PathBuf,
        jit: JitMode,
        extra_args: Vec<String>,
    },
    /// Invoke an external script engine against a version-selected entry
    /// script; the program module and benchmark arguments follow a separator.
    BrowserEngine {
        engine: PathBuf,
        engine_args: String,
        version: u32,
    },
    /// Like `DirectNative` but executed from the artifact's binaries
    /// directory, which ahead-of-time builds resolve satellites against.
    AotBinDir,
}

impl ExecutionTargetVariant {
    /// Script engines read benchmark input from their own REPL machinery, so
    /// the stdin handshake is never wired up for them.
    pub fn supports_acknowledgments(&self) -> bool {
        !matches!(self, Self::BrowserEngine { .. })
    }
}

/// Fully resolved, side-effect-free description of how to start the child.
///
/// `arguments` is kept as the single rendered string so logs record the exact
/// command line; [`split_arguments`] recovers the tokens at spawn time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchPlan {
    pub file_name: PathBuf,
    pub arguments: String,
    /// `None` inherits the harness working directory.
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

/// Entry script per minimum engine version, newest threshold last.
/// Table-driven so a new engine release is one added row.
const ENTRY_SCRIPTS: &[(u32, &str)] = &[(0, "main.js"), (7, "test-main.js")];

fn entry_script(version: u32) -> &'static str {
    ENTRY_SCRIPTS
        .iter()
        .rev()
        .find(|(minimum, _)| version >= *minimum)
        .map(|(_, script)| *script)
        .unwrap_or(ENTRY_SCRIPTS[0].1)
}

/// Map a target variant to its launch plan. Pure and total: equal inputs
/// always produce identical plans.
pub fn plan(
    variant: &ExecutionTargetVariant,
    artifact: &ArtifactLocation,
    args_tail: &str,
    env: &[(String, String)],
) -> LaunchPlan {
    match variant {
        ExecutionTargetVariant::DirectNative => LaunchPlan {
            file_name: artifact.executable.clone(),
            arguments: args_tail.to_owned(),
            working_dir: None,
            env: env.to_vec(),
        },
        ExecutionTargetVariant::AlternateVm {
            engine,
            jit,
            extra_args,
        } => LaunchPlan {
            file_name: engine.clone(),
            arguments: vm_arguments(*jit, extra_args, &artifact.executable, args_tail),
            working_dir: None,
            env: env.to_vec(),
        },
        ExecutionTargetVariant::BrowserEngine {
            engine,
            engine_args,
            version,
        } => LaunchPlan {
            file_name: engine.clone(),
            arguments: [
                engine_args.as_str(),
                entry_script(*version),
                "--",
                "--run",
                &format!("{}.wasm", artifact.program_name),
                args_tail,
            ]
            .iter()
            .filter(|part| !part.is_empty())
            .join(" "),
            working_dir: Some(artifact.binaries_dir.clone()),
            env: env.to_vec(),
        },
        ExecutionTargetVariant::AotBinDir => LaunchPlan {
            file_name: artifact.executable.clone(),
            arguments: args_tail.to_owned(),
            working_dir: Some(artifact.binaries_dir.clone()),
            env: env.to_vec(),
        },
    }
}

// vm usage is `vm [options] program [program-options]`: codegen flag first,
// extra tokens verbatim in their given order, then the quoted artifact path,
// then the argument tail
fn vm_arguments(jit: JitMode, extra_args: &[String], executable: &Path, args_tail: &str) -> String {
    std::iter::once(jit.flag().to_owned())
        .chain(extra_args.iter().cloned())
        .chain(std::iter::once(format!("\"{}\"", executable.display())))
        .chain(std::iter::once(args_tail.to_owned()))
        .filter(|part| !part.is_empty())
        .join(" ")
}

/// Split a rendered argument string back into spawnable tokens, honoring the
/// double quotes [`plan`] wraps the artifact path in.
pub fn split_arguments(arguments: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for character in arguments.chars() {
        match character {
            '"' => in_quotes = !in_quotes,
            character if character.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            character => current.push(character),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }

    tokens
}
