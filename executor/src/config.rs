use crate::planner::{ArtifactLocation, ExecutionTargetVariant, JitMode};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::File,
    io,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{error, warn};

// check if a file exists and carries an executable mode bit
pub fn check_executable(path: &Path) -> Result<bool, ConfigError> {
    if !path.is_file() {
        Err(ConfigError::FileNotFound(path.to_path_buf()))
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigError::MetadataNotFound(e)),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read the harness config")]
    Unreadable(#[source] io::Error),
    #[error("Harness config is invalid")]
    Invalid(#[from] serde_yaml::Error),
    #[error("File not found: {0}")]
    FileNotFound(PathBuf),
    #[error("Metadata not found")]
    MetadataNotFound(#[from] io::Error),
}

/// Resolved inputs for the execution stage: the artifact handed over by the
/// build collaborator plus everything the configuration collaborator decides.
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct HarnessConfig {
    pub artifact: ArtifactConfig,
    // execution target the artifact must be launched under; unknown kinds
    // are rejected at parse time, never papered over at runtime
    pub target: TargetConfig,
    pub benchmark: BenchmarkConfig,
    #[serde(default = "default_launches")]
    pub launches: u32,
    #[serde(default = "default_acknowledgments")]
    pub acknowledgments: bool,
    #[serde(default)]
    pub affinity: Option<Vec<usize>>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ArtifactConfig {
    pub executable: PathBuf,
    pub binaries_dir: PathBuf,
    pub program_name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct BenchmarkConfig {
    pub name: String,
    // pre-rendered argument tail, appended verbatim to every launch
    #[serde(default)]
    pub args: String,
}

/// Selection of the execution-target variant, one tag per supported kind.
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub enum TargetConfig {
    Native,
    Vm {
        engine: PathBuf,
        #[serde(default)]
        jit: JitMode,
        #[serde(default)]
        extra_args: Vec<String>,
    },
    Browser {
        engine: PathBuf,
        #[serde(default)]
        engine_args: String,
        version: u32,
    },
    Aot,
}

impl HarnessConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let file = File::open(path).map_err(ConfigError::Unreadable)?;
        Ok(serde_yaml::from_reader(file)?)
    }

    pub fn artifact(&self) -> ArtifactLocation {
        ArtifactLocation {
            executable: self.artifact.executable.clone(),
            binaries_dir: self.artifact.binaries_dir.clone(),
            program_name: self.artifact.program_name.clone(),
        }
    }

    pub fn variant(&self) -> ExecutionTargetVariant {
        match &self.target {
            TargetConfig::Native => ExecutionTargetVariant::DirectNative,
            TargetConfig::Vm {
                engine,
                jit,
                extra_args,
            } => ExecutionTargetVariant::AlternateVm {
                engine: engine.clone(),
                jit: *jit,
                extra_args: extra_args.clone(),
            },
            TargetConfig::Browser {
                engine,
                engine_args,
                version,
            } => ExecutionTargetVariant::BrowserEngine {
                engine: engine.clone(),
                engine_args: engine_args.clone(),
                version: *version,
            },
            TargetConfig::Aot => ExecutionTargetVariant::AotBinDir,
        }
    }

    /// Validate everything at once so users see all problems in one pass.
    /// Returns true when an error was found.
    pub fn preflight_checks(&self) -> bool {
        let mut contains_error = false;

        if self.benchmark.name.is_empty() {
            error!("benchmark.name cannot be empty");
            contains_error = true;
        }

        if self.launches == 0 {
            error!("launches cannot be 0, nothing would be measured");
            contains_error = true;
        }

        if let Some(cpus) = &self.affinity {
            if cpus.is_empty() {
                error!("affinity cannot be an empty mask, omit it to run unpinned");
                contains_error = true;
            }
        }

        // a missing artifact is reported per launch as a failed result, the
        // engine paths are hard prerequisites though
        match check_executable(&self.artifact.executable) {
            Ok(true) => {}
            Ok(false) => warn!(
                "artifact.executable {} is not executable, launches will fail",
                self.artifact.executable.display()
            ),
            Err(e) => warn!(
                "artifact.executable {} is not runnable yet: {e}",
                self.artifact.executable.display()
            ),
        }

        if let TargetConfig::Vm { engine, .. } | TargetConfig::Browser { engine, .. } =
            &self.target
        {
            match check_executable(engine) {
                Ok(true) => {}
                Ok(false) => {
                    error!("target engine {} is not executable", engine.display());
                    contains_error = true;
                }
                Err(e) => {
                    error!("Failed to find target engine {}: {e}", engine.display());
                    contains_error = true;
                }
            }
        }

        contains_error
    }
}

fn default_launches() -> u32 {
    1
}

fn default_acknowledgments() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_config_parses() {
        let config: HarnessConfig = serde_yaml::from_str(
            "artifact: {executable: /opt/bench/app, binaries_dir: /opt/bench, program_name: app}\n\
             target: !vm {engine: /usr/bin/altvm, jit: llvm, extra_args: [--server]}\n\
             benchmark: {name: sort/large, args: --filter sort/large}\n\
             launches: 3\n\
             affinity: [0, 1]\n\
             env: {PROBE: value}\n",
        )
        .unwrap();

        assert_eq!(config.launches, 3);
        assert!(config.acknowledgments);
        assert_eq!(config.affinity, Some(vec![0, 1]));
        assert!(matches!(
            config.variant(),
            ExecutionTargetVariant::AlternateVm { jit: JitMode::Llvm, .. }
        ));
    }

    #[test]
    fn defaults_apply() {
        let config: HarnessConfig = serde_yaml::from_str(
            "artifact: {executable: /opt/bench/app, binaries_dir: /opt/bench, program_name: app}\n\
             target: native\n\
             benchmark: {name: sort/large}\n",
        )
        .unwrap();

        assert_eq!(config.launches, 1);
        assert!(config.acknowledgments);
        assert_eq!(config.affinity, None);
        assert!(config.env.is_empty());
        assert_eq!(config.benchmark.args, "");
        assert!(matches!(
            config.variant(),
            ExecutionTargetVariant::DirectNative
        ));
    }

    #[test]
    fn unknown_target_kinds_are_rejected() {
        let outcome = serde_yaml::from_str::<HarnessConfig>(
            "artifact: {executable: /opt/bench/app, binaries_dir: /opt/bench, program_name: app}\n\
             target: !jvm {engine: /usr/bin/java}\n\
             benchmark: {name: sort/large}\n",
        );

        assert!(outcome.is_err());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let outcome = serde_yaml::from_str::<HarnessConfig>(
            "artifact: {executable: /opt/bench/app, binaries_dir: /opt/bench, program_name: app}\n\
             target: native\n\
             benchmark: {name: sort/large}\n\
             retries: 5\n",
        );

        assert!(outcome.is_err());
    }

    #[test]
    fn executable_mode_bits_are_checked() {
        let directory = tempfile::tempdir().unwrap();
        let plain = directory.path().join("plain");
        std::fs::write(&plain, "data").unwrap();

        assert!(!check_executable(&plain).unwrap());
        assert!(matches!(
            check_executable(&directory.path().join("missing")),
            Err(ConfigError::FileNotFound(_))
        ));
    }
}
