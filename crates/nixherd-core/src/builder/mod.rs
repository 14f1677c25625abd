//! Builder client for the external nix toolchain.
//!
//! The only component that touches the outside world. Wraps two operations:
//! enumerating the build targets a flake exposes for the host system, and
//! building one target into a launchable binary path. All timeout and
//! output-parsing fragility is isolated here.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

/// Default deadline for `nix flake show`.
pub const ENUMERATE_TIMEOUT: Duration = Duration::from_secs(30);

/// Metadata for a single build target, as reported by `nix flake show`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TargetInfo {
    /// Human-readable target name. May be empty; callers fall back to the key.
    #[serde(default)]
    pub name: String,

    /// Output kind, e.g. `derivation`.
    #[serde(default, rename = "type")]
    pub kind: String,
}

/// The result of building a target: the store directory and the one
/// executable resolved from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildArtifact {
    /// Output directory (or file) produced by the builder.
    pub store_path: PathBuf,

    /// The single launchable binary resolved from `store_path`.
    pub binary_path: PathBuf,
}

/// Errors surfaced by the builder client.
#[derive(Debug, thiserror::Error)]
pub enum BuilderError {
    /// The invocation exceeded its deadline.
    #[error("{operation} timed out after {budget:?}")]
    Timeout {
        /// Which invocation timed out.
        operation: &'static str,
        /// The deadline that was exceeded.
        budget: Duration,
    },

    /// `nix flake show` exited non-zero.
    #[error("failed to run nix flake show: {output}")]
    ShowFailed {
        /// Combined stdout/stderr of the invocation.
        output: String,
    },

    /// `nix build` exited non-zero.
    #[error("build failed: {output}")]
    BuildFailed {
        /// Combined stdout/stderr of the invocation.
        output: String,
    },

    /// The tool produced no JSON at all.
    #[error("no JSON found in output: {output}")]
    NoJson {
        /// What the tool printed instead.
        output: String,
    },

    /// The JSON portion of the output did not parse.
    #[error("failed to parse flake show output")]
    Parse(#[from] serde_json::Error),

    /// The build printed an empty store path.
    #[error("no store path returned from build")]
    NoStorePath,

    /// `bin/` existed but was empty.
    #[error("no binaries found in {}", .dir.display())]
    NoBinaries {
        /// The `bin/` directory that was inspected.
        dir: PathBuf,
    },

    /// `bin/` held more than one entry; the operator must disambiguate.
    #[error("multiple binaries found in {}: {}", .dir.display(), .names.join(", "))]
    MultipleBinaries {
        /// The `bin/` directory that was inspected.
        dir: PathBuf,
        /// The conflicting entry names.
        names: Vec<String>,
    },

    /// The store path (or its `bin/` directory) could not be read.
    #[error("failed to read {}", .path.display())]
    Unreadable {
        /// The path that failed to stat or list.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Launching the external tool itself failed.
    #[error("failed to invoke builder")]
    Io(#[from] std::io::Error),
}

/// Seam between the materializer and the external toolchain.
///
/// Both operations run the tool in an isolated child process and are safe to
/// call concurrently from different tasks; each call blocks its caller until
/// completion or timeout.
#[async_trait]
pub trait Builder: Send + Sync {
    /// List the targets `repo_url` exposes for the host system.
    async fn enumerate(&self, repo_url: &str)
        -> Result<BTreeMap<String, TargetInfo>, BuilderError>;

    /// Build one target and resolve its launchable binary.
    async fn build(&self, repo_url: &str, key: &str) -> Result<BuildArtifact, BuilderError>;
}

#[async_trait]
impl Builder for Box<dyn Builder> {
    async fn enumerate(
        &self,
        repo_url: &str,
    ) -> Result<BTreeMap<String, TargetInfo>, BuilderError> {
        (**self).enumerate(repo_url).await
    }

    async fn build(&self, repo_url: &str, key: &str) -> Result<BuildArtifact, BuilderError> {
        (**self).build(repo_url, key).await
    }
}

/// Shape of the `nix flake show --json` document we care about.
#[derive(Debug, Deserialize)]
struct FlakeShow {
    #[serde(default)]
    packages: BTreeMap<String, BTreeMap<String, TargetInfo>>,
}

/// Client for the `nix` command-line toolchain.
#[derive(Debug, Clone)]
pub struct NixClient {
    program: PathBuf,
    system: String,
    timeout: Duration,
}

impl NixClient {
    /// Create a client invoking `nix` from `PATH`, with the host system
    /// computed once and the default enumerate deadline.
    #[must_use]
    pub fn new() -> Self {
        Self::with_program("nix")
    }

    /// Create a client invoking a specific program. Tests point this at a
    /// stub toolchain.
    #[must_use]
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            system: host_system(),
            timeout: ENUMERATE_TIMEOUT,
        }
    }

    /// Override the enumerate deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The canonical `<arch>-<os>` tuple this client selects targets for.
    #[must_use]
    pub fn system(&self) -> &str {
        &self.system
    }

    async fn run(&self, args: &[&str]) -> Result<std::process::Output, BuilderError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(cmd.output().await?)
    }
}

impl Default for NixClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Builder for NixClient {
    async fn enumerate(
        &self,
        repo_url: &str,
    ) -> Result<BTreeMap<String, TargetInfo>, BuilderError> {
        tracing::info!(repo_url, system = %self.system, "enumerating flake targets");

        let args = ["flake", "show", "--json", "--no-write-lock-file", repo_url];
        let invocation = self.run(&args);
        let output = tokio::time::timeout(self.timeout, invocation)
            .await
            .map_err(|_| BuilderError::Timeout {
                operation: "nix flake show",
                budget: self.timeout,
            })??;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(BuilderError::ShowFailed {
                output: combine(&stdout, &stderr),
            });
        }

        parse_flake_show(&stdout, &stderr, &self.system)
    }

    async fn build(&self, repo_url: &str, key: &str) -> Result<BuildArtifact, BuilderError> {
        tracing::info!(repo_url, key, "building target");

        let installable = format!("{repo_url}#{key}");
        let output = self
            .run(&["build", "--no-write-lock-file", "--print-out-paths", &installable])
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(BuilderError::BuildFailed {
                output: combine(&stdout, &stderr),
            });
        }

        let store_path = stdout.trim();
        if store_path.is_empty() {
            return Err(BuilderError::NoStorePath);
        }
        tracing::info!(key, store_path, "target built");

        let binary_path = resolve_binary(Path::new(store_path)).await?;
        tracing::debug!(key, binary = %binary_path.display(), "resolved binary");

        Ok(BuildArtifact {
            store_path: PathBuf::from(store_path),
            binary_path,
        })
    }
}

/// Derive the canonical `<arch>-<os>` tuple for the running machine.
#[must_use]
pub fn host_system() -> String {
    let os = match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    };
    format!("{}-{}", std::env::consts::ARCH, os)
}

/// Parse `nix flake show --json` output, tolerating non-JSON preamble, and
/// keep only the packages for `system`.
fn parse_flake_show(
    stdout: &str,
    stderr: &str,
    system: &str,
) -> Result<BTreeMap<String, TargetInfo>, BuilderError> {
    let Some(json_start) = stdout.find('{') else {
        return Err(BuilderError::NoJson {
            output: combine(stdout, stderr),
        });
    };

    let mut show: FlakeShow = serde_json::from_str(&stdout[json_start..])?;
    Ok(show.packages.remove(system).unwrap_or_default())
}

/// Resolve the single launchable binary inside a store path.
///
/// A regular file is its own binary; otherwise `store_path/bin` must contain
/// exactly one entry.
async fn resolve_binary(store_path: &Path) -> Result<PathBuf, BuilderError> {
    let meta = tokio::fs::metadata(store_path)
        .await
        .map_err(|source| BuilderError::Unreadable {
            path: store_path.to_path_buf(),
            source,
        })?;
    if meta.is_file() {
        return Ok(store_path.to_path_buf());
    }

    let bin_dir = store_path.join("bin");
    let mut entries =
        tokio::fs::read_dir(&bin_dir)
            .await
            .map_err(|source| BuilderError::Unreadable {
                path: bin_dir.clone(),
                source,
            })?;

    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();

    match names.as_slice() {
        [] => Err(BuilderError::NoBinaries { dir: bin_dir }),
        [only] => Ok(bin_dir.join(only)),
        _ => Err(BuilderError::MultipleBinaries {
            dir: bin_dir,
            names,
        }),
    }
}

fn combine(stdout: &str, stderr: &str) -> String {
    let mut combined = String::with_capacity(stdout.len() + stderr.len() + 1);
    combined.push_str(stdout.trim_end());
    if !stderr.trim().is_empty() {
        if !combined.is_empty() {
            combined.push('\n');
        }
        combined.push_str(stderr.trim_end());
    }
    combined
}
