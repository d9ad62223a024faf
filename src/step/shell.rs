// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipestep contributors

//! Shell step kind
//!
//! Runs a command template once per target file. Templates may use
//! `{target}`, `{name}`, `{shard}`, `{output}`, `{temp}` and `{dep:NAME}`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::process::Command;

use super::kind::{StepContext, StepKind};
use super::resources::ResourceSpec;
use crate::errors::{PipestepError, PipestepResult};

/// Parameters of the shell kind
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShellParams {
    /// Command run for each target
    pub command: String,

    /// Explicit target file names
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<String>,

    /// Number of shards, named after `pattern`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shards: Option<usize>,

    /// Shard file name pattern, `{i}` is replaced by the shard index
    #[serde(default = "default_pattern")]
    pub pattern: String,

    /// Command run by the main task once every target exists
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post: Option<String>,

    /// Shell to use
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Default resources of the step's tasks
    #[serde(default)]
    pub resources: ResourceSpec,
}

fn default_pattern() -> String {
    "part.{i}".to_string()
}

fn default_shell() -> String {
    "bash".to_string()
}

/// Shell step kind
pub struct ShellKind {
    params: ShellParams,
}

impl ShellKind {
    /// Build from pipeline parameters
    pub fn from_params(label: &str, params: &serde_yaml::Value) -> PipestepResult<Self> {
        let params: ShellParams =
            serde_yaml::from_value(params.clone()).map_err(|e| PipestepError::InvalidParams {
                step: label.to_string(),
                reason: e.to_string(),
            })?;

        if params.command.trim().is_empty() {
            return Err(PipestepError::InvalidParams {
                step: label.to_string(),
                reason: "Shell command is empty".to_string(),
            });
        }

        if params.targets.is_empty() && params.shards.unwrap_or(0) == 0 {
            return Err(PipestepError::InvalidParams {
                step: label.to_string(),
                reason: "Declare 'targets' or a non-zero 'shards' count".to_string(),
            });
        }

        if params.shards.is_some() && !params.pattern.contains("{i}") {
            return Err(PipestepError::InvalidParams {
                step: label.to_string(),
                reason: format!("Shard pattern '{}' has no {{i}} placeholder", params.pattern),
            });
        }

        Ok(Self { params })
    }

    /// Expand a command template
    fn expand(&self, template: &str, ctx: &StepContext, target: Option<&Path>) -> PipestepResult<String> {
        let mut out = template
            .replace("{output}", &ctx.output_dir.to_string_lossy())
            .replace("{temp}", &ctx.temp_dir.to_string_lossy());

        if let Some(target) = target {
            let name = target
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            out = out
                .replace("{target}", &target.to_string_lossy())
                .replace("{shard}", &self.shard_index(&name).unwrap_or_default())
                .replace("{name}", &name);
        }

        while let Some(start) = out.find("{dep:") {
            let Some(len) = out[start..].find('}') else {
                break;
            };
            let name = out[start + 5..start + len].to_string();
            let dir = ctx.dependency(&name)?.output_dir.to_string_lossy().to_string();
            out.replace_range(start..start + len + 1, &dir);
        }

        Ok(out)
    }

    /// Shard index encoded in a target name
    fn shard_index(&self, name: &str) -> Option<String> {
        self.params.shards?;
        let (prefix, suffix) = self.params.pattern.split_once("{i}")?;
        name.strip_prefix(prefix)?
            .strip_suffix(suffix)
            .map(str::to_string)
    }

    async fn run(&self, ctx: &StepContext, script: &str) -> PipestepResult<()> {
        let output = Command::new(&self.params.shell)
            .arg("-c")
            .arg(script)
            .current_dir(&ctx.output_dir)
            .envs(ctx.resources.to_env())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| PipestepError::Io {
                message: format!("Shell '{}' could not be started: {}", self.params.shell, e),
            })?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
        Err(PipestepError::Io {
            message: format!(
                "command exited with {}: {}",
                output.status,
                tail.into_iter().rev().collect::<Vec<_>>().join(" | ")
            ),
        })
    }
}

#[async_trait]
impl StepKind for ShellKind {
    fn name(&self) -> &str {
        "shell"
    }

    fn targets(&self, _ctx: &StepContext) -> PipestepResult<Vec<String>> {
        let mut targets = self.params.targets.clone();
        if let Some(shards) = self.params.shards {
            targets.extend((0..shards).map(|i| self.params.pattern.replace("{i}", &i.to_string())));
        }
        Ok(targets)
    }

    async fn compute(&self, ctx: &StepContext, target: &Path) -> PipestepResult<()> {
        let script = self.expand(&self.params.command, ctx, Some(target))?;
        tracing::debug!(step = %ctx.label, target = %target.display(), "Running: {}", script);

        self.run(ctx, &script).await?;

        if !target.exists() {
            return Err(PipestepError::Io {
                message: format!("command succeeded but did not create {}", target.display()),
            });
        }
        Ok(())
    }

    async fn post(&self, ctx: &StepContext) -> PipestepResult<()> {
        match &self.params.post {
            Some(template) => {
                let script = self.expand(template, ctx, None)?;
                tracing::debug!(step = %ctx.label, "Running post command: {}", script);
                self.run(ctx, &script).await
            }
            None => Ok(()),
        }
    }

    fn default_resources(&self) -> ResourceSpec {
        self.params.resources.clone()
    }

    fn params(&self) -> serde_yaml::Value {
        serde_yaml::to_value(&self.params).unwrap_or(serde_yaml::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::kind::DependencyOutput;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn context(root: &Path) -> StepContext {
        let mut dependencies = BTreeMap::new();
        dependencies.insert(
            "corpus".to_string(),
            DependencyOutput {
                label: "raw".into(),
                output_dir: PathBuf::from("/data/raw/output"),
                targets: vec![],
            },
        );

        StepContext {
            label: "clean".into(),
            output_dir: root.join("output"),
            temp_dir: root.join("temp"),
            logs_dir: root.join("logs"),
            dependencies,
            resources: ResourceSpec::default(),
        }
    }

    fn kind(yaml: &str) -> PipestepResult<ShellKind> {
        let value: serde_yaml::Value = serde_yaml::from_str(yaml).unwrap();
        ShellKind::from_params("clean", &value)
    }

    #[test]
    fn test_sharded_targets() {
        let kind = kind("command: cp x {target}\nshards: 3\npattern: \"part.{i}.gz\"").unwrap();
        let ctx = context(Path::new("/tmp/p/clean"));
        assert_eq!(
            kind.targets(&ctx).unwrap(),
            vec!["part.0.gz", "part.1.gz", "part.2.gz"]
        );
    }

    #[test]
    fn test_expand_placeholders() {
        let kind = kind("command: x\nshards: 2\npattern: \"part.{i}.gz\"").unwrap();
        let ctx = context(Path::new("/p/clean"));
        let target = PathBuf::from("/p/clean/output/part.1.gz");

        let script = kind
            .expand("zcat {dep:corpus}/part.{shard}.gz > {target} # {name}", &ctx, Some(&target))
            .unwrap();
        assert_eq!(
            script,
            "zcat /data/raw/output/part.1.gz > /p/clean/output/part.1.gz # part.1.gz"
        );
    }

    #[test]
    fn test_expand_unknown_dependency() {
        let kind = kind("command: x\ntargets: [a]").unwrap();
        let ctx = context(Path::new("/p/clean"));
        assert!(matches!(
            kind.expand("cat {dep:vocab}", &ctx, None),
            Err(PipestepError::UnresolvedDependency { .. })
        ));
    }

    #[test]
    fn test_rejects_missing_targets() {
        assert!(matches!(
            kind("command: echo"),
            Err(PipestepError::InvalidParams { .. })
        ));
        assert!(matches!(
            kind("command: \"\"\ntargets: [a]"),
            Err(PipestepError::InvalidParams { .. })
        ));
    }

    #[tokio::test]
    async fn test_compute_writes_target() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = context(temp_dir.path());
        std::fs::create_dir_all(&ctx.output_dir).unwrap();

        let kind = kind("command: echo \"$PIPESTEP_CPUS {name}\" > {target}\ntargets: [a.txt]\nshell: sh")
            .unwrap();
        let target = ctx.output_dir.join("a.txt");
        kind.compute(&ctx, &target).await.unwrap();

        assert_eq!(std::fs::read_to_string(&target).unwrap(), "1 a.txt\n");
    }

    #[tokio::test]
    async fn test_compute_failure_reports_error() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = context(temp_dir.path());
        std::fs::create_dir_all(&ctx.output_dir).unwrap();

        let kind = kind("command: echo boom >&2; exit 3\ntargets: [a.txt]\nshell: sh").unwrap();
        let err = kind
            .compute(&ctx, &ctx.output_dir.join("a.txt"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("boom"));
    }
}
