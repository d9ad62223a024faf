// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipestep contributors

//! Local backend
//!
//! Every task is a detached `sh` wrapper in its own process group. The
//! wrapper keeps its bookkeeping in the jobs directory:
//!
//! | file          | content                                    |
//! |---------------|--------------------------------------------|
//! | `<id>.deps`   | ids the task waits for, re-read every poll |
//! | `<id>.pid`    | pid of the wrapper                         |
//! | `<id>.child`  | pid of the command, once started           |
//! | `<id>.exit`   | exit code, written last                    |
//!
//! A task whose dependency exited non-zero (or vanished) exits with 125
//! without running. Signals are forwarded by the wrapper to the command.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::backend::{require_tools, Backend, TaskExit, TaskSignal};
use super::{RunnerKind, TaskHandle, TaskRequest};
use crate::errors::{PipestepError, PipestepResult};
use crate::step::entry::shell_quote;
use crate::store::write_atomic;

/// Exit code of a task that never ran because a dependency failed
pub const DEPENDENCY_FAILED: i32 = 125;

/// Detached local processes
pub struct LocalBackend {
    jobs_dir: PathBuf,
    poll_interval: Duration,
    counter: AtomicU64,
    children: Mutex<HashMap<String, Child>>,
}

impl LocalBackend {
    pub fn new(jobs_dir: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            jobs_dir: jobs_dir.into(),
            poll_interval,
            counter: AtomicU64::new(0),
            children: Mutex::new(HashMap::new()),
        }
    }

    pub fn jobs_dir(&self) -> &Path {
        &self.jobs_dir
    }

    fn file(&self, id: &str, ext: &str) -> PathBuf {
        self.jobs_dir.join(format!("{}.{}", id, ext))
    }

    fn read(&self, id: &str, ext: &str) -> Option<String> {
        std::fs::read_to_string(self.file(id, ext))
            .ok()
            .map(|s| s.trim().to_string())
    }

    /// Ids are unique across processes sharing the jobs directory
    fn next_id(&self) -> String {
        loop {
            let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
            let id = format!("{}-{}", std::process::id(), n);
            if !self.file(&id, "deps").exists() {
                return id;
            }
        }
    }

    fn deps_content(dependencies: &[TaskHandle]) -> String {
        dependencies
            .iter()
            .map(|h| format!("{}\n", h.id))
            .collect()
    }

    /// The wrapper script run by `sh -c`
    fn wrapper(&self, id: &str, request: &TaskRequest) -> String {
        let command: Vec<String> = request.command.iter().map(|a| shell_quote(a)).collect();

        format!(
            r#"dir={dir}
id={id}
echo $$ > "$dir/$id.pid"
child=
cancelled=0
forward() {{
  if [ -n "$child" ]; then kill -s "$1" "$child" 2>/dev/null
  elif [ "$1" = TERM ]; then cancelled=1
  fi
}}
trap 'forward TERM' TERM INT
trap 'forward USR1' USR1
trap 'forward USR2' USR2
finish() {{
  echo "$1" > "$dir/$id.exit.tmp" && mv "$dir/$id.exit.tmp" "$dir/$id.exit"
  exit "$1"
}}
while :; do
  [ "$cancelled" = 1 ] && finish 143
  ready=1
  for dep in $(cat "$dir/$id.deps" 2>/dev/null); do
    if [ -f "$dir/$dep.exit" ]; then
      [ "$(cat "$dir/$dep.exit")" = 0 ] || finish {dependency_failed}
    elif [ -f "$dir/$dep.pid" ] && ! kill -0 "$(cat "$dir/$dep.pid")" 2>/dev/null; then
      finish {dependency_failed}
    else
      ready=0
    fi
  done
  [ "$ready" = 1 ] && break
  sleep {poll}
done
[ "$cancelled" = 1 ] && finish 143
cd {workdir} || finish 1
{command} >> {stdout} 2>> {stderr} < /dev/null &
child=$!
echo "$child" > "$dir/$id.child"
while :; do
  wait "$child"
  code=$?
  kill -0 "$child" 2>/dev/null || break
done
finish "$code"
"#,
            dir = shell_quote(&self.jobs_dir.to_string_lossy()),
            id = id,
            dependency_failed = DEPENDENCY_FAILED,
            poll = self.poll_interval.as_secs().max(1),
            workdir = shell_quote(&request.workdir.to_string_lossy()),
            command = command.join(" "),
            stdout = shell_quote(&request.stdout.to_string_lossy()),
            stderr = shell_quote(&request.stderr.to_string_lossy()),
        )
    }

    fn spawn(&self, id: &str, request: &TaskRequest) -> PipestepResult<Child> {
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(self.wrapper(id, request))
            .envs(request.resources.to_env())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        // Detached from the submitting terminal's process group
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        command
            .spawn()
            .map_err(|e| PipestepError::backend(RunnerKind::Local, format!("cannot start sh: {}", e)))
    }

    /// Reap a child we spawned, if it exited
    fn reap(&self, id: &str) -> Option<bool> {
        let mut children = match self.children.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let child = children.get_mut(id)?;
        match child.try_wait() {
            Ok(Some(_)) => {
                children.remove(id);
                Some(false)
            }
            Ok(None) => Some(true),
            Err(_) => None,
        }
    }

    async fn kill(&self, pid: &str, signal: &str) -> PipestepResult<bool> {
        let status = tokio::process::Command::new("kill")
            .args(["-s", signal, pid])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| PipestepError::backend(RunnerKind::Local, format!("cannot run kill: {}", e)))?;
        Ok(status.success())
    }

    async fn alive(&self, pid: &str) -> bool {
        tokio::process::Command::new("kill")
            .args(["-0", pid])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    fn exit_code(&self, id: &str) -> Option<TaskExit> {
        let content = self.read(id, "exit")?;
        let exit = match content.parse::<i32>() {
            Ok(DEPENDENCY_FAILED) => {
                TaskExit::code(DEPENDENCY_FAILED).with_detail("a dependency failed")
            }
            Ok(code) => TaskExit::code(code),
            Err(_) => TaskExit::unknown(format!("unreadable exit status '{}'", content)),
        };
        Some(exit)
    }
}

#[async_trait]
impl Backend for LocalBackend {
    fn kind(&self) -> RunnerKind {
        RunnerKind::Local
    }

    async fn submit(&self, request: TaskRequest) -> PipestepResult<TaskHandle> {
        std::fs::create_dir_all(&self.jobs_dir).map_err(|e| PipestepError::io_at(&self.jobs_dir, e))?;
        if let Some(parent) = request.stdout.parent() {
            std::fs::create_dir_all(parent).map_err(|e| PipestepError::io_at(parent, e))?;
        }

        let id = self.next_id();
        write_atomic(&self.file(&id, "deps"), &Self::deps_content(&request.dependencies))?;

        let child = self.spawn(&id, &request)?;
        // Written by the wrapper too; writing it here makes the task visible right away
        write_atomic(&self.file(&id, "pid"), &format!("{}\n", child.id()))?;

        let mut children = match self.children.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        children.insert(id.clone(), child);

        tracing::debug!("Started local task {} for {}", id, request.job_name());
        Ok(TaskHandle {
            id,
            target: request.target,
        })
    }

    async fn signal(&self, handle: &TaskHandle, signal: TaskSignal) -> PipestepResult<()> {
        if self.file(&handle.id, "exit").exists() {
            return Ok(());
        }
        let pid = self.read(&handle.id, "pid").ok_or_else(|| {
            PipestepError::backend(RunnerKind::Local, format!("task {} has no pid", handle))
        })?;

        if !self.kill(&pid, signal.name()).await? {
            return Err(PipestepError::backend(
                RunnerKind::Local,
                format!("could not deliver SIG{} to task {}", signal.name(), handle),
            ));
        }
        Ok(())
    }

    async fn wait_one(&self, handle: &TaskHandle) -> PipestepResult<TaskExit> {
        loop {
            if let Some(exit) = self.exit_code(&handle.id) {
                self.reap(&handle.id);
                return Ok(exit);
            }
            if !self.is_running(handle).await? {
                // The exit file is written before the wrapper exits
                return Ok(self
                    .exit_code(&handle.id)
                    .unwrap_or_else(|| TaskExit::unknown("task vanished without an exit status")));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn is_running(&self, handle: &TaskHandle) -> PipestepResult<bool> {
        if self.file(&handle.id, "exit").exists() {
            self.reap(&handle.id);
            return Ok(false);
        }
        if let Some(running) = self.reap(&handle.id) {
            return Ok(running);
        }
        match self.read(&handle.id, "pid") {
            Some(pid) => Ok(self.alive(&pid).await),
            None => Ok(false),
        }
    }

    async fn modify_dependency(
        &self,
        handle: &TaskHandle,
        dependencies: &[TaskHandle],
    ) -> PipestepResult<bool> {
        if self.file(&handle.id, "child").exists() {
            tracing::debug!("Task {} already started, dependency change has no effect", handle);
        }
        write_atomic(&self.file(&handle.id, "deps"), &Self::deps_content(dependencies))?;
        Ok(true)
    }

    async fn check_available(&self) -> PipestepResult<bool> {
        require_tools(&["sh", "kill"])
    }
}
