//! Isolated-container backend: launches the agent inside a locked-down
//! container via `bollard` instead of directly on the host. The container's
//! environment is rebuilt from scratch rather than inherited, and resource
//! limits (CPU, memory, PIDs, capabilities) are applied at create time.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    WaitContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{HostConfig, Mount, MountTypeEnum};
use bollard::Docker;
use futures::StreamExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::demux::ContainerDemuxer;
use crate::executor::{Executor, ExecutorError, Process, SimpleResult, SpawnSpec};

/// Resource limits and mount points applied to every container the backend
/// starts, mapped onto `bollard`'s host-config fields.
#[derive(Debug, Clone)]
pub struct ContainerLimits {
    pub image: String,
    pub cpu_limit: f64,
    pub memory_mb: u64,
    pub pids_limit: i64,
    pub network_mode: Option<String>,
    pub tmp_size_mb: u64,
    pub repo_root: PathBuf,
    pub logs_dir: PathBuf,
    /// Minimum interval enforced between any two container starts, to
    /// avoid throttling the daemon on image-layer pulls.
    pub spawn_delay: Duration,
}

/// Environment variables copied verbatim into the rebuilt container
/// environment when present on the host — nothing else passes through.
const APPROVED_ENV_VARS: &[&str] = &[
    "HOME",
    "GH_TOKEN",
    "GITHUB_TOKEN",
    "GIT_AUTHOR_NAME",
    "GIT_AUTHOR_EMAIL",
    "GIT_COMMITTER_NAME",
    "GIT_COMMITTER_EMAIL",
    "ANTHROPIC_API_KEY",
    "CLAUDE_API_KEY",
];

/// Process-wide gate enforcing a minimum spacing between container starts,
/// shared by every `ContainerExecutor` instance in the binary.
static LAST_SPAWN: Mutex<Option<Instant>> = Mutex::const_new(None);

async fn wait_for_spawn_slot(min_interval: Duration) {
    let mut last = LAST_SPAWN.lock().await;
    if let Some(prev) = *last {
        let elapsed = prev.elapsed();
        if elapsed < min_interval {
            tokio::time::sleep(min_interval - elapsed).await;
        }
    }
    *last = Some(Instant::now());
}

pub struct ContainerExecutor {
    docker: Docker,
    limits: ContainerLimits,
}

impl ContainerExecutor {
    /// Connects to the local Docker daemon. Returns `None` (rather than an
    /// error) when the daemon is unreachable, so the factory can fall back
    /// to the host backend.
    pub async fn try_connect(limits: ContainerLimits) -> Option<Self> {
        let docker = Docker::connect_with_local_defaults().ok()?;
        if docker.ping().await.is_err() {
            return None;
        }
        Some(Self { docker, limits })
    }

    fn rebuild_env(caller_env: &Option<HashMap<String, String>>) -> Vec<String> {
        let mut out = Vec::new();
        for key in APPROVED_ENV_VARS {
            let value = caller_env
                .as_ref()
                .and_then(|e| e.get(*key).cloned())
                .or_else(|| std::env::var(key).ok());
            if let Some(value) = value {
                out.push(format!("{key}={value}"));
            }
        }
        out
    }

    fn host_config(&self) -> HostConfig {
        let nano_cpus = (self.limits.cpu_limit * 1_000_000_000.0) as i64;
        let memory_bytes = (self.limits.memory_mb as i64) * 1024 * 1024;
        let tmp_size = format!("size={}m", self.limits.tmp_size_mb);

        let mut tmpfs = HashMap::new();
        tmpfs.insert("/tmp".to_string(), tmp_size);

        HostConfig {
            nano_cpus: Some(nano_cpus),
            memory: Some(memory_bytes),
            // Equal memory/memory-swap disables swap entirely.
            memory_swap: Some(memory_bytes),
            pids_limit: Some(self.limits.pids_limit),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            readonly_rootfs: Some(true),
            tmpfs: Some(tmpfs),
            network_mode: self.limits.network_mode.clone(),
            mounts: Some(vec![
                Mount {
                    target: Some("/repo".to_string()),
                    source: Some(self.limits.repo_root.display().to_string()),
                    typ: Some(MountTypeEnum::BIND),
                    read_only: Some(true),
                    ..Default::default()
                },
                Mount {
                    target: Some("/logs".to_string()),
                    source: Some(self.limits.logs_dir.display().to_string()),
                    typ: Some(MountTypeEnum::BIND),
                    read_only: Some(false),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        }
    }

    async fn create_and_start(&self, spec: &SpawnSpec) -> Result<String, ExecutorError> {
        wait_for_spawn_slot(self.limits.spawn_delay).await;

        let mut mounts = self.host_config();
        if let Some(cwd) = &spec.cwd {
            let mut existing = mounts.mounts.take().unwrap_or_default();
            existing.push(Mount {
                target: Some("/workspace".to_string()),
                source: Some(cwd.display().to_string()),
                typ: Some(MountTypeEnum::BIND),
                read_only: Some(false),
                ..Default::default()
            });
            mounts.mounts = Some(existing);
        }

        let config = Config {
            image: Some(self.limits.image.clone()),
            cmd: Some(spec.argv.clone()),
            env: Some(Self::rebuild_env(&spec.env)),
            working_dir: Some("/workspace".to_string()),
            open_stdin: Some(true),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            host_config: Some(mounts),
            ..Default::default()
        };

        let name = format!("hydraflow-{}", Uuid::new_v4());
        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| ExecutorError::Container(e.to_string()))?;

        self.docker
            .start_container::<String>(&created.id, None)
            .await
            .map_err(|e| ExecutorError::Container(e.to_string()))?;

        Ok(created.id)
    }
}

#[async_trait]
impl Executor for ContainerExecutor {
    async fn create_streaming_process(
        &self,
        spec: SpawnSpec,
    ) -> Result<Box<dyn Process>, ExecutorError> {
        let container_id = self.create_and_start(&spec).await?;

        let log_stream = self.docker.logs(
            &container_id,
            Some(LogsOptions::<String> {
                follow: true,
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );

        let demuxer = Arc::new(Mutex::new(ContainerDemuxer::new()));
        let demux_writer = demuxer.clone();
        let stream_done = Arc::new(Mutex::new(false));
        let done_writer = stream_done.clone();

        tokio::spawn(async move {
            let mut stream = log_stream;
            while let Some(frame) = stream.next().await {
                let mut guard = demux_writer.lock().await;
                match frame {
                    // bollard has already split stdout from stderr for us
                    // (it decodes Docker's own multiplex framing
                    // internally) — feed each stream's bytes directly
                    // rather than re-parsing headers that aren't there.
                    Ok(LogOutput::StdOut { message }) => guard.feed_stdout(&message),
                    Ok(LogOutput::StdErr { message }) => guard.feed_stderr(&message),
                    _ => {}
                }
            }
            demux_writer.lock().await.finish();
            *done_writer.lock().await = true;
        });

        Ok(Box::new(ContainerProcess {
            id: Uuid::new_v4(),
            container_id,
            docker: self.docker.clone(),
            demuxer,
        }))
    }

    async fn run_simple(
        &self,
        spec: SpawnSpec,
        timeout: Duration,
    ) -> Result<SimpleResult, ExecutorError> {
        let container_id = self.create_and_start(&spec).await?;

        let wait = self
            .docker
            .wait_container(&container_id, None::<WaitContainerOptions<String>>)
            .collect::<Vec<_>>();

        let outcome = tokio::time::timeout(timeout, wait).await;

        let logs = self
            .docker
            .logs(
                &container_id,
                Some(LogsOptions::<String> {
                    stdout: true,
                    stderr: true,
                    ..Default::default()
                }),
            )
            .collect::<Vec<_>>()
            .await;

        let mut demuxer = ContainerDemuxer::new();
        for frame in logs.into_iter().flatten() {
            match frame {
                LogOutput::StdOut { message } => demuxer.feed_stdout(&message),
                LogOutput::StdErr { message } => demuxer.feed_stderr(&message),
                _ => {}
            }
        }
        demuxer.finish();
        let mut stdout = String::new();
        while let Some(line) = demuxer.next_line() {
            if !stdout.is_empty() {
                stdout.push('\n');
            }
            stdout.push_str(&line);
        }
        let stderr = demuxer.stderr().to_string();

        let _ = self
            .docker
            .remove_container(
                &container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;

        match outcome {
            Ok(results) => {
                let exit_code = results
                    .into_iter()
                    .next()
                    .and_then(|r| r.ok())
                    .map(|r| r.status_code as i32);
                Ok(SimpleResult {
                    stdout,
                    stderr,
                    exit_code,
                })
            }
            Err(_) => Err(ExecutorError::Timeout(timeout)),
        }
    }

    async fn cleanup(&self) {}
}

struct ContainerProcess {
    id: Uuid,
    container_id: String,
    docker: Docker,
    demuxer: Arc<Mutex<ContainerDemuxer>>,
}

#[async_trait]
impl Process for ContainerProcess {
    fn id(&self) -> Uuid {
        self.id
    }

    async fn write_stdin(&mut self, data: &[u8]) -> Result<(), ExecutorError> {
        let exec = self
            .docker
            .create_exec(
                &self.container_id,
                CreateExecOptions {
                    attach_stdin: Some(true),
                    cmd: Some(vec!["cat".to_string()]),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| ExecutorError::Container(e.to_string()))?;

        if let Ok(StartExecResults::Attached { mut input, .. }) =
            self.docker.start_exec(&exec.id, None).await
        {
            use tokio::io::AsyncWriteExt;
            let _ = input.write_all(data).await;
        }
        Ok(())
    }

    async fn close_stdin(&mut self) -> Result<(), ExecutorError> {
        Ok(())
    }

    async fn next_stdout_line(&mut self) -> Option<String> {
        loop {
            {
                let mut guard = self.demuxer.lock().await;
                if let Some(line) = guard.next_line() {
                    return Some(line);
                }
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
            if self.wait_exited().await {
                let mut guard = self.demuxer.lock().await;
                guard.finish();
                return guard.next_line();
            }
        }
    }

    fn stderr_snapshot(&self) -> String {
        self.demuxer
            .try_lock()
            .map(|g| g.stderr().to_string())
            .unwrap_or_default()
    }

    async fn kill(&mut self) -> Result<(), ExecutorError> {
        let _ = self.docker.kill_container::<String>(&self.container_id, None).await;
        let _ = self
            .docker
            .remove_container(
                &self.container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;
        Ok(())
    }

    async fn wait(&mut self) -> Result<Option<i32>, ExecutorError> {
        let results = self
            .docker
            .wait_container(&self.container_id, None::<WaitContainerOptions<String>>)
            .collect::<Vec<_>>()
            .await;
        let code = results
            .into_iter()
            .next()
            .and_then(|r| r.ok())
            .map(|r| r.status_code as i32);
        Ok(code)
    }
}

impl ContainerProcess {
    async fn wait_exited(&self) -> bool {
        matches!(
            self.docker.inspect_container(&self.container_id, None).await,
            Ok(info) if info.state.and_then(|s| s.running).map(|r| !r).unwrap_or(false)
        )
    }
}
