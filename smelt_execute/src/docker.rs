use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogsOptions, RemoveContainerOptions, WaitContainerOptions,
};
use bollard::models::{HostConfig, Ulimit};
use bollard::Docker as DockerClient;
use bytes::Bytes;
use futures::StreamExt;
use smelt_events::CommandEventVariant;
use tokio::sync::mpsc;

use crate::script;
use crate::{ExecutionHandle, ExecutionOutcome, ExecutionRequest, ExecutionStatus, Executor};

/// A Docker-isolated ulimit, e.g. `nofile` or `nproc`.
#[derive(Debug, Clone)]
pub struct DockerUlimit {
    pub name: String,
    pub soft: i64,
    pub hard: i64,
}

/// Runs a command inside a resource-limited container via the Docker daemon.
pub struct Docker {
    pub image: String,
    pub additional_mounts: HashMap<String, String>,
    pub ulimits: Vec<DockerUlimit>,
}

impl Docker {
    fn binds(&self, request: &ExecutionRequest) -> Vec<String> {
        let mut binds = vec![format!(
            "{}:{}",
            request.working_dir.display(),
            request.working_dir.display()
        )];
        for (host, container) in &self.additional_mounts {
            binds.push(format!("{host}:{container}"));
        }
        binds
    }

    fn host_config(&self, request: &ExecutionRequest) -> HostConfig {
        HostConfig {
            binds: Some(self.binds(request)),
            nano_cpus: Some((request.runtime.num_cpus as i64) * 1_000_000_000),
            memory: Some((request.runtime.max_memory_mb as i64) * 1024 * 1024),
            ulimits: Some(
                self.ulimits
                    .iter()
                    .map(|u| Ulimit {
                        name: Some(u.name.clone()),
                        soft: Some(u.soft),
                        hard: Some(u.hard),
                    })
                    .collect(),
            ),
            ..Default::default()
        }
    }
}

/// `SMELT_ROOT`/`TARGET_ROOT` are appended on top of whatever the command's `runtime.env`
/// declares, same as the local backend.
fn container_env(request: &ExecutionRequest) -> Vec<String> {
    let mut env: Vec<String> = request.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
    env.push(format!("SMELT_ROOT={}", request.smelt_root));
    env.push(format!("TARGET_ROOT={}/smelt-out/{}", request.smelt_root, request.command_ref));
    env
}

#[async_trait]
impl Executor for Docker {
    async fn execute(&self, request: ExecutionRequest) -> anyhow::Result<ExecutionHandle> {
        let materialized = script::materialize(&request.working_dir, &request.command_ref, &request.script)?;

        let client = DockerClient::connect_with_local_defaults().context("failed to connect to the docker daemon")?;

        let config = Config {
            image: Some(self.image.clone()),
            cmd: Some(vec![materialized.script_path.display().to_string()]),
            working_dir: Some(request.working_dir.display().to_string()),
            env: Some(container_env(&request)),
            host_config: Some(self.host_config(&request)),
            ..Default::default()
        };

        let container_name = format!("smelt-{}", uuid::Uuid::new_v4());
        client
            .create_container(
                Some(CreateContainerOptions {
                    name: container_name.clone(),
                    ..Default::default()
                }),
                config,
            )
            .await
            .context("failed to create container")?;

        client
            .start_container::<String>(&container_name, None)
            .await
            .context("failed to start container")?;

        let timeout = Duration::from_secs(request.runtime.timeout);
        let cancellation = request.cancellation.clone();
        let stdout_path = materialized.stdout_path.clone();

        let (tx, rx) = mpsc::unbounded_channel();
        let result = tokio::spawn(run_to_completion(
            client,
            container_name,
            stdout_path,
            timeout,
            cancellation,
            tx,
        ));

        Ok(ExecutionHandle { events: rx, result })
    }
}

async fn run_to_completion(
    client: DockerClient,
    container_name: String,
    stdout_path: std::path::PathBuf,
    timeout: Duration,
    cancellation: tokio_util::sync::CancellationToken,
    tx: mpsc::UnboundedSender<CommandEventVariant>,
) -> anyhow::Result<ExecutionOutcome> {
    let mut logs = client.logs::<String>(
        &container_name,
        Some(LogsOptions {
            follow: true,
            stdout: true,
            stderr: false,
            ..Default::default()
        }),
    );

    let mut captured = Vec::new();
    let mut file = tokio::fs::File::create(&stdout_path).await.ok();

    let status = loop {
        tokio::select! {
            biased;

            _ = cancellation.cancelled() => {
                stop_and_remove(&client, &container_name).await;
                break ExecutionStatus::Cancelled;
            }
            _ = tokio::time::sleep(timeout) => {
                stop_and_remove(&client, &container_name).await;
                break ExecutionStatus::TimedOut;
            }
            chunk = logs.next() => {
                match chunk {
                    Some(Ok(output)) => {
                        let bytes: Bytes = output.into_bytes();
                        if let Some(file) = file.as_mut() {
                            use tokio::io::AsyncWriteExt;
                            let _ = file.write_all(&bytes).await;
                        }
                        captured.extend_from_slice(&bytes);
                        let _ = tx.send(CommandEventVariant::Stdout(bytes));
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "error reading container logs");
                    }
                    None => {
                        let exit_code = wait_for_exit(&client, &container_name).await?;
                        let _ = client
                            .remove_container(&container_name, Some(RemoveContainerOptions { force: true, ..Default::default() }))
                            .await;
                        break ExecutionStatus::Finished { exit_code };
                    }
                }
            }
        }
    };

    Ok(ExecutionOutcome { status, stdout: captured })
}

async fn wait_for_exit(client: &DockerClient, container_name: &str) -> anyhow::Result<i32> {
    let mut waits = client.wait_container(container_name, None::<WaitContainerOptions<String>>);
    match waits.next().await {
        Some(Ok(response)) => Ok(response.status_code as i32),
        Some(Err(e)) => Err(e).context("error waiting for container"),
        None => Ok(-1),
    }
}

async fn stop_and_remove(client: &DockerClient, container_name: &str) {
    let _ = client.stop_container(container_name, None).await;
    let _ = client
        .remove_container(container_name, Some(RemoveContainerOptions { force: true, ..Default::default() }))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use smelt_types::RuntimeRequirements;
    use std::path::PathBuf;

    fn request() -> ExecutionRequest {
        ExecutionRequest {
            command_ref: "//tests:smoke".to_owned(),
            script: vec!["true".to_owned()],
            working_dir: PathBuf::from("/work"),
            env: HashMap::from([("FOO".to_owned(), "bar".to_owned())]),
            smelt_root: "/work".to_owned(),
            runtime: RuntimeRequirements {
                num_cpus: 2,
                max_memory_mb: 512,
                ..RuntimeRequirements::default()
            },
            cancellation: tokio_util::sync::CancellationToken::new(),
        }
    }

    #[test]
    fn container_env_carries_smelt_root_and_target_root_alongside_declared_vars() {
        let env = container_env(&request());
        assert!(env.contains(&"FOO=bar".to_owned()));
        assert!(env.contains(&"SMELT_ROOT=/work".to_owned()));
        assert!(env.contains(&"TARGET_ROOT=/work/smelt-out//tests:smoke".to_owned()));
    }

    #[test]
    fn working_dir_is_bind_mounted_onto_itself() {
        let docker = Docker {
            image: "smelt/runner".to_owned(),
            additional_mounts: HashMap::new(),
            ulimits: Vec::new(),
        };
        let binds = docker.binds(&request());
        assert_eq!(binds, vec!["/work:/work".to_owned()]);
    }

    #[test]
    fn additional_mounts_are_appended_as_extra_binds() {
        let docker = Docker {
            image: "smelt/runner".to_owned(),
            additional_mounts: HashMap::from([("/host/cache".to_owned(), "/cache".to_owned())]),
            ulimits: Vec::new(),
        };
        let binds = docker.binds(&request());
        assert_eq!(binds.len(), 2);
        assert!(binds.contains(&"/host/cache:/cache".to_owned()));
    }

    #[test]
    fn host_config_translates_runtime_requirements_and_ulimits() {
        let docker = Docker {
            image: "smelt/runner".to_owned(),
            additional_mounts: HashMap::new(),
            ulimits: vec![DockerUlimit {
                name: "nofile".to_owned(),
                soft: 1024,
                hard: 2048,
            }],
        };
        let host_config = docker.host_config(&request());
        assert_eq!(host_config.nano_cpus, Some(2_000_000_000));
        assert_eq!(host_config.memory, Some(512 * 1024 * 1024));
        let ulimits = host_config.ulimits.unwrap();
        assert_eq!(ulimits.len(), 1);
        assert_eq!(ulimits[0].name.as_deref(), Some("nofile"));
        assert_eq!(ulimits[0].soft, Some(1024));
        assert_eq!(ulimits[0].hard, Some(2048));
    }
}
