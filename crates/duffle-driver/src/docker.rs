//! Docker driver - runs invocation images on the local Docker daemon

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions, LogOutput,
    RemoveContainerOptions, StartContainerOptions, UploadToContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, Mount, MountTypeEnum};
use futures::StreamExt;
use std::collections::BTreeMap;

use crate::error::{DriverError, Result};
use crate::{Configurable, Driver, Operation, flag, is_container_image};

/// Entrypoint every CNAB invocation image provides
pub const ENTRYPOINT: &str = "/cnab/app/run";

const DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// Runs Docker and OCI invocation images with the Docker daemon
#[derive(Debug, Default)]
pub struct DockerDriver {
    verbose: bool,
    simulate: bool,
    docker: Option<Docker>,
}

impl DockerDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Skip every daemon call
    pub fn simulate(mut self, simulate: bool) -> Self {
        self.simulate = simulate;
        self
    }

    /// Use an existing daemon connection instead of the local defaults
    pub fn with_client(mut self, docker: Docker) -> Self {
        self.docker = Some(docker);
        self
    }

    /// Copy files in, attach to the output streams and start the container
    async fn attach_and_start(
        &self,
        docker: &Docker,
        id: &str,
        archive: Option<Vec<u8>>,
    ) -> Result<AttachContainerResults> {
        if let Some(archive) = archive {
            let options = UploadToContainerOptions {
                path: "/".to_string(),
                ..Default::default()
            };
            docker.upload_to_container(id, Some(options), archive.into()).await?;
        }

        let attached = docker
            .attach_container(
                id,
                Some(AttachContainerOptions::<String> {
                    stdout: Some(true),
                    stderr: Some(true),
                    stream: Some(true),
                    logs: Some(true),
                    ..Default::default()
                }),
            )
            .await?;

        docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(attached)
    }

    async fn pull(&self, docker: &Docker, op: &Operation) -> Result<()> {
        op.out.line("Pulling Invocation Image...")?;
        let options = CreateImageOptions {
            from_image: op.image.clone(),
            ..Default::default()
        };

        let mut progress = docker.create_image(Some(options), None, None);
        while let Some(info) = progress.next().await {
            let info = info?;
            if let Some(status) = info.status {
                if self.verbose {
                    let line = match info.progress {
                        Some(p) => format!("{status} {p}"),
                        None => status,
                    };
                    op.out.line(line)?;
                } else {
                    tracing::debug!(image = %op.image, %status, "pull progress");
                }
            }
        }
        Ok(())
    }
}

/// Process environment for the container
///
/// The `CNAB_*` variables derived from the operation are always present;
/// entries supplied in `op.environment` win over them.
pub(crate) fn container_env(op: &Operation) -> Vec<String> {
    let mut env = BTreeMap::new();
    env.insert("CNAB_INSTALLATION_NAME".to_string(), op.installation.clone());
    env.insert("CNAB_ACTION".to_string(), op.action.clone());
    for (name, value) in &op.parameters {
        let rendered = match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        env.insert(format!("CNAB_P_{}", name.to_uppercase()), rendered);
    }
    env.extend(op.environment.clone());

    env.into_iter().map(|(k, v)| format!("{k}={v}")).collect()
}

/// Pack `files` into a tar archive rooted at `/`
pub(crate) fn build_file_archive(files: &BTreeMap<String, String>) -> Result<Option<Vec<u8>>> {
    if files.is_empty() {
        return Ok(None);
    }

    let mut builder = tar::Builder::new(Vec::new());
    for (path, content) in files {
        if !path.starts_with('/') {
            return Err(DriverError::Unsupported(format!(
                "destination path {path:?} should be an absolute unix path"
            )));
        }
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path.trim_start_matches('/'), content.as_bytes())?;
    }
    Ok(Some(builder.into_inner()?))
}

async fn discard(docker: &Docker, id: &str) {
    let options = RemoveContainerOptions {
        force: true,
        ..Default::default()
    };
    if let Err(e) = docker.remove_container(id, Some(options)).await {
        tracing::warn!(container = %id, error = %e, "could not remove container");
    }
}

#[async_trait]
impl Driver for DockerDriver {
    async fn run(&self, op: &Operation) -> Result<()> {
        if !is_container_image(&op.image_type) {
            return Err(DriverError::unsupported_image("Docker", &op.image_type));
        }

        let env = container_env(op);
        let archive = build_file_archive(&op.files)?;
        if self.simulate {
            tracing::info!(image = %op.image, "simulating Docker run");
            return Ok(());
        }

        let docker = match &self.docker {
            Some(docker) => docker.clone(),
            None => Docker::connect_with_local_defaults()?,
        };
        self.pull(&docker, op).await?;

        let host_config = HostConfig {
            mounts: Some(vec![Mount {
                typ: Some(MountTypeEnum::BIND),
                source: Some(DOCKER_SOCKET.to_string()),
                target: Some(DOCKER_SOCKET.to_string()),
                ..Default::default()
            }]),
            auto_remove: Some(true),
            ..Default::default()
        };
        let config = Config {
            image: Some(op.image.clone()),
            env: Some(env),
            entrypoint: Some(vec![ENTRYPOINT.to_string()]),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            host_config: Some(host_config),
            ..Default::default()
        };

        let container = docker
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await?;
        let id = container.id;
        tracing::debug!(container = %id, image = %op.image, "created container");

        let AttachContainerResults { mut output, .. } =
            match self.attach_and_start(&docker, &id, archive).await {
                Ok(attached) => attached,
                Err(e) => {
                    // Never started, so auto-remove does not apply
                    discard(&docker, &id).await;
                    return Err(e);
                }
            };

        let out = op.out.clone();
        let logs = tokio::spawn(async move {
            while let Some(Ok(chunk)) = output.next().await {
                match chunk {
                    LogOutput::StdOut { message }
                    | LogOutput::StdErr { message }
                    | LogOutput::Console { message } => {
                        if out.write_bytes(&message).is_err() {
                            break;
                        }
                    }
                    LogOutput::StdIn { .. } => {}
                }
            }
        });

        let mut waits = docker.wait_container(
            &id,
            Some(WaitContainerOptions {
                condition: "not-running",
            }),
        );
        let result = match waits.next().await {
            Some(Ok(exit)) if exit.status_code == 0 => Ok(()),
            Some(Ok(exit)) => Err(DriverError::ContainerFailed {
                code: exit.status_code,
            }),
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => {
                Err(DriverError::ContainerFailed { code })
            }
            Some(Err(e)) => Err(e.into()),
            None => Err(DriverError::RunFailed {
                kind: "container",
                name: id.clone(),
                reason: "wait ended without an exit status".to_string(),
            }),
        };

        // The stream ends once the container exits; drain it before returning
        let _ = logs.await;
        result
    }

    async fn handles(&self, image_type: &str) -> bool {
        is_container_image(image_type)
    }

    fn as_configurable(&self) -> Option<&dyn Configurable> {
        Some(self)
    }

    fn as_configurable_mut(&mut self) -> Option<&mut dyn Configurable> {
        Some(self)
    }
}

impl Configurable for DockerDriver {
    fn config(&self) -> BTreeMap<&'static str, &'static str> {
        BTreeMap::from([
            ("VERBOSE", "Increase verbosity. true, false are supported values"),
            ("SIMULATE", "If true, do not contact the Docker daemon"),
        ])
    }

    fn set_config(&mut self, settings: &BTreeMap<String, String>) {
        if let Some(v) = settings.get("VERBOSE") {
            self.verbose = flag(v);
        }
        if let Some(v) = settings.get("SIMULATE") {
            self.simulate = flag(v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Output;
    use serde_json::json;
    use std::io::Read;

    fn test_op() -> Operation {
        let mut op = Operation {
            installation: "myrelease".to_string(),
            action: "install".to_string(),
            image: "foo/bar:1.0".to_string(),
            image_type: "docker".to_string(),
            ..Default::default()
        };
        op.parameters.insert("port".to_string(), json!(8080));
        op.parameters.insert("host".to_string(), json!("example.com"));
        op
    }

    #[test]
    fn test_container_env() {
        let mut op = test_op();
        op.environment.insert("CNAB_P_PORT".to_string(), "9090".to_string());
        op.environment.insert("TOKEN".to_string(), "abc".to_string());

        let env = container_env(&op);
        assert!(env.contains(&"CNAB_INSTALLATION_NAME=myrelease".to_string()));
        assert!(env.contains(&"CNAB_ACTION=install".to_string()));
        assert!(env.contains(&"CNAB_P_HOST=example.com".to_string()));
        assert!(env.contains(&"CNAB_P_PORT=9090".to_string()));
        assert!(env.contains(&"TOKEN=abc".to_string()));
    }

    #[test]
    fn test_file_archive() {
        let mut files = BTreeMap::new();
        files.insert("/cnab/app/image-map.json".to_string(), "{}".to_string());
        files.insert("/root/.kube/config".to_string(), "kubeconfig".to_string());

        let data = build_file_archive(&files).unwrap().unwrap();
        let mut archive = tar::Archive::new(data.as_slice());
        let mut seen = BTreeMap::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().display().to_string();
            let mut body = String::new();
            entry.read_to_string(&mut body).unwrap();
            seen.insert(path, body);
        }
        assert_eq!(seen["cnab/app/image-map.json"], "{}");
        assert_eq!(seen["root/.kube/config"], "kubeconfig");
    }

    #[test]
    fn test_file_archive_rejects_relative_paths() {
        let mut files = BTreeMap::new();
        files.insert("relative/path".to_string(), "x".to_string());
        assert!(matches!(
            build_file_archive(&files),
            Err(DriverError::Unsupported(_))
        ));
        assert!(build_file_archive(&BTreeMap::new()).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_container_removed_when_upload_fails() {
        use wiremock::matchers::{method, path_regex, query_param};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path_regex(r"/images/create$"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"status\":\"Pulled\"}\n"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path_regex(r"/containers/create$"))
            .respond_with(
                ResponseTemplate::new(201).set_body_json(json!({ "Id": "c0ffee", "Warnings": [] })),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path_regex(r"/containers/c0ffee/archive$"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({ "message": "disk full" })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path_regex(r"/containers/c0ffee$"))
            .and(query_param("force", "true"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let docker =
            Docker::connect_with_http(&server.uri(), 5, bollard::API_DEFAULT_VERSION).unwrap();
        let driver = DockerDriver::new().with_client(docker);
        let mut op = test_op();
        op.out = Output::capture().0;
        op.files.insert("/cnab/app/image-map.json".to_string(), "{}".to_string());

        let err = driver.run(&op).await.unwrap_err();
        assert!(matches!(err, DriverError::Docker(_)), "{err}");
        server.verify().await;
    }

    #[tokio::test]
    async fn test_simulate_skips_daemon() {
        let driver = DockerDriver::new().simulate(true);
        driver.run(&test_op()).await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_unhandled_type() {
        let driver = DockerDriver::new().simulate(true);
        let mut op = test_op();
        op.image_type = "qcow".to_string();
        assert!(matches!(
            driver.run(&op).await,
            Err(DriverError::UnsupportedImageType { .. })
        ));
    }

    #[test]
    fn test_set_config() {
        let mut driver = DockerDriver::new();
        driver.set_config(&BTreeMap::from([("SIMULATE".to_string(), "1".to_string())]));
        assert!(driver.simulate);
    }
}
