//! Kubernetes driver
//!
//! Each run gets a Secret holding every environment value and file of the
//! operation, and a Pod (or Job) whose container reads those values through
//! secret references. Values are never inlined into the Pod spec.
//!
//! The run then blocks on a label-selector watch until the Pod reaches
//! `Succeeded` or `Failed`, is deleted, or 30 minutes pass. The Secret is
//! always removed afterwards; the Pod/Job is removed unless `CLEANUP_JOBS=false`.

use async_trait::async_trait;
use futures::TryStreamExt;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Pod, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, LogParams, PostParams, PropagationPolicy};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::wait::await_condition;
use kube::runtime::watcher::Event;
use kube::runtime::watcher;
use kube::{Client, Config};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{DriverError, Result};
use crate::{Configurable, Driver, Operation, flag, is_container_image};

/// Secret type for run payloads
pub const SECRET_TYPE: &str = "duffle.sh/cnab";

/// Name of the container running the invocation image
pub const CONTAINER_NAME: &str = "invocationimage";

/// How long to wait for a run to finish
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Annotation carrying the installation name verbatim
pub const INSTALLATION_ANNOTATION: &str = "duffle.sh/installation";

const FILES_VOLUME: &str = "files";

/// Longest object name or label value Kubernetes accepts
const MAX_NAME_LEN: usize = 63;

/// Runs invocation images as Pods or Jobs in a Kubernetes cluster
pub struct KubernetesDriver {
    namespace: String,
    kubeconfig: Option<PathBuf>,
    context: Option<String>,
    job: bool,
    cleanup: bool,
    verbose: bool,
    simulate: bool,
    client: Option<Client>,
}

impl KubernetesDriver {
    pub fn new() -> Self {
        Self {
            namespace: "default".to_string(),
            kubeconfig: None,
            context: None,
            job: false,
            cleanup: true,
            verbose: false,
            simulate: false,
            client: None,
        }
    }

    /// Use an existing client instead of loading a kubeconfig
    pub fn with_client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Print manifests instead of calling the cluster
    pub fn simulate(mut self, simulate: bool) -> Self {
        self.simulate = simulate;
        self
    }

    /// Run the image as a Job instead of a bare Pod
    pub fn use_jobs(mut self, job: bool) -> Self {
        self.job = job;
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn client(&self) -> Result<Client> {
        if let Some(client) = &self.client {
            return Ok(client.clone());
        }
        if self.kubeconfig.is_none() && self.context.is_none() {
            return Ok(Client::try_default().await?);
        }

        let options = KubeConfigOptions {
            context: self.context.clone(),
            ..Default::default()
        };
        let config = match &self.kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                    DriverError::InvalidConfig(format!("reading {}: {e}", path.display()))
                })?;
                Config::from_custom_kubeconfig(kubeconfig, &options).await
            }
            None => Config::from_kubeconfig(&options).await,
        }
        .map_err(|e| DriverError::InvalidConfig(e.to_string()))?;

        Ok(Client::try_from(config)?)
    }

    fn log_event(&self, what: &str, name: &str, phase: &str) {
        if self.verbose {
            tracing::info!(%name, %phase, "{what} event");
        } else {
            tracing::debug!(%name, %phase, "{what} event");
        }
    }

    async fn run_pod(&self, client: &Client, name: &str, op: &Operation) -> Result<()> {
        let pods: Api<Pod> = Api::namespaced(client.clone(), &self.namespace);
        pods.create(&PostParams::default(), &build_pod(name, op)?)
            .await?;
        tracing::info!(pod = %name, namespace = %self.namespace, "created pod");

        let result = self.wait_for_pod(&pods, name, op).await;
        copy_logs(&pods, name, op).await;

        if self.cleanup
            && let Err(e) = pods.delete(name, &DeleteParams::default()).await
        {
            report_cleanup(op, "pod", name, &e);
        }
        result
    }

    async fn wait_for_pod(&self, pods: &Api<Pod>, name: &str, op: &Operation) -> Result<()> {
        let config = watcher::Config::default().labels(&selector(op));
        let wait = async {
            let mut events = std::pin::pin!(watcher(pods.clone(), config));
            while let Some(event) = events
                .try_next()
                .await
                .map_err(|e| DriverError::Watch(e.to_string()))?
            {
                match event {
                    Event::Apply(pod) | Event::InitApply(pod) => {
                        let phase = pod
                            .status
                            .as_ref()
                            .and_then(|s| s.phase.clone())
                            .unwrap_or_default();
                        self.log_event("pod", name, &phase);
                        if let Some(outcome) = pod_outcome(&pod, name) {
                            return outcome;
                        }
                    }
                    Event::Delete(_) => {
                        return Err(DriverError::Deleted {
                            kind: "pod",
                            name: name.to_string(),
                        });
                    }
                    Event::Init | Event::InitDone => {}
                }
            }
            Err(DriverError::Watch(format!("watch on pod {name} ended")))
        };

        match tokio::time::timeout(WAIT_TIMEOUT, wait).await {
            Ok(result) => result,
            Err(_) => Err(DriverError::Timeout {
                what: format!("pod {name}"),
                after: WAIT_TIMEOUT,
            }),
        }
    }

    async fn run_job(&self, client: &Client, name: &str, op: &Operation) -> Result<()> {
        let jobs: Api<Job> = Api::namespaced(client.clone(), &self.namespace);
        jobs.create(&PostParams::default(), &build_job(name, op)?)
            .await?;
        tracing::info!(job = %name, namespace = %self.namespace, "created job");

        let finished = await_condition(jobs.clone(), name, |job: Option<&Job>| {
            job.is_none_or(|j| job_outcome(j, "").is_some())
        });
        let result = match tokio::time::timeout(WAIT_TIMEOUT, finished).await {
            Ok(Ok(Some(job))) => {
                self.log_event("job", name, "finished");
                job_outcome(&job, name).unwrap_or(Ok(()))
            }
            Ok(Ok(None)) => Err(DriverError::Deleted {
                kind: "job",
                name: name.to_string(),
            }),
            Ok(Err(e)) => Err(DriverError::Watch(e.to_string())),
            Err(_) => Err(DriverError::Timeout {
                what: format!("job {name}"),
                after: WAIT_TIMEOUT,
            }),
        };

        let pods: Api<Pod> = Api::namespaced(client.clone(), &self.namespace);
        match pods
            .list(&ListParams::default().labels(&format!("job-name={name}")))
            .await
        {
            Ok(list) => {
                for pod in list.items {
                    if let Some(pod_name) = pod.metadata.name {
                        copy_logs(&pods, &pod_name, op).await;
                    }
                }
            }
            Err(e) => tracing::warn!(job = %name, error = %e, "could not list job pods"),
        }

        if self.cleanup {
            let params = DeleteParams {
                propagation_policy: Some(PropagationPolicy::Background),
                ..Default::default()
            };
            if let Err(e) = jobs.delete(name, &params).await {
                report_cleanup(op, "job", name, &e);
            }
        }
        result
    }
}

impl Default for KubernetesDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for KubernetesDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubernetesDriver")
            .field("namespace", &self.namespace)
            .field("kubeconfig", &self.kubeconfig)
            .field("context", &self.context)
            .field("job", &self.job)
            .field("cleanup", &self.cleanup)
            .field("simulate", &self.simulate)
            .finish()
    }
}

/// Deterministic name for the resources of one run
///
/// Always a DNS-1123 label. Names over 63 characters are cut and suffixed
/// with a digest of the full name, so distinct runs keep distinct names.
pub fn run_name(installation: &str, revision: &str) -> String {
    let full = format!("{installation}-{revision}");
    let sanitized: String = full
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '-' => c,
            'A'..='Z' => c.to_ascii_lowercase(),
            _ => '-',
        })
        .collect();
    let trimmed = sanitized.trim_matches('-');
    if !trimmed.is_empty() && trimmed.len() <= MAX_NAME_LEN {
        trimmed.to_string()
    } else {
        shortened(trimmed, &full)
    }
}

/// Label value for `raw`, kept verbatim when Kubernetes accepts it
fn label_value(raw: &str) -> String {
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.');
    let valid = raw.len() <= MAX_NAME_LEN
        && raw.chars().all(allowed)
        && raw.starts_with(|c: char| c.is_ascii_alphanumeric())
        && raw.ends_with(|c: char| c.is_ascii_alphanumeric());
    if valid || raw.is_empty() {
        return raw.to_string();
    }
    let sanitized: String = raw.chars().map(|c| if allowed(c) { c } else { '-' }).collect();
    shortened(&sanitized, raw)
}

/// ASCII `prefix` cut to fit, followed by a short digest of `full`
fn shortened(prefix: &str, full: &str) -> String {
    let digest = hex::encode(&Sha256::digest(full.as_bytes())[..4]);
    let room = MAX_NAME_LEN - digest.len() - 1;
    let prefix = prefix
        .get(..room)
        .unwrap_or(prefix)
        .trim_matches(|c: char| !c.is_ascii_alphanumeric());
    if prefix.is_empty() {
        digest
    } else {
        format!("{prefix}-{digest}")
    }
}

fn labels(op: &Operation) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("heritage".to_string(), "duffle".to_string()),
        ("release".to_string(), label_value(&op.installation)),
        ("action".to_string(), label_value(&op.action)),
        ("revision".to_string(), label_value(&op.revision)),
    ])
}

fn annotations(op: &Operation) -> BTreeMap<String, String> {
    BTreeMap::from([(INSTALLATION_ANNOTATION.to_string(), op.installation.clone())])
}

fn selector(op: &Operation) -> String {
    format!(
        "heritage=duffle,release={},revision={}",
        label_value(&op.installation),
        label_value(&op.revision)
    )
}

/// Secret key holding the n-th file (in path order)
fn file_key(index: usize) -> String {
    format!("file-{index}")
}

/// The Secret carrying every environment value and file of the run
pub fn build_secret(name: &str, op: &Operation) -> Secret {
    let mut data = op.environment.clone();
    for (index, content) in op.files.values().enumerate() {
        data.insert(file_key(index), content.clone());
    }

    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels(op)),
            annotations: Some(annotations(op)),
            ..Default::default()
        },
        type_: Some(SECRET_TYPE.to_string()),
        string_data: Some(data),
        ..Default::default()
    }
}

/// Pod spec whose container reads everything from the run Secret
fn pod_spec(name: &str, op: &Operation) -> serde_json::Value {
    let mut env = vec![json!({ "name": "CNAB_ACTION", "value": op.action })];
    for key in op.environment.keys().filter(|k| *k != "CNAB_ACTION") {
        env.push(json!({
            "name": key,
            "valueFrom": {
                "secretKeyRef": { "name": name, "key": key, "optional": true }
            }
        }));
    }

    let mut mounts = Vec::new();
    let mut items = Vec::new();
    for (index, path) in op.files.keys().enumerate() {
        let key = file_key(index);
        mounts.push(json!({
            "name": FILES_VOLUME,
            "mountPath": path,
            "subPath": key,
            "readOnly": true,
        }));
        items.push(json!({ "key": key, "path": key }));
    }

    let mut volumes = Vec::new();
    if !items.is_empty() {
        volumes.push(json!({
            "name": FILES_VOLUME,
            "secret": { "secretName": name, "optional": true, "items": items }
        }));
    }

    json!({
        "restartPolicy": "Never",
        "containers": [{
            "name": CONTAINER_NAME,
            "image": op.image,
            "env": env,
            "volumeMounts": mounts,
        }],
        "volumes": volumes,
    })
}

pub fn build_pod(name: &str, op: &Operation) -> Result<Pod> {
    Ok(serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": { "name": name, "labels": labels(op), "annotations": annotations(op) },
        "spec": pod_spec(name, op),
    }))?)
}

pub fn build_job(name: &str, op: &Operation) -> Result<Job> {
    Ok(serde_json::from_value(json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": { "name": name, "labels": labels(op), "annotations": annotations(op) },
        "spec": {
            "backoffLimit": 0,
            "template": {
                "metadata": { "labels": labels(op) },
                "spec": pod_spec(name, op),
            }
        }
    }))?)
}

/// Terminal result of a pod, if it has one
fn pod_outcome(pod: &Pod, name: &str) -> Option<Result<()>> {
    let status = pod.status.as_ref()?;
    match status.phase.as_deref()? {
        "Succeeded" => Some(Ok(())),
        "Failed" => {
            let reason = status
                .reason
                .clone()
                .or_else(|| status.message.clone())
                .unwrap_or_else(|| "unknown reason".to_string());
            Some(Err(DriverError::RunFailed {
                kind: "pod",
                name: name.to_string(),
                reason,
            }))
        }
        _ => None,
    }
}

/// Terminal result of a job, if it has one
fn job_outcome(job: &Job, name: &str) -> Option<Result<()>> {
    let conditions = job.status.as_ref()?.conditions.as_ref()?;
    conditions
        .iter()
        .filter(|c| c.status == "True")
        .find_map(|c| match c.type_.as_str() {
            "Complete" => Some(Ok(())),
            "Failed" => Some(Err(DriverError::RunFailed {
                kind: "job",
                name: name.to_string(),
                reason: c
                    .message
                    .clone()
                    .or_else(|| c.reason.clone())
                    .unwrap_or_else(|| "unknown reason".to_string()),
            })),
            _ => None,
        })
}

async fn copy_logs(pods: &Api<Pod>, name: &str, op: &Operation) {
    let params = LogParams {
        container: Some(CONTAINER_NAME.to_string()),
        ..Default::default()
    };
    match pods.logs(name, &params).await {
        Ok(logs) => {
            if let Err(e) = op.out.write_bytes(logs.as_bytes()) {
                tracing::warn!(pod = %name, error = %e, "could not copy pod log");
            }
        }
        Err(e) => tracing::warn!(pod = %name, error = %e, "could not fetch pod log"),
    }
}

fn report_cleanup(op: &Operation, kind: &str, name: &str, error: &kube::Error) {
    tracing::warn!(%kind, %name, %error, "cleanup failed");
    let _ = op.out.line(format!("failed to delete {kind} {name}: {error}"));
}

#[async_trait]
impl Driver for KubernetesDriver {
    async fn run(&self, op: &Operation) -> Result<()> {
        if !is_container_image(&op.image_type) {
            return Err(DriverError::unsupported_image("Kubernetes", &op.image_type));
        }

        let name = run_name(&op.installation, &op.revision);
        let secret = build_secret(&name, op);

        if self.simulate {
            op.out.line("Secret:")?;
            op.out.line(serde_json::to_string_pretty(&secret)?)?;
            if self.job {
                op.out.line("Job:")?;
                op.out.line(serde_json::to_string_pretty(&build_job(&name, op)?)?)?;
            } else {
                op.out.line("Pod:")?;
                op.out.line(serde_json::to_string_pretty(&build_pod(&name, op)?)?)?;
            }
            return Ok(());
        }

        let client = self.client().await?;
        let secrets: Api<Secret> = Api::namespaced(client.clone(), &self.namespace);
        secrets.create(&PostParams::default(), &secret).await?;

        let result = if self.job {
            self.run_job(&client, &name, op).await
        } else {
            self.run_pod(&client, &name, op).await
        };

        if let Err(e) = secrets.delete(&name, &DeleteParams::default()).await {
            report_cleanup(op, "secret", &name, &e);
        }
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

impl Configurable for KubernetesDriver {
    fn config(&self) -> BTreeMap<&'static str, &'static str> {
        BTreeMap::from([
            ("KUBE_NAMESPACE", "Kubernetes namespace in which to run the invocation image"),
            ("KUBE_CONFIG", "The path to the Kubernetes configuration file"),
            ("KUBE_CONTEXT", "The name of the Kubernetes context to use"),
            ("KUBE_JOB", "If true, run the invocation image as a Job instead of a Pod"),
            ("CLEANUP_JOBS", "If false, keep the Pod or Job after the run"),
            ("VERBOSE", "If true, log every watch event"),
            ("SIMULATE", "If true, print the manifests instead of creating them"),
        ])
    }

    fn set_config(&mut self, settings: &BTreeMap<String, String>) {
        for (key, value) in settings {
            match key.as_str() {
                "KUBE_NAMESPACE" if !value.is_empty() => self.namespace = value.clone(),
                "KUBE_CONFIG" if !value.is_empty() => {
                    self.kubeconfig = Some(PathBuf::from(value));
                }
                "KUBE_CONTEXT" if !value.is_empty() => self.context = Some(value.clone()),
                "KUBE_JOB" => self.job = flag(value),
                "CLEANUP_JOBS" => self.cleanup = !value.trim().eq_ignore_ascii_case("false"),
                "VERBOSE" => self.verbose = flag(value),
                "SIMULATE" => self.simulate = flag(value),
                _ => {}
            }
        }
    }
}
