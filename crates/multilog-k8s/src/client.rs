//! Kubernetes client and log source

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{AsyncBufReadExt, StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{Namespace, Pod};
use kube::Api;
use kube::api::{ListParams, LogParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use tracing::debug;

use multilog_types::StreamTarget;

use crate::{LogRequest, LogSource, LogStream, SourceError};

/// Kubeconfig wrapper used to pick a context and build clients for it
pub struct KubeClient {
    kubeconfig: Kubeconfig,
    current_context: Option<String>,
}

impl KubeClient {
    /// Load the kubeconfig from an explicit path, or from the default
    /// locations (`$KUBECONFIG`, `~/.kube/config`)
    pub fn new(path: Option<&Path>) -> Result<Self> {
        let kubeconfig = match path {
            Some(path) => Kubeconfig::read_from(path)
                .with_context(|| format!("Failed to read kubeconfig at {}", path.display()))?,
            None => {
                Kubeconfig::read().context("Failed to read kubeconfig. Is kubectl configured?")?
            }
        };

        let current_context = kubeconfig.current_context.clone();

        Ok(Self {
            kubeconfig,
            current_context,
        })
    }

    /// Names of all contexts in the kubeconfig
    pub fn contexts(&self) -> Vec<String> {
        self.kubeconfig
            .contexts
            .iter()
            .map(|ctx| ctx.name.clone())
            .collect()
    }

    /// Get the current context name
    pub fn current_context(&self) -> Option<&str> {
        self.current_context.as_deref()
    }

    /// Create a kube::Client for a specific context
    pub async fn client_for_context(&self, context_name: &str) -> Result<kube::Client> {
        if !self.kubeconfig.contexts.iter().any(|c| c.name == context_name) {
            anyhow::bail!("Context '{}' not found in kubeconfig", context_name);
        }

        let config = kube::Config::from_custom_kubeconfig(
            self.kubeconfig.clone(),
            &KubeConfigOptions {
                context: Some(context_name.to_string()),
                ..Default::default()
            },
        )
        .await
        .with_context(|| format!("Failed to create config for context: {}", context_name))?;

        kube::Client::try_from(config)
            .with_context(|| format!("Failed to create client for context: {}", context_name))
    }
}

/// [`LogSource`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeSource {
    client: kube::Client,
}

impl KubeSource {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl LogSource for KubeSource {
    async fn list_namespaces(&self) -> Result<Vec<String>, SourceError> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        let list = namespaces
            .list(&ListParams::default())
            .await
            .map_err(|e| SourceError::ClusterUnreachable(e.to_string()))?;

        Ok(list
            .items
            .into_iter()
            .filter_map(|ns| ns.metadata.name)
            .collect())
    }

    async fn list_pods(
        &self,
        namespace: &str,
        selector: Option<&str>,
    ) -> Result<Vec<String>, SourceError> {
        let mut params = ListParams::default();
        if let Some(selector) = selector.filter(|s| !s.is_empty()) {
            params = params.labels(selector);
        }

        let list = self.pods(namespace).list(&params).await.map_err(|e| {
            classify(
                e,
                || SourceError::NamespaceNotFound(namespace.to_string()),
                SourceError::ClusterUnreachable,
            )
        })?;

        debug!(namespace, count = list.items.len(), "listed pods");
        Ok(list
            .items
            .into_iter()
            .filter_map(|pod| pod.metadata.name)
            .collect())
    }

    async fn list_containers(
        &self,
        namespace: &str,
        pod: &str,
    ) -> Result<Vec<String>, SourceError> {
        let info = self.pods(namespace).get(pod).await.map_err(|e| {
            classify(
                e,
                || SourceError::PodNotFound {
                    namespace: namespace.to_string(),
                    pod: pod.to_string(),
                },
                SourceError::ClusterUnreachable,
            )
        })?;

        Ok(info
            .spec
            .map(|spec| spec.containers.into_iter().map(|c| c.name).collect())
            .unwrap_or_default())
    }

    async fn stream_logs(
        &self,
        target: &StreamTarget,
        request: &LogRequest,
    ) -> Result<LogStream, SourceError> {
        let params = LogParams {
            follow: request.follow,
            container: Some(target.container.clone()),
            // since_seconds wins over tail_lines when both are set
            tail_lines: if request.since_seconds.is_some() {
                None
            } else {
                request.tail_lines
            },
            since_seconds: request.since_seconds,
            previous: request.previous,
            timestamps: true,
            ..Default::default()
        };

        let api = self.pods(&target.namespace);
        let to_error = |e: kube::Error| classify_stream_error(e, target);

        if !request.follow {
            let snapshot = api.logs(&target.pod, &params).await.map_err(to_error)?;
            return Ok(LogStream {
                snapshot,
                lines: futures::stream::empty().boxed(),
            });
        }

        let reader = api
            .log_stream(&target.pod, &params)
            .await
            .map_err(to_error)?;

        let lines = reader
            .lines()
            .map_err(|e| SourceError::Stream(e.to_string()))
            .boxed();

        Ok(LogStream {
            snapshot: String::new(),
            lines,
        })
    }
}

/// Map an API error to the taxonomy: 404 becomes `not_found`, anything
/// else goes through `other`
fn classify(
    err: kube::Error,
    not_found: impl FnOnce() -> SourceError,
    other: fn(String) -> SourceError,
) -> SourceError {
    match err {
        kube::Error::Api(resp) if resp.code == 404 => not_found(),
        err => other(err.to_string()),
    }
}

fn classify_stream_error(err: kube::Error, target: &StreamTarget) -> SourceError {
    match &err {
        kube::Error::Api(resp) if resp.code == 404 => SourceError::PodNotFound {
            namespace: target.namespace.clone(),
            pod: target.pod.clone(),
        },
        // The API answers 400 "container X is not valid for pod Y"
        kube::Error::Api(resp) if resp.code == 400 && resp.message.contains("is not valid for pod") => {
            SourceError::ContainerNotFound {
                namespace: target.namespace.clone(),
                pod: target.pod.clone(),
                container: target.container.clone(),
            }
        }
        _ => SourceError::Stream(err.to_string()),
    }
}
