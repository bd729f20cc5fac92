//! Recon kubehub – client setup, list/watch feed and event recorder for Kubernetes

#![forbid(unsafe_code)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use futures::stream::{BoxStream, StreamExt};
use kube::{
    api::{Api, ListParams},
    config::{KubeConfigOptions, Kubeconfig},
    core::{DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client, Config,
};
use recon_core::Object;
use recon_store::{Feed, WatchEvent};
use tracing::{debug, info};

mod events;

pub use events::KubeEventRecorder;

/// Build a client from an explicit kubeconfig and/or API server URL, falling
/// back to the usual in-cluster / `$KUBECONFIG` inference.
pub async fn client(kubeconfig: Option<&Path>, master: Option<&str>) -> Result<Client> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kc = Kubeconfig::read_from(path).with_context(|| format!("reading kubeconfig {}", path.display()))?;
            Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default()).await.context("loading kubeconfig")?
        }
        None => Config::infer().await.context("inferring kube config")?,
    };
    if let Some(url) = master {
        config.cluster_url = url.parse().with_context(|| format!("invalid API server url: {}", url))?;
    }
    Client::try_from(config).context("building kube client")
}

fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] => Ok(GroupVersionKind { group: String::new(), version: version.to_string(), kind: kind.to_string() }),
        [group, version, kind] => Ok(GroupVersionKind { group: (*group).to_string(), version: (*version).to_string(), kind: (*kind).to_string() }),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(kube::core::ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

fn object_from(obj: &DynamicObject) -> Result<Object> {
    let raw = serde_json::to_value(obj).context("serializing DynamicObject")?;
    Ok(Object::from_raw(raw))
}

/// List+watch feed for one GVK, optionally scoped to a namespace.
pub struct KubeFeed {
    api: Api<DynamicObject>,
    gvk_key: String,
}

impl KubeFeed {
    pub async fn new(client: Client, gvk_key: &str, namespace: Option<&str>) -> Result<Self> {
        let gvk = parse_gvk_key(gvk_key)?;
        let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;
        let api: Api<DynamicObject> = match (namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(client, ns, &ar),
            _ => Api::all_with(client, &ar),
        };
        info!(gvk = %gvk_key, ns = ?namespace, namespaced, "kube feed ready");
        Ok(Self { api, gvk_key: gvk_key.to_string() })
    }
}

#[async_trait::async_trait]
impl Feed for KubeFeed {
    async fn list_all(&self) -> Result<Vec<Object>> {
        let list = self.api.list(&ListParams::default()).await.with_context(|| format!("listing {}", self.gvk_key))?;
        debug!(gvk = %self.gvk_key, count = list.items.len(), "listed");
        list.items.iter().map(object_from).collect()
    }

    /// The kube watcher re-lists on its own after disconnects and reports that
    /// as `Restarted`; errors are surfaced per item and retried with backoff.
    fn watch(&self) -> BoxStream<'static, Result<WatchEvent>> {
        watcher::watcher(self.api.clone(), watcher::Config::default())
            .default_backoff()
            .map(|ev| -> Result<WatchEvent> {
                Ok(match ev.context("watch stream")? {
                    Event::Applied(o) => WatchEvent::Applied(object_from(&o)?),
                    Event::Deleted(o) => WatchEvent::Deleted(object_from(&o)?),
                    Event::Restarted(list) => WatchEvent::Restarted(list.iter().map(object_from).collect::<Result<_>>()?),
                })
            })
            .boxed()
    }
}
