//! Reflex kubehub: discovery and a kube-rs backed list/watch source.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Result};
use futures::StreamExt;
use kube::{
    api::{Api, ListParams, WatchEvent as KubeEvent, WatchParams},
    core::{DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use metrics::counter;
use reflex_core::{EventStream, ListWatch, ListWatchError, Object, Snapshot, WatchEvent};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredResource {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespaced: bool,
}

impl DiscoveredResource {
    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

/// Discover served resources (incl. CRDs) using kube Discovery.
pub async fn discover() -> Result<Vec<DiscoveredResource>> {
    let client = Client::try_default().await?;
    let discovery = Discovery::new(client).run().await?;
    let mut out = Vec::new();
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            out.push(DiscoveredResource {
                group: ar.group.clone(),
                version: ar.version.clone(),
                kind: ar.kind.clone(),
                namespaced: matches!(caps.scope, Scope::Namespaced),
            });
        }
    }
    out.sort_by(|a, b| a.group.cmp(&b.group).then(a.version.cmp(&b.version)).then(a.kind.cmp(&b.kind)));
    Ok(out)
}

pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
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

/// A cluster object as seen by the cache. `managedFields` are dropped on ingest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KubeObject(pub DynamicObject);

impl From<DynamicObject> for KubeObject {
    fn from(mut obj: DynamicObject) -> Self {
        obj.metadata.managed_fields = None;
        Self(obj)
    }
}

impl Object for KubeObject {
    /// `namespace/name`, or just `name` for cluster-scoped objects.
    fn key(&self) -> String {
        let name = self.0.metadata.name.as_deref().unwrap_or("");
        match self.0.metadata.namespace.as_deref() {
            Some(ns) if !ns.is_empty() => format!("{}/{}", ns, name),
            _ => name.to_string(),
        }
    }

    fn version(&self) -> &str { self.0.metadata.resource_version.as_deref().unwrap_or("") }

    fn kind(&self) -> &str { self.0.types.as_ref().map(|t| t.kind.as_str()).unwrap_or("") }
}

fn classify(err: kube::Error) -> ListWatchError {
    match err {
        kube::Error::Api(resp) if resp.code == 410 => ListWatchError::Expired(resp.message),
        other => ListWatchError::Other(other.into()),
    }
}

/// Map one raw watch item; bookmarks carry no object and are skipped.
fn translate(item: kube::Result<KubeEvent<DynamicObject>>) -> Option<Result<WatchEvent<KubeObject>, ListWatchError>> {
    match item {
        Ok(KubeEvent::Added(o)) => Some(Ok(WatchEvent::Added(o.into()))),
        Ok(KubeEvent::Modified(o)) => Some(Ok(WatchEvent::Modified(o.into()))),
        Ok(KubeEvent::Deleted(o)) => Some(Ok(WatchEvent::Deleted(o.into()))),
        Ok(KubeEvent::Bookmark(b)) => {
            trace!(version = %b.metadata.resource_version, "bookmark");
            None
        }
        Ok(KubeEvent::Error(resp)) if resp.code == 410 => Some(Err(ListWatchError::Expired(resp.message))),
        Ok(KubeEvent::Error(resp)) => Some(Err(ListWatchError::Transport(format!("{} ({}): {}", resp.reason, resp.code, resp.message)))),
        Err(e) => Some(Err(classify(e))),
    }
}

/// List/watch over one API resource, optionally narrowed to a namespace.
pub struct KubeListWatch {
    api: Api<DynamicObject>,
    watch_timeout_secs: u32,
}

impl KubeListWatch {
    pub fn new(api: Api<DynamicObject>, watch_timeout_secs: u32) -> Self {
        Self { api, watch_timeout_secs }
    }
}

#[async_trait::async_trait]
impl ListWatch<KubeObject> for KubeListWatch {
    async fn list(&self) -> Result<Snapshot<KubeObject>, ListWatchError> {
        let list = self.api.list(&ListParams::default()).await.map_err(classify)?;
        let version = list.metadata.resource_version.unwrap_or_default();
        let items: Vec<KubeObject> = list.items.into_iter().map(KubeObject::from).collect();
        counter!("reflex_kube_list_total", 1);
        debug!(items = items.len(), version = %version, "kube list");
        Ok(Snapshot { items, version })
    }

    async fn watch(&self, after: &str) -> Result<EventStream<KubeObject>, ListWatchError> {
        let wp = WatchParams::default().timeout(self.watch_timeout_secs);
        let stream = self.api.watch(&wp, after).await.map_err(classify)?;
        debug!(version = %after, timeout = self.watch_timeout_secs, "kube watch opened");
        Ok(stream.filter_map(|item| futures::future::ready(translate(item))).boxed())
    }
}

const DEFAULT_WATCH_TIMEOUT_SECS: u32 = 290;
/// The API server rejects watch timeouts of 295s and above.
const MAX_WATCH_TIMEOUT_SECS: u32 = 294;

/// Server-side watch timeout from `REFLEX_WATCH_TIMEOUT_SECS`, clamped to what
/// the API server accepts.
fn watch_timeout_secs(raw: Option<&str>) -> u32 {
    let Some(raw) = raw else { return DEFAULT_WATCH_TIMEOUT_SECS };
    match raw.trim().parse::<u32>() {
        Ok(secs) if secs > MAX_WATCH_TIMEOUT_SECS => {
            warn!(requested = secs, max = MAX_WATCH_TIMEOUT_SECS, "REFLEX_WATCH_TIMEOUT_SECS too large; clamping");
            MAX_WATCH_TIMEOUT_SECS
        }
        Ok(secs) => secs,
        Err(_) => {
            warn!(value = %raw, default = DEFAULT_WATCH_TIMEOUT_SECS, "invalid REFLEX_WATCH_TIMEOUT_SECS; using default");
            DEFAULT_WATCH_TIMEOUT_SECS
        }
    }
}

/// Resolve `gvk_key` through discovery and build a list/watch source for it.
/// Returns the source and the kind its events are expected to carry.
pub async fn connect(gvk_key: &str, namespace: Option<&str>) -> Result<(KubeListWatch, String)> {
    let client = Client::try_default().await?;
    let gvk = parse_gvk_key(gvk_key)?;
    let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;

    let api: Api<DynamicObject> = if namespaced {
        match namespace {
            Some(ns) => Api::namespaced_with(client.clone(), ns, &ar),
            None => Api::all_with(client.clone(), &ar),
        }
    } else {
        Api::all_with(client.clone(), &ar)
    };

    let timeout = watch_timeout_secs(std::env::var("REFLEX_WATCH_TIMEOUT_SECS").ok().as_deref());
    info!(gvk = %gvk_key, ns = ?namespace, timeout, "kube source ready");
    Ok((KubeListWatch::new(api, timeout), ar.kind))
}
