//! Turns an [`EndpointSpec`] into concrete endpoints.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use tracing::{instrument, trace};

use crate::endpoint::{Endpoint, EndpointDescriptor};
use crate::error::Error;
use crate::registry::Registry;

pub type EndpointFilter = Arc<dyn Fn(&Endpoint) -> bool + Send + Sync>;

/// Which endpoints a query may use.
#[derive(Clone, Default)]
pub enum EndpointSpec {
    /// Every endpoint of the registry, native ones included.
    #[default]
    All,
    /// Registry endpoints speaking DoH.
    Doh,
    /// Registry endpoints speaking plain UDP DNS.
    Dns,
    /// Any other bare word. Always rejected.
    Tag(String),
    Filter(EndpointFilter),
    List(Vec<EndpointEntry>),
    /// Resolved first, then handled like any other spec.
    Pending(Shared<BoxFuture<'static, EndpointSpec>>),
}

impl EndpointSpec {
    pub fn filter(predicate: impl Fn(&Endpoint) -> bool + Send + Sync + 'static) -> Self {
        EndpointSpec::Filter(Arc::new(predicate))
    }

    pub fn pending(spec: impl Future<Output = EndpointSpec> + Send + 'static) -> Self {
        EndpointSpec::Pending(spec.boxed().shared())
    }

    pub fn names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        EndpointSpec::List(
            names
                .into_iter()
                .map(|name| EndpointEntry::Name(name.into()))
                .collect(),
        )
    }
}

impl fmt::Debug for EndpointSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointSpec::All => f.write_str("All"),
            EndpointSpec::Doh => f.write_str("Doh"),
            EndpointSpec::Dns => f.write_str("Dns"),
            EndpointSpec::Tag(tag) => f.debug_tuple("Tag").field(tag).finish(),
            EndpointSpec::Filter(_) => f.write_str("Filter(..)"),
            EndpointSpec::List(entries) => f.debug_tuple("List").field(entries).finish(),
            EndpointSpec::Pending(_) => f.write_str("Pending(..)"),
        }
    }
}

impl From<&str> for EndpointSpec {
    fn from(s: &str) -> Self {
        match s {
            "doh" => EndpointSpec::Doh,
            "dns" => EndpointSpec::Dns,
            other => EndpointSpec::Tag(other.to_string()),
        }
    }
}

impl From<String> for EndpointSpec {
    fn from(s: String) -> Self {
        EndpointSpec::from(s.as_str())
    }
}

impl From<Vec<EndpointEntry>> for EndpointSpec {
    fn from(entries: Vec<EndpointEntry>) -> Self {
        EndpointSpec::List(entries)
    }
}

impl FromIterator<EndpointEntry> for EndpointSpec {
    fn from_iter<T: IntoIterator<Item = EndpointEntry>>(iter: T) -> Self {
        EndpointSpec::List(iter.into_iter().collect())
    }
}

/// One element of an explicit endpoint list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EndpointEntry {
    /// A registry name, or an endpoint string when no resolver has that name.
    Name(String),
    Endpoint(Arc<Endpoint>),
    Descriptor(EndpointDescriptor),
}

impl From<&str> for EndpointEntry {
    fn from(s: &str) -> Self {
        EndpointEntry::Name(s.to_string())
    }
}

impl From<String> for EndpointEntry {
    fn from(s: String) -> Self {
        EndpointEntry::Name(s)
    }
}

impl From<Endpoint> for EndpointEntry {
    fn from(endpoint: Endpoint) -> Self {
        EndpointEntry::Endpoint(Arc::new(endpoint))
    }
}

impl From<Arc<Endpoint>> for EndpointEntry {
    fn from(endpoint: Arc<Endpoint>) -> Self {
        EndpointEntry::Endpoint(endpoint)
    }
}

impl From<EndpointDescriptor> for EndpointEntry {
    fn from(descriptor: EndpointDescriptor) -> Self {
        EndpointEntry::Descriptor(descriptor)
    }
}

#[instrument(skip(registry))]
pub async fn load_endpoints(
    registry: &Registry,
    spec: &EndpointSpec,
) -> Result<Vec<Arc<Endpoint>>, Error> {
    let mut spec = spec.clone();
    loop {
        let predicate: EndpointFilter = match spec {
            EndpointSpec::Pending(pending) => {
                spec = pending.await;
                trace!(?spec, "pending endpoint spec resolved");
                continue;
            }
            EndpointSpec::All => return Ok(registry.endpoints().await),
            EndpointSpec::Doh => Arc::new(|e: &Endpoint| e.protocol().is_doh()),
            EndpointSpec::Dns => Arc::new(|e: &Endpoint| e.protocol().is_udp()),
            EndpointSpec::Filter(predicate) => predicate,
            EndpointSpec::Tag(_) => {
                return Err(Error::invalid_input("Endpoints needs to be iterable"))
            }
            EndpointSpec::List(entries) => return load_list(registry, entries).await,
        };
        let snapshot = registry.wellknown().await;
        return Ok(snapshot
            .endpoints()
            .iter()
            .filter(|e| predicate(e))
            .cloned()
            .collect());
    }
}

async fn load_list(
    registry: &Registry,
    entries: Vec<EndpointEntry>,
) -> Result<Vec<Arc<Endpoint>>, Error> {
    let entries: Vec<EndpointEntry> = entries
        .into_iter()
        .filter(|entry| !matches!(entry, EndpointEntry::Name(name) if name.trim().is_empty()))
        .collect();
    let needs_registry = entries
        .iter()
        .any(|entry| matches!(entry, EndpointEntry::Name(_)));
    let snapshot = if needs_registry {
        Some(registry.wellknown().await)
    } else {
        None
    };
    entries
        .into_iter()
        .map(|entry| match entry {
            EndpointEntry::Endpoint(endpoint) => Ok(endpoint),
            EndpointEntry::Descriptor(descriptor) => {
                Endpoint::from_descriptor(&descriptor).map(Arc::new)
            }
            EndpointEntry::Name(name) => {
                let name = name.trim();
                if let Some(endpoint) = snapshot.as_ref().and_then(|s| s.endpoint(name)) {
                    return Ok(endpoint.clone());
                }
                name.parse::<Endpoint>().map(Arc::new).map_err(|e| {
                    Error::invalid_input(format!(
                        "{name} is neither a known resolver nor a valid endpoint: {e}"
                    ))
                })
            }
        })
        .collect()
}
