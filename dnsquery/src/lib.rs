//! DNS client reaching resolvers over DNS-over-HTTPS and plain UDP.
//!
//! Candidate resolvers come from a remote registry, cached for `max_age` and
//! backed by a bundled list plus the resolvers configured on the host. A
//! [`Session`] picks one of them per attempt and retries on failure.
//!
//! ```no_run
//! use dnsquery::{DnsQuery, QueryOptions};
//! use hickory_proto::rr::RecordType;
//!
//! # async_std::task::block_on(async {
//! let query = DnsQuery::new("example.com", RecordType::A)?;
//! let response = dnsquery::query(&query, QueryOptions::default().with_endpoints("doh")).await?;
//! println!("{} answered {:?}", response.endpoint, response.answers());
//! # Ok::<_, Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod abort;
pub mod codec;
pub mod config;
pub mod doh;
pub mod endpoint;
pub mod error;
pub mod loader;
pub mod native;
pub mod registry;
pub mod session;
pub mod udp;

use std::sync::Arc;

pub use abort::{AbortController, AbortSignal};
pub use codec::DnsQuery;
pub use config::SessionConfig;
pub use doh::HttpResponse;
pub use endpoint::{Endpoint, EndpointDescriptor, Method, Protocol};
pub use error::{Error, QueryError, Result};
pub use loader::{EndpointEntry, EndpointSpec};
pub use registry::{Registry, Resolver, Snapshot};
pub use session::{QueryOptions, Response, Session, TxtEntry, TxtLookup};

pub async fn query(query: &DnsQuery, options: QueryOptions) -> Result<Response> {
    Session::global().query(query, options).await
}

pub async fn endpoints() -> Vec<Arc<Endpoint>> {
    Session::global().endpoints().await
}

pub async fn wellknown() -> Arc<Snapshot> {
    Session::global().wellknown().await
}

pub async fn load_endpoints(spec: &EndpointSpec) -> Result<Vec<Arc<Endpoint>>, Error> {
    Session::global().load_endpoints(spec).await
}

pub async fn lookup_txt(domain: &str, options: QueryOptions) -> Result<TxtLookup> {
    Session::global().lookup_txt(domain, options).await
}
