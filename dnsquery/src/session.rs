use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use async_std::prelude::FutureExt;
use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::{RData, RecordType};
use once_cell::sync::Lazy;
use rand::Rng;
use tracing::{debug, instrument, trace_span};
use tracing_futures::Instrument;

use crate::abort::{wait_aborted, AbortSignal};
use crate::codec::{encode, DnsQuery};
use crate::config::SessionConfig;
use crate::doh::{request_doh, HttpResponse};
use crate::endpoint::{Endpoint, Transport};
use crate::error::{Error, QueryError, Result};
use crate::loader::{self, EndpointSpec};
use crate::registry::{Registry, Snapshot};
use crate::udp::request_udp;

static GLOBAL_SESSION: Lazy<Session> = Lazy::new(|| Session::new(SessionConfig::default()));

/// Per call overrides. Unset fields fall back to the session configuration.
#[derive(Clone, Debug, Default)]
pub struct QueryOptions {
    pub retries: Option<i32>,
    pub timeout: Option<Duration>,
    pub endpoints: Option<EndpointSpec>,
    pub signal: Option<AbortSignal>,
}

impl QueryOptions {
    pub fn with_retries(mut self, retries: i32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_endpoints(mut self, endpoints: impl Into<EndpointSpec>) -> Self {
        self.endpoints = Some(endpoints.into());
        self
    }

    pub fn with_signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }
}

/// A decoded answer together with the endpoint that produced it.
#[derive(Debug)]
pub struct Response {
    pub message: Message,
    pub endpoint: Arc<Endpoint>,
    /// Response head, for DoH endpoints.
    pub response: Option<HttpResponse>,
}

impl Deref for Response {
    type Target = Message;

    fn deref(&self) -> &Message {
        &self.message
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxtEntry {
    pub data: String,
    pub ttl: u32,
}

#[derive(Clone, Debug)]
pub struct TxtLookup {
    pub entries: Vec<TxtEntry>,
    pub endpoint: Arc<Endpoint>,
}

/// Entry point for queries: owns the configuration and the registry cache.
#[derive(Clone, Debug)]
pub struct Session {
    config: SessionConfig,
    registry: Registry,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        let registry = Registry::new(&config);
        Session { config, registry }
    }

    pub fn with_registry(config: SessionConfig, registry: Registry) -> Self {
        Session { config, registry }
    }

    /// Process wide session with the default configuration.
    pub fn global() -> &'static Session {
        &GLOBAL_SESSION
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub async fn wellknown(&self) -> Arc<Snapshot> {
        self.registry.wellknown().await
    }

    /// Refreshes the registry even when the cached snapshot is still fresh.
    pub async fn refresh(&self) -> Arc<Snapshot> {
        self.registry.fetch(true).await
    }

    pub async fn endpoints(&self) -> Vec<Arc<Endpoint>> {
        self.registry.endpoints().await
    }

    pub async fn load_endpoints(&self, spec: &EndpointSpec) -> Result<Vec<Arc<Endpoint>>, Error> {
        loader::load_endpoints(&self.registry, spec).await
    }

    /// Runs `query` against a randomly chosen endpoint, retrying with a fresh
    /// pick after every retryable failure.
    #[instrument(skip_all, fields(retries = ?options.retries))]
    pub async fn query(&self, query: &DnsQuery, options: QueryOptions) -> Result<Response> {
        let mut retries = options.retries.unwrap_or(self.config.retries);
        if retries < -1 {
            return Err(Error::invalid_input(format!(
                "retries must be -1 or more, got {retries}"
            ))
            .into());
        }
        let timeout = options.timeout.unwrap_or(self.config.timeout);
        let spec = options.endpoints.unwrap_or_default();
        let signal = options.signal.as_ref();
        loop {
            let err = match self.attempt(query, &spec, timeout, signal).await {
                Ok(response) => return Ok(response),
                Err(e) => e,
            };
            if err.is_abort() || !err.is_retryable() || retries == 0 {
                return Err(err);
            }
            if retries > 0 {
                retries -= 1;
            }
            debug!(retries, "query failed, retry: {}", err);
        }
    }

    async fn attempt(
        &self,
        query: &DnsQuery,
        spec: &EndpointSpec,
        timeout: Duration,
        signal: Option<&AbortSignal>,
    ) -> Result<Response> {
        if signal.map_or(false, AbortSignal::is_aborted) {
            return Err(Error::Abort.into());
        }
        // the shared registry refresh keeps running for other callers
        let endpoints = self
            .load_endpoints(spec)
            .race(async {
                wait_aborted(signal).await;
                Err(Error::Abort)
            })
            .await?;
        let endpoint = pick(&endpoints)
            .ok_or_else(|| Error::invalid_input("No endpoints defined to lookup dns records."))?;
        self.query_one(query, &endpoint, timeout, signal)
            .instrument(trace_span!("query_one", endpoint = %endpoint))
            .await
    }

    async fn query_one(
        &self,
        query: &DnsQuery,
        endpoint: &Arc<Endpoint>,
        timeout: Duration,
        signal: Option<&AbortSignal>,
    ) -> Result<Response> {
        let annotate = |e: Error| QueryError::from(e).with_endpoint(endpoint);
        if signal.map_or(false, AbortSignal::is_aborted) {
            return Err(annotate(Error::Abort));
        }
        match endpoint.transport() {
            Transport::Doh { .. } => {
                let bytes = encode(&query.to_message(0)).map_err(|e| annotate(Error::Codec(e)))?;
                let reply = request_doh(endpoint, &bytes, timeout, signal).await?;
                Ok(Response {
                    message: reply.message,
                    endpoint: endpoint.clone(),
                    response: Some(reply.response),
                })
            }
            Transport::Udp { .. } => {
                let bytes = encode(&query.to_message(rand::random()))
                    .map_err(|e| annotate(Error::Codec(e)))?;
                let message = request_udp(endpoint, &bytes, timeout, signal).await?;
                Ok(Response {
                    message,
                    endpoint: endpoint.clone(),
                    response: None,
                })
            }
        }
    }

    /// Looks up the TXT records of `domain`. Fails unless the resolver answers
    /// with NOERROR.
    pub async fn lookup_txt(&self, domain: &str, options: QueryOptions) -> Result<TxtLookup> {
        let query = DnsQuery::new(domain, RecordType::TXT)?;
        let response = self.query(&query, options).await?;
        let code = response.response_code();
        if code != ResponseCode::NoError {
            return Err(QueryError::from(Error::response(format!(
                "{domain}: response code {code}"
            )))
            .with_endpoint(&response.endpoint)
            .with_response(response.response.clone()));
        }
        let entries = response
            .answers()
            .iter()
            .filter_map(|record| match record.data() {
                Some(RData::TXT(txt)) => Some(TxtEntry {
                    data: txt.iter().map(|s| String::from_utf8_lossy(s)).collect(),
                    ttl: record.ttl(),
                }),
                _ => None,
            })
            .collect();
        Ok(TxtLookup {
            entries,
            endpoint: response.endpoint,
        })
    }
}

/// Uniform random choice; a single candidate is returned as is.
fn pick(endpoints: &[Arc<Endpoint>]) -> Option<Arc<Endpoint>> {
    match endpoints.len() {
        0 => None,
        1 => endpoints.first().cloned(),
        n => endpoints.get(rand::rng().random_range(0..n)).cloned(),
    }
}
