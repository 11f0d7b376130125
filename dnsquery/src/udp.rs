use std::sync::Arc;
use std::time::Duration;

use async_std::future;
use async_std::net::UdpSocket;
use async_std::prelude::FutureExt;
use hickory_proto::op::Message;
use tracing::{debug, trace};

use crate::abort::{wait_aborted, AbortSignal};
use crate::codec::decode_response;
use crate::endpoint::{Endpoint, Protocol, Transport};
use crate::error::{Error, QueryError, Result};

const MAX_DATAGRAM_SIZE: usize = 65_535;

/// Sends `query` in one datagram and waits for the reply carrying the same id.
///
/// Datagrams with a different id are dropped. The timeout re-arms after every
/// dropped datagram, like it does per chunk for DoH.
pub async fn request_udp(
    endpoint: &Arc<Endpoint>,
    query: &[u8],
    timeout: Duration,
    signal: Option<&AbortSignal>,
) -> Result<Message> {
    let annotate = |e: Error| QueryError::from(e).with_endpoint(endpoint);
    if signal.map_or(false, AbortSignal::is_aborted) {
        return Err(annotate(Error::Abort));
    }
    let Transport::Udp { host, port } = endpoint.transport() else {
        return Err(annotate(Error::invalid_input(format!(
            "{endpoint} is not a udp endpoint"
        ))));
    };
    if query.len() < 2 {
        return Err(annotate(Error::invalid_input("query is too short")));
    }

    exchange(endpoint, host, *port, query, timeout)
        .race(async {
            wait_aborted(signal).await;
            Err(Error::Abort)
        })
        .await
        .map_err(annotate)
}

async fn exchange(
    endpoint: &Endpoint,
    host: &str,
    port: u16,
    query: &[u8],
    timeout: Duration,
) -> Result<Message, Error> {
    let bind_addr = match endpoint.protocol() {
        Protocol::Udp6 => "[::]:0",
        _ => "0.0.0.0:0",
    };
    let socket = UdpSocket::bind(bind_addr).await?;
    socket.connect((host, port)).await?;
    debug!(endpoint = %endpoint, size = query.len(), "send udp query");
    socket.send(query).await?;

    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let size = match future::timeout(timeout, socket.recv(&mut buf)).await {
            Ok(received) => received?,
            Err(_) => return Err(Error::Timeout(timeout)),
        };
        if size >= 2 && buf[..2] == query[..2] {
            return decode_response(&buf[..size]);
        }
        trace!(size, "drop udp datagram with unexpected id");
    }
}
