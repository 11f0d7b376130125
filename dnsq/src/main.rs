mod logger;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_std::task::block_on;
use clap::Parser;
use dnsquery::config::parse_duration;
use dnsquery::{
    AbortController, DnsQuery, EndpointEntry, EndpointSpec, QueryOptions, Response, Session,
    SessionConfig,
};
use hickory_proto::rr::RecordType;
use serde_json::json;
use tracing::{error, info};

use crate::logger::setup_logger;

/// Look up DNS records through DoH and UDP resolvers.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Domain names to look up.
    #[arg(required_unless_present_any = ["list_endpoints", "list_resolvers"])]
    names: Vec<String>,

    /// Record type, e.g. A, AAAA, TXT or MX.
    #[arg(short = 't', long = "type", default_value = "A")]
    record_type: String,

    /// Resolver name or endpoint string, e.g. `google` or `udp://1.1.1.1`. Repeatable.
    #[arg(short, long = "endpoint", value_name = "ENDPOINT")]
    endpoints: Vec<String>,

    /// Only use DoH endpoints of the registry.
    #[arg(long, conflicts_with_all = ["dns", "endpoints"])]
    doh: bool,

    /// Only use UDP endpoints of the registry.
    #[arg(long, conflicts_with = "endpoints")]
    dns: bool,

    /// Extra attempts after a failure, -1 for unlimited.
    #[arg(short, long, allow_negative_numbers = true)]
    retries: Option<i32>,

    /// Inactivity timeout per attempt, e.g. 5s or 800ms.
    #[arg(long, value_parser = parse_duration)]
    timeout: Option<Duration>,

    /// How long a downloaded registry stays fresh.
    #[arg(long, value_parser = parse_duration)]
    max_age: Option<Duration>,

    /// Use the bundled resolver list instead of downloading the registry.
    #[arg(long)]
    no_update: bool,

    #[arg(long, value_name = "URL")]
    update_url: Option<String>,

    /// Keep the downloaded registry on disk.
    #[arg(long)]
    persist: bool,

    /// YAML session configuration.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Print the endpoints selected by the endpoint options and exit.
    #[arg(long)]
    list_endpoints: bool,

    /// Print the resolvers of the registry and exit.
    #[arg(long)]
    list_resolvers: bool,

    /// Print results as JSON.
    #[arg(long)]
    json: bool,

    /// Log file.
    #[arg(short, long, value_name = "PATH")]
    log: Option<PathBuf>,

    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn session_config(&self) -> Result<SessionConfig> {
        let mut config = match &self.config {
            Some(path) => SessionConfig::from_config_file(path)
                .with_context(|| format!("load config {}", path.display()))?,
            None => SessionConfig::default(),
        };
        if let Some(retries) = self.retries {
            config.retries = retries;
        }
        if let Some(timeout) = self.timeout {
            config.timeout = timeout;
        }
        if let Some(max_age) = self.max_age {
            config.max_age = max_age;
        }
        if self.no_update {
            config.update = false;
        }
        if let Some(url) = &self.update_url {
            config.update_url = url.clone();
        }
        if self.persist {
            config.persist = true;
        }
        config.validate()?;
        Ok(config)
    }

    fn endpoint_spec(&self) -> EndpointSpec {
        if self.doh {
            EndpointSpec::Doh
        } else if self.dns {
            EndpointSpec::Dns
        } else if !self.endpoints.is_empty() {
            self.endpoints
                .iter()
                .map(|e| EndpointEntry::Name(e.clone()))
                .collect()
        } else {
            EndpointSpec::All
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    setup_logger(args.log.as_deref(), args.verbose)?;

    let config = args.session_config()?;
    info!(?config, "start dnsq");
    let session = Session::new(config);

    let controller = AbortController::new();
    let handler = controller.clone();
    ctrlc::set_handler(move || handler.abort()).context("install ctrl-c handler")?;

    block_on(run(&args, &session, &controller))
}

async fn run(args: &Args, session: &Session, controller: &AbortController) -> Result<()> {
    if args.list_resolvers {
        let snapshot = session.wellknown().await;
        if args.json {
            println!("{}", serde_json::to_string_pretty(snapshot.resolvers())?);
        } else {
            for resolver in snapshot.resolvers() {
                let endpoint = snapshot
                    .endpoint(&resolver.name)
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "<invalid endpoint>".to_string());
                println!(
                    "{:<20} {:<4} {}",
                    resolver.name,
                    resolver.country.as_deref().unwrap_or("-"),
                    endpoint
                );
            }
        }
        return Ok(());
    }

    if args.list_endpoints {
        let endpoints = session.load_endpoints(&args.endpoint_spec()).await?;
        for endpoint in endpoints {
            match endpoint.name() {
                Some(name) => println!("{endpoint} ({name})"),
                None => println!("{endpoint}"),
            }
        }
        return Ok(());
    }

    let record_type: RecordType = args
        .record_type
        .to_ascii_uppercase()
        .parse()
        .with_context(|| format!("unknown record type {}", args.record_type))?;

    let mut failures = 0;
    for name in &args.names {
        let query = DnsQuery::new(name, record_type)?;
        let options = QueryOptions {
            retries: args.retries,
            timeout: args.timeout,
            endpoints: Some(args.endpoint_spec()),
            signal: Some(controller.signal()),
        };
        match session.query(&query, options).await {
            Ok(response) => print_response(name, record_type, &response, args.json)?,
            Err(e) if e.is_abort() => return Err(e.into()),
            Err(e) => {
                error!(name = %name, "query failed: {}", e);
                eprintln!("{name}: {e}");
                failures += 1;
            }
        }
    }
    if failures > 0 {
        bail!("{failures} of {} lookups failed", args.names.len());
    }
    Ok(())
}

fn print_response(
    name: &str,
    record_type: RecordType,
    response: &Response,
    as_json: bool,
) -> Result<()> {
    if as_json {
        let answers: Vec<_> = response
            .answers()
            .iter()
            .map(|record| {
                json!({
                    "name": record.name().to_string(),
                    "type": record.record_type().to_string(),
                    "ttl": record.ttl(),
                    "data": record.data().map(|data| data.to_string()),
                })
            })
            .collect();
        let output = json!({
            "question": name,
            "type": record_type.to_string(),
            "endpoint": response.endpoint.to_string(),
            "resolver": response.endpoint.name(),
            "rcode": response.response_code().to_string(),
            "answers": answers,
        });
        println!("{}", serde_json::to_string(&output)?);
        return Ok(());
    }

    match response.endpoint.name() {
        Some(resolver) => println!(
            ";; {name} {record_type} via {} ({resolver}): {}",
            response.endpoint,
            response.response_code()
        ),
        None => println!(
            ";; {name} {record_type} via {}: {}",
            response.endpoint,
            response.response_code()
        ),
    }
    for record in response.answers() {
        println!("{record}");
    }
    Ok(())
}
