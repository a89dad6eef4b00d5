//! The resolver chain.
//!
//! A request travels through a linear chain of stages: CNAME rewrite,
//! blocking, upstream forwarding. Every stage implements [`Resolver`] and
//! either answers the request itself (the chain short-circuits upward) or
//! delegates to its owned successor, optionally post-processing the
//! downstream answer. Terminal stages have no successor.
//!
//! Stages never mutate the inbound query message, and errors from a
//! successor propagate unchanged.

pub mod blocking;
pub mod cname;
pub mod upstream;

pub use blocking::{BlockingResolver, BlockingStatus};
pub use cname::CnameResolver;
pub use upstream::UpstreamResolver;

use crate::util;
use anyhow::Result;
use async_trait::async_trait;
use hickory_proto::op::Message;
use hickory_proto::rr::rdata::opt::{EdnsCode, EdnsOption};
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::time::Instant;
use tracing::{info_span, Span};

/// EDNS0 option code carrying out-of-band client identity bytes
/// (start of the EDNS local/experimental code range).
pub const EDNS0_LOCAL: u16 = 0xFDE9;

/// Immutable per-query record handed through the chain.
pub struct Request {
    /// The original DNS query message.
    pub message: Message,
    /// Address the query came from.
    pub client_ip: IpAddr,
    /// Client names resolved out-of-band (reverse lookup), possibly empty.
    pub client_names: Vec<String>,
    /// Receive timestamp.
    pub received: Instant,
    /// Logger context; stages derive per-stage child spans from it.
    pub log: Span,
}

impl Request {
    pub fn new(message: Message, client_ip: IpAddr) -> Self {
        let log = info_span!(
            "request",
            client = %client_ip,
            question = %util::question_to_string(message.queries()),
        );
        Self {
            message,
            client_ip,
            client_names: Vec::new(),
            received: Instant::now(),
            log,
        }
    }
}

/// Classification of a response for logs and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseType {
    Resolved,
    Blocked,
    CustomDns,
    Cached,
}

impl fmt::Display for ResponseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseType::Resolved => f.write_str("RESOLVED"),
            ResponseType::Blocked => f.write_str("BLOCKED"),
            ResponseType::CustomDns => f.write_str("CUSTOMDNS"),
            ResponseType::Cached => f.write_str("CACHED"),
        }
    }
}

/// A DNS answer plus its classification and a free-form reason string.
#[derive(Debug)]
pub struct Response {
    pub message: Message,
    pub rtype: ResponseType,
    pub reason: String,
}

/// One stage of the resolver chain.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, request: &Request) -> Result<Response>;

    /// Returns the current configuration as printable lines.
    fn configuration(&self) -> Vec<String>;

    /// The successor stage; `None` for terminal stages.
    fn next(&self) -> Option<&dyn Resolver> {
        None
    }

    fn name(&self) -> &'static str;
}

/// Collects the configuration of every stage, walking the chain forward.
pub fn chain_configuration(root: &dyn Resolver) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = Some(root);
    while let Some(stage) = current {
        lines.push(format!("{}:", stage.name()));
        lines.extend(stage.configuration().into_iter().map(|line| format!("  {line}")));
        current = stage.next();
    }
    lines
}

/// Derives the per-stage logger context from the request's span.
pub(crate) fn with_prefix(parent: &Span, prefix: &'static str) -> Span {
    info_span!(parent: parent, "resolve", resolver = prefix)
}

/// Extracts the client MAC carried in the query's EDNS0_LOCAL option, as a
/// colon-separated hex string.
pub(crate) fn mac_from_edns0(message: &Message) -> Option<String> {
    let edns = message.extensions().as_ref()?;
    match edns.option(EdnsCode::Unknown(EDNS0_LOCAL)) {
        Some(EdnsOption::Unknown(_, bytes)) if !bytes.is_empty() => Some(util::format_mac(bytes)),
        _ => None,
    }
}

/// Appends the categories bound to the request's EDNS0-derived identity.
pub(crate) fn groups_from_identity(
    request: &Request,
    client_groups: &HashMap<String, Vec<String>>,
) -> Vec<String> {
    let mut groups = Vec::new();
    if let Some(mac) = mac_from_edns0(&request.message) {
        if let Some(bound) = client_groups.get(&mac) {
            groups.extend(bound.iter().cloned());
        }
    }
    groups
}
