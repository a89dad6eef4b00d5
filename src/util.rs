//! Small helpers shared across the resolver chain: reply construction,
//! record synthesis and log-friendly formatting of DNS messages.

use hickory_proto::op::{Message, MessageType, Query};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{Name, RData, Record};
use std::fmt::Write as _;
use std::net::IpAddr;

/// Creates an empty reply message for the passed query: same id, same
/// questions, response flags set.
pub fn new_reply(request: &Message) -> Message {
    let mut response = Message::new();
    response
        .set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(request.op_code())
        .set_recursion_desired(request.recursion_desired())
        .set_recursion_available(true);
    for query in request.queries() {
        response.add_query(query.clone());
    }
    response
}

/// Creates an address record answering `name` with `ip`. The record type
/// follows the address family.
pub fn create_answer(name: Name, ip: IpAddr, ttl: u32) -> Record {
    match ip {
        IpAddr::V4(ipv4) => Record::from_rdata(name, ttl, RData::A(A(ipv4))),
        IpAddr::V6(ipv6) => Record::from_rdata(name, ttl, RData::AAAA(AAAA(ipv6))),
    }
}

/// Returns the lowercased domain string of a name, without the trailing dot.
pub fn extract_domain(name: &Name) -> String {
    let mut domain = name.to_string();
    if domain.ends_with('.') {
        domain.pop();
    }
    domain.make_ascii_lowercase();
    domain
}

/// Creates a user-friendly representation of an answer section.
pub fn answer_to_string(answer: &[Record]) -> String {
    let formatted: Vec<String> = answer
        .iter()
        .map(|record| match record.data() {
            RData::A(ip) => format!("A ({ip})"),
            RData::AAAA(ip) => format!("AAAA ({ip})"),
            RData::CNAME(target) => format!("CNAME ({})", target.0),
            RData::PTR(ptr) => format!("PTR ({})", ptr.0),
            other => format!("{other}"),
        })
        .collect();

    formatted.join(", ")
}

/// Creates a user-friendly representation of a question section.
pub fn question_to_string(questions: &[Query]) -> String {
    let formatted: Vec<String> = questions
        .iter()
        .map(|q| format!("{} ({})", q.query_type(), q.name()))
        .collect();

    formatted.join(", ")
}

/// Renders raw identity bytes as a colon-separated hex hardware address,
/// e.g. `[0x48, 0x52, 0x4a]` becomes `48:52:4a`.
pub fn format_mac(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, byte) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(':');
        }
        let _ = write!(out, "{byte:02x}");
    }
    out
}
