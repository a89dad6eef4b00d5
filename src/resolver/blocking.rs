//! Chain stage checking each request's question (and the downstream answer)
//! against per-category blacklists and whitelists.
//!
//! The set of categories to check is computed per request from the client's
//! EDNS0-carried identity, the administrator's global switches, client-name
//! and client-IP mappings and the `default` entry. Blocking can be disabled
//! at runtime, optionally with an automatic re-enable timer.

use crate::config::BlockingConfig;
use crate::lists::{ListCache, ListKind, Matcher};
use crate::metrics::Metrics;
use crate::resolver::{groups_from_identity, with_prefix, Request, Resolver, Response, ResponseType};
use crate::util;
use anyhow::{bail, Result};
use async_trait::async_trait;
use hickory_proto::op::{Message, Query, ResponseCode};
use hickory_proto::rr::{RData, RecordType};
use std::collections::{BTreeMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, Instrument};

/// TTL of synthesized block answers.
const BLOCK_TTL: u32 = 6 * 60 * 60;

/// How a block is materialized in the DNS answer.
#[derive(Debug, Clone, PartialEq, Eq)]
enum BlockHandler {
    ZeroIp,
    NxDomain,
    IpList(Vec<IpAddr>),
}

impl BlockHandler {
    fn from_config(block_type: &str) -> Result<Self> {
        let value = block_type.trim().to_uppercase();
        if value.is_empty() || value == "ZEROIP" {
            return Ok(BlockHandler::ZeroIp);
        }
        if value == "NXDOMAIN" {
            return Ok(BlockHandler::NxDomain);
        }

        let ips: Vec<IpAddr> = value
            .split(',')
            .filter_map(|part| part.trim().parse().ok())
            .collect();
        if !ips.is_empty() {
            return Ok(BlockHandler::IpList(ips));
        }

        bail!("unknown block_type '{block_type}', please use one of: ZeroIP, NxDomain or specify destination IP address(es)");
    }

    fn handle_block(&self, question: &Query, response: &mut Message) {
        match self {
            BlockHandler::ZeroIp => {
                let zero: IpAddr = if question.query_type() == RecordType::AAAA {
                    Ipv6Addr::UNSPECIFIED.into()
                } else {
                    Ipv4Addr::UNSPECIFIED.into()
                };
                response.add_answer(util::create_answer(question.name().clone(), zero, BLOCK_TTL));
            }
            BlockHandler::NxDomain => {
                response.set_response_code(ResponseCode::NXDomain);
            }
            BlockHandler::IpList(destinations) => {
                let qtype = question.query_type();
                for ip in destinations {
                    let family_matches = (qtype == RecordType::AAAA && ip.is_ipv6())
                        || (qtype == RecordType::A && ip.is_ipv4());
                    if family_matches {
                        response.add_answer(util::create_answer(
                            question.name().clone(),
                            *ip,
                            BLOCK_TTL,
                        ));
                    }
                }
                if response.answers().is_empty() {
                    BlockHandler::ZeroIp.handle_block(question, response);
                }
            }
        }
    }
}

struct StatusInner {
    enabled: bool,
    disable_end: Option<Instant>,
    enable_timer: Option<JoinHandle<()>>,
}

/// Runtime blocking switch, shared between the resolver and the control API.
///
/// `disable` with a non-zero duration arms a one-shot timer that re-enables
/// blocking; `enable` cancels any pending timer.
#[derive(Clone)]
pub struct BlockingStatus {
    inner: Arc<Mutex<StatusInner>>,
    gauge: Option<prometheus::IntGauge>,
}

impl BlockingStatus {
    fn new(metrics: &Metrics) -> Self {
        let gauge = metrics.register_gauge("warden_blocking_enabled", "Blocking status");
        if let Some(gauge) = &gauge {
            gauge.set(1);
        }
        Self {
            inner: Arc::new(Mutex::new(StatusInner {
                enabled: true,
                disable_end: None,
                enable_timer: None,
            })),
            gauge,
        }
    }

    pub fn enable(&self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(timer) = inner.enable_timer.take() {
            timer.abort();
        }
        inner.enabled = true;
        inner.disable_end = None;
        if let Some(gauge) = &self.gauge {
            gauge.set(1);
        }
    }

    pub fn disable(&self, duration: Duration) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(timer) = inner.enable_timer.take() {
            timer.abort();
        }
        inner.enabled = false;
        if let Some(gauge) = &self.gauge {
            gauge.set(0);
        }

        if duration.is_zero() {
            inner.disable_end = None;
            info!("disable blocking");
        } else {
            inner.disable_end = Some(Instant::now() + duration);
            info!("disable blocking for {duration:?}");
            let status = self.clone();
            inner.enable_timer = Some(tokio::spawn(async move {
                tokio::time::sleep(duration).await;
                status.enable();
                info!("blocking enabled again");
            }));
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.lock().unwrap().enabled
    }

    /// Returns `(enabled, seconds until automatic re-enable)`; the second
    /// field is zero unless a re-enable timer is pending.
    pub fn current(&self) -> (bool, u64) {
        let inner = self.inner.lock().unwrap();
        let auto_enable_in = match inner.disable_end {
            Some(end) if !inner.enabled && end > Instant::now() => {
                (end - Instant::now()).as_secs()
            }
            _ => 0,
        };
        (inner.enabled, auto_enable_in)
    }
}

enum Precheck {
    Blocked(Response),
    Delegate { post_scan: bool },
}

/// Checks the request's question (and the downstream answer) against black
/// and white lists.
pub struct BlockingResolver {
    cfg: BlockingConfig,
    block_handler: BlockHandler,
    blacklist_matcher: Arc<ListCache>,
    whitelist_matcher: Arc<ListCache>,
    whitelist_only_groups: Vec<String>,
    status: BlockingStatus,
    next: Box<dyn Resolver>,
}

impl BlockingResolver {
    /// Builds the stage and synchronously populates both list caches.
    ///
    /// Fails on an unknown `block_type`.
    pub async fn new(
        cfg: BlockingConfig,
        metrics: &Metrics,
        next: Box<dyn Resolver>,
    ) -> Result<Self> {
        let block_handler = BlockHandler::from_config(&cfg.block_type)?;
        let blacklist_matcher = ListCache::new(
            ListKind::Blacklist,
            cfg.black_lists.clone(),
            cfg.refresh_period,
            metrics,
        )
        .await;
        let whitelist_matcher = ListCache::new(
            ListKind::Whitelist,
            cfg.white_lists.clone(),
            cfg.refresh_period,
            metrics,
        )
        .await;
        let whitelist_only_groups = determine_whitelist_only_groups(&cfg);

        Ok(Self {
            block_handler,
            blacklist_matcher,
            whitelist_matcher,
            whitelist_only_groups,
            status: BlockingStatus::new(metrics),
            cfg,
            next,
        })
    }

    /// Shared handle for the control API.
    pub fn status(&self) -> BlockingStatus {
        self.status.clone()
    }

    /// Computes the categories to check for this request.
    ///
    /// EDNS0-derived opt-ins are masked by the administrator's global
    /// switches; client-name and IP mappings apply unconditionally. The
    /// `default` entry only applies when nothing matched and no IP mapping
    /// exists for the client. A bare `whitelist` set is not a policy and
    /// collapses to empty. The result is sorted and deduplicated.
    fn groups_to_check(&self, request: &Request) -> Vec<String> {
        let opted = groups_from_identity(request, &self.cfg.client_groups_block);
        let opted: HashSet<String> = opted.into_iter().collect();

        let mut toggles: BTreeMap<String, bool> = ["adblock", "malware", "adult", "whitelist"]
            .iter()
            .map(|category| (category.to_string(), false))
            .collect();
        for (category, enabled) in &self.cfg.global {
            toggles.insert(category.clone(), *enabled);
        }

        let mut groups: Vec<String> = toggles
            .into_iter()
            .filter(|(category, enabled)| *enabled && opted.contains(category))
            .map(|(category, _)| category)
            .collect();

        for name in &request.client_names {
            if let Some(bound) = self.cfg.client_groups_block.get(name) {
                groups.extend(bound.iter().cloned());
            }
        }

        let by_ip = self.cfg.client_groups_block.get(&request.client_ip.to_string());
        if let Some(bound) = by_ip {
            groups.extend(bound.iter().cloned());
        }

        if groups.is_empty() && by_ip.is_none() {
            if let Some(default) = self.cfg.client_groups_block.get("default") {
                groups = default.clone();
            }
        }

        if groups.len() == 1 && groups[0] == "whitelist" {
            groups.clear();
        }

        groups.sort();
        groups.dedup();
        groups
    }

    /// A list match blocks unless the per-domain override suppresses it.
    fn matches(&self, groups: &[String], matcher: &dyn Matcher, entry: &str) -> Option<String> {
        if groups.is_empty() {
            return None;
        }
        let group = matcher.find_group(entry, groups)?;
        match self.cfg.domain_overrides.get(entry) {
            Some(false) => None,
            _ => Some(group),
        }
    }

    fn handle_blocked(&self, request: &Request, question: &Query, reason: String) -> Response {
        let mut response = util::new_reply(&request.message);
        self.block_handler.handle_block(question, &mut response);

        debug!(%reason, "blocking request");

        Response {
            message: response,
            rtype: ResponseType::Blocked,
            reason,
        }
    }

    fn check_request(&self, groups: &[String], request: &Request) -> Precheck {
        let whitelist_only = groups == self.whitelist_only_groups.as_slice();

        for question in request.message.queries() {
            if question.query_type() != RecordType::A && question.query_type() != RecordType::AAAA {
                // Bypasses the question check; the answer is still
                // post-scanned.
                continue;
            }

            let domain = util::extract_domain(question.name());

            if let Some(group) = self.matches(groups, self.whitelist_matcher.as_ref(), &domain) {
                debug!(group, domain, "domain is whitelisted");
                return Precheck::Delegate { post_scan: false };
            }

            if whitelist_only {
                return Precheck::Blocked(self.handle_blocked(
                    request,
                    question,
                    "BLOCKED (WHITELIST ONLY)".to_string(),
                ));
            }

            if let Some(group) = self.matches(groups, self.blacklist_matcher.as_ref(), &domain) {
                return Precheck::Blocked(self.handle_blocked(
                    request,
                    question,
                    format!("BLOCKED ({group})"),
                ));
            }
        }

        Precheck::Delegate { post_scan: true }
    }

    /// Scans the downstream answer for blocked IPs and CNAME targets.
    fn scan_response(
        &self,
        groups: &[String],
        request: &Request,
        response: &Response,
    ) -> Option<Response> {
        for record in response.message.answers() {
            let (entry, kind) = match record.data() {
                RData::A(ip) => (ip.to_string(), "IP"),
                RData::AAAA(ip) => (ip.to_string().to_lowercase(), "IP"),
                RData::CNAME(target) => (util::extract_domain(&target.0), "CNAME"),
                _ => continue,
            };
            if entry.is_empty() {
                continue;
            }

            if let Some(group) = self.matches(groups, self.whitelist_matcher.as_ref(), &entry) {
                debug!(group, entry, kind, "response entry is whitelisted");
                continue;
            }

            if let Some(group) = self.matches(groups, self.blacklist_matcher.as_ref(), &entry) {
                let question = request.message.queries().first()?;
                return Some(self.handle_blocked(
                    request,
                    question,
                    format!("BLOCKED {kind} ({group})"),
                ));
            }
        }

        None
    }
}

#[async_trait]
impl Resolver for BlockingResolver {
    async fn resolve(&self, request: &Request) -> Result<Response> {
        let span = with_prefix(&request.log, "blocking_resolver");
        async move {
            let groups = self.groups_to_check(request);
            let mut post_scan = true;

            if self.status.is_enabled() && !groups.is_empty() {
                debug!(groups = %groups.join("; "), "checking groups for request");
                match self.check_request(&groups, request) {
                    Precheck::Blocked(response) => return Ok(response),
                    Precheck::Delegate { post_scan: scan } => post_scan = scan,
                }
            }

            let from_next = self.next.resolve(request).await?;

            if post_scan && self.status.is_enabled() && !groups.is_empty() {
                if let Some(blocked) = self.scan_response(&groups, request, &from_next) {
                    return Ok(blocked);
                }
            }

            Ok(from_next)
        }
        .instrument(span)
        .await
    }

    fn configuration(&self) -> Vec<String> {
        if self.cfg.client_groups_block.is_empty() {
            return vec!["deactivated".to_string()];
        }

        let mut result = vec!["clientGroupsBlock".to_string()];
        let sorted: BTreeMap<_, _> = self.cfg.client_groups_block.iter().collect();
        for (key, value) in sorted {
            result.push(format!("  {key} = \"{}\"", value.join(";")));
        }

        result.push("global:".to_string());
        let sorted: BTreeMap<_, _> = self.cfg.global.iter().collect();
        for (key, value) in sorted {
            result.push(format!("  {key} = \"{value}\""));
        }

        result.push(format!("blockType = \"{}\"", self.cfg.block_type));

        result.push("blacklist:".to_string());
        for line in self.blacklist_matcher.configuration() {
            result.push(format!("  {line}"));
        }

        result.push("whitelist:".to_string());
        for line in self.whitelist_matcher.configuration() {
            result.push(format!("  {line}"));
        }

        result
    }

    fn next(&self) -> Option<&dyn Resolver> {
        Some(self.next.as_ref())
    }

    fn name(&self) -> &'static str {
        "blocking_resolver"
    }
}

/// Returns the categories which have only whitelist sources, sorted.
fn determine_whitelist_only_groups(cfg: &BlockingConfig) -> Vec<String> {
    let mut result: Vec<String> = cfg
        .white_lists
        .iter()
        .filter(|(group, links)| !links.is_empty() && !cfg.black_lists.contains_key(*group))
        .map(|(group, _)| group.clone())
        .collect();
    result.sort();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::testing::{query_message, request, StubResolver};
    use hickory_proto::rr::rdata::CNAME;
    use hickory_proto::rr::{Name, Record};
    use std::collections::HashMap;
    use std::io::Write;
    use std::str::FromStr;
    use tempfile::NamedTempFile;

    const MAC: &[u8] = &[0x48, 0x52, 0x4a];

    fn source_file(lines: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{lines}").unwrap();
        file
    }

    fn client_groups(entries: &[(&str, &[&str])]) -> HashMap<String, Vec<String>> {
        entries
            .iter()
            .map(|(key, groups)| {
                (key.to_string(), groups.iter().map(|g| g.to_string()).collect())
            })
            .collect()
    }

    fn empty_answer() -> Message {
        let mut message = Message::new();
        message.set_id(4321);
        message
    }

    async fn resolver_with(cfg: BlockingConfig, answer: Message) -> BlockingResolver {
        BlockingResolver::new(cfg, &Metrics::new(false), Box::new(StubResolver { answer }))
            .await
            .unwrap()
    }

    // --- block handler ---

    #[test]
    fn test_block_handler_from_config() {
        assert_eq!(BlockHandler::from_config("").unwrap(), BlockHandler::ZeroIp);
        assert_eq!(BlockHandler::from_config(" zeroIP ").unwrap(), BlockHandler::ZeroIp);
        assert_eq!(BlockHandler::from_config("NxDomain").unwrap(), BlockHandler::NxDomain);
        assert_eq!(
            BlockHandler::from_config("1.2.3.4, 2001:db8::1").unwrap(),
            BlockHandler::IpList(vec![
                "1.2.3.4".parse().unwrap(),
                "2001:db8::1".parse().unwrap()
            ])
        );
        assert!(BlockHandler::from_config("garbage").is_err());
    }

    #[test]
    fn test_zero_ip_block() {
        let query = query_message("blocked1.com.", RecordType::A, None);
        let mut response = util::new_reply(&query);
        BlockHandler::ZeroIp.handle_block(&query.queries()[0], &mut response);

        let record = &response.answers()[0];
        assert_eq!(record.record_type(), RecordType::A);
        assert_eq!(record.ttl(), BLOCK_TTL);
        match record.data() {
            RData::A(ip) => assert_eq!(ip.0, Ipv4Addr::UNSPECIFIED),
            other => panic!("unexpected rdata {other:?}"),
        }

        let query = query_message("blocked1.com.", RecordType::AAAA, None);
        let mut response = util::new_reply(&query);
        BlockHandler::ZeroIp.handle_block(&query.queries()[0], &mut response);
        match response.answers()[0].data() {
            RData::AAAA(ip) => assert_eq!(ip.0, Ipv6Addr::UNSPECIFIED),
            other => panic!("unexpected rdata {other:?}"),
        }
    }

    #[test]
    fn test_nxdomain_block() {
        let query = query_message("blocked1.com.", RecordType::A, None);
        let mut response = util::new_reply(&query);
        BlockHandler::NxDomain.handle_block(&query.queries()[0], &mut response);
        assert_eq!(response.response_code(), ResponseCode::NXDomain);
        assert!(response.answers().is_empty());
    }

    #[test]
    fn test_ip_list_block_filters_by_family() {
        let handler = BlockHandler::from_config("192.100.100.15, 2001:db8::5").unwrap();

        let query = query_message("blocked1.com.", RecordType::A, None);
        let mut response = util::new_reply(&query);
        handler.handle_block(&query.queries()[0], &mut response);
        assert_eq!(response.answers().len(), 1);
        match response.answers()[0].data() {
            RData::A(ip) => assert_eq!(ip.0.to_string(), "192.100.100.15"),
            other => panic!("unexpected rdata {other:?}"),
        }

        let query = query_message("blocked1.com.", RecordType::AAAA, None);
        let mut response = util::new_reply(&query);
        handler.handle_block(&query.queries()[0], &mut response);
        match response.answers()[0].data() {
            RData::AAAA(ip) => assert_eq!(ip.0.to_string(), "2001:db8::5"),
            other => panic!("unexpected rdata {other:?}"),
        }
    }

    #[test]
    fn test_ip_list_falls_back_to_zero_ip() {
        let handler = BlockHandler::from_config("2001:db8::5").unwrap();

        // An A query with only IPv6 destinations falls back to 0.0.0.0.
        let query = query_message("blocked1.com.", RecordType::A, None);
        let mut response = util::new_reply(&query);
        handler.handle_block(&query.queries()[0], &mut response);
        match response.answers()[0].data() {
            RData::A(ip) => assert_eq!(ip.0, Ipv4Addr::UNSPECIFIED),
            other => panic!("unexpected rdata {other:?}"),
        }
    }

    // --- policy evaluator ---

    #[tokio::test]
    async fn test_global_toggles_mask_edns_opt_ins() {
        let cfg = BlockingConfig {
            client_groups_block: client_groups(&[("48:52:4a", &["adblock", "adult", "malware"])]),
            global: HashMap::from([
                ("adblock".to_string(), true),
                ("adult".to_string(), true),
                ("malware".to_string(), false),
            ]),
            ..Default::default()
        };
        let resolver = resolver_with(cfg, empty_answer()).await;

        let req = request("example.com.", RecordType::A, Some(MAC));
        assert_eq!(resolver.groups_to_check(&req), vec!["adblock", "adult"]);
    }

    #[tokio::test]
    async fn test_global_toggle_off_disables_opt_in() {
        let cfg = BlockingConfig {
            client_groups_block: client_groups(&[("48:52:4a", &["adblock"])]),
            global: HashMap::from([("adblock".to_string(), false)]),
            ..Default::default()
        };
        let resolver = resolver_with(cfg, empty_answer()).await;

        let req = request("example.com.", RecordType::A, Some(MAC));
        assert!(resolver.groups_to_check(&req).is_empty());
    }

    #[tokio::test]
    async fn test_client_name_and_ip_mappings_are_unconditional() {
        // No global toggles at all: EDNS opt-ins are masked away, but
        // name- and IP-bound groups still apply.
        let cfg = BlockingConfig {
            client_groups_block: client_groups(&[
                ("48:52:4a", &["adblock"]),
                ("laptop", &["adult"]),
                ("192.168.178.39", &["malware"]),
            ]),
            ..Default::default()
        };
        let resolver = resolver_with(cfg, empty_answer()).await;

        let mut req = request("example.com.", RecordType::A, Some(MAC));
        req.client_names = vec!["laptop".to_string()];
        assert_eq!(resolver.groups_to_check(&req), vec!["adult", "malware"]);
    }

    #[tokio::test]
    async fn test_default_applies_only_without_ip_match() {
        let cfg = BlockingConfig {
            client_groups_block: client_groups(&[("default", &["adblock"])]),
            ..Default::default()
        };
        let resolver = resolver_with(cfg, empty_answer()).await;
        let req = request("example.com.", RecordType::A, None);
        assert_eq!(resolver.groups_to_check(&req), vec!["adblock"]);

        // An IP mapping (even an empty one) suppresses the default.
        let cfg = BlockingConfig {
            client_groups_block: client_groups(&[
                ("default", &["adblock"]),
                ("192.168.178.39", &[]),
            ]),
            ..Default::default()
        };
        let resolver = resolver_with(cfg, empty_answer()).await;
        let req = request("example.com.", RecordType::A, None);
        assert!(resolver.groups_to_check(&req).is_empty());
    }

    #[tokio::test]
    async fn test_bare_whitelist_collapses_to_empty() {
        let cfg = BlockingConfig {
            client_groups_block: client_groups(&[("default", &["whitelist"])]),
            ..Default::default()
        };
        let resolver = resolver_with(cfg, empty_answer()).await;
        let req = request("example.com.", RecordType::A, None);
        assert!(resolver.groups_to_check(&req).is_empty());
    }

    #[tokio::test]
    async fn test_groups_are_sorted_and_deduplicated() {
        let cfg = BlockingConfig {
            client_groups_block: client_groups(&[
                ("laptop", &["malware", "adblock"]),
                ("192.168.178.39", &["adblock"]),
            ]),
            ..Default::default()
        };
        let resolver = resolver_with(cfg, empty_answer()).await;

        let mut req = request("example.com.", RecordType::A, None);
        req.client_names = vec!["laptop".to_string()];
        assert_eq!(resolver.groups_to_check(&req), vec!["adblock", "malware"]);
    }

    // --- pre-check and post-scan ---

    #[tokio::test]
    async fn test_whitelist_overrides_blacklist() {
        let black = source_file("site.com\n");
        let white = source_file("site.com\n");
        let cfg = BlockingConfig {
            black_lists: HashMap::from([(
                "adblock".to_string(),
                vec![black.path().display().to_string()],
            )]),
            white_lists: HashMap::from([(
                "whitelist".to_string(),
                vec![white.path().display().to_string()],
            )]),
            client_groups_block: client_groups(&[("default", &["adblock", "whitelist"])]),
            refresh_period: -1,
            ..Default::default()
        };
        let resolver = resolver_with(cfg, empty_answer()).await;

        let req = request("site.com.", RecordType::A, None);
        let response = resolver.resolve(&req).await.unwrap();
        assert_eq!(response.rtype, ResponseType::Resolved);
    }

    #[tokio::test]
    async fn test_whitelist_only_group_blocks_unlisted() {
        let white = source_file("allowed.com\n");
        let cfg = BlockingConfig {
            white_lists: HashMap::from([(
                "restricted".to_string(),
                vec![white.path().display().to_string()],
            )]),
            client_groups_block: client_groups(&[("default", &["restricted"])]),
            refresh_period: -1,
            ..Default::default()
        };
        let resolver = resolver_with(cfg, empty_answer()).await;

        let req = request("not-listed.com.", RecordType::A, None);
        let response = resolver.resolve(&req).await.unwrap();
        assert_eq!(response.rtype, ResponseType::Blocked);
        assert_eq!(response.reason, "BLOCKED (WHITELIST ONLY)");

        let req = request("allowed.com.", RecordType::A, None);
        let response = resolver.resolve(&req).await.unwrap();
        assert_eq!(response.rtype, ResponseType::Resolved);
    }

    #[tokio::test]
    async fn test_domain_override_suppresses_block() {
        let black = source_file("blocked1.com\n");
        let cfg = BlockingConfig {
            black_lists: HashMap::from([(
                "adblock".to_string(),
                vec![black.path().display().to_string()],
            )]),
            client_groups_block: client_groups(&[("default", &["adblock"])]),
            domain_overrides: HashMap::from([("blocked1.com".to_string(), false)]),
            refresh_period: -1,
            ..Default::default()
        };
        let resolver = resolver_with(cfg, empty_answer()).await;

        let req = request("blocked1.com.", RecordType::A, None);
        let response = resolver.resolve(&req).await.unwrap();
        assert_eq!(response.rtype, ResponseType::Resolved);
    }

    #[tokio::test]
    async fn test_post_scan_blocks_cname_target() {
        let black = source_file("evil.cdn\n");
        let cfg = BlockingConfig {
            black_lists: HashMap::from([(
                "adblock".to_string(),
                vec![black.path().display().to_string()],
            )]),
            client_groups_block: client_groups(&[("default", &["adblock"])]),
            refresh_period: -1,
            ..Default::default()
        };

        let mut answer = empty_answer();
        answer.add_answer(Record::from_rdata(
            Name::from_str("innocent.com.").unwrap(),
            300,
            RData::CNAME(CNAME(Name::from_str("evil.cdn.").unwrap())),
        ));
        let resolver = resolver_with(cfg, answer).await;

        let req = request("innocent.com.", RecordType::A, None);
        let response = resolver.resolve(&req).await.unwrap();
        assert_eq!(response.rtype, ResponseType::Blocked);
        assert_eq!(response.reason, "BLOCKED CNAME (adblock)");
    }

    #[tokio::test]
    async fn test_post_scan_applies_to_non_address_questions() {
        let black = source_file("1.2.3.4\n");
        let cfg = BlockingConfig {
            black_lists: HashMap::from([(
                "adblock".to_string(),
                vec![black.path().display().to_string()],
            )]),
            client_groups_block: client_groups(&[("default", &["adblock"])]),
            refresh_period: -1,
            ..Default::default()
        };

        let mut answer = empty_answer();
        answer.add_answer(util::create_answer(
            Name::from_str("example.com.").unwrap(),
            "1.2.3.4".parse().unwrap(),
            300,
        ));
        let resolver = resolver_with(cfg, answer).await;

        // A TXT question bypasses the question check but the downstream
        // answer is still scanned.
        let req = request("example.com.", RecordType::TXT, None);
        let response = resolver.resolve(&req).await.unwrap();
        assert_eq!(response.rtype, ResponseType::Blocked);
        assert_eq!(response.reason, "BLOCKED IP (adblock)");
    }

    #[tokio::test]
    async fn test_disabled_blocking_forwards() {
        let black = source_file("blocked1.com\n");
        let cfg = BlockingConfig {
            black_lists: HashMap::from([(
                "adblock".to_string(),
                vec![black.path().display().to_string()],
            )]),
            client_groups_block: client_groups(&[("default", &["adblock"])]),
            refresh_period: -1,
            ..Default::default()
        };
        let resolver = resolver_with(cfg, empty_answer()).await;
        resolver.status().disable(Duration::ZERO);

        let req = request("blocked1.com.", RecordType::A, None);
        let response = resolver.resolve(&req).await.unwrap();
        assert_eq!(response.rtype, ResponseType::Resolved);
    }

    #[tokio::test]
    async fn test_configuration_deactivated_without_client_groups() {
        let resolver = resolver_with(BlockingConfig::default(), empty_answer()).await;
        assert_eq!(resolver.configuration(), vec!["deactivated".to_string()]);
    }

    // --- status state machine ---

    #[tokio::test(start_paused = true)]
    async fn test_disable_then_auto_enable() {
        let status = BlockingStatus::new(&Metrics::new(false));
        assert!(status.is_enabled());

        status.disable(Duration::from_secs(30));
        let (enabled, auto_enable_in) = status.current();
        assert!(!enabled);
        assert!(auto_enable_in > 0 && auto_enable_in <= 30);

        tokio::time::advance(Duration::from_secs(10)).await;
        let (_, later) = status.current();
        assert!(later < auto_enable_in);

        tokio::time::advance(Duration::from_secs(25)).await;
        // Let the re-enable task run.
        tokio::task::yield_now().await;
        let (enabled, auto_enable_in) = status.current();
        assert!(enabled);
        assert_eq!(auto_enable_in, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disable_indefinitely() {
        let status = BlockingStatus::new(&Metrics::new(false));
        status.disable(Duration::ZERO);

        tokio::time::advance(Duration::from_secs(86400)).await;
        tokio::task::yield_now().await;
        let (enabled, auto_enable_in) = status.current();
        assert!(!enabled);
        assert_eq!(auto_enable_in, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enable_cancels_pending_timer() {
        let status = BlockingStatus::new(&Metrics::new(false));
        status.disable(Duration::from_secs(30));
        status.enable();
        assert!(status.is_enabled());

        // A later disable(0) must stay disabled; the old timer is gone.
        status.disable(Duration::ZERO);
        tokio::time::advance(Duration::from_secs(60)).await;
        tokio::task::yield_now().await;
        assert!(!status.is_enabled());
    }
}
