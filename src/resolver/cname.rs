//! Chain stage rewriting configured domains to a per-group CNAME target.
//!
//! When the question's domain matches one of an active group's `domains`
//! entries, the stage resolves the group's target itself (recursive `A`
//! sub-query against a fixed public resolver) and replies with those
//! addresses plus a synthesized CNAME record. Group membership comes from
//! the EDNS0-carried identity with a `default` fallback; unlike the
//! blocking stage there is no global-toggle masking.

use crate::config::CnameConfig;
use crate::resolver::{
    groups_from_identity, upstream, with_prefix, Request, Resolver, Response, ResponseType,
};
use crate::util;
use anyhow::{bail, Result};
use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::CNAME;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use std::str::FromStr;
use tracing::{debug, Instrument};

const CUSTOM_DNS_TTL: u32 = 60 * 60;
const REWRITE_UPSTREAM: &str = "8.8.8.8:53";

pub struct CnameResolver {
    cfg: CnameConfig,
    rewrite_upstream: String,
    next: Box<dyn Resolver>,
}

impl CnameResolver {
    pub fn new(cfg: CnameConfig, next: Box<dyn Resolver>) -> Self {
        Self {
            cfg,
            rewrite_upstream: REWRITE_UPSTREAM.to_string(),
            next,
        }
    }

    #[cfg(test)]
    fn with_rewrite_upstream(mut self, addr: &str) -> Self {
        self.rewrite_upstream = addr.to_string();
        self
    }

    fn groups_for_client(&self, request: &Request) -> Vec<String> {
        let mut groups = groups_from_identity(request, &self.cfg.client_groups_block);
        if groups.is_empty() {
            if let Some(default) = self.cfg.client_groups_block.get("default") {
                groups = default.clone();
            }
        }
        groups.sort();
        groups
    }

    async fn rewrite(&self, request: &Request, question: &Query, target: &str) -> Result<Response> {
        let target_name = Name::from_str(target)?;

        let mut sub_query = Message::new();
        sub_query
            .set_id(request.message.id())
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true);
        sub_query.add_query(Query::query(target_name.clone(), RecordType::A));

        let sub_response = upstream::exchange_udp(&sub_query, &self.rewrite_upstream).await?;
        if sub_response.response_code() != ResponseCode::NoError {
            bail!(
                "failed to get a valid answer for '{target}', code: {:?}",
                sub_response.response_code()
            );
        }

        let mut response = util::new_reply(&request.message);
        for record in sub_response.answers() {
            response.add_answer(record.clone());
        }
        response.add_answer(Record::from_rdata(
            question.name().clone(),
            CUSTOM_DNS_TTL,
            RData::CNAME(CNAME(target_name)),
        ));

        debug!(
            answer = %util::answer_to_string(response.answers()),
            domain = %util::extract_domain(question.name()),
            "returning restricted dns entry"
        );

        Ok(Response {
            message: response,
            rtype: ResponseType::CustomDns,
            reason: "RESTRICTED DNS".to_string(),
        })
    }
}

#[async_trait]
impl Resolver for CnameResolver {
    async fn resolve(&self, request: &Request) -> Result<Response> {
        let span = with_prefix(&request.log, "cname_resolver");
        async move {
            for question in request.message.queries() {
                let domain = util::extract_domain(question.name());
                if domain.is_empty() {
                    continue;
                }

                let groups = self.groups_for_client(request);
                for group in &groups {
                    let Some(cfg_group) = self.cfg.groups.get(group) else {
                        continue;
                    };
                    if cfg_group.domains.iter().any(|d| d == &domain) {
                        return self.rewrite(request, question, &cfg_group.cname).await;
                    }
                }
            }

            self.next.resolve(request).await
        }
        .instrument(span)
        .await
    }

    fn configuration(&self) -> Vec<String> {
        let mut result = Vec::new();

        let mut groups: Vec<_> = self.cfg.groups.iter().collect();
        groups.sort_by_key(|(name, _)| name.as_str());
        for (name, group) in groups {
            result.push(format!("group {name} redirects to {}", group.cname));
            for domain in &group.domains {
                result.push(format!("domain {domain}"));
            }
        }

        let mut clients: Vec<_> = self.cfg.client_groups_block.iter().collect();
        clients.sort_by_key(|(key, _)| key.as_str());
        for (key, value) in clients {
            result.push(format!("  {key} = \"{}\"", value.join(";")));
        }

        result
    }

    fn next(&self) -> Option<&dyn Resolver> {
        Some(self.next.as_ref())
    }

    fn name(&self) -> &'static str {
        "cname_resolver"
    }
}
