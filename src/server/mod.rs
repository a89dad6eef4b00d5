//! DNS server endpoint: bridges hickory's request handling onto the
//! resolver chain.
//!
//! The handler reconstructs the query message (questions, flags, EDNS
//! options) for the chain, sends whatever the chain answers, and emits
//! `SERVFAIL` when the chain returns an error.

use crate::resolver::{Request as ChainRequest, Resolver};
use hickory_proto::op::{Header, Message, MessageType, OpCode, ResponseCode};
use hickory_server::authority::MessageResponseBuilder;
use hickory_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};
use std::sync::Arc;
use tracing::{debug, error};

#[derive(Clone)]
pub struct DnsHandler {
    chain: Arc<dyn Resolver>,
}

impl DnsHandler {
    pub fn new(chain: Arc<dyn Resolver>) -> Self {
        Self { chain }
    }

    fn chain_request(request: &Request) -> ChainRequest {
        let mut message = Message::new();
        message
            .set_id(request.id())
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(request.header().recursion_desired());
        for query in request.queries() {
            message.add_query(query.original().clone());
        }
        if let Some(edns) = request.edns() {
            *message.extensions_mut() = Some(edns.clone());
        }

        ChainRequest::new(message, request.src().ip())
    }
}

#[async_trait::async_trait]
impl RequestHandler for DnsHandler {
    async fn handle_request<R: ResponseHandler>(
        &self,
        request: &Request,
        mut response_handle: R,
    ) -> ResponseInfo {
        let chain_request = Self::chain_request(request);

        let mut header = Header::response_from_request(request.header());
        header.set_authoritative(false);
        header.set_recursion_available(true);
        let builder = MessageResponseBuilder::from_message_request(request);

        let send_result = match self.chain.resolve(&chain_request).await {
            Ok(response) => {
                debug!(
                    rtype = %response.rtype,
                    reason = %response.reason,
                    duration_ms = chain_request.received.elapsed().as_millis() as u64,
                    "query resolved"
                );
                header.set_response_code(response.message.response_code());
                let answers = response.message.answers().to_vec();
                let message = builder.build(header, answers.iter(), &[], &[], &[]);
                response_handle.send_response(message).await
            }
            Err(err) => {
                error!(error = %err, "resolution failed");
                header.set_response_code(ResponseCode::ServFail);
                let message = builder.build(header, &[], &[], &[], &[]);
                response_handle.send_response(message).await
            }
        };

        match send_result {
            Ok(info) => info,
            Err(err) => {
                error!(error = %err, "failed to send response");
                let mut header = Header::new();
                header.set_response_code(ResponseCode::ServFail);
                ResponseInfo::from(header)
            }
        }
    }
}
