//! Built-in discovery handlers.
//!
//! Answers the two discovery services — FindServers and GetEndpoints — by
//! assembling descriptive data from the server's static configuration.
//! These exist to validate the dispatch contract end to end; they carry no
//! algorithmic logic.

use crate::config::ServerConfig;
use crate::protocol::dispatcher::{Handler, Request, ResponseWriter};
use crate::protocol::message::{
    ApplicationDescription, EndpointDescription, FindServersResponse, GetEndpointsResponse,
    Message,
};
use std::sync::Arc;
use tracing::{debug, warn};

/// Handler serving FindServers and GetEndpoints from static configuration.
pub struct DiscoveryHandler {
    config: Arc<ServerConfig>,
}

impl DiscoveryHandler {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self { config }
    }

    fn application_description(&self) -> ApplicationDescription {
        let app = &self.config.application;
        ApplicationDescription {
            application_uri: app.application_uri.clone(),
            product_uri: app.product_uri.clone(),
            application_name: app.application_name.clone(),
            discovery_urls: vec![self.config.endpoint_url.clone()],
        }
    }
}

impl Handler for DiscoveryHandler {
    fn serve(&self, w: &mut ResponseWriter, r: &Request) {
        let response = match &r.message {
            Message::FindServersRequest(_) => Message::FindServersResponse(FindServersResponse {
                servers: vec![self.application_description()],
            }),
            Message::GetEndpointsRequest(_) => {
                Message::GetEndpointsResponse(GetEndpointsResponse {
                    endpoints: vec![EndpointDescription {
                        endpoint_url: self.config.endpoint_url.clone(),
                        server: self.application_description(),
                        security_mode: self.config.security.mode,
                        security_policy_uri: self.config.security.policy_uri.clone(),
                    }],
                })
            }
            other => {
                debug!(kind = other.kind_name(), "discovery handler has no answer");
                return;
            }
        };

        if let Err(e) = w.send(response) {
            warn!(request = r.request_id, error = %e, "response dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::{FindServersRequest, GetEndpointsRequest};

    fn handler() -> DiscoveryHandler {
        let mut config = ServerConfig::new("opc.tcp://127.0.0.1:4840/demo");
        config.application.application_name = "demo server".into();
        DiscoveryHandler::new(Arc::new(config))
    }

    fn dispatch(h: &DiscoveryHandler, message: Message) -> Option<Message> {
        let request = Request {
            message,
            request_id: 1,
            channel_id: 1,
        };
        let mut writer = ResponseWriter::new();
        h.serve(&mut writer, &request);
        writer.into_response()
    }

    #[test]
    fn find_servers_lists_this_server() {
        let h = handler();
        let response = dispatch(
            &h,
            Message::FindServersRequest(FindServersRequest {
                endpoint_url: String::new(),
                server_uris: vec![],
            }),
        );

        match response {
            Some(Message::FindServersResponse(resp)) => {
                assert_eq!(resp.servers.len(), 1);
                assert_eq!(
                    resp.servers[0].discovery_urls,
                    vec!["opc.tcp://127.0.0.1:4840/demo".to_string()]
                );
                assert_eq!(resp.servers[0].application_name, "demo server");
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn get_endpoints_reports_security_settings() {
        let h = handler();
        let response = dispatch(
            &h,
            Message::GetEndpointsRequest(GetEndpointsRequest {
                endpoint_url: String::new(),
                profile_uris: vec![],
            }),
        );

        match response {
            Some(Message::GetEndpointsResponse(resp)) => {
                assert_eq!(resp.endpoints.len(), 1);
                let ep = &resp.endpoints[0];
                assert_eq!(ep.endpoint_url, "opc.tcp://127.0.0.1:4840/demo");
                assert_eq!(ep.security_policy_uri, crate::security::POLICY_URI_NONE);
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn unanswered_kinds_produce_no_response() {
        let h = handler();
        let response = dispatch(&h, Message::Unsupported { type_id: 7 });
        assert!(response.is_none());
    }
}
