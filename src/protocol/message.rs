//! Decoded protocol messages.
//!
//! `Message` is a closed sum type over every request/response kind this core
//! understands, plus an `Unsupported` variant carrying the unrecognized type
//! id. Dispatch is therefore a total, exhaustively-checked match — there is
//! no open-ended dynamic type lookup anywhere in the receive path.
//!
//! On the wire a body is a little-endian u32 type id followed by the
//! bincode-encoded structure. The type ids are the numeric node ids the OPC
//! UA specification assigns to each structure's binary encoding.

use crate::core::body;
use crate::error::{Result, UaError};
use crate::security::SecurityMode;
use serde::{Deserialize, Serialize};

/// Binary-encoding type ids (OPC UA numeric node ids).
pub mod type_id {
    pub const SERVICE_FAULT: u32 = 397;
    pub const FIND_SERVERS_REQUEST: u32 = 422;
    pub const FIND_SERVERS_RESPONSE: u32 = 425;
    pub const GET_ENDPOINTS_REQUEST: u32 = 428;
    pub const GET_ENDPOINTS_RESPONSE: u32 = 431;
    pub const OPEN_CHANNEL_REQUEST: u32 = 446;
    pub const OPEN_CHANNEL_RESPONSE: u32 = 449;
    pub const CLOSE_CHANNEL_REQUEST: u32 = 452;
}

/// Whether an OpenSecureChannel request issues a fresh token or renews the
/// current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecurityTokenRequestType {
    Issue,
    Renew,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenChannelRequest {
    pub request_type: SecurityTokenRequestType,
    pub security_mode: SecurityMode,
    pub security_policy_uri: String,
    pub client_nonce: Vec<u8>,
    /// Requested token lifetime in milliseconds
    pub requested_lifetime: u32,
}

/// Token material echoed back to the peer on issue and renew.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSecurityToken {
    pub channel_id: u32,
    pub token_id: u32,
    /// Granted lifetime in milliseconds
    pub revised_lifetime: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenChannelResponse {
    pub token: ChannelSecurityToken,
    pub server_nonce: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseChannelRequest {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindServersRequest {
    pub endpoint_url: String,
    pub server_uris: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindServersResponse {
    pub servers: Vec<ApplicationDescription>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetEndpointsRequest {
    pub endpoint_url: String,
    pub profile_uris: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetEndpointsResponse {
    pub endpoints: Vec<EndpointDescription>,
}

/// Fault response carrying a status code, sent when a handler cannot answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceFault {
    pub status_code: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationDescription {
    pub application_uri: String,
    pub product_uri: String,
    pub application_name: String,
    pub discovery_urls: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointDescription {
    pub endpoint_url: String,
    pub server: ApplicationDescription,
    pub security_mode: SecurityMode,
    pub security_policy_uri: String,
}

/// Every message kind the core understands, closed over with an explicit
/// `Unsupported` variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    OpenChannelRequest(OpenChannelRequest),
    OpenChannelResponse(OpenChannelResponse),
    CloseChannelRequest(CloseChannelRequest),
    FindServersRequest(FindServersRequest),
    FindServersResponse(FindServersResponse),
    GetEndpointsRequest(GetEndpointsRequest),
    GetEndpointsResponse(GetEndpointsResponse),
    ServiceFault(ServiceFault),
    /// Decoded frame of a type this core does not know. Logged and dropped
    /// by the dispatch loop; never fatal to the channel.
    Unsupported { type_id: u32 },
}

impl Message {
    /// Wire type id of this message.
    pub fn type_id(&self) -> u32 {
        use type_id::*;
        match self {
            Message::OpenChannelRequest(_) => OPEN_CHANNEL_REQUEST,
            Message::OpenChannelResponse(_) => OPEN_CHANNEL_RESPONSE,
            Message::CloseChannelRequest(_) => CLOSE_CHANNEL_REQUEST,
            Message::FindServersRequest(_) => FIND_SERVERS_REQUEST,
            Message::FindServersResponse(_) => FIND_SERVERS_RESPONSE,
            Message::GetEndpointsRequest(_) => GET_ENDPOINTS_REQUEST,
            Message::GetEndpointsResponse(_) => GET_ENDPOINTS_RESPONSE,
            Message::ServiceFault(_) => SERVICE_FAULT,
            Message::Unsupported { type_id } => *type_id,
        }
    }

    /// Short name for logging.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Message::OpenChannelRequest(_) => "OpenChannelRequest",
            Message::OpenChannelResponse(_) => "OpenChannelResponse",
            Message::CloseChannelRequest(_) => "CloseChannelRequest",
            Message::FindServersRequest(_) => "FindServersRequest",
            Message::FindServersResponse(_) => "FindServersResponse",
            Message::GetEndpointsRequest(_) => "GetEndpointsRequest",
            Message::GetEndpointsResponse(_) => "GetEndpointsResponse",
            Message::ServiceFault(_) => "ServiceFault",
            Message::Unsupported { .. } => "Unsupported",
        }
    }

    /// Encode as type id plus bincode body.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = match self {
            Message::OpenChannelRequest(m) => body::encode(m)?,
            Message::OpenChannelResponse(m) => body::encode(m)?,
            Message::CloseChannelRequest(m) => body::encode(m)?,
            Message::FindServersRequest(m) => body::encode(m)?,
            Message::FindServersResponse(m) => body::encode(m)?,
            Message::GetEndpointsRequest(m) => body::encode(m)?,
            Message::GetEndpointsResponse(m) => body::encode(m)?,
            Message::ServiceFault(m) => body::encode(m)?,
            Message::Unsupported { .. } => return Err(UaError::UnexpectedMessage),
        };

        let mut out = Vec::with_capacity(4 + body.len());
        out.extend_from_slice(&self.type_id().to_le_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decode from type id plus body. An unrecognized type id decodes to
    /// [`Message::Unsupported`] rather than an error.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(UaError::InvalidHeader);
        }
        let tid = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        let body_bytes = &data[4..];

        use type_id::*;
        Ok(match tid {
            OPEN_CHANNEL_REQUEST => Message::OpenChannelRequest(body::decode(body_bytes)?),
            OPEN_CHANNEL_RESPONSE => Message::OpenChannelResponse(body::decode(body_bytes)?),
            CLOSE_CHANNEL_REQUEST => Message::CloseChannelRequest(body::decode(body_bytes)?),
            FIND_SERVERS_REQUEST => Message::FindServersRequest(body::decode(body_bytes)?),
            FIND_SERVERS_RESPONSE => Message::FindServersResponse(body::decode(body_bytes)?),
            GET_ENDPOINTS_REQUEST => Message::GetEndpointsRequest(body::decode(body_bytes)?),
            GET_ENDPOINTS_RESPONSE => Message::GetEndpointsResponse(body::decode(body_bytes)?),
            SERVICE_FAULT => Message::ServiceFault(body::decode(body_bytes)?),
            other => Message::Unsupported { type_id: other },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_find_servers() {
        let msg = Message::FindServersRequest(FindServersRequest {
            endpoint_url: "opc.tcp://localhost:4840".into(),
            server_uris: vec![],
        });
        let bytes = msg.encode().unwrap();
        assert_eq!(
            u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            type_id::FIND_SERVERS_REQUEST
        );
        assert_eq!(Message::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn unknown_type_id_decodes_to_unsupported() {
        let mut bytes = 99_999u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(b"whatever");
        let msg = Message::decode(&bytes).unwrap();
        assert_eq!(msg, Message::Unsupported { type_id: 99_999 });
    }

    #[test]
    fn unsupported_cannot_be_encoded() {
        let msg = Message::Unsupported { type_id: 1 };
        assert!(matches!(msg.encode(), Err(UaError::UnexpectedMessage)));
    }

    #[test]
    fn truncated_body_is_an_error() {
        assert!(Message::decode(&[1, 0]).is_err());

        // Valid id, garbage body: this is a codec error, not Unsupported.
        let mut bytes = type_id::GET_ENDPOINTS_REQUEST.to_le_bytes().to_vec();
        bytes.push(0xFF);
        assert!(Message::decode(&bytes).is_err());
    }
}
