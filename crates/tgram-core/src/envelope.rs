//! Envelope documents exchanged between gateway and agent.
//!
//! An envelope is the structured content of one reassembled message. Its
//! textual form is a JSON document rooted at `message`; the kind is decided
//! by which fields are present, not by an explicit tag:
//!
//! | Shape                                              | Kind                    |
//! |----------------------------------------------------|-------------------------|
//! | `request_pipe_id` and no `pipe_id`                 | registration request    |
//! | `response { pipe_id, services[status] }`           | registration response   |
//! | `pipe_id`, a service entry with `request`          | service request         |
//! | `pipe_id`, a service entry with `response`         | service response        |
//! | `pipe_id`, plain service entries (or none)         | service announcement    |
//!
//! Opaque payload bytes travel as standard base64 and are never interpreted.

use crate::error::{TgramError, TgramResult};
use crate::gram::MAX_MESSAGE_LEN;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// Service type advertised for every announced service.
const SERVICE_TYPE_TCP: &str = "tcp";

/// Room left in a message for the document around a payload.
const ENVELOPE_OVERHEAD: usize = 1024;

/// Largest payload whose base64-encoded envelope still fits in one message.
pub const MAX_PAYLOAD_LEN: usize = (MAX_MESSAGE_LEN - ENVELOPE_OVERHEAD) / 4 * 3;

/// A decoded envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    /// Agent asks the gateway for a pipe id.
    RegistrationRequest,
    /// Gateway assigns (or confirms) a pipe id and acknowledges services.
    Registration {
        pipe_id: String,
        acks: Vec<ServiceAck>,
    },
    /// Agent announces the services reachable through its pipe.
    Announcement {
        pipe_id: String,
        services: Vec<ServiceAnnouncement>,
    },
    /// Gateway forwards a client request to the agent.
    ServiceRequest {
        pipe_id: String,
        service_id: String,
        request_id: u64,
        payload: Payload,
    },
    /// Agent returns the backend's response (or an error) for a request.
    ServiceResponse {
        pipe_id: String,
        service_id: String,
        request_id: u64,
        payload: Payload,
    },
}

/// Opaque request/response body, or an error marker in its place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Data(Vec<u8>),
    Error(String),
}

/// One service announced by an agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAnnouncement {
    pub uuid: String,
    pub name: String,
}

/// Gateway's acknowledgement of one announced service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAck {
    pub uuid: String,
    pub status: ServiceStatus,
}

/// Whether the gateway can route clients to an announced service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    /// The gateway has a configured listener for this service.
    Registered,
    /// The binding was stored but no listener exists for it.
    Unknown,
}

// ── Document shape ───────────────────────────────────────────────────

#[derive(Debug, Default, Serialize, Deserialize)]
struct Document {
    message: MessageElem,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MessageElem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    request_pipe_id: Option<EmptyElem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pipe_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    response: Option<RegistrationElem>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    services: Vec<ServiceElem>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct EmptyElem {}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistrationElem {
    pipe_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    services: Vec<AckElem>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AckElem {
    uuid: String,
    status: ServiceStatus,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ServiceElem {
    uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    request: Option<RequestElem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    response: Option<ResponseElem>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RequestElem {
    id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ResponseElem {
    request_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

// ── Encoding ─────────────────────────────────────────────────────────

impl Envelope {
    /// Encode into the bytes of one message.
    pub fn encode(&self) -> TgramResult<Vec<u8>> {
        let message = match self {
            Envelope::RegistrationRequest => MessageElem {
                request_pipe_id: Some(EmptyElem {}),
                ..Default::default()
            },
            Envelope::Registration { pipe_id, acks } => MessageElem {
                response: Some(RegistrationElem {
                    pipe_id: pipe_id.clone(),
                    services: acks
                        .iter()
                        .map(|ack| AckElem {
                            uuid: ack.uuid.clone(),
                            status: ack.status,
                        })
                        .collect(),
                }),
                ..Default::default()
            },
            Envelope::Announcement { pipe_id, services } => MessageElem {
                pipe_id: Some(pipe_id.clone()),
                services: services
                    .iter()
                    .map(|s| ServiceElem {
                        uuid: s.uuid.clone(),
                        name: Some(s.name.clone()),
                        kind: Some(SERVICE_TYPE_TCP.to_string()),
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            },
            Envelope::ServiceRequest {
                pipe_id,
                service_id,
                request_id,
                payload,
            } => {
                let (payload, error) = encode_payload(payload);
                MessageElem {
                    pipe_id: Some(pipe_id.clone()),
                    services: vec![ServiceElem {
                        uuid: service_id.clone(),
                        request: Some(RequestElem {
                            id: *request_id,
                            payload,
                            error,
                        }),
                        ..Default::default()
                    }],
                    ..Default::default()
                }
            }
            Envelope::ServiceResponse {
                pipe_id,
                service_id,
                request_id,
                payload,
            } => {
                let (payload, error) = encode_payload(payload);
                MessageElem {
                    pipe_id: Some(pipe_id.clone()),
                    services: vec![ServiceElem {
                        uuid: service_id.clone(),
                        kind: Some(SERVICE_TYPE_TCP.to_string()),
                        response: Some(ResponseElem {
                            request_id: *request_id,
                            payload,
                            error,
                        }),
                        ..Default::default()
                    }],
                    ..Default::default()
                }
            }
        };

        Ok(serde_json::to_vec(&Document { message })?)
    }

    /// Decode the bytes of one message.
    pub fn decode(data: &[u8]) -> TgramResult<Self> {
        let document: Document = serde_json::from_slice(data)?;
        let message = document.message;

        if let Some(registration) = message.response {
            if registration.pipe_id.is_empty() {
                return Err(TgramError::InvalidEnvelope("empty pipe_id in response".into()));
            }
            return Ok(Envelope::Registration {
                pipe_id: registration.pipe_id,
                acks: registration
                    .services
                    .into_iter()
                    .map(|ack| ServiceAck {
                        uuid: ack.uuid,
                        status: ack.status,
                    })
                    .collect(),
            });
        }

        let pipe_id = match message.pipe_id {
            Some(id) if !id.is_empty() => id,
            Some(_) => {
                return Err(TgramError::InvalidEnvelope("empty pipe_id".into()));
            }
            None if message.request_pipe_id.is_some() => {
                return Ok(Envelope::RegistrationRequest);
            }
            None => {
                return Err(TgramError::InvalidEnvelope(
                    "neither pipe_id nor request_pipe_id present".into(),
                ));
            }
        };

        let carries_request = message.services.iter().any(|s| s.request.is_some());
        let carries_response = message.services.iter().any(|s| s.response.is_some());

        if carries_request || carries_response {
            let mut services = message.services.into_iter();
            let service = match (services.next(), services.next()) {
                (Some(service), None) => service,
                _ => {
                    return Err(TgramError::InvalidEnvelope(
                        "request/response envelope must carry exactly one service".into(),
                    ));
                }
            };

            return match (service.request, service.response) {
                (Some(request), None) => Ok(Envelope::ServiceRequest {
                    pipe_id,
                    service_id: service.uuid,
                    request_id: request.id,
                    payload: decode_payload(request.payload, request.error),
                }),
                (None, Some(response)) => Ok(Envelope::ServiceResponse {
                    pipe_id,
                    service_id: service.uuid,
                    request_id: response.request_id,
                    payload: decode_payload(response.payload, response.error),
                }),
                _ => Err(TgramError::InvalidEnvelope(
                    "service carries both request and response".into(),
                )),
            };
        }

        Ok(Envelope::Announcement {
            pipe_id,
            services: message
                .services
                .into_iter()
                .map(|s| ServiceAnnouncement {
                    uuid: s.uuid,
                    name: s.name.unwrap_or_default(),
                })
                .collect(),
        })
    }

    /// The pipe id carried by this envelope, if any.
    pub fn pipe_id(&self) -> Option<&str> {
        match self {
            Envelope::RegistrationRequest => None,
            Envelope::Registration { pipe_id, .. }
            | Envelope::Announcement { pipe_id, .. }
            | Envelope::ServiceRequest { pipe_id, .. }
            | Envelope::ServiceResponse { pipe_id, .. } => Some(pipe_id),
        }
    }

    /// Short name of the envelope kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::RegistrationRequest => "registration_request",
            Envelope::Registration { .. } => "registration",
            Envelope::Announcement { .. } => "announcement",
            Envelope::ServiceRequest { .. } => "service_request",
            Envelope::ServiceResponse { .. } => "service_response",
        }
    }
}

fn encode_payload(payload: &Payload) -> (Option<String>, Option<String>) {
    match payload {
        Payload::Data(bytes) => (Some(STANDARD.encode(bytes)), None),
        Payload::Error(reason) => (None, Some(reason.clone())),
    }
}

/// A payload that fails to decode becomes an error marker rather than
/// failing the whole envelope, so the affected request can still be answered.
fn decode_payload(payload: Option<String>, error: Option<String>) -> Payload {
    match (payload, error) {
        (_, Some(reason)) => Payload::Error(reason),
        (Some(text), None) => match STANDARD.decode(text.trim()) {
            Ok(bytes) => Payload::Data(bytes),
            Err(e) => Payload::Error(format!("undecodable payload: {e}")),
        },
        (None, None) => Payload::Error("missing payload".into()),
    }
}
