//! The JSON envelope exchanged between clients and the relay.
//!
//! Every frame on the wire is one object of the shape
//! `{"source": .., "destination": .., "type": .., "data": ..}`. Inbound frames
//! are decoded straight into a closed [`Request`] so that impossible
//! combinations (a private message without a destination, a login without
//! credentials) are rejected here instead of deep inside the dispatcher.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Login,
    Get,
    Public,
    Private,
    Exit,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Login => "login",
            MessageKind::Get => "get",
            MessageKind::Public => "public",
            MessageKind::Private => "private",
            MessageKind::Exit => "exit",
        }
    }

    fn parse(tag: &str) -> Option<Self> {
        match tag {
            "login" => Some(MessageKind::Login),
            "get" => Some(MessageKind::Get),
            "public" => Some(MessageKind::Public),
            "private" => Some(MessageKind::Private),
            "exit" => Some(MessageKind::Exit),
            _ => None,
        }
    }
}

/// An envelope as it appears on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    pub source: Option<String>,
    pub destination: Option<String>,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub data: Option<String>,
}

impl Envelope {
    pub fn public(source: &str, text: &str) -> Self {
        Self {
            source: Some(source.to_string()),
            destination: None,
            kind: MessageKind::Public,
            data: Some(text.to_string()),
        }
    }

    pub fn private(source: &str, destination: &str, text: &str) -> Self {
        Self {
            source: Some(source.to_string()),
            destination: Some(destination.to_string()),
            kind: MessageKind::Private,
            data: Some(text.to_string()),
        }
    }

    /// Reply to a `get` request: the other online nicknames, space separated.
    pub fn online(requester: &str, nicknames: &[String]) -> Self {
        Self {
            source: Some(requester.to_string()),
            destination: None,
            kind: MessageKind::Get,
            data: Some(nicknames.join(" ")),
        }
    }

    pub fn encode(&self) -> String {
        // Plain strings and a unit enum: serialization cannot fail.
        serde_json::to_string(self).expect("envelope serializes")
    }
}

/// What a client asked for, validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Login { name: String, password: String },
    Get,
    Public { text: String },
    Private { to: String, text: String },
    Exit,
}

/// A decoded inbound frame together with the identity the client claimed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub source: Option<String>,
    pub request: Request,
}

// Inbound frames keep the tag as a plain string so an unknown type can be
// told apart from broken JSON.
#[derive(Debug, Deserialize)]
struct RawEnvelope {
    source: Option<String>,
    destination: Option<String>,
    #[serde(rename = "type")]
    kind: String,
    data: Option<String>,
}

impl Inbound {
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        let raw: RawEnvelope = serde_json::from_str(frame)?;
        let kind =
            MessageKind::parse(&raw.kind).ok_or_else(|| ProtocolError::UnknownKind(raw.kind))?;

        let request = match kind {
            MessageKind::Login => {
                let data = require(kind, "data", raw.data)?;
                let (name, password) = split_credentials(&data)?;
                Request::Login { name, password }
            }
            MessageKind::Get => Request::Get,
            MessageKind::Public => Request::Public {
                text: require(kind, "data", raw.data)?,
            },
            MessageKind::Private => {
                let to = require(kind, "destination", raw.destination)?;
                if to.is_empty() {
                    return Err(missing(kind, "destination"));
                }
                Request::Private {
                    to,
                    text: require(kind, "data", raw.data)?,
                }
            }
            MessageKind::Exit => Request::Exit,
        };

        Ok(Self {
            source: raw.source.filter(|source| !source.is_empty()),
            request,
        })
    }
}

fn require(
    kind: MessageKind,
    field: &'static str,
    value: Option<String>,
) -> Result<String, ProtocolError> {
    value.ok_or_else(|| missing(kind, field))
}

fn missing(kind: MessageKind, field: &'static str) -> ProtocolError {
    ProtocolError::MissingField {
        kind: kind.as_str(),
        field,
    }
}

fn split_credentials(data: &str) -> Result<(String, String), ProtocolError> {
    let mut parts = data.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(name), Some(password), None) => Ok((name.to_string(), password.to_string())),
        _ => Err(ProtocolError::BadCredentials),
    }
}
