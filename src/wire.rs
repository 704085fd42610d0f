//! Message envelope and transport abstraction.
//!
//! Every protocol message travels as an [`Envelope`]: a JSON object carrying
//! the protocol name, a process identifier correlating all messages of one
//! protocol instance, a per-instance sequence number and the typed payload.
//! The transport itself is out of scope; implementors provide a [`MessageBus`]
//! that delivers serialized envelopes to a named peer.

use core::fmt::Debug;

use serde::{Deserialize, Serialize};

use crate::abiencode::types::Signature;
use crate::keys::Xpub;
use crate::protocol::{Protocol, ProtocolParams};

/// Correlates all envelopes belonging to one protocol instance.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub [u8; 32]);

impl ProcessId {
    pub fn random<R: rand::Rng>(rng: &mut R) -> Self {
        ProcessId(rng.gen())
    }
}

impl Debug for ProcessId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "ProcessId(0x")?;
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        write!(f, ")")
    }
}

impl Serialize for ProcessId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for ProcessId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("process id must be 32 bytes"))?;
        Ok(ProcessId(arr))
    }
}

/// Signatures attached to a protocol message, sized by the step that sends
/// them. Closed so a machine can match exhaustively on what it expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CustomData {
    None,
    Signature { signature: Signature },
    SignaturePair { signatures: [Signature; 2] },
    SignatureTriple { signatures: [Signature; 3] },
}

impl CustomData {
    /// The single signature, if this is the single-signature variant.
    pub fn single(&self) -> Option<Signature> {
        match self {
            CustomData::Signature { signature } => Some(*signature),
            _ => None,
        }
    }

    pub fn pair(&self) -> Option<[Signature; 2]> {
        match self {
            CustomData::SignaturePair { signatures } => Some(*signatures),
            _ => None,
        }
    }

    pub fn triple(&self) -> Option<[Signature; 3]> {
        match self {
            CustomData::SignatureTriple { signatures } => Some(*signatures),
            _ => None,
        }
    }
}

/// One protocol message.
///
/// `params` is present only on a message that opens an instance for its
/// receiver (seq 1, and seq 2 of the virtual app protocols); followups carry
/// the process id and signatures only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub protocol: Protocol,
    pub process_id: ProcessId,
    pub seq: i32,
    pub from: Xpub,
    pub to: Xpub,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<ProtocolParams>,
    pub custom_data: CustomData,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    MalformedMessage(String),
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::MalformedMessage(e) => write!(f, "malformed message: {e}"),
        }
    }
}

impl std::error::Error for Error {}

impl Envelope {
    pub fn to_json(&self) -> String {
        // Serialization of a well-formed envelope cannot fail.
        serde_json::to_string(self).unwrap()
    }

    pub fn from_json(data: &str) -> Result<Self, Error> {
        serde_json::from_str(data).map_err(|e| Error::MalformedMessage(e.to_string()))
    }
}

/// Abstraction over the network. The [`crate::Node`] hands every outbound
/// envelope to the bus; how it reaches `to` is the embedder's concern.
pub trait MessageBus: Debug {
    fn send(&self, to: &Xpub, envelope: &Envelope);
}
