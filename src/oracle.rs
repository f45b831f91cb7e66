//! The Oracle: message type registration and wire serialization.
//!
//! Per the specification this is an external collaborator — the stream and
//! socket layers only ever see `&dyn Message` / `Box<dyn Message>` and a
//! `TypeId`. This module defines the traits plus one concrete, minimal
//! `Oracle` (`Registry`) so the rest of the crate has something real to
//! encode/decode against; callers with a richer serialization story (serde,
//! protobuf, capnp, ...) are expected to implement `Oracle` themselves.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use parking_lot::RwLock;

use crate::error::{RelayStreamError, Result};

/// Stable numeric identifier for a registered application message type.
pub type TypeId = u32;

/// An application value the Oracle can serialize and identify by `TypeId`.
pub trait Message: fmt::Debug + Send + Sync {
    /// The stable TypeId this message encodes/decodes under.
    fn type_id(&self) -> TypeId;

    /// Encode this message's body (not including the TypeId header) into `buf`.
    fn encode_body(&self, buf: &mut BytesMut) -> Result<()>;

    /// Upcast for handlers that need to downcast to a concrete type.
    fn as_any(&self) -> &dyn Any;
}

/// A decoder function registered for one `TypeId`.
pub type DecodeFn = dyn Fn(&[u8]) -> Result<Box<dyn Message>> + Send + Sync;

/// External serialization registry: maps application message types to
/// stable `TypeId`s and encodes/decodes them.
///
/// `encode`/`decode` operate on a self-describing wire form: a `TypeId`
/// header followed by a length-prefixed body. `decode` reports how many
/// bytes of `data` it consumed so callers can keep decoding subsequent
/// items from the same buffer (see `frame.rs`).
pub trait Oracle: Send + Sync {
    /// Encode `msg`, including its `TypeId` header, into `buf`.
    fn encode(&self, msg: &dyn Message, buf: &mut BytesMut) -> Result<()>;

    /// Decode one message from the front of `data`.
    ///
    /// Returns the decoded message and the number of bytes consumed.
    fn decode(&self, data: &[u8]) -> Result<(Box<dyn Message>, usize)>;

    /// Peek the `TypeId` of the next self-described message in `data`
    /// without decoding its body. Used by the socket to route GENERAL
    /// datagrams and first-message connect dispatch.
    fn peek_type_id(&self, data: &[u8]) -> Result<TypeId>;
}

/// Default `Oracle`: a process-wide (or per-socket) table of decoders
/// keyed by `TypeId`, guarded by a `RwLock` since a single `Registry` may
/// be shared (via `Arc`) across multiple `Socket`s while registration
/// still happens concurrently with encode/decode on other sockets.
#[derive(Default)]
pub struct Registry {
    decoders: RwLock<HashMap<TypeId, Arc<DecodeFn>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            decoders: RwLock::new(HashMap::new()),
        }
    }

    /// Register a decoder for `type_id`. Overwrites any previous registration
    /// for the same id — callers that want `DuplicateRegistration` semantics
    /// should check `is_registered` first (the socket's handler tables do).
    pub fn register<F>(&self, type_id: TypeId, decode: F)
    where
        F: Fn(&[u8]) -> Result<Box<dyn Message>> + Send + Sync + 'static,
    {
        self.decoders.write().insert(type_id, Arc::new(decode));
    }

    pub fn is_registered(&self, type_id: TypeId) -> bool {
        self.decoders.read().contains_key(&type_id)
    }
}

const HEADER_LEN: usize = 4 + 4; // type_id(u32) + body_len(u32)

impl Oracle for Registry {
    fn encode(&self, msg: &dyn Message, buf: &mut BytesMut) -> Result<()> {
        let type_id = msg.type_id();
        let mut body = BytesMut::new();
        msg.encode_body(&mut body)?;
        buf.put_u32(type_id);
        buf.put_u32(body.len() as u32);
        buf.put_slice(&body);
        Ok(())
    }

    fn decode(&self, data: &[u8]) -> Result<(Box<dyn Message>, usize)> {
        if data.len() < HEADER_LEN {
            return Err(RelayStreamError::FrameTooShort {
                expected: HEADER_LEN,
                actual: data.len(),
            });
        }
        let type_id = (&data[0..4]).get_u32();
        let body_len = (&data[4..8]).get_u32() as usize;
        let total = HEADER_LEN + body_len;
        if data.len() < total {
            return Err(RelayStreamError::FrameTooShort {
                expected: total,
                actual: data.len(),
            });
        }
        let decoder = self
            .decoders
            .read()
            .get(&type_id)
            .cloned()
            .ok_or(RelayStreamError::UnknownDecoder(type_id))?;
        let msg = decoder(&data[HEADER_LEN..total])?;
        Ok((msg, total))
    }

    fn peek_type_id(&self, data: &[u8]) -> Result<TypeId> {
        if data.len() < 4 {
            return Err(RelayStreamError::FrameTooShort {
                expected: 4,
                actual: data.len(),
            });
        }
        Ok((&data[0..4]).get_u32())
    }
}
