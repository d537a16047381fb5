//! Messages: the opaque content carried by leaves of a content tree.
//!
//! Leaf payload layout (big-endian):
//!
//! ```text
//! +------+----------+------------------+----------+-----------+
//! | type | date     | in_reply_to      | body_len | body      |
//! | 1 B  | 4 B      | 32 B             | 2 B      | body_len  |
//! +------+----------+------------------+----------+-----------+
//! ```
//!
//! `type` is always [`LEAF_TYPE`]. `date` counts seconds since
//! 2022-01-01T00:00:00Z. An all-zero `in_reply_to` means the message is not a
//! reply.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::crypto::{Sha256Hash, HASH_LEN};
use crate::error::CoreError;
use crate::node::MAX_PAYLOAD_LEN;

/// Type byte of a leaf payload.
pub const LEAF_TYPE: u8 = 0;

/// Unix timestamp of 2022-01-01T00:00:00Z, the origin of message dates.
pub const DATE_EPOCH_UNIX: u64 = 1_640_995_200;

const DATE_OFFSET: usize = 1;
const IN_REPLY_TO_OFFSET: usize = DATE_OFFSET + 4;
const BODY_LEN_OFFSET: usize = IN_REPLY_TO_OFFSET + HASH_LEN;

/// Fixed part of a leaf payload, before the body.
pub const LEAF_HEADER_LEN: usize = BODY_LEN_OFFSET + 2;

/// Longest body whose leaf can still be served in one datagram.
pub const MAX_MESSAGE_BODY_LEN: usize = MAX_PAYLOAD_LEN - LEAF_HEADER_LEN;

/// A microblogging message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Seconds since 2022-01-01T00:00:00Z.
    pub date: u32,
    /// Hash of the message this one replies to.
    pub in_reply_to: Option<Sha256Hash>,
    /// UTF-8 body, at most [`MAX_MESSAGE_BODY_LEN`] bytes.
    pub body: String,
}

impl Message {
    /// Create a message dated now.
    pub fn new(body: impl Into<String>, in_reply_to: Option<Sha256Hash>) -> Result<Self, CoreError> {
        Self::with_date(current_date(), body, in_reply_to)
    }

    /// Create a message with an explicit date.
    pub fn with_date(
        date: u32,
        body: impl Into<String>,
        in_reply_to: Option<Sha256Hash>,
    ) -> Result<Self, CoreError> {
        let message = Self {
            date,
            // A zero hash on the wire means "no parent"; normalise it here too.
            in_reply_to: in_reply_to.filter(|h| !h.is_zero()),
            body: body.into(),
        };
        message.check_size()?;
        Ok(message)
    }

    /// Fail if the body is too long for the leaf to be served.
    pub fn check_size(&self) -> Result<(), CoreError> {
        if self.body.len() > MAX_MESSAGE_BODY_LEN {
            return Err(CoreError::MalformedMessage(format!(
                "body of {} bytes exceeds {}",
                self.body.len(),
                MAX_MESSAGE_BODY_LEN
            )));
        }
        Ok(())
    }

    /// Encode as a leaf payload (including the leading type byte).
    pub fn encode(&self) -> Vec<u8> {
        let body = self.body.as_bytes();
        let mut buf = Vec::with_capacity(LEAF_HEADER_LEN + body.len());
        buf.push(LEAF_TYPE);
        buf.extend_from_slice(&self.date.to_be_bytes());
        buf.extend_from_slice(self.in_reply_to.unwrap_or(Sha256Hash::ZERO).as_bytes());
        buf.extend_from_slice(&(body.len() as u16).to_be_bytes());
        buf.extend_from_slice(body);
        buf
    }

    /// Decode a leaf payload.
    pub fn decode(bytes: &[u8]) -> Result<Self, CoreError> {
        if bytes.len() < LEAF_HEADER_LEN {
            return Err(CoreError::MalformedMessage(format!(
                "leaf payload too short: {} bytes",
                bytes.len()
            )));
        }
        if bytes[0] != LEAF_TYPE {
            return Err(CoreError::MalformedMessage(format!(
                "unexpected type byte {}",
                bytes[0]
            )));
        }

        let date = u32::from_be_bytes([
            bytes[DATE_OFFSET],
            bytes[DATE_OFFSET + 1],
            bytes[DATE_OFFSET + 2],
            bytes[DATE_OFFSET + 3],
        ]);

        let mut reply = [0u8; HASH_LEN];
        reply.copy_from_slice(&bytes[IN_REPLY_TO_OFFSET..BODY_LEN_OFFSET]);
        let in_reply_to = Some(Sha256Hash(reply)).filter(|h| !h.is_zero());

        let body_len =
            u16::from_be_bytes([bytes[BODY_LEN_OFFSET], bytes[BODY_LEN_OFFSET + 1]]) as usize;
        let body = &bytes[LEAF_HEADER_LEN..];
        if body.len() != body_len {
            return Err(CoreError::MalformedMessage(format!(
                "declared body length {} but {} bytes present",
                body_len,
                body.len()
            )));
        }

        let body = std::str::from_utf8(body)
            .map_err(|e| CoreError::MalformedMessage(format!("body is not UTF-8: {}", e)))?;

        Ok(Self {
            date,
            in_reply_to,
            body: body.to_owned(),
        })
    }

    /// Hash of the encoded leaf payload: the leaf's identity in a tree.
    pub fn hash(&self) -> Sha256Hash {
        Sha256Hash::hash(&self.encode())
    }

    /// Date as Unix seconds.
    pub fn unix_time(&self) -> u64 {
        DATE_EPOCH_UNIX + self.date as u64
    }
}

/// Seconds elapsed since the message date epoch, saturating at both ends.
pub fn current_date() -> u32 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    now.saturating_sub(DATE_EPOCH_UNIX).min(u32::MAX as u64) as u32
}

/// Build `count` sample messages `"Message 1"`, `"Message 2"`, ...
///
/// Every second message replies to the one before it. Dates are fixed so the
/// resulting tree is reproducible.
pub fn sample_messages(count: usize) -> Vec<Message> {
    let mut messages: Vec<Message> = Vec::with_capacity(count);
    for i in 0..count {
        let in_reply_to = if i % 2 == 1 {
            Some(messages[i - 1].hash())
        } else {
            None
        };
        messages.push(Message {
            date: i as u32,
            in_reply_to,
            body: format!("Message {}", i + 1),
        });
    }
    messages
}
