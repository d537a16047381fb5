//! Datagram signatures.
//!
//! A signature covers every byte before the trailer, i.e. the header and
//! the body. Only kinds for which [`requires_signature`](crate::datagram::DatagramKind::requires_signature) holds
//! are signed on the way out; the trailer of the others stays zero.

use std::net::SocketAddr;

use meshtree_core::{Keypair, PublicKey, Signature, SIGNATURE_LEN};

use crate::datagram::{Datagram, Header};
use crate::error::{FrameError, Result, SyncError};

/// Encode `datagram`, signing it with `identity` if its kind is signed.
pub fn seal(datagram: &Datagram, identity: &Keypair) -> std::result::Result<Vec<u8>, FrameError> {
    let mut bytes = Datagram {
        signature: None,
        ..datagram.clone()
    }
    .encode()?;

    if datagram.kind().requires_signature() {
        let region = bytes.len() - SIGNATURE_LEN;
        let signature = identity.sign(&bytes[..region]);
        bytes[region..].copy_from_slice(signature.as_bytes());
    }
    Ok(bytes)
}

/// Check the trailer of raw datagram bytes against `key`.
pub fn verify(bytes: &[u8], key: &PublicKey, peer: SocketAddr) -> Result<()> {
    let header = Header::parse(bytes)?;
    let region = header.signed_len();

    let trailer = bytes
        .get(region..region + SIGNATURE_LEN)
        .ok_or_else(|| SyncError::Authentication {
            peer,
            reason: "missing signature".into(),
        })?;
    let mut raw = [0u8; SIGNATURE_LEN];
    raw.copy_from_slice(trailer);

    key.verify(&bytes[..region], &Signature(raw))
        .map_err(|e| SyncError::Authentication {
            peer,
            reason: e.to_string(),
        })
}
