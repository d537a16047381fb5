//! Proptest generators for property-based testing.

use bytes::Bytes;
use proptest::prelude::*;

use meshtree_core::{Keypair, Message, Sha256Hash};
use meshtree_sync::{Body, Datagram, DatagramId, HelloBody};

/// Generate a random keypair. Seeds that are not valid scalars are skipped.
pub fn keypair() -> impl Strategy<Value = Keypair> {
    any::<[u8; 32]>().prop_filter_map("seed is not a valid scalar", |seed| {
        Keypair::from_seed(&seed).ok()
    })
}

/// Generate a random hash.
pub fn sha256_hash() -> impl Strategy<Value = Sha256Hash> {
    any::<[u8; 32]>().prop_map(Sha256Hash)
}

pub fn datagram_id() -> impl Strategy<Value = DatagramId> {
    any::<[u8; 4]>().prop_map(DatagramId)
}

/// Generate a peer name that fits the one-byte length prefix.
pub fn peer_name() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]{0,31}".prop_map(String::from)
}

/// Generate a message body.
pub fn message_body(max_len: usize) -> impl Strategy<Value = String> {
    prop::collection::vec(any::<char>(), 0..=max_len).prop_map(|chars| chars.into_iter().collect())
}

/// Generate a message, possibly replying to a random hash.
pub fn message() -> impl Strategy<Value = Message> {
    (any::<u32>(), message_body(64), prop::option::of(sha256_hash())).prop_map(
        |(date, body, in_reply_to)| Message {
            date,
            in_reply_to: in_reply_to.filter(|h| !h.is_zero()),
            body,
        },
    )
}

/// Generate a set of messages.
pub fn messages(max: usize) -> impl Strategy<Value = Vec<Message>> {
    prop::collection::vec(message(), 0..=max)
}

/// Generate any datagram body.
pub fn body() -> impl Strategy<Value = Body> {
    prop_oneof![
        peer_name().prop_map(|n| Body::Hello(HelloBody::new(n))),
        peer_name().prop_map(|n| Body::HelloReply(HelloBody::new(n))),
        Just(Body::RootRequest),
        sha256_hash().prop_map(Body::Root),
        sha256_hash().prop_map(Body::GetDatum),
        (sha256_hash(), prop::collection::vec(any::<u8>(), 0..512)).prop_map(|(hash, payload)| {
            Body::Datum {
                hash,
                payload: Bytes::from(payload),
            }
        }),
        sha256_hash().prop_map(Body::NoDatum),
        "[ -~]{0,64}".prop_map(Body::Error),
    ]
}

/// Generate an unsigned datagram.
pub fn datagram() -> impl Strategy<Value = Datagram> {
    (datagram_id(), body()).prop_map(|(id, body)| Datagram::new(id, body))
}
