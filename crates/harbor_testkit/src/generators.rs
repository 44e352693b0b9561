//! Property-based test generators using proptest.

use crate::fixtures::{comment, post};
use harbor_model::{KeyValue, ModelKey, Record};
use proptest::prelude::*;

/// Strategy for short identifiers.
pub fn id_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9]{0,7}").expect("Invalid regex")
}

/// Strategy for key components.
pub fn key_value_strategy() -> impl Strategy<Value = KeyValue> {
    prop_oneof![
        any::<i64>().prop_map(KeyValue::Integer),
        id_strategy().prop_map(KeyValue::Text),
    ]
}

/// Strategy for keys of one to three components.
pub fn model_key_strategy() -> impl Strategy<Value = ModelKey> {
    prop::collection::vec(key_value_strategy(), 1..=3).prop_map(ModelKey::new)
}

/// Strategy for `Post` records drawn from a small id space so that keys
/// collide often.
pub fn post_strategy() -> impl Strategy<Value = Record> {
    (0..4u8, prop::sample::select(vec!["a", "b"]), any::<Option<i32>>()).prop_map(
        |(id, title, rating)| {
            let mut record = post(&format!("p{id}"), title);
            if let Some(rating) = rating {
                record.set("rating", rating);
            }
            record
        },
    )
}

/// Strategy for `Comment` records with no post.
pub fn comment_strategy() -> impl Strategy<Value = Record> {
    (0..4u8, "[a-z ]{0,16}")
        .prop_map(|(id, content)| comment(&format!("c{id}"), &content, None))
}

/// A local write in a generated workload.
#[derive(Debug, Clone)]
pub enum LocalOp {
    /// Save a comment.
    Save(Record),
    /// Delete the comment with this id, if present.
    Delete(String),
}

/// Strategy for sequences of saves and deletes over a few comment keys.
pub fn local_ops_strategy(max_len: usize) -> impl Strategy<Value = Vec<LocalOp>> {
    prop::collection::vec(
        prop_oneof![
            3 => comment_strategy().prop_map(LocalOp::Save),
            1 => (0..4u8).prop_map(|id| LocalOp::Delete(format!("c{id}"))),
        ],
        0..max_len,
    )
}

/// A remote change in a generated inbound stream.
#[derive(Debug, Clone)]
pub struct InboundChange {
    /// Remote payload.
    pub record: Record,
    /// Remote version.
    pub version: u64,
    /// True for a remote deletion.
    pub deleted: bool,
}

/// Strategy for inbound streams over a few comment keys with small,
/// frequently repeated versions.
pub fn inbound_stream_strategy(max_len: usize) -> impl Strategy<Value = Vec<InboundChange>> {
    prop::collection::vec(
        (comment_strategy(), 1..6u64, prop::bool::weighted(0.2)).prop_map(
            |(record, version, deleted)| InboundChange {
                record,
                version,
                deleted,
            },
        ),
        0..max_len,
    )
}
