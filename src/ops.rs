//! Serialized interval forms, wire op payloads, and the ops map the outer
//! container dispatches through.
//!
//! Two collection formats exist: the legacy V1 array (accepted inbound
//! only) and the primary V2 form, which stores the label once and each
//! interval as a compressed `[start, end, seq, type, props, stickiness?]`
//! row with `rangeLabels` stripped and default stickiness omitted.

use std::collections::HashMap;
use std::fmt;

use serde::de::{SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use smartstring::alias::String as SmartString;

use crate::collection::IntervalCollection;
use crate::interval::{Interval, IntervalStickiness, IntervalType};
use crate::properties::PropertySet;
use crate::{LocalSeq, Seq};

/// The sequenced envelope of an inbound op.
#[derive(Debug, Clone)]
pub struct SequencedOp {
    pub sequence_number: Seq,
    pub reference_sequence_number: Seq,
    pub client_id: SmartString,
}

/// A fully specified serialized interval (snapshot rows, add ops).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedInterval {
    pub start: i64,
    pub end: i64,
    pub sequence_number: Seq,
    pub interval_type: IntervalType,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub properties: Option<PropertySet>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub stickiness: Option<IntervalStickiness>,
}

/// A wire op payload. `None` start/end mean "unchanged"; properties beyond
/// `intervalId` mean property change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedIntervalDelta {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub start: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub end: Option<i64>,
    pub sequence_number: Seq,
    pub interval_type: IntervalType,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub properties: Option<PropertySet>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub stickiness: Option<IntervalStickiness>,
}

impl SerializedInterval {
    pub fn to_delta(&self) -> SerializedIntervalDelta {
        SerializedIntervalDelta {
            start: Some(self.start),
            end: Some(self.end),
            sequence_number: self.sequence_number,
            interval_type: self.interval_type,
            properties: self.properties.clone(),
            stickiness: self.stickiness,
        }
    }
}

impl SerializedIntervalDelta {
    /// An "add" payload always carries both endpoints.
    pub fn require_full(&self) -> SerializedInterval {
        let start = self
            .start
            .unwrap_or_else(|| panic!("Internal consistency error: add op without start"));
        let end = self
            .end
            .unwrap_or_else(|| panic!("Internal consistency error: add op without end"));
        SerializedInterval {
            start,
            end,
            sequence_number: self.sequence_number,
            interval_type: self.interval_type,
            properties: self.properties.clone(),
            stickiness: self.stickiness,
        }
    }
}

impl Interval {
    /// Serialize for an op payload or a snapshot row, with current resolved
    /// positions.
    pub fn serialize(&self) -> SerializedInterval {
        let stickiness = self.stickiness();
        SerializedInterval {
            start: self.start_position(),
            end: self.end_position(),
            sequence_number: self.serialization_seq(),
            interval_type: self.interval_type(),
            properties: Some(self.properties_snapshot()),
            stickiness: (stickiness != IntervalStickiness::END).then_some(stickiness),
        }
    }
}

// ---------------------------------------------------------------------
// V2 collection form
// ---------------------------------------------------------------------

pub const COLLECTION_FORMAT_VERSION: u8 = 2;

/// One V2 row: `[start, end, sequenceNumber, intervalType, properties]`
/// with an optional trailing stickiness when it differs from the default.
#[derive(Debug, Clone)]
pub struct CompactSerializedInterval {
    pub start: i64,
    pub end: i64,
    pub sequence_number: Seq,
    pub interval_type: IntervalType,
    pub properties: PropertySet,
    pub stickiness: Option<IntervalStickiness>,
}

impl Serialize for CompactSerializedInterval {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let len = if self.stickiness.is_some() { 6 } else { 5 };
        let mut seq = serializer.serialize_seq(Some(len))?;
        seq.serialize_element(&self.start)?;
        seq.serialize_element(&self.end)?;
        seq.serialize_element(&self.sequence_number)?;
        seq.serialize_element(&self.interval_type)?;
        seq.serialize_element(&self.properties)?;
        if let Some(stickiness) = self.stickiness {
            seq.serialize_element(&stickiness)?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for CompactSerializedInterval {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RowVisitor;

        impl<'de> Visitor<'de> for RowVisitor {
            type Value = CompactSerializedInterval;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a compact serialized interval row")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                use serde::de::Error;
                let start = seq
                    .next_element()?
                    .ok_or_else(|| A::Error::invalid_length(0, &self))?;
                let end = seq
                    .next_element()?
                    .ok_or_else(|| A::Error::invalid_length(1, &self))?;
                let sequence_number = seq
                    .next_element()?
                    .ok_or_else(|| A::Error::invalid_length(2, &self))?;
                let interval_type = seq
                    .next_element()?
                    .ok_or_else(|| A::Error::invalid_length(3, &self))?;
                let properties: Option<PropertySet> = seq.next_element()?;
                let stickiness: Option<IntervalStickiness> = seq.next_element()?;
                Ok(CompactSerializedInterval {
                    start,
                    end,
                    sequence_number,
                    interval_type,
                    properties: properties.unwrap_or_default(),
                    stickiness,
                })
            }
        }

        deserializer.deserialize_seq(RowVisitor)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializedCollectionV2 {
    pub label: SmartString,
    pub version: u8,
    pub intervals: Vec<CompactSerializedInterval>,
}

/// Inbound collection data: the primary V2 object or a legacy V1 array.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SerializedCollection {
    V2(SerializedCollectionV2),
    V1(Vec<SerializedInterval>),
}

// ---------------------------------------------------------------------
// Value factory
// ---------------------------------------------------------------------

/// Produce a detached collection from serialized data. The host attaches
/// it with an op emitter afterwards; attach materializes the intervals.
///
/// V2 rows get `rangeLabels` re-injected and default stickiness restored.
/// The V1 array form carries no label of its own; `label` (the host's map
/// key) is authoritative for both.
pub fn load_collection(
    label: &str,
    client: Option<crate::sequence::SequenceClient>,
    serialized: SerializedCollection,
    options: crate::collection::CollectionOptions,
) -> IntervalCollection {
    let collection = IntervalCollection::new(label, client, options);
    let rows = match serialized {
        SerializedCollection::V1(rows) => rows,
        SerializedCollection::V2(v2) => {
            debug_assert_eq!(v2.label, label, "serialized label mismatch");
            v2.intervals
                .into_iter()
                .map(|row| {
                    let mut properties = row.properties;
                    properties.insert(
                        SmartString::from(crate::properties::RESERVED_RANGE_LABELS_KEY),
                        serde_json::json!([label]),
                    );
                    SerializedInterval {
                        start: row.start,
                        end: row.end,
                        sequence_number: row.sequence_number,
                        interval_type: row.interval_type,
                        properties: Some(properties),
                        stickiness: row.stickiness,
                    }
                })
                .collect()
        }
    };
    collection.load_saved(rows);
    collection
}

/// Produce the stored form of a collection (always V2).
pub fn store_collection(collection: &IntervalCollection) -> SerializedCollectionV2 {
    collection.serialize()
}

// ---------------------------------------------------------------------
// Ops map
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpName {
    Add,
    Delete,
    Change,
}

impl OpName {
    pub fn as_str(self) -> &'static str {
        match self {
            OpName::Add => "add",
            OpName::Delete => "delete",
            OpName::Change => "change",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CollectionOp {
    pub name: OpName,
    pub value: SerializedIntervalDelta,
}

/// Correlates a locally submitted op with its ack.
#[derive(Debug, Clone, Copy)]
pub struct OpMetadata {
    pub local_seq: LocalSeq,
}

pub struct OpHandler {
    pub process: fn(
        &IntervalCollection,
        &SerializedIntervalDelta,
        bool,
        &SequencedOp,
        Option<&OpMetadata>,
    ),
    pub rebase:
        fn(&IntervalCollection, CollectionOp, OpMetadata) -> Option<(CollectionOp, OpMetadata)>,
}

/// The op handlers the outer container registers, keyed by op name.
pub fn ops_map() -> HashMap<OpName, OpHandler> {
    let mut map = HashMap::new();
    map.insert(
        OpName::Add,
        OpHandler {
            process: |collection, value, local, op, metadata| {
                collection.ack_add(value, local, op, metadata);
            },
            rebase: |collection, op, metadata| {
                collection
                    .rebase_local_interval(OpName::Add, &op.value, metadata.local_seq)
                    .map(|value| {
                        (
                            CollectionOp {
                                name: OpName::Add,
                                value,
                            },
                            metadata,
                        )
                    })
            },
        },
    );
    map.insert(
        OpName::Delete,
        OpHandler {
            process: |collection, value, local, op, _metadata| {
                collection.ack_delete(value, local, op);
            },
            // Delete is by id; rebasing is the identity.
            rebase: |_collection, op, metadata| Some((op, metadata)),
        },
    );
    map.insert(
        OpName::Change,
        OpHandler {
            process: |collection, value, local, op, metadata| {
                collection.ack_change(value, local, op, metadata);
            },
            rebase: |collection, op, metadata| {
                collection
                    .rebase_local_interval(OpName::Change, &op.value, metadata.local_seq)
                    .map(|value| {
                        (
                            CollectionOp {
                                name: OpName::Change,
                                value,
                            },
                            metadata,
                        )
                    })
            },
        },
    );
    map
}
