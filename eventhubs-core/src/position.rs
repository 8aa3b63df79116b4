//! Starting points in an event hub partition. An [EventPosition] is fixed when the job is
//! configured and is only consulted when the ledger has no progress for a partition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::partition::SequenceNumber;

/// Offset that denotes the first event still retained in a partition.
pub const START_OF_STREAM: &str = "-1";

/// Offset that denotes the end of a partition, i.e. only events enqueued after the job starts.
pub const END_OF_STREAM: &str = "@latest";

/// Describes where to start reading a partition. Exactly one of offset, sequence number or enqueued
/// time is set by the constructors; equality is structural over all four fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawEventPosition", into = "RawEventPosition")]
pub struct EventPosition {
    offset: Option<String>,
    sequence_number: Option<SequenceNumber>,
    enqueued_time: Option<DateTime<Utc>>,
    inclusive: bool,
}

/// The single tag of an [EventPosition] the client has to honour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedPosition {
    Offset {
        offset: String,
        inclusive: bool,
    },
    SequenceNumber {
        sequence_number: SequenceNumber,
        inclusive: bool,
    },
    EnqueuedTime(DateTime<Utc>),
}

impl EventPosition {
    pub fn from_offset(offset: impl Into<String>, inclusive: bool) -> Self {
        Self {
            offset: Some(offset.into()),
            sequence_number: None,
            enqueued_time: None,
            inclusive,
        }
    }

    /// Fails with [Error::InvalidArgument] if `sequence_number` is negative.
    pub fn from_sequence_number(sequence_number: SequenceNumber, inclusive: bool) -> Result<Self> {
        if sequence_number < 0 {
            return Err(Error::InvalidArgument(format!(
                "sequence number must be non-negative, got {sequence_number}"
            )));
        }
        Ok(Self {
            offset: None,
            sequence_number: Some(sequence_number),
            enqueued_time: None,
            inclusive,
        })
    }

    pub fn from_enqueued_time(enqueued_time: DateTime<Utc>) -> Self {
        Self {
            offset: None,
            sequence_number: None,
            enqueued_time: Some(enqueued_time),
            inclusive: false,
        }
    }

    pub fn from_start_of_stream() -> Self {
        Self::from_offset(START_OF_STREAM, false)
    }

    pub fn from_end_of_stream() -> Self {
        Self::from_offset(END_OF_STREAM, false)
    }

    pub fn offset(&self) -> Option<&str> {
        self.offset.as_deref()
    }

    pub fn sequence_number(&self) -> Option<SequenceNumber> {
        self.sequence_number
    }

    pub fn enqueued_time(&self) -> Option<DateTime<Utc>> {
        self.enqueued_time
    }

    pub fn is_inclusive(&self) -> bool {
        self.inclusive
    }

    /// Picks the tag the client should use: offset first, then sequence number, then enqueued
    /// time.
    pub fn resolve(&self) -> Result<ResolvedPosition> {
        if let Some(offset) = &self.offset {
            return Ok(ResolvedPosition::Offset {
                offset: offset.clone(),
                inclusive: self.inclusive,
            });
        }
        if let Some(sequence_number) = self.sequence_number.filter(|n| *n >= 0) {
            return Ok(ResolvedPosition::SequenceNumber {
                sequence_number,
                inclusive: self.inclusive,
            });
        }
        if let Some(enqueued_time) = self.enqueued_time {
            return Ok(ResolvedPosition::EnqueuedTime(enqueued_time));
        }
        Err(Error::UnresolvedPosition)
    }
}

impl ResolvedPosition {
    /// Progress implied by this position when it can be computed without asking the event hub,
    /// which is only the case for sequence numbers.
    pub fn local_progress(&self) -> Option<SequenceNumber> {
        match self {
            ResolvedPosition::SequenceNumber {
                sequence_number,
                inclusive: true,
            } => Some(sequence_number - 1),
            ResolvedPosition::SequenceNumber {
                sequence_number,
                inclusive: false,
            } => Some(*sequence_number),
            _ => None,
        }
    }
}

/// Wire form of [EventPosition] used in configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEventPosition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    offset: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sequence_number: Option<SequenceNumber>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    enqueued_time: Option<DateTime<Utc>>,
    #[serde(default)]
    inclusive: bool,
}

impl TryFrom<RawEventPosition> for EventPosition {
    type Error = Error;

    // An empty position is accepted here and reported as unresolved when it is used.
    fn try_from(raw: RawEventPosition) -> Result<Self> {
        let tags = usize::from(raw.offset.is_some())
            + usize::from(raw.sequence_number.is_some())
            + usize::from(raw.enqueued_time.is_some());
        if tags > 1 {
            return Err(Error::InvalidArgument(format!(
                "event position must set exactly one of offset, sequenceNumber or enqueuedTime, got {raw:?}"
            )));
        }
        if let Some(n) = raw.sequence_number.filter(|n| *n < 0) {
            return Err(Error::InvalidArgument(format!(
                "sequence number must be non-negative, got {n}"
            )));
        }
        Ok(Self {
            offset: raw.offset,
            sequence_number: raw.sequence_number,
            enqueued_time: raw.enqueued_time,
            inclusive: raw.inclusive,
        })
    }
}

impl From<EventPosition> for RawEventPosition {
    fn from(position: EventPosition) -> Self {
        Self {
            offset: position.offset,
            sequence_number: position.sequence_number,
            enqueued_time: position.enqueued_time,
            inclusive: position.inclusive,
        }
    }
}
