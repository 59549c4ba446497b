//! Binary wire format for the records exchanged between passes.
//!
//! ## Record layout (big-endian)
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ has_vector: u8 (1 = vector branch, 0 = preference pair)  │
//! │                                                          │
//! │ vector branch                                            │
//! │   count:   i32 (stored entries)                          │
//! │   entries: count × { index: u32, value: f32 }            │
//! │            in insertion order                            │
//! │                                                          │
//! │ preference branch                                        │
//! │   user_id: i64                                           │
//! │   value:   f32                                           │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Canopy record layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ key    id:           u64                                 │
//! │ value  t1:           f64                                 │
//! │        t2:           f64                                 │
//! │        point_count:  i64                                 │
//! │        member_count: i32                                 │
//! │        members:      member_count × u64                  │
//! │        centroid:     Record (vector branch)              │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Record streams on disk are framed as `len: i32` followed by `len` bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeSet;
use std::ops::Deref;
use std::path::Path;

use crate::canopy::Canopy;
use crate::vector::SparseVector;
use crate::{CanopyError, Result};

const VECTOR_TAG: u8 = 1;
const PREFERENCE_TAG: u8 = 0;

/// Vector payload of a [`Record`].
///
/// Values are rounded to `f32` when the payload is built, so a record holds
/// exactly what its encoding carries and `decode(encode(r)) == r`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WireVector(SparseVector);

impl WireVector {
    pub fn new(vector: &SparseVector) -> Self {
        Self(
            vector
                .iter()
                .map(|(index, value)| (index, f64::from(value as f32)))
                .collect(),
        )
    }

    pub fn as_sparse(&self) -> &SparseVector {
        &self.0
    }

    pub fn into_sparse(self) -> SparseVector {
        self.0
    }
}

impl Deref for WireVector {
    type Target = SparseVector;

    fn deref(&self) -> &SparseVector {
        &self.0
    }
}

impl From<SparseVector> for WireVector {
    fn from(vector: SparseVector) -> Self {
        Self::new(&vector)
    }
}

impl From<Vec<(u32, f64)>> for WireVector {
    fn from(entries: Vec<(u32, f64)>) -> Self {
        Self::new(&SparseVector::from(entries))
    }
}

/// A payload flowing between stages: a sparse vector or a user preference.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Vector(WireVector),
    Preference { user_id: i64, value: f32 },
}

impl Record {
    /// The vector branch, if this record carries one.
    pub fn as_vector(&self) -> Option<&SparseVector> {
        match self {
            Record::Vector(vector) => Some(vector.as_sparse()),
            Record::Preference { .. } => None,
        }
    }

    pub fn into_vector(self) -> Option<SparseVector> {
        match self {
            Record::Vector(vector) => Some(vector.into_sparse()),
            Record::Preference { .. } => None,
        }
    }
}

/// Encode a record into a fresh buffer.
pub fn encode(record: &Record) -> Bytes {
    let mut buf = BytesMut::with_capacity(encoded_len(record));
    encode_into(record, &mut buf);
    buf.freeze()
}

/// Append the encoding of `record` to `buf`.
pub fn encode_into<B: BufMut>(record: &Record, buf: &mut B) {
    match record {
        Record::Vector(vector) => encode_vector(vector, buf),
        Record::Preference { user_id, value } => {
            buf.put_u8(PREFERENCE_TAG);
            buf.put_i64(*user_id);
            buf.put_f32(*value);
        }
    }
}

/// Encode the vector branch without wrapping the vector in a [`Record`].
///
/// Values are narrowed to `f32`.
pub fn encode_vector<B: BufMut>(vector: &SparseVector, buf: &mut B) {
    debug_assert!(vector.len() <= i32::MAX as usize);
    buf.put_u8(VECTOR_TAG);
    buf.put_i32(vector.len() as i32);
    for (index, value) in vector.iter() {
        buf.put_u32(index);
        buf.put_f32(value as f32);
    }
}

fn encoded_len(record: &Record) -> usize {
    match record {
        Record::Vector(vector) => 1 + 4 + vector.len() * 8,
        Record::Preference { .. } => 1 + 8 + 4,
    }
}

/// Decode exactly one record; trailing bytes are rejected.
pub fn decode(bytes: &[u8]) -> Result<Record> {
    let mut buf = bytes;
    let record = decode_from(&mut buf)?;
    if buf.has_remaining() {
        return Err(CanopyError::MalformedRecord(format!(
            "{} trailing bytes after record",
            buf.remaining()
        )));
    }
    Ok(record)
}

/// Decode one record from the front of `buf`, advancing past it.
pub fn decode_from<B: Buf>(buf: &mut B) -> Result<Record> {
    require(&*buf, 1, "discriminator")?;
    match buf.get_u8() {
        VECTOR_TAG => {
            let vector = decode_vector_body(buf)?;
            Ok(Record::Vector(WireVector(vector)))
        }
        PREFERENCE_TAG => {
            require(&*buf, 12, "preference pair")?;
            let user_id = buf.get_i64();
            let value = buf.get_f32();
            Ok(Record::Preference { user_id, value })
        }
        other => Err(CanopyError::MalformedRecord(format!(
            "invalid discriminator byte {other:#04x}"
        ))),
    }
}

fn decode_vector_body<B: Buf>(buf: &mut B) -> Result<SparseVector> {
    require(&*buf, 4, "dimension count")?;
    let count = buf.get_i32();
    if count < 0 {
        return Err(CanopyError::MalformedRecord(format!(
            "negative dimension count {count}"
        )));
    }
    let count = count as usize;
    // Checked before allocating.
    require(&*buf, count * 8, "vector entries")?;
    let mut vector = SparseVector::with_capacity(count);
    for _ in 0..count {
        let index = buf.get_u32();
        let value = buf.get_f32();
        if vector.contains(index) {
            return Err(CanopyError::MalformedRecord(format!(
                "duplicate vector index {index}"
            )));
        }
        vector.set(index, f64::from(value));
    }
    Ok(vector)
}

fn require<B: Buf>(buf: &B, needed: usize, what: &str) -> Result<()> {
    if buf.remaining() < needed {
        return Err(CanopyError::MalformedRecord(format!(
            "truncated {what}: need {needed} bytes, have {}",
            buf.remaining()
        )));
    }
    Ok(())
}

/// Encode a canopy as an inter-pass snapshot record.
pub fn encode_canopy(canopy: &Canopy) -> Bytes {
    let members = canopy.members();
    let centroid_len = 1 + 4 + canopy.centroid().len() * 8;
    let mut buf = BytesMut::with_capacity(36 + members.len() * 8 + centroid_len);
    buf.put_u64(canopy.id());
    buf.put_f64(canopy.t1());
    buf.put_f64(canopy.t2());
    buf.put_i64(canopy.point_count() as i64);
    buf.put_i32(members.len() as i32);
    for &member in members {
        buf.put_u64(member);
    }
    encode_vector(canopy.centroid(), &mut buf);
    buf.freeze()
}

/// Decode a canopy snapshot record. The restored canopy has no prior centroid.
pub fn decode_canopy(bytes: &[u8]) -> Result<Canopy> {
    let mut buf = bytes;
    require(&buf, 8 + 8 + 8 + 8 + 4, "canopy header")?;
    let id = buf.get_u64();
    let t1 = buf.get_f64();
    let t2 = buf.get_f64();
    if !(t1.is_finite() && t2.is_finite()) {
        return Err(CanopyError::MalformedRecord(format!(
            "canopy {id} has non-finite radii ({t1}, {t2})"
        )));
    }
    let point_count = buf.get_i64();
    if point_count < 0 {
        return Err(CanopyError::MalformedRecord(format!(
            "canopy {id} has negative point count {point_count}"
        )));
    }
    let member_count = buf.get_i32();
    if member_count < 0 {
        return Err(CanopyError::MalformedRecord(format!(
            "canopy {id} has negative member count {member_count}"
        )));
    }
    require(&buf, member_count as usize * 8, "canopy members")?;
    let members: BTreeSet<u64> = (0..member_count).map(|_| buf.get_u64()).collect();
    let centroid = match decode(buf)? {
        Record::Vector(vector) => vector.into_sparse(),
        Record::Preference { .. } => {
            return Err(CanopyError::MalformedRecord(format!(
                "canopy {id} centroid is a preference pair"
            )))
        }
    };
    if !centroid.is_finite() {
        return Err(CanopyError::MalformedRecord(format!(
            "canopy {id} centroid has non-finite components"
        )));
    }
    Ok(Canopy::restore(id, centroid, t1, t2, point_count as u64, members))
}

/// Frame records as a length-prefixed stream.
pub fn frame(records: &[Bytes]) -> Bytes {
    let total: usize = records.iter().map(|r| 4 + r.len()).sum();
    let mut buf = BytesMut::with_capacity(total);
    for record in records {
        debug_assert!(record.len() <= i32::MAX as usize);
        buf.put_i32(record.len() as i32);
        buf.put_slice(record);
    }
    buf.freeze()
}

/// Split a length-prefixed stream back into records without copying.
pub fn unframe(mut data: Bytes) -> Result<Vec<Bytes>> {
    let mut records = Vec::new();
    while data.has_remaining() {
        require(&data, 4, "frame length")?;
        let len = data.get_i32();
        if len < 0 {
            return Err(CanopyError::MalformedRecord(format!(
                "negative frame length {len}"
            )));
        }
        require(&data, len as usize, "frame body")?;
        records.push(data.split_to(len as usize));
    }
    Ok(records)
}

/// Write a framed record stream to `path`.
pub fn write_stream<P: AsRef<Path>>(path: P, records: &[Bytes]) -> Result<()> {
    std::fs::write(path, frame(records))?;
    Ok(())
}

/// Read a framed record stream from `path`.
pub fn read_stream<P: AsRef<Path>>(path: P) -> Result<Vec<Bytes>> {
    let data = std::fs::read(path)?;
    unframe(Bytes::from(data))
}
