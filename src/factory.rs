//! Factories own one segment of the sycoca file each.  A segment
//! starts with a small header of `i32` offsets (its dictionaries and
//! entry index), which are only known once the segment's records are
//! written: the header is written as zeros first and patched at the
//! end.
//!
//! ```text
//! i32 header[n]          dictionary offsets, index offset, ...
//! records...             each one tagged with its kind
//! u32 count, i32[count]  the entry index, for enumeration
//! dictionaries
//! ```
use std::collections::HashMap;
use std::io::Seek;
use std::io::Write;

use crate::dict::Dict;
use crate::entry::Record;
use crate::error::DecodeError;
use crate::offers::Offer;
use crate::offers::TypeKey;
use crate::stream::DataReader;
use crate::stream::DataWriter;

type Decoded<T> = std::result::Result<T, DecodeError>;

/// Identifies a segment in the global header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FactoryId {
    Service = 1,
    ServiceType = 2,
    ServiceGroup = 3,
    MimeType = 6,
    CTime = 30,
}

impl FactoryId {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<FactoryId> {
        match code {
            1 => Some(FactoryId::Service),
            2 => Some(FactoryId::ServiceType),
            3 => Some(FactoryId::ServiceGroup),
            6 => Some(FactoryId::MimeType),
            30 => Some(FactoryId::CTime),
            _ => None,
        }
    }
}

/// Cross-factory state while writing: later segments refer to
/// records of earlier ones by offset.
#[derive(Debug, Default)]
pub(crate) struct SaveContext {
    /// Offsets of service type and MIME type records, by kind and
    /// name.
    pub type_offsets: HashMap<TypeKey, i32>,
    /// Offsets of service records, by storage id.
    pub service_offsets: HashMap<String, i32>,
    /// The runs of the shared offer list, in write order: one per
    /// service type, then one per MIME type, each sorted best first.
    pub offer_runs: Vec<(TypeKey, Vec<Offer>)>,
}

/// The build side of a factory.
pub(crate) trait BuildFactory {
    const ID: FactoryId;

    /// Writes the factory's segment at the writer's position.
    fn save<W: Write + Seek>(
        &mut self,
        writer: &mut DataWriter<W>,
        ctx: &mut SaveContext,
    ) -> std::io::Result<()>;
}

/// A segment header being written: zeros now, real values in
/// [`SegmentHeader::patch`].
#[derive(Debug)]
pub(crate) struct SegmentHeader {
    start: u64,
    len: usize,
}

impl SegmentHeader {
    pub fn begin<W: Write + Seek>(writer: &mut DataWriter<W>, len: usize) -> std::io::Result<SegmentHeader> {
        let start = writer.position();
        for _ in 0..len {
            writer.write_i32(0)?;
        }

        Ok(SegmentHeader { start, len })
    }

    /// Rewrites the header with `values` and returns to the end of
    /// the segment.
    pub fn patch<W: Write + Seek>(self, writer: &mut DataWriter<W>, values: &[i32]) -> std::io::Result<()> {
        assert_eq!(values.len(), self.len, "header size is fixed");
        let end = writer.position();
        writer.seek_to(self.start)?;
        for value in values {
            writer.write_i32(*value)?;
        }

        writer.seek_to(end)
    }
}

/// Writes the entry index: a count and the record offsets.
pub(crate) fn write_index<W: Write + Seek>(writer: &mut DataWriter<W>, offsets: &[i32]) -> std::io::Result<()> {
    writer.write_u32(offsets.len() as u32)?;
    for offset in offsets {
        writer.write_i32(*offset)?;
    }

    Ok(())
}

/// Read side of a segment: its header, and access to its index and
/// dictionaries.
#[derive(Clone, Debug)]
pub(crate) struct Segment<'a> {
    data: &'a [u8],
    header: Vec<i32>,
}

impl<'a> Segment<'a> {
    pub fn open(data: &'a [u8], offset: i32, len: usize) -> Decoded<Segment<'a>> {
        let mut reader = DataReader::at(data, offset.into())?;
        let mut header = Vec::with_capacity(len);
        for _ in 0..len {
            header.push(reader.read_i32()?);
        }

        Ok(Segment { data, header })
    }

    pub fn field(&self, idx: usize) -> i32 {
        self.header[idx]
    }

    pub fn dict(&self, idx: usize) -> Decoded<Dict<'a>> {
        Dict::read(self.data, self.header[idx])
    }

    pub fn index(&self, idx: usize) -> Decoded<Vec<i32>> {
        let mut reader = DataReader::at(self.data, self.header[idx].into())?;
        let count = reader.read_count(4)?;
        let mut ret = Vec::with_capacity(count);
        for _ in 0..count {
            ret.push(reader.read_i32()?);
        }

        Ok(ret)
    }

    /// Decodes every record listed in the index at `idx`.
    pub fn all<R: Record>(&self, idx: usize) -> Decoded<Vec<R>> {
        self.index(idx)?
            .into_iter()
            .map(|offset| R::decode(self.data, offset))
            .collect()
    }

    /// Looks `key` up in the dictionary at `dict`, and decodes the
    /// record if `matches` confirms it is the right one.
    pub fn lookup<R: Record>(
        &self,
        dict: usize,
        key: &str,
        matches: impl Fn(&R) -> bool,
    ) -> Decoded<Option<R>> {
        let offset = self.dict(dict)?.find(key)?;
        if offset == 0 {
            return Ok(None);
        }

        let record = R::decode(self.data, offset)?;
        Ok(Some(record).filter(|r| matches(r)))
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }
}

#[test]
fn test_factory_ids() {
    for id in [
        FactoryId::Service,
        FactoryId::ServiceType,
        FactoryId::ServiceGroup,
        FactoryId::MimeType,
        FactoryId::CTime,
    ] {
        assert_eq!(FactoryId::from_code(id.code()), Some(id));
    }

    assert_eq!(FactoryId::from_code(0), None);
    assert_eq!(FactoryId::from_code(4), None);
}

#[test]
fn test_segment_header_patch() {
    let mut writer = DataWriter::new(std::io::Cursor::new(Vec::new()));
    writer.write_i32(-1).expect("write must succeed");
    let header = SegmentHeader::begin(&mut writer, 2).expect("begin must succeed");
    let index = writer.offset().expect("offset fits");
    write_index(&mut writer, &[40, 80]).expect("write must succeed");
    header.patch(&mut writer, &[0, index]).expect("patch must succeed");
    writer.write_i32(7).expect("write must succeed");
    let bytes = writer.into_inner().expect("flush").into_inner();

    let segment = Segment::open(&bytes, 4, 2).expect("open must succeed");
    assert_eq!(segment.field(1), 12);
    assert_eq!(segment.index(1), Ok(vec![40, 80]));
    assert_eq!(
        DataReader::at(&bytes, bytes.len() as i64 - 4).and_then(|mut r| r.read_i32()),
        Ok(7)
    );
}
