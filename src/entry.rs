//! Entries are the records stored in a sycoca file.  Every record
//! starts with its kind code and originating path, followed by
//! kind-specific fields; factories decode records of one known kind
//! through [`Record`], while [`Entry`] is the sum over all of them.
use std::io::Seek;
use std::io::Write;

use crate::error::DecodeError;
use crate::mime_type::MimeTypeEntry;
use crate::service::Service;
use crate::service_group::ServiceGroup;
use crate::service_type::ServiceType;
use crate::stream::DataReader;
use crate::stream::DataWriter;

pub(crate) type Decoded<T> = std::result::Result<T, DecodeError>;

/// Type code written at the start of every record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntryKind {
    Service = 1,
    ServiceType = 2,
    MimeType = 3,
    ServiceGroup = 4,
}

impl EntryKind {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<EntryKind> {
        match code {
            1 => Some(EntryKind::Service),
            2 => Some(EntryKind::ServiceType),
            3 => Some(EntryKind::MimeType),
            4 => Some(EntryKind::ServiceGroup),
            _ => None,
        }
    }
}

/// Fields shared by every record.  The offset is 0 until the record
/// is written (or when it was built in memory), and is the record's
/// position in the file once written or decoded.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EntryHeader {
    path: String,
    offset: i32,
}

impl EntryHeader {
    pub fn new(path: impl Into<String>) -> EntryHeader {
        EntryHeader {
            path: path.into(),
            offset: 0,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn offset(&self) -> i32 {
        self.offset
    }
}

/// The per-kind half of the record codec.
pub(crate) trait Record: Sized {
    const KIND: EntryKind;

    fn header(&self) -> &EntryHeader;

    fn header_mut(&mut self) -> &mut EntryHeader;

    /// The key under which the record is indexed by name.
    fn name(&self) -> &str;

    fn encode_fields<W: Write + Seek>(&self, writer: &mut DataWriter<W>) -> std::io::Result<()>;

    fn decode_fields(header: EntryHeader, reader: &mut DataReader) -> Decoded<Self>;

    /// Writes the record at the writer's current position, and
    /// remembers that position as the record's offset.
    fn encode<W: Write + Seek>(&mut self, writer: &mut DataWriter<W>) -> std::io::Result<()> {
        let offset = writer.offset()?;
        // Offset 0 is the "no entry" sentinel everywhere; the global
        // header guarantees no record ever lands there.
        debug_assert!(offset > 0);
        self.header_mut().offset = offset;
        writer.write_i32(Self::KIND.code())?;
        writer.write_string(&self.header().path)?;
        self.encode_fields(writer)
    }

    /// Decodes the record at `offset`.  Fails if the record there is
    /// of another kind.
    fn decode(data: &[u8], offset: i32) -> Decoded<Self> {
        let (kind, header, mut reader) = decode_header(data, offset)?;
        if kind != Self::KIND.code() {
            return Err(DecodeError::BadTag {
                at: offset as usize,
                tag: kind.into(),
            });
        }

        Self::decode_fields(header, &mut reader)
    }
}

fn decode_header(data: &[u8], offset: i32) -> Decoded<(i32, EntryHeader, DataReader)> {
    if offset <= 0 {
        return Err(DecodeError::BadOffset(offset.into()));
    }

    let mut reader = DataReader::at(data, offset.into())?;
    let kind = reader.read_i32()?;
    let path = reader.read_string()?;
    Ok((kind, EntryHeader { path, offset }, reader))
}

/// Any record.
#[derive(Clone, Debug, PartialEq)]
pub enum Entry {
    Service(Service),
    ServiceType(ServiceType),
    MimeType(MimeTypeEntry),
    ServiceGroup(ServiceGroup),
}

impl Entry {
    pub fn kind(&self) -> EntryKind {
        match self {
            Entry::Service(_) => EntryKind::Service,
            Entry::ServiceType(_) => EntryKind::ServiceType,
            Entry::MimeType(_) => EntryKind::MimeType,
            Entry::ServiceGroup(_) => EntryKind::ServiceGroup,
        }
    }

    pub fn is_kind(&self, kind: EntryKind) -> bool {
        self.kind() == kind
    }

    fn header(&self) -> &EntryHeader {
        match self {
            Entry::Service(e) => e.header(),
            Entry::ServiceType(e) => e.header(),
            Entry::MimeType(e) => e.header(),
            Entry::ServiceGroup(e) => e.header(),
        }
    }

    pub fn path(&self) -> &str {
        self.header().path()
    }

    pub fn offset(&self) -> i32 {
        self.header().offset()
    }

    pub fn name(&self) -> &str {
        match self {
            Entry::Service(e) => Record::name(e),
            Entry::ServiceType(e) => Record::name(e),
            Entry::MimeType(e) => Record::name(e),
            Entry::ServiceGroup(e) => Record::name(e),
        }
    }

    /// Services are identified by their storage id; every other kind
    /// by its path.
    pub fn storage_id(&self) -> &str {
        match self {
            Entry::Service(e) => e.storage_id(),
            other => other.path(),
        }
    }

    #[cfg(test)]
    fn encode<W: Write + Seek>(&mut self, writer: &mut DataWriter<W>) -> std::io::Result<()> {
        match self {
            Entry::Service(e) => e.encode(writer),
            Entry::ServiceType(e) => e.encode(writer),
            Entry::MimeType(e) => e.encode(writer),
            Entry::ServiceGroup(e) => e.encode(writer),
        }
    }

    /// Decodes whatever record lives at `offset`.
    pub(crate) fn decode(data: &[u8], offset: i32) -> Decoded<Entry> {
        let (kind, header, mut reader) = decode_header(data, offset)?;
        let reader = &mut reader;
        match EntryKind::from_code(kind) {
            Some(EntryKind::Service) => Service::decode_fields(header, reader).map(Entry::Service),
            Some(EntryKind::ServiceType) => {
                ServiceType::decode_fields(header, reader).map(Entry::ServiceType)
            }
            Some(EntryKind::MimeType) => {
                MimeTypeEntry::decode_fields(header, reader).map(Entry::MimeType)
            }
            Some(EntryKind::ServiceGroup) => {
                ServiceGroup::decode_fields(header, reader).map(Entry::ServiceGroup)
            }
            None => Err(DecodeError::BadTag {
                at: offset as usize,
                tag: kind.into(),
            }),
        }
    }
}

#[cfg(test)]
fn encoded(entry: &mut Entry) -> Vec<u8> {
    let mut writer = DataWriter::new(std::io::Cursor::new(Vec::new()));
    // Records never start at offset 0.
    writer.write_i32(0).expect("write must succeed");
    entry.encode(&mut writer).expect("encode must succeed");
    writer
        .into_inner()
        .expect("flush must succeed")
        .into_inner()
}

#[test]
fn test_kind_codes() {
    for kind in [
        EntryKind::Service,
        EntryKind::ServiceType,
        EntryKind::MimeType,
        EntryKind::ServiceGroup,
    ] {
        assert_eq!(EntryKind::from_code(kind.code()), Some(kind));
    }

    assert_eq!(EntryKind::from_code(0), None);
    assert_eq!(EntryKind::from_code(30), None);
}

#[test]
fn test_decode_any_kind() {
    let mut entry = Entry::MimeType(MimeTypeEntry::new("text/plain", 32));
    let bytes = encoded(&mut entry);
    assert_eq!(entry.offset(), 4);

    let decoded = Entry::decode(&bytes, 4).expect("decode must succeed");
    assert_eq!(decoded, entry);
    assert!(decoded.is_kind(EntryKind::MimeType));
    assert_eq!(decoded.name(), "text/plain");
    assert_eq!(decoded.storage_id(), "text/plain");

    // Decoding as the wrong kind fails rather than misinterpreting.
    assert!(matches!(
        ServiceType::decode(&bytes, 4),
        Err(DecodeError::BadTag { at: 4, tag: 3 })
    ));
    assert_eq!(
        Entry::decode(&bytes, 0),
        Err(DecodeError::BadOffset(0))
    );
}

/// Corrupt records are reported, never panics.
#[test]
fn test_decode_truncated() {
    let mut entry = Entry::MimeType(MimeTypeEntry::new("text/plain", -1));
    let bytes = encoded(&mut entry);

    for len in 4..bytes.len() {
        assert!(Entry::decode(&bytes[..len], 4).is_err());
    }

    let mut corrupt = bytes.clone();
    corrupt[7] = 99;
    assert!(matches!(
        Entry::decode(&corrupt, 4),
        Err(DecodeError::BadTag { tag: 99, .. })
    ));
}
