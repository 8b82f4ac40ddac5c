use std::io::Seek;
use std::io::Write;

use crate::entry::Decoded;
use crate::entry::EntryHeader;
use crate::entry::EntryKind;
use crate::entry::Record;
use crate::stream::DataReader;
use crate::stream::DataWriter;

/// A MIME type stub: the name, and where its offers start in the
/// shared offer list.  Everything else about MIME types lives in the
/// shared-mime-info database.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MimeTypeEntry {
    header: EntryHeader,
    offers_offset: i32,
}

impl MimeTypeEntry {
    pub fn new(name: impl Into<String>, offers_offset: i32) -> MimeTypeEntry {
        MimeTypeEntry {
            header: EntryHeader::new(name),
            offers_offset,
        }
    }

    pub fn name(&self) -> &str {
        self.header.path()
    }

    pub fn offset(&self) -> i32 {
        self.header.offset()
    }

    /// Offset of the first offer relative to the start of the offer
    /// list, or -1 when no service handles this type.
    pub fn offers_offset(&self) -> i32 {
        self.offers_offset
    }

    pub(crate) fn set_offers_offset(&mut self, offset: i32) {
        self.offers_offset = offset;
    }
}

impl Record for MimeTypeEntry {
    const KIND: EntryKind = EntryKind::MimeType;

    fn header(&self) -> &EntryHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut EntryHeader {
        &mut self.header
    }

    fn name(&self) -> &str {
        self.header.path()
    }

    fn encode_fields<W: Write + Seek>(&self, writer: &mut DataWriter<W>) -> std::io::Result<()> {
        writer.write_i32(self.offers_offset)
    }

    fn decode_fields(header: EntryHeader, reader: &mut DataReader) -> Decoded<Self> {
        Ok(MimeTypeEntry {
            header,
            offers_offset: reader.read_i32()?,
        })
    }
}
