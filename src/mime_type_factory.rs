use std::collections::BTreeMap;
use std::io::Seek;
use std::io::Write;

use crate::dict::DictBuilder;
use crate::entry::EntryKind;
use crate::entry::Record;
use crate::error::DecodeError;
use crate::factory::write_index;
use crate::factory::BuildFactory;
use crate::factory::FactoryId;
use crate::factory::SaveContext;
use crate::factory::Segment;
use crate::factory::SegmentHeader;
use crate::mime_db::MimeDatabase;
use crate::mime_type::MimeTypeEntry;
use crate::stream::DataWriter;

const DICT: usize = 0;
const INDEX: usize = 1;
const HEADER_LEN: usize = 2;

/// MIME type stubs, one per known type, sorted by name.
#[derive(Clone, Debug, Default)]
pub struct MimeTypeFactory {
    entries: BTreeMap<String, MimeTypeEntry>,
}

impl MimeTypeFactory {
    /// Creates a stub for every type in `db`.
    pub fn from_database(db: &MimeDatabase) -> MimeTypeFactory {
        let entries = db
            .all_types()
            .map(|name| (name.to_string(), MimeTypeEntry::new(name, -1)))
            .collect();
        MimeTypeFactory { entries }
    }

    /// Ensures a stub exists for `name`.  Used for the scheme handler
    /// pseudo types, which no package file defines.
    pub fn add_stub(&mut self, name: &str) {
        self.entries
            .entry(name.to_string())
            .or_insert_with(|| MimeTypeEntry::new(name, -1));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub(crate) fn entries_mut(&mut self) -> impl Iterator<Item = &mut MimeTypeEntry> {
        self.entries.values_mut()
    }
}

impl BuildFactory for MimeTypeFactory {
    const ID: FactoryId = FactoryId::MimeType;

    fn save<W: Write + Seek>(
        &mut self,
        writer: &mut DataWriter<W>,
        ctx: &mut SaveContext,
    ) -> std::io::Result<()> {
        let header = SegmentHeader::begin(writer, HEADER_LEN)?;
        let mut dict = DictBuilder::new();
        let mut offsets = Vec::with_capacity(self.entries.len());

        for (name, entry) in self.entries.iter_mut() {
            entry.encode(writer)?;
            offsets.push(entry.offset());
            dict.add(name.clone(), entry.offset());
            ctx.type_offsets
                .insert((EntryKind::MimeType, name.clone()), entry.offset());
        }

        let index = writer.offset()?;
        write_index(writer, &offsets)?;
        let dict_offset = writer.offset()?;
        dict.save(writer)?;

        let mut values = [0; HEADER_LEN];
        values[DICT] = dict_offset;
        values[INDEX] = index;
        header.patch(writer, &values)
    }
}

/// Read side: MIME type stubs in a sycoca file.
#[derive(Clone, Debug)]
pub struct MimeTypeIndex<'a> {
    segment: Segment<'a>,
}

impl<'a> MimeTypeIndex<'a> {
    pub(crate) fn open(data: &'a [u8], offset: i32) -> Result<MimeTypeIndex<'a>, DecodeError> {
        Ok(MimeTypeIndex {
            segment: Segment::open(data, offset, HEADER_LEN)?,
        })
    }

    pub fn find(&self, name: &str) -> Result<Option<MimeTypeEntry>, DecodeError> {
        self.segment
            .lookup(DICT, name, |entry: &MimeTypeEntry| entry.name() == name)
    }

    pub fn all(&self) -> Result<Vec<MimeTypeEntry>, DecodeError> {
        self.segment.all(INDEX)
    }
}

#[test]
fn test_stubs() {
    let mut db = MimeDatabase::new();
    db.add_type("text/plain", vec![]);
    db.add_type("image/png", vec![]);

    let mut factory = MimeTypeFactory::from_database(&db);
    factory.add_stub("x-scheme-handler/http");
    factory.add_stub("text/plain");
    assert!(factory.contains("x-scheme-handler/http"));
    assert_eq!(
        factory.names().collect::<Vec<_>>(),
        vec!["image/png", "text/plain", "x-scheme-handler/http"]
    );

    for entry in factory.entries_mut() {
        if entry.name() == "text/plain" {
            entry.set_offers_offset(16);
        }
    }

    let mut writer = DataWriter::new(std::io::Cursor::new(Vec::new()));
    writer.write_i32(0).expect("write must succeed");
    let mut ctx = SaveContext::default();
    factory.save(&mut writer, &mut ctx).expect("save must succeed");
    let bytes = writer.into_inner().expect("flush").into_inner();

    let index = MimeTypeIndex::open(&bytes, 4).expect("open must succeed");
    let plain = index
        .find("text/plain")
        .expect("find must succeed")
        .expect("type must exist");
    assert_eq!(plain.offers_offset(), 16);
    assert_eq!(ctx.type_offsets.len(), 3);
    assert_eq!(index.find("text/html"), Ok(None));
    assert_eq!(index.all().expect("all must succeed").len(), 3);
}
