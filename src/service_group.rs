use std::io::Seek;
use std::io::Write;

use crate::entry::Decoded;
use crate::entry::EntryHeader;
use crate::entry::EntryKind;
use crate::entry::Record;
use crate::error::DecodeError;
use crate::stream::DataReader;
use crate::stream::DataWriter;

/// One item of a menu, in layout order.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum GroupChild {
    /// A service, by storage id.
    Service(String),
    /// A sub-menu, by relative path (`"Graphics/"`).
    Group(String),
    Separator,
}

/// A menu node.  The root group has the empty relative path, the
/// others are `"Name/"`, `"Name/Sub/"` and so on.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServiceGroup {
    header: EntryHeader,
    pub caption: String,
    pub icon: String,
    pub comment: String,
    /// Alias from `X-KDE-BaseGroup`, for lookups independent of the
    /// menu layout.
    pub base_group_name: String,
    pub no_display: bool,
    pub deleted: bool,
    pub show_empty: bool,
    pub inline: bool,
    pub inline_header: bool,
    pub inline_alias: bool,
    pub inline_limit: i32,
    /// The `.directory` file the caption and icon come from.
    pub directory_file: String,
    pub children: Vec<GroupChild>,
    /// Number of visible services in the group and its sub-groups.
    pub child_count: i32,
}

impl ServiceGroup {
    pub fn new(rel_path: impl Into<String>) -> ServiceGroup {
        ServiceGroup {
            header: EntryHeader::new(rel_path),
            ..Default::default()
        }
    }

    pub fn rel_path(&self) -> &str {
        self.header.path()
    }

    pub fn offset(&self) -> i32 {
        self.header.offset()
    }

    pub fn is_root(&self) -> bool {
        self.header.path().is_empty()
    }
}

impl Record for ServiceGroup {
    const KIND: EntryKind = EntryKind::ServiceGroup;

    fn header(&self) -> &EntryHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut EntryHeader {
        &mut self.header
    }

    fn name(&self) -> &str {
        &self.caption
    }

    fn encode_fields<W: Write + Seek>(&self, w: &mut DataWriter<W>) -> std::io::Result<()> {
        w.write_string(&self.caption)?;
        w.write_string(&self.icon)?;
        w.write_string(&self.comment)?;
        w.write_string(&self.base_group_name)?;
        w.write_bool(self.no_display)?;
        w.write_bool(self.deleted)?;
        w.write_bool(self.show_empty)?;
        w.write_bool(self.inline)?;
        w.write_bool(self.inline_header)?;
        w.write_bool(self.inline_alias)?;
        w.write_i32(self.inline_limit)?;
        w.write_string(&self.directory_file)?;
        w.write_i32(self.child_count)?;

        w.write_u32(self.children.len() as u32)?;
        for child in &self.children {
            match child {
                GroupChild::Service(id) => {
                    w.write_u8(1)?;
                    w.write_string(id)?;
                }
                GroupChild::Group(rel_path) => {
                    w.write_u8(2)?;
                    w.write_string(rel_path)?;
                }
                GroupChild::Separator => w.write_u8(3)?,
            }
        }

        Ok(())
    }

    fn decode_fields(header: EntryHeader, r: &mut DataReader) -> Decoded<Self> {
        let mut ret = ServiceGroup {
            header,
            caption: r.read_string()?,
            icon: r.read_string()?,
            comment: r.read_string()?,
            base_group_name: r.read_string()?,
            no_display: r.read_bool()?,
            deleted: r.read_bool()?,
            show_empty: r.read_bool()?,
            inline: r.read_bool()?,
            inline_header: r.read_bool()?,
            inline_alias: r.read_bool()?,
            inline_limit: r.read_i32()?,
            directory_file: r.read_string()?,
            child_count: r.read_i32()?,
            children: Vec::new(),
        };

        let count = r.read_count(1)?;
        ret.children.reserve(count);
        for _ in 0..count {
            let at = r.position();
            let child = match r.read_u8()? {
                1 => GroupChild::Service(r.read_string()?),
                2 => GroupChild::Group(r.read_string()?),
                3 => GroupChild::Separator,
                tag => {
                    return Err(DecodeError::BadTag {
                        at,
                        tag: tag.into(),
                    })
                }
            };
            ret.children.push(child);
        }

        Ok(ret)
    }
}

#[test]
fn test_encode_decode() {
    let mut group = ServiceGroup::new("Graphics/");
    group.caption = "Graphics".into();
    group.base_group_name = "graphics".into();
    group.children = vec![
        GroupChild::Group("Graphics/Scanners/".into()),
        GroupChild::Separator,
        GroupChild::Service("gimp.desktop".into()),
    ];
    group.child_count = 2;

    let mut writer = DataWriter::new(std::io::Cursor::new(Vec::new()));
    writer.write_i32(0).expect("write must succeed");
    group.encode(&mut writer).expect("encode must succeed");
    let bytes = writer.into_inner().expect("flush").into_inner();

    let decoded = ServiceGroup::decode(&bytes, 4).expect("decode must succeed");
    assert_eq!(decoded, group);
    assert!(!decoded.is_root());
    assert!(ServiceGroup::new("").is_root());

    // An unknown child tag is corruption.
    let mut corrupt = bytes.clone();
    let last_tag = bytes.len() - 4 - "gimp.desktop".len() - 1;
    corrupt[last_tag] = 9;
    assert!(matches!(
        ServiceGroup::decode(&corrupt, 4),
        Err(DecodeError::BadTag { tag: 9, .. })
    ));
}
