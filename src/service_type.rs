use std::collections::BTreeMap;
use std::io::Seek;
use std::io::Write;

use crate::desktop_file::DesktopFile;
use crate::entry::Decoded;
use crate::entry::EntryHeader;
use crate::entry::EntryKind;
use crate::entry::Record;
use crate::property::PropertyType;
use crate::stream::DataReader;
use crate::stream::DataWriter;

/// Prefix of the groups that declare typed custom properties.
const PROPERTY_DEF_PREFIX: &str = "PropertyDef::";

/// A named capability category that services declare, such as
/// `Application` or `KParts/ReadOnlyPart`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceType {
    header: EntryHeader,
    pub name: String,
    pub comment: String,
    /// The service type this one derives from (`X-KDE-Derived`).
    pub parent: Option<String>,
    pub property_defs: BTreeMap<String, PropertyType>,
    offers_offset: i32,
}

impl ServiceType {
    /// Creates a service type that no file declares, such as the
    /// implicit `Application` type.
    pub fn new(path: impl Into<String>, name: impl Into<String>) -> ServiceType {
        ServiceType {
            header: EntryHeader::new(path),
            name: name.into(),
            comment: String::new(),
            parent: None,
            property_defs: BTreeMap::new(),
            offers_offset: -1,
        }
    }

    /// Creates a service type from its definition file, or returns
    /// `None` if the file does not define one.
    pub fn from_desktop_file(path: &str, file: &DesktopFile, lang: &str) -> Option<ServiceType> {
        let group = file.desktop_group()?;
        let name = group
            .get("X-KDE-ServiceType")
            .filter(|name| !name.is_empty())?;

        let mut ret = ServiceType::new(path, name);
        ret.comment = group.localized("Comment", lang).unwrap_or_default();
        ret.parent = group.get("X-KDE-Derived").filter(|p| !p.is_empty());

        for def in file.groups() {
            let key = match def.name().strip_prefix(PROPERTY_DEF_PREFIX) {
                Some(key) => key,
                None => continue,
            };

            match def.get("Type").as_deref().and_then(PropertyType::from_name) {
                Some(ty) => {
                    ret.property_defs.insert(key.to_string(), ty);
                }
                None => tracing::debug!(
                    target: "sycoca",
                    path,
                    property = key,
                    "ignoring property definition with unknown type"
                ),
            }
        }

        Some(ret)
    }

    pub fn path(&self) -> &str {
        self.header.path()
    }

    pub fn offset(&self) -> i32 {
        self.header.offset()
    }

    /// See [`crate::MimeTypeEntry::offers_offset`].
    pub fn offers_offset(&self) -> i32 {
        self.offers_offset
    }

    pub(crate) fn set_offers_offset(&mut self, offset: i32) {
        self.offers_offset = offset;
    }
}

impl Record for ServiceType {
    const KIND: EntryKind = EntryKind::ServiceType;

    fn header(&self) -> &EntryHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut EntryHeader {
        &mut self.header
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn encode_fields<W: Write + Seek>(&self, writer: &mut DataWriter<W>) -> std::io::Result<()> {
        writer.write_string(&self.name)?;
        writer.write_string(&self.comment)?;
        writer.write_string(self.parent.as_deref().unwrap_or(""))?;
        writer.write_property_defs(&self.property_defs)?;
        writer.write_i32(self.offers_offset)
    }

    fn decode_fields(header: EntryHeader, reader: &mut DataReader) -> Decoded<Self> {
        let name = reader.read_string()?;
        let comment = reader.read_string()?;
        let parent = Some(reader.read_string()?).filter(|p| !p.is_empty());
        let property_defs = reader.read_property_defs()?;
        let offers_offset = reader.read_i32()?;

        Ok(ServiceType {
            header,
            name,
            comment,
            parent,
            property_defs,
            offers_offset,
        })
    }
}

#[test]
fn test_from_desktop_file() {
    let file = DesktopFile::parse(
        "[Desktop Entry]\n\
         Type=ServiceType\n\
         X-KDE-ServiceType=KParts/ReadOnlyPart\n\
         X-KDE-Derived=KParts/Part\n\
         Comment=Read-only part\n\
         Comment[fr]=Composant\n\
         [PropertyDef::X-KDE-BrowserView-Args]\n\
         Type=QString\n\
         [PropertyDef::X-KDE-Version]\n\
         Type=int\n\
         [PropertyDef::X-Bogus]\n\
         Type=QVariantMap\n",
    );

    let ty = ServiceType::from_desktop_file("kparts/readonlypart.desktop", &file, "fr_FR")
        .expect("file defines a service type");
    assert_eq!(ty.name, "KParts/ReadOnlyPart");
    assert_eq!(ty.parent.as_deref(), Some("KParts/Part"));
    assert_eq!(ty.comment, "Composant");
    assert_eq!(ty.offers_offset(), -1);
    assert_eq!(
        ty.property_defs.into_iter().collect::<Vec<_>>(),
        vec![
            ("X-KDE-BrowserView-Args".to_string(), PropertyType::String),
            ("X-KDE-Version".to_string(), PropertyType::Int),
        ]
    );

    let not_a_type = DesktopFile::parse("[Desktop Entry]\nType=Service\nName=x\n");
    assert_eq!(ServiceType::from_desktop_file("x.desktop", &not_a_type, "C"), None);
}

#[test]
fn test_encode_decode() {
    let mut ty = ServiceType::new("app.desktop", "Application");
    ty.parent = Some("Base".into());
    ty.property_defs.insert("X-Flag".into(), PropertyType::Bool);
    ty.set_offers_offset(48);

    let mut writer = DataWriter::new(std::io::Cursor::new(Vec::new()));
    writer.write_i32(0).expect("write must succeed");
    ty.encode(&mut writer).expect("encode must succeed");
    let bytes = writer.into_inner().expect("flush").into_inner();

    let decoded = ServiceType::decode(&bytes, ty.offset()).expect("decode must succeed");
    assert_eq!(decoded, ty);
}
