use std::collections::HashSet;
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
use crate::property::PropertyType;
use crate::service_type::ServiceType;
use crate::stream::DataWriter;

const DICT: usize = 0;
const INDEX: usize = 1;
const HEADER_LEN: usize = 2;

/// Service types collected during a build, in discovery order.
#[derive(Clone, Debug, Default)]
pub struct ServiceTypeFactory {
    types: Vec<ServiceType>,
}

impl ServiceTypeFactory {
    pub fn new() -> ServiceTypeFactory {
        Default::default()
    }

    /// Adds `ty`, replacing any earlier type with the same name.
    pub fn add(&mut self, ty: ServiceType) {
        match self.types.iter_mut().find(|t| t.name == ty.name) {
            Some(existing) => {
                tracing::debug!(
                    target: "sycoca",
                    name = %ty.name,
                    old = existing.path(),
                    new = ty.path(),
                    "service type defined twice"
                );
                *existing = ty;
            }
            None => self.types.push(ty),
        }
    }

    pub fn find(&self, name: &str) -> Option<&ServiceType> {
        self.types.iter().find(|t| t.name == name)
    }

    pub fn types(&self) -> &[ServiceType] {
        &self.types
    }

    pub(crate) fn types_mut(&mut self) -> &mut [ServiceType] {
        &mut self.types
    }

    /// Returns the type of property `key` as declared by one of
    /// `service_types` or their ancestors.
    pub fn property_type(&self, service_types: &[String], key: &str) -> Option<PropertyType> {
        for name in service_types {
            let mut visited = HashSet::new();
            let mut current = self.find(name);
            while let Some(ty) = current {
                if !visited.insert(ty.name.as_str()) {
                    break;
                }

                if let Some(def) = ty.property_defs.get(key) {
                    return Some(*def);
                }

                current = ty.parent.as_deref().and_then(|p| self.find(p));
            }
        }

        None
    }
}

impl BuildFactory for ServiceTypeFactory {
    const ID: FactoryId = FactoryId::ServiceType;

    fn save<W: Write + Seek>(
        &mut self,
        writer: &mut DataWriter<W>,
        ctx: &mut SaveContext,
    ) -> std::io::Result<()> {
        let header = SegmentHeader::begin(writer, HEADER_LEN)?;
        let mut dict = DictBuilder::new();
        let mut offsets = Vec::with_capacity(self.types.len());

        for ty in self.types.iter_mut() {
            ty.encode(writer)?;
            offsets.push(ty.offset());
            dict.add(ty.name.clone(), ty.offset());
            ctx.type_offsets
                .insert((EntryKind::ServiceType, ty.name.clone()), ty.offset());
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

/// Read side: service types in a sycoca file.
#[derive(Clone, Debug)]
pub struct ServiceTypeIndex<'a> {
    segment: Segment<'a>,
}

impl<'a> ServiceTypeIndex<'a> {
    pub(crate) fn open(data: &'a [u8], offset: i32) -> Result<ServiceTypeIndex<'a>, DecodeError> {
        Ok(ServiceTypeIndex {
            segment: Segment::open(data, offset, HEADER_LEN)?,
        })
    }

    pub fn find(&self, name: &str) -> Result<Option<ServiceType>, DecodeError> {
        self.segment
            .lookup(DICT, name, |ty: &ServiceType| ty.name == name)
    }

    pub fn all(&self) -> Result<Vec<ServiceType>, DecodeError> {
        self.segment.all(INDEX)
    }
}

#[test]
fn test_property_type_follows_parents() {
    let mut factory = ServiceTypeFactory::new();
    let mut base = ServiceType::new("base.desktop", "Base");
    base.property_defs.insert("X-Version".into(), PropertyType::Int);
    factory.add(base);

    let mut derived = ServiceType::new("derived.desktop", "Derived");
    derived.parent = Some("Base".into());
    derived.property_defs.insert("X-Flag".into(), PropertyType::Bool);
    factory.add(derived);

    // Cycles must not hang.
    let mut cycle = ServiceType::new("cycle.desktop", "Cycle");
    cycle.parent = Some("Cycle".into());
    factory.add(cycle);

    let declared = vec!["Cycle".to_string(), "Derived".to_string()];
    assert_eq!(factory.property_type(&declared, "X-Version"), Some(PropertyType::Int));
    assert_eq!(factory.property_type(&declared, "X-Flag"), Some(PropertyType::Bool));
    assert_eq!(factory.property_type(&declared, "X-Other"), None);

    // Redefinitions replace in place.
    factory.add(ServiceType::new("local/base.desktop", "Base"));
    assert_eq!(factory.types().len(), 3);
    assert_eq!(factory.property_type(&declared, "X-Version"), None);
}

#[test]
fn test_save_and_find() {
    let mut factory = ServiceTypeFactory::new();
    factory.add(ServiceType::new("app.desktop", "Application"));
    factory.add(ServiceType::new("part.desktop", "KParts/ReadOnlyPart"));

    let mut writer = DataWriter::new(std::io::Cursor::new(Vec::new()));
    writer.write_i32(0).expect("write must succeed");
    let mut ctx = SaveContext::default();
    factory.save(&mut writer, &mut ctx).expect("save must succeed");
    let bytes = writer.into_inner().expect("flush").into_inner();

    let index = ServiceTypeIndex::open(&bytes, 4).expect("open must succeed");
    let app = index
        .find("Application")
        .expect("find must succeed")
        .expect("type must exist");
    assert_eq!(app.path(), "app.desktop");
    assert_eq!(ctx.type_offsets.get(&(EntryKind::ServiceType, "Application".to_string())), Some(&app.offset()));
    assert_eq!(index.find("Nope"), Ok(None));
    assert_eq!(
        index
            .all()
            .expect("all must succeed")
            .iter()
            .map(|t| t.name.as_str())
            .collect::<Vec<_>>(),
        vec!["Application", "KParts/ReadOnlyPart"]
    );
}
