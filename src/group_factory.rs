use std::collections::BTreeMap;
use std::io::Seek;
use std::io::Write;

use crate::dict::DictBuilder;
use crate::entry::Record;
use crate::error::DecodeError;
use crate::factory::write_index;
use crate::factory::BuildFactory;
use crate::factory::FactoryId;
use crate::factory::SaveContext;
use crate::factory::Segment;
use crate::factory::SegmentHeader;
use crate::service_group::ServiceGroup;
use crate::stream::DataWriter;

const DICT: usize = 0;
const INDEX: usize = 1;
const BASE_GROUP_DICT: usize = 2;
const HEADER_LEN: usize = 3;

/// Menu groups produced by the menu build, keyed by relative path.
#[derive(Clone, Debug, Default)]
pub struct GroupFactory {
    groups: BTreeMap<String, ServiceGroup>,
}

impl GroupFactory {
    pub fn new() -> GroupFactory {
        Default::default()
    }

    pub fn add(&mut self, group: ServiceGroup) {
        self.groups.insert(group.rel_path().to_string(), group);
    }

    pub fn find(&self, rel_path: &str) -> Option<&ServiceGroup> {
        self.groups.get(rel_path)
    }

    pub fn groups(&self) -> impl Iterator<Item = &ServiceGroup> {
        self.groups.values()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

impl BuildFactory for GroupFactory {
    const ID: FactoryId = FactoryId::ServiceGroup;

    fn save<W: Write + Seek>(
        &mut self,
        writer: &mut DataWriter<W>,
        _ctx: &mut SaveContext,
    ) -> std::io::Result<()> {
        let header = SegmentHeader::begin(writer, HEADER_LEN)?;
        let mut dict = DictBuilder::new();
        let mut base_groups = DictBuilder::new();
        let mut offsets = Vec::with_capacity(self.groups.len());

        for (rel_path, group) in self.groups.iter_mut() {
            group.encode(writer)?;
            offsets.push(group.offset());
            // The root's key is empty, which a dictionary cannot hold;
            // it is found through the index instead.
            dict.add(rel_path.clone(), group.offset());
            base_groups.add(group.base_group_name.clone(), group.offset());
        }

        let mut values = [0; HEADER_LEN];
        values[INDEX] = writer.offset()?;
        write_index(writer, &offsets)?;
        values[DICT] = writer.offset()?;
        dict.save(writer)?;
        values[BASE_GROUP_DICT] = writer.offset()?;
        base_groups.save(writer)?;
        header.patch(writer, &values)
    }
}

/// Read side: the menu tree in a sycoca file.
#[derive(Clone, Debug)]
pub struct GroupIndex<'a> {
    segment: Segment<'a>,
}

impl<'a> GroupIndex<'a> {
    pub(crate) fn open(data: &'a [u8], offset: i32) -> Result<GroupIndex<'a>, DecodeError> {
        Ok(GroupIndex {
            segment: Segment::open(data, offset, HEADER_LEN)?,
        })
    }

    /// Finds a group by relative path; `""` is the root.
    pub fn find(&self, rel_path: &str) -> Result<Option<ServiceGroup>, DecodeError> {
        if rel_path.is_empty() {
            return Ok(self.all()?.into_iter().find(ServiceGroup::is_root));
        }

        self.segment
            .lookup(DICT, rel_path, |g: &ServiceGroup| g.rel_path() == rel_path)
    }

    pub fn root(&self) -> Result<Option<ServiceGroup>, DecodeError> {
        self.find("")
    }

    /// Finds a group by its `X-KDE-BaseGroup` alias.
    pub fn find_by_base_name(&self, name: &str) -> Result<Option<ServiceGroup>, DecodeError> {
        if name.is_empty() {
            return Ok(None);
        }

        self.segment
            .lookup(BASE_GROUP_DICT, name, |g: &ServiceGroup| g.base_group_name == name)
    }

    pub fn all(&self) -> Result<Vec<ServiceGroup>, DecodeError> {
        self.segment.all(INDEX)
    }
}

#[test]
fn test_save_and_find() {
    use crate::service_group::GroupChild;

    let mut factory = GroupFactory::new();
    let mut root = ServiceGroup::new("");
    root.caption = "Applications".into();
    root.children = vec![GroupChild::Group("Graphics/".into())];
    factory.add(root);

    let mut graphics = ServiceGroup::new("Graphics/");
    graphics.caption = "Graphics".into();
    graphics.base_group_name = "graphics".into();
    graphics.children = vec![GroupChild::Service("gimp.desktop".into())];
    factory.add(graphics);
    assert_eq!(factory.len(), 2);

    let mut writer = DataWriter::new(std::io::Cursor::new(Vec::new()));
    writer.write_i32(0).expect("write must succeed");
    factory
        .save(&mut writer, &mut SaveContext::default())
        .expect("save must succeed");
    let bytes = writer.into_inner().expect("flush").into_inner();

    let index = GroupIndex::open(&bytes, 4).expect("open must succeed");
    let root = index
        .root()
        .expect("find must succeed")
        .expect("root must exist");
    assert_eq!(root.caption, "Applications");

    let graphics = index
        .find("Graphics/")
        .expect("find must succeed")
        .expect("group must exist");
    assert_eq!(graphics.children, vec![GroupChild::Service("gimp.desktop".into())]);
    assert_eq!(
        index.find_by_base_name("graphics").expect("find must succeed"),
        Some(graphics)
    );
    assert_eq!(index.find("Office/"), Ok(None));
    assert_eq!(index.find_by_base_name(""), Ok(None));
    assert_eq!(index.all().expect("all must succeed").len(), 2);
}
