//! Services are indexed three ways: by desktop entry name, by path and
//! by menu id.  The three dictionaries share the same records.  The
//! service segment also holds the shared offer list, since offers
//! point at services and are only complete once every service has
//! an offset.
use std::collections::HashMap;
use std::collections::HashSet;
use std::io::Seek;
use std::io::Write;

use crate::desktop_file::DesktopFile;
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
use crate::mime_db::SCHEME_HANDLER_PREFIX;
use crate::mime_type_factory::MimeTypeFactory;
use crate::offers::write_offer_list;
use crate::offers::OfferRun;
use crate::offers::OfferTable;
use crate::service::desktop_entry_name;
use crate::service::Service;
use crate::service::APPLICATION_SERVICE_TYPE;
use crate::service_type_factory::ServiceTypeFactory;
use crate::stream::DataWriter;

const NAME_DICT: usize = 0;
const INDEX: usize = 1;
const PATH_DICT: usize = 2;
const MENU_ID_DICT: usize = 3;
const OFFER_LIST: usize = 4;
const HEADER_LEN: usize = 5;

/// Strips the directory and the `.desktop`/`.kdelnk` extension off a
/// storage id, leaving a desktop entry name.
fn fallback_name(id: &str) -> Option<String> {
    let file_name = id.rsplit('/').next().unwrap_or(id);
    if file_name.ends_with(".desktop") || file_name.ends_with(".kdelnk") || file_name != id {
        Some(desktop_entry_name(file_name))
    } else {
        None
    }
}

/// Returns the MIME types of `service` it should be registered for
/// directly, canonicalized.  A type is skipped when the service also
/// declares a narrower type derived from it; an alias of the same
/// canonical type does not count as narrower, and neither does a type
/// missing from the database, since it never gets an offer itself.
fn direct_mime_types(service: &Service, db: &MimeDatabase) -> Vec<String> {
    let mut ret: Vec<String> = Vec::new();
    for mime in &service.mime_types {
        let canonical = db.canonical(mime);
        let covered = service.mime_types.iter().any(|other| {
            other != mime
                && db.contains(other)
                && db.canonical(other) != canonical
                && db.inherits(other, mime)
        });
        if covered {
            tracing::debug!(
                target: "sycoca",
                service = service.storage_id(),
                mime = %mime,
                "skipping MIME type covered by a derived type"
            );
            continue;
        }

        let name = if mime.starts_with(SCHEME_HANDLER_PREFIX) {
            mime.clone()
        } else {
            canonical.to_string()
        };
        if !ret.contains(&name) {
            ret.push(name);
        }
    }

    ret
}

/// Services collected during a build.
#[derive(Clone, Debug, Default)]
pub struct ServiceFactory {
    services: Vec<Service>,
    by_storage_id: HashMap<String, usize>,
}

impl ServiceFactory {
    pub fn new() -> ServiceFactory {
        Default::default()
    }

    /// Adds `service`.  A service with the same storage id is replaced
    /// and returned: callers add services least local first, so the
    /// most local one wins.
    pub fn add(&mut self, service: Service) -> Option<Service> {
        match self.by_storage_id.get(service.storage_id()) {
            Some(idx) => {
                tracing::debug!(
                    target: "sycoca",
                    storage_id = service.storage_id(),
                    old = self.services[*idx].path(),
                    new = service.path(),
                    "replacing service with the same storage id"
                );
                Some(std::mem::replace(&mut self.services[*idx], service))
            }
            None => {
                self.by_storage_id
                    .insert(service.storage_id().to_string(), self.services.len());
                self.services.push(service);
                None
            }
        }
    }

    /// Creates a service from its desktop file, typing custom
    /// properties after the service types the file declares.  Hidden
    /// services yield `None`: they only exist to shadow a less local
    /// copy of the same file.
    pub fn create_service(
        path: &str,
        file: &DesktopFile,
        lang: &str,
        types: &ServiceTypeFactory,
    ) -> Option<Service> {
        let mut declared = vec![APPLICATION_SERVICE_TYPE.to_string()];
        if let Some(group) = file.desktop_group() {
            declared.extend(group.list("X-KDE-ServiceTypes"));
            declared.extend(group.list("ServiceTypes"));
        }

        let service = Service::from_desktop_file(path, file, lang, |key| {
            types.property_type(&declared, key)
        })?;
        if service.hidden {
            tracing::debug!(target: "sycoca", path, "skipping hidden service");
            return None;
        }

        Some(service)
    }

    pub fn services(&self) -> &[Service] {
        &self.services
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn find_by_storage_id(&self, id: &str) -> Option<&Service> {
        self.by_storage_id.get(id).map(|idx| &self.services[*idx])
    }

    pub fn find_by_menu_id(&self, menu_id: &str) -> Option<&Service> {
        self.services.iter().find(|s| s.menu_id() == menu_id)
    }

    pub fn find_by_path(&self, path: &str) -> Option<&Service> {
        self.services.iter().find(|s| s.path() == path)
    }

    pub fn find_by_desktop_name(&self, name: &str) -> Option<&Service> {
        self.services.iter().find(|s| s.desktop_entry_name == name)
    }

    /// Resolves a service reference the way association files and
    /// menus use them: menu id, then path, then the bare desktop
    /// entry name.
    pub fn resolve(&self, id: &str) -> Option<&Service> {
        if id.is_empty() {
            return None;
        }

        self.find_by_menu_id(id)
            .or_else(|| self.find_by_path(id))
            .or_else(|| {
                fallback_name(id).and_then(|name| self.find_by_desktop_name(&name))
            })
    }

    /// Registers the direct offers of every service: under each
    /// declared service type and its ancestors, and under each
    /// declared MIME type that is defined (scheme handlers get a stub
    /// on the fly).
    pub fn populate_offers(
        &self,
        table: &mut OfferTable,
        db: &MimeDatabase,
        service_types: &ServiceTypeFactory,
        mime_types: &mut MimeTypeFactory,
    ) {
        for service in &self.services {
            let id = service.storage_id();
            let preference = service.initial_preference;

            for name in &service.service_types {
                if service_types.find(name).is_none() {
                    tracing::debug!(
                        target: "sycoca",
                        service = id,
                        service_type = %name,
                        "undefined service type"
                    );
                    continue;
                }

                let mut visited = HashSet::new();
                let mut current = service_types.find(name);
                while let Some(ty) = current {
                    if !visited.insert(ty.name.as_str()) {
                        break;
                    }

                    table.add_offer(EntryKind::ServiceType, &ty.name, id, preference, 0);
                    current = ty.parent.as_deref().and_then(|p| service_types.find(p));
                }
            }

            for mime in direct_mime_types(service, db) {
                if mime.starts_with(SCHEME_HANDLER_PREFIX) {
                    mime_types.add_stub(&mime);
                } else if !mime_types.contains(&mime) {
                    tracing::debug!(
                        target: "sycoca",
                        service = id,
                        mime = %mime,
                        "undefined MIME type"
                    );
                    continue;
                }

                table.add_offer(EntryKind::MimeType, &mime, id, preference, 0);
            }
        }
    }
}

impl BuildFactory for ServiceFactory {
    const ID: FactoryId = FactoryId::Service;

    fn save<W: Write + Seek>(
        &mut self,
        writer: &mut DataWriter<W>,
        ctx: &mut SaveContext,
    ) -> std::io::Result<()> {
        let header = SegmentHeader::begin(writer, HEADER_LEN)?;
        let mut names = DictBuilder::new();
        let mut paths = DictBuilder::new();
        let mut menu_ids = DictBuilder::new();
        let mut offsets = Vec::with_capacity(self.services.len());

        for service in self.services.iter_mut() {
            service.encode(writer)?;
            let offset = service.offset();
            offsets.push(offset);
            names.add(service.desktop_entry_name.clone(), offset);
            paths.add(service.path(), offset);
            menu_ids.add(service.menu_id(), offset);
            ctx.service_offsets
                .insert(service.storage_id().to_string(), offset);
        }

        let mut values = [0; HEADER_LEN];
        values[INDEX] = writer.offset()?;
        write_index(writer, &offsets)?;
        values[NAME_DICT] = writer.offset()?;
        names.save(writer)?;
        values[PATH_DICT] = writer.offset()?;
        paths.save(writer)?;
        values[MENU_ID_DICT] = writer.offset()?;
        menu_ids.save(writer)?;

        let invalid = |what: String| std::io::Error::new(std::io::ErrorKind::InvalidData, what);
        let mut runs = Vec::with_capacity(ctx.offer_runs.len());
        for (key, offers) in &ctx.offer_runs {
            let type_offset = *ctx
                .type_offsets
                .get(key)
                .ok_or_else(|| invalid(format!("offers for unsaved type {}", key.1)))?;
            let mut run = OfferRun {
                type_offset,
                offers: Vec::with_capacity(offers.len()),
            };
            for offer in offers {
                let service_offset = *ctx.service_offsets.get(&offer.service_id).ok_or_else(|| {
                    invalid(format!("offer for unsaved service {}", offer.service_id))
                })?;
                run.offers
                    .push((service_offset, offer.preference, offer.level));
            }
            runs.push(run);
        }

        values[OFFER_LIST] = writer.offset()?;
        write_offer_list(writer, &runs)?;
        header.patch(writer, &values)
    }
}

/// Read side: services in a sycoca file.
#[derive(Clone, Debug)]
pub struct ServiceIndex<'a> {
    segment: Segment<'a>,
}

impl<'a> ServiceIndex<'a> {
    pub(crate) fn open(data: &'a [u8], offset: i32) -> Result<ServiceIndex<'a>, DecodeError> {
        Ok(ServiceIndex {
            segment: Segment::open(data, offset, HEADER_LEN)?,
        })
    }

    pub fn find_by_desktop_name(&self, name: &str) -> Result<Option<Service>, DecodeError> {
        self.segment
            .lookup(NAME_DICT, name, |s: &Service| s.desktop_entry_name == name)
    }

    pub fn find_by_path(&self, path: &str) -> Result<Option<Service>, DecodeError> {
        self.segment
            .lookup(PATH_DICT, path, |s: &Service| s.path() == path)
    }

    pub fn find_by_menu_id(&self, menu_id: &str) -> Result<Option<Service>, DecodeError> {
        self.segment
            .lookup(MENU_ID_DICT, menu_id, |s: &Service| s.menu_id() == menu_id)
    }

    /// Same resolution order as [`ServiceFactory::resolve`].
    pub fn find_by_storage_id(&self, id: &str) -> Result<Option<Service>, DecodeError> {
        if let Some(service) = self.find_by_menu_id(id)? {
            return Ok(Some(service));
        }

        if let Some(service) = self.find_by_path(id)? {
            return Ok(Some(service));
        }

        match fallback_name(id) {
            Some(name) => self.find_by_desktop_name(&name),
            None => Ok(None),
        }
    }

    pub fn all(&self) -> Result<Vec<Service>, DecodeError> {
        self.segment.all(INDEX)
    }

    /// Decodes the service at `offset`, as referenced by an offer.
    pub fn service_at(&self, offset: i32) -> Result<Service, DecodeError> {
        Service::decode(self.segment.data(), offset)
    }

    /// Absolute offset of the shared offer list.
    pub fn offer_list(&self) -> i32 {
        self.segment.field(OFFER_LIST)
    }
}

#[cfg(test)]
fn app(path: &str, menu_id: &str, mime_types: &[&str]) -> Service {
    let mut ret = Service::new(path, crate::service::APPLICATION_SERVICE_TYPE);
    ret.name = path.to_string();
    ret.exec = "true".into();
    ret.set_menu_id(menu_id);
    ret.mime_types = mime_types.iter().map(|m| m.to_string()).collect();
    ret.service_types = vec![crate::service::APPLICATION_SERVICE_TYPE.to_string()];
    ret
}

#[test]
fn test_add_replaces_by_storage_id() {
    let mut factory = ServiceFactory::new();
    assert!(factory.add(app("system/kate.desktop", "kate.desktop", &[])).is_none());
    assert!(factory.add(app("other.desktop", "other.desktop", &[])).is_none());

    let replaced = factory
        .add(app("local/kate.desktop", "kate.desktop", &[]))
        .expect("same storage id");
    assert_eq!(replaced.path(), "system/kate.desktop");
    assert_eq!(factory.len(), 2);
    assert_eq!(
        factory
            .find_by_storage_id("kate.desktop")
            .map(|s| s.path()),
        Some("local/kate.desktop")
    );
}

#[test]
fn test_resolve() {
    let mut factory = ServiceFactory::new();
    factory.add(app("kde-kate.desktop", "kde-kate.desktop", &[]));
    let mut plugin = Service::new("plugins/Thumbnail.desktop", "Service");
    plugin.name = "thumbnailer".into();
    factory.add(plugin);

    let resolved = |id: &str| factory.resolve(id).map(|s| s.path().to_string());
    assert_eq!(resolved("kde-kate.desktop").as_deref(), Some("kde-kate.desktop"));
    assert_eq!(
        resolved("plugins/Thumbnail.desktop").as_deref(),
        Some("plugins/Thumbnail.desktop")
    );
    // Fallback on the desktop entry name.
    assert_eq!(
        resolved("elsewhere/thumbnail.desktop").as_deref(),
        Some("plugins/Thumbnail.desktop")
    );
    assert_eq!(resolved("thumbnail"), None);
    assert_eq!(resolved(""), None);
}

#[test]
fn test_direct_mime_types() {
    let mut db = MimeDatabase::new();
    db.add_type("text/plain", vec![]);
    db.add_type("text/x-csrc", vec!["text/plain".into()]);
    db.add_alias("text/x-c", "text/x-csrc");

    let both = app("a.desktop", "a.desktop", &["text/plain", "text/x-csrc"]);
    assert_eq!(direct_mime_types(&both, &db), vec!["text/x-csrc"]);

    // An alias is the same type, not a narrower one.
    let aliased = app("b.desktop", "b.desktop", &["text/x-c", "text/x-csrc"]);
    assert_eq!(direct_mime_types(&aliased, &db), vec!["text/x-csrc"]);

    let scheme = app("c.desktop", "c.desktop", &["x-scheme-handler/irc", "text/plain"]);
    assert_eq!(
        direct_mime_types(&scheme, &db),
        vec!["x-scheme-handler/irc", "text/plain"]
    );

    // text/x-not-installed would derive from text/plain, but it is not
    // defined, so it must not hide text/plain.
    let undefined = app("d.desktop", "d.desktop", &["text/plain", "text/x-not-installed"]);
    assert_eq!(
        direct_mime_types(&undefined, &db),
        vec!["text/plain", "text/x-not-installed"]
    );
}

#[test]
fn test_undefined_subtype_keeps_parent_offers() {
    let mut db = MimeDatabase::new();
    db.add_type("text/plain", vec![]);
    db.add_type("text/x-csrc", vec!["text/plain".into()]);

    let types = ServiceTypeFactory::new();
    let mut mime_types = MimeTypeFactory::from_database(&db);
    let mut factory = ServiceFactory::new();
    factory.add(app(
        "editor.desktop",
        "editor.desktop",
        &["text/plain", "text/x-not-installed"],
    ));

    let mut table = OfferTable::new();
    factory.populate_offers(&mut table, &db, &types, &mut mime_types);
    let names: Vec<String> = mime_types.names().map(str::to_string).collect();
    table.propagate_inheritance(&db, names.iter().map(String::as_str));

    let plain = table.offers_for(EntryKind::MimeType, "text/plain");
    assert_eq!(plain.len(), 1);
    assert_eq!(plain[0].level, 0);
    let csrc = table.offers_for(EntryKind::MimeType, "text/x-csrc");
    assert_eq!(csrc.len(), 1);
    assert_eq!(csrc[0].level, 1);
    assert!(table
        .offers_for(EntryKind::MimeType, "text/x-not-installed")
        .is_empty());
}

#[test]
fn test_populate_offers() {
    use crate::service_type::ServiceType;

    let mut db = MimeDatabase::new();
    db.add_type("text/plain", vec![]);

    let mut types = ServiceTypeFactory::new();
    types.add(ServiceType::new("app.desktop", "Application"));
    let mut part = ServiceType::new("ro.desktop", "KParts/ReadOnlyPart");
    part.parent = Some("KParts/Part".into());
    types.add(part);
    types.add(ServiceType::new("part.desktop", "KParts/Part"));

    let mut mime_types = MimeTypeFactory::from_database(&db);
    let mut factory = ServiceFactory::new();
    let mut editor = app("editor.desktop", "editor.desktop", &["text/plain", "text/bogus", "x-scheme-handler/irc"]);
    editor.initial_preference = 5;
    editor.service_types.push("KParts/ReadOnlyPart".into());
    editor.service_types.push("Undefined/Type".into());
    factory.add(editor);

    let mut table = OfferTable::new();
    factory.populate_offers(&mut table, &db, &types, &mut mime_types);

    for (kind, ty) in [
        (EntryKind::ServiceType, "Application"),
        (EntryKind::ServiceType, "KParts/ReadOnlyPart"),
        (EntryKind::ServiceType, "KParts/Part"),
        (EntryKind::MimeType, "text/plain"),
        (EntryKind::MimeType, "x-scheme-handler/irc"),
    ] {
        let offers = table.offers_for(kind, ty);
        assert_eq!(offers.len(), 1, "{}", ty);
        assert_eq!(offers[0].preference, 5);
        assert_eq!(offers[0].level, 0);
    }

    assert!(table.offers_for(EntryKind::MimeType, "text/bogus").is_empty());
    assert!(table
        .offers_for(EntryKind::ServiceType, "Undefined/Type")
        .is_empty());
    assert!(mime_types.contains("x-scheme-handler/irc"));
}

#[test]
fn test_save_and_lookup() {
    use crate::offers::Offer;

    let mut factory = ServiceFactory::new();
    factory.add(app("kde/Kate.desktop", "kde-Kate.desktop", &[]));
    let mut plugin = Service::new("thumbnail.desktop", "Service");
    plugin.name = "Thumbnailer".into();
    factory.add(plugin);

    let mut writer = DataWriter::new(std::io::Cursor::new(Vec::new()));
    writer.write_i32(0).expect("write must succeed");
    let mut ctx = SaveContext::default();
    ctx.type_offsets
        .insert((EntryKind::ServiceType, "Application".into()), 1234);
    ctx.offer_runs.push((
        (EntryKind::ServiceType, "Application".into()),
        vec![Offer {
            service_id: "kde-Kate.desktop".into(),
            preference: 3,
            level: 0,
        }],
    ));
    factory.save(&mut writer, &mut ctx).expect("save must succeed");
    let bytes = writer.into_inner().expect("flush").into_inner();

    let index = ServiceIndex::open(&bytes, 4).expect("open must succeed");
    let kate = index
        .find_by_menu_id("kde-Kate.desktop")
        .expect("find must succeed")
        .expect("service must exist");
    assert_eq!(kate.path(), "kde/Kate.desktop");
    for id in ["kde-Kate.desktop", "kde/Kate.desktop", "Kate.desktop", "kate.desktop"] {
        assert_eq!(
            index.find_by_storage_id(id).expect("find must succeed").map(|s| s.offset()),
            Some(kate.offset()),
            "{}",
            id
        );
    }
    assert_eq!(
        index
            .find_by_desktop_name("thumbnail")
            .expect("find must succeed")
            .map(|s| s.name),
        Some("Thumbnailer".to_string())
    );
    assert_eq!(index.find_by_path("missing.desktop"), Ok(None));
    assert_eq!(index.all().expect("all must succeed").len(), 2);

    let run = crate::offers::read_offer_run(&bytes, index.offer_list(), 0, 1234)
        .expect("offers must decode");
    assert_eq!(run, vec![(kate.offset(), 3, 0)]);
    assert_eq!(index.service_at(kate.offset()), Ok(kate));
}

/// Offers for services that were never saved are an error, not a
/// silently shifted offer list.
#[test]
fn test_save_rejects_dangling_offers() {
    use crate::offers::Offer;

    let mut factory = ServiceFactory::new();
    let mut writer = DataWriter::new(std::io::Cursor::new(Vec::new()));
    writer.write_i32(0).expect("write must succeed");
    let mut ctx = SaveContext::default();
    ctx.type_offsets
        .insert((EntryKind::ServiceType, "Application".into()), 1234);
    ctx.offer_runs.push((
        (EntryKind::ServiceType, "Application".into()),
        vec![Offer {
            service_id: "gone.desktop".into(),
            preference: 1,
            level: 0,
        }],
    ));

    let err = factory.save(&mut writer, &mut ctx).expect_err("save must fail");
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
}

#[test]
fn test_create_service() {
    use crate::property::Property;
    use crate::property::PropertyType;
    use crate::service_type::ServiceType;

    let mut types = ServiceTypeFactory::new();
    let mut plugin = ServiceType::new("plugin.desktop", "Sycoca/Plugin");
    plugin
        .property_defs
        .insert("X-Plugin-Version".into(), PropertyType::Int);
    types.add(plugin);

    let file = DesktopFile::parse(
        "[Desktop Entry]\n\
         Type=Service\n\
         Name=Plugin\n\
         X-KDE-ServiceTypes=Sycoca/Plugin\n\
         X-Plugin-Version=3\n\
         X-Other=3\n",
    );
    let service = ServiceFactory::create_service("p.desktop", &file, "C", &types)
        .expect("service must be created");
    assert_eq!(service.property("X-Plugin-Version"), Some(&Property::Int(3)));
    assert_eq!(service.property("X-Other"), Some(&Property::String("3".into())));

    let hidden = DesktopFile::parse("[Desktop Entry]\nName=Gone\nExec=gone\nHidden=true\n");
    assert_eq!(
        ServiceFactory::create_service("gone.desktop", &hidden, "C", &types),
        None
    );
}
