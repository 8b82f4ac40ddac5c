//! Read side of the sycoca file.
//!
//! A [`Cache`] holds the whole file in an immutable shared buffer, and
//! every lookup decodes a fresh copy of the records it returns, so a
//! `Cache` may be cloned and shared across threads freely.
//!
//! Lookups never fail loudly: a record that does not decode turns
//! into "not found", and raises a flag that marks the whole file as
//! unreliable (see [`Cache::read_error`] and [`Cache::needs_rebuild`]).
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use filetime::FileTime;

use crate::benign_error::is_absent_file_error;
use crate::config::Environment;
use crate::entry::Entry;
use crate::error::DecodeError;
use crate::error::Error;
use crate::error::Result;
use crate::factory::FactoryId;
use crate::group_factory::GroupIndex;
use crate::header::read_version;
use crate::header::CacheHeader;
use crate::header::Stamp;
use crate::header::VERSION;
use crate::mime_type::MimeTypeEntry;
use crate::mime_type_factory::MimeTypeIndex;
use crate::offers::read_offer_run;
use crate::offers::ServiceOffer;
use crate::service::Service;
use crate::service_factory::ServiceIndex;
use crate::service_group::GroupChild;
use crate::service_group::ServiceGroup;
use crate::service_type::ServiceType;
use crate::service_type_factory::ServiceTypeIndex;
use crate::watch::CacheWatch;

/// Factories every sycoca file must have.
const REQUIRED_FACTORIES: [FactoryId; 5] = [
    FactoryId::CTime,
    FactoryId::ServiceType,
    FactoryId::MimeType,
    FactoryId::ServiceGroup,
    FactoryId::Service,
];

/// Identifies one version of the cache file on disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct FileIdentity {
    len: u64,
    mtime: FileTime,
}

impl FileIdentity {
    fn of(path: &Path) -> std::io::Result<FileIdentity> {
        let metadata = std::fs::metadata(path)?;
        Ok(FileIdentity {
            len: metadata.len(),
            mtime: FileTime::from_last_modification_time(&metadata),
        })
    }
}

/// A resolved child of a [`ServiceGroup`].
#[derive(Clone, Debug, PartialEq)]
pub enum GroupItem {
    Service(Service),
    Group(ServiceGroup),
    Separator,
}

/// An open sycoca file.
#[derive(Clone, Debug)]
pub struct Cache {
    path: PathBuf,
    data: Arc<[u8]>,
    header: CacheHeader,
    identity: FileIdentity,
    // Shared by clones: they all read the same bytes.
    read_error: Arc<AtomicBool>,
    watch: Option<Arc<CacheWatch>>,
    /// The watch's change count when the data was read.
    seen_changes: u64,
}

impl Cache {
    /// Opens the sycoca file at `path`, and validates its version and
    /// segment table.
    pub fn open(path: impl AsRef<Path>) -> Result<Cache> {
        let path = path.as_ref();
        let absent = |e: std::io::Error| {
            if is_absent_file_error(&e) {
                Error::NotFound {
                    path: path.to_path_buf(),
                }
            } else {
                Error::Io(e)
            }
        };

        // Identify the file before reading it: if it is replaced in
        // between, the cache looks stale and is simply reopened.
        let identity = FileIdentity::of(path).map_err(absent)?;
        let data = std::fs::read(path).map_err(absent)?;

        let corrupt = |e: DecodeError| Error::Corrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        };

        let version = read_version(&data).map_err(corrupt)?;
        if version != VERSION {
            return Err(Error::IncompatibleVersion {
                expected: VERSION,
                found: version,
            });
        }

        let header = CacheHeader::read(&data).map_err(corrupt)?;
        if header.timestamp == 0 {
            return Err(Error::Corrupt {
                path: path.to_path_buf(),
                reason: "unfinished header".into(),
            });
        }

        for id in REQUIRED_FACTORIES {
            match header.factory_offset(id) {
                Some(offset) if offset > 0 && (offset as usize) < data.len() => {}
                _ => {
                    return Err(Error::Corrupt {
                        path: path.to_path_buf(),
                        reason: format!("missing or invalid {:?} segment", id),
                    })
                }
            }
        }

        tracing::debug!(target: "sycoca", path = %path.display(), len = data.len(), "opened cache");
        Ok(Cache {
            path: path.to_path_buf(),
            data: data.into(),
            header,
            identity,
            read_error: Arc::new(AtomicBool::new(false)),
            watch: None,
            seen_changes: 0,
        })
    }

    /// Opens the cache of `env`, and checks that it was built for
    /// `env`: same update signature, language and search path.
    pub fn open_for(env: &Environment) -> Result<Cache> {
        let ret = Cache::open(env.cache_path())?;
        ret.header.check(env)?;
        Ok(ret)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &CacheHeader {
        &self.header
    }

    /// Whether any lookup hit undecodable data.  Once set, the file
    /// should not be trusted anymore, and must be rebuilt from scratch.
    pub fn read_error(&self) -> bool {
        self.read_error.load(Ordering::Relaxed)
    }

    /// Whether the cache must be rebuilt for `env`: a lookup failed,
    /// the cache was built for another environment, or some resource
    /// directory, association file, menu file or extra `AppDir`
    /// changed since.
    pub fn needs_rebuild(&self, env: &Environment) -> bool {
        if self.read_error() {
            return true;
        }

        if !self.header.is_fresh(env) {
            return true;
        }

        match Stamp::load(&env.stamp_path()) {
            Some(stamp) => !stamp.is_current(env),
            None => true,
        }
    }

    /// Starts a background watch that notices when the cache file or
    /// its stamp change on disk.  Clones made afterwards share the
    /// watch.  Starting a second watch is a no-op.
    pub fn watch(&mut self) -> Result<()> {
        if self.watch.is_none() {
            let watch = CacheWatch::start(&self.path)?;
            // Changes before the watch started are caught by the
            // file identity check.
            self.seen_changes = watch.changes();
            self.watch = Some(Arc::new(watch));
        }

        Ok(())
    }

    /// Whether the background watch saw the cache or its stamp change
    /// since the data was read.  Always false without [`Cache::watch`].
    pub fn changed_on_disk(&self) -> bool {
        match &self.watch {
            Some(watch) => watch.changes() != self.seen_changes,
            None => false,
        }
    }

    /// Whether the file on disk is no longer the one we read, usually
    /// because a builder replaced it.
    pub fn is_stale(&self) -> bool {
        if self.changed_on_disk() {
            return true;
        }

        match FileIdentity::of(&self.path) {
            Ok(identity) => identity != self.identity,
            Err(_) => true,
        }
    }

    /// Reopens the file if it changed on disk.  Returns whether it did.
    /// On error, `self` is left as it was.  The watch, if any, carries
    /// over to the new data.
    pub fn reopen_if_changed(&mut self) -> Result<bool> {
        if !self.is_stale() {
            return Ok(false);
        }

        // Read the count first: events during the open make the new
        // data look stale, never the other way around.
        let changes = self.watch.as_ref().map(|watch| watch.changes()).unwrap_or(0);
        let mut reopened = Cache::open(&self.path)?;
        reopened.watch = self.watch.take();
        reopened.seen_changes = changes;
        *self = reopened;
        Ok(true)
    }

    /// Unwraps the result of a lookup, and flags decoding failures.
    fn decoded<T>(&self, result: std::result::Result<T, DecodeError>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                if !self.read_error.swap(true, Ordering::Relaxed) {
                    tracing::warn!(target: "sycoca", path = %self.path.display(), error = %e, "corrupt cache; it must be rebuilt");
                }
                None
            }
        }
    }

    fn segment(&self, id: FactoryId) -> i32 {
        // `open` checked every segment is present.
        self.header.factory_offset(id).unwrap_or(0)
    }

    fn services(&self) -> Option<ServiceIndex<'_>> {
        self.decoded(ServiceIndex::open(&self.data, self.segment(FactoryId::Service)))
    }

    fn service_types(&self) -> Option<ServiceTypeIndex<'_>> {
        self.decoded(ServiceTypeIndex::open(
            &self.data,
            self.segment(FactoryId::ServiceType),
        ))
    }

    fn mime_types(&self) -> Option<MimeTypeIndex<'_>> {
        self.decoded(MimeTypeIndex::open(&self.data, self.segment(FactoryId::MimeType)))
    }

    fn groups(&self) -> Option<GroupIndex<'_>> {
        self.decoded(GroupIndex::open(
            &self.data,
            self.segment(FactoryId::ServiceGroup),
        ))
    }

    fn find_service(
        &self,
        find: impl FnOnce(&ServiceIndex<'_>) -> std::result::Result<Option<Service>, DecodeError>,
    ) -> Option<Service> {
        let services = self.services()?;
        self.decoded(find(&services)).flatten()
    }

    /// Finds a service by the file name of its desktop file, without
    /// the extension (`"kate"`).
    pub fn service_by_desktop_name(&self, name: &str) -> Option<Service> {
        self.find_service(|idx| idx.find_by_desktop_name(name))
    }

    /// Finds a service by its path relative to its resource directory.
    pub fn service_by_desktop_path(&self, path: &str) -> Option<Service> {
        self.find_service(|idx| idx.find_by_path(path))
    }

    /// Finds an application by menu id (`"org.kde.kate.desktop"`).
    pub fn service_by_menu_id(&self, menu_id: &str) -> Option<Service> {
        self.find_service(|idx| idx.find_by_menu_id(menu_id))
    }

    /// Finds a service by storage id: a menu id, a path, or a desktop
    /// name with its extension.
    pub fn service_by_storage_id(&self, id: &str) -> Option<Service> {
        self.find_service(|idx| idx.find_by_storage_id(id))
    }

    pub fn all_services(&self) -> Vec<Service> {
        self.services()
            .and_then(|idx| self.decoded(idx.all()))
            .unwrap_or_default()
    }

    pub fn service_type(&self, name: &str) -> Option<ServiceType> {
        let types = self.service_types()?;
        self.decoded(types.find(name)).flatten()
    }

    pub fn all_service_types(&self) -> Vec<ServiceType> {
        self.service_types()
            .and_then(|idx| self.decoded(idx.all()))
            .unwrap_or_default()
    }

    pub fn mime_type(&self, name: &str) -> Option<MimeTypeEntry> {
        let types = self.mime_types()?;
        self.decoded(types.find(name)).flatten()
    }

    pub fn all_mime_types(&self) -> Vec<MimeTypeEntry> {
        self.mime_types()
            .and_then(|idx| self.decoded(idx.all()))
            .unwrap_or_default()
    }

    /// Decodes the offer run of the type at `type_offset`.
    fn offers(&self, type_offset: i32, offers_offset: i32) -> Vec<ServiceOffer> {
        let services = match self.services() {
            Some(services) => services,
            None => return Vec::new(),
        };

        let run = match self.decoded(read_offer_run(
            &self.data,
            services.offer_list(),
            offers_offset,
            type_offset,
        )) {
            Some(run) => run,
            None => return Vec::new(),
        };

        let mut ret = Vec::with_capacity(run.len());
        for (service, preference, level) in run {
            match self.decoded(services.service_at(service)) {
                Some(service) => ret.push(ServiceOffer {
                    service,
                    preference,
                    mime_type_inheritance_level: level,
                }),
                None => return Vec::new(),
            }
        }

        ret
    }

    /// Returns the services that handle `name`, best first.  Offers
    /// inherited from parent MIME types come after direct ones.
    pub fn offers_for_mime_type(&self, name: &str) -> Vec<ServiceOffer> {
        match self.mime_type(name) {
            Some(entry) => self.offers(entry.offset(), entry.offers_offset()),
            None => Vec::new(),
        }
    }

    /// Returns the services of type `name` or of a type derived from
    /// it, best first.
    pub fn offers_for_service_type(&self, name: &str) -> Vec<ServiceOffer> {
        match self.service_type(name) {
            Some(ty) => self.offers(ty.offset(), ty.offers_offset()),
            None => Vec::new(),
        }
    }

    /// Decodes the record at `offset`, whatever its kind.  Offsets
    /// come from records read from this same cache.
    pub fn entry_at(&self, offset: i32) -> Option<Entry> {
        self.decoded(Entry::decode(&self.data, offset))
    }

    /// Finds a menu by relative path (`"Graphics/"`); the root menu
    /// is `""`.
    pub fn group(&self, rel_path: &str) -> Option<ServiceGroup> {
        let groups = self.groups()?;
        self.decoded(groups.find(rel_path)).flatten()
    }

    pub fn root_group(&self) -> Option<ServiceGroup> {
        let groups = self.groups()?;
        self.decoded(groups.root()).flatten()
    }

    /// Finds a menu by its `X-KDE-BaseGroup` alias.
    pub fn group_by_base_name(&self, name: &str) -> Option<ServiceGroup> {
        let groups = self.groups()?;
        self.decoded(groups.find_by_base_name(name)).flatten()
    }

    /// Resolves the children of `group`, in layout order.  Children
    /// that cannot be found are skipped.
    pub fn group_children(&self, group: &ServiceGroup) -> Vec<GroupItem> {
        group
            .children
            .iter()
            .filter_map(|child| match child {
                GroupChild::Service(id) => self.service_by_storage_id(id).map(GroupItem::Service),
                GroupChild::Group(rel_path) => self.group(rel_path).map(GroupItem::Group),
                GroupChild::Separator => Some(GroupItem::Separator),
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use crate::builder::Builder;
    use crate::config::EnvironmentBuilder;
    use crate::reader::*;
    use crate::test_util::{set_mtime, write_file};
    use test_dir::{DirBuilder, TestDir};

    fn env(temp: &TestDir, language: &str) -> Environment {
        EnvironmentBuilder::new()
            .data_dir(temp.path("data"))
            .config_dir(temp.path("config"))
            .cache_dir(temp.path("cache"))
            .language(language)
            .take()
            .build()
    }

    fn build(temp: &TestDir) -> Environment {
        write_file(
            temp.path("data/applications/org.kde.kate.desktop"),
            "[Desktop Entry]\nType=Application\nName=Kate\nExec=kate %U\n\
             MimeType=text/plain;\nCategories=Utility;\n",
        );
        write_file(
            temp.path("data/applications/kde/viewer.desktop"),
            "[Desktop Entry]\nType=Application\nName=Viewer\nExec=viewer\n\
             MimeType=text/plain;\nInitialPreference=5\n",
        );
        write_file(
            temp.path("data/services/kio/thumbnail.desktop"),
            "[Desktop Entry]\nType=Service\nName=Thumbnailer\nX-KDE-ServiceTypes=ThumbCreator\n",
        );
        write_file(
            temp.path("data/servicetypes/thumbcreator.desktop"),
            "[Desktop Entry]\nType=ServiceType\nX-KDE-ServiceType=ThumbCreator\n",
        );
        write_file(
            temp.path("data/mime/packages/text.xml"),
            "<?xml version=\"1.0\"?>\n\
             <mime-info xmlns=\"http://www.freedesktop.org/standards/shared-mime-info\">\n\
               <mime-type type=\"text/plain\"/>\n\
               <mime-type type=\"image/png\"/>\n\
             </mime-info>\n",
        );

        let env = env(temp, "en");
        Builder::new(env.clone())
            .build()
            .expect("build must succeed");
        env
    }

    #[test]
    fn test_lookups() {
        let temp = TestDir::temp();
        let env = build(&temp);
        let cache = Cache::open_for(&env).expect("open must succeed");

        let kate = cache
            .service_by_menu_id("org.kde.kate.desktop")
            .expect("kate must exist");
        assert_eq!(kate.name, "Kate");
        // Paths are relative to the resource directory.
        assert_eq!(kate.path(), "org.kde.kate.desktop");
        assert_eq!(
            cache.service_by_desktop_path("org.kde.kate.desktop"),
            Some(kate.clone())
        );
        let kate_path = temp.path("data/applications/org.kde.kate.desktop");
        assert_eq!(
            cache.service_by_desktop_path(&kate_path.to_string_lossy()),
            None
        );
        assert_eq!(
            cache.service_by_desktop_name("org.kde.kate"),
            Some(kate.clone())
        );
        assert_eq!(
            cache.service_by_storage_id("org.kde.kate.desktop"),
            Some(kate.clone())
        );

        // Applications in subdirectories get a dashed menu id.
        let viewer = cache
            .service_by_storage_id("kde-viewer.desktop")
            .expect("viewer must exist");
        assert_eq!(viewer.name, "Viewer");
        assert_eq!(cache.service_by_menu_id("viewer.desktop"), None);

        assert_eq!(cache.service_by_desktop_name("missing"), None);
        assert_eq!(cache.all_services().len(), 3);

        let thumb = cache
            .service_type("ThumbCreator")
            .expect("service type must exist");
        assert_eq!(thumb.name, "ThumbCreator");
        assert!(cache.service_type("Application").is_some());
        assert!(cache.service_type("Nope").is_none());
        assert_eq!(cache.all_service_types().len(), 2);

        assert!(cache.mime_type("text/plain").is_some());
        assert!(cache.mime_type("image/png").is_some());
        assert!(cache.mime_type("image/gif").is_none());
        assert_eq!(cache.all_mime_types().len(), 2);

        let offers = cache.offers_for_mime_type("text/plain");
        let names: Vec<&str> = offers.iter().map(|o| o.service.name.as_str()).collect();
        assert_eq!(names, vec!["Viewer", "Kate"]);
        assert!(offers.iter().all(|o| o.mime_type_inheritance_level == 0));
        assert!(cache.offers_for_mime_type("image/png").is_empty());

        let thumbnailers = cache.offers_for_service_type("ThumbCreator");
        assert_eq!(thumbnailers.len(), 1);
        assert_eq!(thumbnailers[0].service.name, "Thumbnailer");
        // Plugins have no menu id: their relative path is their
        // storage id.
        let thumbnailer = cache
            .service_by_desktop_path("kio/thumbnail.desktop")
            .expect("thumbnailer must exist");
        assert_eq!(thumbnailer, thumbnailers[0].service);
        assert_eq!(thumbnailer.storage_id(), "kio/thumbnail.desktop");
        assert_eq!(
            cache.service_by_storage_id("kio/thumbnail.desktop"),
            Some(thumbnailer.clone())
        );
        assert_eq!(cache.service_by_desktop_name("thumbnail"), Some(thumbnailer));
        assert_eq!(cache.offers_for_service_type("Application").len(), 2);

        match cache.entry_at(kate.offset()) {
            Some(Entry::Service(service)) => assert_eq!(service, kate),
            other => panic!("expected kate, got {:?}", other),
        }
        let text = cache.mime_type("text/plain").expect("text/plain must exist");
        assert!(matches!(
            cache.entry_at(text.offset()),
            Some(Entry::MimeType(entry)) if entry.name() == "text/plain"
        ));

        assert!(!cache.read_error());
        assert!(!cache.needs_rebuild(&env));
    }

    #[test]
    fn test_groups() {
        let temp = TestDir::temp();
        let env = build(&temp);
        let cache = Cache::open(env.cache_path()).expect("open must succeed");

        let root = cache.root_group().expect("root must exist");
        assert!(root.is_root());
        assert_eq!(cache.group(""), Some(root.clone()));

        let children = cache.group_children(&root);
        assert!(!children.is_empty());
        for child in &children {
            match child {
                GroupItem::Service(service) => assert!(service.is_application()),
                GroupItem::Group(group) => assert!(!group.is_root()),
                GroupItem::Separator => {}
            }
        }

        assert_eq!(cache.group("Nope/"), None);
        assert_eq!(cache.group_by_base_name("nope"), None);
        assert!(!cache.read_error());
    }

    #[test]
    fn test_open_errors() {
        let temp = TestDir::temp();
        let path = temp.path("cache/sycoca");

        assert!(matches!(Cache::open(&path), Err(Error::NotFound { .. })));

        std::fs::create_dir_all(temp.path("cache")).expect("mkdir must succeed");
        std::fs::write(&path, [0u8, 0, 0, 99, 0, 0, 0, 0]).expect("write must succeed");
        assert!(matches!(
            Cache::open(&path),
            Err(Error::IncompatibleVersion {
                expected: VERSION,
                found: 99
            })
        ));

        // The right version, followed by an unknown factory.
        std::fs::write(&path, [0u8, 0, 0, 1, 0, 0, 0, 77, 0, 0, 0, 8]).expect("write must succeed");
        assert!(matches!(Cache::open(&path), Err(Error::Corrupt { .. })));

        std::fs::write(&path, [0u8, 0]).expect("write must succeed");
        assert!(matches!(Cache::open(&path), Err(Error::Corrupt { .. })));
    }

    #[test]
    fn test_environment_mismatch() {
        let temp = TestDir::temp();
        let english = build(&temp);
        let french = env(&temp, "fr");
        assert_ne!(english.cache_path(), french.cache_path());

        // Nothing was built for French yet.
        assert!(matches!(
            Cache::open_for(&french),
            Err(Error::NotFound { .. })
        ));

        // An English cache under the French name is rejected by its
        // header.
        std::fs::copy(english.cache_path(), french.cache_path()).expect("copy must succeed");
        match Cache::open_for(&french) {
            Err(Error::EnvironmentMismatch { field }) => assert_eq!(field, "language"),
            other => panic!("expected a mismatch, got {:?}", other),
        }

        // Opening by path does not care.
        assert!(Cache::open(french.cache_path()).is_ok());
        assert!(Cache::open_for(&english).is_ok());
    }

    #[test]
    fn test_truncated_file_sets_read_error() {
        let temp = TestDir::temp();
        let env = build(&temp);

        // The offer list is at the very end of the file: the last run
        // is text/plain's, followed by the terminator.
        let mut data = std::fs::read(env.cache_path()).expect("read must succeed");
        data.truncate(data.len() - 20);
        let path = temp.path("truncated");
        std::fs::write(&path, &data).expect("write must succeed");

        let cache = Cache::open(&path).expect("open must succeed");
        assert!(!cache.read_error());
        assert!(cache.offers_for_mime_type("text/plain").is_empty());
        assert!(cache.read_error());
        assert!(cache.needs_rebuild(&env));

        // Clones share the flag.
        assert!(cache.clone().read_error());
    }

    #[test]
    fn test_reopen_if_changed() {
        let temp = TestDir::temp();
        let env = build(&temp);
        let mut cache = Cache::open_for(&env).expect("open must succeed");
        assert!(!cache.is_stale());
        assert!(!cache.reopen_if_changed().expect("reopen must succeed"));

        write_file(
            temp.path("data/applications/extra.desktop"),
            "[Desktop Entry]\nType=Application\nName=Extra\nExec=extra\n",
        );
        set_mtime(temp.path("data/applications"), 4_000_000_000);
        assert!(cache.needs_rebuild(&env));
        Builder::new(env.clone())
            .build()
            .expect("build must succeed");

        assert!(cache.is_stale());
        assert!(cache.service_by_menu_id("extra.desktop").is_none());
        assert!(cache.reopen_if_changed().expect("reopen must succeed"));
        assert!(!cache.is_stale());
        assert!(cache.service_by_menu_id("extra.desktop").is_some());
        assert!(!cache.needs_rebuild(&env));
    }

    fn wait_for(what: impl Fn() -> bool) -> bool {
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
        while !what() {
            if std::time::Instant::now() >= deadline {
                return false;
            }

            std::thread::sleep(std::time::Duration::from_millis(10));
        }

        true
    }

    #[test]
    fn test_watch_flags_rebuilt_cache() {
        let temp = TestDir::temp();
        let env = build(&temp);
        let mut cache = Cache::open_for(&env).expect("open must succeed");
        assert!(!cache.changed_on_disk());
        cache.watch().expect("watch must start");
        cache.watch().expect("second watch is a no-op");
        assert!(!cache.changed_on_disk());
        assert!(!cache.is_stale());

        write_file(
            temp.path("data/applications/extra.desktop"),
            "[Desktop Entry]\nType=Application\nName=Extra\nExec=extra\n",
        );
        set_mtime(temp.path("data/applications"), 4_000_000_000);
        Builder::new(env.clone())
            .build()
            .expect("build must succeed");

        assert!(wait_for(|| cache.changed_on_disk()));
        assert!(cache.is_stale());
        assert!(cache.service_by_menu_id("extra.desktop").is_none());

        // Let the build's events settle, then reopen.
        let clone = cache.clone();
        assert!(wait_for(|| {
            let before = clone.watch.as_ref().map(|w| w.changes());
            std::thread::sleep(std::time::Duration::from_millis(200));
            clone.watch.as_ref().map(|w| w.changes()) == before
        }));
        assert!(cache.reopen_if_changed().expect("reopen must succeed"));
        assert!(cache.service_by_menu_id("extra.desktop").is_some());
        assert!(!cache.changed_on_disk());
        assert!(!cache.is_stale());

        // The watch survived the reopen.
        std::fs::write(env.stamp_path(), b"not a stamp").expect("write must succeed");
        assert!(wait_for(|| cache.changed_on_disk()));
    }
}
