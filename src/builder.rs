//! Builds the sycoca file for an [`Environment`].
//!
//! A build walks the resource directories, reuses the records of the
//! previous cache for files whose ctime did not change, evaluates the
//! menu, computes offers and writes everything to a temporary file
//! that is then renamed over the cache.  The global header is written
//! twice: first with placeholder segment offsets, then for real once
//! every segment is in place.
//!
//! Builders for the same cache serialize on a lock file.  A builder
//! that had to wait re-checks freshness once it holds the lock, and
//! usually finds that the other builder already did the work.
use std::collections::BTreeSet;
use std::io::BufWriter;
use std::io::IntoInnerError;
use std::path::Path;
use std::path::PathBuf;

use crate::benign_error::is_absent_file_error;
use crate::commit;
use crate::config::BuildOptions;
use crate::config::Environment;
use crate::ctime::ctime_of;
use crate::ctime::CTimeDict;
use crate::desktop_file::DesktopFile;
use crate::entry::EntryKind;
use crate::error::Result;
use crate::factory::BuildFactory;
use crate::factory::FactoryId;
use crate::factory::SaveContext;
use crate::group_factory::GroupFactory;
use crate::header::file_stamps;
use crate::header::read_version;
use crate::header::CacheHeader;
use crate::header::Stamp;
use crate::header::VERSION;
use crate::lock::BuildLock;
use crate::menu::build_menu;
use crate::mime_associations::MimeAssociations;
use crate::mime_db::MimeDatabase;
use crate::mime_type_factory::MimeTypeFactory;
use crate::offers::run_offsets;
use crate::offers::Offer;
use crate::offers::OfferTable;
use crate::offers::TypeKey;
use crate::resources::enumerate;
use crate::resources::Resource;
use crate::resources::ResourceFile;
use crate::resources::APPLICATIONS;
use crate::resources::DIRECTORIES;
use crate::resources::MIME_PACKAGES;
use crate::resources::SERVICES;
use crate::resources::SERVICE_TYPES;
use crate::service::Service;
use crate::service::APPLICATION_SERVICE_TYPE;
use crate::service_factory::ServiceFactory;
use crate::service_factory::ServiceIndex;
use crate::service_type::ServiceType;
use crate::service_type_factory::ServiceTypeFactory;
use crate::service_type_factory::ServiceTypeIndex;
use crate::stream::DataWriter;

/// Path recorded for the implicit `Application` service type.
const APPLICATION_TYPE_PATH: &str = "application.desktop";

/// Segments in write order.
const SEGMENT_ORDER: [FactoryId; 5] = [
    FactoryId::CTime,
    FactoryId::ServiceType,
    FactoryId::MimeType,
    FactoryId::ServiceGroup,
    FactoryId::Service,
];

/// Where a build is at.  Transitions are logged at debug level.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildState {
    NotBuilding,
    EnumeratingResources,
    /// Every file of a resource kept its ctime.
    Reusing(&'static str),
    /// Some file of a resource is new or changed.
    Rescanning(&'static str),
    BuildingMenu,
    PostProcessingOffers,
    WritingPass1,
    WritingFactoryData,
    WritingPass2,
    Committed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BuildOutcome {
    /// The cache already reflected the files on disk; nothing was
    /// written.
    UpToDate,
    Written {
        /// Resource directories (such as `applications`) with new,
        /// changed or deleted files, for change notifications.
        changed_resources: Vec<String>,
        bytes: u64,
    },
}

/// What an incremental build may reuse from the previous cache.
#[derive(Debug, Default)]
struct Previous {
    ctimes: CTimeDict,
    service_types: Vec<ServiceType>,
    services: Vec<Service>,
}

impl Previous {
    /// Loads the previous cache, if it exists and was built for `env`.
    fn load(env: &Environment) -> Option<Previous> {
        let path = env.cache_path();
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) => {
                if !is_absent_file_error(&e) {
                    tracing::warn!(target: "sycoca", path = %path.display(), error = %e, "failed to read previous cache");
                }
                return None;
            }
        };

        if read_version(&data).ok()? != VERSION {
            tracing::debug!(target: "sycoca", "previous cache has another version");
            return None;
        }

        let decode = || -> std::result::Result<Option<Previous>, crate::error::DecodeError> {
            let header = CacheHeader::read(&data)?;
            if let Err(e) = header.check(env) {
                tracing::debug!(target: "sycoca", reason = %e, "previous cache is for another environment");
                return Ok(None);
            }

            let offset = |id| header.factory_offset(id).unwrap_or(0);
            Ok(Some(Previous {
                ctimes: CTimeDict::load(&data, offset(FactoryId::CTime))?,
                service_types: ServiceTypeIndex::open(&data, offset(FactoryId::ServiceType))?.all()?,
                services: ServiceIndex::open(&data, offset(FactoryId::Service))?.all()?,
            }))
        };

        match decode() {
            Ok(previous) => previous,
            Err(e) => {
                tracing::warn!(target: "sycoca", path = %path.display(), error = %e, "previous cache is corrupt");
                None
            }
        }
    }
}

/// Checks the stamp and the cache header against the files on disk.
pub(crate) fn is_up_to_date(env: &Environment) -> bool {
    match Stamp::load(&env.stamp_path()) {
        Some(stamp) if stamp.is_current(env) => {}
        _ => return false,
    }

    let data = match std::fs::read(env.cache_path()) {
        Ok(data) => data,
        Err(_) => return false,
    };

    read_version(&data) == Ok(VERSION)
        && CacheHeader::read(&data).map_or(false, |header| header.is_fresh(env))
}

/// Every menu file that may exist, so creating one triggers a rebuild.
fn menu_candidates(env: &Environment) -> Vec<PathBuf> {
    let menu_file = env.menu_file();
    env.config_dirs()
        .iter()
        .map(|dir| dir.join(&menu_file))
        .collect()
}

fn read_desktop_file(path: &Path) -> Option<DesktopFile> {
    match DesktopFile::read(path) {
        Ok(file) => Some(file),
        Err(e) => {
            tracing::warn!(target: "sycoca", path = %path.display(), error = %e, "failed to read desktop file");
            None
        }
    }
}

fn into_file<W: std::io::Write>(writer: BufWriter<W>) -> std::io::Result<W> {
    writer.into_inner().map_err(IntoInnerError::into_error)
}

/// Builds the cache for one environment.
#[derive(Debug)]
pub struct Builder {
    env: Environment,
    options: BuildOptions,
    state: BuildState,
}

impl Builder {
    pub fn new(env: Environment) -> Builder {
        Builder {
            env,
            options: BuildOptions::default(),
            state: BuildState::NotBuilding,
        }
    }

    pub fn options(&mut self, options: BuildOptions) -> &mut Self {
        self.options = options;
        self
    }

    pub fn state(&self) -> BuildState {
        self.state
    }

    fn enter(&mut self, state: BuildState) {
        tracing::debug!(target: "sycoca", from = ?self.state, to = ?state, "build state");
        self.state = state;
    }

    /// Builds the cache unless it is up to date.
    pub fn build(&mut self) -> Result<BuildOutcome> {
        self.state = BuildState::NotBuilding;
        // A fresh cache needs no lock; readers never take it either.
        if self.options.incremental && is_up_to_date(&self.env) {
            tracing::info!(
                target: "sycoca",
                path = %self.env.cache_path().display(),
                "cache is up to date"
            );
            self.enter(BuildState::Committed);
            return Ok(BuildOutcome::UpToDate);
        }

        let lock = BuildLock::acquire(&self.env.lock_path(), self.options.lock_timeout)?;
        // Another builder may have finished while we waited.
        if self.options.incremental && is_up_to_date(&self.env) {
            tracing::info!(
                target: "sycoca",
                path = %self.env.cache_path().display(),
                waited = lock.was_contended(),
                "cache is up to date"
            );
            self.enter(BuildState::Committed);
            return Ok(BuildOutcome::UpToDate);
        }

        let ret = self.rebuild();
        if let Err(e) = commit::cleanup_temp_dir(self.env.cache_dir()) {
            tracing::debug!(target: "sycoca", error = %e, "failed to clean up temporary files");
        }

        drop(lock);
        ret
    }

    /// Enumerates the files of `resource`, records their ctime, and
    /// reports whether each one kept the ctime it had in `previous`.
    fn scan(
        &mut self,
        resource: &Resource,
        ctimes: &mut CTimeDict,
        previous: &mut CTimeDict,
        changed: &mut BTreeSet<String>,
    ) -> Vec<(ResourceFile, bool)> {
        let mut ret = Vec::new();
        for file in enumerate(self.env.data_dirs(), resource) {
            let ctime = ctime_of(
                self.env.data_dirs(),
                &format!("{}/{}", resource.dir, file.rel_path),
            );
            ctimes.insert(resource, &file.rel_path, ctime);
            let unchanged = previous.take(resource, &file.rel_path) == Some(ctime);
            ret.push((file, unchanged));
        }

        if ret.iter().all(|(_, unchanged)| *unchanged) {
            self.enter(BuildState::Reusing(resource.dir));
        } else {
            changed.insert(resource.dir.to_string());
            self.enter(BuildState::Rescanning(resource.dir));
        }

        ret
    }

    fn load_service_types(
        &mut self,
        files: Vec<(ResourceFile, bool)>,
        previous: &[ServiceType],
    ) -> ServiceTypeFactory {
        let lang = self.env.language().to_string();
        let mut ret = ServiceTypeFactory::new();
        for (file, unchanged) in files {
            let path = file.rel_path.as_str();
            if unchanged {
                if let Some(old) = previous.iter().find(|ty| ty.path() == path) {
                    ret.add(old.clone());
                    continue;
                }
            }

            let parsed = read_desktop_file(&file.path)
                .and_then(|desktop| ServiceType::from_desktop_file(path, &desktop, &lang));
            match parsed {
                Some(ty) => ret.add(ty),
                None => tracing::debug!(target: "sycoca", path = %path, "not a service type"),
            }
        }

        if ret.find(APPLICATION_SERVICE_TYPE).is_none() {
            ret.add(ServiceType::new(APPLICATION_TYPE_PATH, APPLICATION_SERVICE_TYPE));
        }

        ret
    }

    fn load_services(
        &mut self,
        resource: &Resource,
        files: Vec<(ResourceFile, bool)>,
        previous: &[Service],
        types: &ServiceTypeFactory,
        services: &mut ServiceFactory,
    ) {
        let lang = self.env.language().to_string();
        for (file, unchanged) in files {
            // Services are identified by their path relative to the
            // resource directory, whichever data directory holds them.
            let path = file.rel_path.as_str();
            let menu_id = if resource == &APPLICATIONS {
                path.replace('/', "-")
            } else {
                String::new()
            };
            if unchanged {
                if let Some(old) = previous
                    .iter()
                    .find(|s| s.path() == path && s.menu_id() == menu_id)
                {
                    services.add(old.clone());
                    continue;
                }
            }

            let desktop = match read_desktop_file(&file.path) {
                Some(desktop) => desktop,
                None => continue,
            };
            let mut service = match ServiceFactory::create_service(path, &desktop, &lang, types) {
                Some(service) => service,
                None => continue,
            };

            if resource == &APPLICATIONS {
                if !service.is_application() {
                    tracing::debug!(target: "sycoca", path = %path, "skipping non-application in applications");
                    continue;
                }

                service.set_menu_id(menu_id);
            }

            services.add(service);
        }
    }

    fn rebuild(&mut self) -> Result<BuildOutcome> {
        let mut previous = if self.options.incremental {
            Previous::load(&self.env).unwrap_or_default()
        } else {
            Previous::default()
        };
        let mut header = CacheHeader::for_environment(&self.env);

        self.enter(BuildState::EnumeratingResources);
        let mut ctimes = CTimeDict::new();
        let mut changed = BTreeSet::new();
        let mut old_ctimes = std::mem::take(&mut previous.ctimes);

        let type_files = self.scan(&SERVICE_TYPES, &mut ctimes, &mut old_ctimes, &mut changed);
        let mut service_types = self.load_service_types(type_files, &previous.service_types);

        let mut services = ServiceFactory::new();
        for resource in [SERVICES, APPLICATIONS] {
            let files = self.scan(&resource, &mut ctimes, &mut old_ctimes, &mut changed);
            self.load_services(&resource, files, &previous.services, &service_types, &mut services);
        }

        // Only their ctimes matter: MIME packages are reloaded in full,
        // directory files are read by the menu.
        for resource in [MIME_PACKAGES, DIRECTORIES] {
            self.scan(&resource, &mut ctimes, &mut old_ctimes, &mut changed);
        }

        // Whatever is left was deleted.
        changed.extend(old_ctimes.resources());

        let db = MimeDatabase::load(self.env.data_dirs());
        let mut mime_types = MimeTypeFactory::from_database(&db);

        self.enter(BuildState::BuildingMenu);
        let menu = build_menu(&self.env, &mut services, &service_types);
        let mut groups = GroupFactory::new();
        for group in menu.groups {
            groups.add(group);
        }

        self.enter(BuildState::PostProcessingOffers);
        let association_files = MimeAssociations::candidate_files(&self.env);
        tracing::debug!(
            target: "sycoca",
            files = ?crate::mime_associations::existing(&association_files),
            "applying MIME associations"
        );
        let mut table = OfferTable::new();
        services.populate_offers(&mut table, &db, &service_types, &mut mime_types);
        MimeAssociations::load(&association_files).apply(&mut table, &db, &services, &mut mime_types);
        let names: Vec<String> = mime_types.names().map(str::to_string).collect();
        table.propagate_inheritance(&db, names.iter().map(String::as_str));
        table.retain_services(|id| services.find_by_storage_id(id).is_some());

        // Service types first, then MIME types; each factory iterates
        // in the same order when it saves.
        let runs: Vec<(TypeKey, Vec<Offer>)> = service_types
            .types()
            .iter()
            .map(|ty| (EntryKind::ServiceType, ty.name.clone()))
            .chain(names.into_iter().map(|name| (EntryKind::MimeType, name)))
            .map(|key| {
                let offers = table.sorted_offers(key.0, &key.1);
                (key, offers)
            })
            .collect();
        let offsets = run_offsets(runs.iter().map(|(_, offers)| offers.len()));
        let type_count = service_types.types().len();
        for (ty, offset) in service_types.types_mut().iter_mut().zip(&offsets) {
            ty.set_offers_offset(*offset);
        }
        for (entry, offset) in mime_types.entries_mut().zip(&offsets[type_count..]) {
            entry.set_offers_offset(*offset);
        }

        let mut ctx = SaveContext {
            offer_runs: runs.into_iter().filter(|(_, offers)| !offers.is_empty()).collect(),
            ..Default::default()
        };

        let mut extra_files = association_files;
        extra_files.extend(menu_candidates(&self.env));
        for path in menu.menu_files {
            if !extra_files.contains(&path) {
                extra_files.push(path);
            }
        }
        header.extra_files = file_stamps(extra_files.iter().map(PathBuf::as_path));

        self.enter(BuildState::WritingPass1);
        let cache_dir = self.env.cache_dir().to_path_buf();
        let file = commit::new_temp_file(&cache_dir)?;
        let mut writer = DataWriter::new(BufWriter::new(file));
        header.factories = SEGMENT_ORDER.iter().map(|id| (*id, 0)).collect();
        header.write(&mut writer)?;

        self.enter(BuildState::WritingFactoryData);
        let mut factories = Vec::with_capacity(SEGMENT_ORDER.len());
        for id in SEGMENT_ORDER {
            factories.push((id, writer.offset()?));
            match id {
                FactoryId::CTime => ctimes.save(&mut writer)?,
                FactoryId::ServiceType => service_types.save(&mut writer, &mut ctx)?,
                FactoryId::MimeType => mime_types.save(&mut writer, &mut ctx)?,
                FactoryId::ServiceGroup => groups.save(&mut writer, &mut ctx)?,
                FactoryId::Service => services.save(&mut writer, &mut ctx)?,
            }
        }
        let bytes = writer.position();

        self.enter(BuildState::WritingPass2);
        header.factories = factories;
        writer.seek_to(0)?;
        header.write(&mut writer)?;
        let file = into_file(writer.into_inner()?)?;
        commit::publish(file, &self.env.cache_path())?;

        let stamp = Stamp::new(&header, &menu.extra_dirs);
        let mut writer = DataWriter::new(BufWriter::new(commit::new_temp_file(&cache_dir)?));
        stamp.write(&mut writer)?;
        commit::publish(into_file(writer.into_inner()?)?, &self.env.stamp_path())?;

        self.enter(BuildState::Committed);
        let changed_resources: Vec<String> = changed.into_iter().collect();
        tracing::info!(
            target: "sycoca",
            path = %self.env.cache_path().display(),
            bytes,
            services = services.len(),
            service_types = service_types.types().len(),
            changed = ?changed_resources,
            "wrote cache"
        );

        Ok(BuildOutcome::Written {
            changed_resources,
            bytes,
        })
    }
}

#[cfg(test)]
mod test {
    use crate::builder::*;
    use crate::config::EnvironmentBuilder;
    use crate::test_util::{set_mtime, write_file};
    use test_dir::{DirBuilder, TestDir};

    fn env(temp: &TestDir) -> Environment {
        EnvironmentBuilder::new()
            .data_dir(temp.path("data"))
            .config_dir(temp.path("config"))
            .cache_dir(temp.path("cache"))
            .take()
            .build()
    }

    fn seed(temp: &TestDir) {
        write_file(
            temp.path("data/applications/editor.desktop"),
            "[Desktop Entry]\nType=Application\nName=Editor\nExec=editor %f\nMimeType=text/plain;\n",
        );
        write_file(
            temp.path("data/services/thumbnail.desktop"),
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
             </mime-info>\n",
        );
        for path in [
            "data/applications/editor.desktop",
            "data/services/thumbnail.desktop",
            "data/servicetypes/thumbcreator.desktop",
            "data/mime/packages/text.xml",
        ] {
            set_mtime(temp.path(path), 1_000_000);
        }
    }

    fn written(outcome: BuildOutcome) -> Vec<String> {
        match outcome {
            BuildOutcome::Written {
                changed_resources,
                bytes,
            } => {
                assert!(bytes > 0);
                changed_resources
            }
            BuildOutcome::UpToDate => panic!("expected a write"),
        }
    }

    #[test]
    fn test_full_then_incremental() {
        let temp = TestDir::temp();
        seed(&temp);
        let env = env(&temp);

        let mut builder = Builder::new(env.clone());
        let changed = written(builder.build().expect("build must succeed"));
        assert_eq!(builder.state(), BuildState::Committed);
        assert_eq!(
            changed,
            vec!["applications", "mime/packages", "services", "servicetypes"]
        );
        assert!(env.cache_path().is_file());
        assert!(env.stamp_path().is_file());
        assert!(is_up_to_date(&env));

        assert_eq!(
            builder.build().expect("build must succeed"),
            BuildOutcome::UpToDate
        );

        // Touching one application only reports its resource.
        set_mtime(temp.path("data/applications/editor.desktop"), 4_000_000_000);
        let changed = written(builder.build().expect("build must succeed"));
        assert_eq!(changed, vec!["applications"]);

        // Deleting a file reports its resource even though nothing
        // replaces it.
        std::fs::remove_file(temp.path("data/services/thumbnail.desktop"))
            .expect("remove must succeed");
        set_mtime(temp.path("data/services"), 4_100_000_000);
        let changed = written(builder.build().expect("build must succeed"));
        assert_eq!(changed, vec!["services"]);
    }

    #[test]
    fn test_association_file_triggers_rebuild() {
        let temp = TestDir::temp();
        seed(&temp);
        let env = env(&temp);

        let mut builder = Builder::new(env.clone());
        written(builder.build().expect("build must succeed"));

        write_file(
            temp.path("config/mimeapps.list"),
            "[Added Associations]\ntext/plain=editor.desktop;\n",
        );
        assert!(!is_up_to_date(&env));
        // No resource changed, but the cache is rewritten.
        assert_eq!(
            written(builder.build().expect("build must succeed")),
            Vec::<String>::new()
        );
        assert_eq!(
            builder.build().expect("build must succeed"),
            BuildOutcome::UpToDate
        );
    }

    #[test]
    fn test_non_incremental_always_writes() {
        let temp = TestDir::temp();
        seed(&temp);
        let env = env(&temp);

        let mut builder = Builder::new(env);
        written(builder.build().expect("build must succeed"));
        builder.options(BuildOptions {
            incremental: false,
            ..Default::default()
        });
        let changed = written(builder.build().expect("build must succeed"));
        assert_eq!(changed.len(), 4);
    }

    #[test]
    fn test_reuses_unchanged_records() {
        let temp = TestDir::temp();
        seed(&temp);
        let env = env(&temp);
        written(Builder::new(env.clone()).build().expect("build must succeed"));

        // Corrupting a source file without changing its mtime is not
        // noticed: the record comes from the previous cache.
        write_file(
            temp.path("data/applications/editor.desktop"),
            "[Desktop Entry]\nType=Application\nName=Changed\nExec=editor\n",
        );
        set_mtime(temp.path("data/applications/editor.desktop"), 1_000_000);
        // Something else changes, so that the cache is rewritten.
        write_file(
            temp.path("data/applications/viewer.desktop"),
            "[Desktop Entry]\nType=Application\nName=Viewer\nExec=viewer\n",
        );
        set_mtime(temp.path("data/applications"), 4_000_000_000);

        let changed = written(Builder::new(env.clone()).build().expect("build must succeed"));
        assert_eq!(changed, vec!["applications"]);

        let data = std::fs::read(env.cache_path()).expect("read must succeed");
        let header = CacheHeader::read(&data).expect("header must decode");
        let services = ServiceIndex::open(
            &data,
            header
                .factory_offset(FactoryId::Service)
                .expect("service segment must exist"),
        )
        .expect("open must succeed");
        let editor = services
            .find_by_menu_id("editor.desktop")
            .expect("lookup must succeed")
            .expect("editor must exist");
        assert_eq!(editor.name, "Editor");
        assert!(services
            .find_by_menu_id("viewer.desktop")
            .expect("lookup must succeed")
            .is_some());
    }

    #[test]
    fn test_lock_timeout() {
        use crate::error::Error;
        use std::time::Duration;

        let temp = TestDir::temp();
        seed(&temp);
        let env = env(&temp);

        let _held = BuildLock::acquire(&env.lock_path(), Duration::from_secs(1))
            .expect("lock must succeed");
        let result = Builder::new(env.clone())
            .options(BuildOptions {
                incremental: true,
                lock_timeout: Duration::from_millis(50),
            })
            .build();
        assert!(matches!(result, Err(Error::LockTimeout { .. })));
        assert!(!env.cache_path().exists());
    }

    #[test]
    fn test_fresh_cache_skips_lock() {
        use crate::error::Error;
        use std::time::Duration;

        let temp = TestDir::temp();
        seed(&temp);
        let env = env(&temp);
        written(Builder::new(env.clone()).build().expect("build must succeed"));

        // A long build elsewhere does not hold up a check of a fresh
        // cache.
        let _held = BuildLock::acquire(&env.lock_path(), Duration::from_secs(1))
            .expect("lock must succeed");
        let quick = BuildOptions {
            incremental: true,
            lock_timeout: Duration::from_millis(50),
        };
        let mut builder = Builder::new(env.clone());
        assert_eq!(
            builder.options(quick).build().expect("build must succeed"),
            BuildOutcome::UpToDate
        );
        assert_eq!(builder.state(), BuildState::Committed);

        // A stale cache still has to wait for the lock.
        set_mtime(temp.path("data/applications/editor.desktop"), 4_000_000_000);
        assert!(matches!(
            Builder::new(env).options(quick).build(),
            Err(Error::LockTimeout { .. })
        ));
    }
}
