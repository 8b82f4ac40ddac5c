//! User and administrator overrides of the default MIME handlers,
//! read from the `mimeapps.list` files.  Files are applied least
//! local first, and each file's preferences start one step above the
//! previous file's, so that more local files win.
use std::path::Path;
use std::path::PathBuf;

use crate::config::Environment;
use crate::desktop_file::DesktopFile;
use crate::desktop_file::Group;
use crate::entry::EntryKind;
use crate::mime_db::MimeDatabase;
use crate::mime_db::SCHEME_HANDLER_PREFIX;
use crate::mime_type_factory::MimeTypeFactory;
use crate::offers::OfferTable;
use crate::service_factory::ServiceFactory;

/// Preference of the first service listed in the least local file.
pub const BASE_PREFERENCE: i32 = 1000;

/// How much each file's base preference exceeds the previous one's.
pub const PREFERENCE_STEP: i32 = 50;

/// Bonus of `[Default Applications]` over `[Added Associations]`.
const DEFAULT_APPLICATION_BONUS: i32 = 25;

const DEFAULT_APPLICATIONS: &str = "Default Applications";
const ADDED: &str = "Added Associations";
const ADDED_KDE: &str = "Added KDE Service Associations";
const REMOVED: &str = "Removed Associations";

/// One override, with the service still unresolved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Association {
    Add {
        mime_type: String,
        service: String,
        preference: i32,
    },
    Remove {
        mime_type: String,
        service: String,
    },
}

/// Every override from every association file, in application order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MimeAssociations {
    associations: Vec<Association>,
}

/// Returns the file names to look for in one directory, least
/// important first: the generic list, then one per desktop.  The
/// first desktop named is the most important.
fn file_names(desktops: &[String]) -> Vec<String> {
    let mut ret = vec!["mimeapps.list".to_string()];
    for desktop in desktops.iter().rev() {
        ret.push(format!("{}-mimeapps.list", desktop.to_lowercase()));
    }

    ret
}

impl MimeAssociations {
    pub fn new() -> MimeAssociations {
        Default::default()
    }

    /// Every path an association file may live at, in the order files
    /// are applied: data directories (under `applications/`) and then
    /// configuration directories, least local first.  Absent files
    /// are listed too, since creating one must trigger a rebuild.
    pub fn candidate_files(env: &Environment) -> Vec<PathBuf> {
        let names = file_names(env.desktops());
        let mut ret = Vec::new();
        for dir in env.data_dirs().iter().rev() {
            for name in &names {
                ret.push(dir.join("applications").join(name));
            }
        }

        for dir in env.config_dirs().iter().rev() {
            for name in &names {
                ret.push(dir.join(name));
            }
        }

        ret
    }

    /// Reads the existing files among `files`, in order.  Each file,
    /// present or not, takes up one preference step so that base
    /// preferences do not depend on which files exist.
    pub fn load(files: &[PathBuf]) -> MimeAssociations {
        let mut ret = MimeAssociations::new();
        for (idx, path) in files.iter().enumerate() {
            let base = BASE_PREFERENCE + PREFERENCE_STEP * idx as i32;
            if !path.is_file() {
                continue;
            }

            match DesktopFile::read(path) {
                Ok(file) => ret.parse(&file, base),
                Err(e) => tracing::warn!(
                    target: "sycoca",
                    path = %path.display(),
                    error = %e,
                    "failed to read association file"
                ),
            }
        }

        ret
    }

    /// Appends the overrides in `file`, with preferences counting down
    /// from `base`.
    pub fn parse(&mut self, file: &DesktopFile, base: i32) {
        if let Some(group) = file.group(DEFAULT_APPLICATIONS) {
            self.parse_added(group, base + DEFAULT_APPLICATION_BONUS);
        }

        for name in [ADDED, ADDED_KDE] {
            if let Some(group) = file.group(name) {
                self.parse_added(group, base);
            }
        }

        if let Some(group) = file.group(REMOVED) {
            for mime_type in group.keys() {
                for service in group.list(mime_type) {
                    self.associations.push(Association::Remove {
                        mime_type: mime_type.to_string(),
                        service,
                    });
                }
            }
        }
    }

    fn parse_added(&mut self, group: &Group, base: i32) {
        for mime_type in group.keys() {
            for (idx, service) in group.list(mime_type).into_iter().enumerate() {
                self.associations.push(Association::Add {
                    mime_type: mime_type.to_string(),
                    service,
                    preference: base - idx as i32,
                });
            }
        }
    }

    pub fn associations(&self) -> &[Association] {
        &self.associations
    }

    /// Applies the overrides to `table`.  Services are resolved by
    /// storage id; unknown services and undefined MIME types are
    /// skipped.  Scheme handlers get a MIME stub on demand.
    pub fn apply(
        &self,
        table: &mut OfferTable,
        db: &MimeDatabase,
        services: &ServiceFactory,
        mime_types: &mut MimeTypeFactory,
    ) {
        for association in &self.associations {
            let (mime_type, service) = match association {
                Association::Add {
                    mime_type, service, ..
                } => (mime_type, service),
                Association::Remove { mime_type, service } => (mime_type, service),
            };

            let mime_type = if mime_type.starts_with(SCHEME_HANDLER_PREFIX) {
                mime_types.add_stub(mime_type);
                mime_type.as_str()
            } else if db.contains(mime_type) {
                db.canonical(mime_type)
            } else {
                tracing::debug!(
                    target: "sycoca",
                    mime = %mime_type,
                    "association for undefined MIME type"
                );
                continue;
            };

            let service_id = match services.resolve(service) {
                Some(found) => found.storage_id(),
                None => {
                    tracing::debug!(
                        target: "sycoca",
                        mime = mime_type,
                        service = %service,
                        "association for unknown service"
                    );
                    continue;
                }
            };

            match association {
                Association::Add { preference, .. } => {
                    table.add_offer(EntryKind::MimeType, mime_type, service_id, *preference, 0)
                }
                Association::Remove { .. } => table.remove_offer(mime_type, service_id),
            }
        }
    }
}

/// Lists the existing files among `candidates`, for logging.
pub(crate) fn existing(candidates: &[PathBuf]) -> Vec<&Path> {
    candidates
        .iter()
        .map(PathBuf::as_path)
        .filter(|path| path.is_file())
        .collect()
}

#[test]
fn test_candidate_files_order() {
    use crate::config::EnvironmentBuilder;

    let env = EnvironmentBuilder::new()
        .data_dir("/home/u/.local/share")
        .data_dir("/usr/share")
        .config_dir("/home/u/.config")
        .config_dir("/etc/xdg")
        .desktop("KDE")
        .take()
        .build();

    let files = MimeAssociations::candidate_files(&env);
    let files: Vec<_> = files.iter().map(|p| p.to_string_lossy().into_owned()).collect();
    assert_eq!(
        files,
        vec![
            "/usr/share/applications/mimeapps.list",
            "/usr/share/applications/kde-mimeapps.list",
            "/home/u/.local/share/applications/mimeapps.list",
            "/home/u/.local/share/applications/kde-mimeapps.list",
            "/etc/xdg/mimeapps.list",
            "/etc/xdg/kde-mimeapps.list",
            "/home/u/.config/mimeapps.list",
            "/home/u/.config/kde-mimeapps.list",
        ]
    );
}

#[test]
fn test_parse_sections() {
    let file = DesktopFile::parse(
        "[Added Associations]\n\
         text/plain=b.desktop;a.desktop;\n\
         [Default Applications]\n\
         text/html=browser.desktop\n\
         [Removed Associations]\n\
         text/plain=c.desktop;\n\
         [Added KDE Service Associations]\n\
         image/png=viewer.desktop;\n",
    );

    let mut associations = MimeAssociations::new();
    associations.parse(&file, 1000);
    let add = |mime_type: &str, service: &str, preference| Association::Add {
        mime_type: mime_type.into(),
        service: service.into(),
        preference,
    };
    assert_eq!(
        associations.associations(),
        &[
            add("text/html", "browser.desktop", 1025),
            add("text/plain", "b.desktop", 1000),
            add("text/plain", "a.desktop", 999),
            add("image/png", "viewer.desktop", 1000),
            Association::Remove {
                mime_type: "text/plain".into(),
                service: "c.desktop".into(),
            },
        ]
    );
}

#[test]
fn test_apply() {
    use crate::service::Service;

    let mut db = MimeDatabase::new();
    db.add_type("text/plain", vec![]);
    db.add_type("text/x-csrc", vec!["text/plain".into()]);
    db.add_alias("text/x-c", "text/x-csrc");

    let mut services = ServiceFactory::new();
    for (path, menu_id) in [("a.desktop", "a.desktop"), ("kde/b.desktop", "kde-b.desktop")] {
        let mut service = Service::new(path, "Application");
        service.name = path.into();
        service.exec = "true".into();
        service.set_menu_id(menu_id);
        services.add(service);
    }

    let mut mime_types = MimeTypeFactory::from_database(&db);
    let mut table = OfferTable::new();
    table.add_offer(EntryKind::MimeType, "text/plain", "a.desktop", 10, 0);
    table.add_offer(EntryKind::MimeType, "text/plain", "kde-b.desktop", 1, 0);

    let mut associations = MimeAssociations::new();
    associations.parse(
        &DesktopFile::parse(
            "[Added Associations]\n\
             text/x-c=kde-b.desktop;missing.desktop;a.desktop\n\
             x-scheme-handler/irc=a.desktop\n\
             application/x-undefined=a.desktop\n",
        ),
        1000,
    );
    associations.parse(
        &DesktopFile::parse("[Removed Associations]\ntext/plain=kde-b.desktop\n"),
        1050,
    );
    associations.apply(&mut table, &db, &services, &mut mime_types);

    let ids = |ty: &str| -> Vec<(String, i32)> {
        table
            .sorted_offers(EntryKind::MimeType, ty)
            .into_iter()
            .map(|o| (o.service_id, o.preference))
            .collect()
    };
    // Preferences count down per listed service, unknown ones included.
    assert_eq!(
        ids("text/x-csrc"),
        vec![("kde-b.desktop".to_string(), 1000), ("a.desktop".to_string(), 998)]
    );
    assert_eq!(ids("text/plain"), vec![("a.desktop".to_string(), 10)]);
    assert!(table.is_removed("text/plain", "kde-b.desktop"));
    assert_eq!(ids("x-scheme-handler/irc"), vec![("a.desktop".to_string(), 1000)]);
    assert!(mime_types.contains("x-scheme-handler/irc"));
    assert!(ids("application/x-undefined").is_empty());
}

#[test]
fn test_load_skips_absent_files() {
    use crate::test_util::write_file;
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    write_file(
        temp.path("local/mimeapps.list"),
        "[Added Associations]\ntext/plain=a.desktop\n",
    );
    let files = vec![temp.path("global/mimeapps.list"), temp.path("local/mimeapps.list")];

    let associations = MimeAssociations::load(&files);
    assert_eq!(
        associations.associations(),
        &[Association::Add {
            mime_type: "text/plain".into(),
            service: "a.desktop".into(),
            preference: BASE_PREFERENCE + PREFERENCE_STEP,
        }]
    );
    assert_eq!(existing(&files), vec![files[1].as_path()]);
}
