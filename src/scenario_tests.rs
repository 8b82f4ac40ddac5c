//! End-to-end checks: build a cache from fake data directories, then
//! query it like a client would.
use test_dir::{DirBuilder, TestDir};

use crate::builder::BuildOutcome;
use crate::builder::Builder;
use crate::config::BuildOptions;
use crate::config::Environment;
use crate::config::EnvironmentBuilder;
use crate::reader::Cache;
use crate::service::Service;
use crate::test_util::{set_mtime, write_file};

const TEXT_TYPES: &str = "<?xml version=\"1.0\"?>\n\
<mime-info xmlns=\"http://www.freedesktop.org/standards/shared-mime-info\">\n\
  <mime-type type=\"text/plain\"/>\n\
  <mime-type type=\"text/x-csrc\">\n\
    <sub-class-of type=\"text/plain\"/>\n\
  </mime-type>\n\
</mime-info>\n";

fn app(temp: &TestDir, path: &str, name: &str, extra: &str) {
    write_file(
        temp.path(path),
        &format!(
            "[Desktop Entry]\nType=Application\nName={}\nExec={} %f\n{}",
            name,
            name.to_lowercase(),
            extra
        ),
    );
}

fn offer_names(cache: &Cache, mime_type: &str) -> Vec<String> {
    cache
        .offers_for_mime_type(mime_type)
        .into_iter()
        .map(|offer| offer.service.name)
        .collect()
}

#[test]
fn test_association_order_and_removal() {
    let temp = TestDir::temp();
    write_file(temp.path("data/mime/packages/text.xml"), TEXT_TYPES);
    app(&temp, "data/applications/a.desktop", "A", "MimeType=text/plain;\nInitialPreference=10\n");
    app(&temp, "data/applications/b.desktop", "B", "MimeType=text/plain;\n");
    write_file(
        temp.path("config/global/mimeapps.list"),
        "[Added Associations]\ntext/plain=b.desktop;\n",
    );

    let env = EnvironmentBuilder::new()
        .data_dir(temp.path("data"))
        .config_dir(temp.path("config/local"))
        .config_dir(temp.path("config/global"))
        .cache_dir(temp.path("cache"))
        .take()
        .build();
    let mut builder = Builder::new(env.clone());
    builder.build().expect("build must succeed");

    let cache = Cache::open_for(&env).expect("open must succeed");
    assert_eq!(offer_names(&cache, "text/plain"), vec!["B", "A"]);
    assert_eq!(offer_names(&cache, "text/x-csrc"), vec!["B", "A"]);
    assert!(cache
        .offers_for_mime_type("text/x-csrc")
        .iter()
        .all(|offer| offer.mime_type_inheritance_level == 1));

    // A more local file removes B again.
    write_file(
        temp.path("config/local/mimeapps.list"),
        "[Removed Associations]\ntext/plain=b.desktop;\n",
    );
    assert!(cache.needs_rebuild(&env));
    assert!(matches!(
        builder.build().expect("build must succeed"),
        BuildOutcome::Written { .. }
    ));

    let cache = Cache::open_for(&env).expect("open must succeed");
    assert_eq!(offer_names(&cache, "text/plain"), vec!["A"]);
    assert_eq!(offer_names(&cache, "text/x-csrc"), vec!["A"]);
    // B still exists; it is just not offered for text anymore.
    assert!(cache.service_by_storage_id("b.desktop").is_some());
}

#[test]
fn test_local_addition_over_global_removal() {
    let temp = TestDir::temp();
    write_file(temp.path("data/mime/packages/text.xml"), TEXT_TYPES);
    app(&temp, "data/applications/a.desktop", "A", "MimeType=text/plain;\nInitialPreference=10\n");
    app(&temp, "data/applications/b.desktop", "B", "MimeType=text/plain;\n");
    write_file(
        temp.path("config/global/mimeapps.list"),
        "[Removed Associations]\ntext/plain=b.desktop;\n",
    );
    write_file(
        temp.path("config/local/mimeapps.list"),
        "[Added Associations]\ntext/plain=b.desktop;\n",
    );

    let env = EnvironmentBuilder::new()
        .data_dir(temp.path("data"))
        .config_dir(temp.path("config/local"))
        .config_dir(temp.path("config/global"))
        .cache_dir(temp.path("cache"))
        .take()
        .build();
    let mut builder = Builder::new(env.clone());
    builder.build().expect("build must succeed");

    // The more local file is applied last, so its addition stands.
    let cache = Cache::open_for(&env).expect("open must succeed");
    assert_eq!(offer_names(&cache, "text/plain"), vec!["B", "A"]);
    assert_eq!(offer_names(&cache, "text/x-csrc"), vec!["B", "A"]);

    // A removal for the subtype keeps B from being inherited there,
    // even though the parent offers it.
    write_file(
        temp.path("config/global/mimeapps.list"),
        "[Removed Associations]\ntext/plain=b.desktop;\ntext/x-csrc=b.desktop;\n",
    );
    set_mtime(temp.path("config/global/mimeapps.list"), 4_000_000_000);
    assert!(cache.needs_rebuild(&env));
    builder.build().expect("build must succeed");

    let cache = Cache::open_for(&env).expect("open must succeed");
    assert_eq!(offer_names(&cache, "text/plain"), vec!["B", "A"]);
    assert_eq!(offer_names(&cache, "text/x-csrc"), vec!["A"]);
}

#[test]
fn test_no_duplicate_offer_for_parent_type() {
    let temp = TestDir::temp();
    write_file(temp.path("data/mime/packages/text.xml"), TEXT_TYPES);
    app(
        &temp,
        "data/applications/ide.desktop",
        "Ide",
        "MimeType=text/plain;text/x-csrc;\n",
    );
    app(&temp, "data/applications/notepad.desktop", "Notepad", "MimeType=text/plain;\n");

    let env = EnvironmentBuilder::new()
        .data_dir(temp.path("data"))
        .config_dir(temp.path("config"))
        .cache_dir(temp.path("cache"))
        .take()
        .build();
    Builder::new(env.clone())
        .build()
        .expect("build must succeed");
    let cache = Cache::open_for(&env).expect("open must succeed");

    // The narrower declaration wins: Ide is registered for
    // text/x-csrc only.
    assert_eq!(offer_names(&cache, "text/plain"), vec!["Notepad"]);

    let csrc = cache.offers_for_mime_type("text/x-csrc");
    let ide: Vec<_> = csrc.iter().filter(|o| o.service.name == "Ide").collect();
    assert_eq!(ide.len(), 1);
    assert_eq!(ide[0].mime_type_inheritance_level, 0);
    assert_eq!(offer_names(&cache, "text/x-csrc"), vec!["Ide", "Notepad"]);
}

fn idempotence_env(temp: &TestDir) -> Environment {
    write_file(temp.path("data/mime/packages/text.xml"), TEXT_TYPES);
    app(temp, "data/applications/kate.desktop", "Kate", "MimeType=text/plain;\nCategories=Utility;\n");
    app(temp, "data/applications/gimp.desktop", "Gimp", "Categories=Graphics;\n");
    write_file(
        temp.path("config/menus/applications.menu"),
        "<Menu>\n  <Name>Applications</Name>\n  <DefaultAppDirs/>\n\
         <Menu>\n    <Name>Utilities</Name>\n    <Include><Category>Utility</Category></Include>\n  </Menu>\n\
         <Menu>\n    <Name>Graphics</Name>\n    <Include><Category>Graphics</Category></Include>\n  </Menu>\n\
         </Menu>\n",
    );

    EnvironmentBuilder::new()
        .data_dir(temp.path("data"))
        .config_dir(temp.path("config"))
        .cache_dir(temp.path("cache"))
        .take()
        .build()
}

/// What clients see of services, regardless of where they are stored.
fn summary(services: &[Service]) -> Vec<(String, String, Vec<String>)> {
    let mut ret: Vec<_> = services
        .iter()
        .map(|s| (s.storage_id().to_string(), s.name.clone(), s.mime_types.clone()))
        .collect();
    ret.sort();
    ret
}

#[test]
fn test_incremental_idempotence() {
    let temp = TestDir::temp();
    let env = idempotence_env(&temp);

    let mut builder = Builder::new(env.clone());
    assert!(matches!(
        builder.build().expect("build must succeed"),
        BuildOutcome::Written { .. }
    ));
    let first = std::fs::read(env.cache_path()).expect("read must succeed");

    assert_eq!(
        builder.build().expect("build must succeed"),
        BuildOutcome::UpToDate
    );
    assert_eq!(
        std::fs::read(env.cache_path()).expect("read must succeed"),
        first
    );

    let incremental = Cache::open_for(&env).expect("open must succeed");
    let incremental_services = summary(&incremental.all_services());
    let incremental_groups: Vec<_> = ["", "Utilities/", "Graphics/"]
        .iter()
        .map(|path| incremental.group(path).map(|g| g.children))
        .collect();
    assert!(incremental_groups.iter().all(Option::is_some));

    // A full rebuild produces the same contents.
    builder.options(BuildOptions {
        incremental: false,
        ..Default::default()
    });
    builder.build().expect("build must succeed");
    let full = Cache::open_for(&env).expect("open must succeed");
    assert_eq!(summary(&full.all_services()), incremental_services);
    assert_eq!(
        ["", "Utilities/", "Graphics/"]
            .iter()
            .map(|path| full.group(path).map(|g| g.children))
            .collect::<Vec<_>>(),
        incremental_groups
    );
    assert_eq!(
        offer_names(&full, "text/plain"),
        offer_names(&incremental, "text/plain")
    );
    assert!(!full.read_error());
    assert!(!incremental.read_error());
}

#[test]
fn test_storage_id_uniqueness() {
    let temp = TestDir::temp();
    write_file(temp.path("global/mime/packages/text.xml"), TEXT_TYPES);
    app(&temp, "global/applications/kate.desktop", "Global Kate", "MimeType=text/plain;\n");
    app(&temp, "local/applications/kate.desktop", "Local Kate", "MimeType=text/plain;\n");
    app(&temp, "global/applications/gimp.desktop", "Gimp", "");
    for (dir, name) in [("global", "Global Daemon"), ("local", "Local Daemon")] {
        write_file(
            temp.path(&format!("{}/services/kded/daemon.desktop", dir)),
            &format!("[Desktop Entry]\nType=Service\nName={}\n", name),
        );
    }

    let env = EnvironmentBuilder::new()
        .data_dir(temp.path("local"))
        .data_dir(temp.path("global"))
        .config_dir(temp.path("config"))
        .cache_dir(temp.path("cache"))
        .take()
        .build();
    Builder::new(env.clone())
        .build()
        .expect("build must succeed");
    let cache = Cache::open_for(&env).expect("open must succeed");

    let services = cache.all_services();
    let mut ids: Vec<&str> = services.iter().map(|s| s.storage_id()).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec!["gimp.desktop", "kate.desktop", "kded/daemon.desktop"]);

    assert_eq!(
        cache
            .service_by_storage_id("kate.desktop")
            .map(|s| s.name),
        Some("Local Kate".to_string())
    );
    assert_eq!(offer_names(&cache, "text/plain"), vec!["Local Kate"]);

    // Plugins override by relative path too.
    assert_eq!(
        cache
            .service_by_desktop_path("kded/daemon.desktop")
            .map(|s| s.name),
        Some("Local Daemon".to_string())
    );
}
