//! Sycoca is a binary cache of the desktop services, service types,
//! MIME types and application menus found in the XDG data and
//! configuration directories.  Parsing thousands of desktop files and
//! menu files on every program start is slow; instead, one builder
//! process scans everything, and writes a single file that readers
//! query with a few dictionary probes and no parsing.
//!
//! A [`Builder`] walks the resource directories of an [`Environment`]
//! (`applications/`, `services/`, `servicetypes/`, `mime/packages/`
//! and `desktop-directories/`), applies the `mimeapps.list` overrides,
//! evaluates the `applications.menu` tree, and writes the cache next
//! to a stamp file.  Builds are incremental by default: records for
//! files whose ctime did not change are copied from the previous
//! cache, and a build where nothing changed writes nothing at all.
//!
//! A [`Cache`] reads the file back, and answers lookups by name, path,
//! menu id or storage id, as well as "which services handle this
//! MIME type?" queries, best offer first.  [`OfferQuery`] adds
//! filtering on top of the raw offer lists.
//!
//! ```no_run
//! use sycoca::{BuildOutcome, Builder, Cache, Environment, OfferQuery};
//!
//! # fn main() -> sycoca::Result<()> {
//! let env = Environment::from_env();
//! if let BuildOutcome::Written { changed_resources, .. } = Builder::new(env.clone()).build()? {
//!     println!("rebuilt the cache; changed: {:?}", changed_resources);
//! }
//!
//! let cache = Cache::open_for(&env)?;
//! let editors = OfferQuery::mime_type("text/plain")
//!     .service_type("Application")
//!     .take()
//!     .services(&cache);
//! for editor in editors {
//!     println!("{} ({})", editor.name, editor.storage_id());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Concurrency
//!
//! Readers never lock.  A builder writes the new cache to a temporary
//! file under `.sycoca-tmp` in the cache directory, syncs it, and
//! renames it over the old one, so a reader sees either the previous
//! cache or the complete new one.  Builders exclude each other with
//! an advisory lock on a file next to the cache; a builder that had
//! to wait for the lock re-checks freshness first, and usually finds
//! that the other builder already did the work.
//!
//! Long-lived readers can call [`Cache::watch`] to have a background
//! watch on the cache directory notice new caches as soon as they are
//! published; [`Cache::reopen_if_changed`] then picks them up.
//!
//! # Corruption
//!
//! Lookups never return errors.  A record that fails to decode reads
//! as "not found", and sets a flag on the [`Cache`]
//! ([`Cache::read_error`]).  Once the flag is up, the whole file is
//! suspect: [`Cache::needs_rebuild`] reports true, and the caller
//! should run a full (non-incremental) build before trusting the
//! cache again.
//!
//! # Offers
//!
//! Each service is offered for the service types it declares (and
//! their ancestors), and for the MIME types it declares, with its
//! `InitialPreference`.  A service that declares both a MIME type and
//! a narrower type derived from it is only offered for the narrower
//! one.  `mimeapps.list` files then add, promote and remove offers;
//! more local files win.  Finally, every MIME type inherits the
//! offers of its parent types, one inheritance level further down,
//! except for services explicitly removed for the type.  Offers are
//! sorted by inheritance level, then by decreasing preference.
mod benign_error;
pub mod builder;
mod commit;
pub mod config;
mod ctime;
pub mod desktop_file;
mod dict;
pub mod entry;
pub mod error;
mod factory;
mod group_factory;
pub mod header;
mod lock;
mod menu;
mod mime_associations;
pub mod mime_db;
pub mod mime_type;
mod mime_type_factory;
pub mod offers;
pub mod property;
pub mod reader;
mod resources;
pub mod service;
mod service_factory;
pub mod service_group;
pub mod service_type;
mod service_type_factory;
mod stream;
pub mod trader;
pub mod watch;

#[cfg(test)]
mod scenario_tests;
#[cfg(test)]
mod test_util;

pub use builder::BuildOutcome;
pub use builder::BuildState;
pub use builder::Builder;
pub use config::BuildOptions;
pub use config::Environment;
pub use config::EnvironmentBuilder;
pub use config::UserDirs;
pub use entry::Entry;
pub use entry::EntryKind;
pub use error::Error;
pub use error::Result;
pub use header::VERSION;
pub use mime_type::MimeTypeEntry;
pub use offers::ServiceOffer;
pub use property::Property;
pub use property::PropertyType;
pub use reader::Cache;
pub use reader::GroupItem;
pub use service::Service;
pub use service::ServiceAction;
pub use service_group::GroupChild;
pub use service_group::ServiceGroup;
pub use service_type::ServiceType;
pub use trader::OfferQuery;
pub use watch::CacheWatch;
