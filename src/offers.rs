//! Offers associate services with the service types and MIME types
//! they handle, weighted by a preference and by how far up the MIME
//! inheritance chain the association was declared.
//!
//! While building, the [`OfferTable`] collects offers by type name
//! and service storage id.  Once every offset is known, the sorted
//! lists are flattened into one shared on-disk list of 16-byte
//! tuples `(type offset, service offset, preference, level)`,
//! terminated by a zero tuple.  Each type's record stores where its
//! run of tuples starts, relative to the start of that list.
use std::collections::HashMap;
use std::collections::HashSet;
use std::io::Seek;
use std::io::Write;

use crate::entry::EntryKind;
use crate::error::DecodeError;
use crate::mime_db::MimeDatabase;
use crate::service::Service;
use crate::stream::DataReader;
use crate::stream::DataWriter;

/// Size of one on-disk offer.
pub(crate) const OFFER_SIZE: i32 = 16;

/// A build-time offer: one service for one type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Offer {
    pub service_id: String,
    pub preference: i32,
    /// 0 for direct associations, `n` for offers inherited from the
    /// `n`th ancestor MIME type.
    pub level: i32,
}

/// A service offered for a type, as read back from the cache.
#[derive(Clone, Debug, PartialEq)]
pub struct ServiceOffer {
    pub service: Service,
    pub preference: i32,
    pub mime_type_inheritance_level: i32,
}

/// Sorts offers best first: direct before inherited, then by
/// decreasing preference.  Ties keep their insertion order.
pub fn sort_offers(offers: &mut [Offer]) {
    offers.sort_by(|x, y| {
        x.level
            .cmp(&y.level)
            .then_with(|| y.preference.cmp(&x.preference))
    });
}

/// Service types and MIME types are separate namespaces: offers are
/// keyed by the kind of the type as well as its name.
pub(crate) type TypeKey = (EntryKind, String);

fn key(kind: EntryKind, type_name: &str) -> TypeKey {
    (kind, type_name.to_string())
}

/// The offers of every type.
#[derive(Clone, Debug, Default)]
pub struct OfferTable {
    offers: HashMap<TypeKey, Vec<Offer>>,
    /// Services withdrawn from a MIME type by an association file.
    removed: HashMap<String, HashSet<String>>,
}

impl OfferTable {
    pub fn new() -> OfferTable {
        Default::default()
    }

    /// Offers `service_id` for the type.  If the service is already
    /// offered, the existing offer stays in place and keeps the higher
    /// of the two preferences.
    pub fn add_offer(
        &mut self,
        kind: EntryKind,
        type_name: &str,
        service_id: &str,
        preference: i32,
        level: i32,
    ) {
        let offers = self.offers.entry(key(kind, type_name)).or_default();
        match offers.iter_mut().find(|o| o.service_id == service_id) {
            Some(existing) => existing.preference = existing.preference.max(preference),
            None => offers.push(Offer {
                service_id: service_id.to_string(),
                preference,
                level,
            }),
        }
    }

    /// Withdraws `service_id` for `mime_type`, and remembers that it
    /// must not come back through inheritance.
    pub fn remove_offer(&mut self, mime_type: &str, service_id: &str) {
        self.removed
            .entry(mime_type.to_string())
            .or_default()
            .insert(service_id.to_string());
        if let Some(offers) = self.offers.get_mut(&key(EntryKind::MimeType, mime_type)) {
            offers.retain(|o| o.service_id != service_id);
        }
    }

    pub fn is_removed(&self, mime_type: &str, service_id: &str) -> bool {
        self.removed
            .get(mime_type)
            .map(|set| set.contains(service_id))
            .unwrap_or(false)
    }

    /// Returns the offers for the type in insertion order.
    pub fn offers_for(&self, kind: EntryKind, type_name: &str) -> &[Offer] {
        self.offers
            .get(&key(kind, type_name))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Returns the offers for the type, best first.
    pub fn sorted_offers(&self, kind: EntryKind, type_name: &str) -> Vec<Offer> {
        let mut ret = self.offers_for(kind, type_name).to_vec();
        sort_offers(&mut ret);
        ret
    }

    /// Drops offers for services that `keep` rejects.
    pub fn retain_services(&mut self, keep: impl Fn(&str) -> bool) {
        for offers in self.offers.values_mut() {
            offers.retain(|o| keep(&o.service_id));
        }
    }

    /// Copies the offers of every MIME type's ancestors into the type,
    /// one level further down per generation, except for services
    /// explicitly removed for the type.  Each type is completed once;
    /// later descendants copy its finished list.
    pub fn propagate_inheritance<'a>(
        &mut self,
        db: &MimeDatabase,
        mime_types: impl IntoIterator<Item = &'a str>,
    ) {
        let mut complete = HashSet::new();
        for mime_type in mime_types {
            let mut in_progress = Vec::new();
            self.collect_inherited(db, mime_type, &mut complete, &mut in_progress);
        }
    }

    fn collect_inherited(
        &mut self,
        db: &MimeDatabase,
        mime_type: &str,
        complete: &mut HashSet<String>,
        in_progress: &mut Vec<String>,
    ) {
        // `in_progress` breaks inheritance cycles.
        if complete.contains(mime_type) || in_progress.iter().any(|t| t == mime_type) {
            return;
        }

        in_progress.push(mime_type.to_string());
        for parent in db.parents(mime_type) {
            // Parents first: their lists must be complete before we
            // copy them.
            self.collect_inherited(db, &parent, complete, in_progress);

            let inherited = self.offers_for(EntryKind::MimeType, &parent).to_vec();
            for offer in inherited {
                if !self.is_removed(mime_type, &offer.service_id) {
                    self.add_offer(
                        EntryKind::MimeType,
                        mime_type,
                        &offer.service_id,
                        offer.preference,
                        offer.level + 1,
                    );
                }
            }
        }

        in_progress.pop();
        complete.insert(mime_type.to_string());
    }
}

/// One type's run in the shared offer list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct OfferRun {
    pub type_offset: i32,
    /// `(service offset, preference, level)`, best first.
    pub offers: Vec<(i32, i32, i32)>,
}

/// Returns the start of each run relative to the list start, or -1
/// for empty runs, in the order the runs will be written.
pub(crate) fn run_offsets(lengths: impl IntoIterator<Item = usize>) -> Vec<i32> {
    let mut next = 0i32;
    lengths
        .into_iter()
        .map(|len| {
            if len == 0 {
                return -1;
            }

            let ret = next;
            next += OFFER_SIZE * len as i32;
            ret
        })
        .collect()
}

/// Writes the shared offer list.  Runs must come in the order given to
/// [`run_offsets`].
pub(crate) fn write_offer_list<W: Write + Seek>(
    writer: &mut DataWriter<W>,
    runs: &[OfferRun],
) -> std::io::Result<()> {
    for run in runs {
        for (service_offset, preference, level) in &run.offers {
            writer.write_i32(run.type_offset)?;
            writer.write_i32(*service_offset)?;
            writer.write_i32(*preference)?;
            writer.write_i32(*level)?;
        }
    }

    for _ in 0..4 {
        writer.write_i32(0)?;
    }

    Ok(())
}

/// Reads the run of the type at `type_offset`, starting `offers_offset`
/// bytes into the list at `list_start`.  Returns
/// `(service offset, preference, level)` tuples.
pub(crate) fn read_offer_run(
    data: &[u8],
    list_start: i32,
    offers_offset: i32,
    type_offset: i32,
) -> Result<Vec<(i32, i32, i32)>, DecodeError> {
    let mut ret = Vec::new();
    if offers_offset < 0 {
        return Ok(ret);
    }

    let start = i64::from(list_start) + i64::from(offers_offset);
    let mut reader = DataReader::at(data, start)?;
    loop {
        let ty = reader.read_i32()?;
        if ty != type_offset {
            return Ok(ret);
        }

        let service = reader.read_i32()?;
        let preference = reader.read_i32()?;
        let level = reader.read_i32()?;
        ret.push((service, preference, level));
    }
}

#[cfg(test)]
mod test {
    use crate::entry::EntryKind;
    use crate::mime_db::MimeDatabase;
    use crate::offers::*;
    use proptest::collection::vec;
    use proptest::prelude::*;
    use proptest_derive::Arbitrary;

    #[derive(Arbitrary, Clone, Debug)]
    struct TestOffer(#[proptest(strategy = "-5..5i32")] i32, #[proptest(strategy = "0..4i32")] i32);

    const MIME: EntryKind = EntryKind::MimeType;

    fn ids(offers: &[Offer]) -> Vec<&str> {
        offers.iter().map(|o| o.service_id.as_str()).collect()
    }

    fn text_db() -> MimeDatabase {
        let mut db = MimeDatabase::new();
        db.add_type("text/plain", vec![]);
        db.add_type("text/x-csrc", vec!["text/plain".into()]);
        db.add_type("text/x-c++src", vec!["text/x-csrc".into()]);
        db
    }

    #[test]
    fn test_add_dedups() {
        let mut table = OfferTable::new();
        table.add_offer(MIME, "text/plain", "a.desktop", 1, 0);
        table.add_offer(MIME, "text/plain", "b.desktop", 5, 0);
        table.add_offer(MIME, "text/plain", "a.desktop", 10, 0);
        table.add_offer(MIME, "text/plain", "b.desktop", 2, 0);

        let offers = table.offers_for(MIME, "text/plain");
        assert_eq!(ids(offers), vec!["a.desktop", "b.desktop"]);
        assert_eq!(offers[0].preference, 10);
        assert_eq!(offers[1].preference, 5);
        assert_eq!(ids(&table.sorted_offers(MIME, "text/plain")), vec!["a.desktop", "b.desktop"]);
        assert!(table.offers_for(MIME, "image/png").is_empty());
    }

    #[test]
    fn test_sort_order() {
        let mut offers = vec![
            Offer { service_id: "inherited".into(), preference: 100, level: 1 },
            Offer { service_id: "low".into(), preference: 1, level: 0 },
            Offer { service_id: "high".into(), preference: 50, level: 0 },
            Offer { service_id: "low2".into(), preference: 1, level: 0 },
        ];
        sort_offers(&mut offers);
        assert_eq!(ids(&offers), vec!["high", "low", "low2", "inherited"]);
    }

    #[test]
    fn test_propagation() {
        let db = text_db();
        let mut table = OfferTable::new();
        table.add_offer(MIME, "text/plain", "editor.desktop", 1, 0);
        table.add_offer(MIME, "text/plain", "viewer.desktop", 3, 0);
        table.add_offer(MIME, "text/x-csrc", "ide.desktop", 1, 0);
        table.remove_offer("text/x-csrc", "viewer.desktop");

        // Children before parents: the parents are handled first
        // anyway.
        table.propagate_inheritance(&db, vec!["text/x-c++src", "text/x-csrc", "text/plain"]);

        let cpp = table.sorted_offers(MIME, "text/x-c++src");
        assert_eq!(ids(&cpp), vec!["ide.desktop", "editor.desktop"]);
        assert_eq!(cpp[0].level, 1);
        assert_eq!(cpp[1].level, 2);

        let c = table.sorted_offers(MIME, "text/x-csrc");
        assert_eq!(ids(&c), vec!["ide.desktop", "editor.desktop"]);
        assert!(table.is_removed("text/x-csrc", "viewer.desktop"));

        // The root type only has its direct offers.
        assert_eq!(
            ids(&table.sorted_offers(MIME, "text/plain")),
            vec!["viewer.desktop", "editor.desktop"]
        );
    }

    #[test]
    fn test_retain_services() {
        let mut table = OfferTable::new();
        table.add_offer(EntryKind::ServiceType, "Application", "a.desktop", 1, 0);
        table.add_offer(EntryKind::ServiceType, "Application", "gone.desktop", 1, 0);
        table.retain_services(|id| id != "gone.desktop");
        assert_eq!(ids(table.offers_for(EntryKind::ServiceType, "Application")), vec!["a.desktop"]);
    }

    #[test]
    fn test_kinds_do_not_collide() {
        let db = text_db();
        let mut table = OfferTable::new();
        table.add_offer(EntryKind::ServiceType, "text/plain", "plugin.desktop", 1, 0);
        table.add_offer(MIME, "text/plain", "editor.desktop", 1, 0);
        table.propagate_inheritance(&db, vec!["text/x-csrc"]);

        assert_eq!(
            ids(table.offers_for(EntryKind::ServiceType, "text/plain")),
            vec!["plugin.desktop"]
        );
        assert_eq!(ids(table.offers_for(MIME, "text/plain")), vec!["editor.desktop"]);
        assert_eq!(ids(table.offers_for(MIME, "text/x-csrc")), vec!["editor.desktop"]);
        assert!(table.offers_for(EntryKind::ServiceType, "text/x-csrc").is_empty());
    }

    #[test]
    fn test_offer_list_layout() {
        let runs = vec![
            OfferRun { type_offset: 100, offers: vec![(500, 10, 0), (600, 1, 0)] },
            OfferRun { type_offset: 200, offers: vec![] },
            OfferRun { type_offset: 300, offers: vec![(600, 1, 1)] },
        ];
        let offsets = run_offsets(runs.iter().map(|r| r.offers.len()));
        assert_eq!(offsets, vec![0, -1, 32]);

        let mut writer = DataWriter::new(std::io::Cursor::new(Vec::new()));
        writer.write_i32(0).expect("write must succeed");
        write_offer_list(&mut writer, &runs).expect("write must succeed");
        let bytes = writer.into_inner().expect("flush").into_inner();
        assert_eq!(bytes.len(), 4 + 16 * 4);

        assert_eq!(
            read_offer_run(&bytes, 4, 0, 100),
            Ok(vec![(500, 10, 0), (600, 1, 0)])
        );
        assert_eq!(read_offer_run(&bytes, 4, -1, 200), Ok(vec![]));
        assert_eq!(read_offer_run(&bytes, 4, 32, 300), Ok(vec![(600, 1, 1)]));
        assert!(read_offer_run(&bytes, 4, 1000, 300).is_err());
    }

    proptest! {
        /// Lower levels always come first; within a level, higher
        /// preferences come first; equal keys keep insertion order.
        #[test]
        fn test_sort_oracle(inputs in vec(any::<TestOffer>(), 0..30usize)) {
            let mut offers: Vec<Offer> = inputs
                .iter()
                .enumerate()
                .map(|(idx, TestOffer(preference, level))| Offer {
                    service_id: format!("{:03}", idx),
                    preference: *preference,
                    level: *level,
                })
                .collect();
            sort_offers(&mut offers);

            for pair in offers.windows(2) {
                let (a, b) = (&pair[0], &pair[1]);
                assert!(a.level <= b.level);
                if a.level == b.level {
                    assert!(a.preference >= b.preference);
                    if a.preference == b.preference {
                        assert!(a.service_id < b.service_id);
                    }
                }
            }
        }

        /// Removing a service for a type keeps it out, whatever its
        /// ancestors offer.
        #[test]
        fn test_removal_dominance(parent_pref in -5..5i32, remove_at in 0..3usize) {
            let db = text_db();
            let chain = ["text/plain", "text/x-csrc", "text/x-c++src"];
            let mut table = OfferTable::new();
            table.add_offer(MIME, "text/plain", "b.desktop", parent_pref, 0);
            table.add_offer(MIME, "text/plain", "a.desktop", 0, 0);
            table.remove_offer(chain[remove_at], "b.desktop");
            table.propagate_inheritance(&db, chain.iter().copied());

            for ty in &chain[remove_at..] {
                assert!(!ids(table.offers_for(MIME, ty)).contains(&"b.desktop"));
                assert!(ids(table.offers_for(MIME, ty)).contains(&"a.desktop"));
            }
        }
    }
}
