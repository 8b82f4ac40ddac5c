//! Offer queries: the services of a MIME type or service type, best
//! first, optionally filtered.
use derivative::Derivative;

use crate::offers::ServiceOffer;
use crate::reader::Cache;
use crate::service::Service;

type Matcher<'a> = Box<dyn Fn(&Service) -> bool + 'a>;

#[derive(Clone, Debug, PartialEq, Eq)]
enum Target {
    MimeType(String),
    ServiceType(String),
}

/// A query for the offers of one type.
///
/// ```ignore
/// let editors = OfferQuery::mime_type("text/plain")
///     .service_type("Application")
///     .matching(|service| !service.terminal)
///     .take()
///     .services(&cache);
/// ```
#[derive(Derivative)]
#[derivative(Debug)]
pub struct OfferQuery<'a> {
    target: Target,
    /// Keep only services that also have this service type.
    service_type: Option<String>,
    /// Keep offers inherited from a parent MIME type.
    inherited: bool,
    limit: Option<usize>,

    #[derivative(Debug = "ignore")]
    matcher: Option<Matcher<'a>>,
}

impl<'a> OfferQuery<'a> {
    fn new(target: Target) -> Self {
        OfferQuery {
            target,
            service_type: None,
            inherited: true,
            limit: None,
            matcher: None,
        }
    }

    /// Queries the services that handle the MIME type `name`.
    pub fn mime_type(name: impl Into<String>) -> Self {
        Self::new(Target::MimeType(name.into()))
    }

    /// Queries the services of type `name`, or of a type derived from
    /// it.
    pub fn of_service_type(name: impl Into<String>) -> Self {
        Self::new(Target::ServiceType(name.into()))
    }

    /// Only returns services that also have the service type `name`,
    /// e.g., `Application` for the applications that open a MIME type.
    pub fn service_type(&mut self, name: impl Into<String>) -> &mut Self {
        self.service_type = Some(name.into());
        self
    }

    /// Whether to return offers inherited from parent MIME types.
    /// Defaults to true.
    pub fn inherited(&mut self, inherited: bool) -> &mut Self {
        self.inherited = inherited;
        self
    }

    /// Returns at most `limit` offers.
    pub fn limit(&mut self, limit: usize) -> &mut Self {
        self.limit = Some(limit);
        self
    }

    /// Only returns services for which `matcher` is true.
    pub fn matching(&mut self, matcher: impl Fn(&Service) -> bool + 'a) -> &mut Self {
        self.matcher = Some(Box::new(matcher));
        self
    }

    /// Moves the query out of the builder chain.
    pub fn take(&mut self) -> Self {
        let target = self.target.clone();
        std::mem::replace(self, Self::new(target))
    }

    fn accepts(&self, offer: &ServiceOffer) -> bool {
        if !self.inherited && offer.mime_type_inheritance_level > 0 {
            return false;
        }

        if let Some(ty) = &self.service_type {
            if !offer.service.has_service_type(ty) {
                return false;
            }
        }

        match &self.matcher {
            Some(matcher) => matcher(&offer.service),
            None => true,
        }
    }

    /// Runs the query against `cache`.  Offers come best first.
    pub fn offers(&self, cache: &Cache) -> Vec<ServiceOffer> {
        let offers = match &self.target {
            Target::MimeType(name) => cache.offers_for_mime_type(name),
            Target::ServiceType(name) => cache.offers_for_service_type(name),
        };

        let ret: Vec<ServiceOffer> = offers
            .into_iter()
            .filter(|offer| self.accepts(offer))
            .take(self.limit.unwrap_or(usize::MAX))
            .collect();
        tracing::debug!(target: "sycoca", query = ?self, count = ret.len(), "ran offer query");
        ret
    }

    /// Same as [`OfferQuery::offers`], without the offer details.
    pub fn services(&self, cache: &Cache) -> Vec<Service> {
        self.offers(cache)
            .into_iter()
            .map(|offer| offer.service)
            .collect()
    }

    /// Returns the best service, if any.
    pub fn preferred(&self, cache: &Cache) -> Option<Service> {
        self.offers(cache).into_iter().next().map(|offer| offer.service)
    }
}

#[cfg(test)]
mod test {
    use crate::builder::Builder;
    use crate::config::EnvironmentBuilder;
    use crate::config::Environment;
    use crate::trader::*;
    use crate::test_util::write_file;
    use test_dir::{DirBuilder, TestDir};

    fn build(temp: &TestDir) -> Environment {
        write_file(
            temp.path("data/applications/kate.desktop"),
            "[Desktop Entry]\nType=Application\nName=Kate\nExec=kate %U\n\
             MimeType=text/plain;\nInitialPreference=8\n",
        );
        write_file(
            temp.path("data/applications/vim.desktop"),
            "[Desktop Entry]\nType=Application\nName=Vim\nExec=vim %f\n\
             Terminal=true\nMimeType=text/plain;\nInitialPreference=2\n",
        );
        write_file(
            temp.path("data/applications/viewer.desktop"),
            "[Desktop Entry]\nType=Application\nName=Viewer\nExec=viewer %f\n\
             MimeType=text/x-csrc;\nInitialPreference=3\n",
        );
        write_file(
            temp.path("data/services/textpart.desktop"),
            "[Desktop Entry]\nType=Service\nName=Text Part\n\
             X-KDE-ServiceTypes=KParts/ReadOnlyPart;\nMimeType=text/plain;\n",
        );
        write_file(
            temp.path("data/servicetypes/readonlypart.desktop"),
            "[Desktop Entry]\nType=ServiceType\nX-KDE-ServiceType=KParts/ReadOnlyPart\n",
        );
        write_file(
            temp.path("data/mime/packages/text.xml"),
            "<?xml version=\"1.0\"?>\n\
             <mime-info xmlns=\"http://www.freedesktop.org/standards/shared-mime-info\">\n\
               <mime-type type=\"text/plain\"/>\n\
               <mime-type type=\"text/x-csrc\">\n\
                 <sub-class-of type=\"text/plain\"/>\n\
               </mime-type>\n\
             </mime-info>\n",
        );

        let env = EnvironmentBuilder::new()
            .data_dir(temp.path("data"))
            .config_dir(temp.path("config"))
            .cache_dir(temp.path("cache"))
            .take()
            .build();
        Builder::new(env.clone())
            .build()
            .expect("build must succeed");
        env
    }

    fn names(services: &[Service]) -> Vec<&str> {
        services.iter().map(|s| s.name.as_str()).collect()
    }

    #[test]
    fn test_mime_type_queries() {
        let temp = TestDir::temp();
        let env = build(&temp);
        let cache = Cache::open_for(&env).expect("open must succeed");

        let all = OfferQuery::mime_type("text/x-csrc").services(&cache);
        assert_eq!(names(&all), vec!["Viewer", "Kate", "Vim", "Text Part"]);

        let direct = OfferQuery::mime_type("text/x-csrc")
            .inherited(false)
            .take()
            .services(&cache);
        assert_eq!(names(&direct), vec!["Viewer"]);

        let apps = OfferQuery::mime_type("text/plain")
            .service_type("Application")
            .take()
            .services(&cache);
        assert_eq!(names(&apps), vec!["Kate", "Vim"]);

        let gui = OfferQuery::mime_type("text/plain")
            .service_type("Application")
            .matching(|service| !service.terminal)
            .take();
        assert_eq!(names(&gui.services(&cache)), vec!["Kate"]);
        assert_eq!(
            gui.preferred(&cache).map(|s| s.name),
            Some("Kate".to_string())
        );

        let first = OfferQuery::mime_type("text/plain")
            .limit(1)
            .take()
            .offers(&cache);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].service.name, "Kate");
        assert_eq!(first[0].preference, 8);

        assert!(OfferQuery::mime_type("image/png")
            .preferred(&cache)
            .is_none());
    }

    #[test]
    fn test_service_type_queries() {
        let temp = TestDir::temp();
        let env = build(&temp);
        let cache = Cache::open_for(&env).expect("open must succeed");

        let parts = OfferQuery::of_service_type("KParts/ReadOnlyPart").services(&cache);
        assert_eq!(names(&parts), vec!["Text Part"]);

        let wanted = String::from("Vim");
        let vim = OfferQuery::of_service_type("Application")
            .matching(|service| service.name == wanted)
            .take()
            .services(&cache);
        assert_eq!(names(&vim), vec!["Vim"]);
    }

    #[test]
    fn test_debug_skips_matcher() {
        let query = OfferQuery::mime_type("text/plain")
            .matching(|_| true)
            .take();
        let debug = format!("{:?}", query);
        assert!(debug.contains("text/plain"));
        assert!(!debug.contains("matcher"));
    }
}
