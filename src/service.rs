//! Services: applications and plugins described by `.desktop` files.
use std::collections::BTreeMap;
use std::io::Seek;
use std::io::Write;

use crate::desktop_file::DesktopFile;
use crate::desktop_file::Group;
use crate::entry::Decoded;
use crate::entry::EntryHeader;
use crate::entry::EntryKind;
use crate::entry::Record;
use crate::property::Property;
use crate::property::PropertyType;
use crate::stream::DataReader;
use crate::stream::DataWriter;

/// Every `Type=Application` service implicitly has this service type.
pub const APPLICATION_SERVICE_TYPE: &str = "Application";

/// Keys with a dedicated field; they never land in the property map.
const RESERVED_KEYS: &[&str] = &[
    "Type",
    "Name",
    "GenericName",
    "Comment",
    "Exec",
    "Icon",
    "Terminal",
    "TerminalOptions",
    "Path",
    "X-KDE-Library",
    "InitialPreference",
    "Keywords",
    "Categories",
    "MimeType",
    "ServiceTypes",
    "X-KDE-ServiceTypes",
    "NoDisplay",
    "Hidden",
    "OnlyShowIn",
    "NotShowIn",
    "Actions",
    "Version",
    "Encoding",
];

/// An additional action a service offers, such as "New Window".
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServiceAction {
    pub name: String,
    pub text: String,
    pub icon: String,
    pub exec: String,
    pub no_display: bool,
}

/// An application or plugin.
#[derive(Clone, Debug, PartialEq)]
pub struct Service {
    header: EntryHeader,
    /// `Application` or `Service`.
    pub entry_type: String,
    pub name: String,
    pub generic_name: String,
    pub comment: String,
    pub exec: String,
    pub icon: String,
    pub terminal: bool,
    pub terminal_options: String,
    pub working_dir: String,
    pub library: String,
    /// Lowercased file name without its extension.
    pub desktop_entry_name: String,
    pub initial_preference: i32,
    pub keywords: Vec<String>,
    pub categories: Vec<String>,
    /// MIME types in declaration order, before inheritance.
    pub mime_types: Vec<String>,
    pub service_types: Vec<String>,
    pub no_display: bool,
    pub hidden: bool,
    pub only_show_in: Vec<String>,
    pub not_show_in: Vec<String>,
    pub actions: Vec<ServiceAction>,
    menu_id: String,
    pub properties: BTreeMap<String, Property>,
}

/// Returns the lowercased file name of `path`, minus `.desktop` or
/// `.kdelnk`.
pub fn desktop_entry_name(path: &str) -> String {
    let file_name = path.rsplit('/').next().unwrap_or(path);
    let stem = file_name
        .strip_suffix(".desktop")
        .or_else(|| file_name.strip_suffix(".kdelnk"))
        .unwrap_or(file_name);
    stem.to_lowercase()
}

fn read_actions(file: &DesktopFile, group: &Group, lang: &str) -> Vec<ServiceAction> {
    let mut ret = Vec::new();
    for name in group.list("Actions") {
        let action = match file.group(&format!("Desktop Action {}", name)) {
            Some(action) => action,
            None => continue,
        };

        ret.push(ServiceAction {
            text: action.localized("Name", lang).unwrap_or_default(),
            icon: action.get("Icon").unwrap_or_default(),
            exec: action.get("Exec").unwrap_or_default(),
            no_display: action.bool("NoDisplay").unwrap_or(false),
            name,
        });
    }

    ret
}

impl Service {
    /// Creates an empty service of `entry_type` for `path`.
    pub fn new(path: impl Into<String>, entry_type: impl Into<String>) -> Service {
        let path = path.into();
        Service {
            desktop_entry_name: desktop_entry_name(&path),
            header: EntryHeader::new(path),
            entry_type: entry_type.into(),
            name: String::new(),
            generic_name: String::new(),
            comment: String::new(),
            exec: String::new(),
            icon: String::new(),
            terminal: false,
            terminal_options: String::new(),
            working_dir: String::new(),
            library: String::new(),
            initial_preference: 1,
            keywords: Vec::new(),
            categories: Vec::new(),
            mime_types: Vec::new(),
            service_types: Vec::new(),
            no_display: false,
            hidden: false,
            only_show_in: Vec::new(),
            not_show_in: Vec::new(),
            actions: Vec::new(),
            menu_id: String::new(),
            properties: BTreeMap::new(),
        }
    }

    /// Creates a service from a parsed desktop file.  Returns `None`
    /// for files that do not describe a usable service: no
    /// `[Desktop Entry]`, another `Type`, no name, or an application
    /// without `Exec`.
    ///
    /// `property_type` gives the declared type of custom keys, as
    /// defined by the service types; undeclared keys stay strings.
    pub fn from_desktop_file(
        path: &str,
        file: &DesktopFile,
        lang: &str,
        property_type: impl Fn(&str) -> Option<PropertyType>,
    ) -> Option<Service> {
        let group = match file.desktop_group() {
            Some(group) => group,
            None => {
                tracing::debug!(target: "sycoca", path, "no [Desktop Entry] group");
                return None;
            }
        };

        let entry_type = group
            .get("Type")
            .unwrap_or_else(|| APPLICATION_SERVICE_TYPE.to_string());
        if entry_type != APPLICATION_SERVICE_TYPE && entry_type != "Service" {
            tracing::debug!(target: "sycoca", path, entry_type = %entry_type, "not a service");
            return None;
        }

        let mut ret = Service::new(path, entry_type);
        ret.name = group.localized("Name", lang).unwrap_or_default();
        if ret.name.is_empty() {
            tracing::debug!(target: "sycoca", path, "service without a name");
            return None;
        }

        ret.exec = group.get("Exec").unwrap_or_default();
        if ret.is_application() && ret.exec.is_empty() {
            tracing::debug!(target: "sycoca", path, "application without Exec");
            return None;
        }

        ret.generic_name = group.localized("GenericName", lang).unwrap_or_default();
        ret.comment = group.localized("Comment", lang).unwrap_or_default();
        ret.icon = group.get("Icon").unwrap_or_default();
        ret.terminal = group.bool("Terminal").unwrap_or(false);
        ret.terminal_options = group.get("TerminalOptions").unwrap_or_default();
        ret.working_dir = group.get("Path").unwrap_or_default();
        ret.library = group.get("X-KDE-Library").unwrap_or_default();
        ret.initial_preference = group
            .get("InitialPreference")
            .and_then(|p| p.trim().parse().ok())
            .unwrap_or(1);
        ret.keywords = group
            .localized("Keywords", lang)
            .map(|raw| crate::desktop_file::split_list(&raw))
            .unwrap_or_default();
        ret.categories = group.list("Categories");
        ret.no_display = group.bool("NoDisplay").unwrap_or(false);
        ret.hidden = group.bool("Hidden").unwrap_or(false);
        ret.only_show_in = group.list("OnlyShowIn");
        ret.not_show_in = group.list("NotShowIn");
        ret.actions = read_actions(file, group, lang);

        for mime in group.list("MimeType") {
            if !ret.mime_types.contains(&mime) {
                ret.mime_types.push(mime);
            }
        }

        if ret.is_application() {
            ret.service_types.push(APPLICATION_SERVICE_TYPE.to_string());
        }
        for key in ["X-KDE-ServiceTypes", "ServiceTypes"] {
            for ty in group.list(key) {
                if !ret.service_types.contains(&ty) {
                    ret.service_types.push(ty);
                }
            }
        }

        for key in group.keys() {
            if key.contains('[') || RESERVED_KEYS.contains(&key) {
                continue;
            }

            let raw = group.localized(key, lang).unwrap_or_default();
            let value = property_type(key)
                .and_then(|ty| ty.parse(&raw))
                .unwrap_or(Property::String(raw));
            ret.properties.insert(key.to_string(), value);
        }

        Some(ret)
    }

    pub fn path(&self) -> &str {
        self.header.path()
    }

    pub fn offset(&self) -> i32 {
        self.header.offset()
    }

    pub fn menu_id(&self) -> &str {
        &self.menu_id
    }

    pub(crate) fn set_menu_id(&mut self, menu_id: impl Into<String>) {
        self.menu_id = menu_id.into();
    }

    /// The identity used to deduplicate and reference services: the
    /// menu id when there is one, the path otherwise.
    pub fn storage_id(&self) -> &str {
        if self.menu_id.is_empty() {
            self.header.path()
        } else {
            &self.menu_id
        }
    }

    pub fn is_application(&self) -> bool {
        self.entry_type == APPLICATION_SERVICE_TYPE
    }

    pub fn has_service_type(&self, name: &str) -> bool {
        self.service_types.iter().any(|ty| ty == name)
    }

    pub fn has_mime_type(&self, name: &str) -> bool {
        self.mime_types.iter().any(|ty| ty == name)
    }

    pub fn property(&self, key: &str) -> Option<&Property> {
        self.properties.get(key)
    }

    /// Checks `OnlyShowIn` and `NotShowIn` against the list of current
    /// desktops.
    pub fn shown_in(&self, desktops: &[String]) -> bool {
        if !self.only_show_in.is_empty()
            && !self.only_show_in.iter().any(|d| desktops.contains(d))
        {
            return false;
        }

        !self.not_show_in.iter().any(|d| desktops.contains(d))
    }
}

impl Record for Service {
    const KIND: EntryKind = EntryKind::Service;

    fn header(&self) -> &EntryHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut EntryHeader {
        &mut self.header
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn encode_fields<W: Write + Seek>(&self, w: &mut DataWriter<W>) -> std::io::Result<()> {
        w.write_string(&self.entry_type)?;
        w.write_string(&self.name)?;
        w.write_string(&self.generic_name)?;
        w.write_string(&self.comment)?;
        w.write_string(&self.exec)?;
        w.write_string(&self.icon)?;
        w.write_bool(self.terminal)?;
        w.write_string(&self.terminal_options)?;
        w.write_string(&self.working_dir)?;
        w.write_string(&self.library)?;
        w.write_string(&self.desktop_entry_name)?;
        w.write_i32(self.initial_preference)?;
        w.write_string_list(&self.keywords)?;
        w.write_string_list(&self.categories)?;
        w.write_string_list(&self.mime_types)?;
        w.write_string_list(&self.service_types)?;
        w.write_bool(self.no_display)?;
        w.write_bool(self.hidden)?;
        w.write_string_list(&self.only_show_in)?;
        w.write_string_list(&self.not_show_in)?;

        w.write_u32(self.actions.len() as u32)?;
        for action in &self.actions {
            w.write_string(&action.name)?;
            w.write_string(&action.text)?;
            w.write_string(&action.icon)?;
            w.write_string(&action.exec)?;
            w.write_bool(action.no_display)?;
        }

        w.write_string(&self.menu_id)?;
        w.write_property_map(&self.properties)
    }

    fn decode_fields(header: EntryHeader, r: &mut DataReader) -> Decoded<Self> {
        let entry_type = r.read_string()?;
        let name = r.read_string()?;
        let generic_name = r.read_string()?;
        let comment = r.read_string()?;
        let exec = r.read_string()?;
        let icon = r.read_string()?;
        let terminal = r.read_bool()?;
        let terminal_options = r.read_string()?;
        let working_dir = r.read_string()?;
        let library = r.read_string()?;
        let desktop_entry_name = r.read_string()?;
        let initial_preference = r.read_i32()?;
        let keywords = r.read_string_list()?;
        let categories = r.read_string_list()?;
        let mime_types = r.read_string_list()?;
        let service_types = r.read_string_list()?;
        let no_display = r.read_bool()?;
        let hidden = r.read_bool()?;
        let only_show_in = r.read_string_list()?;
        let not_show_in = r.read_string_list()?;

        // Four strings and a flag: 17 bytes at least.
        let count = r.read_count(17)?;
        let mut actions = Vec::with_capacity(count);
        for _ in 0..count {
            actions.push(ServiceAction {
                name: r.read_string()?,
                text: r.read_string()?,
                icon: r.read_string()?,
                exec: r.read_string()?,
                no_display: r.read_bool()?,
            });
        }

        let menu_id = r.read_string()?;
        let properties = r.read_property_map()?;

        Ok(Service {
            header,
            entry_type,
            name,
            generic_name,
            comment,
            exec,
            icon,
            terminal,
            terminal_options,
            working_dir,
            library,
            desktop_entry_name,
            initial_preference,
            keywords,
            categories,
            mime_types,
            service_types,
            no_display,
            hidden,
            only_show_in,
            not_show_in,
            actions,
            menu_id,
            properties,
        })
    }
}

#[cfg(test)]
const EDITOR: &str = "[Desktop Entry]\n\
     Type=Application\n\
     Name=Editor\n\
     Name[de]=Bearbeiter\n\
     Exec=editor %U\n\
     Icon=accessories-text-editor\n\
     InitialPreference=7\n\
     MimeType=text/plain;text/x-csrc;text/plain;\n\
     Categories=Utility;TextEditor;\n\
     X-KDE-ServiceTypes=KParts/ReadOnlyPart\n\
     OnlyShowIn=KDE;\n\
     Actions=new;missing;\n\
     X-KDE-Version=3\n\
     X-Comment-Only=hello\n\
     X-Comment-Only[de]=hallo\n\
     \n\
     [Desktop Action new]\n\
     Name=New Window\n\
     Exec=editor --new\n";

#[test]
fn test_from_desktop_file() {
    let file = DesktopFile::parse(EDITOR);
    let service = Service::from_desktop_file("kde/Editor.desktop", &file, "de", |key| {
        (key == "X-KDE-Version").then(|| PropertyType::Int)
    })
    .expect("service must be valid");

    assert_eq!(service.path(), "kde/Editor.desktop");
    assert_eq!(service.desktop_entry_name, "editor");
    assert_eq!(service.storage_id(), "kde/Editor.desktop");
    assert_eq!(service.name, "Bearbeiter");
    assert_eq!(service.initial_preference, 7);
    assert_eq!(service.mime_types, vec!["text/plain", "text/x-csrc"]);
    assert_eq!(
        service.service_types,
        vec![APPLICATION_SERVICE_TYPE, "KParts/ReadOnlyPart"]
    );
    assert_eq!(service.actions.len(), 1);
    assert_eq!(service.actions[0].name, "new");
    assert_eq!(service.actions[0].text, "New Window");
    assert_eq!(service.property("X-KDE-Version"), Some(&Property::Int(3)));
    assert_eq!(
        service.property("X-Comment-Only"),
        Some(&Property::String("hallo".into()))
    );
    assert_eq!(service.property("Exec"), None);

    assert!(service.shown_in(&["KDE".to_string()]));
    assert!(!service.shown_in(&["GNOME".to_string()]));
}

#[test]
fn test_invalid_files() {
    let no_exec = DesktopFile::parse("[Desktop Entry]\nType=Application\nName=x\n");
    assert_eq!(
        Service::from_desktop_file("x.desktop", &no_exec, "C", |_| None),
        None
    );

    let link = DesktopFile::parse("[Desktop Entry]\nType=Link\nName=x\nURL=http://x\n");
    assert_eq!(Service::from_desktop_file("x.desktop", &link, "C", |_| None), None);

    // Plugins need no Exec.
    let plugin = DesktopFile::parse("[Desktop Entry]\nType=Service\nName=x\n");
    let plugin = Service::from_desktop_file("x.desktop", &plugin, "C", |_| None)
        .expect("plugin must be valid");
    assert!(!plugin.is_application());
    assert!(plugin.service_types.is_empty());
}

#[test]
fn test_encode_decode() {
    let file = DesktopFile::parse(EDITOR);
    let mut service = Service::from_desktop_file("Editor.desktop", &file, "C", |_| None)
        .expect("service must be valid");
    service.set_menu_id("kde-Editor.desktop");
    assert_eq!(service.storage_id(), "kde-Editor.desktop");

    let mut writer = DataWriter::new(std::io::Cursor::new(Vec::new()));
    writer.write_i32(0).expect("write must succeed");
    service.encode(&mut writer).expect("encode must succeed");
    let bytes = writer.into_inner().expect("flush").into_inner();

    let decoded = Service::decode(&bytes, 4).expect("decode must succeed");
    assert_eq!(decoded, service);
    assert_eq!(decoded.offset(), 4);
}

#[test]
fn test_desktop_entry_name() {
    assert_eq!(desktop_entry_name("org.kde.Kate.desktop"), "org.kde.kate");
    assert_eq!(desktop_entry_name("sub/dir/Old.kdelnk"), "old");
    assert_eq!(desktop_entry_name("plain"), "plain");
}
