//! A small reader for the freedesktop key/value group format shared by
//! `.desktop` and `.directory` files, service type definitions and
//! `mimeapps.list`.  It only splits the text into groups and values;
//! interpreting keys is up to the factories.
use std::io::Result;
use std::path::Path;

/// One `[Group]` of a desktop file, with its keys in file order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Group {
    name: String,
    entries: Vec<(String, String)>,
}

/// A parsed desktop file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DesktopFile {
    groups: Vec<Group>,
}

/// Splits a `;`-separated list value.  `\;` escapes a literal
/// semicolon, a trailing separator is optional, and empty items are
/// dropped.
pub fn split_list(raw: &str) -> Vec<String> {
    let mut ret = Vec::new();
    let mut current = String::new();
    let mut chars = raw.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(';') => current.push(';'),
                Some(other) => {
                    current.push('\\');
                    current.push(other);
                }
                None => current.push('\\'),
            },
            ';' => {
                let item = unescape(current.trim());
                if !item.is_empty() {
                    ret.push(item);
                }
                current.clear();
            }
            c => current.push(c),
        }
    }

    let item = unescape(current.trim());
    if !item.is_empty() {
        ret.push(item);
    }

    ret
}

/// Expands the `\s`, `\n`, `\t`, `\r` and `\\` escapes.
fn unescape(value: &str) -> String {
    if !value.contains('\\') {
        return value.to_string();
    }

    let mut ret = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            ret.push(c);
            continue;
        }

        match chars.next() {
            Some('s') => ret.push(' '),
            Some('n') => ret.push('\n'),
            Some('t') => ret.push('\t'),
            Some('r') => ret.push('\r'),
            Some('\\') => ret.push('\\'),
            Some(other) => {
                ret.push('\\');
                ret.push(other);
            }
            None => ret.push('\\'),
        }
    }

    ret
}

/// Returns the locale suffixes to try for `lang`, most specific
/// first: `de_AT.UTF-8@euro` yields `de_AT@euro`, `de_AT`, `de@euro`
/// and `de`.
fn locale_candidates(lang: &str) -> Vec<String> {
    let (base, modifier) = match lang.split_once('@') {
        Some((base, modifier)) => (base, Some(modifier)),
        None => (lang, None),
    };
    let base = base.split('.').next().unwrap_or(base);
    let (language, country) = match base.split_once('_') {
        Some((language, country)) => (language, Some(country)),
        None => (base, None),
    };

    let mut ret = Vec::new();
    if language.is_empty() || language == "C" || language == "POSIX" {
        return ret;
    }

    if let (Some(country), Some(modifier)) = (country, modifier) {
        ret.push(format!("{}_{}@{}", language, country, modifier));
    }
    if let Some(country) = country {
        ret.push(format!("{}_{}", language, country));
    }
    if let Some(modifier) = modifier {
        ret.push(format!("{}@{}", language, modifier));
    }
    ret.push(language.to_string());
    ret
}

impl Group {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the raw value for `key`, with escapes expanded.  The
    /// last assignment wins.
    pub fn get(&self, key: &str) -> Option<String> {
        self.raw(key).map(unescape)
    }

    fn raw(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Returns the value of `key` translated for `lang`, falling back
    /// to the untranslated value.
    pub fn localized(&self, key: &str, lang: &str) -> Option<String> {
        for suffix in locale_candidates(lang) {
            if let Some(value) = self.get(&format!("{}[{}]", key, suffix)) {
                return Some(value);
            }
        }

        self.get(key)
    }

    /// Returns the list value for `key`; a missing key is an empty
    /// list.
    pub fn list(&self, key: &str) -> Vec<String> {
        self.raw(key).map(split_list).unwrap_or_default()
    }

    pub fn bool(&self, key: &str) -> Option<bool> {
        match self.raw(key)?.trim() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.raw(key).is_some()
    }

    /// Iterates over distinct keys in order of first appearance,
    /// including translated keys.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        let mut seen = std::collections::HashSet::new();
        self.entries
            .iter()
            .map(|(k, _)| k.as_str())
            .filter(move |k| seen.insert(*k))
    }
}

impl DesktopFile {
    /// Parses `text`.  Lines that are neither comments, group headers
    /// nor assignments are ignored, as are assignments before the
    /// first group.
    pub fn parse(text: &str) -> DesktopFile {
        let mut groups: Vec<Group> = Vec::new();
        let mut current: Option<usize> = None;

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if line.starts_with('[') && line.ends_with(']') {
                let name = &line[1..line.len() - 1];
                // Repeated groups merge into the first one.
                current = match groups.iter().position(|g| g.name == name) {
                    Some(idx) => Some(idx),
                    None => {
                        groups.push(Group {
                            name: name.to_string(),
                            entries: Vec::new(),
                        });
                        Some(groups.len() - 1)
                    }
                };
                continue;
            }

            let (idx, (key, value)) = match (current, line.split_once('=')) {
                (Some(idx), Some(kv)) => (idx, kv),
                _ => continue,
            };

            let key = key.trim();
            if key.is_empty() {
                continue;
            }

            groups[idx]
                .entries
                .push((key.to_string(), value.trim().to_string()));
        }

        DesktopFile { groups }
    }

    /// Reads and parses the file at `path`.  Invalid UTF-8 is replaced
    /// rather than rejected.
    pub fn read(path: impl AsRef<Path>) -> Result<DesktopFile> {
        let bytes = std::fs::read(path)?;
        Ok(DesktopFile::parse(&String::from_utf8_lossy(&bytes)))
    }

    pub fn group(&self, name: &str) -> Option<&Group> {
        self.groups.iter().find(|g| g.name == name)
    }

    /// Returns the `[Desktop Entry]` group.
    pub fn desktop_group(&self) -> Option<&Group> {
        self.group("Desktop Entry")
    }

    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.iter()
    }
}

#[test]
fn test_parse_groups() {
    let file = DesktopFile::parse(
        "# comment\n\
         stray=ignored\n\
         [Desktop Entry]\n\
         Type=Application\n\
         Name=Editor\n\
         Name[de]=Bearbeiter\n\
         Exec = editor %U \n\
         MimeType=text/plain;text/x-csrc;\n\
         Terminal=false\n\
         \n\
         [Desktop Action new]\n\
         Name=New Window\n\
         [Desktop Entry]\n\
         Name=Editor 2\n",
    );

    let group = file.desktop_group().expect("group must exist");
    assert_eq!(group.get("Type").as_deref(), Some("Application"));
    // Later assignments win, even across repeated group headers.
    assert_eq!(group.get("Name").as_deref(), Some("Editor 2"));
    assert_eq!(group.get("Exec").as_deref(), Some("editor %U"));
    assert_eq!(group.list("MimeType"), vec!["text/plain", "text/x-csrc"]);
    assert_eq!(group.bool("Terminal"), Some(false));
    assert_eq!(group.get("stray"), None);
    assert_eq!(
        group.keys().collect::<Vec<_>>(),
        vec!["Type", "Name", "Name[de]", "Exec", "MimeType", "Terminal"]
    );

    let action = file.group("Desktop Action new").expect("action group");
    assert_eq!(action.get("Name").as_deref(), Some("New Window"));
    assert_eq!(file.groups().count(), 2);
}

#[test]
fn test_localized() {
    let file = DesktopFile::parse(
        "[Desktop Entry]\nName=Files\nName[de]=Dateien\nName[de_AT]=Dateien (AT)\nName[sr@latin]=Datoteke\n",
    );
    let group = file.desktop_group().expect("group must exist");

    assert_eq!(group.localized("Name", "de_AT.UTF-8").as_deref(), Some("Dateien (AT)"));
    assert_eq!(group.localized("Name", "de_CH").as_deref(), Some("Dateien"));
    assert_eq!(group.localized("Name", "sr_RS@latin").as_deref(), Some("Datoteke"));
    assert_eq!(group.localized("Name", "fr").as_deref(), Some("Files"));
    assert_eq!(group.localized("Name", "C").as_deref(), Some("Files"));
}

#[test]
fn test_split_list_escapes() {
    assert_eq!(split_list(""), Vec::<String>::new());
    assert_eq!(split_list("a"), vec!["a"]);
    assert_eq!(split_list("a;;b;"), vec!["a", "b"]);
    assert_eq!(split_list("semi\\;colon;x\\sy"), vec!["semi;colon", "x y"]);
}
