//! The slice of the shared-mime-info database the cache needs: which
//! MIME types exist, their aliases, and what they inherit from.
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::PathBuf;

use crate::resources::list_files;
use crate::resources::MIME_PACKAGES;

/// Root of the binary types.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Root of the text types, itself a binary type.
pub const TEXT_PLAIN: &str = "text/plain";

/// Prefix of the pseudo types that map URL schemes to handlers.
pub const SCHEME_HANDLER_PREFIX: &str = "x-scheme-handler/";

/// MIME types, by canonical name, with their declared parents.
#[derive(Clone, Debug, Default)]
pub struct MimeDatabase {
    types: BTreeMap<String, Vec<String>>,
    aliases: HashMap<String, String>,
}

fn child_elements<'a, 'input>(
    node: roxmltree::Node<'a, 'input>,
    name: &'static str,
) -> impl Iterator<Item = roxmltree::Node<'a, 'input>> {
    node.children()
        .filter(move |n| n.is_element() && n.tag_name().name() == name)
}

fn type_attribute(node: roxmltree::Node<'_, '_>) -> Option<String> {
    node.attribute("type")
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

impl MimeDatabase {
    pub fn new() -> MimeDatabase {
        Default::default()
    }

    /// Loads every package file under `data_dirs` (most local first).
    /// A type defined in several data directories takes its most
    /// local definition.  Broken files are logged and skipped.
    pub fn load(data_dirs: &[PathBuf]) -> MimeDatabase {
        let mut ret = MimeDatabase::new();
        for data_dir in data_dirs.iter().rev() {
            let root = data_dir.join(MIME_PACKAGES.dir);
            let mut files = list_files(&root, MIME_PACKAGES.extension, MIME_PACKAGES.recursive);
            files.sort();
            for (_, path) in files {
                let contents = match std::fs::read_to_string(&path) {
                    Ok(contents) => contents,
                    Err(e) => {
                        tracing::warn!(
                            target: "sycoca",
                            path = %path.display(),
                            error = %e,
                            "failed to read MIME package"
                        );
                        continue;
                    }
                };

                if let Err(e) = ret.parse_package(&contents) {
                    tracing::warn!(
                        target: "sycoca",
                        path = %path.display(),
                        error = %e,
                        "failed to parse MIME package"
                    );
                }
            }
        }

        ret
    }

    /// Merges the `<mime-type>` definitions of one package file.
    pub fn parse_package(&mut self, xml: &str) -> Result<(), roxmltree::Error> {
        let doc = roxmltree::Document::parse(xml)?;
        for node in child_elements(doc.root_element(), "mime-type") {
            let name = match type_attribute(node) {
                Some(name) => name,
                None => continue,
            };

            let parents = child_elements(node, "sub-class-of")
                .filter_map(type_attribute)
                .collect();
            for alias in child_elements(node, "alias").filter_map(type_attribute) {
                self.add_alias(alias, name.clone());
            }

            self.add_type(name, parents);
        }

        Ok(())
    }

    /// Defines (or redefines) `name` with the declared `parents`.
    pub fn add_type(&mut self, name: impl Into<String>, parents: Vec<String>) {
        let name = name.into();
        self.aliases.remove(&name);
        self.types.insert(name, parents);
    }

    pub fn add_alias(&mut self, alias: impl Into<String>, canonical: impl Into<String>) {
        let alias = alias.into();
        let canonical = canonical.into();
        if alias != canonical {
            self.aliases.insert(alias, canonical);
        }
    }

    /// Resolves an alias to its canonical name; other names are
    /// returned as is.
    pub fn canonical<'a>(&'a self, name: &'a str) -> &'a str {
        self.aliases.get(name).map(String::as_str).unwrap_or(name)
    }

    /// Checks whether `name` (or the type it aliases) is defined.
    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(self.canonical(name))
    }

    /// Returns the direct parents of `name`.  Types that declare none
    /// implicitly derive from `text/plain` (text types) or
    /// `application/octet-stream` (everything else but the roots,
    /// `inode/*`, `all/*` and scheme handlers).
    pub fn parents(&self, name: &str) -> Vec<String> {
        let name = self.canonical(name);
        if let Some(declared) = self.types.get(name) {
            if !declared.is_empty() {
                return declared
                    .iter()
                    .map(|p| self.canonical(p).to_string())
                    .collect();
            }
        }

        if name == OCTET_STREAM
            || name.starts_with("inode/")
            || name.starts_with("all/")
            || name.starts_with(SCHEME_HANDLER_PREFIX)
        {
            Vec::new()
        } else if name == TEXT_PLAIN {
            vec![OCTET_STREAM.to_string()]
        } else if name.starts_with("text/") {
            vec![TEXT_PLAIN.to_string()]
        } else {
            vec![OCTET_STREAM.to_string()]
        }
    }

    /// Checks whether `name` is `ancestor` or transitively derives
    /// from it.
    pub fn inherits(&self, name: &str, ancestor: &str) -> bool {
        let ancestor = self.canonical(ancestor);
        let mut stack = vec![self.canonical(name).to_string()];
        let mut visited = std::collections::HashSet::new();
        while let Some(current) = stack.pop() {
            if current == ancestor {
                return true;
            }

            if visited.insert(current.clone()) {
                stack.extend(self.parents(&current));
            }
        }

        false
    }

    /// Canonical names of all defined types, sorted.
    pub fn all_types(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }
}

#[cfg(test)]
const PACKAGE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<mime-info xmlns="http://www.freedesktop.org/standards/shared-mime-info">
  <mime-type type="text/plain">
    <comment>plain text document</comment>
    <glob pattern="*.txt"/>
  </mime-type>
  <mime-type type="text/x-csrc">
    <sub-class-of type="text/plain"/>
    <alias type="text/x-c"/>
  </mime-type>
  <mime-type type="text/x-c++src">
    <sub-class-of type="text/x-c"/>
  </mime-type>
  <mime-type type="text/markdown"/>
  <mime-type type="image/png"/>
  <mime-type type="inode/directory"/>
  <mime-type type="application/octet-stream"/>
</mime-info>
"#;

#[test]
fn test_parse_package() {
    let mut db = MimeDatabase::new();
    db.parse_package(PACKAGE).expect("package must parse");

    assert_eq!(
        db.all_types().collect::<Vec<_>>(),
        vec![
            "application/octet-stream",
            "image/png",
            "inode/directory",
            "text/markdown",
            "text/plain",
            "text/x-c++src",
            "text/x-csrc",
        ]
    );
    assert_eq!(db.canonical("text/x-c"), "text/x-csrc");
    assert!(db.contains("text/x-c"));
    assert!(!db.contains("text/x-nope"));

    assert_eq!(db.parents("text/x-c++src"), vec!["text/x-csrc"]);
    assert_eq!(db.parents("text/markdown"), vec![TEXT_PLAIN]);
    assert_eq!(db.parents("text/plain"), vec![OCTET_STREAM]);
    assert_eq!(db.parents("image/png"), vec![OCTET_STREAM]);
    assert!(db.parents("inode/directory").is_empty());
    assert!(db.parents(OCTET_STREAM).is_empty());
    assert!(db.parents("x-scheme-handler/http").is_empty());

    assert!(db.inherits("text/x-c++src", "text/plain"));
    assert!(db.inherits("text/x-c++src", "text/x-c"));
    assert!(db.inherits("text/plain", "text/plain"));
    assert!(db.inherits("image/png", OCTET_STREAM));
    assert!(!db.inherits("text/plain", "text/x-csrc"));
    assert!(!db.inherits("inode/directory", OCTET_STREAM));

    assert!(db.parse_package("<mime-info>").is_err());
}

/// Local package files override system ones, type by type.
#[test]
fn test_load_prefers_local() {
    use crate::test_util::write_file;
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    write_file(temp.path("system/mime/packages/freedesktop.org.xml"), PACKAGE);
    write_file(
        temp.path("local/mime/packages/custom.xml"),
        r#"<mime-info xmlns="http://www.freedesktop.org/standards/shared-mime-info">
             <mime-type type="text/markdown"><sub-class-of type="text/x-csrc"/></mime-type>
           </mime-info>"#,
    );
    write_file(temp.path("local/mime/packages/broken.xml"), "<mime-info");

    let db = MimeDatabase::load(&[temp.path("local"), temp.path("system")]);
    assert_eq!(db.parents("text/markdown"), vec!["text/x-csrc"]);
    assert!(db.inherits("text/markdown", "text/plain"));
    assert!(db.contains("image/png"));
}
