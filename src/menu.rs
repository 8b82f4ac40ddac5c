//! The application menu, following the freedesktop menu
//! specification.  Menu files are parsed into plain [`MenuNode`]
//! trees, merged without touching their inputs, and then evaluated
//! against the scanned applications to produce [`ServiceGroup`]s.
//!
//! Evaluation takes two passes over the tree: regular menus claim
//! ("allocate") the applications they match, then `OnlyUnallocated`
//! menus pick among whatever nobody claimed.
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;

use crate::benign_error::is_absent_file_error;
use crate::config::Environment;
use crate::desktop_file::DesktopFile;
use crate::resources::list_files;
use crate::resources::locate;
use crate::resources::APPLICATIONS;
use crate::resources::DIRECTORIES;
use crate::service::Service;
use crate::service_factory::ServiceFactory;
use crate::service_group::GroupChild;
use crate::service_group::ServiceGroup;
use crate::service_type_factory::ServiceTypeFactory;

/// Bounds `MergeFile` nesting; deeper chains are almost certainly
/// cycles through symlinks.
const MAX_MERGE_DEPTH: usize = 16;

/// Caption of the root group when there is no menu file.
const FALLBACK_CAPTION: &str = "Applications";

/// A boolean matching rule over applications.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Rule {
    /// Matches the desktop file id (menu id).
    Filename(String),
    Category(String),
    All,
    And(Vec<Rule>),
    Or(Vec<Rule>),
    /// Matches what none of the rules match.
    Not(Vec<Rule>),
}

impl Rule {
    pub fn matches(&self, service: &Service) -> bool {
        match self {
            Rule::Filename(id) => service.menu_id() == id,
            Rule::Category(category) => service.categories.iter().any(|c| c == category),
            Rule::All => true,
            Rule::And(rules) => !rules.is_empty() && rules.iter().all(|r| r.matches(service)),
            Rule::Or(rules) => rules.iter().any(|r| r.matches(service)),
            Rule::Not(rules) => !rules.iter().any(|r| r.matches(service)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeKind {
    Menus,
    Files,
    All,
}

/// Presentation hints of a layout or a `Menuname` item.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LayoutOptions {
    pub show_empty: Option<bool>,
    pub inline: Option<bool>,
    pub inline_header: Option<bool>,
    pub inline_alias: Option<bool>,
    pub inline_limit: Option<i32>,
}

impl LayoutOptions {
    fn apply(&self, group: &mut ServiceGroup) {
        if let Some(show_empty) = self.show_empty {
            group.show_empty = show_empty;
        }
        if let Some(inline) = self.inline {
            group.inline = inline;
        }
        if let Some(header) = self.inline_header {
            group.inline_header = header;
        }
        if let Some(alias) = self.inline_alias {
            group.inline_alias = alias;
        }
        if let Some(limit) = self.inline_limit {
            group.inline_limit = limit;
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LayoutItem {
    Filename(String),
    Menuname { name: String, options: LayoutOptions },
    Separator,
    Merge(MergeKind),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Layout {
    pub items: Vec<LayoutItem>,
    pub options: LayoutOptions,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MergeSource {
    /// Another menu file.
    Path(PathBuf),
    /// The same menu file, in the next less local configuration
    /// directory.
    Parent,
    /// Every `.menu` file in a directory.
    Dir(PathBuf),
    /// The `applications-merged` directories.
    DefaultDirs,
}

/// A merge directive not yet resolved.  Directives before any other
/// content are merged below the including menu; later ones on top of
/// it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergeRef {
    pub source: MergeSource,
    pub on_top: bool,
}

/// One `<Menu>` element.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MenuNode {
    pub name: String,
    /// `.directory` files; the last one found wins.
    pub directories: Vec<String>,
    pub app_dirs: Vec<PathBuf>,
    pub default_app_dirs: bool,
    pub directory_dirs: Vec<PathBuf>,
    pub default_directory_dirs: bool,
    /// `Include` (true) and `Exclude` (false) rules, applied in order.
    pub rules: Vec<(bool, Rule)>,
    pub only_unallocated: Option<bool>,
    pub deleted: Option<bool>,
    pub layout: Option<Layout>,
    pub default_layout: Option<Layout>,
    /// `(old, new)` paths relative to this menu.
    pub moves: Vec<(String, String)>,
    pub merges: Vec<MergeRef>,
    pub children: Vec<MenuNode>,
}

fn elements<'a, 'input>(
    node: roxmltree::Node<'a, 'input>,
) -> impl Iterator<Item = roxmltree::Node<'a, 'input>> {
    node.children().filter(|n| n.is_element())
}

fn text(node: roxmltree::Node<'_, '_>) -> String {
    node.text().unwrap_or("").trim().to_string()
}

fn bool_attribute(node: roxmltree::Node<'_, '_>, name: &str) -> Option<bool> {
    match node.attribute(name)?.trim() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

fn resolve_path(base_dir: &Path, value: &str) -> PathBuf {
    let path = Path::new(value);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

fn parse_rules(node: roxmltree::Node<'_, '_>) -> Vec<Rule> {
    elements(node)
        .filter_map(|child| match child.tag_name().name() {
            "Filename" => Some(Rule::Filename(text(child))),
            "Category" => Some(Rule::Category(text(child))),
            "All" => Some(Rule::All),
            "And" => Some(Rule::And(parse_rules(child))),
            "Or" => Some(Rule::Or(parse_rules(child))),
            "Not" => Some(Rule::Not(parse_rules(child))),
            _ => None,
        })
        .collect()
}

fn parse_options(node: roxmltree::Node<'_, '_>) -> LayoutOptions {
    LayoutOptions {
        show_empty: bool_attribute(node, "show_empty"),
        inline: bool_attribute(node, "inline"),
        inline_header: bool_attribute(node, "inline_header"),
        inline_alias: bool_attribute(node, "inline_alias"),
        inline_limit: node
            .attribute("inline_limit")
            .and_then(|limit| limit.trim().parse().ok()),
    }
}

fn parse_layout(node: roxmltree::Node<'_, '_>) -> Layout {
    let items = elements(node)
        .filter_map(|child| match child.tag_name().name() {
            "Filename" => Some(LayoutItem::Filename(text(child))),
            "Menuname" => Some(LayoutItem::Menuname {
                name: text(child),
                options: parse_options(child),
            }),
            "Separator" => Some(LayoutItem::Separator),
            "Merge" => match child.attribute("type") {
                Some("menus") => Some(LayoutItem::Merge(MergeKind::Menus)),
                Some("files") => Some(LayoutItem::Merge(MergeKind::Files)),
                Some("all") => Some(LayoutItem::Merge(MergeKind::All)),
                _ => None,
            },
            _ => None,
        })
        .collect();

    Layout {
        items,
        options: parse_options(node),
    }
}

impl MenuNode {
    /// Parses a menu file.  Relative directories are resolved against
    /// `base_dir`, the directory of the file.
    pub fn parse(xml: &str, base_dir: &Path) -> Result<MenuNode, roxmltree::Error> {
        let options = roxmltree::ParsingOptions {
            allow_dtd: true,
            ..roxmltree::ParsingOptions::default()
        };
        let doc = roxmltree::Document::parse_with_options(xml, options)?;
        Ok(MenuNode::parse_element(doc.root_element(), base_dir))
    }

    fn parse_element(node: roxmltree::Node<'_, '_>, base_dir: &Path) -> MenuNode {
        let mut ret = MenuNode::default();
        let mut seen_content = false;

        for child in elements(node) {
            let merge_ref = |source| MergeRef {
                source,
                on_top: seen_content,
            };

            match child.tag_name().name() {
                "Name" => {
                    ret.name = text(child);
                    continue;
                }
                "MergeFile" => {
                    let reference = match child.attribute("type") {
                        Some("parent") => merge_ref(MergeSource::Parent),
                        _ => merge_ref(MergeSource::Path(resolve_path(base_dir, &text(child)))),
                    };
                    ret.merges.push(reference);
                    continue;
                }
                "MergeDir" => {
                    let reference = merge_ref(MergeSource::Dir(resolve_path(base_dir, &text(child))));
                    ret.merges.push(reference);
                    continue;
                }
                "DefaultMergeDirs" => {
                    let reference = merge_ref(MergeSource::DefaultDirs);
                    ret.merges.push(reference);
                    continue;
                }
                "Directory" => ret.directories.push(text(child)),
                "AppDir" | "LegacyDir" => ret.app_dirs.push(resolve_path(base_dir, &text(child))),
                "DefaultAppDirs" => ret.default_app_dirs = true,
                "DirectoryDir" => ret
                    .directory_dirs
                    .push(resolve_path(base_dir, &text(child))),
                "DefaultDirectoryDirs" => ret.default_directory_dirs = true,
                "Include" => ret.rules.push((true, Rule::Or(parse_rules(child)))),
                "Exclude" => ret.rules.push((false, Rule::Or(parse_rules(child)))),
                "OnlyUnallocated" => ret.only_unallocated = Some(true),
                "NotOnlyUnallocated" => ret.only_unallocated = Some(false),
                "Deleted" => ret.deleted = Some(true),
                "NotDeleted" => ret.deleted = Some(false),
                "Layout" => ret.layout = Some(parse_layout(child)),
                "DefaultLayout" => ret.default_layout = Some(parse_layout(child)),
                "Move" => {
                    let old = elements(child).find(|n| n.tag_name().name() == "Old");
                    let new = elements(child).find(|n| n.tag_name().name() == "New");
                    if let (Some(old), Some(new)) = (old, new) {
                        ret.moves.push((text(old), text(new)));
                    }
                }
                "Menu" => {
                    let submenu = MenuNode::parse_element(child, base_dir);
                    if submenu.name.is_empty() {
                        tracing::debug!(target: "sycoca", "ignoring menu without a name");
                    } else {
                        ret.add_child(submenu);
                    }
                }
                _ => continue,
            }

            seen_content = true;
        }

        ret
    }

    /// Adds `child`, merging it into a same-named existing child.
    pub fn add_child(&mut self, child: MenuNode) {
        match self.children.iter().position(|c| c.name == child.name) {
            Some(idx) => {
                let existing = std::mem::take(&mut self.children[idx]);
                self.children[idx] = merge(existing, child);
            }
            None => self.children.push(child),
        }
    }

    pub fn child(&self, name: &str) -> Option<&MenuNode> {
        self.children.iter().find(|c| c.name == name)
    }

    fn detach(&mut self, path: &str) -> Option<MenuNode> {
        let (first, rest) = match path.split_once('/') {
            Some((first, rest)) => (first, rest.trim_matches('/')),
            None => (path, ""),
        };

        let idx = self.children.iter().position(|c| c.name == first)?;
        if rest.is_empty() {
            Some(self.children.remove(idx))
        } else {
            self.children[idx].detach(rest)
        }
    }

    fn insert_at(&mut self, path: &str, mut node: MenuNode) {
        let (first, rest) = match path.split_once('/') {
            Some((first, rest)) => (first, rest.trim_matches('/')),
            None => (path, ""),
        };

        if rest.is_empty() {
            node.name = first.to_string();
            self.add_child(node);
            return;
        }

        if self.child(first).is_none() {
            self.children.push(MenuNode {
                name: first.to_string(),
                ..Default::default()
            });
        }

        if let Some(parent) = self.children.iter_mut().find(|c| c.name == first) {
            parent.insert_at(rest, node);
        }
    }
}

/// Merges `overlay` into `base`: scalar settings of `overlay` win,
/// lists concatenate, and same-named sub-menus merge recursively.
pub fn merge(base: MenuNode, overlay: MenuNode) -> MenuNode {
    let mut ret = base;
    if ret.name.is_empty() {
        ret.name = overlay.name;
    }

    ret.directories.extend(overlay.directories);
    ret.app_dirs.extend(overlay.app_dirs);
    ret.default_app_dirs |= overlay.default_app_dirs;
    ret.directory_dirs.extend(overlay.directory_dirs);
    ret.default_directory_dirs |= overlay.default_directory_dirs;
    ret.rules.extend(overlay.rules);
    ret.only_unallocated = overlay.only_unallocated.or(ret.only_unallocated);
    ret.deleted = overlay.deleted.or(ret.deleted);
    ret.layout = overlay.layout.or(ret.layout);
    ret.default_layout = overlay.default_layout.or(ret.default_layout);
    ret.moves.extend(overlay.moves);
    ret.merges.extend(overlay.merges);
    for child in overlay.children {
        ret.add_child(child);
    }

    ret
}

/// Applies the `Move` directives of `node` and its descendants.
pub fn apply_moves(mut node: MenuNode) -> MenuNode {
    for (old, new) in std::mem::take(&mut node.moves) {
        let old = old.trim_matches('/');
        let new = new.trim_matches('/');
        if old.is_empty() || new.is_empty() || old == new {
            continue;
        }

        match node.detach(old) {
            Some(moved) => node.insert_at(new, moved),
            None => tracing::debug!(target: "sycoca", old, new, "nothing to move"),
        }
    }

    node.children = std::mem::take(&mut node.children)
        .into_iter()
        .map(apply_moves)
        .collect();
    node
}

/// Reads menu files and resolves their merge directives.
struct Loader<'a> {
    env: &'a Environment,
    /// Every menu file read, in order.
    files: Vec<PathBuf>,
    stack: Vec<PathBuf>,
}

impl<'a> Loader<'a> {
    fn new(env: &'a Environment) -> Loader<'a> {
        Loader {
            env,
            files: Vec::new(),
            stack: Vec::new(),
        }
    }

    fn load_root(&mut self) -> Option<MenuNode> {
        let path = locate(self.env.config_dirs(), &self.env.menu_file())?;
        self.load_file(&path)
    }

    fn load_file(&mut self, path: &Path) -> Option<MenuNode> {
        if self.stack.iter().any(|p| p == path) || self.stack.len() >= MAX_MERGE_DEPTH {
            tracing::warn!(target: "sycoca", path = %path.display(), "menu merge cycle");
            return None;
        }

        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) => {
                if !is_absent_file_error(&e) {
                    tracing::warn!(
                        target: "sycoca",
                        path = %path.display(),
                        error = %e,
                        "failed to read menu file"
                    );
                }
                return None;
            }
        };

        if !self.files.iter().any(|p| p == path) {
            self.files.push(path.to_path_buf());
        }

        let base_dir = path.parent().unwrap_or_else(|| Path::new("/"));
        let node = match MenuNode::parse(&contents, base_dir) {
            Ok(node) => node,
            Err(e) => {
                tracing::warn!(
                    target: "sycoca",
                    path = %path.display(),
                    error = %e,
                    "failed to parse menu file"
                );
                return None;
            }
        };

        self.stack.push(path.to_path_buf());
        let ret = self.resolve_merges(node, path);
        self.stack.pop();
        Some(ret)
    }

    fn resolve_merges(&mut self, mut node: MenuNode, file: &Path) -> MenuNode {
        for child in std::mem::take(&mut node.children) {
            let child = self.resolve_merges(child, file);
            node.add_child(child);
        }

        for reference in std::mem::take(&mut node.merges) {
            for target in self.merge_targets(&reference.source, file) {
                let mut loaded = match self.load_file(&target) {
                    Some(loaded) => loaded,
                    None => continue,
                };

                loaded.name = node.name.clone();
                node = if reference.on_top {
                    merge(node, loaded)
                } else {
                    merge(loaded, node)
                };
            }
        }

        node
    }

    fn merge_targets(&self, source: &MergeSource, file: &Path) -> Vec<PathBuf> {
        fn menu_files(dir: &Path) -> Vec<PathBuf> {
            let mut files = list_files(dir, ".menu", false);
            files.sort();
            files.into_iter().map(|(_, path)| path).collect()
        }

        let config_dirs = self.env.config_dirs();
        match source {
            MergeSource::Path(path) => vec![path.clone()],
            MergeSource::Parent => {
                let origin = config_dirs
                    .iter()
                    .enumerate()
                    .find_map(|(idx, dir)| file.strip_prefix(dir).ok().map(|rel| (idx, rel)));
                match origin {
                    Some((idx, rel)) => locate(&config_dirs[idx + 1..], &rel.to_string_lossy())
                        .into_iter()
                        .collect(),
                    None => Vec::new(),
                }
            }
            MergeSource::Dir(dir) => menu_files(dir),
            MergeSource::DefaultDirs => {
                let menu_file = self.env.menu_file();
                let merged = format!("{}-merged", menu_file.trim_end_matches(".menu"));
                config_dirs
                    .iter()
                    .rev()
                    .flat_map(|dir| menu_files(&dir.join(&merged)))
                    .collect()
            }
        }
    }
}

/// What the menu build produced, besides new services.
#[derive(Clone, Debug, Default)]
pub struct MenuBuild {
    pub groups: Vec<ServiceGroup>,
    /// `AppDir`s outside the standard application directories.
    pub extra_dirs: Vec<PathBuf>,
    /// Every menu file read.
    pub menu_files: Vec<PathBuf>,
}

/// Where a menu may take applications from.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum Pool {
    Standard,
    Dir(PathBuf),
}

fn collect_app_dirs(node: &MenuNode, out: &mut Vec<PathBuf>) {
    for dir in &node.app_dirs {
        if !out.contains(dir) {
            out.push(dir.clone());
        }
    }

    for child in &node.children {
        collect_app_dirs(child, out);
    }
}

/// Scans an extra application directory into `services`, and returns
/// the storage ids found there.
fn scan_app_dir(
    dir: &Path,
    env: &Environment,
    services: &mut ServiceFactory,
    types: &ServiceTypeFactory,
) -> Vec<String> {
    let mut files = list_files(dir, APPLICATIONS.extension, APPLICATIONS.recursive);
    files.sort();

    let mut ret = Vec::new();
    for (rel_path, path) in files {
        let file = match DesktopFile::read(&path) {
            Ok(file) => file,
            Err(e) => {
                tracing::warn!(
                    target: "sycoca",
                    path = %path.display(),
                    error = %e,
                    "failed to read desktop file"
                );
                continue;
            }
        };

        // Outside the resource directories there is no relative path
        // to go by; the menu id stays relative to the AppDir.
        let path = path.to_string_lossy();
        let mut service =
            match ServiceFactory::create_service(&path, &file, env.language(), types) {
                Some(service) if service.is_application() => service,
                _ => continue,
            };
        service.set_menu_id(rel_path.replace('/', "-"));
        ret.push(service.storage_id().to_string());
        services.add(service);
    }

    ret
}

/// A listed sub-menu, ready for layout.
#[derive(Clone, Debug)]
struct SubMenu {
    name: String,
    rel_path: String,
    caption: String,
    child_count: i32,
}

#[derive(Debug, Default)]
struct LaidOut {
    children: Vec<GroupChild>,
    child_count: i32,
    /// `Menuname` options to apply to the sub-groups.
    menu_options: Vec<(String, LayoutOptions)>,
}

impl LaidOut {
    fn push_menu(&mut self, menu: SubMenu) {
        self.child_count += menu.child_count;
        self.children.push(GroupChild::Group(menu.rel_path));
    }

    fn push_file(&mut self, service: &Service) {
        self.child_count += 1;
        self.children
            .push(GroupChild::Service(service.storage_id().to_string()));
    }

    /// Drops leading, trailing and repeated separators.
    fn tidy_separators(&mut self) {
        let mut tidied: Vec<GroupChild> = Vec::with_capacity(self.children.len());
        for child in std::mem::take(&mut self.children) {
            let redundant = child == GroupChild::Separator
                && tidied.last().map_or(true, |last| *last == GroupChild::Separator);
            if !redundant {
                tidied.push(child);
            }
        }

        if tidied.last() == Some(&GroupChild::Separator) {
            tidied.pop();
        }
        self.children = tidied;
    }
}

fn sort_key(service: &Service) -> (String, String) {
    (service.name.to_lowercase(), service.storage_id().to_string())
}

/// Orders sub-menus and applications after `layout`, or sub-menus
/// then applications when there is none.  Items a layout does not
/// mention, explicitly or through a `Merge`, are left out.
fn lay_out(layout: Option<&Layout>, mut menus: Vec<SubMenu>, mut files: Vec<&Service>) -> LaidOut {
    menus.sort_by_cached_key(|m| (m.caption.to_lowercase(), m.rel_path.clone()));
    files.sort_by_cached_key(|s| sort_key(s));

    let default_items = [
        LayoutItem::Merge(MergeKind::Menus),
        LayoutItem::Merge(MergeKind::Files),
    ];
    let items = match layout {
        Some(layout) if !layout.items.is_empty() => layout.items.as_slice(),
        _ => &default_items[..],
    };

    let mut menus: Vec<Option<SubMenu>> = menus.into_iter().map(Some).collect();
    let mut files: Vec<Option<&Service>> = files.into_iter().map(Some).collect();
    let mut ret = LaidOut::default();
    for item in items {
        match item {
            LayoutItem::Filename(id) => {
                let slot = files
                    .iter_mut()
                    .find(|slot| matches!(slot, Some(s) if s.storage_id() == id.as_str()));
                if let Some(service) = slot.and_then(Option::take) {
                    ret.push_file(service);
                }
            }
            LayoutItem::Menuname { name, options } => {
                let slot = menus
                    .iter_mut()
                    .find(|slot| matches!(slot, Some(m) if &m.name == name));
                if let Some(menu) = slot.and_then(Option::take) {
                    ret.menu_options.push((menu.rel_path.clone(), *options));
                    ret.push_menu(menu);
                }
            }
            LayoutItem::Separator => ret.children.push(GroupChild::Separator),
            LayoutItem::Merge(MergeKind::Menus) => {
                for menu in menus.iter_mut().filter_map(Option::take) {
                    ret.push_menu(menu);
                }
            }
            LayoutItem::Merge(MergeKind::Files) => {
                for service in files.iter_mut().filter_map(Option::take) {
                    ret.push_file(service);
                }
            }
            LayoutItem::Merge(MergeKind::All) => {
                let mut both: Vec<(String, Result<SubMenu, &Service>)> = Vec::new();
                for menu in menus.iter_mut().filter_map(Option::take) {
                    both.push((menu.caption.to_lowercase(), Ok(menu)));
                }
                for service in files.iter_mut().filter_map(Option::take) {
                    both.push((service.name.to_lowercase(), Err(service)));
                }

                both.sort_by(|x, y| x.0.cmp(&y.0));
                for (_, child) in both {
                    match child {
                        Ok(menu) => ret.push_menu(menu),
                        Err(service) => ret.push_file(service),
                    }
                }
            }
        }
    }

    ret.tidy_separators();
    ret
}

struct Evaluator<'a> {
    env: &'a Environment,
    services: &'a ServiceFactory,
    standard_dirs: Vec<PathBuf>,
    pools: HashMap<Pool, Vec<String>>,
    /// Storage ids matched by each menu, by relative path.
    matched: HashMap<String, Vec<String>>,
    allocated: HashSet<String>,
    groups: BTreeMap<String, ServiceGroup>,
}

impl<'a> Evaluator<'a> {
    fn node_pools(&self, node: &MenuNode, inherited: &[Pool]) -> Vec<Pool> {
        let mut ret = inherited.to_vec();
        let mut add = |pool: Pool| {
            if !ret.contains(&pool) {
                ret.push(pool);
            }
        };

        if node.default_app_dirs {
            add(Pool::Standard);
        }

        for dir in &node.app_dirs {
            if self.standard_dirs.contains(dir) {
                add(Pool::Standard);
            } else {
                add(Pool::Dir(dir.clone()));
            }
        }

        ret
    }

    /// Applications of `pools` visible in the current desktop.
    fn candidates(&self, pools: &[Pool]) -> Vec<&'a Service> {
        let services = self.services;
        let mut seen = HashSet::new();
        let mut ret = Vec::new();
        for pool in pools {
            for id in self.pools.get(pool).into_iter().flatten() {
                if !seen.insert(id.as_str()) {
                    continue;
                }

                if let Some(service) = services.find_by_storage_id(id) {
                    if !service.hidden && service.shown_in(self.env.desktops()) {
                        ret.push(service);
                    }
                }
            }
        }

        ret
    }

    fn allocate(&mut self, node: &MenuNode, rel_path: &str, inherited: &[Pool], unallocated_pass: bool) {
        if node.deleted == Some(true) {
            return;
        }

        let pools = self.node_pools(node, inherited);
        if node.only_unallocated.unwrap_or(false) == unallocated_pass {
            let candidates = self.candidates(&pools);
            let mut selected: Vec<&str> = Vec::new();
            for (include, rule) in &node.rules {
                for service in &candidates {
                    if !rule.matches(service) {
                        continue;
                    }

                    let id = service.storage_id();
                    if *include {
                        if !selected.contains(&id) {
                            selected.push(id);
                        }
                    } else {
                        selected.retain(|s| *s != id);
                    }
                }
            }

            if unallocated_pass {
                selected.retain(|id| !self.allocated.contains(*id));
            } else {
                self.allocated
                    .extend(selected.iter().map(|id| id.to_string()));
            }

            let selected = selected.into_iter().map(str::to_string).collect();
            self.matched.insert(rel_path.to_string(), selected);
        }

        for child in &node.children {
            let child_path = format!("{}{}/", rel_path, child.name);
            self.allocate(child, &child_path, &pools, unallocated_pass);
        }
    }

    fn read_directory(&self, node: &MenuNode, dirs: &[PathBuf], group: &mut ServiceGroup) {
        let lang = self.env.language();
        for name in node.directories.iter().rev() {
            let path = match dirs.iter().map(|d| d.join(name)).find(|p| p.is_file()) {
                Some(path) => path,
                None => continue,
            };

            match DesktopFile::read(&path) {
                Ok(file) => {
                    if let Some(entry) = file.desktop_group() {
                        if let Some(caption) = entry.localized("Name", lang) {
                            group.caption = caption;
                        }
                        group.icon = entry.get("Icon").unwrap_or_default();
                        group.comment = entry.localized("Comment", lang).unwrap_or_default();
                        group.no_display = entry.bool("NoDisplay").unwrap_or(false);
                        group.base_group_name = entry.get("X-KDE-BaseGroup").unwrap_or_default();
                        group.directory_file = path.to_string_lossy().into_owned();
                    }
                    return;
                }
                Err(e) => tracing::warn!(
                    target: "sycoca",
                    path = %path.display(),
                    error = %e,
                    "failed to read directory file"
                ),
            }
        }
    }

    /// Produces the group for `node` and its descendants.  Returns the
    /// group's child count if its parent should list it.
    fn produce(
        &mut self,
        node: &MenuNode,
        rel_path: &str,
        inherited_layout: Option<&Layout>,
        inherited_dirs: &[PathBuf],
    ) -> Option<i32> {
        let mut dirs: Vec<PathBuf> = node.directory_dirs.iter().rev().cloned().collect();
        if node.default_directory_dirs {
            dirs.extend(self.env.data_dirs().iter().map(|d| d.join(DIRECTORIES.dir)));
        }
        dirs.extend(inherited_dirs.iter().cloned());

        let mut group = ServiceGroup::new(rel_path);
        group.caption = node.name.clone();
        self.read_directory(node, &dirs, &mut group);
        if node.deleted == Some(true) {
            group.deleted = true;
            self.groups.insert(rel_path.to_string(), group);
            return None;
        }

        let default_layout = node.default_layout.as_ref().or(inherited_layout);
        let mut menus = Vec::new();
        for child in &node.children {
            let child_path = format!("{}{}/", rel_path, child.name);
            if let Some(child_count) = self.produce(child, &child_path, default_layout, &dirs) {
                let caption = self
                    .groups
                    .get(&child_path)
                    .map(|g| g.caption.clone())
                    .unwrap_or_default();
                menus.push(SubMenu {
                    name: child.name.clone(),
                    rel_path: child_path,
                    caption,
                    child_count,
                });
            }
        }

        let services = self.services;
        let files: Vec<&Service> = self
            .matched
            .get(rel_path)
            .into_iter()
            .flatten()
            .filter_map(|id| services.find_by_storage_id(id))
            .filter(|s| !s.no_display)
            .collect();

        let layout = node.layout.as_ref().or(default_layout);
        let laid_out = lay_out(layout, menus, files);
        for (child_path, options) in &laid_out.menu_options {
            if let Some(child) = self.groups.get_mut(child_path) {
                options.apply(child);
            }
        }

        if let Some(layout) = layout {
            layout.options.apply(&mut group);
        }
        group.children = laid_out.children;
        group.child_count = laid_out.child_count;

        let listed = group.child_count > 0 || group.show_empty;
        let child_count = group.child_count;
        self.groups.insert(rel_path.to_string(), group);
        if listed {
            Some(child_count)
        } else {
            None
        }
    }
}

/// The root group when there is no menu file: every visible
/// application, by name.
fn fallback_root(env: &Environment, services: &ServiceFactory) -> ServiceGroup {
    let mut apps: Vec<&Service> = services
        .services()
        .iter()
        .filter(|s| s.is_application() && !s.no_display && !s.hidden)
        .filter(|s| s.shown_in(env.desktops()))
        .collect();
    apps.sort_by_cached_key(|s| sort_key(s));

    let mut root = ServiceGroup::new("");
    root.caption = FALLBACK_CAPTION.to_string();
    root.children = apps
        .iter()
        .map(|s| GroupChild::Service(s.storage_id().to_string()))
        .collect();
    root.child_count = apps.len() as i32;
    root
}

/// Builds the menu groups.  Applications found in extra `AppDir`s are
/// added to `services`.
pub fn build_menu(
    env: &Environment,
    services: &mut ServiceFactory,
    types: &ServiceTypeFactory,
) -> MenuBuild {
    let mut loader = Loader::new(env);
    let root = loader.load_root();
    let menu_files = loader.files;

    let root = match root {
        Some(root) => apply_moves(root),
        None => {
            tracing::debug!(target: "sycoca", "no menu file; listing every application");
            return MenuBuild {
                groups: vec![fallback_root(env, services)],
                extra_dirs: Vec::new(),
                menu_files,
            };
        }
    };

    let standard_dirs: Vec<PathBuf> = env
        .data_dirs()
        .iter()
        .map(|dir| dir.join(APPLICATIONS.dir))
        .collect();
    let mut pools = HashMap::new();
    pools.insert(
        Pool::Standard,
        services
            .services()
            .iter()
            .filter(|s| s.is_application() && !s.menu_id().is_empty())
            .map(|s| s.storage_id().to_string())
            .collect(),
    );

    let mut app_dirs = Vec::new();
    collect_app_dirs(&root, &mut app_dirs);
    let mut extra_dirs = Vec::new();
    for dir in app_dirs {
        if standard_dirs.contains(&dir) {
            continue;
        }

        let found = scan_app_dir(&dir, env, services, types);
        pools.insert(Pool::Dir(dir.clone()), found);
        extra_dirs.push(dir);
    }

    let mut evaluator = Evaluator {
        env,
        services,
        standard_dirs,
        pools,
        matched: HashMap::new(),
        allocated: HashSet::new(),
        groups: BTreeMap::new(),
    };
    evaluator.allocate(&root, "", &[], false);
    evaluator.allocate(&root, "", &[], true);
    evaluator.produce(&root, "", None, &[]);

    MenuBuild {
        groups: evaluator.groups.into_values().collect(),
        extra_dirs,
        menu_files,
    }
}

#[cfg(test)]
mod test {
    use crate::config::EnvironmentBuilder;
    use crate::menu::*;
    use crate::test_util::write_file;
    use test_dir::{DirBuilder, TestDir};

    const DOCTYPE: &str = "<!DOCTYPE Menu PUBLIC \"-//freedesktop//DTD Menu 1.0//EN\"\n \
         \"http://www.freedesktop.org/standards/menu-spec/menu-1.0.dtd\">\n";

    fn app(menu_id: &str, name: &str, categories: &[&str]) -> Service {
        let mut ret = Service::new(format!("/apps/{}", menu_id), "Application");
        ret.name = name.to_string();
        ret.exec = name.to_lowercase();
        ret.set_menu_id(menu_id);
        ret.categories = categories.iter().map(|c| c.to_string()).collect();
        ret
    }

    #[test]
    fn test_parse() {
        let xml = format!(
            "{}<Menu>\n\
               <Name>Applications</Name>\n\
               <DefaultMergeDirs/>\n\
               <DefaultAppDirs/>\n\
               <AppDir>extra</AppDir>\n\
               <Directory>kde-main.directory</Directory>\n\
               <Menu>\n\
                 <Name>Graphics</Name>\n\
                 <Include><And><Category>Graphics</Category><Not><Category>Scanning</Category></Not></And></Include>\n\
                 <Exclude><Filename>gimp.desktop</Filename></Exclude>\n\
               </Menu>\n\
               <Menu><Name>Graphics</Name><Deleted/></Menu>\n\
               <Layout show_empty=\"true\">\n\
                 <Menuname inline=\"true\" inline_limit=\"4\">Graphics</Menuname>\n\
                 <Separator/>\n\
                 <Merge type=\"files\"/>\n\
               </Layout>\n\
               <Move><Old>Graphics</Old><New>Media/Graphics</New></Move>\n\
               <MergeFile type=\"parent\">/etc/xdg/menus/applications.menu</MergeFile>\n\
             </Menu>\n",
            DOCTYPE
        );

        let node = MenuNode::parse(&xml, Path::new("/menus")).expect("parse must succeed");
        assert_eq!(node.name, "Applications");
        assert!(node.default_app_dirs);
        assert_eq!(node.app_dirs, vec![PathBuf::from("/menus/extra")]);
        assert_eq!(node.directories, vec!["kde-main.directory"]);
        assert_eq!(
            node.merges,
            vec![
                MergeRef {
                    source: MergeSource::DefaultDirs,
                    on_top: false
                },
                MergeRef {
                    source: MergeSource::Parent,
                    on_top: true
                },
            ]
        );
        assert_eq!(
            node.moves,
            vec![(String::from("Graphics"), String::from("Media/Graphics"))]
        );

        // The two Graphics menus merged.
        assert_eq!(node.children.len(), 1);
        let graphics = &node.children[0];
        assert_eq!(graphics.deleted, Some(true));
        assert_eq!(
            graphics.rules,
            vec![
                (
                    true,
                    Rule::Or(vec![Rule::And(vec![
                        Rule::Category("Graphics".into()),
                        Rule::Not(vec![Rule::Category("Scanning".into())]),
                    ])])
                ),
                (false, Rule::Or(vec![Rule::Filename("gimp.desktop".into())])),
            ]
        );

        let layout = node.layout.as_ref().expect("layout must be parsed");
        assert_eq!(layout.options.show_empty, Some(true));
        assert_eq!(
            layout.items,
            vec![
                LayoutItem::Menuname {
                    name: "Graphics".into(),
                    options: LayoutOptions {
                        inline: Some(true),
                        inline_limit: Some(4),
                        ..Default::default()
                    },
                },
                LayoutItem::Separator,
                LayoutItem::Merge(MergeKind::Files),
            ]
        );
    }

    #[test]
    fn test_rules() {
        let scanner = app("xsane.desktop", "XSane", &["Graphics", "Scanning"]);
        let gimp = app("gimp.desktop", "GIMP", &["Graphics"]);
        let graphics_only = Rule::And(vec![
            Rule::Category("Graphics".into()),
            Rule::Not(vec![Rule::Category("Scanning".into())]),
        ]);

        assert!(graphics_only.matches(&gimp));
        assert!(!graphics_only.matches(&scanner));
        assert!(Rule::Filename("xsane.desktop".into()).matches(&scanner));
        assert!(Rule::All.matches(&scanner));
        assert!(!Rule::And(vec![]).matches(&scanner));
        assert!(!Rule::Or(vec![]).matches(&scanner));
        assert!(Rule::Not(vec![]).matches(&scanner));
    }

    #[test]
    fn test_merge_and_move() {
        let base = MenuNode {
            name: "Applications".into(),
            directories: vec!["base.directory".into()],
            deleted: Some(false),
            children: vec![
                MenuNode {
                    name: "Games".into(),
                    rules: vec![(true, Rule::Category("Game".into()))],
                    ..Default::default()
                },
                MenuNode {
                    name: "Office".into(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let overlay = MenuNode {
            name: "Ignored".into(),
            directories: vec!["local.directory".into()],
            only_unallocated: Some(true),
            children: vec![MenuNode {
                name: "Games".into(),
                rules: vec![(false, Rule::Filename("mines.desktop".into()))],
                ..Default::default()
            }],
            moves: vec![("Office".into(), "Work/Office".into())],
            ..Default::default()
        };

        let merged = merge(base.clone(), overlay);
        assert_eq!(merged.name, "Applications");
        assert_eq!(merged.directories, vec!["base.directory", "local.directory"]);
        assert_eq!(merged.only_unallocated, Some(true));
        assert_eq!(merged.deleted, Some(false));
        assert_eq!(merged.child("Games").map(|g| g.rules.len()), Some(2));
        // The input is untouched.
        assert_eq!(base.child("Games").map(|g| g.rules.len()), Some(1));

        let moved = apply_moves(merged);
        assert!(moved.child("Office").is_none());
        assert!(moved
            .child("Work")
            .and_then(|work| work.child("Office"))
            .is_some());
        assert!(moved.moves.is_empty());
    }

    #[test]
    fn test_layout_default_and_explicit() {
        let gimp = app("gimp.desktop", "GIMP", &[]);
        let krita = app("krita.desktop", "krita", &[]);
        let menus = || {
            vec![SubMenu {
                name: "Scanners".into(),
                rel_path: "Graphics/Scanners/".into(),
                caption: "Scanners".into(),
                child_count: 2,
            }]
        };

        let default = lay_out(None, menus(), vec![&krita, &gimp]);
        assert_eq!(
            default.children,
            vec![
                GroupChild::Group("Graphics/Scanners/".into()),
                GroupChild::Service("gimp.desktop".into()),
                GroupChild::Service("krita.desktop".into()),
            ]
        );
        assert_eq!(default.child_count, 4);

        let layout = Layout {
            items: vec![
                LayoutItem::Separator,
                LayoutItem::Filename("krita.desktop".into()),
                LayoutItem::Separator,
                LayoutItem::Separator,
                LayoutItem::Merge(MergeKind::All),
                LayoutItem::Separator,
            ],
            options: LayoutOptions::default(),
        };
        let explicit = lay_out(Some(&layout), menus(), vec![&krita, &gimp]);
        assert_eq!(
            explicit.children,
            vec![
                GroupChild::Service("krita.desktop".into()),
                GroupChild::Separator,
                GroupChild::Service("gimp.desktop".into()),
                GroupChild::Group("Graphics/Scanners/".into()),
            ]
        );

        // Unmentioned items are left out.
        let only_gimp = Layout {
            items: vec![LayoutItem::Filename("gimp.desktop".into())],
            options: LayoutOptions::default(),
        };
        let partial = lay_out(Some(&only_gimp), menus(), vec![&krita, &gimp]);
        assert_eq!(partial.children, vec![GroupChild::Service("gimp.desktop".into())]);
        assert_eq!(partial.child_count, 1);
    }

    #[test]
    fn test_build_menu() {
        let temp = TestDir::temp();
        write_file(
            temp.path("global/menus/applications.menu"),
            &format!(
                "{}<Menu>\n\
                   <Name>Applications</Name>\n\
                   <DefaultAppDirs/>\n\
                   <DefaultDirectoryDirs/>\n\
                   <Directory>main.directory</Directory>\n\
                   <Menu>\n\
                     <Name>Graphics</Name>\n\
                     <Directory>graphics.directory</Directory>\n\
                     <Include><Category>Graphics</Category></Include>\n\
                   </Menu>\n\
                   <Menu>\n\
                     <Name>Empty</Name>\n\
                     <Include><Category>Nothing</Category></Include>\n\
                   </Menu>\n\
                   <Menu>\n\
                     <Name>Other</Name>\n\
                     <OnlyUnallocated/>\n\
                     <Include><All/></Include>\n\
                   </Menu>\n\
                 </Menu>\n",
                DOCTYPE
            ),
        );
        write_file(
            temp.path("local/menus/applications.menu"),
            &format!(
                "{}<Menu>\n\
                   <Name>Applications</Name>\n\
                   <MergeFile type=\"parent\">ignored</MergeFile>\n\
                   <Menu>\n\
                     <Name>Graphics</Name>\n\
                     <Exclude><Filename>gimp.desktop</Filename></Exclude>\n\
                   </Menu>\n\
                   <Menu>\n\
                     <Name>Extra</Name>\n\
                     <AppDir>{}</AppDir>\n\
                     <Include><Filename>tool.desktop</Filename></Include>\n\
                   </Menu>\n\
                 </Menu>\n",
                DOCTYPE,
                temp.path("extra").display()
            ),
        );
        write_file(
            temp.path("data/desktop-directories/graphics.directory"),
            "[Desktop Entry]\nName=Graphics\nName[de]=Grafik\nIcon=applications-graphics\nX-KDE-BaseGroup=graphics\n",
        );
        write_file(
            temp.path("extra/tool.desktop"),
            "[Desktop Entry]\nType=Application\nName=Tool\nExec=tool\n",
        );

        let env = EnvironmentBuilder::new()
            .data_dir(temp.path("data"))
            .config_dir(temp.path("local"))
            .config_dir(temp.path("global"))
            .language("de")
            .take()
            .build();

        let mut services = ServiceFactory::new();
        services.add(app("gimp.desktop", "GIMP", &["Graphics"]));
        services.add(app("krita.desktop", "Krita", &["Graphics"]));
        services.add(app("kate.desktop", "Kate", &["Utility"]));
        let mut hidden = app("secret.desktop", "Secret", &["Graphics"]);
        hidden.no_display = true;
        services.add(hidden);

        let build = build_menu(&env, &mut services, &ServiceTypeFactory::new());
        assert_eq!(
            build.menu_files,
            vec![
                temp.path("local/menus/applications.menu"),
                temp.path("global/menus/applications.menu"),
            ]
        );
        assert_eq!(build.extra_dirs, vec![temp.path("extra")]);
        assert!(services.find_by_storage_id("tool.desktop").is_some());

        let group = |rel: &str| {
            build
                .groups
                .iter()
                .find(|g| g.rel_path() == rel)
                .unwrap_or_else(|| panic!("missing group {}", rel))
        };

        let graphics = group("Graphics/");
        assert_eq!(graphics.caption, "Grafik");
        assert_eq!(graphics.base_group_name, "graphics");
        // gimp is excluded locally, secret is allocated but not shown.
        assert_eq!(graphics.children, vec![GroupChild::Service("krita.desktop".into())]);

        // gimp and kate were not allocated by any regular menu.
        let other = group("Other/");
        assert_eq!(
            other.children,
            vec![
                GroupChild::Service("gimp.desktop".into()),
                GroupChild::Service("kate.desktop".into()),
            ]
        );

        let extra = group("Extra/");
        assert_eq!(extra.children, vec![GroupChild::Service("tool.desktop".into())]);

        let root = group("");
        assert_eq!(
            root.children,
            vec![
                GroupChild::Group("Extra/".into()),
                GroupChild::Group("Graphics/".into()),
                GroupChild::Group("Other/".into()),
            ]
        );
        assert_eq!(root.child_count, 4);
        // Empty menus exist, but are not listed.
        assert_eq!(group("Empty/").child_count, 0);
    }

    #[test]
    fn test_fallback_without_menu() {
        let temp = TestDir::temp();
        let env = EnvironmentBuilder::new()
            .data_dir(temp.path("data"))
            .config_dir(temp.path("config"))
            .desktop("KDE")
            .take()
            .build();

        let mut services = ServiceFactory::new();
        services.add(app("zed.desktop", "zed", &[]));
        services.add(app("alpha.desktop", "Alpha", &[]));
        let mut gnome_only = app("gnome.desktop", "Gnome thing", &[]);
        gnome_only.only_show_in = vec!["GNOME".into()];
        services.add(gnome_only);
        let mut plugin = Service::new("plugin.desktop", "Service");
        plugin.name = "Plugin".into();
        services.add(plugin);

        let build = build_menu(&env, &mut services, &ServiceTypeFactory::new());
        assert!(build.menu_files.is_empty());
        assert_eq!(build.groups.len(), 1);
        let root = &build.groups[0];
        assert!(root.is_root());
        assert_eq!(
            root.children,
            vec![
                GroupChild::Service("alpha.desktop".into()),
                GroupChild::Service("zed.desktop".into()),
            ]
        );
        assert_eq!(root.child_count, 2);
    }
}
