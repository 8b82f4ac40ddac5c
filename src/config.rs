//! The environment a cache is built for: where to look for resources,
//! where to put the cache, and the locale and desktop to build it for.
//! Two environments with different search paths or languages never
//! share a cache file.
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

/// Default time a builder waits for a concurrent builder to finish.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Search locations and locale for one cache.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Environment {
    data_dirs: Vec<PathBuf>,
    config_dirs: Vec<PathBuf>,
    cache_dir: PathBuf,
    language: String,
    desktops: Vec<String>,
    menu_prefix: String,
}

/// Assembles an [`Environment`] one setting at a time.
#[derive(Clone, Debug, Default)]
pub struct EnvironmentBuilder {
    data_dirs: Vec<PathBuf>,
    config_dirs: Vec<PathBuf>,
    cache_dir: Option<PathBuf>,
    language: Option<String>,
    desktops: Vec<String>,
    menu_prefix: String,
}

/// Knobs for one build.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BuildOptions {
    /// Reuse records from the existing cache when their source files
    /// did not change.
    pub incremental: bool,
    /// Give up if another builder holds the lock for longer.
    pub lock_timeout: Duration,
}

impl Default for BuildOptions {
    fn default() -> BuildOptions {
        BuildOptions {
            incremental: true,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

/// Strips the encoding from a POSIX locale name: `de_AT.UTF-8@euro`
/// becomes `de_AT@euro`.  Empty and `POSIX` locales are `C`.
fn normalize_language(raw: &str) -> String {
    let (base, modifier) = match raw.split_once('@') {
        Some((base, modifier)) => (base, Some(modifier)),
        None => (raw, None),
    };
    let base = base.split('.').next().unwrap_or("");

    match (base, modifier) {
        ("", _) | ("POSIX", _) => "C".to_string(),
        (base, Some(modifier)) => format!("{}@{}", base, modifier),
        (base, None) => base.to_string(),
    }
}

/// Splits a colon-separated directory list, dropping relative and
/// empty entries.
fn split_dirs(raw: &str) -> Vec<PathBuf> {
    raw.split(':')
        .filter(|dir| Path::new(dir).is_absolute())
        .map(PathBuf::from)
        .collect()
}

impl EnvironmentBuilder {
    /// Returns a fresh empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a data directory.  Directories are listed most local
    /// first.
    pub fn data_dir(&mut self, path: impl AsRef<Path>) -> &mut Self {
        self.data_dirs.push(path.as_ref().to_owned());
        self
    }

    /// Appends a configuration directory, most local first.
    pub fn config_dir(&mut self, path: impl AsRef<Path>) -> &mut Self {
        self.config_dirs.push(path.as_ref().to_owned());
        self
    }

    /// Sets the directory where the cache file and its stamp live.
    pub fn cache_dir(&mut self, path: impl AsRef<Path>) -> &mut Self {
        self.cache_dir = Some(path.as_ref().to_owned());
        self
    }

    /// Sets the locale used for translated fields.
    pub fn language(&mut self, language: &str) -> &mut Self {
        self.language = Some(normalize_language(language));
        self
    }

    /// Appends a desktop name, for `OnlyShowIn`/`NotShowIn` and
    /// desktop-specific association files.
    pub fn desktop(&mut self, name: impl Into<String>) -> &mut Self {
        self.desktops.push(name.into());
        self
    }

    /// Sets the menu file prefix, as in `XDG_MENU_PREFIX`.
    pub fn menu_prefix(&mut self, prefix: impl Into<String>) -> &mut Self {
        self.menu_prefix = prefix.into();
        self
    }

    /// Returns the contents of `self` as a fresh value; `self` is
    /// reset to the default empty builder state.  This makes it
    /// possible to declare simple configurations in a single
    /// expression, with `.take().build()`.
    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }

    /// Returns the [`Environment`].  Duplicate directories keep their
    /// most local position.  Without a cache directory, the cache
    /// goes in the system temporary directory.
    pub fn build(self) -> Environment {
        fn dedup(dirs: Vec<PathBuf>) -> Vec<PathBuf> {
            let mut ret: Vec<PathBuf> = Vec::with_capacity(dirs.len());
            for dir in dirs {
                if !ret.contains(&dir) {
                    ret.push(dir);
                }
            }

            ret
        }

        Environment {
            data_dirs: dedup(self.data_dirs),
            config_dirs: dedup(self.config_dirs),
            cache_dir: self.cache_dir.unwrap_or_else(std::env::temp_dir),
            language: self.language.unwrap_or_else(|| "C".to_string()),
            desktops: self.desktops,
            menu_prefix: self.menu_prefix,
        }
    }
}

/// Per-user base directories, used when the `XDG_*_HOME` variables
/// are unset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserDirs {
    pub data: PathBuf,
    pub config: PathBuf,
    pub cache: PathBuf,
}

impl UserDirs {
    /// The current user's directories, as found by the `dirs` crate.
    /// Without a home directory, everything goes in the temporary
    /// directory.
    pub fn current() -> UserDirs {
        UserDirs {
            data: dirs::data_dir().unwrap_or_else(std::env::temp_dir),
            config: dirs::config_dir().unwrap_or_else(std::env::temp_dir),
            cache: dirs::cache_dir().unwrap_or_else(std::env::temp_dir),
        }
    }
}

impl Environment {
    /// Reads the freedesktop base directory variables and the locale
    /// from the process environment.
    pub fn from_env() -> Environment {
        Environment::from_vars(|name| std::env::var(name).ok(), UserDirs::current())
    }

    /// Like [`Environment::from_env`], with variables looked up by
    /// `var`.  Unset and empty variables get the freedesktop
    /// defaults, with the per-user directories taken from `user`.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>, user: UserDirs) -> Environment {
        let var = |name: &str| var(name).filter(|value| !value.is_empty());
        let home_dir = |name: &str, default: PathBuf| {
            var(name)
                .map(PathBuf::from)
                .filter(|dir| dir.is_absolute())
                .unwrap_or(default)
        };

        let mut builder = EnvironmentBuilder::new();
        builder.data_dir(home_dir("XDG_DATA_HOME", user.data));
        for dir in split_dirs(
            &var("XDG_DATA_DIRS").unwrap_or_else(|| "/usr/local/share:/usr/share".to_string()),
        ) {
            builder.data_dir(dir);
        }

        builder.config_dir(home_dir("XDG_CONFIG_HOME", user.config));
        for dir in split_dirs(&var("XDG_CONFIG_DIRS").unwrap_or_else(|| "/etc/xdg".to_string())) {
            builder.config_dir(dir);
        }

        builder.cache_dir(home_dir("XDG_CACHE_HOME", user.cache));

        let language = var("LC_ALL")
            .or_else(|| var("LC_MESSAGES"))
            .or_else(|| var("LANG"))
            .unwrap_or_else(|| "C".to_string());
        builder.language(&language);

        for desktop in var("XDG_CURRENT_DESKTOP").unwrap_or_default().split(':') {
            if !desktop.is_empty() {
                builder.desktop(desktop);
            }
        }

        builder.menu_prefix(var("XDG_MENU_PREFIX").unwrap_or_default());
        builder.take().build()
    }

    /// Data directories, most local first.
    pub fn data_dirs(&self) -> &[PathBuf] {
        &self.data_dirs
    }

    /// Configuration directories, most local first.
    pub fn config_dirs(&self) -> &[PathBuf] {
        &self.config_dirs
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn desktops(&self) -> &[String] {
        &self.desktops
    }

    /// The menu file, relative to a configuration directory.
    pub fn menu_file(&self) -> String {
        format!("menus/{}applications.menu", self.menu_prefix)
    }

    /// The data directories joined with `:`.  Stored in the cache
    /// header; a cache is only valid for the same search path.
    pub fn search_path(&self) -> String {
        let dirs: Vec<_> = self
            .data_dirs
            .iter()
            .map(|dir| dir.to_string_lossy().into_owned())
            .collect();
        dirs.join(":")
    }

    /// Returns `sycoca_<language>_<fingerprint>` in the cache
    /// directory, where the fingerprint hashes the search path.
    pub fn cache_path(&self) -> PathBuf {
        use extendhash::sha256;

        let hash = sha256::compute_hash(self.search_path().as_bytes());
        let fingerprint: String = hash[..8].iter().map(|b| format!("{:02x}", b)).collect();
        let language: String = self
            .language
            .chars()
            .map(|c| if c == '/' { '_' } else { c })
            .collect();

        self.cache_dir
            .join(format!("sycoca_{}_{}", language, fingerprint))
    }

    /// The freshness stamp written next to the cache.
    pub fn stamp_path(&self) -> PathBuf {
        let mut name = self.cache_path().into_os_string();
        name.push("stamp");
        PathBuf::from(name)
    }

    /// The file builders lock to exclude each other.
    pub fn lock_path(&self) -> PathBuf {
        let mut name = self.cache_path().into_os_string();
        name.push(".lock");
        PathBuf::from(name)
    }
}

#[test]
fn test_normalize_language() {
    assert_eq!(normalize_language("de_AT.UTF-8"), "de_AT");
    assert_eq!(normalize_language("sr_RS.UTF-8@latin"), "sr_RS@latin");
    assert_eq!(normalize_language("POSIX"), "C");
    assert_eq!(normalize_language(""), "C");
    assert_eq!(normalize_language("fr"), "fr");
}

#[test]
fn test_from_vars() {
    use std::collections::HashMap;

    let user = UserDirs {
        data: PathBuf::from("/home/user/.local/share"),
        config: PathBuf::from("/home/user/.config"),
        cache: PathBuf::from("/home/user/.cache"),
    };
    let vars: HashMap<&str, &str> = [
        ("XDG_CACHE_HOME", "relative/cache"),
        ("XDG_DATA_DIRS", "/opt/share:relative:/usr/share::/opt/share"),
        ("XDG_CONFIG_HOME", ""),
        ("LANG", "de_DE.UTF-8"),
        ("LC_MESSAGES", "fr_FR.UTF-8"),
        ("XDG_CURRENT_DESKTOP", "KDE:GNOME"),
        ("XDG_MENU_PREFIX", "kf5-"),
    ]
    .into_iter()
    .collect();

    let env = Environment::from_vars(|name| vars.get(name).map(|v| v.to_string()), user.clone());
    assert_eq!(
        env.data_dirs(),
        &[
            PathBuf::from("/home/user/.local/share"),
            PathBuf::from("/opt/share"),
            PathBuf::from("/usr/share"),
        ]
    );
    assert_eq!(
        env.config_dirs(),
        &[PathBuf::from("/home/user/.config"), PathBuf::from("/etc/xdg")]
    );
    assert_eq!(env.cache_dir(), Path::new("/home/user/.cache"));
    assert_eq!(env.language(), "fr_FR");
    assert_eq!(env.desktops(), &["KDE".to_string(), "GNOME".to_string()]);
    assert_eq!(env.menu_file(), "menus/kf5-applications.menu");
    assert_eq!(
        env.search_path(),
        "/home/user/.local/share:/opt/share:/usr/share"
    );

    // Absolute XDG homes win over the user directories.
    let env = Environment::from_vars(
        |name| match name {
            "XDG_DATA_HOME" => Some("/data".to_string()),
            "XDG_CACHE_HOME" => Some("/cache".to_string()),
            _ => None,
        },
        user,
    );
    assert_eq!(
        env.data_dirs(),
        &[
            PathBuf::from("/data"),
            PathBuf::from("/usr/local/share"),
            PathBuf::from("/usr/share"),
        ]
    );
    assert_eq!(env.config_dirs()[0], PathBuf::from("/home/user/.config"));
    assert_eq!(env.cache_dir(), Path::new("/cache"));
    assert_eq!(env.language(), "C");
}

#[test]
fn test_current_user_dirs() {
    let user = UserDirs::current();
    assert!(user.data.is_absolute());
    assert!(user.config.is_absolute());
    assert!(user.cache.is_absolute());
}

#[test]
fn test_cache_paths() {
    let env = EnvironmentBuilder::new()
        .data_dir("/a")
        .data_dir("/b")
        .cache_dir("/cache")
        .language("en_US")
        .take()
        .build();
    let other = EnvironmentBuilder::new()
        .data_dir("/b")
        .data_dir("/a")
        .cache_dir("/cache")
        .language("en_US")
        .take()
        .build();

    let path = env.cache_path();
    let name = path
        .file_name()
        .expect("has a file name")
        .to_string_lossy()
        .into_owned();
    assert!(name.starts_with("sycoca_en_US_"));
    assert_eq!(name.len(), "sycoca_en_US_".len() + 16);
    assert_eq!(path.parent(), Some(Path::new("/cache")));

    // Search order matters.
    assert_ne!(path, other.cache_path());
    assert_eq!(env.stamp_path(), PathBuf::from(format!("{}stamp", path.display())));
    assert_eq!(env.lock_path(), PathBuf::from(format!("{}.lock", path.display())));
}
