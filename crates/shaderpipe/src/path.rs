use std::fmt::Display;
use std::path::PathBuf;

use rustc_hash::FxHashMap;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("virtual shader path `{0}` must be absolute from the virtual root `/`")]
    NotRooted(String),
    #[error("virtual shader path `{0}` must have relative directories (`../`) collapsed")]
    RelativeSegment(String),
    #[error("backslashes are not permitted in virtual shader path `{0}`")]
    Backslash(String),
    #[error("wrong extension on `{0}`: only .h is allowed for shared headers")]
    SharedHeaderExtension(String),
    #[error("wrong extension on `{0}`: only .usf or .ush allowed")]
    ShaderExtension(String),
    #[error("no directory mapping registered for `{0}`")]
    Unmapped(String),
    #[error("platform `{0}` declares no include directory")]
    NoPlatformIncludeDir(String),
}

/// A virtual shader file path, absolute from the virtual root `/`.
///
/// Virtual paths decouple shader source organization from the on-disk layout;
/// they are mapped to physical files through registered directory mappings.
/// A `VirtualPath` is always validated on construction: callers never see an
/// unvalidated instance.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct VirtualPath(String);

impl VirtualPath {
    pub fn new(path: impl Into<String>, mappings: &PathMappings) -> Result<Self, PathError> {
        let path = path.into();
        mappings.check_virtual_path(&path)?;
        Ok(Self(path))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The virtual directory containing this file, without trailing slash.
    pub fn parent(&self) -> &str {
        match self.0.rfind('/') {
            Some(0) | None => "/",
            Some(idx) => &self.0[..idx],
        }
    }
}

impl Display for VirtualPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for VirtualPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

pub(crate) const AUTOGEN_STEM: &str = "/Engine/Generated/ShaderAutogen/";
const PLATFORM_PREFIXES: [(&str, &str); 2] = [
    ("/Platform/Private/", "Private"),
    ("/Platform/Public/", "Public"),
];

/// A target shader platform, as declared by its backend.
#[derive(Clone, Debug, Default)]
pub struct PlatformDesc {
    /// Platform-specific include directory with leading and trailing slash
    /// (e.g. `/D3D/`), or `None` when the platform has no private includes.
    pub include_directory: Option<String>,
}

/// Registered virtual directory mappings and platform path substitutions.
///
/// Owned by the `CompilationContext`; there is deliberately no process-wide
/// mapping table.
#[derive(Default)]
pub struct PathMappings {
    mappings: FxHashMap<String, PathBuf>,
    shared_directories: Vec<String>,
    platforms: FxHashMap<String, PlatformDesc>,
}

impl PathMappings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a mapping from a virtual directory to a physical directory.
    /// The virtual directory must start with `/` and have no trailing slash.
    pub fn add_mapping(&mut self, virtual_dir: impl Into<String>, physical: impl Into<PathBuf>) {
        self.mappings.insert(virtual_dir.into(), physical.into());
    }

    /// Declares a virtual directory whose headers are shared with host code
    /// and therefore restricted to the `.h` extension.
    pub fn add_shared_directory(&mut self, virtual_dir: impl Into<String>) {
        self.shared_directories.push(virtual_dir.into());
    }

    pub fn add_platform(&mut self, name: impl Into<String>, desc: PlatformDesc) {
        self.platforms.insert(name.into(), desc);
    }

    pub fn platform_include_directory(&self, platform: &str) -> Option<&str> {
        self.platforms
            .get(platform)
            .and_then(|p| p.include_directory.as_deref())
    }

    /// Validates the virtual path rules: rooted, collapsed, forward slashes,
    /// and the per-directory-class extension restrictions.
    pub fn check_virtual_path(&self, path: &str) -> Result<(), PathError> {
        if !path.starts_with('/') {
            return Err(PathError::NotRooted(path.to_string()));
        }
        if path.contains("..") {
            return Err(PathError::RelativeSegment(path.to_string()));
        }
        if path.contains('\\') {
            return Err(PathError::Backslash(path.to_string()));
        }

        let extension = path.rsplit('/').next().and_then(|f| f.rsplit_once('.')).map(|(_, e)| e);
        let is_shared = self.shared_directories.iter().any(|d| path.starts_with(d.as_str()));
        if is_shared {
            if extension != Some("h") {
                return Err(PathError::SharedHeaderExtension(path.to_string()));
            }
        } else if path.starts_with("/ThirdParty/") {
            // third party includes have no naming convention restrictions
        } else if !matches!(extension, Some("usf") | Some("ush")) || path.ends_with(".usf.usf") {
            return Err(PathError::ShaderExtension(path.to_string()));
        }
        Ok(())
    }

    /// Rewrites `/Platform/{Private,Public}/...` using the target platform's
    /// declared include directory. The substitution is only committed when a
    /// directory mapping exists for the candidate platform root.
    pub fn replace_platform_path(&self, path: &mut String, platform: &str) -> bool {
        let Some(include_dir) = self.platform_include_directory(platform) else {
            return false;
        };

        for (prefix, visibility) in PLATFORM_PREFIXES {
            if path.starts_with(prefix) {
                // include_dir carries leading and trailing slash
                let candidate_root = format!("/Platform{}", include_dir.trim_end_matches('/'));
                if self.mappings.contains_key(&candidate_root) {
                    *path = format!(
                        "/Platform{include_dir}{visibility}/{}",
                        &path[prefix.len()..]
                    );
                    return true;
                }
            }
        }
        false
    }

    /// Rewrites `/Engine/Generated/ShaderAutogen/...` to
    /// `/ShaderAutogen/<platform>/...`.
    pub fn replace_autogen_path(&self, path: &mut String, platform: &str) -> bool {
        if let Some(rest) = path.strip_prefix(AUTOGEN_STEM) {
            *path = format!("/ShaderAutogen/{platform}/{rest}");
            true
        } else {
            false
        }
    }

    /// Applies both substitutions, in order. Always called before the file
    /// cache is consulted so that platform-specific files are picked up.
    pub fn fixup(&self, path: &mut String, platform: &str) -> bool {
        let replaced = self.replace_platform_path(path, platform);
        self.replace_autogen_path(path, platform) || replaced
    }

    /// True when the path resides in a platform-specific subtree that does
    /// not belong to `platform`, and should therefore be skipped by the
    /// include scan.
    pub fn is_foreign_platform_include(&self, path: &str, platform: &str) -> bool {
        if !path.starts_with("/Platform/") {
            return false;
        }
        match self.platform_include_directory(platform) {
            Some(dir) => !path.starts_with(&format!("/Platform{}", dir.trim_end_matches('/'))),
            None => true,
        }
    }

    /// Maps a virtual path to a physical path using the longest matching
    /// registered directory mapping, walking from the full parent directory
    /// up to the root.
    pub fn resolve(&self, path: &VirtualPath) -> Result<PathBuf, PathError> {
        let mut dir = path.parent();
        loop {
            if let Some(physical) = self.mappings.get(dir) {
                let suffix = &path.as_str()[dir.len()..];
                let mut out = physical.clone();
                out.extend(suffix.split('/').filter(|s| !s.is_empty()));
                return Ok(out);
            }
            match dir.rfind('/') {
                Some(0) if dir != "/" => dir = "/",
                Some(idx) if idx > 0 => dir = &dir[..idx],
                _ => return Err(PathError::Unmapped(path.to_string())),
            }
        }
    }
}

/// Collapses `.` and `..` segments of a relative include against the
/// including file's virtual directory. Returns `None` when the path escapes
/// the virtual root.
pub fn collapse_relative(parent_dir: &str, relative: &str) -> Option<String> {
    let mut segments: Vec<&str> = parent_dir.split('/').filter(|s| !s.is_empty()).collect();
    for seg in relative.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                segments.pop()?;
            }
            other => segments.push(other),
        }
    }
    Some(format!("/{}", segments.join("/")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mappings() -> PathMappings {
        let mut m = PathMappings::new();
        m.add_mapping("/Engine", "/tmp/engine/shaders");
        m.add_mapping("/Game", "/tmp/game/shaders");
        m.add_shared_directory("/Engine/Shared");
        m.add_platform(
            "TestPlatform",
            PlatformDesc {
                include_directory: Some("/TestPlatform/".to_string()),
            },
        );
        m
    }

    #[test]
    fn rejects_malformed_paths() {
        let m = mappings();
        assert!(matches!(
            m.check_virtual_path("Engine/Foo.usf"),
            Err(PathError::NotRooted(_))
        ));
        assert!(matches!(
            m.check_virtual_path("/Engine/../Foo.usf"),
            Err(PathError::RelativeSegment(_))
        ));
        assert!(matches!(
            m.check_virtual_path("/Engine\\Foo.usf"),
            Err(PathError::Backslash(_))
        ));
        assert!(matches!(
            m.check_virtual_path("/Engine/Foo.hlsl"),
            Err(PathError::ShaderExtension(_))
        ));
        assert!(matches!(
            m.check_virtual_path("/Engine/Foo.usf.usf"),
            Err(PathError::ShaderExtension(_))
        ));
        assert!(matches!(
            m.check_virtual_path("/Engine/Shared/Defs.ush"),
            Err(PathError::SharedHeaderExtension(_))
        ));
    }

    #[test]
    fn accepts_valid_paths() {
        let m = mappings();
        assert!(m.check_virtual_path("/Engine/Private/Common.ush").is_ok());
        assert!(m.check_virtual_path("/Game/Foo.usf").is_ok());
        assert!(m.check_virtual_path("/Engine/Shared/Defs.h").is_ok());
        assert!(m.check_virtual_path("/ThirdParty/stb/stb.inl").is_ok());
    }

    #[test]
    fn longest_mapping_wins() {
        let mut m = mappings();
        m.add_mapping("/Engine/Private", "/tmp/engine-private");
        let path = VirtualPath::new("/Engine/Private/Common.ush", &m).unwrap();
        assert_eq!(
            m.resolve(&path).unwrap(),
            PathBuf::from("/tmp/engine-private/Common.ush")
        );
        let path = VirtualPath::new("/Engine/Public/Platform.ush", &m).unwrap();
        assert_eq!(
            m.resolve(&path).unwrap(),
            PathBuf::from("/tmp/engine/shaders/Public/Platform.ush")
        );
    }

    #[test]
    fn unmapped_path_is_an_error() {
        let m = mappings();
        let path = VirtualPath::new("/Plugin/Foo.usf", &m).unwrap();
        assert!(matches!(m.resolve(&path), Err(PathError::Unmapped(_))));
    }

    #[test]
    fn platform_substitution_requires_mapping() {
        let mut m = mappings();
        let mut path = "/Platform/Private/Feature.ush".to_string();
        // no mapping for the candidate root yet: substitution must not commit
        assert!(!m.replace_platform_path(&mut path, "TestPlatform"));
        assert_eq!(path, "/Platform/Private/Feature.ush");

        m.add_mapping("/Platform/TestPlatform", "/tmp/platform");
        assert!(m.replace_platform_path(&mut path, "TestPlatform"));
        assert_eq!(path, "/Platform/TestPlatform/Private/Feature.ush");
    }

    #[test]
    fn autogen_substitution() {
        let m = mappings();
        let mut path = "/Engine/Generated/ShaderAutogen/AutogenDefs.ush".to_string();
        assert!(m.replace_autogen_path(&mut path, "TestPlatform"));
        assert_eq!(path, "/ShaderAutogen/TestPlatform/AutogenDefs.ush");
    }

    #[test]
    fn collapse_relative_includes() {
        assert_eq!(
            collapse_relative("/Engine/Private", "../Public/Common.ush").as_deref(),
            Some("/Engine/Public/Common.ush")
        );
        assert_eq!(
            collapse_relative("/Engine", "./Local.ush").as_deref(),
            Some("/Engine/Local.ush")
        );
        assert_eq!(collapse_relative("/", "../Escape.ush"), None);
    }
}
