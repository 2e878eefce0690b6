//! Capability profiles.
//!
//! A [`CapabilityProfile`] is the declared permission set for a sandboxed
//! function: which host paths are visible, what network egress is allowed,
//! the per-call wall-clock budget, the guest memory ceiling, and the
//! packages preinstalled into the guest image.
//!
//! Profiles are immutable once built. Construction goes through
//! [`CapabilityProfile::builder`], which validates and normalizes the
//! declaration so that two semantically equal profiles compare equal
//! field-for-field and canonicalize to the same bytes (see [`key`]).

pub mod key;

use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use key::{PoolKey, canonical_bytes};

/// Smallest guest memory ceiling a VM can boot with, in MiB.
pub const GUEST_MIN_MEM_MB: u32 = 32;

/// Default per-call wall-clock budget in milliseconds.
pub const DEFAULT_CPU_MS: u32 = 1_000;

/// Default guest memory ceiling in MiB.
pub const DEFAULT_MEM_MB: u32 = 128;

/// Access mode of a single mount.
///
/// Ordering is significant for canonicalization: `Read` sorts before
/// `ReadWrite`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountMode {
    /// Path is visible read-only inside the guest.
    Read,
    /// Path is visible read-write inside the guest.
    ReadWrite,
}

impl MountMode {
    /// Single-byte tag used by the canonical encoding.
    #[must_use]
    pub const fn tag(self) -> u8 {
        match self {
            Self::Read => 0,
            Self::ReadWrite => 1,
        }
    }
}

impl std::fmt::Display for MountMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read => write!(f, "r"),
            Self::ReadWrite => write!(f, "rw"),
        }
    }
}

/// A host path exposed to the guest with a fixed access mode.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FsMount {
    /// Absolute host path.
    pub path: PathBuf,
    /// Access mode applied to the bind mount.
    pub mode: MountMode,
}

impl FsMount {
    /// Read-only mount of `path`.
    pub fn read(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            mode: MountMode::Read,
        }
    }

    /// Read-write mount of `path`.
    pub fn read_write(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            mode: MountMode::ReadWrite,
        }
    }
}

impl FromStr for FsMount {
    type Err = ProfileError;

    /// Parses the declaration surface syntax `r:/path` or `rw:/path`.
    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let (mode, path) = spec
            .split_once(':')
            .ok_or_else(|| ProfileError::InvalidMountSpec(spec.to_string()))?;
        let mode = match mode {
            "r" => MountMode::Read,
            "rw" => MountMode::ReadWrite,
            _ => return Err(ProfileError::InvalidMountSpec(spec.to_string())),
        };
        Ok(Self {
            path: PathBuf::from(path),
            mode,
        })
    }
}

impl std::fmt::Display for FsMount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.mode, self.path.display())
    }
}

/// Network egress policy for a sandbox.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkPolicy {
    /// No network device is attached to the guest.
    #[default]
    None,
    /// Egress limited to TCP/443 by host-side filtering.
    HttpsOnly,
    /// Unrestricted egress.
    All,
}

impl NetworkPolicy {
    /// Single-byte tag used by the canonical encoding.
    #[must_use]
    pub const fn tag(self) -> u8 {
        match self {
            Self::None => 0,
            Self::HttpsOnly => 1,
            Self::All => 2,
        }
    }
}

impl FromStr for NetworkPolicy {
    type Err = ProfileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "https-only" => Ok(Self::HttpsOnly),
            "all" => Ok(Self::All),
            _ => Err(ProfileError::InvalidNetworkPolicy(s.to_string())),
        }
    }
}

impl std::fmt::Display for NetworkPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::HttpsOnly => write!(f, "https-only"),
            Self::All => write!(f, "all"),
        }
    }
}

/// The declared permission set defining one sandbox environment.
///
/// Built via [`CapabilityProfile::builder`]; the builder sorts mounts by
/// `(path, mode)` and dependencies by their canonical form, so equal
/// declarations produce identical profiles regardless of declaration
/// order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CapabilityProfile {
    /// Host paths exposed to the guest, sorted by `(path, mode)`.
    pub fs: Vec<FsMount>,
    /// Network egress policy.
    pub net: NetworkPolicy,
    /// Per-call wall-clock budget in milliseconds. Always positive.
    pub cpu_ms: u32,
    /// Guest memory ceiling in MiB. At least [`GUEST_MIN_MEM_MB`].
    pub mem_mb: u32,
    /// Package specifiers preinstalled into the pool snapshot, sorted by
    /// canonical form and deduplicated by canonical package name.
    pub dependencies: Vec<String>,
}

impl CapabilityProfile {
    /// Create a new builder.
    #[must_use]
    pub fn builder() -> CapabilityProfileBuilder {
        CapabilityProfileBuilder::default()
    }

    /// The pool key for this profile.
    #[must_use]
    pub fn pool_key(&self) -> PoolKey {
        PoolKey::of(self)
    }
}

/// Builder for [`CapabilityProfile`].
#[derive(Debug, Default)]
pub struct CapabilityProfileBuilder {
    fs: Vec<FsMount>,
    net: NetworkPolicy,
    cpu_ms: Option<u32>,
    mem_mb: Option<u32>,
    dependencies: Vec<String>,
    error: Option<ProfileError>,
}

impl CapabilityProfileBuilder {
    /// Add a mount.
    #[must_use]
    pub fn mount(mut self, mount: FsMount) -> Self {
        self.fs.push(mount);
        self
    }

    /// Add mounts.
    #[must_use]
    pub fn mounts<I>(mut self, mounts: I) -> Self
    where
        I: IntoIterator<Item = FsMount>,
    {
        self.fs.extend(mounts);
        self
    }

    /// Add mounts from declaration-surface specs (`"r:/path"`, `"rw:/path"`).
    ///
    /// Invalid specs are reported by [`Self::build`].
    #[must_use]
    pub fn fs<I, S>(mut self, specs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for spec in specs {
            match spec.as_ref().parse() {
                Ok(mount) => self.fs.push(mount),
                Err(e) => {
                    self.error.get_or_insert(e);
                },
            }
        }
        self
    }

    /// Set the network policy.
    #[must_use]
    pub const fn net(mut self, net: NetworkPolicy) -> Self {
        self.net = net;
        self
    }

    /// Set the per-call wall-clock budget in milliseconds.
    #[must_use]
    pub const fn cpu_ms(mut self, cpu_ms: u32) -> Self {
        self.cpu_ms = Some(cpu_ms);
        self
    }

    /// Set the guest memory ceiling in MiB.
    #[must_use]
    pub const fn mem_mb(mut self, mem_mb: u32) -> Self {
        self.mem_mb = Some(mem_mb);
        self
    }

    /// Add one package specifier.
    #[must_use]
    pub fn dependency(mut self, spec: impl Into<String>) -> Self {
        self.dependencies.push(spec.into());
        self
    }

    /// Add package specifiers.
    #[must_use]
    pub fn dependencies<I, S>(mut self, specs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(specs.into_iter().map(Into::into));
        self
    }

    /// Validate and normalize into an immutable profile.
    ///
    /// # Errors
    ///
    /// Returns a [`ProfileError`] when a mount path is relative or
    /// duplicated, `cpu_ms` is zero, `mem_mb` is below
    /// [`GUEST_MIN_MEM_MB`], or a dependency specifier is empty.
    pub fn build(self) -> Result<CapabilityProfile, ProfileError> {
        if let Some(error) = self.error {
            return Err(error);
        }
        let cpu_ms = self.cpu_ms.unwrap_or(DEFAULT_CPU_MS);
        let mem_mb = self.mem_mb.unwrap_or(DEFAULT_MEM_MB);

        if cpu_ms == 0 {
            return Err(ProfileError::ZeroCpuBudget);
        }
        if mem_mb < GUEST_MIN_MEM_MB {
            return Err(ProfileError::MemoryBelowMinimum {
                mem_mb,
                minimum: GUEST_MIN_MEM_MB,
            });
        }

        let mut fs = self.fs;
        for mount in &fs {
            if !mount.path.is_absolute() {
                return Err(ProfileError::RelativeMountPath(mount.path.clone()));
            }
        }
        fs.sort();
        for pair in fs.windows(2) {
            if pair[0].path == pair[1].path {
                return Err(ProfileError::DuplicateMountPath(pair[0].path.clone()));
            }
        }

        let mut deps: Vec<(DependencyKey, String)> = Vec::with_capacity(self.dependencies.len());
        for spec in self.dependencies {
            let key = DependencyKey::parse(&spec)?;
            deps.push((key, spec));
        }
        deps.sort_by(|a, b| a.0.cmp(&b.0));
        deps.dedup_by(|a, b| a.0.name == b.0.name);
        let dependencies = deps.into_iter().map(|(key, _)| key.canonical()).collect();

        Ok(CapabilityProfile {
            fs,
            net: self.net,
            cpu_ms,
            mem_mb,
            dependencies,
        })
    }
}

/// Canonical decomposition of a package specifier: case-folded name plus
/// the verbatim (whitespace-trimmed) version constraint.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct DependencyKey {
    name: String,
    constraint: String,
}

impl DependencyKey {
    fn parse(spec: &str) -> Result<Self, ProfileError> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(ProfileError::EmptyDependency);
        }
        let split = spec.find(|c: char| "=<>!~@ \t".contains(c)).unwrap_or(spec.len());
        let (name, constraint) = spec.split_at(split);
        if name.is_empty() {
            return Err(ProfileError::EmptyDependency);
        }
        Ok(Self {
            name: name.to_lowercase(),
            constraint: constraint.trim().to_string(),
        })
    }

    fn canonical(&self) -> String {
        format!("{}{}", self.name, self.constraint)
    }
}

/// Errors raised while building a profile.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProfileError {
    /// Mount spec did not match `r:/path` or `rw:/path`.
    #[error("invalid mount spec '{0}', expected 'r:/path' or 'rw:/path'")]
    InvalidMountSpec(String),

    /// Mount path is not absolute.
    #[error("mount path '{0}' is not absolute")]
    RelativeMountPath(PathBuf),

    /// The same path was declared more than once.
    #[error("mount path '{0}' declared more than once")]
    DuplicateMountPath(PathBuf),

    /// `cpu_ms` was zero.
    #[error("cpu_ms must be positive")]
    ZeroCpuBudget,

    /// `mem_mb` was below the guest minimum.
    #[error("mem_mb {mem_mb} is below the guest minimum of {minimum}")]
    MemoryBelowMinimum {
        /// Declared ceiling.
        mem_mb: u32,
        /// Smallest bootable ceiling.
        minimum: u32,
    },

    /// A dependency specifier was empty.
    #[error("empty dependency specifier")]
    EmptyDependency,

    /// Unknown network policy string.
    #[error("unknown network policy '{0}', expected none, https-only or all")]
    InvalidNetworkPolicy(String),
}
