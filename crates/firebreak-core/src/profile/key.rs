//! Canonical profile encoding and pool keys.
//!
//! Two profiles that differ only in declaration order must land in the
//! same pool; any semantic difference must produce a different key. The
//! canonical form is a self-delimiting, length-prefixed binary encoding
//! of the normalized profile, and the pool key is its SHA-256 digest.
//!
//! Wire layout (all integers big-endian):
//!
//! ```text
//! version:u8
//! 0x01 count:u32 ( path_len:u32 path_bytes mode:u8 )*
//! 0x02 net:u8
//! 0x03 cpu_ms:u32
//! 0x04 mem_mb:u32
//! 0x05 count:u32 ( spec_len:u32 spec_bytes )*
//! ```

use bytes::BufMut;
use sha2::{Digest, Sha256};

use super::CapabilityProfile;

/// Canonical encoding version byte.
const CANONICAL_VERSION: u8 = 1;

const FIELD_FS: u8 = 0x01;
const FIELD_NET: u8 = 0x02;
const FIELD_CPU_MS: u8 = 0x03;
const FIELD_MEM_MB: u8 = 0x04;
const FIELD_DEPENDENCIES: u8 = 0x05;

/// Length in bytes of a [`PoolKey`].
pub const POOL_KEY_LEN: usize = 32;

/// Content-addressed identity of a capability profile.
///
/// Equal keys imply semantically equivalent profiles; distinct profiles
/// collide only with the negligible probability of a SHA-256 collision.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolKey([u8; POOL_KEY_LEN]);

impl PoolKey {
    /// Derive the key for a profile.
    #[must_use]
    pub fn of(profile: &CapabilityProfile) -> Self {
        let digest = Sha256::digest(canonical_bytes(profile));
        Self(digest.into())
    }

    /// Raw digest bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; POOL_KEY_LEN] {
        &self.0
    }

    /// Shortened hex form for log fields.
    #[must_use]
    pub fn short(&self) -> String {
        self.0[..8].iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl std::fmt::Display for PoolKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for PoolKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PoolKey({})", self.short())
    }
}

/// Canonical serialization of a profile.
///
/// The profile is already normalized by its builder (mounts sorted by
/// `(path, mode)`, dependencies sorted and deduplicated), so encoding is
/// a direct walk over the fields.
#[must_use]
pub fn canonical_bytes(profile: &CapabilityProfile) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    buf.put_u8(CANONICAL_VERSION);

    buf.put_u8(FIELD_FS);
    buf.put_u32(u32::try_from(profile.fs.len()).unwrap_or(u32::MAX));
    for mount in &profile.fs {
        let path = mount.path.to_string_lossy();
        put_bytes(&mut buf, path.as_bytes());
        buf.put_u8(mount.mode.tag());
    }

    buf.put_u8(FIELD_NET);
    buf.put_u8(profile.net.tag());

    buf.put_u8(FIELD_CPU_MS);
    buf.put_u32(profile.cpu_ms);

    buf.put_u8(FIELD_MEM_MB);
    buf.put_u32(profile.mem_mb);

    buf.put_u8(FIELD_DEPENDENCIES);
    buf.put_u32(u32::try_from(profile.dependencies.len()).unwrap_or(u32::MAX));
    for dep in &profile.dependencies {
        put_bytes(&mut buf, dep.as_bytes());
    }

    buf
}

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.put_u32(u32::try_from(bytes.len()).unwrap_or(u32::MAX));
    buf.put_slice(bytes);
}

#[cfg(test)]
mod tests {
    use crate::profile::{CapabilityProfile, FsMount, NetworkPolicy};

    use super::*;

    fn profile_a() -> CapabilityProfile {
        CapabilityProfile::builder()
            .mount(FsMount::read("/d"))
            .mount(FsMount::read_write("/e"))
            .net(NetworkPolicy::None)
            .cpu_ms(200)
            .mem_mb(256)
            .dependencies(["b", "A>=1"])
            .build()
            .unwrap()
    }

    #[test]
    fn test_declaration_order_is_irrelevant() {
        let b = CapabilityProfile::builder()
            .mount(FsMount::read_write("/e"))
            .mount(FsMount::read("/d"))
            .net(NetworkPolicy::None)
            .cpu_ms(200)
            .mem_mb(256)
            .dependencies(["a>=1", "b"])
            .build()
            .unwrap();
        assert_eq!(PoolKey::of(&profile_a()), PoolKey::of(&b));
        assert_eq!(canonical_bytes(&profile_a()), canonical_bytes(&b));
    }

    #[test]
    fn test_semantic_difference_changes_key() {
        let base = profile_a();
        let other = CapabilityProfile::builder()
            .mount(FsMount::read("/d"))
            .mount(FsMount::read_write("/e"))
            .cpu_ms(201)
            .mem_mb(256)
            .dependencies(["b", "a>=1"])
            .build()
            .unwrap();
        assert_ne!(PoolKey::of(&base), PoolKey::of(&other));
    }

    #[test]
    fn test_mount_mode_is_semantic() {
        let read = CapabilityProfile::builder()
            .mount(FsMount::read("/d"))
            .build()
            .unwrap();
        let write = CapabilityProfile::builder()
            .mount(FsMount::read_write("/d"))
            .build()
            .unwrap();
        assert_ne!(PoolKey::of(&read), PoolKey::of(&write));
    }

    #[test]
    fn test_display_is_full_hex() {
        let key = PoolKey::of(&profile_a());
        let hex = key.to_string();
        assert_eq!(hex.len(), POOL_KEY_LEN * 2);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(hex.starts_with(&key.short()));
    }

    mod properties {
        use proptest::prelude::*;

        use super::*;

        fn dep_strategy() -> impl Strategy<Value = String> {
            ("[a-zA-Z][a-zA-Z0-9_-]{0,8}", prop::option::of(">=1|==2\\.0|<3"))
                .prop_map(|(name, constraint)| match constraint {
                    Some(c) => format!("{name}{c}"),
                    None => name,
                })
        }

        fn mount_strategy() -> impl Strategy<Value = FsMount> {
            ("/[a-z]{1,6}(/[a-z]{1,6}){0,2}", prop::bool::ANY).prop_map(|(path, rw)| {
                if rw {
                    FsMount::read_write(path)
                } else {
                    FsMount::read(path)
                }
            })
        }

        fn profile_strategy() -> impl Strategy<Value = CapabilityProfile> {
            (
                prop::collection::vec(mount_strategy(), 0..4),
                0u8..3,
                1u32..600_000,
                32u32..4_096,
                prop::collection::vec(dep_strategy(), 0..4),
            )
                .prop_filter_map("duplicate mount path", |(mounts, net, cpu, mem, deps)| {
                    let net = match net {
                        0 => NetworkPolicy::None,
                        1 => NetworkPolicy::HttpsOnly,
                        _ => NetworkPolicy::All,
                    };
                    CapabilityProfile::builder()
                        .mounts(mounts)
                        .net(net)
                        .cpu_ms(cpu)
                        .mem_mb(mem)
                        .dependencies(deps)
                        .build()
                        .ok()
                })
        }

        proptest! {
            /// Permuting mounts and dependencies never changes the key.
            #[test]
            fn prop_key_invariant_under_permutation(
                profile in profile_strategy(),
                seed in 0usize..24,
            ) {
                let mut mounts = profile.fs.clone();
                let mut deps = profile.dependencies.clone();
                let mounts_len = mounts.len().max(1);
                mounts.rotate_left(seed % mounts_len);
                let deps_len = deps.len().max(1);
                deps.rotate_left(seed % deps_len);

                let permuted = CapabilityProfile::builder()
                    .mounts(mounts)
                    .net(profile.net)
                    .cpu_ms(profile.cpu_ms)
                    .mem_mb(profile.mem_mb)
                    .dependencies(deps)
                    .build()
                    .unwrap();
                prop_assert_eq!(PoolKey::of(&profile), PoolKey::of(&permuted));
            }

            /// Changing the call budget always changes the key.
            #[test]
            fn prop_cpu_budget_is_semantic(profile in profile_strategy()) {
                let bumped = CapabilityProfile {
                    cpu_ms: profile.cpu_ms + 1,
                    ..profile.clone()
                };
                prop_assert_ne!(PoolKey::of(&profile), PoolKey::of(&bumped));
            }
        }
    }
}
