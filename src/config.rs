//! Tunables for the primary backend's embedded KV environment.
//!
//! Grounded in `init_env`'s hardcoded constants in `refs-be-lmdb.c`
//! (`mdb_env_set_maxreaders(1000)`, `mdb_env_set_mapsize(1<<30)`, directory
//! mode `0775`); this crate exposes them as overridable configuration rather
//! than compile-time constants, since embedding applications reasonably
//! disagree about map size.

/// Configuration for the KV backend's environment.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EnvConfig {
    /// Maximum number of concurrent reader transactions.
    pub max_readers: u32,
    /// Maximum size, in bytes, the memory-mapped store may grow to.
    pub map_size: usize,
    /// Unix permission bits used when creating the refdb directory.
    pub dir_mode: u32,
}

impl Default for EnvConfig {
    fn default() -> Self {
        EnvConfig {
            max_readers: 1000,
            map_size: 1 << 30,
            dir_mode: 0o775,
        }
    }
}
