//! Static global random seed and the deterministic random source
//!
//! Every worker of a shoal imports the same 4096-byte seed. Tie-breaks that
//! all peers must agree on (which module wins a contested tunnel, which member
//! holds a locker, which commission peer is on duty for a record) draw from a
//! [`DeterministicRandom`] stream derived from that seed and a context label,
//! so every peer computes the same answer without talking to the others.

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::error::{Error, Result};

/// Required seed length in bytes
pub const SEED_LEN: usize = 4096;

/// Process-wide seed holder
#[derive(Default)]
pub struct GlobalSeed {
    seed: RwLock<Option<Arc<[u8]>>>,
}

impl GlobalSeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Import the shared seed; it must be exactly [`SEED_LEN`] bytes
    pub fn import(&self, bytes: &[u8]) -> Result<()> {
        if bytes.len() != SEED_LEN {
            return Err(Error::config_field_invalid(
                "seed",
                format!("seed must be {} bytes, got {}", SEED_LEN, bytes.len()),
            ));
        }
        *self.seed.write() = Some(Arc::from(bytes));
        info!("Imported static global random seed");
        Ok(())
    }

    /// Read and import a seed file
    pub fn import_file(&self, path: &Path) -> Result<()> {
        let bytes = std::fs::read(path).map_err(|source| Error::IoRead {
            path: path.to_path_buf(),
            source,
        })?;
        self.import(&bytes)
    }

    pub fn is_imported(&self) -> bool {
        self.seed.read().is_some()
    }

    /// A random stream for one decision context
    pub fn stream(&self, context: &str) -> Result<DeterministicRandom> {
        let seed = self.seed.read().clone().ok_or(Error::SeedNotImported)?;
        Ok(DeterministicRandom::new(&seed, context))
    }
}

/// Generate a fresh seed file content from the OS random source
pub fn generate_seed() -> Vec<u8> {
    let mut bytes = vec![0u8; SEED_LEN];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Write a fresh seed to `path`, refusing to replace an existing file unless `force`
pub fn write_seed_file(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        return Err(Error::Config(format!(
            "Seed file already exists: {}. Use --force to overwrite.",
            path.display()
        )));
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|source| Error::IoWrite {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    std::fs::write(path, generate_seed()).map_err(|source| Error::IoWrite {
        path: path.to_path_buf(),
        source,
    })?;
    info!(path = %path.display(), "Wrote global random seed");
    Ok(())
}

/// ChaCha20 stream keyed by `SHA-256(seed || len(context) || context)`
pub struct DeterministicRandom {
    rng: ChaCha20Rng,
}

impl DeterministicRandom {
    pub fn new(seed: &[u8], context: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(seed);
        hasher.update((context.len() as u64).to_be_bytes());
        hasher.update(context.as_bytes());
        Self {
            rng: ChaCha20Rng::from_seed(hasher.finalize().into()),
        }
    }

    pub fn next_u64(&mut self) -> u64 {
        self.rng.next_u64()
    }

    /// Uniform index in `0..len` (`len` must be non-zero)
    pub fn index(&mut self, len: usize) -> usize {
        self.rng.gen_range(0..len)
    }

    /// Pick one element; candidates should already be in a canonical order
    pub fn choose<'a, T>(&mut self, candidates: &'a [T]) -> Option<&'a T> {
        candidates.choose(&mut self.rng)
    }

    /// Deterministic permutation of the candidates
    pub fn shuffle<T>(&mut self, candidates: &mut [T]) {
        candidates.shuffle(&mut self.rng);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn imported() -> GlobalSeed {
        let seed = GlobalSeed::new();
        seed.import(&vec![7u8; SEED_LEN]).unwrap();
        seed
    }

    #[test]
    fn test_write_seed_file_round_trips_through_import() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("shoal.seed");
        write_seed_file(&path, false).unwrap();

        let seed = GlobalSeed::new();
        seed.import_file(&path).unwrap();
        assert!(seed.is_imported());

        assert!(write_seed_file(&path, false).is_err());
        write_seed_file(&path, true).unwrap();
    }

    #[test]
    fn test_import_requires_exact_length() {
        let seed = GlobalSeed::new();
        assert!(seed.import(&[1, 2, 3]).is_err());
        assert!(!seed.is_imported());
        assert!(matches!(seed.stream("x"), Err(Error::SeedNotImported)));
    }

    #[test]
    fn test_same_seed_same_choice() {
        let a = imported();
        let b = imported();
        let members = [1u64, 2, 3, 4, 5];

        let pick_a = *a.stream("locker:jobs").unwrap().choose(&members).unwrap();
        let pick_b = *b.stream("locker:jobs").unwrap().choose(&members).unwrap();
        assert_eq!(pick_a, pick_b);
    }

    #[test]
    fn test_context_changes_stream() {
        let seed = imported();
        let mut a = seed.stream("a").unwrap();
        let mut b = seed.stream("b").unwrap();
        assert_ne!(a.next_u64(), b.next_u64());
    }

    #[test]
    fn test_shuffle_is_permutation() {
        let seed = imported();
        let mut items: Vec<u64> = (1..=10).collect();
        seed.stream("shuffle").unwrap().shuffle(&mut items);
        let mut sorted = items.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (1..=10).collect::<Vec<_>>());
    }

    #[test]
    fn test_generate_seed_length() {
        assert_eq!(generate_seed().len(), SEED_LEN);
    }

    #[test]
    fn test_generated_seed_has_no_fixed_bits() {
        // UUIDv4 bytes pin the version nibble and variant bits of every 16-byte block
        let mut patterned = 0;
        let mut total = 0;
        for _ in 0..8 {
            for chunk in generate_seed().chunks(16) {
                total += 1;
                if chunk[6] >> 4 == 4 && chunk[8] >> 6 == 0b10 {
                    patterned += 1;
                }
            }
        }
        // Uniform bytes match both patterns in 1 of 64 blocks
        assert_eq!(total, 2048);
        assert!(patterned < 128, "{}/{} blocks look like UUIDs", patterned, total);
    }

    #[test]
    fn test_index_stays_in_range() {
        let seed = imported();
        let mut random = seed.stream("range").unwrap();
        for len in 1..50 {
            assert!(random.index(len) < len);
        }
        assert_eq!(random.choose::<u64>(&[]), None);
    }
}
