use std::hash::{Hash, Hasher};

use panel_schema::PolicyId;

/// A deterministic FNV-1a 64-bit hasher.
///
/// Fingerprints must not depend on the process-randomized `DefaultHasher`
/// so cache statistics and debug output are reproducible across runs.
#[derive(Debug)]
pub struct FnvHasher {
    state: u64,
}

impl FnvHasher {
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;

    pub fn new() -> Self {
        Self {
            state: Self::OFFSET_BASIS,
        }
    }
}

impl Default for FnvHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl Hasher for FnvHasher {
    fn finish(&self) -> u64 {
        self.state
    }

    fn write(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.state ^= byte as u64;
            self.state = self.state.wrapping_mul(Self::PRIME);
        }
    }
}

/// Structural identity of an applicable policy set.
///
/// Two cells with the same member ids resolve to the same values, so the
/// fingerprint ignores which unit or date produced it. Equality compares the
/// full member list; the digest only speeds up hashing.
#[derive(Debug, Clone)]
pub struct PolicySetFingerprint {
    digest: u64,
    members: Box<[PolicyId]>,
}

impl PolicySetFingerprint {
    pub fn from_ids<I>(ids: I) -> Self
    where
        I: IntoIterator<Item = PolicyId>,
    {
        let mut members: Vec<PolicyId> = ids.into_iter().collect();
        members.sort_unstable();
        members.dedup();

        let mut hasher = FnvHasher::new();
        for id in &members {
            hasher.write(&id.0.to_le_bytes());
        }
        Self {
            digest: hasher.finish(),
            members: members.into_boxed_slice(),
        }
    }

    pub fn digest(&self) -> u64 {
        self.digest
    }

    pub fn members(&self) -> &[PolicyId] {
        &self.members
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl PartialEq for PolicySetFingerprint {
    fn eq(&self, other: &Self) -> bool {
        self.digest == other.digest && self.members == other.members
    }
}

impl Eq for PolicySetFingerprint {}

impl Hash for PolicySetFingerprint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.digest);
    }
}
