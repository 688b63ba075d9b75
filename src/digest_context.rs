//! Multi-algorithm digest accumulator.
//!
//! Runs every digest algorithm of a SignedData (or the single algorithm of a
//! DigestedData) in parallel over one byte stream.

use alloc::boxed::Box;
use alloc::vec::Vec;
use digest::DynDigest;
use spki::AlgorithmIdentifierOwned;

use crate::errors::{Error, Result};
use crate::registry::AlgorithmRegistry;

/// Running hash states for a set of digest algorithms.
///
/// Algorithms unknown to the registry are skipped when the accumulator is
/// started: a message using them fails later, when a signer asks for a digest
/// that was never computed.
pub struct DigestAccumulator {
    digests: Vec<(AlgorithmIdentifierOwned, Box<dyn DynDigest>)>,
    saw_contents: bool,
}

impl DigestAccumulator {
    /// Start digesting with every algorithm in `algorithms` the registry knows.
    pub fn start(algorithms: &[AlgorithmIdentifierOwned], registry: &AlgorithmRegistry) -> Self {
        let mut digests = Vec::with_capacity(algorithms.len());
        for alg in algorithms {
            match registry.digest(&alg.oid) {
                Some(kind) => digests.push((alg.clone(), kind.new_hasher())),
                None => tracing::warn!(oid = %alg.oid, "skipping unsupported digest algorithm"),
            }
        }

        Self {
            digests,
            saw_contents: false,
        }
    }

    /// Feed `data` to every running digest.
    pub fn update(&mut self, data: &[u8]) {
        for (_, hasher) in self.digests.iter_mut() {
            hasher.update(data);
        }
        self.saw_contents = true;
    }

    /// Whether [`update`][Self::update] was called at least once.
    pub fn saw_contents(&self) -> bool {
        self.saw_contents
    }

    /// Number of running digests.
    pub fn len(&self) -> usize {
        self.digests.len()
    }

    /// Whether no digest is running.
    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }

    /// Release all running digests without producing output.
    pub fn cancel(self) {
        drop(self);
    }

    /// Finalize every running digest.
    ///
    /// An accumulator that never saw content still finalizes: the result is
    /// the digest of the empty string, which is what a SignedData with
    /// absent content signs.
    pub fn finish(self) -> Vec<(AlgorithmIdentifierOwned, Vec<u8>)> {
        self.digests
            .into_iter()
            .map(|(alg, hasher)| (alg, hasher.finalize().into_vec()))
            .collect()
    }

    /// Finalize an accumulator that runs exactly one digest.
    pub fn finish_single(self) -> Result<Vec<u8>> {
        if self.digests.len() != 1 {
            return Err(Error::InvalidState("expected exactly one running digest"));
        }

        let mut digests = self.finish();
        match digests.pop() {
            Some((_, digest)) => Ok(digest),
            None => Err(Error::InvalidState("expected exactly one running digest")),
        }
    }
}

impl core::fmt::Debug for DigestAccumulator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DigestAccumulator")
            .field(
                "algorithms",
                &self.digests.iter().map(|(alg, _)| alg.oid).collect::<Vec<_>>(),
            )
            .field("saw_contents", &self.saw_contents)
            .finish()
    }
}
