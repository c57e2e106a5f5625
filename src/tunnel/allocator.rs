//! Random stream identifier allocation
//!
//! Identifiers are drawn uniformly from the 32-bit space and re-rolled when
//! zero or already live. The number of draws per allocation is capped so a
//! broken entropy source or a saturated table surfaces as an error instead of
//! a spin.

use super::{TunnelError, MAX_ALLOCATION_ATTEMPTS};
use ring::rand::{SecureRandom, SystemRandom};
use std::collections::VecDeque;

/// Source of random bytes for identifier generation
pub trait EntropySource {
    /// Fill `dest` with random bytes
    fn fill(&mut self, dest: &mut [u8]) -> Result<(), TunnelError>;
}

/// Operating system CSPRNG
#[derive(Clone)]
pub struct SystemEntropy {
    rng: SystemRandom,
}

impl SystemEntropy {
    pub fn new() -> Self {
        Self {
            rng: SystemRandom::new(),
        }
    }
}

impl Default for SystemEntropy {
    fn default() -> Self {
        Self::new()
    }
}

impl EntropySource for SystemEntropy {
    fn fill(&mut self, dest: &mut [u8]) -> Result<(), TunnelError> {
        self.rng.fill(dest).map_err(|_| TunnelError::Entropy)
    }
}

/// Replays a fixed list of identifiers, then fails.
///
/// Makes identifier assignment deterministic in tests.
#[derive(Debug, Clone, Default)]
pub struct ScriptedEntropy {
    values: VecDeque<u32>,
}

impl ScriptedEntropy {
    pub fn new<I: IntoIterator<Item = u32>>(values: I) -> Self {
        Self {
            values: values.into_iter().collect(),
        }
    }
}

impl EntropySource for ScriptedEntropy {
    fn fill(&mut self, dest: &mut [u8]) -> Result<(), TunnelError> {
        let value = self.values.pop_front().ok_or(TunnelError::Entropy)?;
        let bytes = value.to_be_bytes();
        for (i, byte) in dest.iter_mut().enumerate() {
            *byte = bytes[i % bytes.len()];
        }
        Ok(())
    }
}

/// Stream identifier allocator
pub struct IdAllocator<E = SystemEntropy> {
    source: E,
    max_attempts: u32,
}

impl IdAllocator<SystemEntropy> {
    /// Allocator backed by the system CSPRNG
    pub fn system() -> Self {
        Self::new(SystemEntropy::new())
    }
}

impl<E: EntropySource> IdAllocator<E> {
    pub fn new(source: E) -> Self {
        Self {
            source,
            max_attempts: MAX_ALLOCATION_ATTEMPTS,
        }
    }

    /// Override the draw cap (at least one draw is always made)
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Next non-zero identifier
    #[cfg(test)]
    pub fn next(&mut self) -> Result<u32, TunnelError> {
        self.allocate(|_| false)
    }

    /// Next non-zero identifier for which `in_use` returns false
    pub fn allocate<F>(&mut self, in_use: F) -> Result<u32, TunnelError>
    where
        F: Fn(u32) -> bool,
    {
        let mut bytes = [0u8; 4];
        for _ in 0..self.max_attempts {
            self.source.fill(&mut bytes)?;
            let candidate = u32::from_be_bytes(bytes);
            if candidate != 0 && !in_use(candidate) {
                return Ok(candidate);
            }
        }
        Err(TunnelError::IdSpaceExhausted {
            attempts: self.max_attempts,
        })
    }
}
