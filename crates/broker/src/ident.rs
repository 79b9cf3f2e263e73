// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Opaque identifier generation.
//!
//! All queue and message ids come from one OS-seeded CSPRNG behind a lock,
//! so no two callers ever observe overlapping output. Ids carry no structure;
//! nothing in the broker inspects their bytes.

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tokio::sync::Mutex;

pub struct IdGenerator {
    rng: Mutex<StdRng>,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self { rng: Mutex::new(StdRng::from_os_rng()) }
    }

    /// Deterministic generator for tests.
    pub fn seeded(seed: u64) -> Self {
        Self { rng: Mutex::new(StdRng::seed_from_u64(seed)) }
    }

    /// Draw `n` fresh random bytes, advancing the shared generator state.
    pub async fn fresh(&self, n: usize) -> Bytes {
        let mut buf = vec![0u8; n];
        self.rng.lock().await.fill_bytes(&mut buf);
        Bytes::from(buf)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "ident_tests.rs"]
mod tests;
