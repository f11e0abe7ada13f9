use serde::{Deserialize, Serialize};

/// Seeded LCG driving graph generation, rewrite choice and oracle sampling.
/// Reproducible across platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeterministicRng {
    state: u64,
}

impl DeterministicRng {
    #[must_use]
    pub const fn new(seed: u64) -> Self {
        Self {
            state: seed ^ 0x9E37_79B9_7F4A_7C15,
        }
    }

    #[must_use]
    pub const fn next_u64(&mut self) -> u64 {
        self.state = self
            .state
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        // High bits of an LCG are the well-mixed ones.
        self.state >> 17
    }

    /// Next value in `[0, upper_exclusive)`; zero for an empty range.
    #[must_use]
    pub fn next_below(&mut self, upper_exclusive: usize) -> usize {
        let upper = u64::try_from(upper_exclusive).unwrap_or(u64::MAX);
        if upper == 0 {
            return 0;
        }
        usize::try_from(self.next_u64() % upper).unwrap_or(0)
    }

    /// Bernoulli trial with integer percent.
    #[must_use]
    pub fn hit_rate_percent(&mut self, percent: u8) -> bool {
        match percent {
            0 => false,
            100.. => true,
            _ => self.next_below(100) < usize::from(percent),
        }
    }

    /// A uniformly chosen element, `None` for an empty slice.
    pub fn pick<'a, T>(&mut self, items: &'a [T]) -> Option<&'a T> {
        items.get(self.next_below(items.len()))
    }
}
