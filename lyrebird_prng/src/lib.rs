// Seeded random numbers for Lyrebird.
//
// xoshiro256++ with a SplitMix64 seed expander, written out by hand rather
// than pulled from `rand`. A seed pins every training run and every piece of
// generated music on any platform.
//
// Consumers in `lyrebird_music`:
// - LSTM weight initialization and dropout masks (`lstm.rs`)
// - per-epoch shuffling of training windows (`lstm.rs`)
// - choosing the seed window for generation (`generator.rs`)
// - stochastic decoding policies (`generator.rs`)
//
// Workers that need their own stream (one per training sample in a parallel
// batch) take a child generator from `fork()`, which draws its seed from the
// parent. Forking happens sequentially on the owning thread, so the set of
// child streams is fixed by the parent seed no matter how rayon schedules the
// work.

use serde::{Deserialize, Serialize};

/// Xoshiro256++ PRNG: every random decision in Lyrebird draws from one.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MusicRng {
    s: [u64; 4],
}

impl MusicRng {
    /// SplitMix64 expands `seed` into the 256-bit state.
    pub fn new(seed: u64) -> Self {
        let mut sm = seed;
        Self {
            s: [
                splitmix64(&mut sm),
                splitmix64(&mut sm),
                splitmix64(&mut sm),
                splitmix64(&mut sm),
            ],
        }
    }

    /// Derive an independent child generator, advancing this one.
    pub fn fork(&mut self) -> Self {
        Self::new(self.next_u64())
    }

    pub fn next_u64(&mut self) -> u64 {
        let result = (self.s[0].wrapping_add(self.s[3]))
            .rotate_left(23)
            .wrapping_add(self.s[0]);

        let t = self.s[1] << 17;

        self.s[2] ^= self.s[0];
        self.s[3] ^= self.s[1];
        self.s[1] ^= self.s[2];
        self.s[0] ^= self.s[3];

        self.s[2] ^= t;
        self.s[3] = self.s[3].rotate_left(45);

        result
    }

    /// Uniform `f32` in [0, 1), built from the upper 24 bits.
    pub fn next_f32(&mut self) -> f32 {
        (self.next_u64() >> 40) as f32 / (1u64 << 24) as f32
    }

    /// Uniform `f64` in [0, 1), built from the upper 53 bits.
    pub fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Uniform value in `[low, high)`. Panics if `low >= high`.
    pub fn range_f32(&mut self, low: f32, high: f32) -> f32 {
        assert!(low < high, "empty f32 range [{low}, {high})");
        low + self.next_f32() * (high - low)
    }

    /// Uniform integer in `[low, high)` without modulo bias.
    ///
    /// Panics if `low >= high`.
    pub fn range_u64(&mut self, low: u64, high: u64) -> u64 {
        assert!(low < high, "empty integer range [{low}, {high})");
        let range = high - low;
        // Reject the short tail of the u64 space that would bias `% range`.
        let zone = range.wrapping_neg() % range;
        loop {
            let draw = self.next_u64();
            if draw >= zone {
                return low + draw % range;
            }
        }
    }

    /// Uniform `usize` in `[low, high)`. Panics if `low >= high`.
    pub fn range_usize(&mut self, low: usize, high: usize) -> usize {
        self.range_u64(low as u64, high as u64) as usize
    }

    /// `true` with probability `p`. `p <= 0` never fires, `p >= 1` always does.
    pub fn random_bool(&mut self, p: f64) -> bool {
        self.next_f64() < p
    }

    /// Fisher-Yates shuffle in place.
    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        for i in (1..items.len()).rev() {
            let j = self.range_usize(0, i + 1);
            items.swap(i, j);
        }
    }

    /// Pick an index with probability proportional to `weights[i]`.
    ///
    /// Negative and non-finite weights count as zero. Returns `None` when
    /// nothing has positive weight.
    pub fn choose_weighted(&mut self, weights: &[f32]) -> Option<usize> {
        let clean = |w: f32| if w.is_finite() && w > 0.0 { w as f64 } else { 0.0 };
        let total: f64 = weights.iter().map(|&w| clean(w)).sum();
        if total <= 0.0 {
            return None;
        }
        let target = self.next_f64() * total;
        let mut cumulative = 0.0;
        let mut last_positive = None;
        for (i, &w) in weights.iter().enumerate() {
            let w = clean(w);
            if w <= 0.0 {
                continue;
            }
            cumulative += w;
            last_positive = Some(i);
            if cumulative > target {
                return Some(i);
            }
        }
        // Rounding can leave `target` a hair above the running sum.
        last_positive
    }
}

/// SplitMix64, used only to expand a `u64` seed into xoshiro state.
fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeds_fix_the_stream() {
        let draw = |seed| {
            let mut rng = MusicRng::new(seed);
            (0..256).map(|_| rng.next_u64()).collect::<Vec<_>>()
        };
        assert_eq!(draw(2024), draw(2024));
        assert_ne!(draw(2024)[0], draw(2025)[0]);
    }

    #[test]
    fn forked_children_match_for_equal_parents() {
        let mut a = MusicRng::new(7);
        let mut b = MusicRng::new(7);
        let mut child_a = a.fork();
        let mut child_b = b.fork();
        for _ in 0..64 {
            assert_eq!(child_a.next_u64(), child_b.next_u64());
        }
        assert_eq!(a.next_u64(), b.next_u64());
        assert_ne!(a.fork().next_u64(), child_a.next_u64());
    }

    #[test]
    fn draws_respect_their_ranges() {
        let mut rng = MusicRng::new(31);
        for _ in 0..5_000 {
            let unit = rng.next_f32();
            assert!((0.0..1.0).contains(&unit), "{unit}");
            let weight = rng.range_f32(-0.25, 0.25);
            assert!((-0.25..0.25).contains(&weight), "{weight}");
            let window = rng.range_usize(3, 10);
            assert!((3..10).contains(&window), "{window}");
        }
        assert!(!rng.random_bool(0.0));
        assert!(rng.random_bool(1.0));
    }

    #[test]
    fn range_covers_every_value() {
        let mut rng = MusicRng::new(8);
        let mut seen = [false; 6];
        for _ in 0..600 {
            seen[rng.range_usize(0, 6)] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn shuffle_is_a_permutation() {
        let mut rng = MusicRng::new(3);
        let mut items: Vec<usize> = (0..50).collect();
        rng.shuffle(&mut items);
        let mut sorted = items.clone();
        sorted.sort();
        assert_eq!(sorted, (0..50).collect::<Vec<_>>());
        assert_ne!(items, sorted, "50 items should not shuffle to identity");
    }

    #[test]
    fn choose_weighted_skips_zero_weights() {
        let mut rng = MusicRng::new(9);
        for _ in 0..1000 {
            let i = rng.choose_weighted(&[0.0, 2.0, 0.0, 1.0]).unwrap();
            assert!(i == 1 || i == 3, "picked zero-weight index {i}");
        }
        assert_eq!(rng.choose_weighted(&[0.0, f32::NAN, -1.0]), None);
        assert_eq!(rng.choose_weighted(&[]), None);
    }

    #[test]
    fn state_survives_json() {
        let mut rng = MusicRng::new(99);
        rng.shuffle(&mut [1, 2, 3, 4]);
        let json = serde_json::to_string(&rng).unwrap();
        let mut copy: MusicRng = serde_json::from_str(&json).unwrap();
        assert_eq!(rng.next_f64(), copy.next_f64());
    }
}
