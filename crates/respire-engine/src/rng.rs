//! Deterministic pseudorandom streams
//!
//! Every stochastic decision in a run draws from a named per-population
//! stream so that two runs with identical parameters produce bit-identical
//! outputs. Uniforms come from the historical 69069 linear-congruential
//! generator over 32-bit state; gaussians from the polar Box-Muller method
//! layered on an LCG of their own. The fixed seed tables reproduce archived
//! runs and must not change.

/// Uniform stream: x' = 69069·x + 1 over wrapping 32-bit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lcg {
    state: i32,
}

impl Lcg {
    /// Create a stream at the given seed
    pub fn new(seed: i32) -> Self {
        Self { state: seed }
    }

    /// Current raw state, carried across mid-run reloads
    pub fn state(&self) -> i32 {
        self.state
    }

    /// Next uniform sample in [0, 1)
    pub fn uniform(&mut self) -> f64 {
        self.state = self.state.wrapping_mul(69069).wrapping_add(1);
        let mut x = f64::from(self.state);
        if x < 0.0 {
            x += 4294967296.0;
        }
        x / 4294967296.0
    }
}

/// Gaussian stream: polar Box-Muller over a private uniform stream.
///
/// Each draw rejects points outside the unit circle, so the number of
/// uniforms consumed per gaussian varies; the stream is its own island of
/// state and never shares an LCG with uniform consumers.
#[derive(Debug, Clone, Copy)]
pub struct GaussianStream {
    lcg: Lcg,
}

/// Default gaussian seed used when no per-population seed applies
pub const GAUSSIAN_DEFAULT_SEED: i32 = 38986022;

impl GaussianStream {
    /// Create a stream at the given seed
    pub fn new(seed: i32) -> Self {
        Self { lcg: Lcg::new(seed) }
    }

    /// Next standard-normal sample
    pub fn next(&mut self) -> f64 {
        loop {
            let x = -1.0 + 2.0 * self.lcg.uniform();
            let y = -1.0 + 2.0 * self.lcg.uniform();
            let r2 = x * x + y * y;
            if r2 <= 1.0 && r2 != 0.0 {
                return y * (-2.0 * r2.ln() / r2).sqrt();
            }
        }
    }
}

/// Per-population noise seeds; populations beyond the table take
/// `last entry + population index`.
pub const NOISE_SEEDS: [i32; 53] = [
    2, 3, 7, 12, 14, 15, 16, 17, 19, 20, 22, 23, 24, 25, 26, 29, 35, 36, 39, 42, 45, 47, 48, 49,
    50, 51, 52, 53, 54, 56, 57, 59, 61, 63, 64, 66, 67, 69, 75, 78, 79, 80, 83, 84, 85, 86, 87,
    89, 90, 91, 95, 97, 98,
];

/// Noise seed for a 0-based population index
pub fn noise_seed(pop: usize) -> i32 {
    let last = NOISE_SEEDS.len() - 1;
    if pop > last {
        NOISE_SEEDS[last] + pop as i32
    } else {
        NOISE_SEEDS[pop]
    }
}

/// Per-population threshold-gaussian seeds, matching historical runs on the
/// first 43 populations; later populations take `100 + population index`.
pub const GAUSSIAN_SEEDS: [i32; 43] = [
    38986022, 1391292912, -146887594, -1953281662, 329184802, 1192591352, -1719851788,
    -1818740196, 1864492360, -900638728, -1188332476, 341092380, -930484606, 336680986, 336680986,
    829766224, 755328026, 1360987778, -1078372960, -1685500086, 1152748448, -1089100128,
    -648232574, -776959814, -1810241108, -1074979646, -1932475256, -814349978, 1703279180,
    -715985718, 362197582, -2079242792, 909292898, -1932739534, -1381483014, 996303780,
    1049529372, -1878520724, 1116996432, -631444766, -356560908, 1525966756, -516425190,
];

/// Threshold-gaussian seed for a 0-based population index
pub fn gaussian_seed(pop: usize) -> i32 {
    if pop < GAUSSIAN_SEEDS.len() {
        GAUSSIAN_SEEDS[pop]
    } else {
        100 + pop as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lcg_sequence_is_stable() {
        // pinned so the stream can never silently change
        let mut lcg = Lcg::new(1);
        let first: Vec<f64> = (0..3).map(|_| lcg.uniform()).collect();
        let expected0 = 69070.0 / 4294967296.0;
        assert!((first[0] - expected0).abs() < 1e-15);
        assert!(first.iter().all(|&v| (0.0..1.0).contains(&v)));

        // same seed, same stream
        let mut a = Lcg::new(55);
        let mut b = Lcg::new(55);
        for _ in 0..100 {
            assert_eq!(a.uniform().to_bits(), b.uniform().to_bits());
        }
    }

    #[test]
    fn test_lcg_wraps_negative() {
        // drive the state negative and confirm samples stay in range
        let mut lcg = Lcg::new(i32::MAX);
        for _ in 0..1000 {
            let v = lcg.uniform();
            assert!((0.0..1.0).contains(&v));
        }
    }

    #[test]
    fn test_gaussian_moments() {
        let mut g = GaussianStream::new(GAUSSIAN_DEFAULT_SEED);
        let n = 20000;
        let samples: Vec<f64> = (0..n).map(|_| g.next()).collect();
        let mean: f64 = samples.iter().sum::<f64>() / n as f64;
        let var: f64 = samples.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n as f64;
        assert!(mean.abs() < 0.05, "mean {}", mean);
        assert!((var - 1.0).abs() < 0.1, "var {}", var);
    }

    #[test]
    fn test_seed_tables() {
        assert_eq!(noise_seed(0), 2);
        assert_eq!(noise_seed(52), 98);
        assert_eq!(noise_seed(60), 98 + 60);
        assert_eq!(gaussian_seed(0), GAUSSIAN_DEFAULT_SEED);
        assert_eq!(gaussian_seed(43), 143);
    }
}
