//! Multiplicative cyclic group permutation over `0..n`.
//!
//! For a prime `p > n`, the group `Z_p^*` is cyclic of order `p - 1`. Repeated
//! multiplication by a primitive root `g` starting from any element visits
//! every value in `1..p` exactly once before returning to the start. Values
//! `x` with `x - 1 < n` are mapped to index `x - 1`; the rest are skipped.
//! Since `p` is the smallest prime above `n`, the skip ratio stays small.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Deterministic trial-division primality test. Inputs here are at most ~2^33.
fn is_prime(n: u64) -> bool {
    if n < 2 {
        return false;
    }
    if n % 2 == 0 {
        return n == 2;
    }
    if n % 3 == 0 {
        return n == 3;
    }
    let mut d = 5u64;
    while d * d <= n {
        if n % d == 0 || n % (d + 2) == 0 {
            return false;
        }
        d += 6;
    }
    true
}

/// Smallest prime strictly greater than `n`.
pub fn next_prime(n: u64) -> u64 {
    let mut candidate = n + 1;
    while !is_prime(candidate) {
        candidate += 1;
    }
    candidate
}

/// Distinct prime factors of `n`.
fn prime_factors(mut n: u64) -> Vec<u64> {
    let mut factors = Vec::new();
    let mut d = 2u64;
    while d * d <= n {
        if n % d == 0 {
            factors.push(d);
            while n % d == 0 {
                n /= d;
            }
        }
        d += if d == 2 { 1 } else { 2 };
    }
    if n > 1 {
        factors.push(n);
    }
    factors
}

fn mul_mod(a: u64, b: u64, m: u64) -> u64 {
    ((u128::from(a) * u128::from(b)) % u128::from(m)) as u64
}

fn pow_mod(mut base: u64, mut exp: u64, m: u64) -> u64 {
    let mut result = 1 % m;
    base %= m;
    while exp > 0 {
        if exp & 1 == 1 {
            result = mul_mod(result, base, m);
        }
        base = mul_mod(base, base, m);
        exp >>= 1;
    }
    result
}

/// Whether `g` generates all of `Z_p^*`, given the prime factors of `p - 1`.
fn is_primitive_root(g: u64, p: u64, factors: &[u64]) -> bool {
    factors.iter().all(|&q| pow_mod(g, (p - 1) / q, p) != 1)
}

/// Parameters of one full-cycle permutation: prime, generator and start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CyclicGroup {
    /// Number of indices permuted (`0..n`).
    pub n: u64,
    /// Prime modulus, smallest prime above `n`.
    pub prime: u64,
    /// Primitive root modulo `prime`.
    pub generator: u64,
    /// First group element visited, in `1..prime`.
    pub start: u64,
}

impl CyclicGroup {
    /// Derive the permutation for `n` indices from `seed`.
    ///
    /// The same `(n, seed)` always yields the same generator and start, which
    /// is what makes a scan order reproducible.
    pub fn new(n: u64, seed: u64) -> Self {
        let prime = next_prime(n);
        let mut rng = StdRng::seed_from_u64(seed);
        if prime <= 3 {
            // Z_2^* = {1}, Z_3^* = {1, 2}: the generator is fixed.
            let generator = prime - 1;
            let start = rng.gen_range(1..prime);
            return Self {
                n,
                prime,
                generator,
                start,
            };
        }

        let factors = prime_factors(prime - 1);
        let generator = loop {
            let candidate = rng.gen_range(2..prime);
            if is_primitive_root(candidate, prime, &factors) {
                break candidate;
            }
        };
        let start = rng.gen_range(1..prime);
        Self {
            n,
            prime,
            generator,
            start,
        }
    }

    /// Iterate indices in `0..n` in permutation order.
    pub fn iter(&self) -> Cycle {
        Cycle {
            group: *self,
            current: self.start,
            done: self.n == 0,
        }
    }
}

/// Iterator over one full cycle of a `CyclicGroup`.
#[derive(Debug, Clone)]
pub struct Cycle {
    group: CyclicGroup,
    current: u64,
    done: bool,
}

impl Iterator for Cycle {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        while !self.done {
            let value = self.current;
            self.current = mul_mod(self.current, self.group.generator, self.group.prime);
            if self.current == self.group.start {
                self.done = true;
            }
            if value - 1 < self.group.n {
                return Some(value - 1);
            }
        }
        None
    }
}
