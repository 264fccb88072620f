//! Pluggable sources of non-deterministic values.
//!
//! Every unspecified choice the interpreter makes goes through a
//! [`Generator`]: materializing an unconstrained variable, picking a `goto`
//! target, choosing a procedure implementation, resolving map equality. The
//! deterministic generator fills every choice with a default; the exhaustive
//! generator turns every draw into a branch point and enumerates all paths
//! depth-first by replaying recorded choice prefixes; the random generator
//! samples a configurable number of independent paths.

use num_bigint::BigInt;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Source of non-deterministic values and of the enumeration that drives a
/// lazy test-case stream.
pub trait Generator {
    /// Draws a boolean.
    fn gen_bool(&mut self) -> bool;

    /// Draws an unbounded integer.
    fn gen_int(&mut self) -> BigInt;

    /// Draws an index in `[0, n)`; `n` is at least 1.
    fn gen_index(&mut self, n: usize) -> usize;

    /// True when every draw opens a branch point that [`Generator::next_path`]
    /// will come back to. Single-path generators return false, which lets the
    /// block dispatcher retry sibling `goto` targets locally instead.
    fn explores_all(&self) -> bool {
        false
    }

    /// Prepares the generator for the next enumerated path. Returns false
    /// when the space is exhausted; the default is a single path.
    fn next_path(&mut self) -> bool {
        false
    }
}

/// Fills every choice with the default value: `false`, `0`, and index `0`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeterministicGenerator;

impl Generator for DeterministicGenerator {
    fn gen_bool(&mut self) -> bool {
        false
    }

    fn gen_int(&mut self) -> BigInt {
        BigInt::from(0)
    }

    fn gen_index(&mut self, _n: usize) -> usize {
        0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Arity {
    Bounded(usize),
    /// An integer draw, enumerated in the order `0, 1, -1, 2, -2, ...` up to
    /// the configured radius.
    Integer,
}

#[derive(Debug, Clone)]
struct Choice {
    taken: usize,
    arity: Arity,
}

/// Enumerates every path through the program's choice points depth-first.
///
/// A run replays the recorded prefix and extends it with first alternatives;
/// [`Generator::next_path`] then advances the deepest choice that still has
/// untried alternatives, dropping the suffix behind it. Integer draws are
/// bounded by `int_radius` so the space stays finite.
#[derive(Debug, Clone)]
pub struct ExhaustiveGenerator {
    choices: Vec<Choice>,
    cursor: usize,
    int_radius: u64,
}

impl ExhaustiveGenerator {
    pub const DEFAULT_INT_RADIUS: u64 = 3;

    #[must_use]
    pub fn new(int_radius: u64) -> Self {
        Self {
            choices: Vec::new(),
            cursor: 0,
            int_radius,
        }
    }

    fn limit(&self, arity: Arity) -> usize {
        match arity {
            Arity::Bounded(n) => n,
            Arity::Integer => 2 * usize::try_from(self.int_radius).expect("radius fits usize") + 1,
        }
    }

    fn draw(&mut self, arity: Arity) -> usize {
        if let Some(choice) = self.choices.get(self.cursor) {
            debug_assert_eq!(choice.arity, arity, "replay diverged from the recorded path");
            self.cursor += 1;
            return choice.taken;
        }
        self.choices.push(Choice { taken: 0, arity });
        self.cursor += 1;
        0
    }

    /// Maps an enumeration index to the integer sequence `0, 1, -1, 2, -2, ...`.
    fn zigzag(index: usize) -> BigInt {
        if index == 0 {
            BigInt::from(0)
        } else if index % 2 == 1 {
            BigInt::from((index + 1) / 2)
        } else {
            -BigInt::from(index / 2)
        }
    }
}

impl Default for ExhaustiveGenerator {
    fn default() -> Self {
        Self::new(Self::DEFAULT_INT_RADIUS)
    }
}

impl Generator for ExhaustiveGenerator {
    fn gen_bool(&mut self) -> bool {
        self.draw(Arity::Bounded(2)) == 1
    }

    fn gen_int(&mut self) -> BigInt {
        let index = self.draw(Arity::Integer);
        Self::zigzag(index)
    }

    fn gen_index(&mut self, n: usize) -> usize {
        self.draw(Arity::Bounded(n))
    }

    fn explores_all(&self) -> bool {
        true
    }

    fn next_path(&mut self) -> bool {
        // choices past the cursor were recorded by a path the control flow
        // no longer reaches
        self.choices.truncate(self.cursor);
        while let Some(last) = self.choices.last() {
            let arity = last.arity;
            let taken = last.taken;
            if taken + 1 < self.limit(arity) {
                self.choices.last_mut().expect("checked above").taken += 1;
                self.cursor = 0;
                return true;
            }
            self.choices.pop();
        }
        false
    }
}

/// Samples a fixed number of independent paths from a seeded ChaCha stream;
/// reproducible given the same seed.
#[derive(Debug, Clone)]
pub struct RandomGenerator {
    rng: ChaCha8Rng,
    int_radius: i64,
    remaining_runs: u64,
}

impl RandomGenerator {
    #[must_use]
    pub fn new(seed: u64, int_radius: i64, runs: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            int_radius,
            remaining_runs: runs.max(1),
        }
    }
}

impl Generator for RandomGenerator {
    fn gen_bool(&mut self) -> bool {
        self.rng.gen_bool(0.5)
    }

    fn gen_int(&mut self) -> BigInt {
        BigInt::from(self.rng.gen_range(-self.int_radius..=self.int_radius))
    }

    fn gen_index(&mut self, n: usize) -> usize {
        self.rng.gen_range(0..n)
    }

    fn next_path(&mut self) -> bool {
        if self.remaining_runs > 1 {
            self.remaining_runs -= 1;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn deterministic_defaults() {
        let mut g = DeterministicGenerator;
        assert!(!g.gen_bool());
        assert_eq!(g.gen_int(), BigInt::from(0));
        assert_eq!(g.gen_index(5), 0);
        assert!(!g.next_path());
    }

    #[test]
    fn exhaustive_enumerates_bool_pairs_depth_first() {
        let mut g = ExhaustiveGenerator::default();
        let mut seen = Vec::new();
        loop {
            let pair = (g.gen_bool(), g.gen_bool());
            seen.push(pair);
            if !g.next_path() {
                break;
            }
        }
        assert_eq!(
            seen,
            vec![(false, false), (false, true), (true, false), (true, true)]
        );
    }

    #[test]
    fn exhaustive_integer_order_is_zigzag() {
        let mut g = ExhaustiveGenerator::new(2);
        let mut seen = Vec::new();
        loop {
            seen.push(g.gen_int());
            if !g.next_path() {
                break;
            }
        }
        let expected: Vec<BigInt> = [0i64, 1, -1, 2, -2].into_iter().map(BigInt::from).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn stale_suffix_is_dropped_when_control_flow_changes() {
        let mut g = ExhaustiveGenerator::default();
        // first path: two draws
        let first = g.gen_index(2);
        assert_eq!(first, 0);
        let _ = g.gen_bool();
        assert!(g.next_path());
        // second path: the bool draw advanced
        assert_eq!(g.gen_index(2), 0);
        assert!(g.gen_bool());
        assert!(g.next_path());
        // third path: index advanced; this run consumes only one draw
        assert_eq!(g.gen_index(2), 1);
        assert!(!g.next_path(), "no stale bool choice may survive");
    }

    #[test]
    fn random_generator_is_reproducible_and_bounded() {
        let mut a = RandomGenerator::new(42, 3, 4);
        let mut b = RandomGenerator::new(42, 3, 4);
        for _ in 0..16 {
            assert_eq!(a.gen_int(), b.gen_int());
            assert_eq!(a.gen_bool(), b.gen_bool());
            let i = a.gen_int();
            assert!(i >= BigInt::from(-3) && i <= BigInt::from(3));
            let _ = b.gen_int();
        }
        assert!(a.next_path());
        assert!(a.next_path());
        assert!(a.next_path());
        assert!(!a.next_path());
    }
}
