// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::{Deserialize, Serialize};
use std::{iter::Sum, ops::AddAssign};

/// A tally of test outcomes, for either a single test or a whole run.
///
/// Counters only ever grow within a run. For a single test, exactly one of `disabled`, `success`,
/// `failure` or `error` is 1 once the test has finished, and `warning` is a 0/1 flag.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Counter {
    /// The number of tests that were disabled and never executed.
    pub disabled: usize,

    /// The number of tests that passed.
    pub success: usize,

    /// The number of tests that failed an expectation.
    pub failure: usize,

    /// The number of tests that raised an unexpected error.
    pub error: usize,

    /// The number of tests that reported warnings.
    pub warning: usize,
}

impl Counter {
    /// A counter with every field set to zero.
    pub const ZERO: Self = Self {
        disabled: 0,
        success: 0,
        failure: 0,
        error: 0,
        warning: 0,
    };

    /// Returns a new counter with each field of `self` and `other` summed.
    #[must_use]
    pub fn add(&self, other: &Counter) -> Counter {
        Counter {
            disabled: self.disabled + other.disabled,
            success: self.success + other.success,
            failure: self.failure + other.failure,
            error: self.error + other.error,
            warning: self.warning + other.warning,
        }
    }

    /// Returns the number of test outcomes: disabled, successful, failed and errored tests.
    ///
    /// Warnings are not outcomes: a test with warnings has also succeeded, failed or errored.
    pub fn total(&self) -> usize {
        self.disabled + self.success + self.failure + self.error
    }

    /// Returns a copy of this counter with the warning count cleared.
    #[must_use]
    pub fn outcomes(&self) -> Counter {
        Counter {
            warning: 0,
            ..*self
        }
    }

    /// Returns true if no outcomes and no warnings have been recorded.
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl AddAssign for Counter {
    fn add_assign(&mut self, rhs: Counter) {
        *self = Counter::add(self, &rhs);
    }
}

impl Sum for Counter {
    fn sum<I: Iterator<Item = Counter>>(iter: I) -> Self {
        iter.fold(Counter::ZERO, |acc, c| acc.add(&c))
    }
}

impl<'a> Sum<&'a Counter> for Counter {
    fn sum<I: Iterator<Item = &'a Counter>>(iter: I) -> Self {
        iter.fold(Counter::ZERO, |acc, c| acc.add(c))
    }
}

#[cfg(any(test, feature = "proptest1"))]
mod proptest_impls {
    use super::*;
    use proptest::prelude::*;

    impl Arbitrary for Counter {
        type Parameters = ();
        type Strategy = BoxedStrategy<Self>;

        fn arbitrary_with(_: ()) -> Self::Strategy {
            // Keep values small enough that sums over long sequences can't overflow.
            (0..1024usize, 0..1024usize, 0..1024usize, 0..1024usize, 0..1024usize)
                .prop_map(|(disabled, success, failure, error, warning)| Counter {
                    disabled,
                    success,
                    failure,
                    error,
                    warning,
                })
                .boxed()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_strategy::proptest;

    #[test]
    fn zero_is_default() {
        assert_eq!(Counter::ZERO, Counter::default());
        assert!(Counter::default().is_zero());
    }

    #[test]
    fn outcomes_drops_warnings() {
        let counter = Counter {
            success: 1,
            warning: 1,
            ..Counter::ZERO
        };
        assert_eq!(
            counter.outcomes(),
            Counter {
                success: 1,
                ..Counter::ZERO
            }
        );
        assert_eq!(counter.total(), 1, "warnings are not counted as outcomes");
    }

    #[test]
    fn deserialize_partial() {
        let counter: Counter =
            serde_json::from_str(r#"{"success": 3, "failure": 1}"#).expect("valid counter");
        assert_eq!(
            counter,
            Counter {
                success: 3,
                failure: 1,
                ..Counter::ZERO
            }
        );
    }

    #[proptest(cases = 64)]
    fn add_is_commutative(a: Counter, b: Counter) {
        assert_eq!(a.add(&b), b.add(&a));
    }

    #[proptest(cases = 64)]
    fn incremental_equals_summed(deltas: Vec<Counter>) {
        // Adding per-test deltas one by one must match adding the summed delta once.
        let mut incremental = Counter::ZERO;
        for delta in &deltas {
            incremental += *delta;
        }

        let summed: Counter = deltas.iter().sum();
        assert_eq!(incremental, Counter::ZERO.add(&summed));

        // The same holds in reverse order.
        let reversed: Counter = deltas.iter().rev().copied().sum();
        assert_eq!(incremental, reversed);
    }

    #[proptest(cases = 64)]
    fn add_is_associative(a: Counter, b: Counter, c: Counter) {
        assert_eq!(a.add(&b).add(&c), a.add(&b.add(&c)));
    }
}
