// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt::Debug;

use crate::ReduceOp;

/// A plain numeric value that collectives can transfer and combine.
///
/// Implemented for the fixed-size integer and floating point types that message-passing
/// libraries support as predefined datatypes.
pub trait Element: Copy + Default + Debug + PartialEq + Send + Sync + 'static {
    /// Combines two values according to `op`.
    ///
    /// Integer sums and products wrap on overflow.
    #[must_use]
    fn combine(op: ReduceOp, left: Self, right: Self) -> Self;
}

macro_rules! integer_element {
    ($($t:ty),*) => {
        $(
            impl Element for $t {
                fn combine(op: ReduceOp, left: Self, right: Self) -> Self {
                    match op {
                        ReduceOp::Sum => left.wrapping_add(right),
                        ReduceOp::Product => left.wrapping_mul(right),
                        ReduceOp::Min => left.min(right),
                        ReduceOp::Max => left.max(right),
                    }
                }
            }
        )*
    };
}

macro_rules! float_element {
    ($($t:ty),*) => {
        $(
            impl Element for $t {
                fn combine(op: ReduceOp, left: Self, right: Self) -> Self {
                    match op {
                        ReduceOp::Sum => left + right,
                        ReduceOp::Product => left * right,
                        ReduceOp::Min => left.min(right),
                        ReduceOp::Max => left.max(right),
                    }
                }
            }
        )*
    };
}

integer_element!(i32, i64, u32, u64);
float_element!(f32, f64);

/// Folds `contributions` element-wise with `op`.
///
/// All contributions must have the same length; the caller validates this.
pub(crate) fn reduce_all<T: Element>(op: ReduceOp, contributions: &[Vec<T>]) -> Vec<T> {
    let mut iter = contributions.iter();

    let Some(first) = iter.next() else {
        return Vec::new();
    };

    iter.fold(first.clone(), |mut acc, next| {
        for (left, right) in acc.iter_mut().zip(next) {
            *left = T::combine(op, *left, *right);
        }
        acc
    })
}
