// SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{fmt, ops::RangeBounds};

use num_traits::PrimInt;
use thiserror::Error;

pub const ZEROS: [u8; 16384] = [0u8; 16384];

#[derive(Debug, Error)]
#[error("{value} not in bounds: {bounds}")]
pub struct OutOfBoundsError {
    pub value: String,
    pub bounds: String,
}

/// A small wrapper to format a number as a size in bytes.
#[derive(Clone, Copy)]
pub struct NumBytes<T: PrimInt>(pub T);

impl<T: PrimInt + fmt::Debug> fmt::Debug for NumBytes<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == T::one() {
            write!(f, "<{:?} byte>", self.0)
        } else {
            write!(f, "<{:?} bytes>", self.0)
        }
    }
}

/// Return `value` if it is within `bounds`.
pub fn check_bounds<T, R>(value: T, bounds: R) -> Result<T, OutOfBoundsError>
where
    T: PartialOrd + fmt::Display,
    R: RangeBounds<T> + fmt::Debug,
{
    if bounds.contains(&value) {
        Ok(value)
    } else {
        Err(OutOfBoundsError {
            value: value.to_string(),
            bounds: format!("{bounds:?}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds() {
        assert_eq!(check_bounds(5u32, 1..=5).unwrap(), 5);
        assert_eq!(check_bounds(0u32, ..=5).unwrap(), 0);

        let e = check_bounds(6u32, 1..=5).unwrap_err();
        assert_eq!(e.value, "6");
        assert_eq!(e.bounds, "1..=5");
    }
}
