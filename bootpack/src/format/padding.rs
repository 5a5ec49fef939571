// SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use num_traits::PrimInt;

/// Calculate the amount of padding that needs to be added to align the
/// specified offset to a page boundary.
pub fn calc<N: PrimInt>(offset: N, page_size: N) -> N {
    let r = offset % page_size;
    if r == N::zero() {
        N::zero()
    } else {
        page_size - r
    }
}

/// Round to the next multiple of the page size. Returns [`None`] if the result
/// would overflow.
pub fn round<N: PrimInt>(offset: N, page_size: N) -> Option<N> {
    let remain = calc(offset, page_size);
    offset.checked_add(&remain)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calc_and_round() {
        assert_eq!(calc(0u64, 4096), 0);
        assert_eq!(calc(1u64, 4096), 4095);
        assert_eq!(calc(4096u64, 4096), 0);
        assert_eq!(round(1660u32, 2048), Some(2048));
        assert_eq!(round(u32::MAX, 4096), None);
    }
}
