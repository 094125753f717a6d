/// Rounds `value` up to the next multiple of `alignment`.
///
/// `alignment` must be a power of two. An `alignment` of zero or one leaves
/// the value unchanged.
///
/// # Example
/// ```rust
/// use appendsafe::common::util::helpers::align_up;
/// assert_eq!(align_up(100, 4096), 4096);
/// assert_eq!(align_up(4096, 4096), 4096);
/// ```
pub fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return value;
    }
    debug_assert!(alignment.is_power_of_two());
    value.saturating_add(alignment - 1) & !(alignment - 1)
}

/// Rounds `value` down to a multiple of `alignment` (a power of two).
pub fn align_down(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return value;
    }
    debug_assert!(alignment.is_power_of_two());
    value & !(alignment - 1)
}
