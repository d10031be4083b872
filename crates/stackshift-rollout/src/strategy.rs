//! Step weight arithmetic.

/// Weight moved per step for a stack whose full weight is `full`.
pub fn step_shift(full: u32, step_weight_percent: u32) -> u32 {
    full * step_weight_percent / 100
}

/// Weights after one step: `(target, sister)`.
///
/// The target never exceeds the stack's full weight and the sister never
/// drops below zero.
pub fn step_weights(target: u32, sister: u32, full: u32, shift: u32) -> (u32, u32) {
    ((target + shift).min(full), sister.saturating_sub(shift))
}
