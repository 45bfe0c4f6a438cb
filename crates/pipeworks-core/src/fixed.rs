use fixed::types::I32F32;

/// Q32.32 fixed-point: 32 integer bits, 32 fractional bits.
///
/// Used for simulation time, timers and packet offsets so that two runs fed
/// the same frame deltas land on bit-identical state.
pub type Fixed64 = I32F32;

/// Milliseconds of simulated time.
pub type Millis = Fixed64;

/// Ticks are frames: one `Engine::update` call is one tick.
pub type Ticks = u64;

/// Convert an f64 to Fixed64. Use only for initialization and host input.
#[inline]
pub fn f64_to_fixed64(v: f64) -> Fixed64 {
    Fixed64::from_num(v)
}

/// Convert Fixed64 to f64. Use only for display and reporting.
#[inline]
pub fn fixed64_to_f64(v: Fixed64) -> f64 {
    v.to_num::<f64>()
}

/// Convert Fixed64 to f32 for the cosmetic float-based physics.
#[inline]
pub fn fixed64_to_f32(v: Fixed64) -> f32 {
    v.to_num::<f32>()
}

/// Shorthand for a millisecond duration.
#[inline]
pub fn ms(v: f64) -> Millis {
    Fixed64::from_num(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed64_basic_arithmetic() {
        let a = f64_to_fixed64(1.5);
        let b = f64_to_fixed64(2.0);
        assert_eq!(fixed64_to_f64(a + b), 3.5);
    }

    #[test]
    fn fixed64_negative_values() {
        let a = ms(16.0);
        let b = ms(500.0);
        let left = a - b;
        assert!(left < Fixed64::ZERO);
        assert_eq!(fixed64_to_f64(left), -484.0);
    }

    #[test]
    fn fixed64_determinism() {
        let a = f64_to_fixed64(1.0 / 3.0);
        let b = f64_to_fixed64(1.0 / 3.0);
        assert_eq!(a * f64_to_fixed64(3.0), b * f64_to_fixed64(3.0));
    }

    #[test]
    fn f32_conversion() {
        assert_eq!(fixed64_to_f32(ms(12.5)), 12.5f32);
    }
}
