pub mod ring;
pub mod validity;

/// Round a coordinate to 7 decimal places, the precision of all emitted
/// geometries.
pub fn round7(value: f64) -> f64 {
    (value * 1e7).round() / 1e7
}

#[cfg(test)]
mod tests {
    use super::round7;

    #[test]
    fn rounds_to_seven_decimals() {
        assert_eq!(round7(7.421_963_849_9), 7.421_963_8);
        assert_eq!(round7(-43.731_142_45), -43.731_142_5);
        assert_eq!(round7(round7(2.123_456_789)), round7(2.123_456_789));
    }
}
