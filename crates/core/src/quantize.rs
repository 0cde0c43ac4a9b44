//! Per-vector 8-bit quantization for stored embeddings.
//!
//! Each vector is rescaled by its own min/max into `[-128, 127]`. The min/max are not kept,
//! so the transform cannot be inverted to the original scale: quantized vectors are only
//! meant for approximate cosine comparison. Two vectors pointing the same way but spanning
//! different ranges quantize differently.

/// Quantizes `vector` into signed bytes. Never produces NaN and keeps the input length.
pub fn quantize(vector: &[f32]) -> Vec<i8> {
    if vector.is_empty() {
        return Vec::new();
    }

    let (min, max) = vector
        .iter()
        .filter(|value| value.is_finite())
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(min, max), value| {
            (min.min(*value), max.max(*value))
        });

    if !min.is_finite() || !max.is_finite() {
        return vec![i8::MIN; vector.len()];
    }

    let range = if max == min { 1.0 } else { max - min };

    vector
        .iter()
        .map(|value| {
            let normalized = if value.is_finite() {
                (value - min) / range
            } else {
                0.0
            };
            (normalized * 255.0 - 128.0).round().clamp(-128.0, 127.0) as i8
        })
        .collect()
}

/// Widens a stored vector for similarity arithmetic. This is not dequantization: the original
/// scale is gone.
pub fn widen(vector: &[i8]) -> Vec<f32> {
    vector.iter().map(|value| f32::from(*value)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_vector_does_not_divide_by_zero() {
        let quantized = quantize(&vec![0.5; 1024]);
        assert_eq!(quantized.len(), 1024);
        assert!(quantized.iter().all(|value| *value == -128));
    }

    #[test]
    fn extremes_map_to_the_signed_byte_range() {
        let quantized = quantize(&[-1.0, 0.0, 1.0]);
        // 0.5 * 255 - 128 = -0.5, rounded away from zero.
        assert_eq!(quantized, vec![-128, -1, 127]);
    }

    #[test]
    fn scaling_is_per_vector() {
        let small = quantize(&[0.0, 0.1, 0.2]);
        let large = quantize(&[0.0, 1.0, 2.0]);
        assert_eq!(small, large);

        let shifted = quantize(&[0.0, 0.1, 0.4]);
        assert_ne!(small, shifted);
    }

    #[test]
    fn non_finite_components_do_not_poison_the_output() {
        let quantized = quantize(&[f32::NAN, 0.0, 1.0]);
        assert_eq!(quantized.len(), 3);
        assert_eq!(quantized[0], -128);
        assert_eq!(quantized[2], 127);
    }

    #[test]
    fn empty_vector_stays_empty() {
        assert!(quantize(&[]).is_empty());
    }
}
