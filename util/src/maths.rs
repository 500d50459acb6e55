//! Utility maths functions

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use num_traits::Float;

/// Clamp a value into the range `[min, max]`.
pub fn clamp<T>(value: T, min: T, max: T) -> T
where
    T: Float,
{
    value.max(min).min(max)
}

/// The falling factorial `n * (n - 1) * ... * (n - k + 1)`, which is the coefficient produced by
/// differentiating `x^n` `k` times.
///
/// Returns zero when `k > n`.
pub fn falling_factorial<T>(n: usize, k: usize) -> T
where
    T: Float,
{
    if k > n {
        return T::zero();
    }

    (0..k).fold(T::one(), |acc, i| acc * T::from(n - i).unwrap_or_else(T::zero))
}

/// Binomial coefficient `n choose k`.
pub fn binomial<T>(n: usize, k: usize) -> T
where
    T: Float,
{
    if k > n {
        return T::zero();
    }

    let k = k.min(n - k);
    (0..k).fold(T::one(), |acc, i| {
        acc * T::from(n - i).unwrap_or_else(T::zero) / T::from(i + 1).unwrap_or_else(T::one)
    })
}

/// Evaluate the `deriv`th derivative of the polynomial with the given coefficients at `value`.
///
/// Coefficients are ordered lowest power first, i.e. `coeffs[i]` multiplies `value^i`.
pub fn poly_val<T>(coeffs: &[T], value: T, deriv: usize) -> T
where
    T: Float,
{
    // Horner's scheme over the differentiated coefficients
    coeffs
        .iter()
        .enumerate()
        .skip(deriv)
        .rev()
        .fold(T::zero(), |acc, (i, c)| {
            acc * value + *c * falling_factorial::<T>(i, deriv)
        })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_clamp() {
        assert_eq!(clamp(1.5f64, 0.0, 1.0), 1.0);
        assert_eq!(clamp(-0.5f64, 0.0, 1.0), 0.0);
        assert_eq!(clamp(0.25f64, 0.0, 1.0), 0.25);
    }

    #[test]
    fn test_combinatorics() {
        assert_eq!(falling_factorial::<f64>(5, 0), 1.0);
        assert_eq!(falling_factorial::<f64>(5, 2), 20.0);
        assert_eq!(falling_factorial::<f64>(3, 4), 0.0);

        assert_eq!(binomial::<f64>(6, 0), 1.0);
        assert_eq!(binomial::<f64>(6, 2), 15.0);
        assert_eq!(binomial::<f64>(6, 6), 1.0);
    }

    #[test]
    fn test_poly_val() {
        // f(x) = 1 + 2x + 3x^2
        let coeffs = [1.0f64, 2.0, 3.0];

        assert_eq!(poly_val(&coeffs, 2.0, 0), 17.0);
        assert_eq!(poly_val(&coeffs, 2.0, 1), 14.0);
        assert_eq!(poly_val(&coeffs, 2.0, 2), 6.0);
        assert_eq!(poly_val(&coeffs, 2.0, 3), 0.0);
    }
}
