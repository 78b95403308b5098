//! Mean-variance trend models used by variance-stabilizing feature selection.
//!
//! A [`DispersionModel`] takes the `log10(mean)` and `log10(variance)` of every
//! non-constant feature and returns the smoothed `log10(variance)` expected at each
//! feature's mean.

use crate::linalg::solve_linear_system;
use log::debug;
use ndarray::{Array1, Array2, ArrayView1};
use noisy_float::prelude::n64;
use rayon::prelude::*;
use scan_types::{PrepError, Result};

/// Fit a smooth trend `y ~ f(x)`, returning `f(x_i)` for every input point
pub trait DispersionModel: Send + Sync {
    /// Fitted values, in the same order as `x`
    fn fit(&self, x: ArrayView1<f64>, y: ArrayView1<f64>) -> Result<Array1<f64>>;
}

fn check_inputs(x: &ArrayView1<f64>, y: &ArrayView1<f64>, min_points: usize) -> Result<()> {
    if x.len() != y.len() {
        return Err(PrepError::InputValidation(format!(
            "trend fit got {} x values and {} y values",
            x.len(),
            y.len()
        )));
    }
    if x.len() < min_points {
        return Err(PrepError::NumericFitting(format!(
            "need at least {min_points} non-constant features to fit the mean-variance trend, got {}",
            x.len()
        )));
    }
    if x.iter().chain(y.iter()).any(|v| !v.is_finite()) {
        return Err(PrepError::NumericFitting("non-finite value in trend fit input".into()));
    }
    Ok(())
}

fn check_fitted(fitted: Array1<f64>) -> Result<Array1<f64>> {
    if fitted.iter().all(|v| v.is_finite()) {
        Ok(fitted)
    } else {
        Err(PrepError::NumericFitting("trend fit produced non-finite values".into()))
    }
}

/// Weighted least squares polynomial fit evaluated at `u = 0`. `u` is the centered (and
/// scaled) predictor. Returns `None` if the normal equations are singular.
fn weighted_poly_at_zero(u: &[f64], y: &[f64], w: &[f64], degree: usize) -> Option<f64> {
    let p = degree + 1;
    let mut xtwx = Array2::<f64>::zeros((p, p));
    let mut xtwy = Array1::<f64>::zeros(p);
    for ((&ui, &yi), &wi) in u.iter().zip(y).zip(w) {
        if wi == 0.0 {
            continue;
        }
        let mut powers = [1.0; 3];
        for k in 1..p {
            powers[k] = powers[k - 1] * ui;
        }
        for j in 0..p {
            xtwy[j] += wi * powers[j] * yi;
            for k in 0..p {
                xtwx[[j, k]] += wi * powers[j] * powers[k];
            }
        }
    }
    solve_linear_system(xtwx, xtwy).map(|beta| beta[0])
}

/// Local polynomial regression (loess) with tricube weights, evaluated exactly at every
/// input point. Each fit uses the `span * n` nearest neighbours of the point.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Loess {
    /// Fraction of the points used in each local fit
    pub span: f64,
    /// Degree of the local polynomial, 1 or 2
    pub degree: usize,
}

impl Default for Loess {
    fn default() -> Self {
        Loess { span: 0.3, degree: 2 }
    }
}

impl Loess {
    pub fn new(span: f64) -> Self {
        Loess { span, ..Loess::default() }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.span > 0.0 && self.span <= 1.0) {
            return Err(PrepError::Configuration(format!(
                "loess span must be in (0, 1], got {}",
                self.span
            )));
        }
        if !(1..=2).contains(&self.degree) {
            return Err(PrepError::Configuration(format!(
                "loess degree must be 1 or 2, got {}",
                self.degree
            )));
        }
        Ok(())
    }

    /// Number of neighbours in each local fit
    fn window(&self, n: usize) -> usize {
        let q = (n as f64 * self.span).floor() as usize;
        q.max(self.degree + 2).min(n)
    }

    /// Local fit at `xs[i]` over the sorted points `xs`, `ys`
    fn fit_point(&self, xs: &[f64], ys: &[f64], i: usize, q: usize) -> f64 {
        let n = xs.len();
        let x0 = xs[i];

        // leftmost window containing i, then slide right while the next point on the
        // right is closer than the leftmost one
        let mut lo = (i + 1).saturating_sub(q).min(n - q);
        while lo + q < n && xs[lo + q] - x0 < x0 - xs[lo] {
            lo += 1;
        }
        let hi = lo + q;
        let h = (x0 - xs[lo]).max(xs[hi - 1] - x0);

        let window_y = &ys[lo..hi];
        let (u, w): (Vec<f64>, Vec<f64>) = if h > 0.0 {
            xs[lo..hi]
                .iter()
                .map(|&x| {
                    let d = (x - x0).abs() / h;
                    let w = if d < 1.0 { (1.0 - d.powi(3)).powi(3) } else { 0.0 };
                    ((x - x0) / h, w)
                })
                .unzip()
        } else {
            (vec![0.0; q], vec![1.0; q])
        };

        for degree in (1..=self.degree).rev() {
            if let Some(v) = weighted_poly_at_zero(&u, window_y, &w, degree) {
                return v;
            }
            debug!("loess: singular local fit of degree {} at x = {}", degree, x0);
        }

        // all neighbours share the same x: fall back to the weighted mean
        let wsum: f64 = w.iter().sum();
        w.iter().zip(window_y).map(|(wi, yi)| wi * yi).sum::<f64>() / wsum
    }
}

impl DispersionModel for Loess {
    fn fit(&self, x: ArrayView1<f64>, y: ArrayView1<f64>) -> Result<Array1<f64>> {
        self.validate()?;
        check_inputs(&x, &y, self.degree + 2)?;

        let n = x.len();
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by_key(|&i| n64(x[i]));
        let xs: Vec<f64> = order.iter().map(|&i| x[i]).collect();
        let ys: Vec<f64> = order.iter().map(|&i| y[i]).collect();
        let q = self.window(n);

        let sorted_fit: Vec<f64> = (0..n).into_par_iter().map(|i| self.fit_point(&xs, &ys, i, q)).collect();

        let mut fitted = Array1::zeros(n);
        for (&orig, v) in order.iter().zip(sorted_fit) {
            fitted[orig] = v;
        }
        check_fitted(fitted)
    }
}

/// Ordinary least squares polynomial over all points
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GlobalPolynomial {
    /// Polynomial degree, 1 or 2
    pub degree: usize,
}

impl DispersionModel for GlobalPolynomial {
    fn fit(&self, x: ArrayView1<f64>, y: ArrayView1<f64>) -> Result<Array1<f64>> {
        if !(1..=2).contains(&self.degree) {
            return Err(PrepError::Configuration(format!(
                "polynomial degree must be 1 or 2, got {}",
                self.degree
            )));
        }
        check_inputs(&x, &y, self.degree + 1)?;

        // standardize x so the normal equations stay well conditioned
        let mean = x.mean().unwrap_or(0.0);
        let sd = x.std(0.0);
        if sd == 0.0 {
            return Err(PrepError::NumericFitting("all features have the same mean".into()));
        }
        let z: Vec<f64> = x.iter().map(|&v| (v - mean) / sd).collect();

        let p = self.degree + 1;
        let mut xtx = Array2::<f64>::zeros((p, p));
        let mut xty = Array1::<f64>::zeros(p);
        for (&zi, &yi) in z.iter().zip(y.iter()) {
            let powers = [1.0, zi, zi * zi];
            for j in 0..p {
                xty[j] += powers[j] * yi;
                for k in 0..p {
                    xtx[[j, k]] += powers[j] * powers[k];
                }
            }
        }
        let beta = solve_linear_system(xtx, xty)
            .ok_or_else(|| PrepError::NumericFitting("singular polynomial trend fit".into()))?;

        let fitted = z
            .iter()
            .map(|&zi| (0..p).map(|k| beta[k] * zi.powi(k as i32)).sum())
            .collect::<Array1<f64>>();
        check_fitted(fitted)
    }
}

#[cfg(test)]
mod test_dispersion {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use ndarray::Array1;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};
    use rand_pcg::Pcg64Mcg;

    #[test]
    fn test_loess_reproduces_quadratic() {
        // a local quadratic fit is exact on quadratic data, whatever the weights
        let x = Array1::linspace(-2.0, 3.0, 50);
        let y = x.mapv(|v| 0.5 * v * v - v + 2.0);
        let fitted = Loess::default().fit(x.view(), y.view()).unwrap();
        for (f, t) in fitted.iter().zip(y.iter()) {
            assert_approx_eq!(f, t, 1e-8);
        }
    }

    #[test]
    fn test_loess_unsorted_input_order() {
        let x = Array1::from(vec![3.0, -1.0, 0.5, 2.0, -2.0, 1.0, 0.0, -0.5]);
        let y = x.mapv(|v| 2.0 * v + 1.0);
        let fitted = Loess { span: 0.75, degree: 1 }.fit(x.view(), y.view()).unwrap();
        for (f, t) in fitted.iter().zip(y.iter()) {
            assert_approx_eq!(f, t, 1e-8);
        }
    }

    #[test]
    fn test_loess_smooths_noise() {
        let mut rng = Pcg64Mcg::seed_from_u64(42);
        let noise = Normal::new(0.0, 0.2).unwrap();
        let x = Array1::linspace(0.0, 4.0, 400);
        let truth = x.mapv(|v: f64| v.sin());
        let y = truth.mapv(|t| t + noise.sample(&mut rng));

        let fitted = Loess::default().fit(x.view(), y.view()).unwrap();
        let rmse_fit = ((&fitted - &truth).mapv(|d| d * d).mean().unwrap()).sqrt();
        let rmse_raw = ((&y - &truth).mapv(|d| d * d).mean().unwrap()).sqrt();
        assert!(rmse_fit < 0.5 * rmse_raw, "fit {rmse_fit} vs raw {rmse_raw}");
    }

    #[test]
    fn test_loess_tied_x() {
        let x = Array1::from(vec![1.0; 6]);
        let y = Array1::from(vec![1.0, 2.0, 3.0, 1.0, 2.0, 3.0]);
        let fitted = Loess::default().fit(x.view(), y.view()).unwrap();
        for f in fitted.iter() {
            assert_approx_eq!(f, 2.0);
        }
    }

    #[test]
    fn test_loess_degenerate_input() {
        let x = Array1::from(vec![1.0, 2.0, 3.0]);
        let y = Array1::from(vec![1.0, 2.0, 3.0]);
        let err = Loess::default().fit(x.view(), y.view()).unwrap_err();
        assert!(matches!(err, PrepError::NumericFitting(_)));

        let x = Array1::from(vec![1.0, 2.0, f64::NAN, 4.0, 5.0]);
        let y = Array1::from(vec![1.0; 5]);
        let err = Loess::default().fit(x.view(), y.view()).unwrap_err();
        assert!(matches!(err, PrepError::NumericFitting(_)));
    }

    #[test]
    fn test_loess_bad_span() {
        let x = Array1::linspace(0.0, 1.0, 10);
        let err = Loess::new(0.0).fit(x.view(), x.view()).unwrap_err();
        assert!(matches!(err, PrepError::Configuration(_)));
    }

    #[test]
    fn test_global_polynomial() {
        let x = Array1::linspace(0.0, 5.0, 20);
        let y = x.mapv(|v| 3.0 - 0.25 * v * v);
        let fitted = GlobalPolynomial { degree: 2 }.fit(x.view(), y.view()).unwrap();
        for (f, t) in fitted.iter().zip(y.iter()) {
            assert_approx_eq!(f, t, 1e-8);
        }

        let flat = Array1::from(vec![2.0; 5]);
        let err = GlobalPolynomial { degree: 1 }.fit(flat.view(), x.slice(ndarray::s![..5])).unwrap_err();
        assert!(matches!(err, PrepError::NumericFitting(_)));
    }
}
