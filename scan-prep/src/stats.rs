//! Statistics functions

use ndarray::prelude::*;
use ndarray::DataMut;
use ndarray_stats::errors::QuantileError;
use noisy_float::prelude::{n64, N64};
use rayon::prelude::*;
use sprs::{CsMat, CsVecView};

/// Return the median. Sorts its argument in place.
pub fn median_mut<S>(xs: &mut ArrayBase<S, Ix1>) -> Result<N64, QuantileError>
where
    S: DataMut<Elem = N64>,
{
    if xs.is_empty() {
        return Err(QuantileError::EmptyInput);
    }
    let n = xs.len();
    match xs.as_slice_mut() {
        Some(vector) => vector.sort_unstable(),
        None => panic!("An attempt was made to calculate a median value for non-contiguous data"),
    }
    Ok(if n % 2 == 0 {
        (xs[n / 2] + xs[n / 2 - 1]) / n64(2.0)
    } else {
        xs[n / 2]
    })
}

/// Median of the finite entries of `xs`. NaN entries (e.g. the mitochondrial fraction of an
/// empty barcode) are skipped.
pub fn finite_median(xs: ArrayView1<f64>) -> Result<f64, QuantileError> {
    let mut finite: Array1<N64> = xs.iter().filter(|x| x.is_finite()).map(|&x| n64(x)).collect();
    median_mut(&mut finite).map(N64::raw)
}

/// Mean and sample variance (denominator `len - 1`) of a sparse vector of length `len`,
/// counting the implicit zeros. Variance is 0 when `len < 2`.
pub fn sparse_mean_var<N>(v: CsVecView<'_, N>, len: usize) -> (f64, f64)
where
    N: Copy + Into<f64>,
{
    if len == 0 {
        return (0.0, 0.0);
    }
    let n = len as f64;
    let mean = v.data().iter().map(|&x| x.into()).sum::<f64>() / n;
    if len < 2 {
        return (mean, 0.0);
    }
    let zeros = (len - v.nnz()) as f64;
    let ss = v
        .data()
        .iter()
        .map(|&x| (x.into() - mean).powi(2))
        .sum::<f64>()
        + zeros * mean * mean;
    (mean, ss / (n - 1.0))
}

/// Per-row mean and sample variance of `matrix`, zeros included. Rows are processed in
/// parallel; a CSC input is converted to CSR first.
pub fn row_mean_var<N>(matrix: &CsMat<N>) -> (Array1<f64>, Array1<f64>)
where
    N: Copy + Default + Into<f64> + Send + Sync,
{
    let converted;
    let csr = if matrix.is_csr() {
        matrix
    } else {
        converted = matrix.to_csr();
        &converted
    };
    let cols = csr.cols();
    let (means, vars): (Vec<f64>, Vec<f64>) = (0..csr.rows())
        .into_par_iter()
        .map(|r| match csr.outer_view(r) {
            Some(row) => sparse_mean_var(row, cols),
            None => (0.0, 0.0),
        })
        .unzip();
    (Array1::from(means), Array1::from(vars))
}
