use ndarray::{s, Array1, Array2, Axis};

/// Relative pivot magnitude below which a system is treated as singular
const SINGULAR_TOL: f64 = 1e-12;

/// Solves the linear equation A*x = b by Gaussian elimination with partial pivoting.
/// Returns `None` if `a` is (numerically) singular. Intended for the small normal
/// equations of the local regression fits.
pub fn solve_linear_system(mut a: Array2<f64>, mut b: Array1<f64>) -> Option<Array1<f64>> {
    let n = a.nrows();
    assert_eq!(n, a.ncols(), "Tried to solve a non-square system.");
    assert_eq!(n, b.len(), "Right hand side does not match the system size.");

    let scale = a.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
    if scale == 0.0 || !scale.is_finite() {
        return None;
    }

    for col in 0..n {
        // find the row with the largest entry in this column
        let pivot_row = (col..n).max_by(|&i, &j| a[[i, col]].abs().total_cmp(&a[[j, col]].abs()))?;
        if a[[pivot_row, col]].abs() <= SINGULAR_TOL * scale {
            return None;
        }
        if pivot_row != col {
            swap_rows(&mut a, col, pivot_row);
            b.swap(col, pivot_row);
        }

        for row in col + 1..n {
            let factor = a[[row, col]] / a[[col, col]];
            if factor == 0.0 {
                continue;
            }
            for k in col..n {
                a[[row, k]] -= factor * a[[col, k]];
            }
            b[row] -= factor * b[col];
        }
    }

    // back substitution on the upper triangular system
    let mut x = Array1::zeros(n);
    for i in (0..n).rev() {
        let tail = a.slice(s![i, i + 1..n]).dot(&x.slice(s![i + 1..n]));
        x[i] = (b[i] - tail) / a[[i, i]];
    }
    Some(x)
}

fn swap_rows(a: &mut Array2<f64>, r1: usize, r2: usize) {
    let (mut upper, mut lower) = a.view_mut().split_at(Axis(0), r2);
    let mut row1 = upper.row_mut(r1);
    let mut row2 = lower.row_mut(0);
    ndarray::Zip::from(&mut row1).and(&mut row2).for_each(std::mem::swap);
}
