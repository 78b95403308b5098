use crate::error::{PrepError, Result};
use itertools::Itertools;
use ndarray::{Array2, ArrayView2};
use num_traits::Zero;
use serde::Serialize;
use sprs::{CsMat, CsVecView, TriMat};

/// Sparse feature x barcode matrix with its row and column labels. Storage is always
/// CSC, so every barcode (cell) is a contiguous sparse vector. Labels and matrix are
/// checked against each other on construction and cannot be changed afterwards;
/// every transformation returns a new matrix.
#[derive(Clone, Debug, PartialEq)]
pub struct GenericFeatureBarcodeMatrix<N> {
    name: String,
    barcodes: Vec<String>,
    feature_ids: Vec<String>,
    features: Vec<String>,
    matrix: CsMat<N>,
}

/// Raw UMI counts
pub type CountMatrix = GenericFeatureBarcodeMatrix<u32>;

/// Log-normalized (or otherwise rescaled) expression values
pub type NormalizedMatrix = GenericFeatureBarcodeMatrix<f64>;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MatrixMetadata {
    pub name: String,
    pub num_features: usize,
    pub num_barcodes: usize,
    pub nnz: usize,
}

fn check_unique(what: &str, labels: &[String]) -> Result<()> {
    match labels.iter().duplicates().next() {
        Some(dup) => Err(PrepError::InputValidation(format!("duplicate {what} label '{dup}'"))),
        None => Ok(()),
    }
}

impl<N> GenericFeatureBarcodeMatrix<N>
where
    N: Clone + Copy + Default + Zero + PartialEq,
{
    /// Build a matrix whose feature accessions equal the feature identifiers
    pub fn new(name: impl Into<String>, features: Vec<String>, barcodes: Vec<String>, matrix: CsMat<N>) -> Result<Self> {
        let feature_ids = features.clone();
        Self::with_feature_ids(name, features, feature_ids, barcodes, matrix)
    }

    /// Build a matrix with a separate accession column, e.g. Ensembl ids next to gene symbols
    pub fn with_feature_ids(
        name: impl Into<String>,
        features: Vec<String>,
        feature_ids: Vec<String>,
        barcodes: Vec<String>,
        matrix: CsMat<N>,
    ) -> Result<Self> {
        if matrix.rows() != features.len() || feature_ids.len() != features.len() {
            return Err(PrepError::InputValidation(format!(
                "matrix has {} rows but {} feature labels and {} feature ids",
                matrix.rows(),
                features.len(),
                feature_ids.len()
            )));
        }
        if matrix.cols() != barcodes.len() {
            return Err(PrepError::InputValidation(format!(
                "matrix has {} columns but {} barcode labels",
                matrix.cols(),
                barcodes.len()
            )));
        }
        check_unique("feature", &features)?;
        check_unique("barcode", &barcodes)?;

        let matrix = if matrix.is_csc() { matrix } else { matrix.to_csc() };
        Ok(GenericFeatureBarcodeMatrix {
            name: name.into(),
            barcodes,
            feature_ids,
            features,
            matrix,
        })
    }

    /// Build from a dense features x barcodes array, keeping only the non-zero entries
    pub fn from_dense(
        name: impl Into<String>,
        features: Vec<String>,
        barcodes: Vec<String>,
        dense: ArrayView2<N>,
    ) -> Result<Self> {
        let mut tri = TriMat::new(dense.dim());
        for ((r, c), &v) in dense.indexed_iter() {
            if v != N::zero() {
                tri.add_triplet(r, c, v);
            }
        }
        Self::new(name, features, barcodes, tri.to_csc())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn features(&self) -> &[String] {
        &self.features
    }

    pub fn feature_ids(&self) -> &[String] {
        &self.feature_ids
    }

    pub fn barcodes(&self) -> &[String] {
        &self.barcodes
    }

    pub fn matrix(&self) -> &CsMat<N> {
        &self.matrix
    }

    pub fn rows(&self) -> usize {
        self.matrix.rows()
    }

    pub fn cols(&self) -> usize {
        self.matrix.cols()
    }

    pub fn nnz(&self) -> usize {
        self.matrix.nnz()
    }

    /// Sparse view of one barcode
    pub fn column(&self, col: usize) -> CsVecView<'_, N> {
        self.matrix.outer_view(col).unwrap_or_else(|| panic!("column {col} out of bounds"))
    }

    /// Explicit densification
    pub fn to_dense(&self) -> Array2<N> {
        self.matrix.to_dense()
    }

    pub fn metadata(&self) -> MatrixMetadata {
        MatrixMetadata {
            name: self.name.clone(),
            num_features: self.rows(),
            num_barcodes: self.cols(),
            nnz: self.nnz(),
        }
    }

    /// New matrix holding the given barcodes, in the given order
    pub fn select_columns(&self, cols: &[usize]) -> Result<Self> {
        if let Some(&bad) = cols.iter().find(|&&c| c >= self.cols()) {
            return Err(PrepError::InputValidation(format!(
                "column index {bad} out of bounds for {} barcodes",
                self.cols()
            )));
        }

        let mut indptr = Vec::with_capacity(cols.len() + 1);
        let mut indices = Vec::new();
        let mut data = Vec::new();
        indptr.push(0);
        for &c in cols {
            let col = self.column(c);
            indices.extend_from_slice(col.indices());
            data.extend_from_slice(col.data());
            indptr.push(indices.len());
        }

        Ok(GenericFeatureBarcodeMatrix {
            name: self.name.clone(),
            barcodes: cols.iter().map(|&c| self.barcodes[c].clone()).collect(),
            feature_ids: self.feature_ids.clone(),
            features: self.features.clone(),
            matrix: CsMat::new_csc((self.rows(), cols.len()), indptr, indices, data),
        })
    }

    /// New matrix holding the given features. `rows` must be strictly increasing so the
    /// relative feature order (and the sorted CSC layout) is preserved.
    pub fn select_rows(&self, rows: &[usize]) -> Result<Self> {
        if !rows.iter().tuple_windows().all(|(a, b)| a < b) {
            return Err(PrepError::InputValidation("row selection must be strictly increasing".into()));
        }
        if let Some(&bad) = rows.last().filter(|&&r| r >= self.rows()) {
            return Err(PrepError::InputValidation(format!(
                "row index {bad} out of bounds for {} features",
                self.rows()
            )));
        }

        let mut remap = vec![None; self.rows()];
        for (new, &old) in rows.iter().enumerate() {
            remap[old] = Some(new);
        }

        let mut indptr = Vec::with_capacity(self.cols() + 1);
        let mut indices = Vec::new();
        let mut data = Vec::new();
        indptr.push(0);
        for col in self.matrix.outer_iterator() {
            for (r, &v) in col.iter() {
                if let Some(new) = remap[r] {
                    indices.push(new);
                    data.push(v);
                }
            }
            indptr.push(indices.len());
        }

        Ok(GenericFeatureBarcodeMatrix {
            name: self.name.clone(),
            barcodes: self.barcodes.clone(),
            feature_ids: rows.iter().map(|&r| self.feature_ids[r].clone()).collect(),
            features: rows.iter().map(|&r| self.features[r].clone()).collect(),
            matrix: CsMat::new_csc((rows.len(), self.cols()), indptr, indices, data),
        })
    }

    /// Same labels around a new matrix of the same shape
    pub fn with_values<T>(&self, matrix: CsMat<T>) -> Result<GenericFeatureBarcodeMatrix<T>>
    where
        T: Clone + Copy + Default + Zero + PartialEq,
    {
        if matrix.shape() != self.matrix.shape() {
            return Err(PrepError::InputValidation(format!(
                "replacement matrix has shape {:?}, expected {:?}",
                matrix.shape(),
                self.matrix.shape()
            )));
        }
        let matrix = if matrix.is_csc() { matrix } else { matrix.to_csc() };
        Ok(GenericFeatureBarcodeMatrix {
            name: self.name.clone(),
            barcodes: self.barcodes.clone(),
            feature_ids: self.feature_ids.clone(),
            features: self.features.clone(),
            matrix,
        })
    }
}

#[cfg(test)]
mod test_matrix {
    use super::*;
    use ndarray::array;

    fn labels(prefix: &str, n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{prefix}{i}")).collect()
    }

    fn small() -> CountMatrix {
        let dense = array![[10u32, 0, 5, 0], [0, 0, 0, 0], [1, 1, 1, 1]];
        CountMatrix::from_dense("small", labels("g", 3), labels("c", 4), dense.view()).unwrap()
    }

    #[test]
    fn test_label_cardinality() {
        let dense = array![[1u32, 2], [3, 4]];
        let err = CountMatrix::from_dense("bad", labels("g", 3), labels("c", 2), dense.view()).unwrap_err();
        assert!(matches!(err, PrepError::InputValidation(_)));

        let err = CountMatrix::from_dense("bad", labels("g", 2), labels("c", 1), dense.view()).unwrap_err();
        assert!(matches!(err, PrepError::InputValidation(_)));
    }

    #[test]
    fn test_duplicate_labels() {
        let dense = array![[1u32, 2], [3, 4]];
        let features = vec!["A".to_string(), "A".to_string()];
        let err = CountMatrix::from_dense("dup", features, labels("c", 2), dense.view()).unwrap_err();
        assert_eq!(err, PrepError::InputValidation("duplicate feature label 'A'".into()));
    }

    #[test]
    fn test_sparsity_preserved() {
        let m = small();
        assert!(m.matrix().is_csc());
        assert_eq!(m.nnz(), 6);
        assert_eq!(m.to_dense(), array![[10u32, 0, 5, 0], [0, 0, 0, 0], [1, 1, 1, 1]]);
    }

    #[test]
    fn test_select_columns() {
        let m = small();
        let sub = m.select_columns(&[0, 2]).unwrap();
        assert_eq!(sub.barcodes(), &["c0".to_string(), "c2".to_string()]);
        assert_eq!(sub.features(), m.features());
        assert_eq!(sub.to_dense(), array![[10u32, 5], [0, 0], [1, 1]]);
        assert!(m.select_columns(&[4]).is_err());
    }

    #[test]
    fn test_select_rows() {
        let m = small();
        let sub = m.select_rows(&[0, 2]).unwrap();
        assert_eq!(sub.features(), &["g0".to_string(), "g2".to_string()]);
        assert_eq!(sub.to_dense(), array![[10u32, 0, 5, 0], [1, 1, 1, 1]]);
        assert!(m.select_rows(&[2, 0]).is_err());
        assert!(m.select_rows(&[0, 3]).is_err());
    }

    #[test]
    fn test_with_values() {
        let m = small();
        let doubled = m.matrix().map(|&v| 2.0 * v as f64);
        let n = m.with_values(doubled).unwrap();
        assert_eq!(n.barcodes(), m.barcodes());
        assert_eq!(n.to_dense()[[0, 0]], 20.0);

        let wrong = CsMat::<f64>::zero((2, 4));
        assert!(m.with_values(wrong).is_err());
    }
}
