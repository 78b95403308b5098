//! MatrixMarket and 10x feature-barcode directory I/O

use anyhow::{bail, format_err, Context, Error};
use flate2::bufread::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{info, warn};
use scan_types::{CountMatrix, GenericFeatureBarcodeMatrix};
use sprs::{CsMat, TriMat};
use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::fs::{create_dir_all, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Column of `features.tsv` holding gene symbols
pub const GENE_COLUMN_DEFAULT: usize = 2;

fn is_gz(path: &Path) -> bool {
    path.extension().map_or(false, |ext| ext == "gz")
}

/// Buffered reader over a plain or gzipped (`.gz`) file
pub fn open_reader(path: impl AsRef<Path>) -> Result<Box<dyn BufRead>, Error> {
    let path = path.as_ref();
    let file = BufReader::new(File::open(path).with_context(|| path.display().to_string())?);
    if is_gz(path) {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(file))))
    } else {
        Ok(Box::new(file))
    }
}

/// Buffered writer to a plain or gzipped (`.gz`) file. Call `finish` when done.
pub struct OutputFile {
    inner: BufWriter<Box<dyn FinishWrite>>,
}

trait FinishWrite: Write {
    fn finish_write(self: Box<Self>) -> std::io::Result<()>;
}

impl FinishWrite for File {
    fn finish_write(mut self: Box<Self>) -> std::io::Result<()> {
        self.flush()
    }
}

impl FinishWrite for GzEncoder<File> {
    fn finish_write(self: Box<Self>) -> std::io::Result<()> {
        (*self).finish().map(|_| ())
    }
}

impl OutputFile {
    pub fn create(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let file = File::create(path).with_context(|| path.display().to_string())?;
        let inner: Box<dyn FinishWrite> = if is_gz(path) {
            Box::new(GzEncoder::new(file, Compression::default()))
        } else {
            Box::new(file)
        };
        Ok(OutputFile {
            inner: BufWriter::new(inner),
        })
    }

    /// Flush buffers and write the gzip trailer
    pub fn finish(self) -> Result<(), Error> {
        let inner = self.inner.into_inner().map_err(|e| e.into_error())?;
        inner.finish_write()?;
        Ok(())
    }
}

impl Write for OutputFile {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

fn parse_field<T: std::str::FromStr>(field: Option<&str>, what: &str, line_no: usize) -> Result<T, Error>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let field = field.ok_or_else(|| format_err!("line {}: missing {}", line_no, what))?;
    field
        .parse::<T>()
        .with_context(|| format!("line {line_no}: invalid {what} '{field}'"))
}

/// Load a CSC count matrix from a (possibly gzipped) MatrixMarket coordinate file
pub fn load_mtx(path: impl AsRef<Path>) -> Result<CsMat<u32>, Error> {
    let path = path.as_ref();
    let mut reader = open_reader(path)?;
    let mut line = String::new();
    let mut mat: Option<(TriMat<u32>, usize)> = None;
    let mut line_no = 0;

    loop {
        line.clear();
        let sz = reader
            .read_line(&mut line)
            .with_context(|| path.display().to_string())?;
        if sz == 0 {
            break;
        }
        line_no += 1;
        if line.starts_with('%') || line.trim().is_empty() {
            continue;
        }
        let mut data = line.split_whitespace();
        match mat.as_mut() {
            None => {
                let nrow = parse_field::<usize>(data.next(), "NROW", line_no)?;
                let ncol = parse_field::<usize>(data.next(), "NCOL", line_no)?;
                let nnz = parse_field::<usize>(data.next(), "NNZ", line_no)?;
                mat = Some((TriMat::with_capacity((nrow, ncol), nnz), nnz));
            }
            Some((tri, _)) => {
                let row = parse_field::<usize>(data.next(), "ROW", line_no)?;
                let col = parse_field::<usize>(data.next(), "COL", line_no)?;
                let val = parse_field::<u32>(data.next(), "VAL", line_no)?;
                if row == 0 || row > tri.rows() || col == 0 || col > tri.cols() {
                    bail!(
                        "line {}: entry ({}, {}) outside a {} x {} matrix",
                        line_no,
                        row,
                        col,
                        tri.rows(),
                        tri.cols()
                    );
                }
                tri.add_triplet(row - 1, col - 1, val);
            }
        }
    }

    let Some((tri, nnz)) = mat else { bail!("{}: no matrix size line found", path.display()) };
    if tri.nnz() != nnz {
        bail!(
            "{}: header declares {} entries but {} were read",
            path.display(),
            nnz,
            tri.nnz()
        );
    }
    Ok(tri.to_csc())
}

/// Values that can be written to a MatrixMarket file
pub trait MtxValue: Copy + Display {
    /// MatrixMarket field type
    const FIELD: &'static str;
}

impl MtxValue for u32 {
    const FIELD: &'static str = "integer";
}

impl MtxValue for f64 {
    const FIELD: &'static str = "real";
}

/// Write a sparse matrix in MatrixMarket coordinate format, gzipped if `path` ends in `.gz`
pub fn write_mtx<N: MtxValue>(path: impl AsRef<Path>, matrix: &CsMat<N>) -> Result<(), Error> {
    let mut out = OutputFile::create(path)?;
    writeln!(out, "%%MatrixMarket matrix coordinate {} general", N::FIELD)?;
    writeln!(out, "{} {} {}", matrix.rows(), matrix.cols(), matrix.nnz())?;
    for (&v, (r, c)) in matrix.iter() {
        writeln!(out, "{} {} {}", r + 1, c + 1, v)?;
    }
    out.finish()
}

/// Lines of a (possibly gzipped) text file, without line terminators
pub fn read_lines(path: impl AsRef<Path>) -> Result<Vec<String>, Error> {
    let path = path.as_ref();
    open_reader(path)?
        .lines()
        .map(|l| l.with_context(|| path.display().to_string()))
        .filter(|l| !matches!(l, Ok(s) if s.is_empty()))
        .collect()
}

/// First of `names` (plain or with a `.gz` suffix) present in `dir`
fn find_file(dir: &Path, names: &[&str]) -> Result<PathBuf, Error> {
    for name in names {
        for candidate in [dir.join(format!("{name}.gz")), dir.join(name)] {
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }
    bail!("none of {:?} found in {}", names, dir.display())
}

/// Make identifiers unique by appending `.1`, `.2`, ... to repeated occurrences. The first
/// occurrence keeps its name and generated names never collide with existing ones.
pub fn make_unique(names: Vec<String>) -> Vec<String> {
    let mut used: HashSet<String> = names.iter().cloned().collect();
    let mut seen: HashSet<String> = HashSet::new();
    let mut next_suffix: HashMap<String, usize> = HashMap::new();
    let mut renamed = 0;

    let unique = names
        .into_iter()
        .map(|name| {
            if seen.insert(name.clone()) {
                return name;
            }
            let k = next_suffix.entry(name.clone()).or_insert(1);
            let mut candidate = format!("{name}.{k}");
            while used.contains(&candidate) {
                *k += 1;
                candidate = format!("{name}.{k}");
            }
            *k += 1;
            used.insert(candidate.clone());
            renamed += 1;
            candidate
        })
        .collect();

    if renamed > 0 {
        warn!("renamed {} duplicated feature identifiers", renamed);
    }
    unique
}

/// Load a 10x feature-barcode matrix directory (`matrix.mtx`, `barcodes.tsv` and
/// `features.tsv` or the older `genes.tsv`, each optionally gzipped). `gene_column` is the
/// 1-based column of the feature file used as identifier.
pub fn load_10x_dir(dir: impl AsRef<Path>, gene_column: usize) -> Result<CountMatrix, Error> {
    let dir = dir.as_ref();
    if gene_column == 0 {
        bail!("gene column is 1-based, got 0");
    }

    let matrix = load_mtx(find_file(dir, &["matrix.mtx"])?)?;
    let barcodes: Vec<String> = read_lines(find_file(dir, &["barcodes.tsv"])?)?
        .into_iter()
        .map(|l| l.split('\t').next().unwrap_or_default().to_string())
        .collect();

    let features_path = find_file(dir, &["features.tsv", "genes.tsv"])?;
    let mut feature_ids = Vec::new();
    let mut features = Vec::new();
    for (i, line) in read_lines(&features_path)?.iter().enumerate() {
        let fields: Vec<&str> = line.split('\t').collect();
        let id = fields[0];
        let symbol = fields.get(gene_column - 1).ok_or_else(|| {
            format_err!(
                "{}: line {} has {} columns, gene column {} requested",
                features_path.display(),
                i + 1,
                fields.len(),
                gene_column
            )
        })?;
        feature_ids.push(id.to_string());
        features.push(symbol.to_string());
    }

    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let matrix = CountMatrix::with_feature_ids(name, make_unique(features), feature_ids, barcodes, matrix)
        .with_context(|| dir.display().to_string())?;
    info!(
        "loaded {} features x {} barcodes ({} non-zero) from {}",
        matrix.rows(),
        matrix.cols(),
        matrix.nnz(),
        dir.display()
    );
    Ok(matrix)
}

/// Write a matrix as a gzipped 10x directory: `matrix.mtx.gz`, `barcodes.tsv.gz` and
/// `features.tsv.gz`
pub fn write_10x_dir<N>(dir: impl AsRef<Path>, matrix: &GenericFeatureBarcodeMatrix<N>) -> Result<(), Error>
where
    N: MtxValue + Default + num_traits::Zero + PartialEq,
{
    let dir = dir.as_ref();
    create_dir_all(dir).with_context(|| dir.display().to_string())?;

    write_mtx(dir.join("matrix.mtx.gz"), matrix.matrix())?;

    let mut out = OutputFile::create(dir.join("barcodes.tsv.gz"))?;
    for bc in matrix.barcodes() {
        writeln!(out, "{bc}")?;
    }
    out.finish()?;

    let mut out = OutputFile::create(dir.join("features.tsv.gz"))?;
    for (id, name) in matrix.feature_ids().iter().zip(matrix.features()) {
        writeln!(out, "{id}\t{name}\tGene Expression")?;
    }
    out.finish()
}
