// Command line utility for running the scan-prep pipeline on a 10x matrix directory

use anyhow::{Context, Error};
use clap::{value_parser, Arg, ArgMatches, Command};
use log::info;
use ndarray::prelude::*;
use scan_prep::mtx::{load_10x_dir, write_10x_dir, OutputFile, GENE_COLUMN_DEFAULT};
use scan_prep::qc::{CellMetrics, QcSummary};
use scan_prep::variable_features::{SelectionMethod, VariableFeatureRanking};
use scan_prep::{run_pipeline, PipelineOutput, PrepConfig};
use scan_types::MatrixMetadata;
use serde::Serialize;
use std::fs::{create_dir_all, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

#[derive(Serialize)]
struct RunSummary {
    input: MatrixMetadata,
    filtered: MatrixMetadata,
    qc: QcSummary,
    selection_method: SelectionMethod,
    n_selected: usize,
    config: PrepConfig,
}

pub fn main() -> Result<(), Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let matches = Command::new("scan-prep-cmd")
        .arg(
            Arg::new("INPUT")
                .help("10x matrix directory (matrix.mtx, barcodes.tsv, features.tsv)")
                .required(true)
                .index(1)
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("OUT_DIR")
                .help("Output directory")
                .short('o')
                .long("out_dir")
                .default_value(".")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("CONFIG")
                .help("JSON file with pipeline options")
                .short('c')
                .long("config")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("N_FEATURES")
                .help("Number of variable features to select")
                .long("n-features")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("SCALE_FACTOR")
                .help("Total count each barcode is scaled to before the log transform")
                .long("scale-factor")
                .value_parser(value_parser!(f64)),
        )
        .arg(
            Arg::new("MITO_PREFIX")
                .help("Prefix of mitochondrial gene identifiers")
                .long("mito-prefix"),
        )
        .arg(
            Arg::new("GENE_COLUMN")
                .help("Column of features.tsv used as gene identifier (1 = id, 2 = symbol)")
                .long("gene-column")
                .default_value("2")
                .value_parser(value_parser!(usize)),
        )
        .get_matches();

    let input: &PathBuf = matches.get_one("INPUT").unwrap();
    let out_dir: &PathBuf = matches.get_one("OUT_DIR").unwrap();
    let gene_column: usize = matches
        .get_one("GENE_COLUMN")
        .copied()
        .unwrap_or(GENE_COLUMN_DEFAULT);
    let config = build_config(&matches)?;

    let matrix = load_10x_dir(input, gene_column)?;
    let output = run_pipeline(&matrix, &config)?;

    create_dir_all(out_dir).with_context(|| out_dir.display().to_string())?;
    write_outputs(out_dir, &output)?;

    let summary = RunSummary {
        input: matrix.metadata(),
        filtered: output.qc.matrix.metadata(),
        qc: output.qc.metrics.summary(),
        selection_method: output.ranking.method(),
        n_selected: output.ranking.n_selected(),
        config,
    };
    let path = out_dir.join("summary.json");
    let file = File::create(&path).with_context(|| path.display().to_string())?;
    serde_json::to_writer_pretty(BufWriter::new(file), &summary)?;

    info!("wrote results to {}", out_dir.display());
    Ok(())
}

/// Options from the config file (or defaults), overridden by command line flags
fn build_config(matches: &ArgMatches) -> Result<PrepConfig, Error> {
    let mut config = match matches.get_one::<PathBuf>("CONFIG") {
        Some(path) => PrepConfig::from_json_file(path)?,
        None => PrepConfig::default(),
    };
    if let Some(&n) = matches.get_one::<usize>("N_FEATURES") {
        config.n_features = n;
    }
    if let Some(&s) = matches.get_one::<f64>("SCALE_FACTOR") {
        config.scale_factor = s;
    }
    if let Some(prefix) = matches.get_one::<String>("MITO_PREFIX") {
        config.mito_prefix = prefix.clone();
    }
    config.validate()?;
    Ok(config)
}

fn write_outputs(out_dir: &Path, output: &PipelineOutput) -> Result<(), Error> {
    array_to_csv(
        metrics_table(&output.qc.metrics),
        output.qc.matrix.barcodes(),
        &["barcode", "total_count", "feature_count", "mitochondrial_fraction"],
        out_dir.join("cell_metrics.csv.gz"),
    )?;
    ranking_to_csv(&output.ranking, out_dir.join("variable_features.csv.gz"))?;
    write_10x_dir(out_dir.join("normalized"), &output.normalized)?;
    Ok(())
}

fn metrics_table(metrics: &CellMetrics) -> Array2<f64> {
    let mut table = Array2::zeros((metrics.len(), 3));
    table.column_mut(0).assign(&metrics.total_count.mapv(|v| v as f64));
    table.column_mut(1).assign(&metrics.feature_count.mapv(f64::from));
    table.column_mut(2).assign(&metrics.mitochondrial_fraction);
    table
}

/// Flush the csv buffer into `file` and close it
fn finish(writer: csv::Writer<OutputFile>) -> Result<(), Error> {
    writer.into_inner().map_err(|e| e.into_error())?.finish()
}

/// Labeled rows of `array` under a header line
pub fn array_to_csv(
    array: Array2<f64>,
    labels: &[String],
    header: &[&str],
    path: impl AsRef<Path>,
) -> Result<(), Error> {
    let mut writer = csv::WriterBuilder::new().from_writer(OutputFile::create(path)?);
    writer.write_record(header)?;
    for (label, row) in labels.iter().zip(array.axis_iter(Axis(0))) {
        let mut record = vec![label.clone()];
        record.extend(row.iter().map(f64::to_string));
        writer.write_record(&record)?;
    }
    finish(writer)
}

/// Per feature statistics, most variable first
fn ranking_to_csv(ranking: &VariableFeatureRanking, path: impl AsRef<Path>) -> Result<(), Error> {
    let mut writer = csv::WriterBuilder::new().from_writer(OutputFile::create(path)?);
    writer.write_record([
        "rank",
        "feature",
        "mean",
        "variance",
        "variance_expected",
        "variance_standardized",
        "selected",
    ])?;
    for (rank, stats) in ranking.ranked().enumerate() {
        let expected = stats.variance_expected.map(|v| v.to_string()).unwrap_or_default();
        writer.write_record([
            (rank + 1).to_string(),
            stats.feature.clone(),
            stats.mean.to_string(),
            stats.variance.to_string(),
            expected,
            stats.variance_standardized.to_string(),
            (rank < ranking.n_selected()).to_string(),
        ])?;
    }
    finish(writer)
}

#[cfg(test)]
mod test_cmd {
    use super::*;
    use scan_prep::dispersion::GlobalPolynomial;
    use scan_prep::mtx::open_reader;
    use scan_prep::variable_features::{find_variable_features_vst, VstParams};
    use scan_types::CountMatrix;

    fn read_records(path: &Path) -> Vec<Vec<String>> {
        csv::ReaderBuilder::new()
            .has_headers(false)
            .from_reader(open_reader(path).unwrap())
            .records()
            .map(|r| r.unwrap().iter().map(String::from).collect())
            .collect()
    }

    #[test]
    fn test_labels_with_delimiters() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("cell_metrics.csv.gz");
        let labels = vec!["AAAC,1".to_string(), "say \"hi\"".to_string()];
        let array = array![[10.0, 2.0], [3.5, 1.0]];
        array_to_csv(array, &labels, &["barcode", "total_count", "feature_count"], &path).unwrap();

        let records = read_records(&path);
        assert_eq!(records.len(), 3);
        assert_eq!(records[0], ["barcode", "total_count", "feature_count"]);
        assert_eq!(records[1], ["AAAC,1", "10", "2"]);
        assert_eq!(records[2], ["say \"hi\"", "3.5", "1"]);
    }

    #[test]
    fn test_ranking_feature_names_quoted() {
        let dense = array![[0u32, 1, 5, 0, 9, 2], [1, 1, 2, 1, 1, 2], [0, 4, 0, 7, 0, 3]];
        let features = vec!["HLA-A,B".to_string(), "CD3E".to_string(), "IG\"K\"".to_string()];
        let barcodes = (0..6).map(|c| format!("C{c}")).collect();
        let m = CountMatrix::from_dense("quoted", features, barcodes, dense.view()).unwrap();
        let params = VstParams {
            n_features: 2,
            ..VstParams::default()
        };
        let ranking = find_variable_features_vst(&m, &params, &GlobalPolynomial { degree: 1 }).unwrap();

        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("variable_features.csv");
        ranking_to_csv(&ranking, &path).unwrap();

        let records = read_records(&path);
        assert_eq!(records.len(), 4);
        assert!(records.iter().all(|r| r.len() == 7));
        let mut names: Vec<&str> = records[1..].iter().map(|r| r[1].as_str()).collect();
        names.sort_unstable();
        assert_eq!(names, ["CD3E", "HLA-A,B", "IG\"K\""]);
        assert_eq!(records[1][1], ranking.selected()[0]);
    }
}
