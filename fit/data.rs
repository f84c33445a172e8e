//! Loading a fit data set from a delimited text file.
//!
//! The file has a header row. One column is the response, an optional column
//! holds prior weights, and every other column is a numeric predictor. Files
//! ending in `.tsv` are read tab-delimited, anything else comma-delimited.

use csv::ReaderBuilder;
use ndarray::{Array1, Array2};
use std::path::Path;
use thiserror::Error;

/// A complete data set, ready to be handed to a fit.
#[derive(Debug)]
pub struct FitData {
    pub x: Array2<f64>,
    pub y: Array1<f64>,
    pub prior_weights: Array1<f64>,
    pub predictor_names: Vec<String>,
}

#[derive(Error, Debug)]
pub enum DataError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse the input file: {0}")]
    CsvError(#[from] csv::Error),

    #[error(
        "The required column '{0}' was not found in the input file. Please check spelling and case."
    )]
    ColumnNotFound(String),

    #[error("Row {row}, column '{column}': '{value}' is not a finite number.")]
    NonNumeric {
        row: usize,
        column: String,
        value: String,
    },

    #[error("The input file contains no data rows.")]
    Empty,
}

/// Reads `path`, splitting off the `response` column and (optionally) the
/// `weights_column`. Missing weights default to one.
pub fn load_fit_data(
    path: &Path,
    response: &str,
    weights_column: Option<&str>,
) -> Result<FitData, DataError> {
    let delimiter = match path.extension().and_then(|e| e.to_str()) {
        Some("tsv") => b'\t',
        _ => b',',
    };
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .delimiter(delimiter)
        .trim(csv::Trim::All)
        .from_path(path)?;

    let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
    let position = |name: &str| {
        headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| DataError::ColumnNotFound(name.to_string()))
    };
    let response_idx = position(response)?;
    let weights_idx = weights_column.map(position).transpose()?;

    let predictor_idx: Vec<usize> = (0..headers.len())
        .filter(|&j| j != response_idx && Some(j) != weights_idx)
        .collect();
    let predictor_names = predictor_idx.iter().map(|&j| headers[j].clone()).collect();

    let mut y = Vec::new();
    let mut weights = Vec::new();
    let mut values = Vec::new();
    for (i, record) in reader.records().enumerate() {
        let record = record?;
        // Row numbers in messages count the header as row 1
        let row = i + 2;
        let cell = |j: usize| -> Result<f64, DataError> {
            let raw = record.get(j).unwrap_or("");
            match raw.parse::<f64>() {
                Ok(v) if v.is_finite() => Ok(v),
                _ => Err(DataError::NonNumeric {
                    row,
                    column: headers[j].clone(),
                    value: raw.to_string(),
                }),
            }
        };

        y.push(cell(response_idx)?);
        weights.push(match weights_idx {
            Some(j) => cell(j)?,
            None => 1.0,
        });
        for &j in &predictor_idx {
            values.push(cell(j)?);
        }
    }

    if y.is_empty() {
        return Err(DataError::Empty);
    }
    let n = y.len();
    let x = Array2::from_shape_vec((n, predictor_idx.len()), values)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    log::info!(
        "Loaded {} rows with {} predictors from {}",
        n,
        predictor_idx.len(),
        path.display()
    );

    Ok(FitData {
        x,
        y: Array1::from(y),
        prior_weights: Array1::from(weights),
        predictor_names,
    })
}
