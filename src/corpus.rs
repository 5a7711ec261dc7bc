//! Dataset model and reader for the Extreme Classification Repository
//! sparse multi-label format.
//!
//! File layout: a header line `total_points num_features num_labels`, then
//! one line per example: `l1,l2,...,ln f1:v1 f2:v2 ...`. Labels and feature
//! indices are validated against the header bounds. A malformed line is a
//! recoverable error carrying its line number; the training driver logs it
//! and moves on, while a bad header is fatal.

use std::io::BufRead;

use thiserror::Error;

/// One sparse coordinate: feature or active-neuron index with its value.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Pair {
    pub index: u32,
    pub value: f32,
}

impl Pair {
    pub fn new(index: u32, value: f32) -> Self {
        Self { index, value }
    }
}

/// One training or test example.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Example {
    /// Sparse features, unique ascending indices in `[0, input_dim)`.
    pub features: Vec<Pair>,
    /// Class labels in `[0, last_layer_size)`.
    pub labels: Vec<u32>,
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("malformed or missing header")]
    MalformedHeader,
    #[error("line {line}: not enough fields")]
    NotEnoughFields { line: usize },
    #[error("line {line}: malformed labels")]
    MalformedLabels { line: usize },
    #[error("line {line}: missing features")]
    MissingFeatures { line: usize },
    #[error("line {line}: malformed features")]
    MalformedFeatures { line: usize },
    #[error("line {line}: label {label} out of bounds ({bound} labels)")]
    LabelOutOfBounds { line: usize, label: i64, bound: usize },
    #[error("line {line}: feature index {index} out of bounds ({bound} features)")]
    FeatureIndexOutOfBounds { line: usize, index: i64, bound: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Streaming scanner over one corpus file.
pub struct Scanner<R> {
    reader: R,
    line_number: usize,
    total_points: usize,
    num_features: usize,
    num_labels: usize,
    buf: String,
}

impl<R: BufRead> Scanner<R> {
    /// Read and validate the header line.
    pub fn new(mut reader: R) -> Result<Self, ScanError> {
        let mut header = String::new();
        if reader.read_line(&mut header)? == 0 {
            return Err(ScanError::MalformedHeader);
        }

        let fields: Vec<&str> = header.split_whitespace().collect();
        if fields.len() != 3 {
            return Err(ScanError::MalformedHeader);
        }
        let mut parsed = [0usize; 3];
        for (slot, field) in parsed.iter_mut().zip(&fields) {
            *slot = field
                .parse::<usize>()
                .ok()
                .filter(|&n| n > 0)
                .ok_or(ScanError::MalformedHeader)?;
        }

        Ok(Self {
            reader,
            line_number: 1,
            total_points: parsed[0],
            num_features: parsed[1],
            num_labels: parsed[2],
            buf: String::new(),
        })
    }

    pub fn total_points(&self) -> usize {
        self.total_points
    }

    pub fn num_features(&self) -> usize {
        self.num_features
    }

    pub fn num_labels(&self) -> usize {
        self.num_labels
    }

    /// Line number of the most recently read line.
    pub fn line_number(&self) -> usize {
        self.line_number
    }

    fn parse_labels(&self, field: &str) -> Result<Vec<u32>, ScanError> {
        // An empty label field is a valid example with no labels.
        if field.is_empty() {
            return Ok(Vec::new());
        }

        field
            .split(',')
            .map(|text| {
                let label: i64 = text.parse().map_err(|_| ScanError::MalformedLabels {
                    line: self.line_number,
                })?;
                if label < 0 || label as usize >= self.num_labels {
                    return Err(ScanError::LabelOutOfBounds {
                        line: self.line_number,
                        label,
                        bound: self.num_labels,
                    });
                }
                Ok(label as u32)
            })
            .collect()
    }

    fn parse_features(&self, fields: &[&str]) -> Result<Vec<Pair>, ScanError> {
        if fields.is_empty() {
            return Err(ScanError::MissingFeatures {
                line: self.line_number,
            });
        }

        fields
            .iter()
            .map(|pair| {
                let (index_text, value_text) =
                    pair.split_once(':').ok_or(ScanError::MalformedFeatures {
                        line: self.line_number,
                    })?;
                let index: i64 =
                    index_text
                        .parse()
                        .map_err(|_| ScanError::MalformedFeatures {
                            line: self.line_number,
                        })?;
                if index < 0 || index as usize >= self.num_features {
                    return Err(ScanError::FeatureIndexOutOfBounds {
                        line: self.line_number,
                        index,
                        bound: self.num_features,
                    });
                }
                let value: f32 =
                    value_text
                        .parse()
                        .map_err(|_| ScanError::MalformedFeatures {
                            line: self.line_number,
                        })?;
                Ok(Pair::new(index as u32, value))
            })
            .collect()
    }

    fn parse_example(&self, text: &str) -> Result<Example, ScanError> {
        let mut fields = text.split(' ');
        let label_field = fields.next().ok_or(ScanError::NotEnoughFields {
            line: self.line_number,
        })?;
        let feature_fields: Vec<&str> = fields.filter(|f| !f.is_empty()).collect();

        Ok(Example {
            labels: self.parse_labels(label_field)?,
            features: self.parse_features(&feature_fields)?,
        })
    }

    /// Pull up to `batch_size` examples. Malformed lines are logged with
    /// their line number and skipped; a short (or empty) batch means the
    /// file ran out.
    pub fn next_batch(&mut self, batch_size: usize) -> Vec<Example> {
        let mut batch = Vec::with_capacity(batch_size);
        while batch.len() < batch_size {
            match self.next() {
                None => break,
                Some(Ok(example)) => batch.push(example),
                Some(Err(err)) => tracing::warn!(%err, "skipping corpus line"),
            }
        }
        batch
    }
}

impl<R: BufRead> Iterator for Scanner<R> {
    type Item = Result<Example, ScanError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.buf.clear();
        match self.reader.read_line(&mut self.buf) {
            Ok(0) => None,
            Ok(_) => {
                self.line_number += 1;
                Some(self.parse_example(self.buf.trim_end_matches(['\r', '\n'])))
            }
            Err(err) => Some(Err(err.into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(text: &str) -> Scanner<&[u8]> {
        Scanner::new(text.as_bytes()).expect("valid header")
    }

    #[test]
    fn test_header() {
        let s = scan("120 784 10\n");
        assert_eq!(s.total_points(), 120);
        assert_eq!(s.num_features(), 784);
        assert_eq!(s.num_labels(), 10);
    }

    #[test]
    fn test_bad_headers() {
        for text in ["", "1 2\n", "a 784 10\n", "0 784 10\n", "1 2 3 4\n"] {
            assert!(matches!(
                Scanner::new(text.as_bytes()),
                Err(ScanError::MalformedHeader)
            ));
        }
    }

    #[test]
    fn test_parse_example() {
        let mut s = scan("2 100 5\n1,4 3:0.5 17:1.25 99:-2\n");
        let example = s.next().unwrap().unwrap();
        assert_eq!(example.labels, vec![1, 4]);
        assert_eq!(
            example.features,
            vec![
                Pair::new(3, 0.5),
                Pair::new(17, 1.25),
                Pair::new(99, -2.0),
            ]
        );
        assert!(s.next().is_none());
    }

    #[test]
    fn test_empty_labels_allowed() {
        let mut s = scan("1 10 5\n 0:1.0 2:2.0\n");
        let example = s.next().unwrap().unwrap();
        assert!(example.labels.is_empty());
        assert_eq!(example.features.len(), 2);
    }

    #[test]
    fn test_label_out_of_bounds() {
        let mut s = scan("1 10 5\n5 0:1.0\n");
        assert!(matches!(
            s.next().unwrap(),
            Err(ScanError::LabelOutOfBounds { line: 2, label: 5, bound: 5 })
        ));
    }

    #[test]
    fn test_feature_index_out_of_bounds() {
        let mut s = scan("1 10 5\n1 10:1.0\n");
        assert!(matches!(
            s.next().unwrap(),
            Err(ScanError::FeatureIndexOutOfBounds { line: 2, index: 10, bound: 10 })
        ));
    }

    #[test]
    fn test_malformed_features() {
        let mut s = scan("3 10 5\n1 3-0.5\n1 x:0.5\n1 3:y\n");
        for _ in 0..3 {
            assert!(matches!(
                s.next().unwrap(),
                Err(ScanError::MalformedFeatures { .. })
            ));
        }
    }

    #[test]
    fn test_missing_features() {
        let mut s = scan("1 10 5\n1\n");
        assert!(matches!(
            s.next().unwrap(),
            Err(ScanError::MissingFeatures { line: 2 })
        ));
    }

    #[test]
    fn test_recovers_after_bad_line() {
        let mut s = scan("2 10 5\n1 bad\n2 0:1.0\n");
        assert!(s.next().unwrap().is_err());
        let example = s.next().unwrap().unwrap();
        assert_eq!(example.labels, vec![2]);
        assert_eq!(s.line_number(), 3);
    }

    #[test]
    fn test_next_batch_skips_bad_lines() {
        let mut s = scan("4 10 5\n0 0:1\n1 bad\n2 1:2\n3 2:3\n");
        let batch = s.next_batch(2);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].labels, vec![0]);
        assert_eq!(batch[1].labels, vec![2]);

        // The remainder is a short batch, then the file is exhausted.
        assert_eq!(s.next_batch(2).len(), 1);
        assert!(s.next_batch(2).is_empty());
    }
}
