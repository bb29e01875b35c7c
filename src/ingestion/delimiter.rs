//! Delimiter detection for uploaded CSV files.

use crate::error::ValidationErrors;

/// Delimiters tried, in order of preference.
pub const CANDIDATE_DELIMITERS: &[u8] = b",\t;|";

/// Message reported when no candidate produces a consistent column count.
pub const UNDETERMINED_DELIMITER: &str = "Could not determine delimiter";

/// Pick the delimiter for a file from a sample of its leading bytes.
///
/// The sample is cut back to the last complete line (unless it holds a single line). A candidate
/// wins when every non-empty sampled line splits into the same number of fields, and that number
/// is greater than one. Quoting is honored, so quoted delimiters do not count.
///
/// On failure the error is exactly `{"file": ["Could not determine delimiter"]}`.
pub fn detect_delimiter(sample: &[u8]) -> Result<u8, ValidationErrors> {
    let sample = whole_lines(sample);
    CANDIDATE_DELIMITERS
        .iter()
        .copied()
        .find(|&d| consistent_field_count(sample, d))
        .ok_or_else(|| ValidationErrors::single("file", UNDETERMINED_DELIMITER))
}

fn whole_lines(sample: &[u8]) -> &[u8] {
    match sample.iter().rposition(|&b| b == b'\n') {
        Some(pos) if pos + 1 < sample.len() => &sample[..=pos],
        _ => sample,
    }
}

fn consistent_field_count(sample: &[u8], delimiter: u8) -> bool {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(delimiter)
        .from_reader(sample);

    let mut expected: Option<usize> = None;
    let mut record = csv::ByteRecord::new();
    loop {
        match rdr.read_byte_record(&mut record) {
            Ok(true) => {}
            Ok(false) => break,
            Err(_) => return false,
        }
        let n = record.len();
        match expected {
            None if n > 1 => expected = Some(n),
            None => return false,
            Some(e) if e != n => return false,
            Some(_) => {}
        }
    }
    expected.is_some()
}
