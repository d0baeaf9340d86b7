//! CSV rendering of a bucket's rows.
//!
//! - Header row, comma delimiter, `\n` line endings, RFC 4180 quoting
//! - Column order: the timestamp field first, then all other field names seen in
//!   the batch in ascending order. Records lacking a column render an empty cell.

use std::collections::BTreeSet;
use std::io::Write;

use crate::record::Record;

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("cannot render an empty batch")]
    EmptyBatch,
    #[error("io error while rendering: {0}")]
    Io(#[from] std::io::Error),
}

/// Column order for a batch of records.
pub fn columns<'a, I>(records: I, timestamp_field: &str) -> Vec<String>
where
    I: IntoIterator<Item = &'a Record>,
{
    let mut rest: BTreeSet<&str> = BTreeSet::new();
    for record in records {
        for key in record.fields().keys() {
            if key != timestamp_field {
                rest.insert(key);
            }
        }
    }
    std::iter::once(timestamp_field.to_string())
        .chain(rest.into_iter().map(str::to_string))
        .collect()
}

/// Renders records (already in output order) as CSV bytes.
pub fn render<'a, I>(records: I, timestamp_field: &str) -> Result<Vec<u8>, RenderError>
where
    I: IntoIterator<Item = &'a Record> + Clone,
{
    let cols = columns(records.clone(), timestamp_field);
    let mut output = Vec::new();
    let mut rows = 0usize;

    let header: Vec<String> = cols.iter().map(|c| escape_field(c)).collect();
    writeln!(output, "{}", header.join(","))?;

    for record in records {
        let row: Vec<String> = cols
            .iter()
            .map(|c| {
                record
                    .get(c)
                    .map(|v| escape_field(&v.as_cell()))
                    .unwrap_or_default()
            })
            .collect();
        writeln!(output, "{}", row.join(","))?;
        rows += 1;
    }

    if rows == 0 {
        return Err(RenderError::EmptyBatch);
    }
    Ok(output)
}

fn escape_field(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') || field.contains('\r')
    {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{FieldValue, RawRecord, RecordSchema};

    fn rec(pairs: &[(&str, &str)]) -> Record {
        let raw: RawRecord = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), FieldValue::text(*v)))
            .collect();
        Record::from_raw(raw, &RecordSchema::default()).unwrap()
    }

    #[test]
    fn timestamp_column_first_then_sorted_union() {
        let a = rec(&[("datetime_utc", "2024-05-01T10:00:00Z"), ("temp", "12.5")]);
        let b = rec(&[("datetime_utc", "2024-05-01T10:01:00Z"), ("ph", "8.0")]);
        let csv = String::from_utf8(render([&a, &b], "datetime_utc").unwrap()).unwrap();
        assert_eq!(
            csv,
            "datetime_utc,ph,temp\n\
             2024-05-01T10:00:00Z,,12.5\n\
             2024-05-01T10:01:00Z,8.0,\n"
        );
    }

    #[test]
    fn quotes_fields_that_need_it() {
        let a = rec(&[
            ("datetime_utc", "2024-05-01T10:00:00Z"),
            ("note", "said \"hi\", left"),
        ]);
        let csv = String::from_utf8(render([&a], "datetime_utc").unwrap()).unwrap();
        assert!(csv.ends_with("2024-05-01T10:00:00Z,\"said \"\"hi\"\", left\"\n"));
    }

    #[test]
    fn empty_batch_is_an_error() {
        let none: [&Record; 0] = [];
        assert!(matches!(
            render(none, "datetime_utc"),
            Err(RenderError::EmptyBatch)
        ));
    }
}
