use super::{LogValue, Logger, Schema};
use crate::status::{EfiResult, Status, StatusCode};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Append writer producing one CSV row per tick.
///
/// The header is `ID` followed by the schema field names in order; the id
/// column auto-increments. Missing row fields serialise as empty cells.
#[derive(Debug)]
pub struct CsvLogger {
    path: PathBuf,
    schema: Schema,
    file: Option<BufWriter<File>>,
    last_id: u64,
}

impl CsvLogger {
    pub fn new<P: AsRef<Path>>(path: P, schema: Schema) -> EfiResult<Self> {
        let file = File::create(&path)
            .map_err(|e| Status::new(StatusCode::LoggerCannotOpen, format!("The file cannot be opened: {}", e)))?;
        let mut logger = CsvLogger {
            path: path.as_ref().to_path_buf(),
            schema,
            file: Some(BufWriter::new(file)),
            last_id: 0,
        };
        logger.write_header()?;
        Ok(logger)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_header(&mut self) -> EfiResult<()> {
        let mut header = String::from("ID");
        for (name, _) in &self.schema {
            header.push(',');
            header.push_str(name);
        }
        header.push('\n');
        self.write(&header)
    }

    fn write(&mut self, text: &str) -> EfiResult<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| Status::new(StatusCode::LoggerCannotInsert, "Cannot insert since the file is not opened"))?;
        file.write_all(text.as_bytes()).map_err(|e| {
            Status::new(StatusCode::LoggerCannotInsert, format!("Cannot write to the log: {}", e))
        })?;
        file.flush()
            .map_err(|e| Status::new(StatusCode::LoggerCannotInsert, format!("Cannot flush the log: {}", e)))
    }
}

impl Logger for CsvLogger {
    fn insert_row(&mut self, values: &HashMap<String, LogValue>) -> Status {
        if self.file.is_none() {
            return Status::new(StatusCode::LoggerCannotInsert, "Cannot insert since the file is not opened");
        }

        let mut row = self.last_id.to_string();
        self.last_id += 1;
        let mut missing = 0usize;
        for (name, _) in &self.schema {
            row.push(',');
            match values.get(name) {
                Some(value) => row.push_str(&value.stringify()),
                None => missing += 1,
            }
        }
        row.push('\n');

        if let Err(e) = self.write(&row) {
            return e;
        }
        if missing > 0 {
            return Status::new(StatusCode::Ok, "Not all the fields were present");
        }
        Status::ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::FieldType;
    use rstest::rstest;

    fn temp_csv(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("efimon-csv-test-{}-{}.csv", std::process::id(), tag))
    }

    fn schema() -> Schema {
        vec![
            ("Timestamp".to_string(), FieldType::Integer64),
            ("Usage".to_string(), FieldType::Float),
            ("Name".to_string(), FieldType::String),
        ]
    }

    #[rstest]
    fn header_is_id_plus_schema_order() {
        let path = temp_csv("header");
        let _logger = CsvLogger::new(&path, schema()).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "ID,Timestamp,Usage,Name\n");
        std::fs::remove_file(&path).unwrap();
    }

    #[rstest]
    fn rows_auto_increment_and_follow_schema_order() {
        let path = temp_csv("rows");
        let mut logger = CsvLogger::new(&path, schema()).unwrap();

        let mut values = HashMap::new();
        values.insert("Name".to_string(), LogValue::from("proc"));
        values.insert("Timestamp".to_string(), LogValue::from(1000u64));
        values.insert("Usage".to_string(), LogValue::from(12.5f32));
        assert!(logger.insert_row(&values).is_ok());
        assert!(logger.insert_row(&values).is_ok());

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines[1], "0,1000,12.5,proc");
        assert_eq!(lines[2], "1,1000,12.5,proc");
        std::fs::remove_file(&path).unwrap();
    }

    #[rstest]
    fn missing_fields_are_empty_cells_with_a_warning() {
        let path = temp_csv("missing");
        let mut logger = CsvLogger::new(&path, schema()).unwrap();

        let mut values = HashMap::new();
        values.insert("Timestamp".to_string(), LogValue::from(5u64));
        let status = logger.insert_row(&values);
        assert!(status.is_ok());
        assert!(!status.msg.is_empty());

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().nth(1).unwrap(), "0,5,,");
        std::fs::remove_file(&path).unwrap();
    }

    #[rstest]
    fn unopenable_path_is_reported() {
        let err = CsvLogger::new("/nonexistent-dir/file.csv", schema()).unwrap_err();
        assert_eq!(err.code, StatusCode::LoggerCannotOpen);
    }
}
