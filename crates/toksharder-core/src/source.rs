//! Record sources: ordered streams of raw text records.
//!
//! Supported inputs: JSON Lines (text taken from one field), plain text
//! (one record per line) and Parquet (one string column). Line formats may
//! be gzip-compressed and may be local paths or HTTP(S) URLs.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use arrow::array::{Array, ArrayRef, LargeStringArray, StringArray};
use flate2::read::MultiGzDecoder;
use parquet::arrow::ProjectionMask;
use parquet::arrow::arrow_reader::{ParquetRecordBatchReader, ParquetRecordBatchReaderBuilder};

use crate::error::SourceError;
use crate::retry::retry_with_backoff;
use crate::stream::{http_config, open_http_reader};

/// Rows per Arrow batch when reading Parquet
const PARQUET_BATCH_SIZE: usize = 1024;

/// Read buffer for local line files
const LINE_BUF_CAPACITY: usize = 256 * 1024;

/// Ordered, possibly unbounded stream of records.
///
/// `Ok(None)` is end-of-stream. A recoverable error means only the current
/// record is lost; the caller may keep pulling.
pub trait RecordSource {
    fn next_record(&mut self) -> Result<Option<String>, SourceError>;
}

impl<S: RecordSource + ?Sized> RecordSource for Box<S> {
    fn next_record(&mut self) -> Result<Option<String>, SourceError> {
        (**self).next_record()
    }
}

/// In-memory source over any iterator of strings
pub struct IterSource<I>(I);

impl<I: Iterator<Item = String>> IterSource<I> {
    pub fn new(iter: impl IntoIterator<IntoIter = I>) -> Self {
        Self(iter.into_iter())
    }
}

impl<I: Iterator<Item = String>> RecordSource for IterSource<I> {
    fn next_record(&mut self) -> Result<Option<String>, SourceError> {
        Ok(self.0.next())
    }
}

/// How each line of a line-oriented input becomes a record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineFormat {
    /// JSON object per line; record text is the named string field
    Json { field: String },
    /// Whole line is the record
    Text,
}

/// Line-oriented source over any buffered reader
pub struct LineSource<R> {
    reader: R,
    format: LineFormat,
    label: String,
    line_no: u64,
    buf: Vec<u8>,
}

impl<R: BufRead> LineSource<R> {
    /// `label` names the input in error messages
    pub fn new(reader: R, format: LineFormat, label: impl Into<String>) -> Self {
        Self {
            reader,
            format,
            label: label.into(),
            line_no: 0,
            buf: Vec::new(),
        }
    }

    fn malformed(&self, message: impl std::fmt::Display) -> SourceError {
        SourceError::Malformed {
            record: self.line_no,
            message: format!("{} line {}: {message}", self.label, self.line_no),
        }
    }
}

impl<R: BufRead> RecordSource for LineSource<R> {
    fn next_record(&mut self) -> Result<Option<String>, SourceError> {
        loop {
            self.buf.clear();
            let n = self
                .reader
                .read_until(b'\n', &mut self.buf)
                .map_err(|source| SourceError::Io {
                    path: PathBuf::from(&self.label),
                    source,
                })?;
            if n == 0 {
                return Ok(None);
            }
            self.line_no += 1;

            let line = match std::str::from_utf8(&self.buf) {
                Ok(line) => line.trim_end_matches(['\n', '\r']),
                Err(e) => return Err(self.malformed(e)),
            };
            if line.trim().is_empty() {
                continue;
            }

            return match &self.format {
                LineFormat::Text => Ok(Some(line.to_string())),
                LineFormat::Json { field } => match json_text_field(line, field) {
                    Ok(text) => Ok(Some(text)),
                    Err(message) => Err(self.malformed(message)),
                },
            };
        }
    }
}

fn json_text_field(line: &str, field: &str) -> Result<String, String> {
    let value: serde_json::Value = serde_json::from_str(line).map_err(|e| e.to_string())?;
    match value.get(field) {
        Some(serde_json::Value::String(text)) => Ok(text.clone()),
        Some(_) => Err(format!("field '{field}' is not a string")),
        None => Err(format!("missing field '{field}'")),
    }
}

enum TextColumn {
    Utf8(StringArray),
    LargeUtf8(LargeStringArray),
}

impl TextColumn {
    fn from_array(array: &ArrayRef) -> Option<Self> {
        let any = array.as_any();
        if let Some(a) = any.downcast_ref::<StringArray>() {
            return Some(Self::Utf8(a.clone()));
        }
        any.downcast_ref::<LargeStringArray>()
            .map(|a| Self::LargeUtf8(a.clone()))
    }

    fn len(&self) -> usize {
        match self {
            Self::Utf8(a) => a.len(),
            Self::LargeUtf8(a) => a.len(),
        }
    }

    fn get(&self, i: usize) -> Option<&str> {
        match self {
            Self::Utf8(a) => (!a.is_null(i)).then(|| a.value(i)),
            Self::LargeUtf8(a) => (!a.is_null(i)).then(|| a.value(i)),
        }
    }
}

/// One string column of a local Parquet file; nulls are skipped
pub struct ParquetSource {
    path: PathBuf,
    reader: ParquetRecordBatchReader,
    current: Option<TextColumn>,
    row: usize,
}

impl ParquetSource {
    pub fn open(path: &Path, column: &str) -> Result<Self, SourceError> {
        let parquet_err = |e: &dyn std::fmt::Display| {
            SourceError::Parquet(format!("{}: {e}", path.display()))
        };
        let file = File::open(path).map_err(|source| SourceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(file).map_err(|e| parquet_err(&e))?;
        let idx = builder
            .schema()
            .index_of(column)
            .map_err(|e| parquet_err(&e))?;
        let mask = ProjectionMask::roots(builder.parquet_schema(), [idx]);
        let reader = builder
            .with_projection(mask)
            .with_batch_size(PARQUET_BATCH_SIZE)
            .build()
            .map_err(|e| parquet_err(&e))?;
        Ok(Self {
            path: path.to_path_buf(),
            reader,
            current: None,
            row: 0,
        })
    }
}

impl RecordSource for ParquetSource {
    fn next_record(&mut self) -> Result<Option<String>, SourceError> {
        loop {
            if let Some(column) = &self.current {
                while self.row < column.len() {
                    let i = self.row;
                    self.row += 1;
                    if let Some(text) = column.get(i) {
                        return Ok(Some(text.to_string()));
                    }
                }
            }

            match self.reader.next() {
                None => return Ok(None),
                Some(Err(e)) => {
                    return Err(SourceError::Parquet(format!("{}: {e}", self.path.display())));
                }
                Some(Ok(batch)) => {
                    let column = TextColumn::from_array(batch.column(0)).ok_or_else(|| {
                        SourceError::Parquet(format!(
                            "{}: column is {}, expected a string type",
                            self.path.display(),
                            batch.column(0).data_type()
                        ))
                    })?;
                    self.current = Some(column);
                    self.row = 0;
                }
            }
        }
    }
}

/// Container format of one input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFormat {
    Jsonl,
    Text,
    Parquet,
}

impl std::str::FromStr for InputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "jsonl" | "json" | "ndjson" => Ok(Self::Jsonl),
            "text" | "txt" => Ok(Self::Text),
            "parquet" => Ok(Self::Parquet),
            other => Err(format!("unknown input format '{other}'")),
        }
    }
}

/// One input location with its detected format
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputSpec {
    pub location: String,
    pub format: InputFormat,
    pub gzip: bool,
}

impl InputSpec {
    /// Detect format from the extension (`.jsonl.gz`, `.txt`, `.parquet`, ...).
    /// Unknown extensions are read as JSON Lines unless `format` is given.
    pub fn detect(location: &str, format: Option<InputFormat>) -> Self {
        let name = location.split(['?', '#']).next().unwrap_or(location);
        let (name, gzip) = match name.strip_suffix(".gz") {
            Some(stem) => (stem, true),
            None => (name, false),
        };
        let detected = name
            .rsplit_once('.')
            .and_then(|(_, ext)| ext.parse().ok())
            .unwrap_or(InputFormat::Jsonl);
        Self {
            location: location.to_string(),
            format: format.unwrap_or(detected),
            gzip,
        }
    }

    pub fn is_remote(&self) -> bool {
        self.location.starts_with("http://") || self.location.starts_with("https://")
    }

    /// Open this input as a record source.
    pub fn open(&self, text_field: &str) -> Result<Box<dyn RecordSource>, SourceError> {
        let line_format = match self.format {
            InputFormat::Jsonl => LineFormat::Json {
                field: text_field.to_string(),
            },
            InputFormat::Text => LineFormat::Text,
            InputFormat::Parquet => {
                if self.is_remote() || self.gzip {
                    return Err(SourceError::Parquet(format!(
                        "{}: parquet inputs must be uncompressed local files",
                        self.location
                    )));
                }
                return Ok(Box::new(ParquetSource::open(
                    Path::new(&self.location),
                    text_field,
                )?));
            }
        };

        if self.is_remote() {
            let stream = retry_with_backoff(&self.location, http_config().max_retries, || {
                open_http_reader(&self.location, self.gzip)
            })?;
            if let Some(total) = stream.total_bytes {
                log::debug!("{}: {total} bytes", self.location);
            }
            return Ok(Box::new(LineSource::new(
                stream.reader,
                line_format,
                &self.location,
            )));
        }

        let file = File::open(&self.location).map_err(|source| SourceError::Io {
            path: PathBuf::from(&self.location),
            source,
        })?;
        let reader: Box<dyn BufRead> = if self.gzip {
            Box::new(BufReader::with_capacity(
                LINE_BUF_CAPACITY,
                MultiGzDecoder::new(file),
            ))
        } else {
            Box::new(BufReader::with_capacity(LINE_BUF_CAPACITY, file))
        };
        Ok(Box::new(LineSource::new(reader, line_format, &self.location)))
    }
}

/// Expand glob patterns into concrete paths; URLs and literal paths pass through.
pub fn expand_inputs(patterns: &[String]) -> Result<Vec<String>, SourceError> {
    let mut out = Vec::new();
    for pattern in patterns {
        let is_glob = pattern.contains(['*', '?', '[']);
        if pattern.starts_with("http://") || pattern.starts_with("https://") || !is_glob {
            out.push(pattern.clone());
            continue;
        }
        let paths = glob::glob(pattern).map_err(|e| SourceError::Io {
            path: PathBuf::from(pattern),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()),
        })?;
        let mut matched: Vec<String> = paths
            .filter_map(Result::ok)
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        if matched.is_empty() {
            return Err(SourceError::Io {
                path: PathBuf::from(pattern),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no files match pattern"),
            });
        }
        matched.sort();
        out.append(&mut matched);
    }
    Ok(out)
}

/// Several inputs consumed in order as one stream; each is opened lazily.
pub struct ChainSource {
    pending: VecDeque<InputSpec>,
    text_field: String,
    current: Option<Box<dyn RecordSource>>,
}

impl ChainSource {
    pub fn new(inputs: Vec<InputSpec>, text_field: impl Into<String>) -> Self {
        Self {
            pending: inputs.into(),
            text_field: text_field.into(),
            current: None,
        }
    }
}

impl RecordSource for ChainSource {
    fn next_record(&mut self) -> Result<Option<String>, SourceError> {
        loop {
            let source = match &mut self.current {
                Some(source) => source,
                None => {
                    let Some(input) = self.pending.pop_front() else {
                        return Ok(None);
                    };
                    log::info!("Reading {}", input.location);
                    self.current.insert(input.open(&self.text_field)?)
                }
            };
            match source.next_record()? {
                Some(text) => return Ok(Some(text)),
                None => self.current = None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn collect(source: &mut dyn RecordSource) -> Vec<Result<String, String>> {
        let mut out = Vec::new();
        loop {
            match source.next_record() {
                Ok(Some(text)) => out.push(Ok(text)),
                Ok(None) => return out,
                Err(e) if e.is_recoverable() => out.push(Err(e.to_string())),
                Err(e) => panic!("fatal: {e}"),
            }
        }
    }

    fn json() -> LineFormat {
        LineFormat::Json {
            field: "text".to_string(),
        }
    }

    #[test]
    fn jsonl_extracts_field() {
        let data = "{\"text\": \"hello\", \"id\": 1}\n\n{\"text\": \"world\"}\r\n";
        let mut src = LineSource::new(data.as_bytes(), json(), "mem");
        assert_eq!(
            collect(&mut src),
            vec![Ok("hello".to_string()), Ok("world".to_string())]
        );
    }

    #[test]
    fn jsonl_malformed_lines_are_recoverable() {
        let data = "{\"text\": \"a\"}\nnot json\n{\"id\": 3}\n{\"text\": 5}\n{\"text\": \"b\"}";
        let mut src = LineSource::new(data.as_bytes(), json(), "mem");
        let out = collect(&mut src);
        assert_eq!(out.len(), 5);
        assert_eq!(out[0], Ok("a".to_string()));
        assert!(out[1].as_ref().unwrap_err().contains("line 2"));
        assert!(out[2].as_ref().unwrap_err().contains("missing field 'text'"));
        assert!(out[3].as_ref().unwrap_err().contains("not a string"));
        assert_eq!(out[4], Ok("b".to_string()));
    }

    #[test]
    fn invalid_utf8_is_recoverable() {
        let data: &[u8] = b"ok\n\xff\xfe\nfine\n";
        let mut src = LineSource::new(data, LineFormat::Text, "mem");
        let out = collect(&mut src);
        assert_eq!(out[0], Ok("ok".to_string()));
        assert!(out[1].is_err());
        assert_eq!(out[2], Ok("fine".to_string()));
    }

    #[test]
    fn text_lines() {
        let mut src = LineSource::new("one\ntwo\n".as_bytes(), LineFormat::Text, "mem");
        assert_eq!(
            collect(&mut src),
            vec![Ok("one".to_string()), Ok("two".to_string())]
        );
    }

    #[test]
    fn detect_formats() {
        let spec = InputSpec::detect("data/part-0.jsonl.gz", None);
        assert_eq!(spec.format, InputFormat::Jsonl);
        assert!(spec.gzip);

        let spec = InputSpec::detect("corpus.txt", None);
        assert_eq!(spec.format, InputFormat::Text);
        assert!(!spec.gzip);

        let spec = InputSpec::detect("https://host/train-00000.parquet?download=1", None);
        assert_eq!(spec.format, InputFormat::Parquet);
        assert!(spec.is_remote());

        let spec = InputSpec::detect("dump.data", Some(InputFormat::Text));
        assert_eq!(spec.format, InputFormat::Text);
    }

    #[test]
    fn gzip_jsonl_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("part.jsonl.gz");
        let mut gz = flate2::write::GzEncoder::new(
            File::create(&path).unwrap(),
            flate2::Compression::default(),
        );
        gz.write_all(b"{\"text\": \"zipped\"}\n").unwrap();
        gz.finish().unwrap();

        let spec = InputSpec::detect(path.to_str().unwrap(), None);
        let mut src = spec.open("text").unwrap();
        assert_eq!(collect(&mut src), vec![Ok("zipped".to_string())]);
    }

    #[test]
    fn missing_file_is_fatal() {
        let spec = InputSpec::detect("/nonexistent/input.jsonl", None);
        let err = spec.open("text").err().unwrap();
        assert!(!err.is_recoverable());
    }

    #[test]
    fn parquet_string_column() {
        use arrow::datatypes::{DataType, Field, Schema};
        use arrow::array::{Int64Array, RecordBatch};

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("train.parquet");
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("text", DataType::Utf8, true),
        ]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(Int64Array::from(vec![1, 2, 3])),
                Arc::new(StringArray::from(vec![Some("first"), None, Some("third")])),
            ],
        )
        .unwrap();
        let mut writer =
            parquet::arrow::ArrowWriter::try_new(File::create(&path).unwrap(), schema, None)
                .unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();

        let mut src = ParquetSource::open(&path, "text").unwrap();
        assert_eq!(
            collect(&mut src),
            vec![Ok("first".to_string()), Ok("third".to_string())]
        );
        assert!(ParquetSource::open(&path, "body").is_err());
    }

    #[test]
    fn chain_reads_inputs_in_order() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.jsonl");
        std::fs::write(&a, "a1\na2\n").unwrap();
        std::fs::write(&b, "{\"body\": \"b1\"}\n").unwrap();

        let inputs = vec![
            InputSpec::detect(a.to_str().unwrap(), None),
            InputSpec::detect(b.to_str().unwrap(), None),
        ];
        let mut src = ChainSource::new(inputs, "body");
        assert_eq!(
            collect(&mut src),
            vec![
                Ok("a1".to_string()),
                Ok("a2".to_string()),
                Ok("b1".to_string())
            ]
        );
    }

    #[test]
    fn expand_globs_sorted() {
        let dir = TempDir::new().unwrap();
        for name in ["b.jsonl", "a.jsonl", "c.txt"] {
            std::fs::write(dir.path().join(name), "").unwrap();
        }
        let pattern = format!("{}/*.jsonl", dir.path().display());
        let literal = "https://example.com/x.jsonl".to_string();
        let out = expand_inputs(&[pattern, literal.clone()]).unwrap();
        assert_eq!(out.len(), 3);
        assert!(out[0].ends_with("a.jsonl"));
        assert!(out[1].ends_with("b.jsonl"));
        assert_eq!(out[2], literal);
    }

    #[test]
    fn expand_glob_without_match_fails() {
        let dir = TempDir::new().unwrap();
        let pattern = format!("{}/*.parquet", dir.path().display());
        assert!(expand_inputs(&[pattern]).is_err());
    }
}
