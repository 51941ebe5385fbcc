//! Unit parser - streams a source file into raw units
//!
//! Produces a lazy, finite, restartable sequence of raw units without
//! loading the whole file into memory. Ordinals are dense, 0-based and
//! stable: the same bytes always yield the same ordinal sequence and field
//! maps. A row that cannot be parsed as declared surfaces `MalformedSource`
//! with the offending line and byte offset; nothing is silently dropped.

use serde_json::{Map, Value};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use thiserror::Error;
use serde::{Deserialize, Serialize};

use crate::domain::job::SourceFormat;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed source at line {line} (byte {byte}): {detail}")]
    MalformedSource { line: u64, byte: u64, detail: String },

    #[error("source contains no data rows")]
    EmptySource,

    #[error("source I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

/// Restart cursor for a unit: where its bytes start in the source file.
/// `record` is the unit's ordinal, so a stored position is enough to
/// resume parsing without re-reading prior bytes.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourcePosition {
    pub byte: u64,
    pub line: u64,
    pub record: u64,
}

/// One logical entry of the source file, as parsed
#[derive(Debug, Clone, PartialEq)]
pub struct RawUnit {
    pub ordinal: u64,
    pub fields: Map<String, Value>,
    pub position: SourcePosition,
}

enum ParserInner<R> {
    Csv {
        reader: csv::Reader<R>,
        headers: Vec<String>,
    },
    JsonLines {
        reader: BufReader<R>,
        /// Byte offset of the next line to read
        byte: u64,
        /// Lines consumed so far (1-based line numbers in errors/positions)
        line: u64,
    },
}

/// Streaming parser over one source file
pub struct UnitParser<R> {
    inner: ParserInner<R>,
    next_ordinal: u64,
}

impl<R: Read + Seek> UnitParser<R> {
    /// Build a streaming reader for the declared format. For CSV the header
    /// row is read eagerly so `headers()` is available before iteration.
    pub fn open(source: R, format: &SourceFormat) -> Result<Self, ParseError> {
        let inner = match format {
            SourceFormat::Csv { delimiter } => {
                let mut reader = csv::ReaderBuilder::new()
                    .delimiter(*delimiter)
                    .has_headers(true)
                    .flexible(false)
                    .from_reader(source);
                let headers = reader
                    .headers()
                    .map_err(csv_error_to_parse_error)?
                    .iter()
                    .map(str::to_string)
                    .collect();
                ParserInner::Csv { reader, headers }
            }
            SourceFormat::JsonLines => ParserInner::JsonLines {
                reader: BufReader::new(source),
                byte: 0,
                line: 0,
            },
        };
        Ok(Self { inner, next_ordinal: 0 })
    }

    /// Header row of a CSV source; empty for JSON Lines.
    pub fn headers(&self) -> &[String] {
        match &self.inner {
            ParserInner::Csv { headers, .. } => headers,
            ParserInner::JsonLines { .. } => &[],
        }
    }

    /// Pull the next raw unit, or `None` at end of file.
    pub fn next_unit(&mut self) -> Result<Option<RawUnit>, ParseError> {
        match &mut self.inner {
            ParserInner::Csv { reader, headers } => {
                let position = reader.position().clone();
                let mut record = csv::StringRecord::new();
                let got = reader.read_record(&mut record).map_err(csv_error_to_parse_error)?;
                if !got {
                    return Ok(None);
                }

                let mut fields = Map::new();
                for (header, value) in headers.iter().zip(record.iter()) {
                    fields.insert(header.clone(), Value::String(value.to_string()));
                }

                let ordinal = self.next_ordinal;
                self.next_ordinal += 1;
                Ok(Some(RawUnit {
                    ordinal,
                    fields,
                    position: SourcePosition {
                        byte: position.byte(),
                        line: position.line(),
                        record: ordinal,
                    },
                }))
            }
            ParserInner::JsonLines { reader, byte, line } => {
                loop {
                    let mut buf = String::new();
                    let read = reader.read_line(&mut buf)?;
                    if read == 0 {
                        return Ok(None);
                    }
                    let start_byte = *byte;
                    *byte += read as u64;
                    *line += 1;

                    let trimmed = buf.trim();
                    if trimmed.is_empty() {
                        // Blank lines do not consume an ordinal
                        continue;
                    }

                    let value: Value = serde_json::from_str(trimmed).map_err(|e| {
                        ParseError::MalformedSource {
                            line: *line,
                            byte: start_byte,
                            detail: format!("invalid JSON: {e}"),
                        }
                    })?;
                    let Value::Object(fields) = value else {
                        return Err(ParseError::MalformedSource {
                            line: *line,
                            byte: start_byte,
                            detail: "line is not a JSON object".to_string(),
                        });
                    };

                    let ordinal = self.next_ordinal;
                    self.next_ordinal += 1;
                    return Ok(Some(RawUnit {
                        ordinal,
                        fields,
                        position: SourcePosition {
                            byte: start_byte,
                            line: *line,
                            record: ordinal,
                        },
                    }));
                }
            }
        }
    }

    /// Seek so the next `next_unit` call yields the unit whose position was
    /// stored, without re-reading prior bytes.
    pub fn resume_from(&mut self, position: &SourcePosition) -> Result<(), ParseError> {
        match &mut self.inner {
            ParserInner::Csv { reader, .. } => {
                let mut csv_pos = csv::Position::new();
                // The header row occupies the reader's record index 0, so a
                // unit's csv record index is its ordinal plus one.
                csv_pos
                    .set_byte(position.byte)
                    .set_line(position.line)
                    .set_record(position.record + 1);
                reader.seek(csv_pos).map_err(csv_error_to_parse_error)?;
            }
            ParserInner::JsonLines { reader, byte, line } => {
                reader.seek(SeekFrom::Start(position.byte))?;
                *byte = position.byte;
                *line = position.line.saturating_sub(1);
            }
        }
        self.next_ordinal = position.record;
        Ok(())
    }
}

fn csv_error_to_parse_error(err: csv::Error) -> ParseError {
    let (line, byte) = err
        .position()
        .map(|p| (p.line(), p.byte()))
        .unwrap_or((0, 0));
    ParseError::MalformedSource {
        line,
        byte,
        detail: err.to_string(),
    }
}
