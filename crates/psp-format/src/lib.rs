//! Flat-file format support for PSP open-data exports: windows-1250 row
//! decoding, escape-aware field splitting, per-table schema coercion, and
//! selective ZIP member extraction.
//!
//! The source publishes pipe-delimited text files inside ZIP archives. The
//! escape byte `\` may precede the delimiter, the line terminator, or
//! itself; a row boundary therefore only exists where the terminator is
//! *not* escaped, which is why rows are split after escape scanning rather
//! than with a plain line iterator.

use std::collections::BTreeMap;
use std::io::{Cursor, Read};

use chrono::{NaiveDate, NaiveTime};
use encoding_rs::WINDOWS_1250;
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "psp-format";

pub const DELIMITER: char = '|';
pub const ESCAPE: char = '\\';
pub const TERMINATOR: char = '\n';

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("bytes are not valid windows-1250 text")]
    Encoding,
    #[error("required archive member `{0}` not found")]
    MemberNotFound(String),
    #[error("archive unreadable: {0}")]
    Archive(String),
    #[error("field `{field}`: {reason}")]
    FieldFormat { field: String, reason: String },
    #[error("expected {expected} fields, got {got}")]
    FieldCount { expected: usize, got: usize },
}

// ---------------------------------------------------------------------------
// Row decoding

/// Bytes with no character assigned in cp1250. The decoder's WHATWG lookup
/// table maps them to C1 controls instead of reporting an error, so they
/// have to be rejected up front.
const UNDEFINED_CP1250: [u8; 5] = [0x81, 0x83, 0x88, 0x90, 0x98];

/// Decode raw member bytes and split them into logical rows.
///
/// Invalid bytes are fatal for the whole file; a half-decoded flat file has
/// no usable row boundaries.
pub fn decode_rows(bytes: &[u8]) -> Result<Vec<String>, FormatError> {
    if bytes.iter().any(|b| UNDEFINED_CP1250.contains(b)) {
        return Err(FormatError::Encoding);
    }
    let (text, _, had_errors) = WINDOWS_1250.decode(bytes);
    if had_errors {
        return Err(FormatError::Encoding);
    }
    Ok(split_rows(&text))
}

/// Split decoded text on unescaped terminators. Escape pairs are kept
/// verbatim; [`split_fields`] resolves them later.
pub fn split_rows(text: &str) -> Vec<String> {
    let mut rows = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars();

    while let Some(c) = chars.next() {
        match c {
            ESCAPE => {
                current.push(c);
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            TERMINATOR => {
                if current.ends_with('\r') {
                    current.pop();
                }
                if !current.trim().is_empty() {
                    rows.push(std::mem::take(&mut current));
                } else {
                    current.clear();
                }
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        rows.push(current);
    }
    rows
}

/// Split one logical row on unescaped delimiters and un-escape each field.
/// Whitespace-only fields are null.
pub fn split_fields(row: &str) -> Vec<Option<String>> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = row.chars();

    while let Some(c) = chars.next() {
        match c {
            ESCAPE => {
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            DELIMITER => fields.push(finish_field(std::mem::take(&mut current))),
            _ => current.push(c),
        }
    }
    fields.push(finish_field(current));
    fields
}

fn finish_field(raw: String) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Escape a single field value so that [`split_fields`] recovers it exactly.
pub fn escape_field(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if c == ESCAPE || c == DELIMITER || c == TERMINATOR {
            out.push(ESCAPE);
        }
        out.push(c);
    }
    out
}

/// Re-encode fields into one row; null becomes an empty field.
pub fn encode_row(fields: &[Option<String>]) -> String {
    fields
        .iter()
        .map(|f| f.as_deref().map(escape_field).unwrap_or_default())
        .collect::<Vec<_>>()
        .join("|")
}

// ---------------------------------------------------------------------------
// Schemas and coercion

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateStyle {
    /// `dd.mm.yyyy`, used by the roster and organ files.
    DayMonthYear,
    /// `yyyy-mm-dd`, used by the voting and bill files.
    Iso,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Integer,
    Date(DateStyle),
    Time,
    Boolean,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub nullable: bool,
}

const fn field(name: &'static str, kind: FieldKind, nullable: bool) -> FieldSpec {
    FieldSpec {
        name,
        kind,
        nullable,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSchema {
    pub table: &'static str,
    pub fields: &'static [FieldSpec],
}

impl TableSchema {
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }
}

/// One coerced field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Text(String),
    Integer(i64),
    Date(NaiveDate),
    Time(NaiveTime),
    Boolean(bool),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            FieldValue::Date(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_time(&self) -> Option<NaiveTime> {
        match self {
            FieldValue::Time(t) => Some(*t),
            _ => None,
        }
    }
}

/// What to do with a row whose field count disagrees with the schema.
///
/// The upstream format grows columns over time, so accept-and-log is the
/// default; strict deployments can reject instead. This is a policy knob,
/// not a guess at correct semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MismatchPolicy {
    #[default]
    AcceptDegraded,
    Reject,
}

/// One row coerced against its schema.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRow {
    schema: &'static TableSchema,
    values: Vec<FieldValue>,
    degraded: bool,
}

impl ParsedRow {
    pub fn degraded(&self) -> bool {
        self.degraded
    }

    pub fn values(&self) -> &[FieldValue] {
        &self.values
    }

    /// Value of a declared field by name. Unknown names resolve to null so
    /// mapping code can stay positional-agnostic.
    pub fn get(&self, name: &str) -> &FieldValue {
        static NULL: FieldValue = FieldValue::Null;
        self.schema
            .field_index(name)
            .and_then(|i| self.values.get(i))
            .unwrap_or(&NULL)
    }
}

/// Coerce one logical row against `schema`.
pub fn parse_row(
    schema: &'static TableSchema,
    row: &str,
    policy: MismatchPolicy,
) -> Result<ParsedRow, FormatError> {
    let raw = split_fields(row);
    let declared = schema.fields.len();
    let degraded = raw.len() != declared;

    if degraded && policy == MismatchPolicy::Reject {
        return Err(FormatError::FieldCount {
            expected: declared,
            got: raw.len(),
        });
    }

    let mut values = Vec::with_capacity(declared);
    for (i, spec) in schema.fields.iter().enumerate() {
        let value = match raw.get(i) {
            // Short row: trailing declared fields become null regardless of
            // nullability; the row is already flagged degraded.
            None => FieldValue::Null,
            Some(None) => {
                if spec.nullable {
                    FieldValue::Null
                } else {
                    return Err(FormatError::FieldFormat {
                        field: spec.name.to_string(),
                        reason: "empty value in non-nullable field".to_string(),
                    });
                }
            }
            Some(Some(text)) => coerce(spec, text)?,
        };
        values.push(value);
    }

    Ok(ParsedRow {
        schema,
        values,
        degraded,
    })
}

fn coerce(spec: &FieldSpec, text: &str) -> Result<FieldValue, FormatError> {
    let fail = |reason: String| FormatError::FieldFormat {
        field: spec.name.to_string(),
        reason,
    };

    match spec.kind {
        FieldKind::Text => Ok(FieldValue::Text(text.to_string())),
        FieldKind::Integer => text
            .parse::<i64>()
            .map(FieldValue::Integer)
            .map_err(|_| fail(format!("`{text}` is not an integer"))),
        FieldKind::Date(style) => {
            let pattern = match style {
                DateStyle::DayMonthYear => "%d.%m.%Y",
                DateStyle::Iso => "%Y-%m-%d",
            };
            NaiveDate::parse_from_str(text, pattern)
                .map(FieldValue::Date)
                .map_err(|_| fail(format!("`{text}` is not a valid date")))
        }
        FieldKind::Time => NaiveTime::parse_from_str(text, "%H:%M:%S")
            .or_else(|_| NaiveTime::parse_from_str(text, "%H:%M"))
            .map(FieldValue::Time)
            .map_err(|_| fail(format!("`{text}` is not a valid time"))),
        FieldKind::Boolean => match text {
            "1" => Ok(FieldValue::Boolean(true)),
            "0" => Ok(FieldValue::Boolean(false)),
            other => Err(fail(format!("`{other}` is not a boolean flag"))),
        },
    }
}

/// Per-row tagged results for a whole member file. Row-scoped failures stay
/// in the batch; nothing unwinds.
#[derive(Debug)]
pub struct TableBatch {
    pub schema: &'static TableSchema,
    pub rows: Vec<Result<ParsedRow, FormatError>>,
    pub degraded_rows: usize,
}

pub fn parse_table(
    schema: &'static TableSchema,
    lines: &[String],
    policy: MismatchPolicy,
) -> TableBatch {
    let mut rows = Vec::with_capacity(lines.len());
    let mut degraded_rows = 0usize;

    for (line_no, line) in lines.iter().enumerate() {
        match parse_row(schema, line, policy) {
            Ok(row) => {
                if row.degraded() {
                    degraded_rows += 1;
                    warn!(
                        table = schema.table,
                        row = line_no + 1,
                        declared = schema.fields.len(),
                        "row field count differs from schema; mapped positionally"
                    );
                }
                rows.push(Ok(row));
            }
            Err(err) => {
                warn!(table = schema.table, row = line_no + 1, %err, "row rejected");
                rows.push(Err(err));
            }
        }
    }

    TableBatch {
        schema,
        rows,
        degraded_rows,
    }
}

// ---------------------------------------------------------------------------
// Archive extraction

#[derive(Debug, Clone)]
pub struct MemberSpec {
    pub name: String,
    pub required: bool,
}

impl MemberSpec {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: false,
        }
    }
}

#[derive(Debug, Clone)]
pub enum MemberSelection {
    All,
    Named(Vec<MemberSpec>),
}

/// Extract and row-decode the wanted members of a ZIP archive.
///
/// Unrequested members are never decompressed. A missing required member is
/// an error; a missing optional member is simply absent from the result.
/// With [`MemberSelection::All`] an undecodable member is skipped with a
/// warning, since inspection should survive one bad file.
pub fn extract_members(
    bytes: &[u8],
    wanted: &MemberSelection,
) -> Result<BTreeMap<String, Vec<String>>, FormatError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| FormatError::Archive(e.to_string()))?;

    let mut out = BTreeMap::new();
    match wanted {
        MemberSelection::All => {
            let names: Vec<String> = archive.file_names().map(str::to_string).collect();
            for name in names {
                if name.ends_with('/') {
                    continue;
                }
                let raw = read_member(&mut archive, &name)?;
                match decode_rows(&raw) {
                    Ok(rows) => {
                        out.insert(name, rows);
                    }
                    Err(err) => warn!(member = %name, %err, "skipping undecodable member"),
                }
            }
        }
        MemberSelection::Named(specs) => {
            for spec in specs {
                let present = archive.index_for_name(&spec.name).is_some();
                if !present {
                    if spec.required {
                        return Err(FormatError::MemberNotFound(spec.name.clone()));
                    }
                    continue;
                }
                let raw = read_member(&mut archive, &spec.name)?;
                out.insert(spec.name.clone(), decode_rows(&raw)?);
            }
        }
    }
    Ok(out)
}

fn read_member(
    archive: &mut zip::ZipArchive<Cursor<&[u8]>>,
    name: &str,
) -> Result<Vec<u8>, FormatError> {
    let mut member = archive
        .by_name(name)
        .map_err(|e| FormatError::Archive(e.to_string()))?;
    let mut buf = Vec::with_capacity(member.size() as usize);
    member
        .read_to_end(&mut buf)
        .map_err(|e| FormatError::Archive(e.to_string()))?;
    Ok(buf)
}

// ---------------------------------------------------------------------------
// Declared table schemas

pub mod schemas {
    use super::DateStyle::{DayMonthYear, Iso};
    use super::FieldKind::{Date, Integer, Text, Time};
    use super::{field, TableSchema};

    /// Persons roster (`osoby.unl` in the MP archive).
    pub static OSOBY: TableSchema = TableSchema {
        table: "osoby",
        fields: &[
            field("id_osoba", Integer, false),
            field("pred", Text, true),
            field("prijmeni", Text, true),
            field("jmeno", Text, true),
            field("za", Text, true),
            field("narozeni", Date(DayMonthYear), true),
            field("pohlavi", Text, true),
            field("zmena", Date(DayMonthYear), true),
            field("umrti", Date(DayMonthYear), true),
        ],
    };

    /// MP terms (`poslanec.unl`).
    pub static POSLANEC: TableSchema = TableSchema {
        table: "poslanec",
        fields: &[
            field("id_poslanec", Integer, false),
            field("id_osoba", Integer, false),
            field("id_kraj", Integer, true),
            field("id_kandidatka", Integer, true),
            field("id_organ", Integer, true),
            field("web", Text, true),
            field("ulice", Text, true),
            field("obec", Text, true),
            field("psc", Text, true),
            field("email", Text, true),
            field("telefon", Text, true),
            field("fax", Text, true),
            field("psp_telefon", Text, true),
            field("facebook", Text, true),
            field("foto", Text, true),
        ],
    };

    /// Chamber organs and committees (`organy.unl`).
    pub static ORGANY: TableSchema = TableSchema {
        table: "organy",
        fields: &[
            field("id_organ", Integer, false),
            field("organ_id_organ", Integer, true),
            field("id_typ_organu", Integer, true),
            field("zkratka", Text, true),
            field("nazev_organu_cz", Text, true),
            field("nazev_organu_en", Text, true),
            field("od_organ", Date(DayMonthYear), true),
            field("do_organ", Date(DayMonthYear), true),
            field("priorita", Integer, true),
            field("cl_organ_base", Integer, true),
        ],
    };

    /// Parliamentary prints (`tisk.unl`).
    pub static TISK: TableSchema = TableSchema {
        table: "tisk",
        fields: &[
            field("id_tisk", Integer, false),
            field("id_organ", Integer, true),
            field("tisk", Text, true),
            field("nazev", Text, true),
            field("popis", Text, true),
            field("cislo_vlastni", Text, true),
            field("typ", Integer, true),
            field("stav", Integer, true),
            field("datum", Date(Iso), true),
            field("cislo_sbirky", Text, true),
            field("rok_sbirky", Integer, true),
            field("url", Text, true),
        ],
    };

    /// Voting sessions (`hl_hlasovani.unl` per electoral period).
    pub static HL_HLASOVANI: TableSchema = TableSchema {
        table: "hl_hlasovani",
        fields: &[
            field("id_hlasovani", Integer, false),
            field("id_organ", Integer, false),
            field("schuze", Integer, false),
            field("cislo", Integer, false),
            field("bod", Integer, true),
            field("datum", Date(Iso), true),
            field("cas", Time, true),
            field("pro", Integer, true),
            field("proti", Integer, true),
            field("zdrzel", Integer, true),
            field("nehlasoval", Integer, true),
            field("prihlaseno", Integer, true),
            field("kvorum", Integer, true),
            field("druh_hlasovani", Text, true),
            field("vysledek", Text, true),
            field("nazev_dlouhy", Text, true),
            field("nazev_kratky", Text, true),
        ],
    };

    /// Individual MP votes (`hl_poslanec.unl` per electoral period).
    pub static HL_POSLANEC: TableSchema = TableSchema {
        table: "hl_poslanec",
        fields: &[
            field("id_hlasovani", Integer, false),
            field("id_poslanec", Integer, false),
            field("vysledek", Text, false),
        ],
    };

    pub fn all() -> [&'static TableSchema; 6] {
        [
            &OSOBY,
            &POSLANEC,
            &ORGANY,
            &TISK,
            &HL_HLASOVANI,
            &HL_POSLANEC,
        ]
    }

    pub fn by_table(table: &str) -> Option<&'static TableSchema> {
        all().into_iter().find(|s| s.table == table)
    }
}
