//! Primary clinical spreadsheet: reading `.xlsx`/`.csv` into typed rows and
//! rendering each row as a clinical note.
//!
//! Headers are matched after [`normalize`](crate::identity::normalize), so
//! `PatientID`, `Patient ID` and `patient_id` all land in the same field.
//! Empty cells and pandas-style `nan` cells count as absent.

use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tracing::warn;

use crate::extract::{read_zip_entry_bounded, MAX_XML_ENTRY_BYTES};
use crate::identity::normalize;

/// Rows past this count are ignored.
const MAX_ROWS: usize = 100_000;

#[derive(Debug, Error)]
pub enum SpreadsheetError {
    #[error("unsupported spreadsheet format: {0}")]
    UnsupportedFormat(String),
    #[error("failed to read spreadsheet: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid CSV: {0}")]
    Csv(#[from] csv::Error),
    #[error("invalid XLSX: {0}")]
    Xlsx(String),
    #[error("spreadsheet has no header row")]
    MissingHeader,
}

/// Header row plus data rows, cells already trimmed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// The recognized columns, in note order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Column {
    Name,
    PatientId,
    Age,
    Gender,
    TreatmentDate,
    DoctorName,
    Department,
    Diagnosis,
    Description,
    Procedures,
    Medicines,
    Allergies,
    PastMedicalHistory,
    Assessments,
    FollowUpDate,
    ImagePath,
}

impl Column {
    const ALL: [Column; 16] = [
        Column::Name,
        Column::PatientId,
        Column::Age,
        Column::Gender,
        Column::TreatmentDate,
        Column::DoctorName,
        Column::Department,
        Column::Diagnosis,
        Column::Description,
        Column::Procedures,
        Column::Medicines,
        Column::Allergies,
        Column::PastMedicalHistory,
        Column::Assessments,
        Column::FollowUpDate,
        Column::ImagePath,
    ];

    /// Normalized header spellings accepted for this column.
    fn aliases(self) -> &'static [&'static str] {
        match self {
            Column::Name => &["name", "patientname", "fullname"],
            Column::PatientId => &["patientid", "id", "mrn"],
            Column::Age => &["age"],
            Column::Gender => &["gender", "sex"],
            Column::TreatmentDate => &["treatmentdate", "visitdate"],
            Column::DoctorName => &["doctorname", "doctor", "physician"],
            Column::Department => &["department"],
            Column::Diagnosis => &["diagnosis"],
            Column::Description => &["description"],
            Column::Procedures => &["procedures", "procedure"],
            Column::Medicines => &["medicines", "medications", "medication"],
            Column::Allergies => &["allergies"],
            Column::PastMedicalHistory => &["pastmedicalhistory", "medicalhistory"],
            Column::Assessments => &["assessments", "assessment"],
            Column::FollowUpDate => &["followupdate"],
            Column::ImagePath => &["imagepath", "image"],
        }
    }

    fn label(self) -> &'static str {
        match self {
            Column::Name => "Patient",
            Column::PatientId => "Patient ID",
            Column::Age => "Age",
            Column::Gender => "Gender",
            Column::TreatmentDate => "Treatment Date",
            Column::DoctorName => "Doctor",
            Column::Department => "Department",
            Column::Diagnosis => "Diagnosis",
            Column::Description => "Description",
            Column::Procedures => "Procedures",
            Column::Medicines => "Medications",
            Column::Allergies => "Allergies",
            Column::PastMedicalHistory => "Past Medical History",
            Column::Assessments => "Assessments",
            Column::FollowUpDate => "Follow-up Date",
            Column::ImagePath => "Associated Image",
        }
    }

    fn is_date(self) -> bool {
        matches!(self, Column::TreatmentDate | Column::FollowUpDate)
    }

    fn from_header(header: &str) -> Option<Column> {
        let key = normalize(header);
        Column::ALL
            .into_iter()
            .find(|c| c.aliases().contains(&key.as_str()))
    }
}

/// One spreadsheet row. Only `name` is required.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClinicalRow {
    pub name: String,
    pub patient_id: Option<String>,
    pub age: Option<String>,
    pub gender: Option<String>,
    pub treatment_date: Option<String>,
    pub doctor_name: Option<String>,
    pub department: Option<String>,
    pub diagnosis: Option<String>,
    pub description: Option<String>,
    pub procedures: Option<String>,
    pub medicines: Option<String>,
    pub allergies: Option<String>,
    pub past_medical_history: Option<String>,
    pub assessments: Option<String>,
    pub follow_up_date: Option<String>,
    pub image_path: Option<String>,
}

impl ClinicalRow {
    fn field(&self, column: Column) -> Option<&str> {
        match column {
            Column::Name => Some(self.name.as_str()),
            Column::PatientId => self.patient_id.as_deref(),
            Column::Age => self.age.as_deref(),
            Column::Gender => self.gender.as_deref(),
            Column::TreatmentDate => self.treatment_date.as_deref(),
            Column::DoctorName => self.doctor_name.as_deref(),
            Column::Department => self.department.as_deref(),
            Column::Diagnosis => self.diagnosis.as_deref(),
            Column::Description => self.description.as_deref(),
            Column::Procedures => self.procedures.as_deref(),
            Column::Medicines => self.medicines.as_deref(),
            Column::Allergies => self.allergies.as_deref(),
            Column::PastMedicalHistory => self.past_medical_history.as_deref(),
            Column::Assessments => self.assessments.as_deref(),
            Column::FollowUpDate => self.follow_up_date.as_deref(),
            Column::ImagePath => self.image_path.as_deref(),
        }
    }

    fn set(&mut self, column: Column, value: String) {
        let slot = match column {
            Column::Name => {
                self.name = value;
                return;
            }
            Column::PatientId => &mut self.patient_id,
            Column::Age => &mut self.age,
            Column::Gender => &mut self.gender,
            Column::TreatmentDate => &mut self.treatment_date,
            Column::DoctorName => &mut self.doctor_name,
            Column::Department => &mut self.department,
            Column::Diagnosis => &mut self.diagnosis,
            Column::Description => &mut self.description,
            Column::Procedures => &mut self.procedures,
            Column::Medicines => &mut self.medicines,
            Column::Allergies => &mut self.allergies,
            Column::PastMedicalHistory => &mut self.past_medical_history,
            Column::Assessments => &mut self.assessments,
            Column::FollowUpDate => &mut self.follow_up_date,
            Column::ImagePath => &mut self.image_path,
        };
        *slot = Some(value);
    }

    /// Composite note: `Patient:` line, then each present field in fixed order.
    pub fn note_text(&self) -> String {
        Column::ALL
            .into_iter()
            .filter_map(|c| self.field(c).map(|v| format!("{}: {}", c.label(), v)))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Patient fields kept in the document's metadata.
    pub fn metadata(&self) -> serde_json::Value {
        serde_json::json!({
            "patient_name": self.name,
            "patient_id": self.patient_id,
            "age": self.age,
            "gender": self.gender,
            "department": self.department,
            "image_path": self.image_path,
        })
    }
}

/// Column positions resolved from a header row.
#[derive(Debug, Clone)]
pub struct ColumnMap {
    positions: HashMap<usize, Column>,
}

impl ColumnMap {
    pub fn from_headers(headers: &[String]) -> Self {
        let mut positions = HashMap::new();
        let mut seen = Vec::new();
        for (i, header) in headers.iter().enumerate() {
            if let Some(column) = Column::from_header(header) {
                // First matching header wins.
                if !seen.contains(&column) {
                    seen.push(column);
                    positions.insert(i, column);
                }
            }
        }
        Self { positions }
    }

    pub fn has_name(&self) -> bool {
        self.positions.values().any(|c| *c == Column::Name)
    }

    /// Build a typed row; `None` when the name cell is absent.
    pub fn row(&self, cells: &[String]) -> Option<ClinicalRow> {
        let mut row = ClinicalRow::default();
        for (i, cell) in cells.iter().enumerate() {
            let Some(column) = self.positions.get(&i) else {
                continue;
            };
            let Some(value) = clean_cell(cell) else {
                continue;
            };
            let value = if column.is_date() {
                excel_serial_date(&value).unwrap_or(value)
            } else {
                value
            };
            row.set(*column, value);
        }
        if row.name.is_empty() {
            None
        } else {
            Some(row)
        }
    }
}

fn clean_cell(cell: &str) -> Option<String> {
    let v = cell.trim();
    if v.is_empty() || v.eq_ignore_ascii_case("nan") {
        None
    } else {
        Some(v.to_string())
    }
}

/// Excel stores dates as day serials; render plausible ones (1954..2119) as `YYYY-MM-DD`.
fn excel_serial_date(value: &str) -> Option<String> {
    let serial: f64 = value.parse().ok()?;
    if !(20_000.0..80_000.0).contains(&serial) || serial.fract() != 0.0 {
        return None;
    }
    let epoch = chrono::NaiveDate::from_ymd_opt(1899, 12, 30)?;
    let date = epoch.checked_add_days(chrono::Days::new(serial as u64))?;
    Some(date.format("%Y-%m-%d").to_string())
}

/// Read the spreadsheet at `path` (`.xlsx` or `.csv`).
pub fn read_table(path: &Path, bytes: &[u8]) -> Result<Table, SpreadsheetError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "csv" => read_csv(bytes),
        "xlsx" => read_xlsx(bytes),
        other => Err(SpreadsheetError::UnsupportedFormat(other.to_string())),
    }
}

fn read_csv(bytes: &[u8]) -> Result<Table, SpreadsheetError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(bytes);

    let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
    if headers.iter().all(|h| h.is_empty()) {
        return Err(SpreadsheetError::MissingHeader);
    }

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        rows.push(record.iter().map(str::to_string).collect());
    }
    cap_rows(&mut rows, MAX_ROWS);
    Ok(Table { headers, rows })
}

/// Keep the first `limit` rows; returns how many were dropped.
fn cap_rows(rows: &mut Vec<Vec<String>>, limit: usize) -> usize {
    let dropped = rows.len().saturating_sub(limit);
    if dropped > 0 {
        warn!(limit, dropped, "Spreadsheet row limit reached, ignoring remaining rows");
        rows.truncate(limit);
    }
    dropped
}

fn read_xlsx(bytes: &[u8]) -> Result<Table, SpreadsheetError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| SpreadsheetError::Xlsx(e.to_string()))?;

    let shared = if archive.file_names().any(|n| n == "xl/sharedStrings.xml") {
        let xml = read_zip_entry_bounded(&mut archive, "xl/sharedStrings.xml", MAX_XML_ENTRY_BYTES)
            .map_err(SpreadsheetError::Xlsx)?;
        shared_strings(&xml)?
    } else {
        Vec::new()
    };

    let sheet = first_worksheet(&archive)
        .ok_or_else(|| SpreadsheetError::Xlsx("workbook has no worksheets".to_string()))?;
    let xml = read_zip_entry_bounded(&mut archive, &sheet, MAX_XML_ENTRY_BYTES)
        .map_err(SpreadsheetError::Xlsx)?;
    let mut grid = sheet_rows(&xml, &shared)?;

    if grid.is_empty() {
        return Err(SpreadsheetError::MissingHeader);
    }
    let headers = grid.remove(0);
    grid.retain(|r| r.iter().any(|c| !c.is_empty()));
    cap_rows(&mut grid, MAX_ROWS);
    Ok(Table {
        headers,
        rows: grid,
    })
}

fn first_worksheet<R: std::io::Read + std::io::Seek>(archive: &zip::ZipArchive<R>) -> Option<String> {
    archive
        .file_names()
        .filter(|n| n.starts_with("xl/worksheets/sheet") && n.ends_with(".xml"))
        .min_by_key(|name| {
            name.trim_start_matches("xl/worksheets/sheet")
                .trim_end_matches(".xml")
                .parse::<u32>()
                .unwrap_or(u32::MAX)
        })
        .map(str::to_string)
}

/// Shared string table; rich-text runs inside one `si` are concatenated.
fn shared_strings(xml: &[u8]) -> Result<Vec<String>, SpreadsheetError> {
    use quick_xml::events::Event;

    let mut strings = Vec::new();
    let mut current = String::new();
    let mut in_si = false;
    let mut in_t = false;
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => {
                    in_si = true;
                    current.clear();
                }
                b"t" if in_si => in_t = true,
                _ => {}
            },
            Ok(Event::Empty(e)) if e.local_name().as_ref() == b"si" => strings.push(String::new()),
            Ok(Event::Text(te)) if in_t => {
                current.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"si" => {
                    in_si = false;
                    strings.push(std::mem::take(&mut current));
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(SpreadsheetError::Xlsx(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

/// Zero-based column index from a cell reference such as `"AB12"`.
fn column_index(cell_ref: &str) -> Option<usize> {
    let letters: String = cell_ref.chars().take_while(|c| c.is_ascii_alphabetic()).collect();
    if letters.is_empty() {
        return None;
    }
    let mut idx = 0usize;
    for c in letters.chars() {
        idx = idx * 26 + (c.to_ascii_uppercase() as usize - 'A' as usize + 1);
    }
    Some(idx - 1)
}

#[derive(Clone, Copy, PartialEq)]
enum CellKind {
    Shared,
    Inline,
    Other,
}

/// Rows of the worksheet as positioned cells, gaps filled with `""`.
fn sheet_rows(xml: &[u8], shared: &[String]) -> Result<Vec<Vec<String>>, SpreadsheetError> {
    use quick_xml::events::Event;

    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut col = 0usize;
    let mut kind = CellKind::Other;
    let mut value = String::new();
    let mut in_value = false;
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();

    let place = |row: &mut Vec<String>, col: usize, text: String| {
        if row.len() <= col {
            row.resize(col + 1, String::new());
        }
        row[col] = text.trim().to_string();
    };

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"row" => row.clear(),
                b"c" => {
                    kind = CellKind::Other;
                    value.clear();
                    let mut explicit = None;
                    for attr in e.attributes().flatten() {
                        match attr.key.local_name().as_ref() {
                            b"r" => {
                                explicit = std::str::from_utf8(&attr.value).ok().and_then(column_index)
                            }
                            b"t" => {
                                kind = match attr.value.as_ref() {
                                    b"s" => CellKind::Shared,
                                    b"inlineStr" => CellKind::Inline,
                                    _ => CellKind::Other,
                                }
                            }
                            _ => {}
                        }
                    }
                    col = explicit.unwrap_or(row.len());
                }
                b"v" => in_value = true,
                b"t" if kind == CellKind::Inline => in_value = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_value => {
                value.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"c" => {
                    let text = match kind {
                        CellKind::Shared => value
                            .trim()
                            .parse::<usize>()
                            .ok()
                            .and_then(|i| shared.get(i).cloned())
                            .unwrap_or_default(),
                        _ => std::mem::take(&mut value),
                    };
                    place(&mut row, col, text);
                    value.clear();
                }
                b"row" => rows.push(std::mem::take(&mut row)),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(SpreadsheetError::Xlsx(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(rows)
}
