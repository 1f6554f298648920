//! Sliced 3MF archive inspection.
//!
//! Bambu Studio writes filament usage into `Metadata/slice_info.config` as
//! quoted attributes on `<filament .../>` lines, and an estimated print time
//! into the third line of each `Metadata/plate_N.gcode` header. Both are
//! read with narrow patterns rather than a full XML or G-code parser.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, info, warn};
use zip::result::ZipError;
use zip::ZipArchive;

use crate::error::{Result, SliceQuoteError};

/// Usage metadata entry.
pub const USAGE_ENTRY: &str = "Metadata/slice_info.config";
/// Machine instructions of the first plate.
pub const FIRST_PLATE_GCODE: &str = "Metadata/plate_1.gcode";
/// Zero-based index of the header line carrying the time estimate.
pub const DURATION_LINE_INDEX: usize = 2;

const FILAMENT_MARKER: &str = "<filament";
const DURATION_MARKER: &str = "total estimated time: ";
const DURATION_PATTERN: &str = r"(?:(\d+)d\s*)?(?:(\d+)h\s*)?(?:(\d+)m\s*)?(?:(\d+)s)?";

static USED_G: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"used_g="([^"]+)""#).unwrap());
static USED_M: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"used_m="([^"]+)""#).unwrap());
static DURATION_IN_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!("{}({DURATION_PATTERN})", regex::escape(DURATION_MARKER))).unwrap()
});
static DURATION_EXPR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!(r"^\s*{DURATION_PATTERN}")).unwrap());

/// Estimated print time as written by the slicer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrintDuration {
    /// Days.
    pub days: u64,
    /// Hours.
    pub hours: u64,
    /// Minutes.
    pub minutes: u64,
    /// Seconds.
    pub seconds: u64,
}

impl PrintDuration {
    /// Parse `<d>d <h>h <m>m <s>s`; every component is optional but order is fixed.
    ///
    /// Anything that does not match yields a zero duration.
    pub fn parse_expression(expr: &str) -> Self {
        DURATION_EXPR
            .captures(expr)
            .map(|caps| Self::from_captures(&caps, 1))
            .unwrap_or_default()
    }

    /// Find `total estimated time: ...` in a G-code header line.
    pub fn from_header(line: &str) -> Option<Self> {
        DURATION_IN_HEADER
            .captures(line)
            .map(|caps| Self::from_captures(&caps, 2))
    }

    fn from_captures(caps: &regex::Captures<'_>, first: usize) -> Self {
        let part = |i: usize| -> u64 {
            caps.get(first + i)
                .and_then(|m| m.as_str().parse().ok())
                .unwrap_or(0)
        };
        Self {
            days: part(0),
            hours: part(1),
            minutes: part(2),
            seconds: part(3),
        }
    }

    /// Total duration in hours.
    pub fn as_hours(&self) -> f64 {
        self.days as f64 * 24.0
            + self.hours as f64
            + self.minutes as f64 / 60.0
            + self.seconds as f64 / 3600.0
    }

    /// Total duration in seconds, saturating at `u64::MAX`.
    pub fn as_secs(&self) -> u64 {
        self.days
            .saturating_mul(24)
            .saturating_add(self.hours)
            .saturating_mul(60)
            .saturating_add(self.minutes)
            .saturating_mul(60)
            .saturating_add(self.seconds)
    }
}

/// Filament usage attributes from the usage metadata.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FilamentUsage {
    /// Mass used (g).
    pub used_g: Option<f64>,
    /// Length used (m).
    pub used_m: Option<f64>,
}

impl FilamentUsage {
    /// Scan `<filament` lines; the last numeric value of each attribute wins.
    pub fn parse(text: &str) -> Self {
        let mut usage = Self::default();
        for line in text.lines() {
            if !line.trim_start().starts_with(FILAMENT_MARKER) {
                continue;
            }
            if let Some(g) = numeric_attr(&USED_G, line) {
                debug!(used_g = g, "parsed used_g");
                usage.used_g = Some(g);
            }
            if let Some(m) = numeric_attr(&USED_M, line) {
                debug!(used_m = m, "parsed used_m");
                usage.used_m = Some(m);
            }
        }
        usage
    }
}

fn numeric_attr(pattern: &Regex, line: &str) -> Option<f64> {
    let raw = pattern.captures(line)?.get(1)?.as_str();
    match raw.trim().parse::<f64>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(value = raw, "ignoring non-numeric filament attribute");
            None
        }
    }
}

/// Everything read from a sliced archive. Absent entries leave fields empty.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedMetadata {
    /// Filament usage.
    pub usage: FilamentUsage,
    /// Estimated print time of the first plate.
    pub duration: Option<PrintDuration>,
}

impl ParsedMetadata {
    /// Printing hours; zero when no estimate was found.
    pub fn printing_hours(&self) -> f64 {
        self.duration.map(|d| d.as_hours()).unwrap_or(0.0)
    }
}

/// Whether a 3MF already carries slicer output (usage metadata and plate G-code).
///
/// Unreadable files are treated as not sliced.
pub fn is_presliced(path: &Path) -> bool {
    let Ok(file) = File::open(path) else {
        return false;
    };
    let Ok(archive) = ZipArchive::new(file) else {
        return false;
    };
    let has_usage = archive
        .file_names()
        .any(|name| name.ends_with("slice_info.config"));
    let has_gcode = archive
        .file_names()
        .any(|name| name.ends_with(".gcode") && name.to_lowercase().contains("plate"));
    has_usage && has_gcode
}

/// Read usage and duration metadata from a sliced archive.
pub fn parse(path: &Path) -> Result<ParsedMetadata> {
    if !path.exists() {
        return Err(SliceQuoteError::ArchiveMissing(path.to_path_buf()));
    }
    let invalid = |e: ZipError| SliceQuoteError::InvalidArchive {
        path: path.to_path_buf(),
        reason: e.to_string(),
    };
    let mut archive = ZipArchive::new(File::open(path)?).map_err(invalid)?;
    info!(entries = archive.len(), "opened sliced archive");

    let mut metadata = ParsedMetadata::default();

    if let Some(text) = read_entry(&mut archive, USAGE_ENTRY, read_all) {
        metadata.usage = FilamentUsage::parse(&text);
    }

    if let Some(Some(line)) = read_entry(&mut archive, FIRST_PLATE_GCODE, read_duration_line) {
        let excerpt: String = line.chars().take(120).collect();
        info!(line = %excerpt, "printing time line");
        metadata.duration = PrintDuration::from_header(&line);
    }

    info!(
        used_g = ?metadata.usage.used_g,
        used_m = ?metadata.usage.used_m,
        hours = metadata.printing_hours(),
        "parsed archive metadata"
    );
    Ok(metadata)
}

/// Open one entry and hand it to `read`. Missing or unreadable entries are `None`.
fn read_entry<R, T>(
    archive: &mut ZipArchive<R>,
    name: &str,
    read: fn(&mut dyn Read) -> std::io::Result<T>,
) -> Option<T>
where
    R: Read + std::io::Seek,
{
    let mut entry = match archive.by_name(name) {
        Ok(entry) => entry,
        Err(ZipError::FileNotFound) => {
            debug!(entry = name, "archive entry absent");
            return None;
        }
        Err(e) => {
            warn!(entry = name, error = %e, "failed opening archive entry");
            return None;
        }
    };
    info!(entry = name, "reading archive entry");
    match read(&mut entry) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(entry = name, error = %e, "failed reading archive entry");
            None
        }
    }
}

fn read_all(reader: &mut dyn Read) -> std::io::Result<String> {
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Only the header is needed, so stop after the third line.
fn read_duration_line(reader: &mut dyn Read) -> std::io::Result<Option<String>> {
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    for _ in 0..=DURATION_LINE_INDEX {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            return Ok(None);
        }
    }
    let text = String::from_utf8_lossy(&line);
    Ok(Some(text.trim_end_matches(['\n', '\r']).to_string()))
}
