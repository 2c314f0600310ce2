//! CSV-backed dataset store.
//!
//! The file on disk is the only source of truth for what still needs work.
//! Results applied during a run live in an in-memory overlay keyed by
//! `videoID`; `flush()` streams the file, rewrites the enrichment cells of
//! every row whose id is in the overlay, and swaps the new file in with an
//! atomic rename. Other columns are copied through untouched.

mod lock;

pub use self::lock::StoreLock;

use crate::models::{
    Enrichment, EnrichmentFields, ENRICHMENT_COLUMNS, RowState, VIDEO_ID, parse_integer_text,
};
use anyhow::{Context, Result, anyhow};
use csv::ByteRecord;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

// ── Column layout ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Columns {
    video_id: usize,
    /// Index of each enrichment column, in `ENRICHMENT_COLUMNS` order.
    enrichment: [Option<usize>; 5],
}

impl Columns {
    fn locate(headers: &ByteRecord) -> Result<Self> {
        let position = |name: &str| {
            headers
                .iter()
                .position(|h| header_name(h) == name)
        };

        let video_id = position(VIDEO_ID)
            .with_context(|| format!("No {} column in header", VIDEO_ID))?;
        Ok(Self {
            video_id,
            enrichment: ENRICHMENT_COLUMNS.map(position),
        })
    }

    /// Append any missing enrichment column to `headers`.
    fn append_missing(&mut self, headers: &mut ByteRecord) -> usize {
        let mut added = 0;
        for (slot, name) in ENRICHMENT_COLUMNS.iter().enumerate() {
            if self.enrichment[slot].is_none() {
                self.enrichment[slot] = Some(headers.len());
                headers.push_field(name.as_bytes());
                added += 1;
            }
        }
        added
    }

    fn slot_of(&self, column: usize) -> Option<usize> {
        self.enrichment.iter().position(|c| *c == Some(column))
    }

    fn video_id<'r>(&self, record: &'r ByteRecord) -> Option<&'r str> {
        record
            .get(self.video_id)
            .and_then(|b| std::str::from_utf8(b).ok())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    fn cell<'r>(&self, record: &'r ByteRecord, slot: usize) -> Option<&'r str> {
        self.enrichment[slot]
            .and_then(|i| record.get(i))
            .and_then(|b| std::str::from_utf8(b).ok())
    }

    fn fields(&self, record: &ByteRecord) -> EnrichmentFields {
        EnrichmentFields::from_cells(
            self.cell(record, 0),
            self.cell(record, 1),
            self.cell(record, 2),
            self.cell(record, 3),
            self.cell(record, 4),
        )
    }
}

// ── Reports ───────────────────────────────────────────────────────────────────

/// One row as seen by a read-only visitor.
#[derive(Debug)]
pub struct RowView<'a> {
    pub video_id: Option<&'a str>,
    pub state: RowState,
    /// Raw enrichment cells, `""` where the column is missing.
    pub cells: [&'a str; 5],
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FlushReport {
    pub identifiers: usize,
    pub rows_updated: usize,
    pub rows_written: usize,
}

#[derive(Debug, Default)]
struct RewriteStats {
    rows: usize,
    edited: usize,
    edited_ids: HashSet<String>,
}

/// First-seen ordered set of identifiers.
#[derive(Debug, Default)]
struct OrderedIds {
    order: Vec<String>,
    seen: HashSet<String>,
}

impl OrderedIds {
    fn insert(&mut self, id: &str) {
        if !self.seen.contains(id) {
            self.seen.insert(id.to_string());
            self.order.push(id.to_string());
        }
    }

    fn merge(&mut self, other: OrderedIds) {
        for id in other.order {
            if self.seen.insert(id.clone()) {
                self.order.push(id);
            }
        }
    }
}

// ── Store ─────────────────────────────────────────────────────────────────────

pub struct DatasetStore {
    path: PathBuf,
    scan_window: usize,
    overlay: HashMap<String, Enrichment>,
}

impl DatasetStore {
    /// Open an existing CSV. A recovery file left by a failed flush is loaded
    /// back into the overlay so the next flush writes it.
    pub fn open(path: &Path, scan_window: usize) -> Result<Self> {
        if !path.is_file() {
            anyhow::bail!("Dataset not found: {:?}", path);
        }

        let mut store = Self {
            path: path.to_path_buf(),
            scan_window: scan_window.max(1),
            overlay: HashMap::new(),
        };

        // Fail early on a file without videoID.
        let mut reader = store.reader()?;
        let headers = reader
            .byte_headers()
            .with_context(|| format!("Failed to read header of {:?}", path))?;
        Columns::locate(headers)?;

        let recovery = store.recovery_path();
        if recovery.is_file() {
            let raw = std::fs::read_to_string(&recovery)
                .with_context(|| format!("Failed to read {:?}", recovery))?;
            let saved: HashMap<String, Enrichment> = serde_json::from_str(&raw)
                .with_context(|| format!("Corrupt recovery file {:?}", recovery))?;
            warn!(
                "Loaded {} unflushed results from {:?}; they will be written on the next flush",
                saved.len(),
                recovery
            );
            store.overlay.extend(saved);
        }

        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sidecar written when a flush fails: `<store>.recovery.json`.
    pub fn recovery_path(&self) -> PathBuf {
        sidecar(&self.path, "recovery.json")
    }

    /// Identifiers with an applied but unflushed result.
    pub fn unflushed(&self) -> usize {
        self.overlay.len()
    }

    fn reader(&self) -> Result<csv::Reader<std::fs::File>> {
        csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(&self.path)
            .with_context(|| format!("Failed to open {:?}", self.path))
    }

    /// Feed the file to `on_window` in chunks of at most `scan_window` records.
    fn for_each_window(
        &self,
        mut on_window: impl FnMut(&Columns, &[ByteRecord]) -> Result<()>,
    ) -> Result<usize> {
        let mut reader = self.reader()?;
        let headers = reader
            .byte_headers()
            .with_context(|| format!("Failed to read header of {:?}", self.path))?
            .clone();
        let cols = Columns::locate(&headers)?;

        let mut window = Vec::with_capacity(self.scan_window.min(8_192));
        let mut record = ByteRecord::new();
        let mut rows = 0usize;
        let mut windows = 0usize;

        loop {
            let more = reader
                .read_byte_record(&mut record)
                .with_context(|| format!("Malformed record after row {} in {:?}", rows, self.path))?;
            if more {
                window.push(record.clone());
                rows += 1;
            }
            if window.len() == self.scan_window || (!more && !window.is_empty()) {
                on_window(&cols, &window)?;
                window.clear();
                windows += 1;
                if windows % 2 == 0 {
                    debug!("Scanned window {} ({} rows)", windows, rows);
                }
            }
            if !more {
                break;
            }
        }

        Ok(rows)
    }

    fn state_of(&self, cols: &Columns, record: &ByteRecord) -> RowState {
        let applied = cols.video_id(record).and_then(|id| self.overlay.get(id));
        match applied {
            Some(Enrichment::Resolved(stats)) => RowState::Resolved(stats.clone()),
            Some(Enrichment::Unavailable) => RowState::Failed,
            None => cols.fields(record).state(),
        }
    }

    /// Distinct identifiers with at least one incomplete row, in file order.
    pub fn scan_pending(&self) -> Result<Vec<String>> {
        let mut pending = OrderedIds::default();

        let rows = self.for_each_window(|cols, window| {
            let mut local = OrderedIds::default();
            for record in window {
                let Some(id) = cols.video_id(record) else { continue };
                if !self.state_of(cols, record).is_complete() {
                    local.insert(id);
                }
            }
            pending.merge(local);
            Ok(())
        })?;

        info!(
            "Scanned {} rows: {} identifiers pending",
            rows,
            pending.order.len()
        );
        Ok(pending.order)
    }

    /// Visit every row read-only, with the overlay taken into account.
    pub fn visit_rows(&self, mut visit: impl FnMut(&RowView<'_>)) -> Result<usize> {
        self.for_each_window(|cols, window| {
            for record in window {
                let cells = [0, 1, 2, 3, 4].map(|slot| cols.cell(record, slot).unwrap_or(""));
                visit(&RowView {
                    video_id: cols.video_id(record),
                    state: self.state_of(cols, record),
                    cells,
                });
            }
            Ok(())
        })
    }

    /// Record the outcome for `video_id`; applies to every row with that id on the next flush.
    pub fn apply(&mut self, video_id: &str, enrichment: Enrichment) {
        self.overlay.insert(video_id.to_string(), enrichment);
    }

    /// Write all applied results to disk and clear the overlay.
    pub fn flush(&mut self) -> Result<FlushReport> {
        if self.overlay.is_empty() {
            return Ok(FlushReport::default());
        }

        let overlay = &self.overlay;
        let stats = self.rewrite(|id, _| {
            id.and_then(|id| overlay.get(id))
                .map(|e| e.to_cells().map(String::into_bytes))
        })?;

        let orphaned = overlay.len() - stats.edited_ids.len();
        if orphaned > 0 {
            warn!("{} applied identifiers matched no row", orphaned);
        }

        let report = FlushReport {
            identifiers: self.overlay.len(),
            rows_updated: stats.edited,
            rows_written: stats.rows,
        };
        self.overlay.clear();

        let recovery = self.recovery_path();
        if recovery.exists() {
            std::fs::remove_file(&recovery)
                .with_context(|| format!("Failed to remove {:?}", recovery))?;
        }

        debug!("Flushed {:?}: {:?}", self.path, report);
        Ok(report)
    }

    /// Persist the overlay next to the store after a failed flush.
    pub fn save_recovery(&self) -> Result<PathBuf> {
        let recovery = self.recovery_path();
        let json = serde_json::to_string_pretty(&self.overlay)?;

        let mut tmp = NamedTempFile::new_in(parent_dir(&self.path))?;
        std::io::Write::write_all(&mut tmp, json.as_bytes())?;
        tmp.persist(&recovery)
            .map_err(|e| e.error)
            .with_context(|| format!("Failed to write {:?}", recovery))?;
        Ok(recovery)
    }

    /// Rewrite float-formatted counts (`"1234.0"`) as integers. Returns rows changed.
    pub fn normalize_counts(&self) -> Result<usize> {
        const COUNT_SLOTS: [usize; 3] = [1, 3, 4];

        let stats = self.rewrite(|_, cells| {
            let mut changed = false;
            let out = [0, 1, 2, 3, 4].map(|slot| {
                let raw = String::from_utf8_lossy(cells[slot]);
                let trimmed = raw.trim();
                if COUNT_SLOTS.contains(&slot) && trimmed.contains('.') {
                    let fixed = match trimmed {
                        "-1.0" => Some("-1".to_string()),
                        t => parse_integer_text(t).map(|n| n.to_string()),
                    };
                    if let Some(fixed) = fixed {
                        changed = true;
                        return fixed.into_bytes();
                    }
                }
                cells[slot].to_vec()
            });
            changed.then_some(out)
        })?;

        Ok(stats.edited)
    }

    /// Stream the store into a replacement file, swapping enrichment cells
    /// where `edit` returns `Some`. `edit` sees every row, with `None` for rows
    /// without a videoID.
    fn rewrite<F>(&self, mut edit: F) -> Result<RewriteStats>
    where
        F: FnMut(Option<&str>, [&[u8]; 5]) -> Option<[Vec<u8>; 5]>,
    {
        let mut reader = self.reader()?;
        let mut headers = reader
            .byte_headers()
            .with_context(|| format!("Failed to read header of {:?}", self.path))?
            .clone();
        let mut cols = Columns::locate(&headers)?;
        let added = cols.append_missing(&mut headers);
        if added > 0 {
            info!("Adding {} missing enrichment column(s)", added);
        }

        let mut stats = RewriteStats::default();
        replace_atomically(&self.path, |writer| {
            writer.write_byte_record(&headers)?;

            let mut record = ByteRecord::new();
            let mut out = ByteRecord::new();
            while reader
                .read_byte_record(&mut record)
                .with_context(|| format!("Malformed record after row {} in {:?}", stats.rows, self.path))?
            {
                let current = [0, 1, 2, 3, 4].map(|slot| {
                    cols.enrichment[slot]
                        .and_then(|i| record.get(i))
                        .unwrap_or_default()
                });
                let id = cols.video_id(&record);
                let replacement = edit(id, current);

                out.clear();
                for i in 0..headers.len().max(record.len()) {
                    match (&replacement, cols.slot_of(i)) {
                        (Some(cells), Some(slot)) => out.push_field(&cells[slot]),
                        _ => out.push_field(record.get(i).unwrap_or_default()),
                    }
                }
                writer.write_byte_record(&out)?;

                stats.rows += 1;
                if replacement.is_some() {
                    stats.edited += 1;
                    if let Some(id) = id {
                        stats.edited_ids.insert(id.to_string());
                    }
                }
            }
            Ok(())
        })?;

        Ok(stats)
    }
}

/// Header cell as compared against column names. Spreadsheet exports put a
/// BOM in front of the first one.
fn header_name(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .trim_start_matches('\u{feff}')
        .trim()
        .to_string()
}

/// Write a replacement for `path` into a temp file in the same directory,
/// sync it and rename it over `path`. On any error the temp file is removed
/// and `path` is left as it was.
fn replace_atomically<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut csv::Writer<NamedTempFile>) -> Result<()>,
{
    let tmp = NamedTempFile::new_in(parent_dir(path))
        .context("Failed to create temporary file for flush")?;
    let mut writer = csv::WriterBuilder::new().flexible(true).from_writer(tmp);
    write(&mut writer)?;

    let tmp = writer
        .into_inner()
        .map_err(|e| anyhow!("Failed to finish writing {:?}: {}", path, e.error()))?;
    tmp.as_file()
        .sync_all()
        .context("Failed to sync temporary file")?;
    tmp.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("Failed to replace {:?}", path))?;
    Ok(())
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

/// `data/all.csv` + `lock` → `data/all.csv.lock`
fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
