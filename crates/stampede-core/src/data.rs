//! Shared tabular data providers. A provider loads one file exactly once and
//! hands rows out to virtual users in `next` (round-robin), `unique`
//! (partitioned), or `random` mode. Exhaustion is a signaled condition, not
//! an error.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rand::Rng;

use crate::error::EngineError;
use crate::plan::model::DataBinding;

// ---------------------------------------------------------------------------
// RowOutcome
// ---------------------------------------------------------------------------

/// The outcome of a row fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum RowOutcome {
    Row(HashMap<String, String>),
    /// The pool is spent and the binding does not cycle. The caller stops the
    /// affected virtual user gracefully.
    Exhausted,
}

impl RowOutcome {
    pub fn into_row(self) -> Option<HashMap<String, String>> {
        match self {
            RowOutcome::Row(row) => Some(row),
            RowOutcome::Exhausted => None,
        }
    }
}

// ---------------------------------------------------------------------------
// DataProvider
// ---------------------------------------------------------------------------

/// One loaded tabular data source, shared read-only across all virtual users.
///
/// Cursor state is internal: an atomic round-robin index for `next`, a global
/// slot counter plus per-VU assignment map for `unique`.
pub struct DataProvider {
    path: PathBuf,
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
    cycle_on_exhaustion: bool,
    next_index: AtomicUsize,
    unique_next: AtomicUsize,
    /// vu_id → number of unique rows handed to that user. Kept for
    /// diagnostics and the disjointness guarantee's tests.
    unique_assignments: Mutex<HashMap<u32, usize>>,
}

impl DataProvider {
    /// Load a provider from `binding.file`. Reads the file once; delimiter is
    /// auto-detected from `,`, `;`, `\t` when the binding does not fix one.
    /// Column names may be remapped through `binding.variables`.
    pub fn load(binding: &DataBinding) -> Result<Self, EngineError> {
        let content = std::fs::read_to_string(&binding.file).map_err(|e| {
            EngineError::Config(format!(
                "cannot read data file {}: {e}",
                binding.file.display()
            ))
        })?;
        Self::from_content(&binding.file, &content, binding)
    }

    /// Parse CSV content directly; used by `load` and by tests.
    pub fn from_content(
        path: &Path,
        content: &str,
        binding: &DataBinding,
    ) -> Result<Self, EngineError> {
        let delimiter = match binding.delimiter {
            Some(c) => c as u8,
            None => detect_delimiter(content),
        };

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(true)
            .flexible(true)
            .from_reader(content.as_bytes());

        let headers = reader
            .headers()
            .map_err(|e| EngineError::Config(format!("failed to read CSV headers: {e}")))?
            .iter()
            .map(|h| h.trim().to_string())
            .collect::<Vec<_>>();

        if headers.is_empty() {
            return Err(EngineError::Config(format!(
                "data file {} has no columns",
                path.display()
            )));
        }

        // Apply the column → variable remap; unlisted columns keep their name.
        let columns: Vec<String> = headers
            .iter()
            .map(|h| binding.variables.get(h).cloned().unwrap_or_else(|| h.clone()))
            .collect();

        let mut rows = Vec::new();
        for record in reader.records() {
            let record =
                record.map_err(|e| EngineError::Config(format!("failed to read CSV row: {e}")))?;
            rows.push(record.iter().map(|f| f.to_string()).collect());
        }

        if rows.is_empty() {
            return Err(EngineError::Config(format!(
                "data file {} has no data rows",
                path.display()
            )));
        }

        Ok(Self {
            path: path.to_path_buf(),
            columns,
            rows,
            cycle_on_exhaustion: binding.cycle_on_exhaustion,
            next_index: AtomicUsize::new(0),
            unique_next: AtomicUsize::new(0),
            unique_assignments: Mutex::new(HashMap::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Round-robin fetch shared by all callers. Wraps when the binding
    /// cycles, signals exhaustion otherwise.
    pub fn next_row(&self, _vu_id: u32) -> RowOutcome {
        let idx = self.next_index.fetch_add(1, Ordering::Relaxed);
        if self.cycle_on_exhaustion {
            self.row_at(idx % self.rows.len())
        } else if idx < self.rows.len() {
            self.row_at(idx)
        } else {
            RowOutcome::Exhausted
        }
    }

    /// Claim a globally unique slot for `vu_id`. Two distinct users never
    /// observe the same row until the pool is exhausted; after that the
    /// cursor either wraps (cycling) or signals exhaustion.
    pub fn unique_row(&self, vu_id: u32) -> RowOutcome {
        let slot = self.unique_next.fetch_add(1, Ordering::Relaxed);
        if slot >= self.rows.len() && !self.cycle_on_exhaustion {
            return RowOutcome::Exhausted;
        }
        {
            let mut assignments = self.unique_assignments.lock().expect("assignments poisoned");
            *assignments.entry(vu_id).or_insert(0) += 1;
        }
        self.row_at(slot % self.rows.len())
    }

    /// Uniformly random row; never exhausts.
    pub fn random_row(&self, _vu_id: u32) -> RowOutcome {
        let idx = rand::thread_rng().gen_range(0..self.rows.len());
        self.row_at(idx)
    }

    /// Fetch one row according to the binding mode.
    pub fn fetch(&self, mode: crate::plan::model::DataMode, vu_id: u32) -> RowOutcome {
        use crate::plan::model::DataMode;
        match mode {
            DataMode::Next => self.next_row(vu_id),
            DataMode::Unique => self.unique_row(vu_id),
            DataMode::Random => self.random_row(vu_id),
        }
    }

    /// First row whose `column` equals `value`; random among matches when
    /// `randomize` is set. Used by the csv template placeholder's filter.
    pub fn filtered_row(&self, column: &str, value: &str, randomize: bool) -> Option<HashMap<String, String>> {
        let col_idx = self.columns.iter().position(|c| c == column)?;
        let matches: Vec<usize> = self
            .rows
            .iter()
            .enumerate()
            .filter(|(_, row)| row.get(col_idx).map(String::as_str) == Some(value))
            .map(|(i, _)| i)
            .collect();
        if matches.is_empty() {
            return None;
        }
        let pick = if randomize {
            matches[rand::thread_rng().gen_range(0..matches.len())]
        } else {
            matches[0]
        };
        self.row_at(pick).into_row()
    }

    /// Number of unique rows handed to each VU so far.
    pub fn unique_counts(&self) -> HashMap<u32, usize> {
        self.unique_assignments
            .lock()
            .expect("assignments poisoned")
            .clone()
    }

    fn row_at(&self, idx: usize) -> RowOutcome {
        let row = &self.rows[idx];
        let mut map = HashMap::with_capacity(self.columns.len());
        for (column, cell) in self.columns.iter().zip(row.iter()) {
            map.insert(column.clone(), cell.clone());
        }
        RowOutcome::Row(map)
    }
}

/// Pick the delimiter that splits the header line into the most fields.
fn detect_delimiter(content: &str) -> u8 {
    let header = content.lines().next().unwrap_or("");
    let candidates = [b',', b';', b'\t'];
    let mut best = b',';
    let mut best_count = 0;
    for &cand in &candidates {
        let count = header.matches(cand as char).count();
        if count > best_count {
            best = cand;
            best_count = count;
        }
    }
    best
}

// ---------------------------------------------------------------------------
// DataRegistry
// ---------------------------------------------------------------------------

/// Process-wide registry of data providers, one per canonical file path.
/// Construction happens under the registry lock; rows are then shared
/// read-only.
#[derive(Default)]
pub struct DataRegistry {
    providers: Mutex<HashMap<PathBuf, Arc<DataProvider>>>,
}

impl DataRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the provider for `binding.file`, loading it on first use.
    /// Subsequent calls for the same canonical path reuse the loaded
    /// provider; the first binding's options win.
    pub fn get_or_load(&self, binding: &DataBinding) -> Result<Arc<DataProvider>, EngineError> {
        let key = binding
            .file
            .canonicalize()
            .unwrap_or_else(|_| binding.file.clone());
        let mut providers = self.providers.lock().expect("registry poisoned");
        if let Some(provider) = providers.get(&key) {
            return Ok(Arc::clone(provider));
        }
        let provider = Arc::new(DataProvider::load(binding)?);
        providers.insert(key, Arc::clone(&provider));
        Ok(provider)
    }

    /// Look up an already-loaded provider by (possibly relative) path.
    pub fn get(&self, path: &Path) -> Option<Arc<DataProvider>> {
        let key = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        self.providers
            .lock()
            .expect("registry poisoned")
            .get(&key)
            .cloned()
    }

    /// Drop all loaded providers (between runs).
    pub fn clear(&self) {
        self.providers.lock().expect("registry poisoned").clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
