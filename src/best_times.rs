use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BestTime {
    /// Race time in seconds.
    pub time: f32,
    /// Unix seconds when the time was set.
    pub timestamp: u64,
}

/// Finish times kept sorted fastest first and stored as pretty JSON.
#[derive(Debug, Clone)]
pub struct BestTimes {
    path: PathBuf,
    entries: Vec<BestTime>,
}

impl BestTimes {
    /// A missing file is an empty list.
    pub fn load(path: &Path) -> Result<Self> {
        let mut entries: Vec<BestTime> = if path.exists() {
            let file = File::open(path)
                .with_context(|| format!("Failed to open best times {}", path.display()))?;
            serde_json::from_reader(std::io::BufReader::new(file))
                .with_context(|| format!("Failed to parse best times {}", path.display()))?
        } else {
            Vec::new()
        };
        entries.sort_by(|a, b| a.time.total_cmp(&b.time));
        Ok(Self {
            path: path.to_path_buf(),
            entries,
        })
    }

    pub fn entries(&self) -> &[BestTime] {
        &self.entries
    }

    pub fn best(&self) -> Option<BestTime> {
        self.entries.first().copied()
    }

    /// Insert a time, write the file, and return its 0-based rank.
    pub fn record(&mut self, time: f32) -> Result<usize> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.insert(BestTime { time, timestamp })
    }

    pub fn insert(&mut self, entry: BestTime) -> Result<usize> {
        let rank = self.entries.partition_point(|e| e.time <= entry.time);
        self.entries.insert(rank, entry);
        self.save()?;
        Ok(rank)
    }

    fn save(&self) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_string_pretty(&self.entries)?;
        std::fs::write(&self.path, json)
            .with_context(|| format!("Failed to write best times {}", self.path.display()))
    }
}
