//! Read-only progress report over a dataset: how many rows and videos are
//! complete (resolved or marked unavailable) and how many still need work.

use crate::models::RowState;
use crate::store::DatasetStore;
use crate::utils::{fmt_number, pct};
use anyhow::Result;
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRow {
    pub video_id: String,
    pub cells: [String; 5],
}

#[derive(Debug, Default)]
pub struct StatusReport {
    pub rows: usize,
    pub rows_resolved: usize,
    pub rows_failed: usize,
    pub rows_pending: usize,
    pub rows_without_id: usize,
    pub videos: usize,
    pub videos_pending: usize,
    pub sample: Vec<PendingRow>,
}

impl StatusReport {
    pub fn collect(store: &DatasetStore, sample: usize) -> Result<Self> {
        let mut report = Self::default();
        let mut videos = HashSet::new();
        let mut pending = HashSet::new();

        let rows = store.visit_rows(|row| {
            let Some(id) = row.video_id else {
                report.rows_without_id += 1;
                return;
            };
            if !videos.contains(id) {
                videos.insert(id.to_string());
            }

            match &row.state {
                RowState::Resolved(_) => report.rows_resolved += 1,
                RowState::Failed => report.rows_failed += 1,
                RowState::Pending => {
                    report.rows_pending += 1;
                    if !pending.contains(id) {
                        pending.insert(id.to_string());
                    }
                    if report.sample.len() < sample {
                        report.sample.push(PendingRow {
                            video_id: id.to_string(),
                            cells: row.cells.map(str::to_string),
                        });
                    }
                }
            }
        })?;

        report.rows = rows;
        report.videos = videos.len();
        report.videos_pending = pending.len();
        Ok(report)
    }

    pub fn is_complete(&self) -> bool {
        self.videos_pending == 0
    }

    pub fn print(&self) {
        let complete = self.videos - self.videos_pending;
        println!("─────────────────────────────────────────");
        println!("  Enrichment status");
        println!("─────────────────────────────────────────");
        println!("  Rows              : {}", fmt_number(self.rows as i64));
        println!("    resolved        : {}", fmt_number(self.rows_resolved as i64));
        println!("    unavailable     : {}", fmt_number(self.rows_failed as i64));
        println!("    pending         : {}", fmt_number(self.rows_pending as i64));
        if self.rows_without_id > 0 {
            println!("    no videoID      : {}", fmt_number(self.rows_without_id as i64));
        }
        println!("  Videos            : {}", fmt_number(self.videos as i64));
        println!("    complete        : {}", fmt_number(complete as i64));
        println!("    pending         : {}", fmt_number(self.videos_pending as i64));
        println!("  Progress          : {:.1}%", pct(complete, self.videos));
        println!("─────────────────────────────────────────");

        if !self.sample.is_empty() {
            println!("  Sample of pending rows (videoID | channelID | Views | Published | likes | comments):");
            for row in &self.sample {
                println!("    {} | {}", row.video_id, row.cells.join(" | "));
            }
            println!("─────────────────────────────────────────");
        }
    }
}
