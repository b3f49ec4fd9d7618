//! # Historian — bounded time-series capture of selected tags
//!
//! Snapshots a configured tag set from the shared SCADA tag table into a
//! capacity-bounded ring buffer with monotonic simulation timestamps.
//! Oldest points are dropped on overflow; nothing persists across a
//! simulator restart.

use crate::scada::{TagDb, TagQuality};
use crate::scan::ScanContext;
use gridforge_core::{CoreResult, MemKey, MemValue};
use std::collections::VecDeque;
use tracing::debug;

pub const IR_POINTS_LO: MemKey = MemKey::input(0);
pub const IR_POINTS_HI: MemKey = MemKey::input(1);
pub const IR_DROPPED_LO: MemKey = MemKey::input(2);
pub const IR_BUFFER_FILL_PCT: MemKey = MemKey::input(3);

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DataPoint {
    pub tag_name: String,
    pub timestamp: f64,
    pub value: f64,
    pub quality: TagQuality,
}

pub struct HistorianLogic {
    device: String,
    db: std::sync::Arc<TagDb>,
    /// Tags to record; empty means record everything in the table.
    recorded_tags: Vec<String>,
    buffer: VecDeque<DataPoint>,
    capacity: usize,
    total_collected: u64,
    total_dropped: u64,
    last_timestamp: f64,
}

impl HistorianLogic {
    pub fn new(device: &str, db: std::sync::Arc<TagDb>, capacity: usize) -> Self {
        Self {
            device: device.to_string(),
            db,
            recorded_tags: Vec::new(),
            buffer: VecDeque::with_capacity(capacity.min(4096)),
            capacity: capacity.max(16),
            total_collected: 0,
            total_dropped: 0,
            last_timestamp: f64::NEG_INFINITY,
        }
    }

    pub fn device_name(&self) -> &str {
        &self.device
    }

    pub fn record_tag(&mut self, tag: &str) {
        self.recorded_tags.push(tag.to_string());
    }

    pub fn point_count(&self) -> usize {
        self.buffer.len()
    }

    pub fn total_collected(&self) -> u64 {
        self.total_collected
    }

    pub fn total_dropped(&self) -> u64 {
        self.total_dropped
    }

    /// Points for one tag inside `[from, to]`, oldest first.
    pub fn series(&self, tag: &str, from: f64, to: f64) -> Vec<DataPoint> {
        self.buffer
            .iter()
            .filter(|p| p.tag_name == tag && p.timestamp >= from && p.timestamp <= to)
            .cloned()
            .collect()
    }

    pub fn latest(&self, tag: &str) -> Option<&DataPoint> {
        self.buffer.iter().rev().find(|p| p.tag_name == tag)
    }

    fn push(&mut self, point: DataPoint) {
        if self.buffer.len() >= self.capacity {
            self.buffer.pop_front();
            self.total_dropped += 1;
        }
        self.buffer.push_back(point);
        self.total_collected += 1;
    }

    pub fn scan(&mut self, ctx: &ScanContext) -> CoreResult<()> {
        ctx.fabric.read_bulk(&self.device)?;

        // Timestamps are monotonic: one collection per scan instant.
        if ctx.now <= self.last_timestamp {
            return Ok(());
        }
        self.last_timestamp = ctx.now;

        let tags: Vec<String> = if self.recorded_tags.is_empty() {
            self.db.tag_names()
        } else {
            self.recorded_tags.clone()
        };
        for tag in &tags {
            if let Some(sample) = self.db.get(tag) {
                self.push(DataPoint {
                    tag_name: tag.clone(),
                    timestamp: ctx.now,
                    value: sample.value,
                    quality: sample.quality,
                });
            }
        }
        debug!(
            device = %self.device,
            points = self.buffer.len(),
            "Historian collection"
        );

        let fill = (self.buffer.len() * 100 / self.capacity) as u16;
        ctx.fabric.write_bulk(
            &self.device,
            &[
                (IR_POINTS_LO, MemValue::Word(self.total_collected as u16)),
                (
                    IR_POINTS_HI,
                    MemValue::Word((self.total_collected >> 16) as u16),
                ),
                (
                    IR_DROPPED_LO,
                    MemValue::Word(self.total_dropped.min(u16::MAX as u64) as u16),
                ),
                (IR_BUFFER_FILL_PCT, MemValue::Word(fill)),
            ],
        )
    }
}
