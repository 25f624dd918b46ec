use std::fmt::Write;

use crate::update::UpdateMeta;

const HEADER: &str = "id,mode,width,height,queue_time,dequeue_time,generate_times,vsync_times\n";

/// Accumulates one CSV row per vsync hand-off. List-valued fields are
/// colon-separated microsecond timestamps.
#[derive(Default)]
pub(crate) struct PerfReport {
    rows: String,
}

impl PerfReport {
    pub fn record(&mut self, meta: &UpdateMeta) {
        let Some(timing) = &meta.timing else {
            return;
        };

        let _ = writeln!(
            self.rows,
            "{},{},{},{},{},{},{},{}",
            join_ids(&meta.ids),
            meta.mode,
            meta.region.width,
            meta.region.height,
            timing.queue,
            timing.dequeue,
            join_times(&timing.generate),
            join_times(&timing.vsync),
        );
    }

    pub fn render(&self) -> String {
        let mut report = String::with_capacity(HEADER.len() + self.rows.len());
        report.push_str(HEADER);
        report.push_str(&self.rows);
        report
    }
}

fn join_ids(ids: &[u64]) -> String {
    join(ids.iter())
}

fn join_times(times: &[u64]) -> String {
    join(times.iter())
}

fn join<'a>(values: impl Iterator<Item = &'a u64>) -> String {
    values
        .map(|value| value.to_string())
        .collect::<Vec<_>>()
        .join(":")
}
