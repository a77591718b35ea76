//! The Logger hook (§6): buffers every [`StateInfo`] record emitted by a
//! running simulation and flushes it to CSV. Grounds the teacher's
//! `Logger`/`write_csv` pattern (`new_core.rs`), generalised from the
//! teacher's fixed event-log schema to `StateInfo`'s resource/state/activity
//! shape.

use std::fs::File;
use std::path::Path;

use crate::error::SimResult;
use crate::state::StateInfo;

/// An in-memory log of every state transition, in emission order.
#[derive(Default)]
pub struct Logger {
    records: Vec<StateInfo>,
}

impl Logger {
    pub fn new() -> Self {
        Logger::default()
    }

    pub fn record(&mut self, info: StateInfo) {
        self.records.push(info);
    }

    pub fn records(&self) -> &[StateInfo] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Writes every record as one CSV row, columns in `StateInfo` field
    /// order, matching the teacher's `File::create` + `csv::WriterBuilder`
    /// flush.
    pub fn write_csv(&self, path: impl AsRef<Path>) -> SimResult<()> {
        let file = File::create(path)?;
        let mut writer = csv::WriterBuilder::new().has_headers(true).from_writer(file);
        for record in &self.records {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(activity: &str, t: f64) -> StateInfo {
        StateInfo {
            resource_id: "R1".into(),
            state_id: "S1".into(),
            event_time: t,
            activity: activity.into(),
            product_id: None,
            state_type: "ProductionState".into(),
            target_id: None,
            origin_id: None,
            empty_transport: None,
        }
    }

    #[test]
    fn records_accumulate_in_emission_order() {
        let mut log = Logger::new();
        log.record(sample("start state", 0.0));
        log.record(sample("end state", 5.0));
        assert_eq!(log.len(), 2);
        assert_eq!(log.records()[1].event_time, 5.0);
    }

    #[test]
    fn write_csv_round_trips_through_a_temp_file() {
        let mut log = Logger::new();
        log.record(sample("start state", 1.0));
        let dir = std::env::temp_dir().join(format!("prodsim_logger_test_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("log.csv");
        log.write_csv(&path).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("start state"));
        std::fs::remove_file(&path).ok();
    }
}
