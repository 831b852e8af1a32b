use std::sync::atomic::{AtomicU64, Ordering};

use super::error::{HistogramError, ResolutionError, UnpackError};
use super::formula::MISSING_VALUE;
use super::histogram::{HistogramId, HistogramSpec};
use super::registry::HistogramRegistry;
use super::resolver::resolve_in_branch;
use super::schema::{Record, RecordSchema, RecordView, RecordViewMut};
use super::sync_cell::SynchronizedCell;

/// Numeric code carried by every buffer, selecting the event type that handles it
pub type EventCode = u16;

/// User logic turning raw buffer bytes into the event record.
///
/// The record is overwritten in place for every buffer; it is not reset in between, so an
/// unpacker that fills only part of the record should clear the rest itself.
pub trait Unpacker<R>: Send + Sync {
    fn unpack(&self, raw: &[u8], record: &mut R) -> Result<(), UnpackError>;

    /// Called instead of filling when `unpack` fails
    fn handle_bad_event(&self, error: &UnpackError) {
        spdlog::warn!("Bad event, histograms not filled: {error}");
    }
}

impl<R, F> Unpacker<R> for F
where
    F: Fn(&[u8], &mut R) -> Result<(), UnpackError> + Send + Sync,
{
    fn unpack(&self, raw: &[u8], record: &mut R) -> Result<(), UnpackError> {
        self(raw, record)
    }
}

/// Per-run counters of one event type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventStats {
    pub processed: u64,
    pub bad: u64,
}

/// An event type with its record type erased, as stored in the engine's event table
pub trait EventProcessor: Send + Sync {
    fn code(&self) -> EventCode;
    fn name(&self) -> &str;
    fn schema(&self) -> &'static RecordSchema;
    fn registry(&self) -> &HistogramRegistry;

    /// Reset the per-run counters
    fn begin_run(&self);
    fn stats(&self) -> EventStats;

    /// Unpack `raw` into the record and fill every histogram. Returns false for a bad event.
    fn process(&self, raw: &[u8]) -> bool;

    fn create_histogram(&self, spec: &HistogramSpec) -> Result<HistogramId, HistogramError>;

    /// Fill one histogram from the current record
    fn fill(&self, id: HistogramId) -> Result<usize, HistogramError>;

    fn read_variable(&self, path: &str) -> Result<f64, ResolutionError>;
    fn set_variable(&self, path: &str, value: f64) -> Result<(), ResolutionError>;
}

/// One event type: the live record behind its data lock, the unpacker, and the histograms
pub struct Event<R: Record> {
    code: EventCode,
    name: String,
    data: SynchronizedCell<R>,
    registry: HistogramRegistry,
    unpacker: Box<dyn Unpacker<R>>,
    processed: AtomicU64,
    bad: AtomicU64,
}

impl<R: Record> Event<R> {
    pub fn new(
        code: EventCode,
        name: &str,
        record: R,
        unpacker: Box<dyn Unpacker<R>>,
        growth_factor: f64,
    ) -> Self {
        Self {
            code,
            name: name.to_string(),
            data: SynchronizedCell::new(record),
            registry: HistogramRegistry::new(code, growth_factor),
            unpacker,
            processed: AtomicU64::new(0),
            bad: AtomicU64::new(0),
        }
    }

    pub fn data(&self) -> &SynchronizedCell<R> {
        &self.data
    }
}

impl<R: Record> EventProcessor for Event<R> {
    fn code(&self) -> EventCode {
        self.code
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn schema(&self) -> &'static RecordSchema {
        R::schema()
    }

    fn registry(&self) -> &HistogramRegistry {
        &self.registry
    }

    fn begin_run(&self) {
        self.processed.store(0, Ordering::Relaxed);
        self.bad.store(0, Ordering::Relaxed);
    }

    fn stats(&self) -> EventStats {
        EventStats {
            processed: self.processed.load(Ordering::Relaxed),
            bad: self.bad.load(Ordering::Relaxed),
        }
    }

    fn process(&self, raw: &[u8]) -> bool {
        let mut record = self.data.lock();
        match self.unpacker.unpack(raw, &mut record) {
            Ok(()) => {
                self.registry.fill_all(&RecordView::new(&*record));
                self.processed.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                self.unpacker.handle_bad_event(&e);
                self.bad.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    fn create_histogram(&self, spec: &HistogramSpec) -> Result<HistogramId, HistogramError> {
        self.registry.create(spec, &self.name, R::schema())
    }

    fn fill(&self, id: HistogramId) -> Result<usize, HistogramError> {
        let record = self.data.lock();
        self.registry.fill(id, &RecordView::new(&*record))
    }

    fn read_variable(&self, path: &str) -> Result<f64, ResolutionError> {
        let handle = resolve_in_branch(&self.name, R::schema(), path)?;
        let record = self.data.lock();
        Ok(handle
            .read(&RecordView::new(&*record))
            .unwrap_or(MISSING_VALUE))
    }

    fn set_variable(&self, path: &str, value: f64) -> Result<(), ResolutionError> {
        let handle = resolve_in_branch(&self.name, R::schema(), path)?;
        let mut record = self.data.lock();
        handle.write(&mut RecordViewMut::new(&mut *record), value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::histogram::Axis;

    #[derive(Debug, Default)]
    struct Pulse {
        height: u16,
        gain: f64,
    }
    crate::impl_record!(Pulse { height, gain });

    fn unpack_pulse(raw: &[u8], record: &mut Pulse) -> Result<(), UnpackError> {
        match raw {
            [lo, hi, ..] => {
                record.height = u16::from_le_bytes([*lo, *hi]);
                Ok(())
            }
            _ => Err(UnpackError::ShortBuffer {
                needed: 2,
                found: raw.len(),
            }),
        }
    }

    fn pulse_event() -> Event<Pulse> {
        Event::new(5, "pulse", Pulse::default(), Box::new(unpack_pulse), 2.0)
    }

    #[test]
    fn test_process_fills_histograms() {
        let event = pulse_event();
        let id = event
            .create_histogram(&HistogramSpec::d1(
                "height",
                "pulse.height",
                "",
                Axis::new(10, 0.0, 1000.0).unwrap(),
            ))
            .unwrap();
        assert!(event.process(&150u16.to_le_bytes()));
        assert!(event.process(&950u16.to_le_bytes()));
        assert!(!event.process(&[1]));
        let snap = event.registry().snapshot(id).unwrap();
        assert_eq!(snap.entries, 2);
        assert_eq!(snap.bin_content(&[2]), Some(1.0));
        assert_eq!(event.stats(), EventStats { processed: 2, bad: 1 });

        event.begin_run();
        assert_eq!(event.stats(), EventStats::default());
    }

    #[test]
    fn test_variables() {
        let event = pulse_event();
        event.set_variable("pulse.gain", 1.25).unwrap();
        assert_eq!(event.read_variable("gain").unwrap(), 1.25);
        assert_eq!(event.data().lock().gain, 1.25);
        assert!(event.read_variable("nosuch").is_err());
    }

    #[test]
    fn test_single_fill_uses_current_record() {
        let event = pulse_event();
        let id = event
            .create_histogram(&HistogramSpec::d1(
                "gain",
                "gain",
                "",
                Axis::new(4, 0.0, 4.0).unwrap(),
            ))
            .unwrap();
        event.set_variable("gain", 2.5).unwrap();
        assert_eq!(event.fill(id).unwrap(), 1);
        assert_eq!(event.registry().snapshot(id).unwrap().bin_content(&[3]), Some(1.0));
    }
}
