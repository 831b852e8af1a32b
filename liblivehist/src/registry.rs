use std::sync::atomic::{AtomicU64, Ordering};

use super::error::HistogramError;
use super::event::EventCode;
use super::histogram::{Histogram, HistogramId, HistogramSnapshot, HistogramSpec};
use super::schema::{RecordSchema, RecordView};
use super::sync_cell::SynchronizedCell;

const DEFAULT_NAME: &str = "hist";

/// The histograms of one event type, in creation order.
///
/// The set lock is held for every traversal, so a histogram either takes part in a whole
/// `fill_all` sweep or in none of it. Building a histogram (compiling formulas, allocating
/// bins) happens outside the set lock under a separate construction lock; only the name pick
/// and the insertion are done with the set held.
#[derive(Debug)]
pub struct HistogramRegistry {
    event: EventCode,
    growth_factor: f64,
    set: SynchronizedCell<Vec<Histogram>>,
    construction: SynchronizedCell<()>,
    next_serial: AtomicU64,
}

impl HistogramRegistry {
    pub fn new(event: EventCode, growth_factor: f64) -> Self {
        Self {
            event,
            growth_factor,
            set: SynchronizedCell::new(Vec::new()),
            construction: SynchronizedCell::new(()),
            next_serial: AtomicU64::new(0),
        }
    }

    /// Build a histogram and insert it. Nothing is inserted on failure.
    pub fn create(
        &self,
        spec: &HistogramSpec,
        branch: &str,
        schema: &'static RecordSchema,
    ) -> Result<HistogramId, HistogramError> {
        let _building = self.construction.lock();
        let id = HistogramId {
            event: self.event,
            serial: self.next_serial.fetch_add(1, Ordering::Relaxed),
        };
        let mut histogram = Histogram::new(id, spec, branch, schema, self.growth_factor)?;

        let requested = match spec.name.trim() {
            "" => DEFAULT_NAME,
            name => name,
        };
        let mut set = self.set.lock();
        let name = unique_name(&set, requested);
        if name != requested {
            spdlog::info!("The name {requested} is already in use, creating {name} instead.");
        }
        histogram.set_name(name);
        set.push(histogram);
        Ok(id)
    }

    /// Fill every histogram from a view borrowed out of the held data lock
    pub fn fill_all(&self, view: &RecordView<'_>) -> usize {
        let mut set = self.set.lock();
        set.iter_mut().map(|h| h.fill_unlocked(view)).sum()
    }

    pub fn fill(&self, id: HistogramId, view: &RecordView<'_>) -> Result<usize, HistogramError> {
        self.with_histogram(id, |h| h.fill_unlocked(view))
    }

    pub fn regate(&self, id: HistogramId, gate: &str) -> Result<(), HistogramError> {
        self.with_histogram(id, |h| h.regate(gate))??;
        Ok(())
    }

    pub fn clear(&self, id: HistogramId) -> Result<(), HistogramError> {
        self.with_histogram(id, |h| h.clear())
    }

    pub fn clear_all(&self) {
        self.set.lock().iter_mut().for_each(|h| h.clear());
    }

    pub fn snapshot(&self, id: HistogramId) -> Result<HistogramSnapshot, HistogramError> {
        self.with_histogram(id, |h| h.snapshot())
    }

    pub fn snapshots(&self) -> Vec<HistogramSnapshot> {
        self.set.lock().iter().map(|h| h.snapshot()).collect()
    }

    /// Remove the histogram from the set, then drop it once the set lock is released
    pub fn remove_and_destroy(&self, id: HistogramId) -> Result<(), HistogramError> {
        let removed = {
            let mut set = self.set.lock();
            let position = set
                .iter()
                .position(|h| h.id() == id)
                .ok_or(HistogramError::NotFound(id))?;
            set.remove(position)
        };
        drop(removed);
        Ok(())
    }

    pub fn delete_all(&self) {
        let removed = std::mem::take(&mut *self.set.lock());
        drop(removed);
    }

    pub fn find_by_name(&self, name: &str) -> Option<HistogramId> {
        self.set
            .lock()
            .iter()
            .find(|h| h.name() == name)
            .map(|h| h.id())
    }

    pub fn find_by_identity(&self, id: HistogramId) -> bool {
        self.set.lock().iter().any(|h| h.id() == id)
    }

    pub fn names(&self) -> Vec<String> {
        self.set.lock().iter().map(|h| h.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.set.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.lock().is_empty()
    }

    fn with_histogram<T>(
        &self,
        id: HistogramId,
        f: impl FnOnce(&mut Histogram) -> T,
    ) -> Result<T, HistogramError> {
        let mut set = self.set.lock();
        let histogram = set
            .iter_mut()
            .find(|h| h.id() == id)
            .ok_or(HistogramError::NotFound(id))?;
        Ok(f(histogram))
    }
}

impl Drop for HistogramRegistry {
    fn drop(&mut self) {
        self.set.get_mut().clear();
    }
}

fn unique_name(set: &[Histogram], requested: &str) -> String {
    let taken = |candidate: &str| set.iter().any(|h| h.name() == candidate);
    if !taken(requested) {
        return requested.to_string();
    }
    let mut n = 1;
    loop {
        let candidate = format!("{requested}_{n}");
        if !taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::histogram::Axis;
    use crate::schema::Record;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[derive(Debug, Default)]
    struct Counter {
        value: f64,
    }
    crate::impl_record!(Counter { value });

    fn spec(name: &str) -> HistogramSpec {
        HistogramSpec::d1(name, "value", "", Axis::new(10, 0.0, 10.0).unwrap())
    }

    #[test]
    fn test_unique_names() {
        let registry = HistogramRegistry::new(1, 2.0);
        let schema = Counter::schema();
        registry.create(&spec("h"), "c", schema).unwrap();
        registry.create(&spec("h"), "c", schema).unwrap();
        registry.create(&spec("h"), "c", schema).unwrap();
        registry.create(&spec(" "), "c", schema).unwrap();
        assert_eq!(registry.names(), vec!["h", "h_1", "h_2", "hist"]);
    }

    #[test]
    fn test_failed_create_inserts_nothing() {
        let registry = HistogramRegistry::new(1, 2.0);
        let bad = HistogramSpec::d1("bad", "missing", "", Axis::new(1, 0.0, 1.0).unwrap());
        assert!(registry.create(&bad, "c", Counter::schema()).is_err());
        assert!(registry.is_empty());
        assert!(registry.find_by_name("bad").is_none());
    }

    #[test]
    fn test_fill_lookup_remove() {
        let registry = HistogramRegistry::new(3, 2.0);
        let schema = Counter::schema();
        let a = registry.create(&spec("a"), "c", schema).unwrap();
        let b = registry.create(&spec("b"), "c", schema).unwrap();
        assert_eq!(a.event, 3);
        assert_ne!(a, b);

        let record = Counter { value: 4.0 };
        let view = RecordView::new(&record);
        assert_eq!(registry.fill_all(&view), 2);
        assert_eq!(registry.fill(b, &view).unwrap(), 1);
        assert_eq!(registry.snapshot(b).unwrap().entries, 2);

        registry.clear(b).unwrap();
        assert_eq!(registry.snapshot(b).unwrap().entries, 0);
        assert_eq!(registry.snapshot(a).unwrap().entries, 1);

        assert!(registry.regate(a, "value >").is_err());
        registry.regate(a, "value > 5").unwrap();
        assert_eq!(registry.fill_all(&view), 1);

        assert_eq!(registry.find_by_name("b"), Some(b));
        registry.remove_and_destroy(b).unwrap();
        assert!(!registry.find_by_identity(b));
        assert!(matches!(
            registry.remove_and_destroy(b),
            Err(HistogramError::NotFound(_))
        ));
        assert!(matches!(
            registry.fill(b, &view),
            Err(HistogramError::NotFound(_))
        ));
        registry.delete_all();
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_create_during_fill_all() {
        let registry = Arc::new(HistogramRegistry::new(1, 2.0));
        let data = Arc::new(SynchronizedCell::new(Counter { value: 1.0 }));
        let done = Arc::new(AtomicBool::new(false));

        let filler = {
            let registry = registry.clone();
            let data = data.clone();
            let done = done.clone();
            std::thread::spawn(move || {
                let mut sweeps = 0u64;
                while !done.load(Ordering::Relaxed) {
                    let record = data.lock();
                    registry.fill_all(&RecordView::new(&*record));
                    sweeps += 1;
                }
                sweeps
            })
        };

        for i in 0..50 {
            registry
                .create(&spec(&format!("h{i}")), "c", Counter::schema())
                .unwrap();
        }
        done.store(true, Ordering::Relaxed);
        let sweeps = filler.join().unwrap();

        let snapshots = registry.snapshots();
        assert_eq!(snapshots.len(), 50);
        let mut previous = u64::MAX;
        for snap in snapshots {
            // each histogram saw every sweep after its insertion and nothing else
            assert_eq!(snap.total(), snap.entries as f64);
            assert!(snap.entries <= sweeps);
            assert!(snap.entries <= previous);
            previous = snap.entries;
        }
    }
}
