use fxhash::FxHashMap;
use std::sync::Arc;

use super::event::{EventCode, EventProcessor};

/// The table of registered event types, keyed by event code
pub type EventTable = FxHashMap<EventCode, Arc<dyn EventProcessor>>;

/// Routes raw buffers to the event type named by their event code.
///
/// Runs on the acquisition thread. It only ever takes the data lock and then the set lock of
/// one event type, never anything owned by the foreground.
#[derive(Clone)]
pub struct EventDispatcher {
    events: Arc<EventTable>,
}

impl EventDispatcher {
    pub fn new(events: Arc<EventTable>) -> Self {
        Self { events }
    }

    /// Unpack and fill. False for an unknown code or a bad event.
    pub fn dispatch(&self, code: EventCode, raw: &[u8]) -> bool {
        match self.events.get(&code) {
            Some(event) => event.process(raw),
            None => {
                spdlog::warn!("Received buffer with unknown event code {code}, skipping.");
                false
            }
        }
    }

    /// Reset the per-run state of every event type
    pub fn begin_run(&self) {
        for event in self.events.values() {
            event.begin_run();
        }
    }

    pub fn events(&self) -> &EventTable {
        &self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UnpackError;
    use crate::event::Event;
    use crate::histogram::{Axis, HistogramSpec};

    #[derive(Debug, Default)]
    struct Word {
        value: u32,
    }
    crate::impl_record!(Word { value });

    fn unpack_word(raw: &[u8], record: &mut Word) -> Result<(), UnpackError> {
        let bytes: [u8; 4] = raw
            .get(..4)
            .and_then(|b| b.try_into().ok())
            .ok_or(UnpackError::ShortBuffer {
                needed: 4,
                found: raw.len(),
            })?;
        record.value = u32::from_le_bytes(bytes);
        Ok(())
    }

    #[test]
    fn test_dispatch_routes_by_code() {
        let first = Arc::new(Event::new(1, "a", Word::default(), Box::new(unpack_word), 2.0));
        let second = Arc::new(Event::new(2, "b", Word::default(), Box::new(unpack_word), 2.0));
        let axis = Axis::new(8, 0.0, 8.0).unwrap();
        let id = second
            .create_histogram(&HistogramSpec::d1("v", "value", "", axis))
            .unwrap();

        let mut table = EventTable::default();
        table.insert(1, first.clone() as Arc<dyn EventProcessor>);
        table.insert(2, second.clone() as Arc<dyn EventProcessor>);
        let dispatcher = EventDispatcher::new(Arc::new(table));

        assert!(dispatcher.dispatch(2, &3u32.to_le_bytes()));
        assert!(dispatcher.dispatch(1, &5u32.to_le_bytes()));
        assert!(!dispatcher.dispatch(2, &[0, 1]));
        assert!(!dispatcher.dispatch(9, &[0, 0, 0, 0]));

        assert_eq!(first.data().lock().value, 5);
        assert_eq!(second.registry().snapshot(id).unwrap().entries, 1);
        assert_eq!(second.stats().bad, 1);

        dispatcher.begin_run();
        assert_eq!(second.stats().processed, 0);
    }
}
