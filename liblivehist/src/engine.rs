use std::path::Path;
use std::sync::mpsc::Sender;
use std::sync::Arc;

use super::attach::{AttachmentController, AttachmentState};
use super::config::Config;
use super::dispatcher::{EventDispatcher, EventTable};
use super::error::{AttachError, EngineError};
use super::event::{Event, EventCode, EventProcessor, EventStats, Unpacker};
use super::framed::FramedSource;
use super::histogram::{HistogramId, HistogramSnapshot, HistogramSpec};
use super::schema::Record;
use super::source::{BufferSource, SourceFactory};
use super::status::{AttachStatus, StatusReporter};

/// Collects event types and options before the engine starts.
///
/// The set of event types is fixed once [`EngineBuilder::build`] is called.
pub struct EngineBuilder {
    config: Config,
    events: EventTable,
    factory: Option<SourceFactory>,
    status: Option<Sender<AttachStatus>>,
}

impl EngineBuilder {
    /// Register an event type. The record starts out as `R::default()`. Registering the same
    /// code twice keeps the last registration.
    pub fn event<R, U>(mut self, code: EventCode, name: &str, unpacker: U) -> Self
    where
        R: Record + Default,
        U: Unpacker<R> + 'static,
    {
        let event = Event::new(
            code,
            name,
            R::default(),
            Box::new(unpacker),
            self.config.scaler_growth_factor,
        );
        if self.events.insert(code, Arc::new(event)).is_some() {
            spdlog::warn!("Event code {code} registered twice, keeping {name}.");
        }
        self
    }

    /// Replace the default framed source
    pub fn source_factory(mut self, factory: SourceFactory) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn status_sender(mut self, tx: Sender<AttachStatus>) -> Self {
        self.status = Some(tx);
        self
    }

    pub fn build(self) -> Engine {
        if !self.config.is_growth_factor_valid() {
            spdlog::warn!(
                "Scaler growth factor {} does not grow; scalers will grow by one bin at a time.",
                self.config.scaler_growth_factor
            );
        }
        let factory = self.factory.unwrap_or_else(|| {
            let max_buffer_bytes = self.config.max_buffer_bytes;
            let poll_interval = self.config.poll_interval();
            let connect_timeout = self.config.connect_timeout();
            Arc::new(move || {
                Box::new(
                    FramedSource::new(max_buffer_bytes)
                        .with_poll_interval(poll_interval)
                        .with_connect_timeout(connect_timeout),
                ) as Box<dyn BufferSource>
            })
        });
        let dispatcher = EventDispatcher::new(Arc::new(self.events));
        let controller = AttachmentController::new(
            dispatcher.clone(),
            factory,
            StatusReporter::new(self.status),
            &self.config,
        );
        spdlog::info!(
            "Engine ready with {} event type(s).",
            dispatcher.events().len()
        );
        Engine {
            config: self.config,
            dispatcher,
            controller,
        }
    }
}

/// The histogramming engine: registered event types, their histograms and the acquisition
/// thread feeding them.
///
/// Every method may be called while acquisition is running. Histogram operations take the
/// event's data lock and then its set lock, the same order the acquisition thread uses.
pub struct Engine {
    config: Config,
    dispatcher: EventDispatcher,
    controller: AttachmentController,
}

impl Engine {
    pub fn builder(config: Config) -> EngineBuilder {
        EngineBuilder {
            config,
            events: EventTable::default(),
            factory: None,
            status: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn event(&self, code: EventCode) -> Result<&Arc<dyn EventProcessor>, EngineError> {
        self.dispatcher
            .events()
            .get(&code)
            .ok_or(EngineError::UnknownEvent(code))
    }

    pub fn attach_online(
        &self,
        host: &str,
        secondary: &str,
        extra: &[String],
    ) -> Result<(), AttachError> {
        self.controller.attach_online(host, secondary, extra)
    }

    pub fn attach_file(&self, path: &Path, stop_at_end: bool) -> Result<(), AttachError> {
        self.controller.attach_file(path, stop_at_end)
    }

    pub fn attach_list(&self, path: &Path) -> Result<(), AttachError> {
        self.controller.attach_list(path)
    }

    /// Returns once the acquisition thread has exited
    pub fn unattach(&self) {
        self.controller.unattach()
    }

    pub fn attachment_state(&self) -> AttachmentState {
        self.controller.state()
    }

    pub fn new_histogram(
        &self,
        code: EventCode,
        spec: &HistogramSpec,
    ) -> Result<HistogramId, EngineError> {
        Ok(self.event(code)?.create_histogram(spec)?)
    }

    pub fn regate(&self, id: HistogramId, gate: &str) -> Result<(), EngineError> {
        Ok(self.event(id.event)?.registry().regate(id, gate)?)
    }

    /// Fill one histogram from its event's current record
    pub fn fill(&self, id: HistogramId) -> Result<usize, EngineError> {
        Ok(self.event(id.event)?.fill(id)?)
    }

    pub fn clear(&self, id: HistogramId) -> Result<(), EngineError> {
        Ok(self.event(id.event)?.registry().clear(id)?)
    }

    pub fn clear_all(&self) {
        for event in self.dispatcher.events().values() {
            event.registry().clear_all();
        }
    }

    pub fn delete(&self, id: HistogramId) -> Result<(), EngineError> {
        Ok(self.event(id.event)?.registry().remove_and_destroy(id)?)
    }

    pub fn delete_all(&self) {
        for event in self.dispatcher.events().values() {
            event.registry().delete_all();
        }
    }

    pub fn find_by_name(&self, name: &str) -> Option<HistogramId> {
        self.dispatcher
            .events()
            .values()
            .find_map(|event| event.registry().find_by_name(name))
    }

    pub fn snapshot(&self, id: HistogramId) -> Result<HistogramSnapshot, EngineError> {
        Ok(self.event(id.event)?.registry().snapshot(id)?)
    }

    /// Snapshots of every histogram, ordered by event code and then creation
    pub fn histograms(&self) -> Vec<HistogramSnapshot> {
        let mut codes: Vec<EventCode> = self.dispatcher.events().keys().copied().collect();
        codes.sort_unstable();
        codes
            .into_iter()
            .filter_map(|code| self.dispatcher.events().get(&code))
            .flat_map(|event| event.registry().snapshots())
            .collect()
    }

    pub fn read_variable(&self, code: EventCode, path: &str) -> Result<f64, EngineError> {
        Ok(self.event(code)?.read_variable(path)?)
    }

    pub fn set_variable(&self, code: EventCode, path: &str, value: f64) -> Result<(), EngineError> {
        Ok(self.event(code)?.set_variable(path, value)?)
    }

    /// Registered event codes and names, ordered by code
    pub fn events(&self) -> Vec<(EventCode, String)> {
        let mut events: Vec<(EventCode, String)> = self
            .dispatcher
            .events()
            .values()
            .map(|event| (event.code(), event.name().to_string()))
            .collect();
        events.sort_unstable();
        events
    }

    /// Every addressable leaf of an event's record, as `branch.path`
    pub fn variables(&self, code: EventCode) -> Result<Vec<String>, EngineError> {
        let event = self.event(code)?;
        Ok(event
            .schema()
            .leaf_paths()
            .into_iter()
            .map(|path| format!("{}.{}", event.name(), path))
            .collect())
    }

    pub fn event_stats(&self, code: EventCode) -> Result<EventStats, EngineError> {
        Ok(self.event(code)?.stats())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.controller.unattach();
    }
}
