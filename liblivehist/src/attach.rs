//! Starting and stopping the acquisition thread.
//!
//! At most one acquisition thread exists at a time. Every attach first performs an unattach,
//! which clears the running flag of the current thread and joins it, so once an attach or
//! unattach call returns, no buffer from the previous attachment will be processed.
//!
//! The controller's transition lock is only ever taken by foreground calls. The acquisition
//! thread never touches it; when it finishes on its own (end of a run, a dropped connection)
//! it simply exits and [`AttachmentController::state`] reports `Detached` from then on.
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::config::Config;
use super::dispatcher::EventDispatcher;
use super::error::{AttachError, ListEntryError, SourceError};
use super::source::{BufferSource, ReadOutcome, SourceFactory};
use super::status::{AttachStatus, StatusReporter};
use super::sync_cell::SynchronizedCell;

/// Longest uninterrupted sleep while waiting for a file to grow
const RETRY_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttachmentState {
    #[default]
    Detached,
    AttachingOnline,
    AttachingFile,
    AttachingFileList,
}

/// Parse a list file: one path per line, `#` starts a comment, whitespace is ignored
pub fn parse_list_file(path: &Path) -> Result<Vec<PathBuf>, AttachError> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| AttachError::BadListFile(path.to_path_buf(), e))?;
    let entries: Vec<PathBuf> = contents
        .lines()
        .filter_map(|line| {
            let entry: String = line
                .split('#')
                .next()
                .unwrap_or_default()
                .chars()
                .filter(|c| !c.is_whitespace())
                .collect();
            (!entry.is_empty()).then(|| PathBuf::from(entry))
        })
        .collect();
    if entries.is_empty() {
        return Err(AttachError::EmptyList(path.to_path_buf()));
    }
    Ok(entries)
}

#[derive(Debug)]
struct Acquisition {
    state: AttachmentState,
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// How a file loop ended
enum FileEnd {
    Completed,
    Cancelled,
    Failed(SourceError),
}

/// Everything the acquisition thread owns
struct Worker {
    dispatcher: EventDispatcher,
    factory: SourceFactory,
    status: StatusReporter,
    running: Arc<AtomicBool>,
    retry_interval: Duration,
    status_interval: u64,
    buffers: u64,
    bytes: u64,
}

impl Worker {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn process(&mut self, source: &dyn BufferSource) {
        self.buffers += 1;
        if !source.unpack_buffer(&self.dispatcher) {
            self.status.send(AttachStatus::BadEvent {
                buffers: self.buffers,
            });
        }
        if self.status_interval > 0 && self.buffers % self.status_interval == 0 {
            self.status.send(AttachStatus::BufferCount {
                buffers: self.buffers,
            });
        }
    }

    fn truncated(&self, expected: usize, received: usize) {
        spdlog::warn!(
            "Buffer {} truncated: expected {} bytes, received {}",
            self.buffers + 1,
            expected,
            received
        );
        self.status
            .send(AttachStatus::Truncated { expected, received });
    }

    /// Wait for `retry_interval`, waking up regularly to check for unattach
    fn sleep_sliced(&self) {
        let start = Instant::now();
        while self.is_running() {
            let elapsed = start.elapsed();
            if elapsed >= self.retry_interval {
                break;
            }
            std::thread::sleep(RETRY_SLICE.min(self.retry_interval - elapsed));
        }
    }

    fn follow_file(&mut self, source: &mut dyn BufferSource, stop_at_end: bool) -> FileEnd {
        while self.is_running() {
            match source.read_buffer_offline() {
                Ok(ReadOutcome::Buffer) => self.process(source),
                Ok(ReadOutcome::Truncated { expected, received }) => {
                    self.truncated(expected, received);
                    self.process(source);
                }
                Ok(ReadOutcome::Exhausted) | Ok(ReadOutcome::Idle) => {
                    if stop_at_end {
                        match source.take_partial() {
                            Some(ReadOutcome::Truncated { expected, received }) => {
                                self.truncated(expected, received);
                                self.process(source);
                            }
                            Some(ReadOutcome::Buffer) => self.process(source),
                            _ => (),
                        }
                        self.bytes += source.bytes_read();
                        return FileEnd::Completed;
                    }
                    self.sleep_sliced();
                }
                Err(e) => {
                    self.bytes += source.bytes_read();
                    return FileEnd::Failed(e);
                }
            }
        }
        self.bytes += source.bytes_read();
        FileEnd::Cancelled
    }

    fn run_complete(&self) {
        spdlog::info!(
            "Run complete: {} buffers, {} read",
            self.buffers,
            human_bytes::human_bytes(self.bytes as f64)
        );
        self.status.send(AttachStatus::RunComplete {
            buffers: self.buffers,
            bytes: self.bytes,
        });
    }

    fn aborted(&self, reason: String) {
        spdlog::error!("Acquisition aborted: {reason}");
        self.status.send(AttachStatus::Aborted { reason });
    }

    fn detached(&self) {
        spdlog::info!("Acquisition thread finished after {} buffers.", self.buffers);
        self.status.send(AttachStatus::Detached);
    }

    fn run_online(mut self, mut source: Box<dyn BufferSource>, label: String) {
        self.status.send(AttachStatus::Attached {
            state: AttachmentState::AttachingOnline,
            source: label,
        });
        while self.is_running() {
            match source.read_buffer_online() {
                Ok(ReadOutcome::Buffer) => self.process(&*source),
                Ok(ReadOutcome::Truncated { expected, received }) => {
                    self.truncated(expected, received);
                    self.process(&*source);
                }
                Ok(ReadOutcome::Idle) => continue,
                Ok(ReadOutcome::Exhausted) => {
                    self.aborted(String::from("online source closed the connection"));
                    break;
                }
                Err(e) => {
                    self.aborted(format!("online read failed: {e}"));
                    break;
                }
            }
        }
        source.disconnect_online();
        self.detached();
    }

    fn run_file(mut self, mut source: Box<dyn BufferSource>, label: String, stop_at_end: bool) {
        self.status.send(AttachStatus::Attached {
            state: AttachmentState::AttachingFile,
            source: label,
        });
        match self.follow_file(&mut *source, stop_at_end) {
            FileEnd::Completed => self.run_complete(),
            FileEnd::Cancelled => (),
            FileEnd::Failed(e) => self.aborted(format!("file read failed: {e}")),
        }
        source.close_file();
        self.detached();
    }

    fn run_list(mut self, entries: Vec<PathBuf>, label: String) {
        self.status.send(AttachStatus::Attached {
            state: AttachmentState::AttachingFileList,
            source: label,
        });
        let mut cancelled = false;
        for path in entries {
            if !self.is_running() {
                cancelled = true;
                break;
            }
            let mut source = (self.factory)();
            let result = match source.open_file(&path, &[]) {
                Ok(()) => {
                    spdlog::info!("Processing list entry {path:?}...");
                    let end = self.follow_file(&mut *source, true);
                    source.close_file();
                    end
                }
                Err(e) => FileEnd::Failed(e),
            };
            match result {
                FileEnd::Completed => spdlog::info!("Finished list entry {path:?}."),
                FileEnd::Cancelled => {
                    cancelled = true;
                    break;
                }
                FileEnd::Failed(e) => {
                    let error = ListEntryError { path, source: e };
                    spdlog::warn!("{error}");
                    self.status.send(AttachStatus::ListEntrySkipped {
                        path: error.path.clone(),
                        reason: error.source.to_string(),
                    });
                }
            }
        }
        if !cancelled {
            self.run_complete();
        }
        self.detached();
    }
}

/// Owns the (single) acquisition thread
pub struct AttachmentController {
    active: SynchronizedCell<Option<Acquisition>>,
    dispatcher: EventDispatcher,
    factory: SourceFactory,
    status: StatusReporter,
    retry_interval: Duration,
    status_interval: u64,
}

impl AttachmentController {
    pub fn new(
        dispatcher: EventDispatcher,
        factory: SourceFactory,
        status: StatusReporter,
        config: &Config,
    ) -> Self {
        Self {
            active: SynchronizedCell::new(None),
            dispatcher,
            factory,
            status,
            retry_interval: config.retry_interval(),
            status_interval: config.status_interval,
        }
    }

    fn worker(&self, running: &Arc<AtomicBool>) -> Worker {
        Worker {
            dispatcher: self.dispatcher.clone(),
            factory: self.factory.clone(),
            status: self.status.clone(),
            running: running.clone(),
            retry_interval: self.retry_interval,
            status_interval: self.status_interval,
            buffers: 0,
            bytes: 0,
        }
    }

    /// Signal the current thread (if any) and wait for it to exit
    fn stop(active: &mut Option<Acquisition>) {
        if let Some(acquisition) = active.take() {
            acquisition.running.store(false, Ordering::Release);
            if acquisition.handle.join().is_err() {
                spdlog::error!("Acquisition thread panicked!");
            }
            spdlog::info!("Unattached from {:?} source.", acquisition.state);
        }
    }

    fn launch(
        &self,
        active: &mut Option<Acquisition>,
        state: AttachmentState,
        run: impl FnOnce(Worker) + Send + 'static,
    ) -> Result<(), AttachError> {
        let running = Arc::new(AtomicBool::new(true));
        let worker = self.worker(&running);
        self.dispatcher.begin_run();
        let handle = std::thread::Builder::new()
            .name(String::from("livehist-acquisition"))
            .spawn(move || run(worker))
            .map_err(AttachError::SpawnError)?;
        *active = Some(Acquisition {
            state,
            running,
            handle,
        });
        Ok(())
    }

    /// Connect to an online source and start acquiring
    pub fn attach_online(
        &self,
        host: &str,
        secondary: &str,
        extra: &[String],
    ) -> Result<(), AttachError> {
        let mut active = self.active.lock();
        Self::stop(&mut active);
        let mut source = (self.factory)();
        source.connect_online(host, secondary, extra)?;
        let label = format!("{host} {secondary}").trim().to_string();
        spdlog::info!("Attached to online source {label}");
        self.launch(&mut active, AttachmentState::AttachingOnline, move |worker| {
            worker.run_online(source, label)
        })
    }

    /// Open a file and start acquiring. With `stop_at_end` false the file is followed as it
    /// grows until unattach.
    pub fn attach_file(&self, path: &Path, stop_at_end: bool) -> Result<(), AttachError> {
        let mut active = self.active.lock();
        Self::stop(&mut active);
        let mut source = (self.factory)();
        source.open_file(path, &[])?;
        let label = path.to_string_lossy().to_string();
        spdlog::info!("Attached to file {label} (continuous: {})", !stop_at_end);
        self.launch(&mut active, AttachmentState::AttachingFile, move |worker| {
            worker.run_file(source, label, stop_at_end)
        })
    }

    /// Process every file named in a list file, one after the other
    pub fn attach_list(&self, path: &Path) -> Result<(), AttachError> {
        let mut active = self.active.lock();
        Self::stop(&mut active);
        let entries = parse_list_file(path)?;
        let label = path.to_string_lossy().to_string();
        spdlog::info!("Attached to list {label} with {} entries", entries.len());
        self.launch(&mut active, AttachmentState::AttachingFileList, move |worker| {
            worker.run_list(entries, label)
        })
    }

    /// Stop the acquisition thread. Idempotent.
    pub fn unattach(&self) {
        let mut active = self.active.lock();
        Self::stop(&mut active);
    }

    pub fn state(&self) -> AttachmentState {
        match &*self.active.lock() {
            Some(acquisition) if !acquisition.handle.is_finished() => acquisition.state,
            _ => AttachmentState::Detached,
        }
    }
}

impl Drop for AttachmentController {
    fn drop(&mut self) {
        Self::stop(self.active.get_mut());
    }
}
