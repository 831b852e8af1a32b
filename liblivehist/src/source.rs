use std::path::Path;
use std::sync::Arc;

use super::dispatcher::EventDispatcher;
use super::error::SourceError;
use super::event::EventCode;

/// Result of asking a source for the next buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// A complete buffer is available through `event_code` and `buffer`
    Buffer,
    /// A partial buffer is available; it is still dispatched
    Truncated { expected: usize, received: usize },
    /// Nothing arrived within the source's poll interval. Online only; the caller checks for
    /// cancellation and asks again.
    Idle,
    /// End of data (offline) or the peer went away (online)
    Exhausted,
}

/// Where raw buffers come from. A fresh source is created for every attachment.
///
/// Sources only move bytes; turning a buffer into events is the job of the
/// [`EventDispatcher`] and the user's unpackers.
pub trait BufferSource: Send {
    fn open_file(&mut self, path: &Path, extra: &[String]) -> Result<(), SourceError>;

    fn connect_online(
        &mut self,
        host: &str,
        secondary: &str,
        extra: &[String],
    ) -> Result<(), SourceError>;

    fn read_buffer_offline(&mut self) -> Result<ReadOutcome, SourceError>;

    fn read_buffer_online(&mut self) -> Result<ReadOutcome, SourceError>;

    /// Called once when a non-continuous offline run reaches the end of data. Sources that
    /// hold back an incomplete buffer hand it out here, usually as
    /// [`ReadOutcome::Truncated`].
    fn take_partial(&mut self) -> Option<ReadOutcome> {
        None
    }

    /// Event code of the most recently read buffer
    fn event_code(&self) -> EventCode;

    /// Bytes of the most recently read buffer
    fn buffer(&self) -> &[u8];

    /// Hand the current buffer to the dispatcher. Sources carrying several events per buffer
    /// may override this to dispatch them one by one.
    fn unpack_buffer(&self, dispatcher: &EventDispatcher) -> bool {
        dispatcher.dispatch(self.event_code(), self.buffer())
    }

    fn close_file(&mut self);

    fn disconnect_online(&mut self);

    /// Total bytes consumed since the last open or connect
    fn bytes_read(&self) -> u64 {
        0
    }
}

/// Makes a new source for each attachment (and each entry of a file list)
pub type SourceFactory = Arc<dyn Fn() -> Box<dyn BufferSource> + Send + Sync>;
