//! # livehist
//!
//! livehist is an online histogramming engine, written in Rust. It reads raw buffers from a
//! live data stream, a file (optionally followed as it grows) or a list of files, unpacks
//! each buffer into a user-defined event record, and fills every histogram defined on that
//! event type. Histograms can be created, regated, cleared and deleted while data is
//! flowing.
//!
//! ## Structure
//!
//! - Event records are plain Rust structs described by [`impl_record!`], which builds the
//! field table used to resolve names like `adc[3]`, `hits.energy` or `tof[2][1]`.
//! - Histogram parameters and gates are formulas over those fields, compiled by
//! [`formula::FormulaEngine`]. A formula is a bare field, a constant, or an arithmetic and
//! logical expression.
//! - Each event type owns a [`registry::HistogramRegistry`]. Standard (1 to 3 dimensions),
//! summary, gamma, bitmask and scaler histograms are supported.
//! - [`engine::Engine`] ties it together: the registered event types, the dispatcher and the
//! [`attach::AttachmentController`] owning the acquisition thread.
//!
//! ## Sources
//!
//! Buffers come from a [`source::BufferSource`]. The bundled [`framed::FramedSource`] reads
//! the framed format below from files or a TCP stream; other sources plug in through
//! [`engine::EngineBuilder::source_factory`].
//!
//! ```text
//! | u32 LE payload length | u16 LE event code | payload bytes ... |
//! ```
//!
//! ## Configuration
//!
//! The engine is configured through a YAML file, see [`config::Config`]:
//!
//! ```yml
//! retry_interval_ms: 10000
//! status_interval: 100
//! max_buffer_bytes: 1048576
//! poll_interval_ms: 250
//! connect_timeout_ms: 5000
//! scaler_growth_factor: 2.0
//! log_path: livehist.log
//! ```
//!
//! ## Output
//!
//! The library logs through `spdlog`. Progress of the acquisition thread (buffer counts,
//! truncated buffers, end of run) is also sent as [`status::AttachStatus`] messages to the
//! channel given to [`engine::EngineBuilder::status_sender`].
pub mod attach;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod event;
pub mod formula;
pub mod framed;
pub mod histogram;
pub mod registry;
pub mod resolver;
pub mod schema;
pub mod source;
pub mod status;
pub mod sync_cell;
