//! # spieven
//!
//! **Spieven** is a long-running, single-host process supervisor for Linux.
//!
//! A client submits commands over a local TCP socket; the daemon executes
//! each as a supervised task, restarting it on exit, capturing its output,
//! enforcing failure budgets, and optionally tying its lifetime to a named
//! X11 or Wayland display.
//!
//! ## Components
//!
//! | Area              | Description                                                    | Key types                                  |
//! |-------------------|----------------------------------------------------------------|--------------------------------------------|
//! | **Scheduler**     | Authoritative task set behind one coarse lock.                 | [`Scheduler`], [`Task`]                    |
//! | **Supervision**   | Per-task worker loop: run, pump output, re-run, deactivate.    | `scheduler::worker` (internal)             |
//! | **Logging**       | Per-task log plus per-execution stdout rotation.               | [`scheduler::logger::TaskLogger`]          |
//! | **Displays**      | Watcher children that cascade display death into task stops.   | [`display::DisplayRegistry`]               |
//! | **Protocol**      | Length-prefixed, tagged JSON frames over TCP.                  | [`protocol::Frame`], [`protocol::Tag`]     |
//! | **Lifecycle**     | Cancellation, worker tracking, periodic trimming.              | [`Lifecycle`]                              |
//! | **Messages**      | Timestamped daemon diagnostics, mirrored to `backend.log`.     | [`MessageLog`]                             |
//!
//! The daemon state lives under `$HOME/.cache/spieven` and is rebuilt empty
//! on every start.

pub mod config;
pub mod display;
pub mod error;
pub mod fnv;
pub mod lifecycle;
pub mod messages;
pub mod paths;
pub mod protocol;
pub mod scheduler;
pub mod server;
pub mod signals;

// ---- Public re-exports ----

pub use config::Config;
pub use error::DaemonError;
pub use lifecycle::Lifecycle;
pub use messages::{MessageLog, Severity};
pub use paths::FilePathProvider;
pub use scheduler::{Scheduler, Task};
pub use server::run_server;
