//! Software reference device for `accel`.
//!
//! [`SoftRuntime`] implements [`accel_sys::Backend`] entirely in-process. It is the device the
//! `accel-cl` test-suite runs against and the default target of the `accel-clc` tool.
//!
//! Device code is not compiled to anything: building a program preprocesses the source and
//! extracts its `__kernel` entry points, and launches run host closures registered under the
//! entry-point name.
//!
//! ```no_run
//! use accel_soft::{SoftConfig, SoftRuntime};
//!
//! let runtime = SoftRuntime::new(SoftConfig::default()).unwrap();
//! runtime.register_kernel("square", |launch| {
//!     for i in 0..launch.global_size(0) {
//!         let x: f32 = launch.load(0, i)?;
//!         launch.store(1, i, x * x)?;
//!     }
//!     Ok(())
//! });
//! ```

mod compiler;
mod config;
mod gl;
mod launch;
mod ledger;
mod objects;
mod reply;
mod runtime;
mod scheduler;
mod state;

pub use config::{ConfigError, SoftConfig, SoftDeviceConfig, SoftDeviceKind};
pub use launch::{KernelFn, SoftLaunch};
pub use ledger::{Ledger, LedgerSnapshot};
pub use runtime::SoftRuntime;
pub use scheduler::Transition;
