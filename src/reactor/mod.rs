//! Single-threaded reactor built on [mio](https://docs.rs/mio).
//!
//! The [`EventLoop`] multiplexes readiness for any number of registered
//! connections and fires one-shot timers. Connections attach through a
//! [`LoopHandle`] and receive upcalls on the [`EventHandler`] trait; the
//! loop holds them weakly, so dropping a connection is all that is needed
//! to stop its callbacks.

mod event_loop;
mod timer;

pub use event_loop::{EventHandler, EventLoop, LoopHandle, Ready};
pub(crate) use event_loop::IoRegistration;
pub use timer::TimerId;
pub(crate) use timer::TimerHandle;
