//! weft — a cooperative M:N tasking runtime
//!
//! Many lightweight tasks multiplexed over a fixed pool of OS worker
//! threads, the *shepherds*. A task is pinned to the shepherd chosen at fork
//! time and runs until it explicitly yields, blocks on a full/empty-bit
//! word, blocks on an address lock, or submits a blocking syscall; there is
//! no preemption.
//!
//! Synchronization is word-granular: every aligned machine word carries a
//! conceptual full/empty bit, and the `read_ff`/`read_fe`/`write_ef` family
//! turns plain memory into dataflow rendezvous points. Address locks give
//! plain mutex semantics keyed by any address-sized value.
//!
//! ```no_run
//! let mut slot: weft::Aligned = 0;
//! weft::init(2).unwrap();
//! // SAFETY: `slot` outlives the forked task and the read below.
//! unsafe {
//!     weft::fork(|| 40 + 2, &mut slot).unwrap();
//!     let mut out: weft::Aligned = 0;
//!     weft::read_ff(&mut out, &slot).unwrap();
//!     assert_eq!(out, 42);
//! }
//! weft::finalize();
//! ```

mod arch;
pub mod error;
pub mod feb;
pub mod future;
pub mod io;
pub mod lock;
mod pool;
mod queue;
mod runtime;
mod shepherd;
mod stripe;
pub mod task;

pub use error::{Result, WeftError};
pub use feb::{
    empty, feb_status, fill, read_fe, read_ff, write_ef, write_ef_const, write_f, write_f_const,
};
pub use future::{assert_future, assert_not_future, is_future, set_future_exit_hook};
pub use lock::{lock, unlock};
pub use runtime::{
    current, finalize, fork, fork_future_to, fork_to, init, prepare, prepare_for, schedule,
    schedule_on, shep, spawn, yield_now, Prepared,
};
pub use task::{Aligned, ShepherdId, Task, TaskFlags, TaskId};
