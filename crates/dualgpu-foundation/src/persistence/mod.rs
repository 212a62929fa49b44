//! Benchmark persistence.
//!
//! - [`InMemoryBenchmarkStore`]: always available; tests and throwaway runs
//! - [`SqliteBenchmarkStore`]: feature `persistence-sqlite` (default), WAL
//!   journal so concurrent pool tasks can record safely
//!
//! Recording is best-effort from the pool's point of view: store errors are
//! logged and never fail a `get()`.

mod memory;
#[cfg(feature = "persistence-sqlite")]
mod sqlite;

pub use memory::InMemoryBenchmarkStore;
#[cfg(feature = "persistence-sqlite")]
pub use sqlite::SqliteBenchmarkStore;
