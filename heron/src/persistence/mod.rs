/// In-process job store.
///
/// [`InMemoryJobStore`] keeps live jobs, summaries and month-partitioned
/// archives behind a single mutex. It is the default store.
pub mod memory;

#[cfg(feature = "postgres")]
/// PostgreSQL job store.
///
/// [`PostgresJobStore`] persists jobs with row-level locking so several
/// coordinators can share one database.
pub mod postgres;

pub use memory::InMemoryJobStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresJobStore;
