//! Reference [`crate::plugin::FrameworkPlugin`] implementations for the
//! two framework families the coordinator was built to arbitrate between:
//! job-queue style (devices drawn from a shared pool per job) and
//! reservation style (places claimed for the duration of a session).

pub mod jobqueue;
pub mod reservation;

pub use jobqueue::JobQueuePlugin;
pub use reservation::ReservationPlugin;
