//! Background runtime: the job worker and the maintenance loop.

pub mod maintenance;
pub mod worker;

pub use maintenance::MaintenanceLoop;
pub use worker::JobWorker;
