mod scheduler;
mod worker;

pub use scheduler::Scheduler;
pub use worker::Worker;
