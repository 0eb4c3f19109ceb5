pub mod controller;

pub use controller::run;

mod predicates;
mod reconciler;
mod status;
