pub mod propagation;
pub mod target;

mod reconciler;
pub use reconciler::run;
