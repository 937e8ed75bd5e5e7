pub mod helm;
pub mod preset;
pub mod release;
pub mod values;

mod reconciler;
pub use reconciler::run;
