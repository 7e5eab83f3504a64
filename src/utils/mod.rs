pub mod fsmeta;
pub mod trigram;

pub use fsmeta::*;
pub use trigram::*;
