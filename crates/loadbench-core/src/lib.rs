pub mod artifact;
pub mod backend;
pub mod dataset;
pub mod postprocess;
pub mod query;
pub mod spec;
pub mod state;
pub mod tensor;

pub use artifact::*;
pub use backend::*;
pub use dataset::*;
pub use postprocess::*;
pub use query::*;
pub use spec::*;
pub use state::*;
pub use tensor::*;
