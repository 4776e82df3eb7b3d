mod backend;
pub mod loader;
pub mod processor;
mod registry;
#[cfg(test)]
pub(crate) mod testing;
mod types;

#[cfg(feature = "tch-backend")]
pub mod torch;

pub use backend::{Backend, BackendLoader};
#[cfg(any(feature = "tch-backend", test))]
pub(crate) use backend::unsupported;
pub use loader::LoaderSet;
pub use registry::{LoadReport, ModelRegistry};
pub use types::{
    BackendInfo, BackendKind, ExecutionDevice, InferenceInput, InferenceOutput, RawSegmentation,
    SegmentationInput, SeparatedTracks, SeparationInput,
};
