//! Model-facing types for RGB-D instance segmentation.
//!
//! The pipeline talks to inference through [`Segmenter`], a variant fixed at
//! startup that either runs the primary network alone or follows it with a
//! crop refinement network. Enable the `with-tch` feature to load TorchScript
//! networks through `tch`.

pub mod segmenter;
#[cfg(feature = "with-tch")]
pub mod torch;

pub use segmenter::{
    InputMode, LabelMap, ModelInput, RefinementModel, SegmentationModel, SegmentationOutput,
    Segmenter,
};

#[cfg(feature = "with-tch")]
pub use tch;
