use std::{fmt, str::FromStr};

use anyhow::{Result, bail};
use image::GrayImage;
use ndarray::Array4;
use serde::Deserialize;

/// Per-pixel instance labels: 0 is background, 1..N are object instances.
pub type LabelMap = GrayImage;

/// Which modalities the segmentation network consumes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InputMode {
    Color,
    Depth,
    #[default]
    Rgbd,
}

impl InputMode {
    /// Whether the back-projected point map must accompany the color tensor.
    pub fn requires_geometry(self) -> bool {
        matches!(self, InputMode::Depth | InputMode::Rgbd)
    }
}

impl FromStr for InputMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "COLOR" => Ok(InputMode::Color),
            "DEPTH" => Ok(InputMode::Depth),
            "RGBD" => Ok(InputMode::Rgbd),
            other => bail!("unknown input mode {other:?} (expected COLOR, DEPTH or RGBD)"),
        }
    }
}

impl fmt::Display for InputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InputMode::Color => "COLOR",
            InputMode::Depth => "DEPTH",
            InputMode::Rgbd => "RGBD",
        })
    }
}

/// Network input for a single frame, laid out as `[1, 3, H, W]`.
#[derive(Clone, Debug)]
pub struct ModelInput {
    /// Mean-subtracted color in `[0, 1)` before subtraction.
    pub color: Array4<f32>,
    /// Per-pixel `(x, y, z)` coordinates, present when the input mode needs depth.
    pub geometry: Option<Array4<f32>>,
}

impl ModelInput {
    /// `(height, width)` of the working resolution.
    pub fn size(&self) -> (usize, usize) {
        let shape = self.color.shape();
        (shape[2], shape[3])
    }
}

/// Label maps produced for one frame.
#[derive(Clone, Debug)]
pub struct SegmentationOutput {
    pub primary: LabelMap,
    pub refined: Option<LabelMap>,
}

/// Network producing the initial instance labels.
pub trait SegmentationModel: Send {
    fn segment(&mut self, input: &ModelInput) -> Result<LabelMap>;
}

/// Second-stage network refining labels on crops around each instance.
pub trait RefinementModel: Send {
    fn refine(&mut self, input: &ModelInput, initial: &LabelMap) -> Result<LabelMap>;
}

/// The loaded inference engine.
///
/// Whether a refinement network is present is decided once at startup; the
/// dispatcher never checks for it per frame.
pub enum Segmenter {
    PrimaryOnly(Box<dyn SegmentationModel>),
    Refined {
        primary: Box<dyn SegmentationModel>,
        refiner: Box<dyn RefinementModel>,
    },
}

impl Segmenter {
    pub fn primary_only(model: impl SegmentationModel + 'static) -> Self {
        Segmenter::PrimaryOnly(Box::new(model))
    }

    pub fn with_refinement(
        primary: impl SegmentationModel + 'static,
        refiner: impl RefinementModel + 'static,
    ) -> Self {
        Segmenter::Refined {
            primary: Box::new(primary),
            refiner: Box::new(refiner),
        }
    }

    pub fn has_refinement(&self) -> bool {
        matches!(self, Segmenter::Refined { .. })
    }

    /// Run the configured network(s) on one input.
    pub fn run(&mut self, input: &ModelInput) -> Result<SegmentationOutput> {
        match self {
            Segmenter::PrimaryOnly(primary) => Ok(SegmentationOutput {
                primary: primary.segment(input)?,
                refined: None,
            }),
            Segmenter::Refined { primary, refiner } => {
                let initial = primary.segment(input)?;
                let refined = refiner.refine(input, &initial)?;
                Ok(SegmentationOutput {
                    primary: initial,
                    refined: Some(refined),
                })
            }
        }
    }
}

impl fmt::Debug for Segmenter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segmenter::PrimaryOnly(_) => f.write_str("Segmenter::PrimaryOnly"),
            Segmenter::Refined { .. } => f.write_str("Segmenter::Refined"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    struct Constant(u8);

    impl SegmentationModel for Constant {
        fn segment(&mut self, input: &ModelInput) -> Result<LabelMap> {
            let (h, w) = input.size();
            Ok(LabelMap::from_pixel(w as u32, h as u32, Luma([self.0])))
        }
    }

    struct Shift;

    impl RefinementModel for Shift {
        fn refine(&mut self, _input: &ModelInput, initial: &LabelMap) -> Result<LabelMap> {
            let mut out = initial.clone();
            out.pixels_mut().for_each(|p| p.0[0] += 1);
            Ok(out)
        }
    }

    fn input(h: usize, w: usize) -> ModelInput {
        ModelInput {
            color: Array4::zeros((1, 3, h, w)),
            geometry: None,
        }
    }

    #[test]
    fn primary_only_reports_no_refinement() {
        let mut segmenter = Segmenter::primary_only(Constant(2));
        let out = segmenter.run(&input(4, 6)).unwrap();
        assert!(!segmenter.has_refinement());
        assert_eq!(out.primary.dimensions(), (6, 4));
        assert!(out.refined.is_none());
    }

    #[test]
    fn refined_variant_feeds_primary_labels_to_refiner() {
        let mut segmenter = Segmenter::with_refinement(Constant(2), Shift);
        let out = segmenter.run(&input(2, 2)).unwrap();
        assert!(segmenter.has_refinement());
        assert_eq!(out.primary.get_pixel(0, 0).0[0], 2);
        assert_eq!(out.refined.unwrap().get_pixel(1, 1).0[0], 3);
    }

    #[test]
    fn input_mode_parses_case_insensitively() {
        assert_eq!("rgbd".parse::<InputMode>().unwrap(), InputMode::Rgbd);
        assert!(!"color".parse::<InputMode>().unwrap().requires_geometry());
        assert!("DEPTH".parse::<InputMode>().unwrap().requires_geometry());
        assert!("stereo".parse::<InputMode>().is_err());
    }
}
