//! Geometry and colour primitives used by the pipeline stages.

pub mod colorcard;
pub mod colortransform;
pub mod matching;
pub mod pyramid;
pub mod rectangle;
pub mod undistort;

pub use colortransform::ColorTransform;
pub use matching::{match_template, MatchParams, MatchResult};
pub use pyramid::{FloatImage, ImagePyramid};
pub use undistort::{Distortion, Rotation, UndistortMaps};
