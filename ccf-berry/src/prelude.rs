//! 常用类型一站式导入.

pub use crate::annot::{AnnotVolume, VolumeAttr};
pub use crate::consts::{ATLAS_RESOLUTION_UM, ROOT_STRUCTURE_ID, SECTION_SPACING_UM};
pub use crate::ontology::{LookupError, Structure, StructureTree};
pub use crate::overlay::{OverlayCanvas, OverlayPaths, OverlayStyle};
pub use crate::pipeline::{
    run_overlay, structures_on_section, OverlayParams, PipelineError, SpecimenStore,
};
pub use crate::raster::{rasterize_structure, Mask2d, SliceMapping};
pub use crate::section::{on_section, section_of, ImageGeom, SectionImage, SectionMeta};
pub use crate::warp::{transform_point, transform_voxel, Affine3, DisplacementField};
pub use crate::{Idx2d, Idx3d, PhysPoint};
