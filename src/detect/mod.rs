mod group;
mod result;

pub use group::{ClassEntry, ClassTable, Group, FrameState, GROUP_PRIORITY};
pub use result::{BBox, Detection, DetectionFrame};
