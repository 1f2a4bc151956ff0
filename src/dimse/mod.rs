//! Native C-FIND over DICOM upper layer associations, used by the `dimse` query backend.

pub mod association;
pub mod cfind;
