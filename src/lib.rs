//! STRUBS: a striped, Reed–Solomon-protected object storage core.
//!
//! See `SPEC_FULL.md` for the full module map. This crate owns slice
//! layout, the write/read/verify/destroy pipelines, and the volume
//! selection and priority machinery; it depends on an `ObjectMetaStore`,
//! a `RuntimeConfigStore`, and a `VolumeFleet` supplied by the caller.

pub mod checksum;
pub mod collaborators;
pub mod config;
pub mod container_cache;
pub mod destroyer;
pub mod domain;
pub mod file_object;
pub mod format;
pub mod galois;
pub mod plan;
pub mod planner;
pub mod priority;
pub mod reader;
pub mod rs_codec;
pub mod shutdown;
pub mod slice;
pub mod slice_verifier;
pub mod verify_job;
pub mod volume;
pub mod writer;

pub use collaborators::{
    ConfigStoreError, ContainerEntry, FleetStartReport, MetaStoreError, ObjectMetaStore,
    RuntimeConfigStore, SliceErrorRecord, SliceKind, StoredObjectRecord, VolumeFleet,
};
pub use config::Config;
pub use domain::{ChunkIndex, ObjectId, SliceIndex, VolumeId};
pub use file_object::{CreateError, FileObject, FileObjectError, StateError};
pub use plan::{ChunkSetRegion, Plan};
pub use planner::{Assignment, PlanError, Planner};
pub use priority::{Priority, VolumePriority};
pub use reader::{Reader, ReaderError};
pub use rs_codec::{Codec, CodecError};
pub use shutdown::{IoAbortError, IoShutdown};
pub use slice::{Slice, SliceError};
pub use slice_verifier::{SliceVerifier, VerifyOutcome};
pub use verify_job::{VerifyJob, VerifyStatus};
pub use volume::{BlockMounter, DirectoryMounter, Volume, VolumeError};
pub use writer::{Writer, WriterError};
