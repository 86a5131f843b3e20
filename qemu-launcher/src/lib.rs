//! Launcher for the qemu-virt64-aarch64 board.
//!
//! Board flags are parsed into [`Options`], validated into a [`Selection`]
//! and assembled into an [`Invocation`] that is spawned directly, without a
//! shell.

pub mod command;
pub mod disk;
pub mod host;
pub mod options;
pub mod overlay;
pub mod version;

pub use command::{Environment, Invocation, Selection};
pub use host::Host;
pub use options::Options;
pub use version::QemuVersion;

/// A flag combination the board cannot run with.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UsageError {
    #[error("flag -{0} expects a value")]
    MissingValue(String),

    #[error("invalid integer {value:?} for -{flag}")]
    InvalidInteger { flag: String, value: String },

    #[error("invalid -el {0}, expected 1, 2 or 3")]
    InvalidExceptionLevel(u32),

    #[error("invalid -iommu {0:?}, expected smmu or virtio")]
    InvalidIommu(String),

    #[error("invalid -sound {0:?}, expected hda or virtio")]
    InvalidSound(String),

    #[error("-gl requires -graphic")]
    GlWithoutGraphic,

    #[error("VirtIO sound needs QEMU {min} or newer, found {found}")]
    VirtioSoundUnsupported {
        found: QemuVersion,
        min: QemuVersion,
    },
}
