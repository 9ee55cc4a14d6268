//! Writable union drive and its persistence.

mod modlog;
mod save;
mod timer;
mod union_drive;

pub use modlog::{EntryKind, ModLog, Modification, MODS_MEMBER};
pub use save::{load_save, write_save, LoadedSave, SaveStats};
pub use timer::SaveTimer;
pub use union_drive::UnionDrive;
