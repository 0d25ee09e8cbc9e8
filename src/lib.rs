pub mod signature;
pub mod codec;
pub mod index;
pub mod header;
pub mod source;
pub mod folder;
pub mod cache;
pub mod archive;
pub mod resolver;
pub mod importer;
pub mod hook;

pub use archive::{Archive, FileInfo, ReadError};
pub use codec::{Codec, CodecError, CodecRegistry, CoderId};
pub use folder::{DecodeError, FolderDecoder};
pub use header::FormatError;
pub use hook::{HookError, PathHook};
pub use importer::{CodeKind, ImportOptions, Importer, LoadError, LoadUnit, LoadedModule, Lookup};
pub use index::{ArchiveIndex, FileEntry, FolderDescriptor};
