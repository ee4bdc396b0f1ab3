/*!
The arca engine: streaming backup and restore of VM file trees into an
authenticated, optionally encrypted, optionally compressed archive.

A backup run selects VMs, snapshots the catalog, and streams every file
through the producer pipeline (tar, filter, cipher, chunk+MAC) into a local
file or a helper process in another domain. A restore run verifies the
header, plans against the live host (conflicts, missing templates and
netvms, renames), then verifies and extracts every accepted chunk before
committing the results back into the catalog. Archive bytes are treated as
attacker controlled until their MAC has validated.

The format primitives live in `arca-core`; this crate owns the pipelines,
planning, transport, and progress/cancellation machinery.
*/

#![warn(clippy::all)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod backup;
pub mod catalog;
pub mod engine;
pub mod extract;
pub mod fsutil;
pub mod inventory;
pub mod plan;
pub mod progress;
pub mod restore;
pub mod select;
pub mod transport;

pub use crate::backup::{Backup, BackupError, Compression};
pub use crate::engine::EngineConfig;
pub use crate::extract::RestoreReport;
pub use crate::inventory::{Inventory, LocalVm};
pub use crate::plan::{Problem, RestoreInfo, RestoreOptions, VmToRestore};
pub use crate::progress::CancelToken;
pub use crate::restore::{BackupRestore, RestoreError};
pub use crate::transport::{BackupTarget, RestoreLocation, TransportError};

pub use arca_core::catalog::{Catalog, CatalogError, VmEntry, VmKind};
pub use arca_core::cipher::Cipher;
pub use arca_core::header::BackupHeader;
pub use arca_core::integrity::MacAlgorithm;
pub use arca_core::Passphrase;
