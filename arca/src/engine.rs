//! Engine-wide configuration, threaded explicitly through both pipelines
//! instead of living in process globals.

use arca_core::cipher::Cipher;
use arca_core::integrity::MacAlgorithm;
use arca_core::split::CHUNK_SIZE;

use std::path::PathBuf;

/// Knobs shared by the backup and restore pipelines.
///
/// The defaults reproduce the production behavior; tests shrink
/// `chunk_size` so multi-chunk archives stay cheap.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Root under which per-run scratch directories are created
    pub scratch_root: PathBuf,
    /// Size bound of a data chunk
    pub chunk_size: u64,
    /// MAC algorithm used for new archives, and tried first when verifying
    /// a header
    pub default_mac: MacAlgorithm,
    /// Trial order for header verification; fixes `hmac-algorithm` for the
    /// rest of the archive on first match
    pub mac_allow_list: Vec<MacAlgorithm>,
    /// Cipher used for new encrypted archives
    pub default_cipher: Cipher,
    /// Program spawned to reach a helper in another domain
    pub rpc_client: PathBuf,
    /// Service name the backup helper is spawned under
    pub backup_service: String,
    /// Service name the restore helper is spawned under
    pub restore_service: String,
    /// Hard override of the restore ingress file-count quota; `None` means
    /// computed from the plan (the `UPDATES_MAX_FILES` environment variable
    /// still wins)
    pub max_files_override: Option<u64>,
    /// Hard override of the restore ingress byte quota, same precedence as
    /// above with `UPDATES_MAX_BYTES`
    pub max_bytes_override: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> EngineConfig {
        EngineConfig {
            scratch_root: PathBuf::from("/var/tmp"),
            chunk_size: CHUNK_SIZE,
            default_mac: MacAlgorithm::DEFAULT,
            mac_allow_list: MacAlgorithm::supported(),
            default_cipher: Cipher::DEFAULT,
            rpc_client: PathBuf::from("rpc-client"),
            backup_service: "arca.Backup".to_owned(),
            restore_service: "arca.Restore".to_owned(),
            max_files_override: None,
            max_bytes_override: None,
        }
    }
}
