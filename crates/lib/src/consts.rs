//! Shared constants.

/// Length of the hex build-hash prefix used in store directory names.
pub const BUILD_HASH_LEN: usize = 40;

/// Highest instance number probed when claiming `<version>-<n>` slots.
pub const MAX_BUILD_NUMBER: u32 = 999;

/// Identity line written at the top of every `build.log`.
pub const TOOL_IDENT: &str = concat!("Built with nimbus ", env!("CARGO_PKG_VERSION"));

/// Name of the manifest file inside an environment directory.
pub const MANIFEST_FILE: &str = "manifest";

/// Name of the build log inside a store artifact.
pub const BUILD_LOG_FILE: &str = "build.log";
