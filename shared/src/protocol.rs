/// Version tag written at the head of the discovery data file
pub const DISCOVERY_CODE_VERSION: u16 = 1;

/// Persisted service list and its one-generation-old backup
pub const DISCOVERY_FILE: &str = "discovery.dat";
pub const DISCOVERY_BACKUP_FILE: &str = "discovery_backup.dat";
pub const TEMPORARY_SUFFIX: &str = "_tmp";

/// Bundled seed list
pub const DEFAULT_SERVICES_FILE: &str = "DefaultServices.dat";

/// Ceiling for automatic rating bumps and the rating given on revival
pub const MAX_RATING: u8 = 5;

/// API path prefix
pub const API_PREFIX: &str = "/v1";
