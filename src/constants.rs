/// Seconds between two passes over the streamer roster
pub const DEFAULT_CHECK_INTERVAL_SECONDS: u64 = 120;

/// Upper bound of simultaneously running recording sessions
pub const DEFAULT_MAX_CONCURRENT_RECORDERS: usize = 8;

/// Memory available to the whole process, split evenly between recorders
/// when deriving the flush threshold
pub const DEFAULT_MEMORY_BUDGET_MIB: u64 = 512;

/// Largest request the IPFS API accepts (100 MiB)
pub const DEFAULT_REQUEST_SIZE_LIMIT_BYTES: u64 = 100 * 1024 * 1024;

pub const DEFAULT_IPFS_API_ADDRESS: &str = "/dns/ipfs.infura.io/tcp/5001/https";

pub const DEFAULT_GATEWAY_URL_TEMPLATE: &str = "https://{cid}.ipfs.infura-ipfs.io/{path}";

pub const DEFAULT_PLAYLIST_TYPE: &str = "vod";

pub const DEFAULT_DATABASE_PATH: &str = "offstream.sqlite";

pub const DEFAULT_HTTP_TIMEOUT_SECONDS: u64 = 30;

/// Prefix of every per-session temporary directory
pub const WORKDIR_PREFIX: &str = "offstream-";

/// Name of the playlist file inside a session directory
pub const PLAYLIST_FILE_NAME: &str = "playlist.m3u8";

/// Chunk size used while copying a segment body to disk
pub const SEGMENT_CHUNK_SIZE: usize = 8192;

/// Batches that may wait behind the one being uploaded
pub const UPLOAD_QUEUE_DEPTH: usize = 16;

/// Attempts made to persist a new playlist url before giving up on it
pub const RECORD_UPDATE_ATTEMPTS: u32 = 3;

/// Quality used when a streamer is registered without one
pub const DEFAULT_QUALITY: &str = "best";
