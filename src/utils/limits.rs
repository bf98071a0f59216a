/// Copy buffer for spooling uploads and entries
pub const COPY_BUFFER_SIZE: usize = 80 * 1024;

/// Default cap on an uploaded symbol package
pub const DEFAULT_MAX_UPLOAD_SIZE: u64 = 512 * 1024 * 1024; // 512MB
