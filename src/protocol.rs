//! Shared protocol constants for the gateway wire format

/// Protocol version carried in every header
pub const VERSION_MAJOR: u8 = 1;
pub const VERSION_MINOR: u8 = 0;

/// Fixed message header size (bytes)
pub const HEADER_LEN: usize = 64;

// Maximum payload per message (4MB) - bounds per-message memory
pub const MAX_MSG_DATA_LEN: usize = 4 * 1024 * 1024;

/// Maximum total message size, header included
pub const MAX_MESSAGE_LEN: usize = MAX_MSG_DATA_LEN + HEADER_LEN;

/// Per-connection ring size (send and receive)
pub const MAX_RING_DATA_LEN: usize = 20 * 1024 * 1024;

/// Fixed part of the task descriptor (metadata follows)
pub const TASK_INFO_LEN: usize = 344;

pub const MD5_LEN: usize = 32;
pub const MAX_NAME_LEN: usize = 255;

/// Maximum number of backend roots (replicas)
pub const MAX_BACK_END: usize = 5;

/// Stub directory that must exist under every mounted backend root
pub const MOUNT_STUB_DIR: &str = "mountpoint";

/// Per-directory checksum ledger
pub const MD5_LEDGER_NAME: &str = "md5sum.txt";

/// Peer node types
pub mod node {
    pub const CLIENT: u8 = 1;
    pub const GATEWAY: u8 = 3;
    pub const ASM: u8 = 6;
    // Process-internal only, never on the wire
    pub const PIPE: u8 = 200;
}

/// Acknowledgement codes (numeric convention, not HTTP semantics)
pub mod ack {
    pub const OK: u32 = 200;
    pub const FAILED: u32 = 404;
}

// Command codes: (group << 16) | op, response = request + 1
pub mod command {
    pub const HEARTBEAT_REQ: u32 = 0x0001_0001;
    pub const HEARTBEAT_RSP: u32 = 0x0001_0002;

    pub const START_UPLOAD_REQ: u32 = 0x0002_0001;
    pub const START_UPLOAD_RSP: u32 = 0x0002_0002;
    pub const UPLOAD_DATA_REQ: u32 = 0x0002_0003;
    pub const UPLOAD_DATA_RSP: u32 = 0x0002_0004;
    pub const UPLOAD_FINISH_REQ: u32 = 0x0002_0005;
    pub const UPLOAD_FINISH_RSP: u32 = 0x0002_0006;

    pub const START_DOWNLOAD_REQ: u32 = 0x0002_0007;
    pub const START_DOWNLOAD_RSP: u32 = 0x0002_0008;
    pub const DOWNLOAD_DATA_REQ: u32 = 0x0002_0009;
    pub const DOWNLOAD_DATA_RSP: u32 = 0x0002_000A;
    pub const DOWNLOAD_FINISH_REQ: u32 = 0x0002_000B;
    pub const DOWNLOAD_FINISH_RSP: u32 = 0x0002_000C;

    pub const DELETE_REQ: u32 = 0x0002_000D;
    pub const DELETE_RSP: u32 = 0x0002_000E;

    // List all files under a study (or study/serial) key
    pub const GET_FILE_LIST_REQ: u32 = 0x0002_000F;
    pub const GET_FILE_LIST_RSP: u32 = 0x0002_0010;

    // Whole-file streaming via sendfile
    pub const SEQ_DOWNLOAD_REQ: u32 = 0x0002_0011;
    pub const SEQ_DOWNLOAD_RSP: u32 = 0x0002_0012;

    pub const MIGRATION_START_REQ: u32 = 0x0003_0001;
    pub const MIGRATION_START_RSP: u32 = 0x0003_0002;
    pub const MIGRATION_STOP_REQ: u32 = 0x0003_0003;
    pub const MIGRATION_STOP_RSP: u32 = 0x0003_0004;
    pub const MIGRATION_FINISHED_REQ: u32 = 0x0003_0005;
    pub const MIGRATION_FINISHED_RSP: u32 = 0x0003_0006;
    pub const MIGRATION_CANCEL_REQ: u32 = 0x0003_0007;
    pub const MIGRATION_CANCEL_RSP: u32 = 0x0003_0008;

    /// Gateway -> ASM heartbeat (own framing: be32 length, be32 command, JSON body)
    pub const ASM_HEARTBEAT: u32 = 0x0008_0001;
}

/// Responses are `request + 1`, so they carry an even low bit
pub fn is_response(code: u32) -> bool {
    code & 1 == 0
}

/// Human-readable command name for logs
pub fn command_name(code: u32) -> &'static str {
    use command::*;
    match code {
        HEARTBEAT_REQ => "HEARTBEAT_REQ",
        HEARTBEAT_RSP => "HEARTBEAT_RSP",
        START_UPLOAD_REQ => "START_UPLOAD_REQ",
        START_UPLOAD_RSP => "START_UPLOAD_RSP",
        UPLOAD_DATA_REQ => "UPLOAD_DATA_REQ",
        UPLOAD_DATA_RSP => "UPLOAD_DATA_RSP",
        UPLOAD_FINISH_REQ => "UPLOAD_FINISH_REQ",
        UPLOAD_FINISH_RSP => "UPLOAD_FINISH_RSP",
        START_DOWNLOAD_REQ => "START_DOWNLOAD_REQ",
        START_DOWNLOAD_RSP => "START_DOWNLOAD_RSP",
        DOWNLOAD_DATA_REQ => "DOWNLOAD_DATA_REQ",
        DOWNLOAD_DATA_RSP => "DOWNLOAD_DATA_RSP",
        DOWNLOAD_FINISH_REQ => "DOWNLOAD_FINISH_REQ",
        DOWNLOAD_FINISH_RSP => "DOWNLOAD_FINISH_RSP",
        DELETE_REQ => "DELETE_REQ",
        DELETE_RSP => "DELETE_RSP",
        GET_FILE_LIST_REQ => "GET_FILE_LIST_REQ",
        GET_FILE_LIST_RSP => "GET_FILE_LIST_RSP",
        SEQ_DOWNLOAD_REQ => "SEQ_DOWNLOAD_REQ",
        SEQ_DOWNLOAD_RSP => "SEQ_DOWNLOAD_RSP",
        MIGRATION_START_REQ => "MIGRATION_START_REQ",
        MIGRATION_START_RSP => "MIGRATION_START_RSP",
        MIGRATION_STOP_REQ => "MIGRATION_STOP_REQ",
        MIGRATION_STOP_RSP => "MIGRATION_STOP_RSP",
        MIGRATION_FINISHED_REQ => "MIGRATION_FINISHED_REQ",
        MIGRATION_FINISHED_RSP => "MIGRATION_FINISHED_RSP",
        MIGRATION_CANCEL_REQ => "MIGRATION_CANCEL_REQ",
        MIGRATION_CANCEL_RSP => "MIGRATION_CANCEL_RSP",
        ASM_HEARTBEAT => "ASM_HEARTBEAT",
        _ => "UNKNOWN_COMMAND",
    }
}

// Socket and reactor tuning
pub mod limits {
    /// Connection table capacity (descriptor values at or above are rejected)
    pub const MAX_CONNS: usize = 50_000;
    /// Events drained per epoll_wait
    pub const MAX_EVENTS: usize = 256;
    pub const MAX_WORKERS: usize = 255;
    pub const MIN_WORKERS: usize = 4;
    /// Bounded retry count for EINTR / zero-length sends
    pub const RETRY_LIMIT: usize = 5;
    pub const SO_SNDBUF: i32 = 64 * 1024;
    pub const SO_RCVBUF: i32 = 128 * 1024;
    /// sendfile chunk for the sequential download path
    pub const SENDFILE_CHUNK: usize = 8192;
    pub const LISTEN_BACKLOG: i32 = 1024;
}
