/// Numeric status code carried in the `Status:` response header. Success is
/// 0; failures are returned as the negated code.
#[allow(non_camel_case_types)]
pub type status_code_t = i32;

/// POSIX errno values used by the wire protocol. Pinned here rather than
/// taken from the platform so that logs and checkpoints read the same on
/// every host.
pub mod Errno {
    use super::status_code_t;

    pub const EPERM: status_code_t = 1;
    pub const ENOENT: status_code_t = 2;
    pub const EIO: status_code_t = 5;
    pub const EBUSY: status_code_t = 16;
    pub const EEXIST: status_code_t = 17;
    pub const ENOTDIR: status_code_t = 20;
    pub const EISDIR: status_code_t = 21;
    pub const EINVAL: status_code_t = 22;
    pub const ENOSPC: status_code_t = 28;
    pub const ENOSYS: status_code_t = 38;
    pub const ENOTEMPTY: status_code_t = 39;
    pub const EHOSTUNREACH: status_code_t = 113;
}

/// KFS-specific codes, reserved block starting at 1000.
pub mod KfsCode {
    use super::status_code_t;

    /// Chunk version presented by a client does not match the server's.
    pub const EBADVERS: status_code_t = 1000;
    /// Lease has expired.
    pub const ELEASEEXPIRED: status_code_t = 1001;
    /// Checksum for data on a server is bad; read from elsewhere.
    pub const EBADCKSUM: status_code_t = 1002;
    /// All chunkservers hosting the data are unreachable.
    pub const EDATAUNAVAIL: status_code_t = 1003;
    /// Server is busy and cannot take on new work.
    pub const ESERVERBUSY: status_code_t = 1004;
    /// Allocation failed mid-flight; the client should retry.
    pub const EALLOCFAILED: status_code_t = 1005;
}

/// Symbolic name for a status code, for diagnostics.
pub fn to_string(code: status_code_t) -> &'static str {
    match code {
        0 => "OK",
        Errno::EPERM => "EPERM",
        Errno::ENOENT => "ENOENT",
        Errno::EIO => "EIO",
        Errno::EBUSY => "EBUSY",
        Errno::EEXIST => "EEXIST",
        Errno::ENOTDIR => "ENOTDIR",
        Errno::EISDIR => "EISDIR",
        Errno::EINVAL => "EINVAL",
        Errno::ENOSPC => "ENOSPC",
        Errno::ENOSYS => "ENOSYS",
        Errno::ENOTEMPTY => "ENOTEMPTY",
        Errno::EHOSTUNREACH => "EHOSTUNREACH",
        KfsCode::EBADVERS => "EBADVERS",
        KfsCode::ELEASEEXPIRED => "ELEASEEXPIRED",
        KfsCode::EBADCKSUM => "EBADCKSUM",
        KfsCode::EDATAUNAVAIL => "EDATAUNAVAIL",
        KfsCode::ESERVERBUSY => "ESERVERBUSY",
        KfsCode::EALLOCFAILED => "EALLOCFAILED",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_block() {
        assert_eq!(KfsCode::EBADVERS, 1000);
        assert_eq!(KfsCode::EALLOCFAILED, 1005);
    }

    #[test]
    fn test_to_string() {
        assert_eq!(to_string(0), "OK");
        assert_eq!(to_string(Errno::ENOENT), "ENOENT");
        assert_eq!(to_string(KfsCode::EALLOCFAILED), "EALLOCFAILED");
        assert_eq!(to_string(4242), "Unknown");
    }
}
