/// Leading byte of every encoded term outside of a distribution header.
pub const VERSION_TAG: u8 = 131;

/// First payload byte of a regular distribution message without an atom
/// cache header.
pub const PASS_THROUGH: u8 = 112;

#[allow(dead_code)]
pub mod tag {
    // Distribution header tags
    pub const DISTRIBUTION_HEADER: u8 = 68;
    pub const DISTRIBUTION_FRAGMENT_HEADER: u8 = 69;

    // Compression
    pub const COMPRESSED: u8 = 80;

    // Atom related constants
    pub const ATOM_UTF8_EXT: u8 = 118;
    pub const SMALL_ATOM_UTF8_EXT: u8 = 119;
    pub const ATOM_EXT: u8 = 100; // deprecated
    pub const SMALL_ATOM_EXT: u8 = 115; // deprecated

    // Integer related constants
    pub const SMALL_INTEGER_EXT: u8 = 97;
    pub const INTEGER_EXT: u8 = 98;

    // Float related constants
    pub const FLOAT_EXT: u8 = 99; // superseded by NEW_FLOAT_EXT
    pub const NEW_FLOAT_EXT: u8 = 70;

    // Port related constants
    pub const PORT_EXT: u8 = 102;
    pub const NEW_PORT_EXT: u8 = 89;
    pub const V4_PORT_EXT: u8 = 120;

    // PID related constants
    pub const PID_EXT: u8 = 103;
    pub const NEW_PID_EXT: u8 = 88;

    // Tuple related constants
    pub const SMALL_TUPLE_EXT: u8 = 104;
    pub const LARGE_TUPLE_EXT: u8 = 105;

    // Map constant
    pub const MAP_EXT: u8 = 116;

    // List related constants
    pub const NIL_EXT: u8 = 106;
    pub const STRING_EXT: u8 = 107;
    pub const LIST_EXT: u8 = 108;

    // Binary related constants
    pub const BINARY_EXT: u8 = 109;
    pub const BIT_BINARY_EXT: u8 = 77;

    // Big number related constants
    pub const SMALL_BIG_EXT: u8 = 110;
    pub const LARGE_BIG_EXT: u8 = 111;

    // Reference related constants
    pub const REFERENCE_EXT: u8 = 101; // deprecated
    pub const NEW_REFERENCE_EXT: u8 = 114;
    pub const NEWER_REFERENCE_EXT: u8 = 90;

    // Function related constants
    pub const FUN_EXT: u8 = 117; // removed in OTP 23, still decodable
    pub const NEW_FUN_EXT: u8 = 112;
    pub const EXPORT_EXT: u8 = 113;
}

pub mod ctrl {
    //! Control message tags for the Erlang distribution protocol

    /// Format: {1, FromPid, ToPid}
    pub const CTRL_LINK: u8 = 1;

    /// Format: {2, Unused, ToPid}, followed by the message
    pub const CTRL_SEND: u8 = 2;

    /// Format: {3, FromPid, ToPid, Reason}
    pub const CTRL_EXIT: u8 = 3;

    /// Format: {4, FromPid, ToPid}
    pub const CTRL_UNLINK: u8 = 4;

    /// Format: {5}
    pub const CTRL_NODE_LINK: u8 = 5;

    /// Format: {6, FromPid, Unused, ToName}, followed by the message
    pub const CTRL_REG_SEND: u8 = 6;

    /// Format: {7, FromPid, ToPid}
    pub const CTRL_GROUP_LEADER: u8 = 7;

    /// Format: {8, FromPid, ToPid, Reason}
    pub const CTRL_EXIT2: u8 = 8;

    /// Format: {12, Unused, ToPid, TraceToken}, followed by the message
    pub const CTRL_SEND_TT: u8 = 12;

    /// Format: {13, FromPid, ToPid, TraceToken, Reason}
    pub const CTRL_EXIT_TT: u8 = 13;

    /// Format: {16, FromPid, Unused, ToName, TraceToken}, followed by the message
    pub const CTRL_REG_SEND_TT: u8 = 16;

    /// Format: {18, FromPid, ToPid, TraceToken, Reason}
    pub const CTRL_EXIT2_TT: u8 = 18;

    /// Format: {19, FromPid, ToProc, Ref}, ToProc is a pid or a registered name
    pub const CTRL_MONITOR_P: u8 = 19;

    /// Format: {20, FromPid, ToProc, Ref}, ToProc is a pid or a registered name
    pub const CTRL_DEMONITOR_P: u8 = 20;

    /// Format: {21, FromProc, ToPid, Ref, Reason}, FromProc is a pid or a registered name
    pub const CTRL_MONITOR_P_EXIT: u8 = 21;

    /// Format: {35, Id, FromPid, ToPid}. Requires DFLAG_UNLINK_ID
    pub const CTRL_UNLINK_ID: u8 = 35;

    /// Format: {36, Id, FromPid, ToPid}
    pub const CTRL_UNLINK_ID_ACK: u8 = 36;
}

/// Distribution capability flags exchanged during the handshake.
#[allow(dead_code)]
pub mod dist_flags {
    /// The node is to be published and part of the global namespace.
    pub const DFLAG_PUBLISHED: u64 = 0x1;

    /// The node implements an atom cache (obsolete).
    pub const DFLAG_ATOM_CACHE: u64 = 0x2;

    /// The node implements extended (3 × 32 bits) references.
    pub const DFLAG_EXTENDED_REFERENCES: u64 = 0x4;

    /// The node implements distributed process monitoring.
    pub const DFLAG_DIST_MONITOR: u64 = 0x8;

    /// The node uses separate tags for funs (lambdas) in the distribution protocol.
    pub const DFLAG_FUN_TAGS: u64 = 0x10;

    /// The node implements distributed named process monitoring.
    pub const DFLAG_DIST_MONITOR_NAME: u64 = 0x20;

    /// The (hidden) node implements atom cache (obsolete).
    pub const DFLAG_HIDDEN_ATOM_CACHE: u64 = 0x40;

    /// The node understands the NEW_FUN_EXT tag.
    pub const DFLAG_NEW_FUN_TAGS: u64 = 0x80;

    /// The node can handle extended pids and ports.
    pub const DFLAG_EXTENDED_PIDS_PORTS: u64 = 0x100;

    /// The node understands the EXPORT_EXT tag.
    pub const DFLAG_EXPORT_PTR_TAG: u64 = 0x200;

    /// The node understands the BIT_BINARY_EXT tag.
    pub const DFLAG_BIT_BINARIES: u64 = 0x400;

    /// The node understands the NEW_FLOAT_EXT tag.
    pub const DFLAG_NEW_FLOATS: u64 = 0x800;

    /// Unicode IO support flag
    pub const DFLAG_UNICODE_IO: u64 = 0x1000;

    /// The node implements atom cache in distribution header.
    pub const DFLAG_DIST_HDR_ATOM_CACHE: u64 = 0x2000;

    /// The node understands the SMALL_ATOM_EXT tag.
    pub const DFLAG_SMALL_ATOM_TAGS: u64 = 0x4000;

    /// The node understands UTF-8 atoms.
    pub const DFLAG_UTF8_ATOMS: u64 = 0x10000;

    /// The node understands the map tag MAP_EXT.
    pub const DFLAG_MAP_TAG: u64 = 0x20000;

    /// The node understands big node creation tags (NEW_PID_EXT, NEW_PORT_EXT, NEWER_REFERENCE_EXT).
    pub const DFLAG_BIG_CREATION: u64 = 0x40000;

    /// Use SEND_SENDER instead of SEND.
    pub const DFLAG_SEND_SENDER: u64 = 0x80000;

    /// The node understands any term as the seqtrace label.
    pub const DFLAG_BIG_SEQTRACE_LABELS: u64 = 0x100000;

    /// Use PAYLOAD variants of exit-related control messages.
    pub const DFLAG_EXIT_PAYLOAD: u64 = 0x400000;

    /// Use fragmented distribution messages to send large messages.
    pub const DFLAG_FRAGMENTS: u64 = 0x800000;

    /// The node supports the version 6 connection setup handshake.
    pub const DFLAG_HANDSHAKE_23: u64 = 0x1000000;

    /// Use the new link protocol (UNLINK_ID / UNLINK_ID_ACK).
    pub const DFLAG_UNLINK_ID: u64 = 0x2000000;

    /// Request to receive node name from accepting node during handshake.
    pub const DFLAG_NAME_ME: u64 = 1 << 33;

    /// The node accepts larger pids, ports and references (node container v4).
    pub const DFLAG_V4_NC: u64 = 1 << 34;

    /// All flags mandatory for OTP 26 compatibility
    pub fn mandatory_flags() -> u64 {
        DFLAG_EXTENDED_REFERENCES
            | DFLAG_FUN_TAGS
            | DFLAG_NEW_FUN_TAGS
            | DFLAG_EXTENDED_PIDS_PORTS
            | DFLAG_EXPORT_PTR_TAG
            | DFLAG_BIT_BINARIES
            | DFLAG_NEW_FLOATS
            | DFLAG_UTF8_ATOMS
            | DFLAG_MAP_TAG
            | DFLAG_BIG_CREATION
            | DFLAG_HANDSHAKE_23
            | DFLAG_UNLINK_ID
            | DFLAG_V4_NC
    }

    /// Flags this node advertises: the mandatory set plus monitoring support.
    pub fn default_flags() -> u64 {
        mandatory_flags() | DFLAG_DIST_MONITOR | DFLAG_DIST_MONITOR_NAME | DFLAG_SMALL_ATOM_TAGS
    }
}

#[cfg(test)]
mod tests {
    use super::dist_flags::*;

    #[test]
    fn test_default_flags_cover_mandatory() {
        let flags = default_flags();
        assert_eq!(flags & mandatory_flags(), mandatory_flags());
        assert_eq!(flags & DFLAG_DIST_HDR_ATOM_CACHE, 0);
        assert_eq!(flags & DFLAG_FRAGMENTS, 0);
    }

    #[test]
    fn test_high_flags_need_64_bits() {
        assert!(DFLAG_V4_NC > u32::MAX as u64);
        assert!(DFLAG_NAME_ME > u32::MAX as u64);
    }
}
