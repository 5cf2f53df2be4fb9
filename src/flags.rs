//! Packed flag words.
//!
//! The original C structs pack all per-PD state bits into one `uint32_t
//! flags` field and test them with `ISSET_FLAG`/`SET_FLAG`/`CLEAR_FLAG`
//! macros. The packed representation is kept here for size and testability
//! parity (`SPEC_FULL.md` §9), but callers never touch the bits directly —
//! `crate::pd::PdState` exposes named accessors instead.

bitflags::bitflags! {
    /// Per-PD state bits (`PD_FLAG_*` in the original header).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PdFlags: u16 {
        /// PD advertises secure channel support in its capability table.
        const SC_CAPABLE      = 1 << 0;
        /// Local tamper condition latched from the last `LSTATR`.
        const TAMPER          = 1 << 1;
        /// Local power condition latched from the last `LSTATR`.
        const POWER           = 1 << 2;
        /// Remote tamper condition (downstream PD, RS-485 multidrop).
        const R_TAMPER        = 1 << 3;
        /// A command has been sent and a reply is pending.
        const AWAIT_RESP      = 1 << 4;
        /// Sequence checks are disabled (debug only).
        const SKIP_SEQ_CHECK  = 1 << 5;
        /// The current secure channel attempt is using SCBKD.
        const SC_USE_SCBKD    = 1 << 6;
        /// The secure channel is established and active.
        const SC_ACTIVE       = 1 << 7;
        /// A SCBKD-vs-SCBK determination has been made for this session.
        const SC_SCBKD_DONE   = 1 << 8;
        /// This context is configured as a PD rather than a CP.
        const PD_MODE         = 1 << 9;
        /// This PD shares its physical channel with others.
        const CHN_SHARED      = 1 << 10;
        /// Packets should be emitted without a leading 0xFF mark byte.
        const PKT_SKIP_MARK   = 1 << 11;
        /// The last received packet carried a mark byte.
        const PKT_HAS_MARK    = 1 << 12;
        /// This PD has a provisioned, non-default SCBK.
        const HAS_SCBK        = 1 << 13;
    }
}

bitflags::bitflags! {
    /// Context-wide flags (`FLAG_*` in the original header).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ContextFlags: u8 {
        /// Context is operating as a Control Panel.
        const CP_MODE       = 1 << 0;
        /// Secure channel was disabled at setup (no master key given).
        const SC_DISABLED   = 1 << 1;
    }
}
