//! The static AT-command descriptor table (§3, §4.1 "CommandDescriptor").
//!
//! The reader classifies an incoming line by binary-searching this table for
//! the longest command body that is a byte-for-byte prefix of the line,
//! immediately followed by `:`. Commands whose response carries no `+NAME:`
//! label (a bare string line, or a plain `OK`) are never placed in the table;
//! their shape is described instead by [`spec`].

/// Numeric id for every AT command this driver speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommandId {
    Cclk,
    Cereg,
    Cfun,
    Cgatt,
    Cgdcont,
    Cgerep,
    Cgev,
    Cgreg,
    Cmee,
    Cmgd,
    Cmgf,
    Cmgl,
    Cmgr,
    Cmgs,
    Cmti,
    Cops,
    Cpms,
    Creg,
    Csca,
    Csq,
    Gsn,
    Qccid,
    Qcfg,
    Qeng,
    Qfdel,
    Qfupl,
    Qgps,
    Qgpscfg,
    Qgpsend,
    Qgpsloc,
    Qiact,
    Qiclose,
    Qicsgp,
    Qideact,
    Qidnscfg,
    Qidnsgip,
    Qiopen,
    Qird,
    Qisend,
    Qiurc,
    Qsslcfg,
    Qsslclose,
    Qsslopen,
    Qsslrecv,
    Qsslsend,
    Qsslurc,
}

/// How many lines of content precede the terminal `OK` (or error), and what
/// they look like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ResponseStyle {
    /// Nothing but `OK`/`ERROR` — a pure set command.
    OnlyOk,
    /// One `+NAME: a,b,c` line, then `OK`.
    ParamLineThenOk,
    /// One bare (unlabelled) line, then `OK`. Used by `+GSN`.
    RawStringOnly,
    /// One `+NAME: "..."` line carrying a single string payload, then `OK`.
    RawStringThenOk,
    /// A variable number of lines accumulate until `OK` (`+CMGL`).
    Iterator,
}

/// A row of the static command table.
#[derive(Debug, Clone, Copy)]
pub struct CommandDescriptor {
    pub id: CommandId,
    pub body: &'static [u8],
}

/// Sorted (ascending, by `body` bytes) so the reader can binary-search it.
pub static DESCRIPTOR_TABLE: &[CommandDescriptor] = &[
    CommandDescriptor { id: CommandId::Cclk, body: b"+CCLK" },
    CommandDescriptor { id: CommandId::Cereg, body: b"+CEREG" },
    CommandDescriptor { id: CommandId::Cgev, body: b"+CGEV" },
    CommandDescriptor { id: CommandId::Cgreg, body: b"+CGREG" },
    CommandDescriptor { id: CommandId::Cmgl, body: b"+CMGL" },
    CommandDescriptor { id: CommandId::Cmgr, body: b"+CMGR" },
    CommandDescriptor { id: CommandId::Cmgs, body: b"+CMGS" },
    CommandDescriptor { id: CommandId::Cmti, body: b"+CMTI" },
    CommandDescriptor { id: CommandId::Cops, body: b"+COPS" },
    CommandDescriptor { id: CommandId::Creg, body: b"+CREG" },
    CommandDescriptor { id: CommandId::Csca, body: b"+CSCA" },
    CommandDescriptor { id: CommandId::Csq, body: b"+CSQ" },
    CommandDescriptor { id: CommandId::Qccid, body: b"+QCCID" },
    CommandDescriptor { id: CommandId::Qcfg, body: b"+QCFG" },
    CommandDescriptor { id: CommandId::Qeng, body: b"+QENG" },
    CommandDescriptor { id: CommandId::Qgpsloc, body: b"+QGPSLOC" },
    CommandDescriptor { id: CommandId::Qiopen, body: b"+QIOPEN" },
    CommandDescriptor { id: CommandId::Qird, body: b"+QIRD" },
    CommandDescriptor { id: CommandId::Qisend, body: b"+QISEND" },
    CommandDescriptor { id: CommandId::Qiurc, body: b"+QIURC" },
    CommandDescriptor { id: CommandId::Qsslopen, body: b"+QSSLOPEN" },
    CommandDescriptor { id: CommandId::Qsslrecv, body: b"+QSSLRECV" },
    CommandDescriptor { id: CommandId::Qsslsend, body: b"+QSSLSEND" },
    CommandDescriptor { id: CommandId::Qsslurc, body: b"+QSSLURC" },
];

/// Per-command behaviour the mode/slot scheduler needs (§4.2-§4.3).
#[derive(Debug, Clone, Copy)]
pub struct CommandSpec {
    pub style: ResponseStyle,
    /// Carries URCs unrelated to any pending slot (`+CEREG`, `+QIURC`, ...).
    pub urc_bearing: bool,
    /// Belongs to the PROMPT-mode send-payload set (`>` transition).
    pub send_payload: bool,
    /// Switches the loop into BUFFER mode on its labelled response line.
    pub buffer_reading: bool,
    /// Switches the loop into BUFFER mode on a `CONNECT` line (file upload).
    pub file_upload: bool,
}

const fn spec_of(style: ResponseStyle) -> CommandSpec {
    CommandSpec {
        style,
        urc_bearing: false,
        send_payload: false,
        buffer_reading: false,
        file_upload: false,
    }
}

/// Behavioural descriptor for every command id, independent of whether it
/// has a table row (bare-line and pure-OK commands do not).
pub const fn spec(id: CommandId) -> CommandSpec {
    use CommandId::*;
    use ResponseStyle::*;
    match id {
        Cclk => spec_of(RawStringThenOk),
        Cereg => CommandSpec { urc_bearing: true, ..spec_of(ParamLineThenOk) },
        Cfun => spec_of(OnlyOk),
        Cgatt => spec_of(OnlyOk),
        Cgdcont => spec_of(OnlyOk),
        Cgerep => spec_of(OnlyOk),
        Cgev => CommandSpec { urc_bearing: true, ..spec_of(RawStringOnly) },
        Cgreg => CommandSpec { urc_bearing: true, ..spec_of(ParamLineThenOk) },
        Cmee => spec_of(OnlyOk),
        Cmgd => spec_of(OnlyOk),
        Cmgf => spec_of(OnlyOk),
        Cmgl => spec_of(Iterator),
        Cmgr => spec_of(ParamLineThenOk),
        Cmgs => CommandSpec { send_payload: true, ..spec_of(ParamLineThenOk) },
        Cmti => CommandSpec { urc_bearing: true, ..spec_of(RawStringOnly) },
        Cops => spec_of(ParamLineThenOk),
        Cpms => spec_of(OnlyOk),
        Creg => CommandSpec { urc_bearing: true, ..spec_of(ParamLineThenOk) },
        Csca => spec_of(ParamLineThenOk),
        Csq => spec_of(ParamLineThenOk),
        Gsn => spec_of(RawStringOnly),
        Qccid => spec_of(RawStringThenOk),
        Qcfg => spec_of(ParamLineThenOk),
        Qeng => spec_of(ParamLineThenOk),
        Qfdel => spec_of(OnlyOk),
        Qfupl => CommandSpec { file_upload: true, ..spec_of(OnlyOk) },
        Qgps => spec_of(OnlyOk),
        Qgpscfg => spec_of(OnlyOk),
        Qgpsend => spec_of(OnlyOk),
        Qgpsloc => spec_of(ParamLineThenOk),
        Qiact => spec_of(OnlyOk),
        Qiclose => spec_of(OnlyOk),
        Qicsgp => spec_of(OnlyOk),
        Qideact => spec_of(OnlyOk),
        Qidnscfg => spec_of(OnlyOk),
        Qidnsgip => spec_of(OnlyOk),
        Qiopen => CommandSpec { urc_bearing: true, ..spec_of(OnlyOk) },
        Qird => CommandSpec { buffer_reading: true, ..spec_of(ParamLineThenOk) },
        // A payload write (length > 0) ends on a bare "SEND OK" / "SEND
        // FAIL" line, matched separately in the reader loop. The
        // zero-length query form (`+QISEND=<id>,0`, used to poll unacked
        // bytes) instead returns a labelled "+QISEND: ..." triple, which is
        // what this `ParamLineThenOk` styling is for.
        Qisend => CommandSpec { send_payload: true, ..spec_of(ParamLineThenOk) },
        Qiurc => CommandSpec { urc_bearing: true, ..spec_of(RawStringOnly) },
        Qsslcfg => spec_of(OnlyOk),
        Qsslclose => spec_of(OnlyOk),
        Qsslopen => CommandSpec { urc_bearing: true, ..spec_of(OnlyOk) },
        Qsslrecv => CommandSpec { buffer_reading: true, ..spec_of(ParamLineThenOk) },
        Qsslsend => CommandSpec { send_payload: true, ..spec_of(ParamLineThenOk) },
        Qsslurc => CommandSpec { urc_bearing: true, ..spec_of(RawStringOnly) },
    }
}

/// Find the descriptor whose body is the longest byte-prefix of `line`,
/// immediately followed by `:`.
///
/// Implemented as a "floor" binary search: locate the greatest table entry
/// whose body sorts at or below `line`, then verify it is in fact a prefix.
/// Because the table is sorted and no body is a suffix of another's tail,
/// the floor entry is the unique candidate worth checking.
pub fn classify(line: &[u8]) -> Option<CommandId> {
    let mut lo = 0usize;
    let mut hi = DESCRIPTOR_TABLE.len();
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if DESCRIPTOR_TABLE[mid].body <= line {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    if lo == 0 {
        return None;
    }
    let candidate = &DESCRIPTOR_TABLE[lo - 1];
    let body = candidate.body;
    if line.len() > body.len() && &line[..body.len()] == body && line[body.len()] == b':' {
        Some(candidate.id)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_sorted() {
        for pair in DESCRIPTOR_TABLE.windows(2) {
            assert!(pair[0].body < pair[1].body, "{:?} >= {:?}", pair[0].body, pair[1].body);
        }
    }

    #[test]
    fn matches_exact_longer_prefix_not_shorter_sibling() {
        assert_eq!(classify(b"+QIRD: 10"), Some(CommandId::Qird));
        assert_eq!(classify(b"+QIOPEN: 0,0"), Some(CommandId::Qiopen));
    }

    #[test]
    fn rejects_non_colon_suffix() {
        // +QI is a prefix of +QIOPEN's body but not followed by ':'.
        assert_eq!(classify(b"+QIOPENISH: x"), None);
    }

    #[test]
    fn rejects_short_prefix_masquerade() {
        assert_eq!(classify(b"+QI: 1"), None);
    }

    #[test]
    fn no_match_for_unknown_command() {
        assert_eq!(classify(b"+QFOO: 1"), None);
    }

    #[test]
    fn cereg_is_urc_bearing() {
        assert!(spec(CommandId::Cereg).urc_bearing);
        assert!(!spec(CommandId::Cmgs).urc_bearing);
    }
}
