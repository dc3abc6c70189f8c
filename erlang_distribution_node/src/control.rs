//! Control tuples that head every message on a regular connection.

use crate::error::ControlError;
use crate::etf::consts::ctrl::*;
use crate::etf::{Atom, Pid, Reference, Term};

/// Slot that may name a process either by pid or by registered name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Destination {
    Pid(Pid),
    Name(Atom),
}

impl From<Pid> for Destination {
    fn from(pid: Pid) -> Self {
        Destination::Pid(pid)
    }
}

impl From<Atom> for Destination {
    fn from(name: Atom) -> Self {
        Destination::Name(name)
    }
}

impl From<&Destination> for Term {
    fn from(dest: &Destination) -> Self {
        match dest {
            Destination::Pid(pid) => Term::Pid(pid.clone()),
            Destination::Name(name) => Term::Atom(name.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Link {
        from: Pid,
        to: Pid,
    },
    Send {
        to: Destination,
    },
    Exit {
        from: Pid,
        to: Pid,
        reason: Term,
    },
    Unlink {
        from: Pid,
        to: Pid,
    },
    NodeLink,
    RegSend {
        from: Pid,
        to: Atom,
    },
    GroupLeader {
        from: Pid,
        to: Pid,
    },
    Exit2 {
        from: Pid,
        to: Pid,
        reason: Term,
    },
    SendTT {
        to: Destination,
        token: Term,
    },
    ExitTT {
        from: Pid,
        to: Pid,
        token: Term,
        reason: Term,
    },
    RegSendTT {
        from: Pid,
        to: Atom,
        token: Term,
    },
    Exit2TT {
        from: Pid,
        to: Pid,
        token: Term,
        reason: Term,
    },
    MonitorP {
        from: Pid,
        to: Destination,
        reference: Reference,
    },
    DemonitorP {
        from: Pid,
        to: Destination,
        reference: Reference,
    },
    MonitorPExit {
        from: Destination,
        to: Pid,
        reference: Reference,
        reason: Term,
    },
    UnlinkId {
        id: u64,
        from: Pid,
        to: Pid,
    },
    UnlinkIdAck {
        id: u64,
        from: Pid,
        to: Pid,
    },
}

struct Slots<'a> {
    name: &'static str,
    elements: &'a [Term],
}

impl<'a> Slots<'a> {
    fn new(name: &'static str, elements: &'a [Term], arity: usize) -> Result<Self, ControlError> {
        if elements.len() != arity {
            return Err(ControlError::Arity {
                name,
                expected: arity,
                actual: elements.len(),
            });
        }
        Ok(Slots { name, elements })
    }

    fn error(&self, slot: usize, expected: &'static str) -> ControlError {
        ControlError::Slot {
            name: self.name,
            slot,
            expected,
        }
    }

    fn any(&self, slot: usize) -> Term {
        self.elements[slot].clone()
    }

    fn pid(&self, slot: usize) -> Result<Pid, ControlError> {
        self.elements[slot]
            .as_pid()
            .cloned()
            .ok_or_else(|| self.error(slot, "a pid"))
    }

    fn atom(&self, slot: usize) -> Result<Atom, ControlError> {
        self.elements[slot]
            .as_atom()
            .cloned()
            .ok_or_else(|| self.error(slot, "an atom"))
    }

    fn destination(&self, slot: usize) -> Result<Destination, ControlError> {
        match &self.elements[slot] {
            Term::Pid(pid) => Ok(Destination::Pid(pid.clone())),
            Term::Atom(name) => Ok(Destination::Name(name.clone())),
            _ => Err(self.error(slot, "a pid or an atom")),
        }
    }

    fn reference(&self, slot: usize) -> Result<Reference, ControlError> {
        self.elements[slot]
            .as_reference()
            .cloned()
            .ok_or_else(|| self.error(slot, "a reference"))
    }

    fn id(&self, slot: usize) -> Result<u64, ControlError> {
        self.elements[slot]
            .as_integer()
            .and_then(|id| u64::try_from(&id).ok())
            .ok_or_else(|| self.error(slot, "an unsigned 64 bit integer"))
    }
}

impl ControlMessage {
    pub fn parse(term: &Term) -> Result<Self, ControlError> {
        let elements = term.as_tuple().ok_or(ControlError::NotATuple)?;
        let tag = elements
            .first()
            .and_then(Term::as_i64)
            .ok_or(ControlError::MissingTag)?;
        let tag_byte = u8::try_from(tag).map_err(|_| ControlError::UnknownTag(tag))?;

        let name = tag_name(tag_byte).ok_or(ControlError::UnknownTag(tag))?;
        let s = |arity| Slots::new(name, elements, arity);

        let message = match tag_byte {
            CTRL_LINK => {
                let s = s(3)?;
                ControlMessage::Link {
                    from: s.pid(1)?,
                    to: s.pid(2)?,
                }
            }
            CTRL_SEND => {
                let s = s(3)?;
                ControlMessage::Send {
                    to: s.destination(2)?,
                }
            }
            CTRL_EXIT => {
                let s = s(4)?;
                ControlMessage::Exit {
                    from: s.pid(1)?,
                    to: s.pid(2)?,
                    reason: s.any(3),
                }
            }
            CTRL_UNLINK => {
                let s = s(3)?;
                ControlMessage::Unlink {
                    from: s.pid(1)?,
                    to: s.pid(2)?,
                }
            }
            CTRL_NODE_LINK => {
                s(1)?;
                ControlMessage::NodeLink
            }
            CTRL_REG_SEND => {
                let s = s(4)?;
                ControlMessage::RegSend {
                    from: s.pid(1)?,
                    to: s.atom(3)?,
                }
            }
            CTRL_GROUP_LEADER => {
                let s = s(3)?;
                ControlMessage::GroupLeader {
                    from: s.pid(1)?,
                    to: s.pid(2)?,
                }
            }
            CTRL_EXIT2 => {
                let s = s(4)?;
                ControlMessage::Exit2 {
                    from: s.pid(1)?,
                    to: s.pid(2)?,
                    reason: s.any(3),
                }
            }
            CTRL_SEND_TT => {
                let s = s(4)?;
                ControlMessage::SendTT {
                    to: s.destination(2)?,
                    token: s.any(3),
                }
            }
            CTRL_EXIT_TT => {
                let s = s(5)?;
                ControlMessage::ExitTT {
                    from: s.pid(1)?,
                    to: s.pid(2)?,
                    token: s.any(3),
                    reason: s.any(4),
                }
            }
            CTRL_REG_SEND_TT => {
                let s = s(5)?;
                ControlMessage::RegSendTT {
                    from: s.pid(1)?,
                    to: s.atom(3)?,
                    token: s.any(4),
                }
            }
            CTRL_EXIT2_TT => {
                let s = s(5)?;
                ControlMessage::Exit2TT {
                    from: s.pid(1)?,
                    to: s.pid(2)?,
                    token: s.any(3),
                    reason: s.any(4),
                }
            }
            CTRL_MONITOR_P => {
                let s = s(4)?;
                ControlMessage::MonitorP {
                    from: s.pid(1)?,
                    to: s.destination(2)?,
                    reference: s.reference(3)?,
                }
            }
            CTRL_DEMONITOR_P => {
                let s = s(4)?;
                ControlMessage::DemonitorP {
                    from: s.pid(1)?,
                    to: s.destination(2)?,
                    reference: s.reference(3)?,
                }
            }
            CTRL_MONITOR_P_EXIT => {
                let s = s(5)?;
                ControlMessage::MonitorPExit {
                    from: s.destination(1)?,
                    to: s.pid(2)?,
                    reference: s.reference(3)?,
                    reason: s.any(4),
                }
            }
            CTRL_UNLINK_ID => {
                let s = s(4)?;
                ControlMessage::UnlinkId {
                    id: s.id(1)?,
                    from: s.pid(2)?,
                    to: s.pid(3)?,
                }
            }
            CTRL_UNLINK_ID_ACK => {
                let s = s(4)?;
                ControlMessage::UnlinkIdAck {
                    id: s.id(1)?,
                    from: s.pid(2)?,
                    to: s.pid(3)?,
                }
            }
            _ => return Err(ControlError::UnknownTag(tag)),
        };
        Ok(message)
    }

    pub fn tag(&self) -> u8 {
        match self {
            ControlMessage::Link { .. } => CTRL_LINK,
            ControlMessage::Send { .. } => CTRL_SEND,
            ControlMessage::Exit { .. } => CTRL_EXIT,
            ControlMessage::Unlink { .. } => CTRL_UNLINK,
            ControlMessage::NodeLink => CTRL_NODE_LINK,
            ControlMessage::RegSend { .. } => CTRL_REG_SEND,
            ControlMessage::GroupLeader { .. } => CTRL_GROUP_LEADER,
            ControlMessage::Exit2 { .. } => CTRL_EXIT2,
            ControlMessage::SendTT { .. } => CTRL_SEND_TT,
            ControlMessage::ExitTT { .. } => CTRL_EXIT_TT,
            ControlMessage::RegSendTT { .. } => CTRL_REG_SEND_TT,
            ControlMessage::Exit2TT { .. } => CTRL_EXIT2_TT,
            ControlMessage::MonitorP { .. } => CTRL_MONITOR_P,
            ControlMessage::DemonitorP { .. } => CTRL_DEMONITOR_P,
            ControlMessage::MonitorPExit { .. } => CTRL_MONITOR_P_EXIT,
            ControlMessage::UnlinkId { .. } => CTRL_UNLINK_ID,
            ControlMessage::UnlinkIdAck { .. } => CTRL_UNLINK_ID_ACK,
        }
    }

    pub fn name(&self) -> &'static str {
        tag_name(self.tag()).unwrap_or("UNKNOWN")
    }

    /// Whether a message body follows the control term on the wire.
    pub fn has_payload(&self) -> bool {
        matches!(
            self,
            ControlMessage::Send { .. }
                | ControlMessage::RegSend { .. }
                | ControlMessage::SendTT { .. }
                | ControlMessage::RegSendTT { .. }
        )
    }

    pub fn to_tuple(&self) -> Term {
        let pid = |p: &Pid| Term::Pid(p.clone());
        let reference = |r: &Reference| Term::Reference(r.clone());
        let mut elements = vec![Term::from(self.tag())];
        match self {
            ControlMessage::Link { from, to }
            | ControlMessage::Unlink { from, to }
            | ControlMessage::GroupLeader { from, to } => {
                elements.extend([pid(from), pid(to)]);
            }
            ControlMessage::Send { to } => {
                elements.extend([Term::Nil, to.into()]);
            }
            ControlMessage::Exit { from, to, reason }
            | ControlMessage::Exit2 { from, to, reason } => {
                elements.extend([pid(from), pid(to), reason.clone()]);
            }
            ControlMessage::NodeLink => {}
            ControlMessage::RegSend { from, to } => {
                elements.extend([pid(from), Term::Nil, Term::Atom(to.clone())]);
            }
            ControlMessage::SendTT { to, token } => {
                elements.extend([Term::Nil, to.into(), token.clone()]);
            }
            ControlMessage::ExitTT {
                from,
                to,
                token,
                reason,
            }
            | ControlMessage::Exit2TT {
                from,
                to,
                token,
                reason,
            } => {
                elements.extend([pid(from), pid(to), token.clone(), reason.clone()]);
            }
            ControlMessage::RegSendTT { from, to, token } => {
                elements.extend([pid(from), Term::Nil, Term::Atom(to.clone()), token.clone()]);
            }
            ControlMessage::MonitorP {
                from,
                to,
                reference: r,
            }
            | ControlMessage::DemonitorP {
                from,
                to,
                reference: r,
            } => {
                elements.extend([pid(from), to.into(), reference(r)]);
            }
            ControlMessage::MonitorPExit {
                from,
                to,
                reference: r,
                reason,
            } => {
                elements.extend([from.into(), pid(to), reference(r), reason.clone()]);
            }
            ControlMessage::UnlinkId { id, from, to }
            | ControlMessage::UnlinkIdAck { id, from, to } => {
                elements.extend([Term::from(*id), pid(from), pid(to)]);
            }
        }
        Term::Tuple(elements)
    }
}

fn tag_name(tag: u8) -> Option<&'static str> {
    let name = match tag {
        CTRL_LINK => "LINK",
        CTRL_SEND => "SEND",
        CTRL_EXIT => "EXIT",
        CTRL_UNLINK => "UNLINK",
        CTRL_NODE_LINK => "NODE_LINK",
        CTRL_REG_SEND => "REG_SEND",
        CTRL_GROUP_LEADER => "GROUP_LEADER",
        CTRL_EXIT2 => "EXIT2",
        CTRL_SEND_TT => "SEND_TT",
        CTRL_EXIT_TT => "EXIT_TT",
        CTRL_REG_SEND_TT => "REG_SEND_TT",
        CTRL_EXIT2_TT => "EXIT2_TT",
        CTRL_MONITOR_P => "MONITOR_P",
        CTRL_DEMONITOR_P => "DEMONITOR_P",
        CTRL_MONITOR_P_EXIT => "MONITOR_P_EXIT",
        CTRL_UNLINK_ID => "UNLINK_ID",
        CTRL_UNLINK_ID_ACK => "UNLINK_ID_ACK",
        _ => return None,
    };
    Some(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(id: u32) -> Pid {
        Pid::new(Atom::new("a@host"), id, 0, 1)
    }

    fn reference() -> Reference {
        Reference {
            node: Atom::new("a@host"),
            creation: 1,
            ids: vec![1, 2, 3],
        }
    }

    fn all_variants() -> Vec<ControlMessage> {
        let reason = Term::atom("killed");
        let token = Term::tuple(vec![Term::from(0), Term::atom("label")]);
        vec![
            ControlMessage::Link { from: pid(1), to: pid(2) },
            ControlMessage::Send { to: pid(2).into() },
            ControlMessage::Send { to: Atom::new("echo").into() },
            ControlMessage::Exit { from: pid(1), to: pid(2), reason: reason.clone() },
            ControlMessage::Unlink { from: pid(1), to: pid(2) },
            ControlMessage::NodeLink,
            ControlMessage::RegSend { from: pid(1), to: Atom::new("echo") },
            ControlMessage::GroupLeader { from: pid(1), to: pid(2) },
            ControlMessage::Exit2 { from: pid(1), to: pid(2), reason: reason.clone() },
            ControlMessage::SendTT { to: pid(2).into(), token: token.clone() },
            ControlMessage::ExitTT {
                from: pid(1),
                to: pid(2),
                token: token.clone(),
                reason: reason.clone(),
            },
            ControlMessage::RegSendTT { from: pid(1), to: Atom::new("echo"), token: token.clone() },
            ControlMessage::Exit2TT {
                from: pid(1),
                to: pid(2),
                token,
                reason: reason.clone(),
            },
            ControlMessage::MonitorP { from: pid(1), to: Atom::new("echo").into(), reference: reference() },
            ControlMessage::DemonitorP { from: pid(1), to: pid(2).into(), reference: reference() },
            ControlMessage::MonitorPExit {
                from: pid(2).into(),
                to: pid(1),
                reference: reference(),
                reason,
            },
            ControlMessage::UnlinkId { id: u64::MAX, from: pid(1), to: pid(2) },
            ControlMessage::UnlinkIdAck { id: 7, from: pid(2), to: pid(1) },
        ]
    }

    #[test]
    fn test_round_trip_every_variant() {
        for message in all_variants() {
            let tuple = message.to_tuple();
            assert_eq!(tuple.element(0), Some(&Term::from(message.tag())));
            assert_eq!(ControlMessage::parse(&tuple), Ok(message));
        }
    }

    #[test]
    fn test_payload_flags() {
        let with_body: Vec<&str> = all_variants()
            .iter()
            .filter(|m| m.has_payload())
            .map(|m| m.name())
            .collect();
        assert_eq!(with_body, vec!["SEND", "SEND", "REG_SEND", "SEND_TT", "REG_SEND_TT"]);
    }

    #[test]
    fn test_unused_slot_is_ignored() {
        let tuple = Term::tuple(vec![Term::from(2), Term::atom("cookie"), Term::Pid(pid(5))]);
        assert_eq!(
            ControlMessage::parse(&tuple),
            Ok(ControlMessage::Send { to: pid(5).into() })
        );
    }

    #[test]
    fn test_slot_validation_names_the_slot() {
        let tuple = Term::tuple(vec![Term::from(1), Term::Pid(pid(1)), Term::atom("nope")]);
        assert_eq!(
            ControlMessage::parse(&tuple),
            Err(ControlError::Slot {
                name: "LINK",
                slot: 2,
                expected: "a pid"
            })
        );

        let tuple = Term::tuple(vec![Term::from(2), Term::Nil, Term::from(3)]);
        assert_eq!(
            ControlMessage::parse(&tuple),
            Err(ControlError::Slot {
                name: "SEND",
                slot: 2,
                expected: "a pid or an atom"
            })
        );
    }

    #[test]
    fn test_shape_errors() {
        assert_eq!(ControlMessage::parse(&Term::Nil), Err(ControlError::NotATuple));
        assert_eq!(
            ControlMessage::parse(&Term::tuple(vec![Term::atom("x")])),
            Err(ControlError::MissingTag)
        );
        assert_eq!(
            ControlMessage::parse(&Term::tuple(vec![Term::from(99)])),
            Err(ControlError::UnknownTag(99))
        );
        assert_eq!(
            ControlMessage::parse(&Term::tuple(vec![Term::from(1), Term::Pid(pid(1))])),
            Err(ControlError::Arity {
                name: "LINK",
                expected: 3,
                actual: 2
            })
        );
    }
}
