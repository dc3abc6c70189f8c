use std::io;

use crate::config::Compression;
use crate::control::ControlMessage;
use crate::error::MessageError;
use crate::etf::consts::PASS_THROUGH;
use crate::etf::{self, DecodeLimits, Term, TermBackend};

/// Control term plus, for the send family, the message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistMessage {
    pub control: ControlMessage,
    pub body: Option<Term>,
}

impl DistMessage {
    pub fn control(control: ControlMessage) -> Self {
        DistMessage { control, body: None }
    }

    pub fn with_body(control: ControlMessage, body: Term) -> Self {
        DistMessage {
            control,
            body: Some(body),
        }
    }

    /// Frame payload: `112`, the control term, then the body if any.
    pub fn encode(&self, compression: Option<&Compression>) -> io::Result<Vec<u8>> {
        let mut out = vec![PASS_THROUGH];
        out.extend(etf::encode(&self.control.to_tuple())?);
        if let Some(body) = &self.body {
            let plain = etf::encode(body)?;
            match compression {
                Some(c) if plain.len() > c.threshold => out.extend(etf::encode_compressed(body, c.level)?),
                _ => out.extend(plain),
            }
        }
        Ok(out)
    }

    pub fn decode<B: TermBackend + ?Sized>(
        data: &[u8],
        backend: &B,
        limits: &DecodeLimits,
    ) -> Result<Self, MessageError> {
        let rest = match data.split_first() {
            Some((&PASS_THROUGH, rest)) => rest,
            other => return Err(MessageError::MissingPassThrough(other.map(|(b, _)| *b))),
        };
        let (control, rest) = etf::decode_prefix_with(rest, backend, limits)?;
        let control = ControlMessage::parse(&control)?;

        let body = if rest.is_empty() {
            None
        } else {
            Some(etf::decode_with(rest, backend, limits)?)
        };
        if control.has_payload() && body.is_none() {
            return Err(MessageError::MissingPayload(control.name()));
        }
        Ok(DistMessage { control, body })
    }
}
