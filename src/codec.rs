//! Guacamole wire framing and the `guacg` control sublanguage carried on
//! top of it.
//!
//! The wire grammar is `<len>.<opcode>(,<len>.<arg>)*;`, where every
//! length is a count of Unicode scalar values (not bytes) in the element
//! that follows. Native Guacamole opcodes (`mouse`, `key`, `sync`, ...)
//! are only parsed far enough to find instruction boundaries; this
//! broker never inspects their argument semantics.

use bytes::BytesMut;
use serde_json::Value;

use crate::error::CodecError;

/// Opcode of the outer frame that carries this broker's own control
/// sublanguage.
pub const GUACG_OPCODE: &str = "guacg";

/// Outer opcode that introduces a reserved (currently unimplemented) API
/// call, per the `guacg` grammar's `api` escape hatch.
const GUACG_API_OPCODE: &str = "api";

/// One fully-parsed Guacamole instruction: an opcode plus its positional
/// arguments, with framing already stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuacamoleInstruction {
    pub opcode: String,
    pub args: Vec<String>,
}

impl GuacamoleInstruction {
    pub fn new(opcode: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            opcode: opcode.into(),
            args,
        }
    }

    /// Is this the `guacg` outer frame?
    #[must_use]
    pub fn is_guacg(&self) -> bool {
        self.opcode == GUACG_OPCODE
    }

    /// Encode back to the wire grammar, including the terminating `;`.
    #[must_use]
    pub fn encode(&self) -> String {
        encode(&self.opcode, &self.args.iter().map(String::as_str).collect::<Vec<_>>())
    }
}

/// Encode a single length-prefixed element (`<char-count>.<value>`).
fn encode_element(value: &str) -> String {
    format!("{}.{}", value.chars().count(), value)
}

/// Encode a full instruction from its opcode and argument strings.
#[must_use]
pub fn encode(opcode: &str, args: &[&str]) -> String {
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(encode_element(opcode));
    parts.extend(args.iter().map(|a| encode_element(a)));
    format!("{};", parts.join(","))
}

/// Try to parse exactly one complete instruction out of the front of
/// `buf`. Returns `Ok(None)` if `buf` does not yet contain a complete
/// instruction (the caller should read more bytes and retry); the
/// consumed bytes are drained from `buf` only on a successful parse.
///
/// # Errors
///
/// Returns [`CodecError::MalformedFraming`] if the bytes already present
/// cannot possibly form a valid instruction (bad length digits, a
/// separator that is neither `,` nor `;`).
pub fn parse_one(
    buf: &mut BytesMut,
) -> Result<Option<GuacamoleInstruction>, CodecError> {
    let text = match std::str::from_utf8(&buf[..]) {
        Ok(s) => s,
        Err(e) => {
            // A multi-byte character may simply be split across the
            // buffer's current end; only the valid prefix is usable yet.
            let valid_up_to = e.valid_up_to();
            if valid_up_to == 0 && buf.len() > 4 {
                return Err(CodecError::MalformedFraming(
                    "invalid UTF-8 in instruction stream".into(),
                ));
            }
            std::str::from_utf8(&buf[..valid_up_to]).unwrap()
        }
    };

    match parse_elements(text)? {
        None => Ok(None),
        Some((mut elements, consumed_bytes)) => {
            let opcode = elements.remove(0);
            let instruction = GuacamoleInstruction::new(opcode, elements);
            let _ = buf.split_to(consumed_bytes);
            Ok(Some(instruction))
        }
    }
}

/// Parse every length-prefixed element of one instruction out of `s`,
/// returning the elements (opcode first) and the number of *bytes* of
/// `s` consumed through the terminating `;`.
fn parse_elements(
    s: &str,
) -> Result<Option<(Vec<String>, usize)>, CodecError> {
    let mut chars = s.char_indices().peekable();
    let mut elements = Vec::new();

    loop {
        let mut len_digits = String::new();
        loop {
            match chars.peek().copied() {
                Some((_, c)) if c.is_ascii_digit() => {
                    len_digits.push(c);
                    chars.next();
                }
                Some((_, '.')) => {
                    chars.next();
                    break;
                }
                Some((_, other)) => {
                    return Err(CodecError::MalformedFraming(format!(
                        "expected digit or '.', found '{}'",
                        other
                    )));
                }
                None => return Ok(None),
            }
        }
        if len_digits.is_empty() {
            return Err(CodecError::MalformedFraming(
                "missing length prefix".into(),
            ));
        }
        let len: usize = len_digits.parse().map_err(|_| {
            CodecError::MalformedFraming(format!(
                "invalid length prefix: {}",
                len_digits
            ))
        })?;

        let mut content = String::with_capacity(len);
        for _ in 0..len {
            match chars.next() {
                Some((_, c)) => content.push(c),
                None => return Ok(None),
            }
        }
        elements.push(content);

        match chars.next() {
            Some((byte_pos, ',')) => {
                let _ = byte_pos;
                continue;
            }
            Some((byte_pos, ';')) => {
                return Ok(Some((elements, byte_pos + 1)));
            }
            Some((_, other)) => {
                return Err(CodecError::MalformedFraming(format!(
                    "expected ',' or ';' after argument, found '{}'",
                    other
                )));
            }
            None => return Ok(None),
        }
    }
}

/// A parsed `guacg` instruction: the broker's own control sublanguage,
/// carried inline as a `guacg`-opcoded Guacamole instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct GuacgInstruction {
    /// The *real* opcode (`connect`, `pause`, `control`, ...), i.e. the
    /// outer instruction's first argument.
    pub opcode: String,

    /// Remaining positional arguments after the opcode.
    pub args: Vec<String>,

    /// Parsed JSON payload (the args' JSON-encoded element).
    pub json_args: Value,

    /// API name, only set when `opcode == "api"`.
    pub api: Option<String>,
}

impl GuacgInstruction {
    /// Build a `guacg` instruction carrying a JSON payload.
    #[must_use]
    pub fn new(opcode: impl Into<String>, json_args: Value) -> Self {
        Self {
            opcode: opcode.into(),
            args: Vec::new(),
            json_args,
            api: None,
        }
    }

    /// Decode a parsed [`GuacamoleInstruction`] whose opcode is `guacg`
    /// into its inner real opcode and JSON payload.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::NotGuacg`] if `instruction.opcode != "guacg"`,
    /// [`CodecError::MalformedFraming`] if the outer instruction carries
    /// no real opcode at all, and [`CodecError::InvalidJson`] if the
    /// payload argument isn't valid JSON.
    pub fn from_instruction(
        instruction: &GuacamoleInstruction,
    ) -> Result<Self, CodecError> {
        if !instruction.is_guacg() {
            return Err(CodecError::NotGuacg);
        }
        let mut rest = instruction.args.clone();
        if rest.is_empty() {
            return Err(CodecError::MalformedFraming(
                "guacg instruction missing real opcode".into(),
            ));
        }
        let opcode = rest.remove(0);

        let (api, json_arg) = if opcode == GUACG_API_OPCODE {
            if rest.is_empty() {
                return Err(CodecError::MalformedFraming(
                    "guacg api instruction missing api name".into(),
                ));
            }
            let api_name = rest.remove(0);
            (Some(api_name), rest.first().cloned())
        } else {
            (None, rest.first().cloned())
        };

        let json_args = match json_arg {
            Some(raw) if !raw.is_empty() => serde_json::from_str(&raw)?,
            _ => Value::Object(serde_json::Map::new()),
        };

        Ok(Self {
            opcode,
            args: rest,
            json_args,
            api,
        })
    }

    /// Encode to the outer `guacg`-opcoded [`GuacamoleInstruction`], then
    /// to the wire.
    #[must_use]
    pub fn encode(&self) -> String {
        let json_str = self.json_args.to_string();
        let mut outer_args = vec![self.opcode.clone()];
        if let Some(api) = &self.api {
            outer_args.push(api.clone());
        }
        outer_args.push(json_str);

        let args_refs: Vec<&str> =
            outer_args.iter().map(String::as_str).collect();
        encode(GUACG_OPCODE, &args_refs)
    }
}
