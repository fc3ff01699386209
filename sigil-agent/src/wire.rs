//! SSH agent wire codec.
//!
//! Pure functions over byte slices: framing, length-prefixed strings, `mpint`
//! integers, and builders for every reply the agent sends.  Nothing here
//! allocates state or returns errors; malformed or truncated input yields
//! `None` so that the dispatcher can feed bytes straight from the socket.
//!
//! ```text
//! frame   := uint32be length | uint8 type | payload[length - 1]
//! string  := uint32be length | bytes[length]
//! ```

/// Largest frame the agent accepts (OpenSSH `AGENT_MAX_LEN`).
pub const MAX_FRAME_LEN: usize = 256 * 1024;

// Message numbers from draft-miller-ssh-agent.
pub const SSH_AGENT_FAILURE: u8 = 5;
pub const SSH_AGENT_SUCCESS: u8 = 6;
pub const SSH_AGENTC_REQUEST_IDENTITIES: u8 = 11;
pub const SSH_AGENT_IDENTITIES_ANSWER: u8 = 12;
pub const SSH_AGENTC_SIGN_REQUEST: u8 = 13;
pub const SSH_AGENT_SIGN_RESPONSE: u8 = 14;
pub const SSH_AGENTC_ADD_IDENTITY: u8 = 17;
pub const SSH_AGENTC_REMOVE_IDENTITY: u8 = 18;
pub const SSH_AGENTC_REMOVE_ALL_IDENTITIES: u8 = 19;
pub const SSH_AGENTC_ADD_ID_CONSTRAINED: u8 = 25;

// Constraint tags carried by SSH_AGENTC_ADD_ID_CONSTRAINED.
pub const SSH_AGENT_CONSTRAIN_LIFETIME: u8 = 1;
pub const SSH_AGENT_CONSTRAIN_CONFIRM: u8 = 2;

// Sign request flags.
pub const SSH_AGENT_RSA_SHA2_256: u32 = 0x02;
pub const SSH_AGENT_RSA_SHA2_512: u32 = 0x04;

/// One complete frame borrowed from the connection buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    pub msg_type: u8,
    pub payload: &'a [u8],
    /// Bytes of the buffer this frame occupies, length prefix included.
    pub consumed: usize,
}

/// Wrap `payload` in a frame of type `msg_type`.
pub fn frame(msg_type: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + payload.len());
    put_u32(&mut out, (payload.len() + 1) as u32);
    out.push(msg_type);
    out.extend_from_slice(payload);
    out
}

/// Declared body length of the frame at the start of `buf`, if the 4-byte
/// prefix is present.
pub fn frame_len(buf: &[u8]) -> Option<usize> {
    read_u32(buf, 0).map(|(len, _)| len as usize)
}

/// Extract the first complete frame from `buf`.
///
/// Returns `None` while the frame is still incomplete.  A zero declared length
/// carries no type byte; it is reported as message type `0` with an empty
/// payload, which the dispatcher answers like any unknown message.
pub fn parse_frame(buf: &[u8]) -> Option<Frame<'_>> {
    let len = frame_len(buf)?;
    let end = 4usize.checked_add(len)?;
    if buf.len() < end {
        return None;
    }
    if len == 0 {
        return Some(Frame {
            msg_type: 0,
            payload: &[],
            consumed: 4,
        });
    }
    Some(Frame {
        msg_type: buf[4],
        payload: &buf[5..end],
        consumed: end,
    })
}

/// Read a big-endian `u32` at `offset`, returning it with the bytes consumed.
pub fn read_u32(buf: &[u8], offset: usize) -> Option<(u32, usize)> {
    let bytes = buf.get(offset..offset.checked_add(4)?)?;
    let value = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    Some((value, 4))
}

/// Read a length-prefixed field at `offset`.
///
/// Returns the field contents and the total bytes consumed (prefix included).
pub fn read_string(buf: &[u8], offset: usize) -> Option<(&[u8], usize)> {
    let (len, _) = read_u32(buf, offset)?;
    let start = offset.checked_add(4)?;
    let end = start.checked_add(len as usize)?;
    let value = buf.get(start..end)?;
    Some((value, 4 + value.len()))
}

/// Read an `mpint` at `offset`, returning its unsigned magnitude and the
/// bytes consumed.
pub fn read_mpint(buf: &[u8], offset: usize) -> Option<(&[u8], usize)> {
    let (body, used) = read_string(buf, offset)?;
    Some((mpint_magnitude(body)?, used))
}

/// Encode `bytes` as a length-prefixed field.
pub fn write_string(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + bytes.len());
    put_string(&mut out, bytes);
    out
}

pub fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes());
}

pub fn put_string(out: &mut Vec<u8>, bytes: &[u8]) {
    put_u32(out, bytes.len() as u32);
    out.extend_from_slice(bytes);
}

/// Append `magnitude` (unsigned, big-endian) as an SSH `mpint`.
///
/// Leading zero bytes are dropped, and a single zero byte is re-inserted when
/// the high bit of the first remaining byte is set so the value stays
/// positive under the protocol's two's-complement reading.
pub fn put_mpint(out: &mut Vec<u8>, magnitude: &[u8]) {
    let trimmed = strip_leading_zeros(magnitude);
    let pad = trimmed.first().is_some_and(|b| b & 0x80 != 0);
    put_u32(out, (trimmed.len() + usize::from(pad)) as u32);
    if pad {
        out.push(0);
    }
    out.extend_from_slice(trimmed);
}

/// Strip the sign-padding from an `mpint` body, yielding the unsigned magnitude.
///
/// Negative values are never valid key or signature components, so a body
/// with the high bit set on its first byte is rejected.
pub fn mpint_magnitude(body: &[u8]) -> Option<&[u8]> {
    if body.first().is_some_and(|b| b & 0x80 != 0) {
        return None;
    }
    Some(strip_leading_zeros(body))
}

fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let first = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
    &bytes[first..]
}

/// Sequential reader over a message payload.
///
/// Every accessor returns `None` once the payload is exhausted or a length
/// prefix points past the end; the cursor does not advance on failure.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn u8(&mut self) -> Option<u8> {
        let b = *self.buf.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    pub fn u32(&mut self) -> Option<u32> {
        let (value, used) = read_u32(self.buf, self.pos)?;
        self.pos += used;
        Some(value)
    }

    pub fn string(&mut self) -> Option<&'a [u8]> {
        let (value, used) = read_string(self.buf, self.pos)?;
        self.pos += used;
        Some(value)
    }

    pub fn utf8(&mut self) -> Option<&'a str> {
        std::str::from_utf8(self.string()?).ok()
    }

    /// Read an `mpint` and return its unsigned magnitude.
    pub fn mpint(&mut self) -> Option<&'a [u8]> {
        let (value, used) = read_mpint(self.buf, self.pos)?;
        self.pos += used;
        Some(value)
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }
}

// ---------------------------------------------------------------------------
// Reply builders
// ---------------------------------------------------------------------------

/// `SSH_AGENT_IDENTITIES_ANSWER`: count followed by `(blob, comment)` pairs.
pub fn identities_answer<'a, I>(identities: I) -> Vec<u8>
where
    I: IntoIterator<Item = (&'a [u8], &'a str)>,
{
    let mut entries = Vec::new();
    let mut count: u32 = 0;
    for (blob, comment) in identities {
        put_string(&mut entries, blob);
        put_string(&mut entries, comment.as_bytes());
        count += 1;
    }
    let mut payload = Vec::with_capacity(4 + entries.len());
    put_u32(&mut payload, count);
    payload.extend_from_slice(&entries);
    frame(SSH_AGENT_IDENTITIES_ANSWER, &payload)
}

/// `SSH_AGENT_SIGN_RESPONSE` carrying one signature blob.
pub fn sign_response(signature_blob: &[u8]) -> Vec<u8> {
    frame(SSH_AGENT_SIGN_RESPONSE, &write_string(signature_blob))
}

pub fn success() -> Vec<u8> {
    frame(SSH_AGENT_SUCCESS, &[])
}

pub fn failure() -> Vec<u8> {
    frame(SSH_AGENT_FAILURE, &[])
}
