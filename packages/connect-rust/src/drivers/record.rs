//! On-disk value framing for embedded drivers.
//!
//! Each stored value is prefixed with an 8-byte big-endian expiry timestamp in
//! millis since epoch. Zero means the value never expires, so an expiry that
//! lands on zero is stored as 1.

const HEADER_LEN: usize = 8;

/// A decoded stored value borrowing from the raw bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Framed<'a> {
    pub expires_at: Option<u64>,
    pub value: &'a [u8],
}

impl Framed<'_> {
    pub fn is_live(&self, now: u64) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

pub(crate) fn encode(value: &[u8], expires_at: Option<u64>) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + value.len());
    let header = expires_at.map_or(0, |at| at.max(1));
    out.extend_from_slice(&header.to_be_bytes());
    out.extend_from_slice(value);
    out
}

pub(crate) fn decode(raw: &[u8]) -> anyhow::Result<Framed<'_>> {
    if raw.len() < HEADER_LEN {
        anyhow::bail!(
            "stored value is {} bytes, shorter than the {HEADER_LEN}-byte header",
            raw.len()
        );
    }
    let (header, value) = raw.split_at(HEADER_LEN);
    let mut buf = [0u8; HEADER_LEN];
    buf.copy_from_slice(header);
    let at = u64::from_be_bytes(buf);
    Ok(Framed {
        expires_at: (at != 0).then_some(at),
        value,
    })
}

/// The value if it is present and unexpired at `now`.
pub(crate) fn live_value(raw: &[u8], now: u64) -> anyhow::Result<Option<&[u8]>> {
    let framed = decode(raw)?;
    Ok(framed.is_live(now).then_some(framed.value))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn no_expiry_is_encoded_as_zero() {
        let raw = encode(b"abc", None);
        assert_eq!(&raw[..8], &[0u8; 8]);
        assert_eq!(decode(&raw).unwrap().expires_at, None);
    }

    #[test]
    fn expiry_boundary_is_exclusive() {
        let raw = encode(b"v", Some(100));
        assert_eq!(live_value(&raw, 99).unwrap(), Some(&b"v"[..]));
        assert_eq!(live_value(&raw, 100).unwrap(), None);
    }

    #[test]
    fn expiry_at_zero_is_not_permanent() {
        let raw = encode(b"v", Some(0));
        assert_eq!(decode(&raw).unwrap().expires_at, Some(1));
        assert_eq!(live_value(&raw, 10_000).unwrap(), None);
    }

    #[test]
    fn truncated_header_is_rejected() {
        assert!(decode(&[1, 2, 3]).is_err());
    }

    proptest! {
        #[test]
        fn value_bytes_survive_framing(value in proptest::collection::vec(any::<u8>(), 0..64), at in 1u64..) {
            let raw = encode(&value, Some(at));
            let framed = decode(&raw).unwrap();
            prop_assert_eq!(framed.value, &value[..]);
            prop_assert_eq!(framed.expires_at, Some(at));
        }
    }
}
