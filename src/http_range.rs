/// Inclusive byte range within an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeSpec {
    pub start: u64,
    pub end: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeError {
    /// Not a byte-range header we understand.
    Invalid,
    /// Well-formed, but no byte of the object falls inside it.
    Unsatisfiable,
    /// More than one range was asked for.
    Multiple,
}

pub fn parse_range(header: &str, size: u64) -> Result<RangeSpec, RangeError> {
    let header = header.trim();
    let Some(range) = header.strip_prefix("bytes=") else {
        return Err(RangeError::Invalid);
    };
    if range.contains(',') {
        return Err(RangeError::Multiple);
    }
    let Some((start_str, end_str)) = range.split_once('-') else {
        return Err(RangeError::Invalid);
    };
    let start_str = start_str.trim();
    let end_str = end_str.trim();

    if start_str.is_empty() {
        // suffix range: bytes=-N
        let suffix = parse_offset(end_str)?;
        if suffix == 0 || size == 0 {
            return Err(RangeError::Unsatisfiable);
        }
        return Ok(RangeSpec {
            start: size.saturating_sub(suffix),
            end: size - 1,
        });
    }

    let start = parse_offset(start_str)?;
    let end = if end_str.is_empty() {
        None
    } else {
        Some(parse_offset(end_str)?)
    };
    if let Some(end) = end {
        if end < start {
            return Err(RangeError::Invalid);
        }
    }
    if start >= size {
        return Err(RangeError::Unsatisfiable);
    }

    let last = size - 1;
    Ok(RangeSpec {
        start,
        end: end.map_or(last, |end| end.min(last)),
    })
}

fn parse_offset(raw: &str) -> Result<u64, RangeError> {
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(RangeError::Invalid);
    }
    raw.parse().map_err(|_| RangeError::Invalid)
}

pub fn build_content_range(start: u64, end: u64, size: u64) -> String {
    format!("bytes {}-{}/{}", start, end, size)
}

pub fn build_unsatisfied_range(size: u64) -> String {
    format!("bytes */{}", size)
}
