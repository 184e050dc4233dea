//! Git pkt-line framing: 4 hex digits of length (including the header
//! itself) followed by the payload; `0000` is the flush packet.

/// Band selectors for side-band-64k multiplexing.
pub const BAND_PACK: u8 = 1;
pub const BAND_PROGRESS: u8 = 2;
pub const BAND_ERROR: u8 = 3;

/// Largest payload carried in one side-band pkt-line, leaving room for
/// the band byte and length header under the 65520-byte frame cap.
pub const MAX_SIDE_BAND_CHUNK: usize = 65500;

/// Encode one pkt-line; `None` encodes the flush packet.
pub fn pkt_line(data: Option<&[u8]>) -> Vec<u8> {
    match data {
        None => b"0000".to_vec(),
        Some(data) => {
            let mut out = format!("{:04x}", data.len() + 4).into_bytes();
            out.extend_from_slice(data);
            out
        }
    }
}

/// Concatenate a sequence of pkt-lines (with `None` flush markers).
pub fn pkt_line_stream(lines: &[Option<&[u8]>]) -> Vec<u8> {
    let mut out = Vec::new();
    for line in lines {
        out.extend_from_slice(&pkt_line(*line));
    }
    out
}

/// Wrap `data` into side-band frames on the given band.
pub fn side_band_chunks(band: u8, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    for chunk in data.chunks(MAX_SIDE_BAND_CHUNK) {
        let mut framed = Vec::with_capacity(chunk.len() + 1);
        framed.push(band);
        framed.extend_from_slice(chunk);
        out.extend_from_slice(&pkt_line(Some(&framed)));
    }
    out
}

/// Parse one pkt-line. Returns `(payload, rest)`; `payload` is `None`
/// for a flush packet (or undecodable input, which consumes 4 bytes).
pub fn parse_pkt_line(data: &[u8]) -> (Option<&[u8]>, &[u8]) {
    if data.len() < 4 {
        return (None, &data[data.len()..]);
    }

    let Some(length) = std::str::from_utf8(&data[..4])
        .ok()
        .and_then(|s| usize::from_str_radix(s, 16).ok())
    else {
        return (None, &data[4..]);
    };

    if length < 4 {
        // 0000 flush (0001-0003 are malformed; skip the header).
        return (None, &data[4..]);
    }

    let end = length.min(data.len());
    (Some(&data[4..end]), &data[end..])
}

/// Parse all pkt-lines in a buffer; flush packets appear as `None`.
pub fn parse_pkt_lines(data: &[u8]) -> Vec<Option<&[u8]>> {
    let mut lines = Vec::new();
    let mut rest = data;
    while !rest.is_empty() {
        let (line, remaining) = parse_pkt_line(rest);
        lines.push(line);
        rest = remaining;
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_length_prefix() {
        // "# service=git-upload-pack\n" is 26 bytes; 26 + 4 = 0x1e.
        let line = pkt_line(Some(b"# service=git-upload-pack\n"));
        assert!(line.starts_with(b"001e"));
        assert!(line.ends_with(b"\n"));
    }

    #[test]
    fn flush_is_0000() {
        assert_eq!(pkt_line(None), b"0000");
    }

    #[test]
    fn round_trips() {
        let encoded = pkt_line_stream(&[Some(b"want abc\n"), None, Some(b"done\n")]);
        let lines = parse_pkt_lines(&encoded);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], Some(b"want abc\n".as_slice()));
        assert_eq!(lines[1], None);
        assert_eq!(lines[2], Some(b"done\n".as_slice()));
    }

    #[test]
    fn parse_handles_truncated_input() {
        let (line, rest) = parse_pkt_line(b"00");
        assert_eq!(line, None);
        assert!(rest.is_empty());
    }

    #[test]
    fn parse_skips_invalid_length() {
        let (line, rest) = parse_pkt_line(b"zzzzrest");
        assert_eq!(line, None);
        assert_eq!(rest, b"rest");
    }

    #[test]
    fn side_band_prefixes_band_byte() {
        let framed = side_band_chunks(BAND_PACK, b"PACKDATA");
        let lines = parse_pkt_lines(&framed);
        assert_eq!(lines.len(), 1);
        let payload = lines[0].unwrap();
        assert_eq!(payload[0], BAND_PACK);
        assert_eq!(&payload[1..], b"PACKDATA");
    }

    #[test]
    fn side_band_chunks_large_payload() {
        let data = vec![0u8; MAX_SIDE_BAND_CHUNK + 10];
        let framed = side_band_chunks(BAND_PACK, &data);
        let lines = parse_pkt_lines(&framed);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].unwrap().len(), MAX_SIDE_BAND_CHUNK + 1);
        assert_eq!(lines[1].unwrap().len(), 11);
    }
}
