use thiserror::Error;

/// Largest payload a dictionary entry can carry, in bytes.
pub const MAX_ENTRY_SIZE: usize = 15;

/// Smallest CMP pair worth remembering; 1-byte comparisons are noise.
pub const MIN_CMP_ENTRY_SIZE: usize = 2;

/// Errors from dictionary text parsing.
#[derive(Error, Debug)]
pub enum DictionaryError {
    /// A line was not a comment, not blank, and not a well-formed quoted
    /// entry. The whole parse fails; a half-loaded dictionary would
    /// silently skew mutations.
    #[error("malformed dictionary line {line_number}: {text:?}")]
    MalformedLine { line_number: usize, text: String },
}

/// An inline byte string of up to [`MAX_ENTRY_SIZE`] bytes.
///
/// The content bytes come first and are zero-padded, so the derived
/// ordering is lexicographic by content, then by length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DictEntry {
    bytes: [u8; MAX_ENTRY_SIZE],
    size: u8,
}

impl DictEntry {
    /// # Panics
    /// Panics if `bytes` exceeds [`MAX_ENTRY_SIZE`]; callers filter first.
    pub fn new(bytes: &[u8]) -> Self {
        assert!(bytes.len() <= MAX_ENTRY_SIZE);
        let mut entry = Self {
            bytes: [0; MAX_ENTRY_SIZE],
            size: bytes.len() as u8,
        };
        entry.bytes[..bytes.len()].copy_from_slice(bytes);
        entry
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.size as usize]
    }

    pub fn len(&self) -> usize {
        self.size as usize
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

/// Parses AFL/libFuzzer dictionary text into raw entries.
///
/// Recognized lines: blank, `# comment`, and `[name]"value"` where the
/// value may use `\\`, `\"`, and `\xNN` escapes. Any other line fails the
/// whole parse. Entries longer than [`MAX_ENTRY_SIZE`] are returned
/// as-is; the mutator decides what it can use.
pub fn parse_afl_dictionary(text: &str) -> Result<Vec<Vec<u8>>, DictionaryError> {
    let mut entries = Vec::new();
    for (line_idx, raw_line) in text.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let malformed = || DictionaryError::MalformedLine {
            line_number: line_idx + 1,
            text: raw_line.to_string(),
        };
        let open = line.find('"').ok_or_else(malformed)?;
        if !line.ends_with('"') || line.len() == open + 1 {
            return Err(malformed());
        }
        let value = &line.as_bytes()[open + 1..line.len() - 1];
        entries.push(unescape_dictionary_value(value).ok_or_else(malformed)?);
    }
    Ok(entries)
}

fn unescape_dictionary_value(value: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(value.len());
    let mut pos = 0;
    while pos < value.len() {
        let byte = value[pos];
        if byte == b'"' {
            return None; // unescaped quote inside the value
        }
        if byte != b'\\' {
            out.push(byte);
            pos += 1;
            continue;
        }
        match value.get(pos + 1)? {
            b'\\' => {
                out.push(b'\\');
                pos += 2;
            }
            b'"' => {
                out.push(b'"');
                pos += 2;
            }
            b'x' => {
                let hi = char::from(*value.get(pos + 2)?).to_digit(16)?;
                let lo = char::from(*value.get(pos + 3)?).to_digit(16)?;
                out.push((hi * 16 + lo) as u8);
                pos += 4;
            }
            _ => return None,
        }
    }
    Some(out)
}

/// Dictionary of CMP instruction arguments.
///
/// Holds `(A, B)` pairs such that an instruction `A CMP B` was observed,
/// sorted by `A` so that prefix queries are a lower-bound plus a linear
/// scan.
#[derive(Debug, Clone, Default)]
pub struct CmpDictionary {
    dictionary: Vec<(DictEntry, DictEntry)>,
}

impl CmpDictionary {
    /// Replaces the dictionary from a raw stream of repeating
    /// `[size:u8][A:size][B:size]` records.
    ///
    /// Records with `size` below [`MIN_CMP_ENTRY_SIZE`] are skipped while
    /// the call still succeeds. A size above [`MAX_ENTRY_SIZE`] or a
    /// truncated record marks the whole stream malformed: the call
    /// returns false and the dictionary keeps its previous contents.
    pub fn set_from_cmp_data(&mut self, cmp_data: &[u8]) -> bool {
        let mut parsed = Vec::new();
        let mut pos = 0;
        while pos < cmp_data.len() {
            let size = cmp_data[pos] as usize;
            pos += 1;
            if size > MAX_ENTRY_SIZE || pos + 2 * size > cmp_data.len() {
                return false;
            }
            if size >= MIN_CMP_ENTRY_SIZE {
                parsed.push((
                    DictEntry::new(&cmp_data[pos..pos + size]),
                    DictEntry::new(&cmp_data[pos + size..pos + 2 * size]),
                ));
            }
            pos += 2 * size;
        }
        parsed.sort();
        self.dictionary = parsed;
        true
    }

    /// Number of stored pairs.
    pub fn size(&self) -> usize {
        self.dictionary.len()
    }

    /// Clears `suggestions`, then pushes `B` for every pair whose `A` is a
    /// prefix of `bytes`, in sorted-by-`A` order, up to `capacity`.
    pub fn suggest_replacement<'a>(
        &'a self,
        bytes: &[u8],
        capacity: usize,
        suggestions: &mut Vec<&'a [u8]>,
    ) {
        suggestions.clear();
        if capacity == 0 {
            return;
        }
        // Lower bound: first pair whose A is not below the equal-length
        // prefix of the query.
        let start = self.dictionary.partition_point(|(a, _)| {
            let a = a.as_bytes();
            a < &bytes[..bytes.len().min(a.len())]
        });
        for (a, b) in &self.dictionary[start..] {
            if suggestions.len() == capacity {
                break;
            }
            let a = a.as_bytes();
            if bytes.len() < a.len() || &bytes[..a.len()] != a {
                break;
            }
            suggestions.push(b.as_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmp_record(a: &[u8], b: &[u8]) -> Vec<u8> {
        assert_eq!(a.len(), b.len());
        let mut rec = vec![a.len() as u8];
        rec.extend_from_slice(a);
        rec.extend_from_slice(b);
        rec
    }

    #[test]
    fn dict_entry_orders_by_content_then_length() {
        let ab = DictEntry::new(b"AB");
        let abc = DictEntry::new(b"ABC");
        let b = DictEntry::new(b"B");
        assert!(ab < abc);
        assert!(abc < b);
        assert!(DictEntry::new(b"") < ab);
        assert_eq!(ab.as_bytes(), b"AB");
        assert_eq!(abc.len(), 3);
    }

    #[test]
    fn parse_afl_dictionary_basic() {
        let text = r#"
# header comment
kw1="foo"
kw2="bar\"baz"
kw3="\x41\x00B"
"bare"
"#;
        let entries = parse_afl_dictionary(text).unwrap();
        assert_eq!(
            entries,
            vec![
                b"foo".to_vec(),
                b"bar\"baz".to_vec(),
                vec![0x41, 0x00, b'B'],
                b"bare".to_vec(),
            ]
        );
    }

    #[test]
    fn parse_afl_dictionary_escaped_backslash() {
        let entries = parse_afl_dictionary(r#"k="a\\b""#).unwrap();
        assert_eq!(entries, vec![b"a\\b".to_vec()]);
    }

    #[test]
    fn parse_afl_dictionary_rejects_malformed_lines() {
        for bad in [
            "no quotes here",
            "k=\"unterminated",
            "k=\"bad escape \\q\"",
            "k=\"bad hex \\xZZ\"",
            "\"",
        ] {
            let err = parse_afl_dictionary(bad).unwrap_err();
            let DictionaryError::MalformedLine { line_number, .. } = err;
            assert_eq!(line_number, 1, "input: {bad}");
        }
    }

    #[test]
    fn cmp_dictionary_suggests_in_sorted_order() {
        let mut data = Vec::new();
        data.extend(cmp_record(b"ABCD", b"WXYZ"));
        data.extend(cmp_record(b"AB", b"99"));
        let mut dict = CmpDictionary::default();
        assert!(dict.set_from_cmp_data(&data));
        assert_eq!(dict.size(), 2);

        let mut suggestions = Vec::new();
        dict.suggest_replacement(b"ABCDEF", 8, &mut suggestions);
        assert_eq!(suggestions, vec![&b"99"[..], &b"WXYZ"[..]]);
    }

    #[test]
    fn cmp_dictionary_respects_capacity_and_clears_output() {
        let mut data = Vec::new();
        data.extend(cmp_record(b"AB", b"11"));
        data.extend(cmp_record(b"ABC", b"222"));
        data.extend(cmp_record(b"ABCD", b"3333"));
        let mut dict = CmpDictionary::default();
        assert!(dict.set_from_cmp_data(&data));

        let mut suggestions = vec![&b"stale"[..]];
        dict.suggest_replacement(b"ABCDE", 2, &mut suggestions);
        assert_eq!(suggestions, vec![&b"11"[..], &b"222"[..]]);

        dict.suggest_replacement(b"zzz", 2, &mut suggestions);
        assert!(suggestions.is_empty());
    }

    #[test]
    fn cmp_dictionary_skips_tiny_records_but_succeeds() {
        let mut data = Vec::new();
        data.extend(cmp_record(b"Q", b"R")); // size 1: skipped
        data.extend(cmp_record(b"AB", b"CD"));
        let mut dict = CmpDictionary::default();
        assert!(dict.set_from_cmp_data(&data));
        assert_eq!(dict.size(), 1);
    }

    #[test]
    fn cmp_dictionary_rejects_oversize_and_truncated_records() {
        let mut dict = CmpDictionary::default();
        assert!(dict.set_from_cmp_data(&cmp_record(b"AB", b"CD")));

        let oversize = vec![16u8; 40];
        assert!(!dict.set_from_cmp_data(&oversize));
        // Rejection leaves prior contents in place.
        assert_eq!(dict.size(), 1);

        let truncated = vec![4u8, b'A', b'B'];
        assert!(!dict.set_from_cmp_data(&truncated));
        assert_eq!(dict.size(), 1);
    }

    #[test]
    fn cmp_dictionary_empty_stream_is_valid() {
        let mut dict = CmpDictionary::default();
        assert!(dict.set_from_cmp_data(&[]));
        assert_eq!(dict.size(), 0);
    }
}
