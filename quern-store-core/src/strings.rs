//! Length-prefixed packed string lists.
//!
//! The substitute registry stores structured records inside single database
//! values; each element is encoded as `<decimal byte length>:<bytes>` and the
//! elements are simply concatenated.  Packing nests: a packed list is itself
//! a string that can appear as an element of an outer list.

/// Pack a list of strings into one string.
pub fn pack_strings<I, S>(strings: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = String::new();
    for s in strings {
        let s = s.as_ref();
        out.push_str(&s.len().to_string());
        out.push(':');
        out.push_str(s);
    }
    out
}

/// Unpack a string produced by [`pack_strings`].  Returns `None` on any
/// malformed input (truncated element, missing separator, non-digit length,
/// length splitting a UTF-8 sequence).
pub fn unpack_strings(packed: &str) -> Option<Vec<String>> {
    let mut out = Vec::new();
    let mut rest = packed;
    while !rest.is_empty() {
        let colon = rest.find(':')?;
        let len: usize = rest[..colon].parse().ok()?;
        let body = rest.get(colon + 1..colon + 1 + len)?;
        out.push(body.to_owned());
        rest = &rest[colon + 1 + len..];
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_empty() {
        assert_eq!(pack_strings(Vec::<String>::new()), "");
        assert_eq!(unpack_strings("").unwrap(), Vec::<String>::new());
    }

    #[test]
    fn test_separator_in_element() {
        let packed = pack_strings(["a:b", "", "10:20"]);
        assert_eq!(unpack_strings(&packed).unwrap(), vec!["a:b", "", "10:20"]);
    }

    #[test]
    fn test_nested() {
        let inner = pack_strings(["--quiet", "fetch"]);
        let outer = pack_strings(["2", "/d", "/p", &inner]);
        let fields = unpack_strings(&outer).unwrap();
        assert_eq!(fields.len(), 4);
        assert_eq!(
            unpack_strings(&fields[3]).unwrap(),
            vec!["--quiet", "fetch"]
        );
    }

    #[test]
    fn test_malformed() {
        assert!(unpack_strings("5:ab").is_none());
        assert!(unpack_strings("x:ab").is_none());
        assert!(unpack_strings("3ab").is_none());
    }

    proptest! {
        #[test]
        fn prop_roundtrip(strings in proptest::collection::vec(".*", 0..8)) {
            let packed = pack_strings(&strings);
            prop_assert_eq!(unpack_strings(&packed), Some(strings));
        }
    }
}
